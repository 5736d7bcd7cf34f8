use anyhow::{Context, Result};
use clap::Parser;

use std::fs;
use std::io::BufReader;
use std::path::PathBuf;

use dataflow::inst::Instruction;
use dataflow::vm::{peephole, VmExtractor, DEFAULT_WINDOW_LEN};
use trace::TraceReader;
use tracing_subscriber::filter::EnvFilter;

/// Locates VM context save/restore windows in a trace and writes each
/// matched window to its own file.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Input trace file.
    trace: PathBuf,

    /// Number of consecutive pushes/pops that form a context block.
    #[arg(short = 'k', long, default_value_t = DEFAULT_WINDOW_LEN)]
    length: usize,

    /// Directory receiving vm1.txt, vm2.txt, ...
    #[arg(short, long, default_value = ".")]
    outdir: PathBuf,

    /// Delete adjacent canceling pairs before scanning.
    #[arg(long)]
    peephole: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_env("SYMEX_LOG"))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let mut insts = load_trace(&args.trace)?;
    if args.peephole {
        let before = insts.len();
        insts = peephole(insts);
        eprintln!("peephole: {} -> {} instructions", before, insts.len());
    }

    let extractor = VmExtractor::new(args.length);
    let windows = extractor.extract(&insts);
    if windows.is_empty() {
        eprintln!("no vm windows found");
        return Ok(());
    }

    let paths = extractor
        .emit(&insts, &windows, &args.outdir)
        .with_context(|| format!("writing windows under {}", args.outdir.display()))?;
    for (path, window) in paths.iter().zip(&windows) {
        eprintln!(
            "{}: instructions {}..{} (rsp {:#x})",
            path.display(),
            insts[window.save.start].id,
            insts[window.restore.end - 1].id,
            window.stack_ptr
        );
    }

    Ok(())
}

fn load_trace(path: &std::path::Path) -> Result<Vec<Instruction>> {
    let file = fs::File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut records = Vec::new();
    for entry in TraceReader::new(BufReader::new(file)) {
        match entry.with_context(|| format!("reading {}", path.display()))? {
            Ok(record) => records.push(record),
            // Malformed lines are reported and skipped; the record ids
            // below still count only the lines that parsed.
            Err(err) => eprintln!("{err}"),
        }
    }
    Ok(Instruction::decode_all(records))
}
