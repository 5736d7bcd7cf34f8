use anyhow::{bail, Context, Result};
use clap::Parser;

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::PathBuf;

use dataflow::inst::Instruction;
use dataflow::parameter::build_parameters;
use dataflow::slicer::{backward_slice, write_human, write_llse};
use trace::TraceReader;
use tracing_subscriber::filter::EnvFilter;

/// Computes the backward data-dependency slice of a trace and writes
/// it out in human-readable and re-parseable forms.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Input trace file.
    trace: PathBuf,

    /// Trace id of the slicing target (defaults to the final
    /// instruction).
    #[arg(short, long)]
    target: Option<usize>,

    /// Path for the human-readable slice.
    #[arg(long, default_value = "slice.human.trace")]
    human: PathBuf,

    /// Path for the re-parseable slice.
    #[arg(long, default_value = "slice.llse.trace")]
    llse: PathBuf,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_env("SYMEX_LOG"))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let mut insts = load_trace(&args.trace)?;
    if insts.is_empty() {
        bail!("trace {} is empty", args.trace.display());
    }
    build_parameters(&mut insts)?;

    // Ids are 1-based trace positions.
    let target = match args.target {
        None => insts.len() - 1,
        Some(id) => match insts.iter().position(|inst| inst.id == id) {
            Some(index) => index,
            None => bail!("no instruction with id {id} in the trace"),
        },
    };

    let slice = backward_slice(&insts, target);
    eprintln!(
        "slice: {} of {} instructions, {} live input parameter(s)",
        slice.included.len(),
        insts.len(),
        slice.inputs.len()
    );

    let mut human = BufWriter::new(
        File::create(&args.human)
            .with_context(|| format!("creating {}", args.human.display()))?,
    );
    write_human(&insts, &slice, &mut human)?;
    human.flush()?;

    let mut llse = BufWriter::new(
        File::create(&args.llse).with_context(|| format!("creating {}", args.llse.display()))?,
    );
    write_llse(&insts, &slice, &mut llse)?;
    llse.flush()?;

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
