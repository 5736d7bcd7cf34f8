use anyhow::{anyhow, Context, Result};
use clap::Parser;

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::PathBuf;

use dataflow::executor::SymExecutor;
use dataflow::inst::Instruction;
use dataflow::smt;
use trace::{Register, TraceReader};
use tracing_subscriber::filter::EnvFilter;

/// Runs the symbolic execution engine over a trace and prints the
/// final formula of a register.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Input trace file.
    trace: PathBuf,

    /// Register whose formula is printed.
    #[arg(short, long, default_value = "rax")]
    register: String,

    /// Print every register's formula instead of just one.
    #[arg(long)]
    all_regs: bool,

    /// Print the formula of every tracked memory range.
    #[arg(long)]
    memory: bool,

    /// Additionally write the selected formula as SMT-LIB2 to this
    /// path.
    #[arg(long)]
    smt: Option<PathBuf>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_env("SYMEX_LOG"))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let register: Register = args
        .register
        .parse()
        .map_err(|_| anyhow!("`{}` is not a tracked 64-bit register", args.register))?;

    let insts = load_trace(&args.trace)?;
    let mut engine = SymExecutor::new();
    engine.run(&insts)?;

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    if args.all_regs {
        for reg in Register::ALL {
            print_register(&mut out, &engine, reg)?;
        }
    } else {
        print_register(&mut out, &engine, register)?;
    }

    if args.memory {
        for (range, value) in engine.memory() {
            writeln!(out, "{range} = {}", engine.arena().display(value))?;
        }
    }

    if let Some(path) = &args.smt {
        let mut file = BufWriter::new(
            File::create(path).with_context(|| format!("creating {}", path.display()))?,
        );
        smt::write_smt2(engine.arena(), engine.register(register), &mut file)?;
        file.flush()?;
    }

    Ok(())
}

fn print_register(out: &mut dyn Write, engine: &SymExecutor, reg: Register) -> Result<()> {
    writeln!(out, "{reg} = {}", engine.formula(reg))?;

    let inputs = engine.arena().inputs(engine.register(reg));
    write!(out, "{} input symbol(s):", inputs.len())?;
    for input in inputs {
        match engine.input_origin(input) {
            Some(origin) => write!(out, " {input} ({origin})")?,
            None => write!(out, " {input}")?,
        }
    }
    writeln!(out, "\n")?;
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
