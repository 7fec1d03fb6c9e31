use std::{
    fs,
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
};

use anyhow::Context;
use retrace::{
    analyzer::{self, Truncated, RESET_VECTOR},
    callgraph::CallGraph,
    replay::repl::Debugger,
    syms::{parse_address, SymbolFile},
    tracer,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(argh::FromArgs)]
/// rebuild functions and call stacks from gameboy cpu traces
struct Arguments {
    #[argh(subcommand)]
    mode: Mode,
}

#[derive(argh::FromArgs)]
#[argh(subcommand)]
enum Mode {
    Reverse(ReverseArgs),
    Debug(DebugArgs),
    Callgraph(CallgraphArgs),
}

#[derive(argh::FromArgs)]
#[argh(subcommand, name = "reverse")]
/// print every function seen in the trace
struct ReverseArgs {
    #[argh(positional)]
    /// trace produced by the emulator
    trace: PathBuf,

    #[argh(option, short = 's')]
    /// symbol file
    syms: Option<PathBuf>,

    #[argh(option, default = "RESET_VECTOR", from_str_fn(hex_address))]
    /// where execution starts (bottom of the call stack)
    entry: u64,

    #[argh(switch)]
    /// output json instead of a listing
    json: bool,

    #[argh(switch)]
    /// on error, still print what was rebuilt so far
    partial: bool,
}

#[derive(argh::FromArgs)]
#[argh(subcommand, name = "debug")]
/// replay the trace interactively
struct DebugArgs {
    #[argh(positional)]
    /// trace produced by the emulator
    trace: PathBuf,

    #[argh(option, short = 's')]
    /// symbol file
    syms: Option<PathBuf>,

    #[argh(option, default = "RESET_VECTOR", from_str_fn(hex_address))]
    /// where execution starts (bottom of the call stack)
    entry: u64,
}

#[derive(argh::FromArgs)]
#[argh(subcommand, name = "callgraph")]
/// print who calls whom
struct CallgraphArgs {
    #[argh(positional)]
    /// trace produced by the emulator
    trace: PathBuf,

    #[argh(option, short = 's')]
    /// symbol file
    syms: Option<PathBuf>,

    #[argh(option, default = "RESET_VECTOR", from_str_fn(hex_address))]
    /// where execution starts (bottom of the call stack)
    entry: u64,
}

fn hex_address(value: &str) -> Result<u64, String> {
    parse_address(value).ok_or_else(|| format!("not a hex address: {}", value))
}

fn load_symbols(path: Option<&Path>) -> anyhow::Result<SymbolFile> {
    let path = match path {
        Some(path) => path,
        None => return Ok(SymbolFile::default()),
    };

    let text = fs::read_to_string(path)
        .with_context(|| format!("reading symbols from {}", path.display()))?;
    let file = text
        .parse()
        .with_context(|| format!("parsing symbols in {}", path.display()))?;
    Ok(file)
}

fn open_trace(path: &Path) -> anyhow::Result<tracer::TraceReader<io::BufReader<fs::File>>> {
    tracer::open(path).with_context(|| format!("opening trace {}", path.display()))
}

fn reverse(args: ReverseArgs) -> anyhow::Result<()> {
    let SymbolFile { table, overrides } = load_symbols(args.syms.as_deref())?;
    let records = open_trace(&args.trace)?;

    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());

    let (program, error) = match analyzer::reconstruct(records, &overrides, args.entry) {
        Ok(program) => (program, None),
        Err(truncated) => {
            let Truncated { program, error } = *truncated;
            if !args.partial {
                return Err(anyhow::Error::new(error).context("rebuilding functions"));
            }
            (program, Some(error))
        }
    };

    if args.json {
        serde_json::to_writer_pretty(&mut out, &program.to_json(&table))?;
        writeln!(out)?;
    } else {
        program.render(&table, &mut out)?;
    }

    match error {
        Some(error) => {
            writeln!(out, "TRUNCATED: {}", error)?;
            out.flush()?;
            Err(anyhow::Error::new(error).context("output is incomplete"))
        }
        None => Ok(out.flush()?),
    }
}

fn debug(args: DebugArgs) -> anyhow::Result<()> {
    let SymbolFile { table, overrides } = load_symbols(args.syms.as_deref())?;
    let records = open_trace(&args.trace)?;

    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut dbg = Debugger::new(
        stdin.lock(),
        stdout.lock(),
        &table,
        args.entry,
        overrides.force_ret,
    );
    dbg.run(records)?;

    info!("{} breakpoints set", dbg.replay().breakpoints().len());
    Ok(())
}

fn callgraph(args: CallgraphArgs) -> anyhow::Result<()> {
    let SymbolFile { table, overrides } = load_symbols(args.syms.as_deref())?;
    let records = open_trace(&args.trace)?;

    let program = analyzer::reconstruct(records, &overrides, args.entry)
        .map_err(|truncated| {
            let Truncated { error, .. } = *truncated;
            anyhow::Error::new(error).context("rebuilding functions")
        })?;

    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    CallGraph::from_program(&program).render(&table, &mut out)?;
    Ok(out.flush()?)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let Arguments { mode } = argh::from_env();

    match mode {
        Mode::Reverse(args) => reverse(args),
        Mode::Debug(args) => debug(args),
        Mode::Callgraph(args) => callgraph(args),
    }
}
