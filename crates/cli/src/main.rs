/// Inspection tool for finished History Tree files.
use anyhow::{bail, Context, Result};
use backend::{ExpectedProvider, HistoryTreeBackend};
use clap::Parser;
use std::io::{self, Write};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "htree-dump", about = "Print the structure of a History Tree file")]
struct Args {
    /// History file to open.
    path: PathBuf,

    /// Refuse files built by another state provider version.
    #[arg(long)]
    provider_version: Option<u32>,

    /// Also print the intervals held by every node.
    #[arg(long)]
    intervals: bool,

    /// Run the structural integrity check and fail on any violation.
    #[arg(long)]
    check: bool,

    /// Print the full state at this timestamp.
    #[arg(long)]
    at: Option<i64>,
}

fn main() -> Result<()> {
    {
        use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

        tracing_subscriber::registry()
            .with(EnvFilter::from_default_env())
            .with(fmt::layer().with_writer(io::stderr))
            .init();
    }

    let args = Args::parse();
    let expected = args
        .provider_version
        .map_or(ExpectedProvider::Ignore, ExpectedProvider::Exactly);
    let backend = HistoryTreeBackend::open_existing(&args.path, expected)
        .with_context(|| format!("failed to open {}", args.path.display()))?;
    let tree = backend.tree();

    let stdout = io::stdout();
    let mut out = stdout.lock();

    writeln!(out, "{tree}")?;
    writeln!(out, "Time range: [{}, {}]", backend.start_time(), backend.end_time())?;
    writeln!(out, "Average node usage: {:.1}%\n", backend.average_node_usage()?)?;
    tree.debug_print(&mut out, args.intervals)?;

    if let Some(t) = args.at {
        writeln!(out, "State at {t}:")?;
        for interval in backend.do_query(t)?.values() {
            writeln!(out, "  {interval}")?;
        }
    }

    if args.check {
        let violations = tree.check_integrity()?;
        for violation in &violations {
            writeln!(out, "integrity: {violation}")?;
        }
        if !violations.is_empty() {
            bail!("{} integrity violation(s) in {}", violations.len(), args.path.display());
        }
        writeln!(out, "Integrity check passed.")?;
    }

    backend.dispose()?;
    Ok(())
}
