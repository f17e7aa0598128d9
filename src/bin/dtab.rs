//! dtab - inspect and convert tabular files.
//!
//! Subcommands:
//! - `dtab info <file>`: read a CSV or Jay file and print its shape, column
//!   types and a short preview
//! - `dtab convert <input> <output.jay>`: convert CSV (optionally
//!   zstd-compressed) or Jay input into a Jay file

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::EnvFilter;

use dtab::column::Value;
use dtab::parallel::progress;
use dtab::read::{MultiSourceStrategy, ReadOptions};
use dtab::util::sstring;
use dtab::{DtResult, Frame};

/// Inspect and convert tabular data files.
#[derive(Parser)]
#[command(name = "dtab", about = "Columnar data file tool", version)]
struct Args {
    /// Log verbosity (overridden by DTAB_LOG).
    #[arg(long, default_value = "warn")]
    log_level: String,

    /// Show a progress bar for long reads.
    #[arg(long)]
    progress: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print shape, types and a preview of a tabular file.
    Info {
        /// Input: CSV file, .zst-compressed CSV, Jay file, or glob.
        input: String,

        /// Field separator (auto-detected when absent).
        #[arg(long)]
        sep: Option<char>,

        /// Number of preview rows.
        #[arg(long, default_value = "10")]
        rows: usize,
    },

    /// Convert a tabular file into the Jay binary format.
    Convert {
        input: String,

        output: PathBuf,

        #[arg(long)]
        sep: Option<char>,

        /// Read at most this many rows.
        #[arg(long)]
        max_nrows: Option<usize>,
    },
}

fn main() {
    let args = Args::parse();
    let level: Level = args.log_level.parse().unwrap_or(Level::WARN);
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("DTAB_LOG")
                .unwrap_or_else(|_| EnvFilter::new(level.to_string())),
        )
        .with_writer(std::io::stderr)
        .init();
    progress::enable(args.progress);

    let result = match args.command {
        Command::Info { input, sep, rows } => cmd_info(&input, sep, rows),
        Command::Convert {
            input,
            output,
            sep,
            max_nrows,
        } => cmd_convert(&input, &output, sep, max_nrows),
    };
    if let Err(e) = result {
        eprintln!("dtab: {e}");
        std::process::exit(1);
    }
}

fn load(input: &str, sep: Option<char>, max_nrows: Option<usize>) -> DtResult<Frame> {
    if input.ends_with(".jay") {
        return Frame::open_jay(Path::new(input));
    }
    let opts = ReadOptions {
        sep,
        max_nrows,
        multi_source_strategy: MultiSourceStrategy::Warn,
        ..ReadOptions::default()
    };
    dtab::read(input, &opts)
}

fn cmd_info(input: &str, sep: Option<char>, rows: usize) -> DtResult<()> {
    let frame = load(input, sep, None)?;
    println!("{input}: {} rows x {} columns", frame.nrows(), frame.ncols());
    for (name, stype) in frame.names().iter().zip(frame.stypes()) {
        println!("  {name}: {stype}");
    }
    let preview = frame.head(rows);
    if preview.nrows() > 0 {
        println!();
        print_table(&preview);
        if frame.nrows() > preview.nrows() {
            println!("  ... ({} more rows)", frame.nrows() - preview.nrows());
        }
    }
    Ok(())
}

fn cmd_convert(
    input: &str,
    output: &Path,
    sep: Option<char>,
    max_nrows: Option<usize>,
) -> DtResult<()> {
    let frame = load(input, sep, max_nrows)?;
    frame.to_jay(output)?;
    println!(
        "wrote {} ({} rows x {} columns)",
        output.display(),
        frame.nrows(),
        frame.ncols()
    );
    Ok(())
}

const CELL_WIDTH: usize = 16;

fn print_table(frame: &Frame) {
    let header: Vec<String> = frame
        .names()
        .iter()
        .map(|n| sstring::fit_cell(n, CELL_WIDTH))
        .collect();
    println!("  {}", header.join("  "));
    for row in 0..frame.nrows() {
        let cells: Vec<String> = (0..frame.ncols())
            .map(|c| sstring::fit_cell(&format_value(frame.cell(row, c)), CELL_WIDTH))
            .collect();
        println!("  {}", cells.join("  "));
    }
}

fn format_value(v: Value) -> String {
    match v {
        Value::Na => "NA".to_string(),
        Value::Bool(b) => if b { "True" } else { "False" }.to_string(),
        Value::Int(i) => i.to_string(),
        Value::Float(f) => format!("{f}"),
        Value::Str(s) => s,
    }
}
