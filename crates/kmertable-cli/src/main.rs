use anyhow::Context;
use clap::{Parser, Subcommand};
use kmertable_lib::{
    Counter, DumpFormat, DumpMode, KmerIterator, KmerTable, ShardSet, TableConfig,
};
use parking_lot::Mutex;
use std::fs::File;
use std::io::{BufWriter, Write};
use tracing::{info, warn};

/// K-mers buffered before each parallel insertion pass
const BATCH_SIZE: usize = 1 << 20;

#[derive(Parser)]
#[command(name = "kmertable")]
#[command(version = "0.1.0")]
#[command(about = "Count k-mers in sharded concurrent hash tables", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Options shared by every command that loads a table
#[derive(clap::Args)]
struct LoadArgs {
    /// Input FASTA/FASTQ file (optionally compressed)
    #[arg(short, long)]
    input: String,

    /// K-mer length (1..=31)
    #[arg(short, long, default_value = "31")]
    k: usize,

    /// Count canonical k-mers (larger of k-mer and its reverse complement)
    #[arg(long, default_value = "false")]
    canonical: bool,

    /// Number of shards
    #[arg(short, long, default_value = "31")]
    ways: usize,

    /// Starting capacity of each shard
    #[arg(long, default_value = "242000")]
    initial_size: usize,

    /// Number of threads (0 = all available cores)
    #[arg(short = 't', long, default_value = "0")]
    threads: usize,
}

#[derive(Subcommand)]
enum Commands {
    /// Count k-mers and dump them
    Count {
        #[command(flatten)]
        load: LoadArgs,

        /// Drop k-mers seen this many times or fewer before dumping
        #[arg(long, default_value = "0")]
        min_depth: i32,

        /// Output file (stdout if omitted)
        #[arg(short, long)]
        output: Option<String>,

        /// Write FASTA records (`>count` then the k-mer)
        #[arg(long, default_value = "false")]
        fasta: bool,

        /// Print keys as hex instead of bases
        #[arg(long, default_value = "false")]
        numeric: bool,
    },

    /// Print the depth histogram with GC content per depth
    Histogram {
        #[command(flatten)]
        load: LoadArgs,

        /// Depths at or above this share the last bucket
        #[arg(long, default_value = "1000")]
        max: usize,

        /// Output file (stdout if omitted)
        #[arg(short, long)]
        output: Option<String>,
    },
}

fn main() -> anyhow::Result<()> {
    // Initialize tracing: use RUST_LOG if set, otherwise default to info
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Count { load, min_depth, output, fasta, numeric } => {
            count_command(load, min_depth, output, fasta, numeric)?;
        }
        Commands::Histogram { load, max, output } => {
            histogram_command(load, max, output)?;
        }
    }

    Ok(())
}

/// Count k-mers from FASTA/FASTQ input and dump the table
fn count_command(
    load: LoadArgs,
    min_depth: i32,
    output: Option<String>,
    fasta: bool,
    numeric: bool,
) -> anyhow::Result<()> {
    let k = load.k;
    let table = load_table(&load)?;

    if min_depth > 0 {
        let removed = table
            .regenerate(min_depth)
            .context("failed to rebuild tables after depth filtering")?;
        info!("Removed {} k-mers with depth <= {}", removed, min_depth);
    }

    let format = DumpFormat {
        k,
        mode: if fasta { DumpMode::Fasta } else { DumpMode::Text },
        numeric,
        ..DumpFormat::default()
    };

    let sink = Mutex::new(open_output(output.as_deref())?);
    let report = table.dump(&sink, &format);
    sink.into_inner().flush().context("failed to flush output")?;
    if !report.success {
        anyhow::bail!("dump failed after writing {} entries", report.entries);
    }
    info!("Wrote {} k-mers", report.entries);
    Ok(())
}

/// Count k-mers and print `depth  k-mers  mean GC` for every non-empty depth
fn histogram_command(load: LoadArgs, max: usize, output: Option<String>) -> anyhow::Result<()> {
    let k = load.k;
    let table = load_table(&load)?;
    let hist = table.fill_histogram(max);
    let gc = table.count_gc(max);

    let mut out = open_output(output.as_deref())?;
    writeln!(out, "#depth\tkmers\tgc_fraction")?;
    for (depth, (&kmers, &gc_bases)) in hist.iter().zip(&gc).enumerate() {
        if kmers == 0 {
            continue;
        }
        let gc_fraction = gc_bases as f64 / (kmers as f64 * k as f64);
        writeln!(out, "{}\t{}\t{:.4}", depth, kmers, gc_fraction)?;
    }
    out.flush().context("failed to flush output")?;
    Ok(())
}

/// Build a shard set and load every k-mer of `load.input` into it
fn load_table(load: &LoadArgs) -> anyhow::Result<ShardSet<Counter>> {
    let config = TableConfig {
        ways: load.ways,
        initial_size: load.initial_size,
        k: load.k,
        threads: load.threads,
        ..TableConfig::default()
    };
    config.print();
    let table = ShardSet::<Counter>::new(config).context("failed to allocate k-mer tables")?;

    info!("Counting {}-mers from {}", load.k, load.input);
    let mut reader = needletail::parse_fastx_file(&load.input)
        .with_context(|| format!("failed to open {}", load.input))?;

    let mut batch = Vec::with_capacity(BATCH_SIZE);
    let mut sequences = 0usize;
    let mut total = 0usize;
    while let Some(record) = reader.next() {
        let record = record.with_context(|| format!("malformed record in {}", load.input))?;
        let seq = record.seq();
        if seq.len() < load.k {
            continue;
        }
        sequences += 1;
        batch.extend(KmerIterator::new(&seq, load.k, load.canonical));
        if batch.len() >= BATCH_SIZE {
            total += batch.len();
            table.increment_all(&batch);
            batch.clear();
        }
    }
    total += batch.len();
    table.increment_all(&batch);

    if sequences == 0 {
        warn!("No sequences of length >= {} in {}", load.k, load.input);
    }
    info!(
        "Loaded {} k-mers ({} distinct, {} in overflow trees) from {} sequences",
        total,
        table.size(),
        table.victim_size(),
        sequences
    );
    Ok(table)
}

/// Buffered writer for `path`, or stdout
fn open_output(path: Option<&str>) -> anyhow::Result<BufWriter<Box<dyn Write + Send>>> {
    let writer: Box<dyn Write + Send> = match path {
        Some(path) => Box::new(
            File::create(path).with_context(|| format!("failed to create {}", path))?,
        ),
        None => Box::new(std::io::stdout()),
    };
    Ok(BufWriter::new(writer))
}
