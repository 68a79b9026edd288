use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use popstore::snapshot::{Snapshot, SNAPSHOT_NAMESPACE};
use popstore::storage::{FileKvStore, FileStreamStore, KvStore};
use popstore::{
    AckStatus, Error, MemoryDeadLetterSender, MessageStore, QueueId, StaticMetadata, StoreConfig,
};

#[derive(Parser)]
#[command(name = "popstore-cli", version, about = "Pop/ack queue store tooling")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a produce/pop/ack session against a data directory and report
    /// what happened. Rerunning on the same directory recovers its queue.
    Demo {
        /// Holds `streams/` (segment files) and `kv/` (snapshots).
        #[arg(long = "data-dir")]
        data_dir: PathBuf,
        #[arg(long = "config")]
        config: Option<PathBuf>,
        #[arg(long = "messages", default_value_t = 100)]
        messages: u64,
        #[arg(long = "max-retries", default_value_t = 2)]
        max_retries: u32,
        #[arg(long = "invisible-ms", default_value_t = 200)]
        invisible_ms: u64,
        /// Leave every Nth message unacked so it expires and retries.
        #[arg(long = "drop-every", default_value_t = 10)]
        drop_every: u64,
    },
    /// Print the persisted snapshot of a queue.
    Snapshot {
        #[arg(long = "data-dir")]
        data_dir: PathBuf,
        #[arg(long = "topic")]
        topic: u64,
        #[arg(long = "queue", default_value_t = 0)]
        queue: u32,
    },
    /// Print the effective configuration after defaults are applied.
    Config { path: Option<PathBuf> },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Demo {
            data_dir,
            config,
            messages,
            max_retries,
            invisible_ms,
            drop_every,
        } => run_demo(
            data_dir,
            load_config(config)?,
            messages,
            max_retries,
            Duration::from_millis(invisible_ms),
            drop_every,
        ),
        Commands::Snapshot {
            data_dir,
            topic,
            queue,
        } => print_snapshot(&data_dir, QueueId::new(topic, queue)),
        Commands::Config { path } => {
            let config = load_config(path)?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn load_config(path: Option<PathBuf>) -> Result<StoreConfig> {
    match path {
        Some(path) => StoreConfig::load(&path)
            .with_context(|| format!("loading config {}", path.display())),
        None => Ok(StoreConfig::default()),
    }
}

fn open_kv(data_dir: &Path) -> Result<FileKvStore> {
    let kv_dir = data_dir.join("kv");
    FileKvStore::open(&kv_dir).with_context(|| format!("opening kv store at {}", kv_dir.display()))
}

fn run_demo(
    data_dir: PathBuf,
    config: StoreConfig,
    messages: u64,
    max_retries: u32,
    invisible: Duration,
    drop_every: u64,
) -> Result<()> {
    if drop_every == 0 {
        bail!("--drop-every must be positive");
    }
    let queue = QueueId::new(1, 0);
    let metadata = Arc::new(StaticMetadata::new());
    metadata.register_simple(queue, max_retries)?;
    let streams_dir = data_dir.join("streams");
    let streams = FileStreamStore::open(&streams_dir)
        .with_context(|| format!("opening stream store at {}", streams_dir.display()))?;
    let kv = open_kv(&data_dir)?;
    let dead_letters = Arc::new(MemoryDeadLetterSender::new());

    let store = MessageStore::builder()
        .config(config)
        .metadata(metadata)
        .stream_store(Arc::new(streams))
        .kv_store(Arc::new(kv))
        .dead_letter_sender(dead_letters.clone())
        .build()?;
    store.start()?;

    let recovered = store.stats(queue)?;
    if recovered.next_log_offset > 0 {
        log::info!(
            "recovered queue {queue}: consume_offset={} inflight={}",
            recovered.consume_offset,
            recovered.inflight
        );
    }
    let mut end = recovered.consume_offset;
    for i in 0..messages {
        end = store.put(queue, format!("message-{i}").as_bytes())? + 1;
    }

    let started = Instant::now();
    let mut acked = 0u64;
    let mut dropped = 0u64;
    loop {
        let stats = store.stats(queue)?;
        let settled = stats.inflight == 0 && stats.consume_offset >= end;
        if settled {
            break;
        }
        let receipts = match store.pop(queue, 16, invisible, invisible * 2) {
            Ok(receipts) => receipts,
            Err(Error::Timeout(_)) => continue,
            Err(err) => return Err(err.into()),
        };
        for receipt in receipts {
            if receipt.message.offset % drop_every == 0 {
                dropped += 1;
                continue;
            }
            if store.ack(queue, &receipt.handle)? == AckStatus::Ok {
                acked += 1;
            }
        }
    }

    let stats = store.stats(queue)?;
    store.snapshot(queue)?;
    store.shutdown();
    println!(
        "{messages} messages in {:?}: {acked} acked, {dropped} deliveries left to expire, {} dead-lettered",
        started.elapsed(),
        dead_letters.sent().len()
    );
    println!(
        "consume_offset={} min_unacked={} log_offset={}",
        stats.consume_offset, stats.min_unacked_offset, stats.next_log_offset
    );
    Ok(())
}

fn print_snapshot(data_dir: &Path, queue: QueueId) -> Result<()> {
    let kv = open_kv(data_dir)?;
    let Some(data) = kv.get(SNAPSHOT_NAMESPACE, &queue.kv_key())? else {
        bail!("no snapshot for queue {queue}");
    };
    let snapshot = Snapshot::decode(queue, &data)?;
    println!(
        "queue {queue}: consume_offset={} min_unacked={} log_offset={} next_receipt={} taken_at_ms={}",
        snapshot.consume_offset,
        snapshot.min_unacked_offset,
        snapshot.log_offset,
        snapshot.next_receipt_id,
        snapshot.taken_at_ms
    );
    for entry in &snapshot.inflight {
        println!(
            "  offset={} receipt={} attempts={} state={:?} invisible_until_ms={}",
            entry.offset, entry.receipt_id, entry.attempts, entry.state, entry.invisible_until_ms
        );
    }
    Ok(())
}
