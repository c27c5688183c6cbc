//! sbtreedb - maintenance tool for an sbtreedb data directory

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use sbtreedb::config::{FlushPolicy, StorageConfig};
use sbtreedb::database::Database;
use sbtreedb::storage::wal::WalRecord;
use std::path::PathBuf;
use std::time::Duration;

/// sbtreedb - inspect, recover and checkpoint a data directory
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Data directory
    #[arg(short = 'D', long, default_value = "./sbtreedb_data")]
    data_dir: PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Number of page frames in the read cache
    #[arg(short = 'c', long, default_value = "4096")]
    cache_pages: usize,

    /// When WAL records are forced to disk
    #[arg(long, value_enum, default_value = "group")]
    flush: FlushArg,

    /// Interval of the background WAL flush with `--flush periodic`
    #[arg(long, default_value = "100")]
    flush_interval_ms: u64,

    /// WAL segment size in bytes
    #[arg(long)]
    segment_size: Option<u64>,

    /// Run a fuzzy checkpoint every N milliseconds while open
    #[arg(long)]
    checkpoint_interval: Option<u64>,

    /// Verify page checksums on load
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    verify_checksums: bool,

    /// Do not lock the data directory
    #[arg(long)]
    no_file_lock: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum FlushArg {
    Sync,
    Group,
    Periodic,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Open the directory, replay the WAL and report what was recovered
    Recover,
    /// Run a fuzzy checkpoint and truncate the WAL
    Checkpoint,
    /// Print every record left in the WAL
    WalDump {
        /// Print full record contents
        #[arg(short, long)]
        verbose: bool,
    },
    /// List the registered files
    Files,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    let database = Database::open(storage_config(&args))
        .with_context(|| format!("Failed to open {}", args.data_dir.display()))?;

    match args.command {
        Command::Recover => {
            let stats = database.recovery_stats();
            match stats.start_lsn {
                Some(lsn) => println!("Recovery started at {}", lsn),
                None => println!("WAL was empty"),
            }
            println!("  records analyzed:  {}", stats.records_analyzed);
            println!("  records redone:    {}", stats.records_redone);
            println!("  files created:     {}", stats.files_created);
            println!("  units committed:   {}", stats.units_committed);
            println!("  units rolled back: {}", stats.units_rolled_back);
            println!("  units discarded:   {}", stats.units_discarded);
            println!("  orphan records:    {}", stats.orphan_records);
        }
        Command::Checkpoint => {
            let stats = database.checkpoint().context("Checkpoint failed")?;
            println!(
                "Checkpoint at {}: {} page(s) flushed, {} segment(s) removed, replay from {}",
                stats.start_lsn, stats.pages_flushed, stats.segments_removed, stats.cut_lsn
            );
        }
        Command::WalDump { verbose } => {
            let wal = database.wal();
            let iter = wal.iter().context("Failed to read WAL")?;
            let mut count = 0usize;
            for entry in iter {
                let (lsn, record) = entry.context("Failed to decode WAL record")?;
                count += 1;
                if verbose {
                    println!("{} {:?}", lsn, record);
                } else {
                    println!("{} {}{}", lsn, record.kind(), describe(&record));
                }
            }
            println!("{} record(s)", count);
        }
        Command::Files => {
            let mut files = database.cache().write_cache().files();
            files.sort_by_key(|(_, id)| *id);
            for (name, id) in files {
                println!("{:>6}  {}", id, name);
            }
        }
    }

    database.close().context("Failed to close database")?;
    Ok(())
}

fn storage_config(args: &Args) -> StorageConfig {
    let flush_policy = match args.flush {
        FlushArg::Sync => FlushPolicy::Sync,
        FlushArg::Group => FlushPolicy::Group,
        FlushArg::Periodic => FlushPolicy::Periodic {
            interval_ms: args.flush_interval_ms,
        },
    };
    let mut config = StorageConfig::new(&args.data_dir)
        .with_cache_pages(args.cache_pages)
        .with_flush_policy(flush_policy)
        .with_checkpoint_interval(args.checkpoint_interval.map(Duration::from_millis))
        .with_file_lock(!args.no_file_lock)
        .with_verify_checksums(args.verify_checksums);
    if let Some(segment_size) = args.segment_size {
        config = config.with_segment_size(segment_size);
    }
    config
}

fn describe(record: &WalRecord) -> String {
    match record {
        WalRecord::AtomicUnitStart { unit_id } => format!(" unit={}", unit_id),
        WalRecord::AtomicUnitEnd { unit_id, rollback } => {
            format!(" unit={} rollback={}", unit_id, rollback)
        }
        WalRecord::UpdatePage {
            unit_id,
            file_id,
            page_index,
            changes,
        } => format!(
            " unit={} page={}:{} ranges={}",
            unit_id,
            file_id,
            page_index,
            changes.len()
        ),
        WalRecord::FileCreated {
            unit_id,
            file_name,
            file_id,
        } => format!(" unit={} file={} id={}", unit_id, file_name, file_id),
        WalRecord::FuzzyCheckpointStart { flushed_lsn } => format!(" flushed={}", flushed_lsn),
        WalRecord::NonTxOperationPerformed | WalRecord::FuzzyCheckpointEnd => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = Args::try_parse_from(["sbtreedb", "files"]).unwrap();
        let config = storage_config(&args);
        assert_eq!(config, StorageConfig::new("./sbtreedb_data").with_cache_pages(4096));
    }

    #[test]
    fn test_periodic_flush_and_tuning_flags() {
        let args = Args::try_parse_from([
            "sbtreedb",
            "-D",
            "/tmp/sbtreedb-cli",
            "--flush",
            "periodic",
            "--flush-interval-ms",
            "25",
            "--segment-size",
            "1048576",
            "--checkpoint-interval",
            "5000",
            "--verify-checksums",
            "false",
            "checkpoint",
        ])
        .unwrap();
        let config = storage_config(&args);
        assert_eq!(config.wal.flush_policy, FlushPolicy::Periodic { interval_ms: 25 });
        assert_eq!(config.wal.segment_size, 1_048_576);
        assert_eq!(config.checkpoint_interval(), Some(Duration::from_millis(5000)));
        assert!(!config.verify_checksums);
        assert!(config.file_lock);
        assert!(config.validate().is_ok());
        assert!(matches!(args.command, Command::Checkpoint));
    }

    #[test]
    fn test_zero_flush_interval_is_rejected_by_validation() {
        let args = Args::try_parse_from([
            "sbtreedb",
            "--flush",
            "periodic",
            "--flush-interval-ms",
            "0",
            "recover",
        ])
        .unwrap();
        assert!(storage_config(&args).validate().is_err());
    }
}
