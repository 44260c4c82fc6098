use anyhow::Result;
use clap::{Parser, Subcommand};
use qdm_core::config;
use qdm_core::engine::{AddRequest, Engine};
use qdm_core::ingest;
use qdm_core::ingest::media::MediaStore;
use qdm_core::scheduler;
use qdm_core::store::records::{DownloadStatus, Schedule};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Top-level CLI for the qdm download accelerator.
#[derive(Debug, Parser)]
#[command(name = "qdm")]
#[command(about = "qdm: segmented download accelerator", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Debug, Subcommand)]
pub enum CliCommand {
    /// Add a new download.
    Add {
        /// Direct HTTP/HTTPS URL to download.
        url: String,

        /// Directory for the final artifact (default: configured download dir).
        #[arg(long)]
        dir: Option<PathBuf>,

        /// Override the derived file name.
        #[arg(long)]
        file_name: Option<String>,

        /// Override the per-download segment cap (1..32).
        #[arg(long)]
        segments: Option<u32>,

        /// Queue to place the download in (default queue otherwise).
        #[arg(long)]
        queue: Option<String>,
    },

    /// Run the engine: scheduler, downloads, and the ingestion endpoint.
    Run {
        /// Exit once every queued download has been processed.
        #[arg(long)]
        once: bool,
    },

    /// Show status of all downloads.
    Status,

    /// Remove a finished (completed/failed/stopped) download by id.
    Remove {
        /// Download identifier.
        id: String,
    },

    /// Manage queues.
    Queue {
        #[command(subcommand)]
        command: QueueCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum QueueCommand {
    /// List queues and their members.
    List,

    /// Create a queue.
    Add {
        name: String,

        /// Concurrency cap for the queue.
        #[arg(long, default_value_t = 3)]
        max_concurrent: usize,

        /// Window open time, "HH:MM" (requires --until and --days).
        #[arg(long)]
        from: Option<String>,

        /// Window close time, "HH:MM", inclusive; wraps past midnight.
        #[arg(long)]
        until: Option<String>,

        /// Comma-separated weekdays, 0 = Sunday .. 6 = Saturday.
        #[arg(long)]
        days: Option<String>,
    },

    /// Delete a queue (members move to the first remaining queue).
    Rm { id: String },

    /// Move a download into a queue.
    Move { download_id: String, queue_id: String },
}

impl CliCommand {
    pub async fn run_from_args() -> Result<()> {
        let cli = Cli::parse();

        let cfg = config::load_or_init()?;
        tracing::debug!("loaded config: {:?}", cfg);

        let engine = Engine::new(cfg).await?;

        match cli.command {
            CliCommand::Add {
                url,
                dir,
                file_name,
                segments,
                queue,
            } => {
                let id = engine
                    .add(AddRequest {
                        url: url.clone(),
                        save_dir: dir,
                        file_name,
                        max_segments: segments,
                        queue_id: queue,
                        ..Default::default()
                    })
                    .await?;
                println!("Added download {id} for URL: {url}");
            }
            CliCommand::Run { once } => {
                let media = Arc::new(MediaStore::new());
                let endpoint = ingest::spawn(engine.clone(), Arc::clone(&media)).await?;
                println!("Ingestion endpoint on 127.0.0.1:{}", endpoint.port);
                let sched = scheduler::spawn(engine.clone());

                if once {
                    loop {
                        engine.sweep_now().await?;
                        let busy = engine.list().iter().any(|d| {
                            matches!(
                                d.status,
                                DownloadStatus::Queued
                                    | DownloadStatus::Downloading
                                    | DownloadStatus::Assembling
                            )
                        });
                        if !busy {
                            break;
                        }
                        tokio::time::sleep(Duration::from_millis(300)).await;
                    }
                    println!("Queue drained.");
                } else {
                    tokio::signal::ctrl_c().await?;
                    println!("Shutting down.");
                }
                sched.abort();
                endpoint.handle.abort();
            }
            CliCommand::Status => {
                let downloads = engine.list();
                if downloads.is_empty() {
                    println!("No downloads.");
                } else {
                    println!(
                        "{:<34} {:<12} {:>8} {:>12} {:<9} {}",
                        "ID", "STATE", "PROG", "SIZE", "KIND", "URL"
                    );
                    for d in downloads {
                        let size = d
                            .total_size
                            .map(|s| s.to_string())
                            .unwrap_or_else(|| "-".to_string());
                        println!(
                            "{:<34} {:<12} {:>7.1}% {:>12} {:<9} {}",
                            d.id,
                            format!("{:?}", d.status).to_lowercase(),
                            d.progress_pct,
                            size,
                            format!("{:?}", d.category()).to_lowercase(),
                            d.source_url
                        );
                    }
                }
            }
            CliCommand::Remove { id } => {
                engine.remove(&id).await?;
                println!("Removed download {id}");
            }
            CliCommand::Queue { command } => match command {
                QueueCommand::List => {
                    for q in engine.queues() {
                        let window = q
                            .schedule
                            .as_ref()
                            .map(|s| {
                                format!(
                                    " [{:02}:{:02}-{:02}:{:02} days {:?}]",
                                    s.start_minute / 60,
                                    s.start_minute % 60,
                                    s.end_minute / 60,
                                    s.end_minute % 60,
                                    s.days
                                )
                            })
                            .unwrap_or_default();
                        println!(
                            "{} ({}) max={} enabled={}{} members={}",
                            q.id,
                            q.name,
                            q.max_concurrent,
                            q.enabled,
                            window,
                            q.download_ids.len()
                        );
                    }
                }
                QueueCommand::Add {
                    name,
                    max_concurrent,
                    from,
                    until,
                    days,
                } => {
                    let schedule = match (from, until, days) {
                        (Some(from), Some(until), Some(days)) => {
                            let days: Vec<u8> = days
                                .split(',')
                                .filter_map(|d| d.trim().parse().ok())
                                .filter(|d| *d <= 6)
                                .collect();
                            Schedule::from_hhmm(&from, &until, days)
                        }
                        _ => None,
                    };
                    let id = engine.create_queue(&name, max_concurrent, schedule).await?;
                    println!("Created queue {id}");
                }
                QueueCommand::Rm { id } => {
                    engine.delete_queue(&id).await?;
                    println!("Deleted queue {id}");
                }
                QueueCommand::Move {
                    download_id,
                    queue_id,
                } => {
                    engine.move_to_queue(&download_id, &queue_id).await?;
                    println!("Moved {download_id} to queue {queue_id}");
                }
            },
        }

        Ok(())
    }
}
