use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};

use ipwatch::config::{IpWatchConfig, LoggingConfig};
use ipwatch::denylist::{self, Denylist};
use ipwatch::detect::engine::AnomalyEngine;
use ipwatch::detect::flagger::SuspicionLedger;
use ipwatch::scheduler::{Job, Scheduler};
use ipwatch::storage::{self, Pool};

#[derive(Parser)]
#[command(
    name = "ipwatch",
    about = "IP traffic anomaly detection and denylisting for web services",
    version,
    long_about = None
)]
struct Cli {
    /// Path to the TOML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (API server + request tracking + scheduler)
    Serve {
        /// Bind address (overrides the config file)
        #[arg(long)]
        bind: Option<String>,
    },

    /// Run anomaly detection over the recent window once
    Detect {
        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Block an address or CIDR network
    Block {
        /// IP address or CIDR network (at most 1000 hosts)
        target: String,

        /// Reason recorded with the block
        #[arg(long, default_value = "Manual block")]
        reason: String,
    },

    /// Lift the block on an address or CIDR network
    Unblock {
        /// IP address or CIDR network
        target: String,
    },

    /// List active blocks
    Blocked,

    /// List recent suspicion flags
    Suspicious {
        /// Maximum number of records
        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Mark a suspicion flag as resolved
    Resolve {
        /// Record id
        id: i64,
    },

    /// Delete request logs older than the retention period
    Cleanup {
        /// Retention in days (overrides the config file)
        #[arg(long)]
        days: Option<u64>,
    },

    /// Print the security report for the last 24 hours
    Report,

    /// Manage scheduled jobs
    Schedule {
        #[command(subcommand)]
        action: ScheduleAction,
    },
}

#[derive(Subcommand)]
enum ScheduleAction {
    /// List all schedules
    List,

    /// Add a new schedule
    Add {
        /// Schedule name
        #[arg(long)]
        name: String,

        /// Cron expression (6-field, with seconds)
        #[arg(long)]
        cron: String,

        /// Job to run: detect-anomalies, cleanup-logs or security-report
        #[arg(long)]
        job: String,
    },

    /// Remove a schedule
    Remove {
        /// Schedule name
        #[arg(long)]
        name: String,
    },

    /// Preview what will run in the next N hours
    DryRun {
        /// Hours to preview
        #[arg(long, default_value = "24")]
        hours: u64,
    },
}

fn init_tracing(cfg: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.level));

    if cfg.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

fn open_pool(config: &IpWatchConfig) -> Result<Pool> {
    storage::open_pool(&config.storage.db_path)
}

fn open_denylist(pool: &Pool, config: &IpWatchConfig) -> Denylist {
    Denylist::with_capacity(
        pool.clone(),
        Duration::from_secs(config.denylist.cache_ttl_secs),
        config.denylist.cache_capacity,
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = IpWatchConfig::resolve(cli.config.as_deref())?;
    init_tracing(&config.logging);

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            tracing::info!(bind = %config.server.bind, "Starting ipwatch daemon");
            ipwatch::serve(config).await?;
        }
        Commands::Detect { json } => {
            let pool = open_pool(&config)?;
            let denylist = open_denylist(&pool, &config);
            let engine = AnomalyEngine::from_pool(pool, denylist, &config.detection);
            let summary = engine.run().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!(
                    "Analyzed {} events, created {} new flags.",
                    summary.events_analyzed, summary.flags_created
                );
                if !summary.failed_detectors.is_empty() {
                    println!("Failed detectors: {}", summary.failed_detectors.join(", "));
                }
            }
        }
        Commands::Block { target, reason } => {
            let pool = open_pool(&config)?;
            let addresses = denylist::expand_target(&target)?;
            let list = open_denylist(&pool, &config);
            let (mut blocked, mut already) = (0, 0);
            for ip in &addresses {
                if list.ensure_blocked(&ip.to_string(), &reason)?.is_new() {
                    blocked += 1;
                } else {
                    already += 1;
                }
            }
            println!("Blocked {} address(es), {} already blocked.", blocked, already);
        }
        Commands::Unblock { target } => {
            let pool = open_pool(&config)?;
            let addresses = denylist::expand_target(&target)?;
            let list = open_denylist(&pool, &config);
            let mut lifted = 0;
            for ip in &addresses {
                if list.unblock(&ip.to_string())? {
                    lifted += 1;
                }
            }
            println!("Unblocked {} address(es).", lifted);
        }
        Commands::Blocked => {
            let pool = open_pool(&config)?;
            let records = open_denylist(&pool, &config).list_active()?;
            if records.is_empty() {
                println!("No blocked addresses.");
            } else {
                println!("{:<40} | {:<25} | Reason", "Address", "Since");
                println!("{:-<40}-|-{:-<25}-|-{:-<30}", "", "", "");
                for r in records {
                    println!(
                        "{:<40} | {:<25} | {}",
                        r.address,
                        r.created_at.format("%Y-%m-%d %H:%M:%S"),
                        r.reason
                    );
                }
            }
        }
        Commands::Suspicious { limit } => {
            let pool = open_pool(&config)?;
            let records = SuspicionLedger::new(pool).list_recent(limit)?;
            if records.is_empty() {
                println!("No suspicious activity recorded.");
            } else {
                println!(
                    "{:<6} | {:<40} | {:<8} | {:<8} | Reason",
                    "ID", "Address", "Severity", "Resolved"
                );
                println!("{:-<6}-|-{:-<40}-|-{:-<8}-|-{:-<8}-|-{:-<30}", "", "", "", "", "");
                for r in records {
                    println!(
                        "{:<6} | {:<40} | {:<8} | {:<8} | {}",
                        r.id, r.address, r.severity, r.resolved, r.reason
                    );
                }
            }
        }
        Commands::Resolve { id } => {
            let pool = open_pool(&config)?;
            if !SuspicionLedger::new(pool).mark_resolved(id)? {
                anyhow::bail!("Suspicious record {} not found", id);
            }
            println!("Record {} marked resolved.", id);
        }
        Commands::Cleanup { days } => {
            let pool = open_pool(&config)?;
            let days = days.unwrap_or(config.retention.days);
            let report = ipwatch::housekeeping::cleanup_old_logs(&pool, Utc::now(), days)?;
            println!(
                "Deleted {} request log(s) older than {}.",
                report.deleted_logs,
                report.cutoff.to_rfc3339()
            );
        }
        Commands::Report => {
            let pool = open_pool(&config)?;
            let report = ipwatch::housekeeping::generate_security_report(&pool, Utc::now())?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Schedule { action } => {
            let scheduler = Scheduler::new(open_pool(&config)?);

            match action {
                ScheduleAction::List => {
                    let list = scheduler.list()?;
                    if list.is_empty() {
                        println!("No schedules found.");
                    } else {
                        println!(
                            "{:<20} | {:<15} | {:<16} | Enabled",
                            "Name", "Cron", "Job"
                        );
                        println!("{:-<20}-|-{:-<15}-|-{:-<16}-|-{:-<7}", "", "", "", "");
                        for s in list {
                            println!(
                                "{:<20} | {:<15} | {:<16} | {}",
                                s.name, s.cron_expr, s.job, s.enabled
                            );
                        }
                    }
                }
                ScheduleAction::Add { name, cron, job } => {
                    let job = Job::from_str_name(&job)
                        .with_context(|| format!("Unknown job '{}'", job))?;
                    scheduler.add_schedule(&name, &cron, job)?;
                    println!("Schedule '{}' added.", name);
                }
                ScheduleAction::Remove { name } => {
                    scheduler.remove(&name)?;
                    println!("Schedule '{}' removed.", name);
                }
                ScheduleAction::DryRun { hours } => {
                    let preview = scheduler.preview_next_runs(Utc::now(), hours)?;
                    if preview.is_empty() {
                        println!("No runs scheduled in next {} hours.", hours);
                    } else {
                        println!("Upcoming runs (next {} hours):", hours);
                        for (time, name, job) in preview {
                            println!("{} : {} ({})", time.to_rfc3339(), name, job);
                        }
                    }
                }
            }
        }
    }

    Ok(())
}
