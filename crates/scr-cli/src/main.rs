use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use uuid::Uuid;

use scr_dispatcher::{BulkOutcome, ScreenOutcome, ScreeningDispatcher};
use scr_schemas::{EntityType, ReasonForCheck, ScreeningRequest};

#[derive(Parser)]
#[command(name = "scr")]
#[command(about = "Sanctions/PEP screening coordination engine CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Database commands
    Db {
        #[command(subcommand)]
        cmd: DbCmd,
    },

    /// Compute the environment-derived config hash + print canonical JSON
    ConfigHash,

    /// Run the `Screen` operation for a single entity
    Screen {
        #[arg(long)]
        name: String,
        #[arg(long)]
        dob: Option<String>,
        /// person | organization
        #[arg(long, default_value = "person")]
        entity_type: String,
        #[arg(long)]
        requestor: String,
        #[arg(long)]
        business_reference: Option<String>,
        /// One of the spec's reason-for-check labels, e.g. "Client Onboarding"
        #[arg(long)]
        reason_for_check: Option<String>,
    },

    /// Look up a queued/running/completed job by id
    JobStatus {
        job_id: Uuid,
    },

    /// Search cached screened entities by name
    Search {
        term: String,
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },

    /// Bulk-enqueue screening requests from a CSV file (name,dob,entity_type,requestor,business_reference,reason_for_check)
    EnqueueBulk {
        csv: PathBuf,
    },

    /// Overwrite a cached verdict with a manual false-positive clearance
    MarkFalsePositive {
        entity_key: String,
        #[arg(long)]
        actor: String,
        #[arg(long)]
        reason: Option<String>,
    },

    /// Run the Watchlist Refresh & Delta Sweep pipeline
    Refresh {
        #[arg(long, requires = "peps_csv")]
        sanctions_csv: Option<PathBuf>,
        #[arg(long, requires = "sanctions_csv")]
        peps_csv: Option<PathBuf>,
        #[arg(long, requires = "peps_url")]
        sanctions_url: Option<String>,
        #[arg(long, requires = "sanctions_url")]
        peps_url: Option<String>,
    },

    /// List jobs stuck in `running` for longer than the given number of minutes
    StuckJobs {
        #[arg(long, default_value_t = 30)]
        older_than_minutes: i64,
    },
}

#[derive(Subcommand)]
enum DbCmd {
    Status,
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    let cli = Cli::parse();

    match cli.cmd {
        Commands::Db { cmd } => {
            let pool = scr_db::connect_from_env().await?;
            match cmd {
                DbCmd::Status => {
                    let s = scr_db::status(&pool).await?;
                    println!("db_ok={} has_screened_entities_table={}", s.ok, s.has_screened_entities_table);
                }
                DbCmd::Migrate => {
                    scr_db::migrate(&pool).await?;
                    println!("migrations_applied=true");
                }
            }
        }

        Commands::ConfigHash => {
            let config = scr_config::EffectiveConfig::from_env()?;
            let (canonical_json, config_hash) = config.canonical_hash()?;
            println!("config_hash={config_hash}");
            println!("{canonical_json}");
        }

        Commands::Screen { name, dob, entity_type, requestor, business_reference, reason_for_check } => {
            let dispatcher = build_dispatcher().await?;
            let req = ScreeningRequest {
                name,
                dob,
                entity_type: parse_entity_type(&entity_type)?,
                requestor,
                business_reference,
                reason_for_check: reason_for_check.as_deref().map(parse_reason_for_check).transpose()?,
            };

            match dispatcher.screen(&req).await? {
                ScreenOutcome::Reused { entity_key, entity } => {
                    println!("outcome=reused");
                    println!("entity_key={entity_key}");
                    println!("status={}", entity.status.as_str());
                    println!("risk_level={}", entity.risk_level.as_str());
                    println!("score={}", entity.score);
                }
                ScreenOutcome::Completed { entity_key, entity } => {
                    println!("outcome=completed");
                    println!("entity_key={entity_key}");
                    println!("status={}", entity.status.as_str());
                    println!("risk_level={}", entity.risk_level.as_str());
                    println!("score={}", entity.score);
                }
                ScreenOutcome::Queued { entity_key, job_id } => {
                    println!("outcome=queued");
                    println!("entity_key={entity_key}");
                    println!("job_id={job_id}");
                }
            }
        }

        Commands::JobStatus { job_id } => {
            let pool = scr_db::connect_from_env().await?;
            match scr_db::get_job_status(&pool, job_id).await? {
                Some(job) => {
                    println!("job_id={}", job.job_id);
                    println!("entity_key={}", job.entity_key);
                    println!("status={}", job.status.as_str());
                    println!("reason={}", job.reason.as_str());
                    if let Some(transition) = job.transition {
                        println!("transition={}", transition.as_str());
                    }
                    if let Some(error) = job.error_message {
                        println!("error_message={error}");
                    }
                }
                None => println!("not_found=true"),
            }
        }

        Commands::Search { term, limit } => {
            let dispatcher = build_dispatcher().await?;
            let results = dispatcher.search_screened(&term, limit).await?;
            println!("count={}", results.len());
            for entity in results {
                println!("{}\t{}\t{}", entity.entity_key, entity.display_name, entity.status.as_str());
            }
        }

        Commands::EnqueueBulk { csv } => {
            let dispatcher = build_dispatcher().await?;
            let requests = read_bulk_csv(&csv)?;
            let outcomes = dispatcher.enqueue_bulk(&requests).await?;

            let mut reused = 0;
            let mut already_pending = 0;
            let mut queued = 0;
            for outcome in &outcomes {
                match outcome {
                    BulkOutcome::Reused { .. } => reused += 1,
                    BulkOutcome::AlreadyPending { .. } => already_pending += 1,
                    BulkOutcome::Queued { .. } => queued += 1,
                }
            }
            println!("total={}", outcomes.len());
            println!("reused={reused}");
            println!("already_pending={already_pending}");
            println!("queued={queued}");
        }

        Commands::MarkFalsePositive { entity_key, actor, reason } => {
            let dispatcher = build_dispatcher().await?;
            let entity = dispatcher.mark_false_positive(&entity_key, &actor, reason.as_deref()).await?;
            println!("entity_key={}", entity.entity_key);
            println!("status={}", entity.status.as_str());
        }

        Commands::Refresh { sanctions_csv, peps_csv, sanctions_url, peps_url } => {
            let pool = scr_db::connect_from_env().await?;
            scr_db::migrate(&pool).await?;
            let config = scr_config::EffectiveConfig::from_env()?;
            let initial_snapshot = scr_snapshot::read_snapshot_from_disk(std::path::Path::new(&config.snapshot_path))?;
            let snapshot = scr_snapshot::SnapshotHandle::new(initial_snapshot);

            let feed = match (sanctions_csv, peps_csv, sanctions_url, peps_url) {
                (Some(sanctions_path), Some(peps_path), _, _) => scr_refresh::FeedSource::Csv { sanctions_path, peps_path },
                (_, _, Some(sanctions_url), Some(peps_url)) => scr_refresh::FeedSource::Http { sanctions_url, peps_url },
                _ => anyhow::bail!("pass either --sanctions-csv/--peps-csv or --sanctions-url/--peps-url"),
            };

            let summary = match &config.audit_log_path {
                Some(path) => {
                    let audit = scr_audit::open_shared(path, true)?;
                    scr_refresh::run_refresh_audited(&pool, &snapshot, &config, &feed, &audit).await?
                }
                None => scr_refresh::run_refresh(&pool, &snapshot, &config, &feed).await?,
            };
            println!("refresh_run_id={}", summary.refresh_run_id);
            println!("uk_changed={}", summary.uk_changed);
            println!("added={}", summary.added);
            println!("removed={}", summary.removed);
            println!("changed={}", summary.changed);
            println!("candidate={}", summary.candidate);
            println!("queued={}", summary.queued);
            println!("already_pending={}", summary.already_pending);
            println!("reused={}", summary.reused);
        }

        Commands::StuckJobs { older_than_minutes } => {
            let pool = scr_db::connect_from_env().await?;
            let jobs = scr_db::list_stuck_running_jobs(&pool, older_than_minutes).await?;
            println!("count={}", jobs.len());
            for job in jobs {
                println!("{}\t{}\t{:?}", job.job_id, job.entity_key, job.started_at);
            }
        }
    }

    Ok(())
}

async fn build_dispatcher() -> Result<ScreeningDispatcher> {
    let config = scr_config::EffectiveConfig::from_env().context("load EffectiveConfig")?;
    let pool = scr_db::connect_from_env().await.context("connect to database")?;
    let initial_snapshot =
        scr_snapshot::read_snapshot_from_disk(std::path::Path::new(&config.snapshot_path)).context("load snapshot from disk")?;
    let snapshot = scr_snapshot::SnapshotHandle::new(initial_snapshot);
    let dispatcher = ScreeningDispatcher::new(pool, snapshot, config.clone());
    match &config.audit_log_path {
        Some(path) => Ok(dispatcher.with_audit(scr_audit::open_shared(path, true)?)),
        None => Ok(dispatcher),
    }
}

fn parse_entity_type(s: &str) -> Result<EntityType> {
    match s.to_lowercase().as_str() {
        "person" => Ok(EntityType::Person),
        "organization" | "org" => Ok(EntityType::Organization),
        other => anyhow::bail!("unknown entity type {other:?}, expected person or organization"),
    }
}

/// Reuses `ReasonForCheck`'s serde renames rather than re-implementing the
/// label-to-variant mapping by hand.
fn parse_reason_for_check(s: &str) -> Result<ReasonForCheck> {
    serde_json::from_value(Value::String(s.to_string())).with_context(|| format!("unknown reason-for-check label {s:?}"))
}

fn read_bulk_csv(path: &PathBuf) -> Result<Vec<ScreeningRequest>> {
    let mut reader = csv::Reader::from_path(path).with_context(|| format!("open {}", path.display()))?;
    let mut out = Vec::new();
    for record in reader.records() {
        let record = record.context("read CSV record")?;
        let name = record.get(0).unwrap_or("").trim().to_string();
        if name.is_empty() {
            continue;
        }
        let dob = record.get(1).map(str::trim).filter(|s| !s.is_empty()).map(str::to_string);
        let entity_type = record.get(2).map(str::trim).filter(|s| !s.is_empty()).map(parse_entity_type).transpose()?.unwrap_or(EntityType::Person);
        let requestor = record.get(3).unwrap_or("").trim().to_string();
        let business_reference = record.get(4).map(str::trim).filter(|s| !s.is_empty()).map(str::to_string);
        let reason_for_check = record.get(5).map(str::trim).filter(|s| !s.is_empty()).map(parse_reason_for_check).transpose()?;

        out.push(ScreeningRequest { name, dob, entity_type, requestor, business_reference, reason_for_check });
    }
    Ok(out)
}
