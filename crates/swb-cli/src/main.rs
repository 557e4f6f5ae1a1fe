//! Operator CLI for the switchboard.
//!
//! Database and roster commands talk to Postgres directly; request-level
//! operator verbs (reroute, cancel, replay, force-complete) go through the
//! running daemon, which owns in-flight state and the audit trail. Exit
//! code 0 on success, 1 on refusal or failure.

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::path::Path;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "swb")]
#[command(about = "Switchboard operator CLI", long_about = None)]
struct Cli {
    /// Daemon base URL for operator verbs.
    #[arg(long, global = true, default_value = "http://127.0.0.1:8820")]
    daemon_url: String,

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

    /// Compute layered config hash + print canonical JSON
    ConfigHash {
        /// Paths in merge order (base -> env -> overrides)
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Butler registry commands
    Registry {
        #[command(subcommand)]
        cmd: RegistryCmd,
    },

    /// Re-dispatch a failed request to a chosen butler
    Reroute {
        request_id: Uuid,
        #[arg(long)]
        target: String,
        #[arg(long)]
        operator: String,
        #[arg(long)]
        reason: String,
    },

    /// Cancel an in-flight request
    Cancel {
        request_id: Uuid,
        #[arg(long)]
        operator: String,
        #[arg(long)]
        reason: String,
    },

    /// Replay a dead-lettered request with preserved lineage
    Replay {
        dlq_id: Uuid,
        #[arg(long)]
        operator: String,
        #[arg(long)]
        reason: String,
    },

    /// Force a stuck request into completed
    ForceComplete {
        request_id: Uuid,
        #[arg(long)]
        operator: String,
        #[arg(long)]
        reason: String,
    },
}

#[derive(Subcommand)]
enum DbCmd {
    Status,
    Migrate,
    /// Ensure current + next month inbox partitions exist
    EnsurePartitions,
    /// Drop inbox partitions past retention
    Prune {
        #[arg(long, default_value_t = 3)]
        months: u32,
    },
}

#[derive(Subcommand)]
enum RegistryCmd {
    /// List registered butlers
    List,
    /// Scan a roster directory and register each descriptor
    Discover {
        #[arg(long, default_value = "roster")]
        roster_dir: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    let cli = Cli::parse();

    match cli.cmd {
        Commands::Db { cmd } => {
            let pool = swb_db::connect_from_env().await?;
            match cmd {
                DbCmd::Status => {
                    let s = swb_db::status(&pool).await?;
                    println!("db_ok={} has_inbox_table={}", s.ok, s.has_inbox_table);
                }
                DbCmd::Migrate => {
                    swb_db::migrate(&pool).await?;
                    println!("migrations_applied=true");
                }
                DbCmd::EnsurePartitions => {
                    let names = swb_db::ensure_partitions(&pool).await?;
                    println!("partitions={}", names.join(","));
                }
                DbCmd::Prune { months } => {
                    let dropped = swb_db::drop_expired_partitions(&pool, months).await?;
                    println!("partitions_dropped={dropped}");
                }
            }
        }

        Commands::ConfigHash { paths } => {
            let path_refs: Vec<&str> = paths.iter().map(|s| s.as_str()).collect();
            let loaded = swb_config::load_layered_yaml(&path_refs)?;
            println!("config_hash={}", loaded.config_hash);
            println!("{}", loaded.canonical_json);
        }

        Commands::Registry { cmd } => {
            let pool = swb_db::connect_from_env().await?;
            match cmd {
                RegistryCmd::List => {
                    for b in swb_db::list_butlers(&pool).await? {
                        println!(
                            "name={} endpoint={} transport={} last_seen_at={}",
                            b.name,
                            b.endpoint_url,
                            b.transport,
                            b.last_seen_at
                                .map(|t| t.to_rfc3339())
                                .unwrap_or_else(|| "never".to_string()),
                        );
                    }
                }
                RegistryCmd::Discover { roster_dir } => {
                    let found =
                        swb_registry::discover_roster(&pool, Path::new(&roster_dir)).await?;
                    for d in &found {
                        println!("registered={} endpoint={}", d.name, d.endpoint_url);
                    }
                    println!("discovered_count={}", found.len());
                }
            }
        }

        Commands::Reroute { request_id, target, operator, reason } => {
            operator_verb(
                &cli.daemon_url,
                "reroute",
                serde_json::json!({
                    "request_id": request_id,
                    "target": target,
                    "operator": operator,
                    "reason": reason,
                }),
            )
            .await?;
        }

        Commands::Cancel { request_id, operator, reason } => {
            operator_verb(
                &cli.daemon_url,
                "cancel",
                serde_json::json!({
                    "request_id": request_id,
                    "operator": operator,
                    "reason": reason,
                }),
            )
            .await?;
        }

        Commands::Replay { dlq_id, operator, reason } => {
            operator_verb(
                &cli.daemon_url,
                "replay",
                serde_json::json!({
                    "dlq_id": dlq_id,
                    "operator": operator,
                    "reason": reason,
                }),
            )
            .await?;
        }

        Commands::ForceComplete { request_id, operator, reason } => {
            operator_verb(
                &cli.daemon_url,
                "force-complete",
                serde_json::json!({
                    "request_id": request_id,
                    "operator": operator,
                    "reason": reason,
                }),
            )
            .await?;
        }
    }

    Ok(())
}

/// POST one operator action to the daemon and print its verdict.
/// Non-success outcomes exit 1 so scripts can gate on the result.
async fn operator_verb(daemon_url: &str, verb: &str, body: serde_json::Value) -> Result<()> {
    let url = format!("{}/v1/operator/{verb}", daemon_url.trim_end_matches('/'));
    let resp = reqwest::Client::new().post(&url).json(&body).send().await?;

    let status = resp.status();
    let payload: serde_json::Value = resp.json().await?;

    let outcome = payload["outcome"].as_str().unwrap_or("unknown");
    let detail = payload["detail"].as_str().unwrap_or("");
    println!("outcome={outcome} detail={detail:?}");
    if let Some(new_id) = payload["new_request_id"].as_str() {
        println!("new_request_id={new_id}");
    }

    if !status.is_success() {
        bail!("{verb} refused: {outcome}");
    }
    Ok(())
}
