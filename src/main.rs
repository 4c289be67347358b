//! Tenantdb CLI - inspect and operate tenant stores from a config file

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use serde_json::Value;
use tenantdb::bootstrap::{self, Clients};
use tenantdb::config::{self, TenantDbConfig};
use tenantdb::metrics::RecordingMetrics;
use tenantdb::store::redact;
use tenantdb::ui::{self, Icons};
use tenantdb::{Filter, FindMode, FindOptions};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "tenantdb")]
#[command(version)]
#[command(about = "Multi-tenant data access layer for document and key-value stores")]
#[command(long_about = r#"
Tenantdb routes tenant-scoped operations to the document and key-value stores
named in tenantdb.toml.

Example usage:
  tenantdb init
  tenantdb check
  tenantdb insert --tenant alpha --collection events --doc '{"kind":"login"}'
  tenantdb find --tenant alpha --collection events --filter '{"kind":"login"}'
  tenantdb aggregate --tenant alpha --collection events --pipeline '[{"$match":{"kind":"login"}},{"$limit":5}]'
  tenantdb lock acquire --tenant alpha --key job:42 --token worker-1
"#)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to the config file
    #[arg(short, long, global = true, default_value = "tenantdb.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a starter config backed by local SQLite files
    Init {
        /// Directory for the SQLite files
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Overwrite an existing config
        #[arg(long)]
        force: bool,
    },

    /// Connect every configured endpoint and show the routing table
    Check,

    /// Query a collection
    Find {
        #[arg(short, long)]
        tenant: String,

        /// Database name (defaults to the tenant key)
        #[arg(short, long)]
        database: Option<String>,

        #[arg(short = 'C', long)]
        collection: String,

        /// Mongo-style JSON filter
        #[arg(short, long, default_value = "{}")]
        filter: String,

        #[arg(short, long)]
        limit: Option<u64>,

        /// Return only the first match
        #[arg(long)]
        one: bool,
    },

    /// Run an aggregation pipeline given as a JSON array of stages
    Aggregate {
        #[arg(short, long)]
        tenant: String,

        #[arg(short, long)]
        database: Option<String>,

        #[arg(short = 'C', long)]
        collection: String,

        #[arg(short, long)]
        pipeline: String,
    },

    /// Insert a JSON document, or each element of a JSON array
    Insert {
        #[arg(short, long)]
        tenant: String,

        #[arg(short, long)]
        database: Option<String>,

        #[arg(short = 'C', long)]
        collection: String,

        #[arg(long)]
        doc: String,
    },

    /// Count matching documents
    Count {
        #[arg(short, long)]
        tenant: String,

        #[arg(short, long)]
        database: Option<String>,

        #[arg(short = 'C', long)]
        collection: String,

        #[arg(short, long, default_value = "{}")]
        filter: String,
    },

    /// Delete documents past their TTL index expiry
    Reap {
        /// Databases to sweep in addition to the warm ones
        #[arg(short, long)]
        database: Vec<String>,
    },

    /// Work with distributed locks
    Lock {
        #[command(subcommand)]
        action: LockAction,
    },
}

#[derive(Subcommand)]
enum LockAction {
    /// Try to take a lock under the configured retry policy
    Acquire {
        #[arg(short, long)]
        tenant: String,

        #[arg(short, long)]
        key: String,

        #[arg(long)]
        token: String,

        /// Lock lifetime in milliseconds
        #[arg(long, default_value = "30000")]
        ttl_ms: u64,
    },

    /// Release a lock; with --token only while that token holds it
    Release {
        #[arg(short, long)]
        tenant: String,

        #[arg(short, long)]
        key: String,

        #[arg(long)]
        token: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let metrics = Arc::new(RecordingMetrics::new());

    match cli.command {
        Commands::Init { data_dir, force } => {
            let cwd = std::env::current_dir()?;
            let data_dir = data_dir.unwrap_or_else(|| config::default_data_dir_in(&cwd));
            config::ensure_data_dir(&data_dir)?;
            config::write_config(&cli.config, &TenantDbConfig::local(&data_dir), force)?;
            ui::success(&format!("Wrote {}", cli.config.display()));
            ui::status(Icons::DATABASE, "Data", &data_dir.display().to_string());
        }

        Commands::Check => {
            let (config, clients) = connect(&cli.config, &metrics).await?;
            check(&config, &clients);
        }

        Commands::Find { tenant, database, collection, filter, limit, one } => {
            let (_, clients) = connect(&cli.config, &metrics).await?;
            let db = database.unwrap_or_else(|| tenant.clone());
            let coll = clients.tenant_store().collection_in(&tenant, &db, &collection).await?;
            let filter = Filter::from_json(&serde_json::from_str(&filter)?)?;
            let mut options = FindOptions::new();
            if let Some(limit) = limit {
                options = options.limit(limit);
            }

            let (mut target, mode) = if one {
                (Value::Null, FindMode::One)
            } else {
                (Value::Array(Vec::new()), FindMode::All)
            };
            let found = coll.find_json(&mut target, mode, &filter, &options).await?;
            println!("{}", serde_json::to_string_pretty(&target)?);
            ui::summary_row("matched", &found.to_string());
        }

        Commands::Aggregate { tenant, database, collection, pipeline } => {
            let (_, clients) = connect(&cli.config, &metrics).await?;
            let db = database.unwrap_or_else(|| tenant.clone());
            let coll = clients.tenant_store().collection_in(&tenant, &db, &collection).await?;
            let pipeline: Vec<Value> = serde_json::from_str(&pipeline)?;
            let results: Vec<Value> = coll.aggregate(&pipeline).await?;
            println!("{}", serde_json::to_string_pretty(&results)?);
            ui::summary_row("results", &results.len().to_string());
        }

        Commands::Insert { tenant, database, collection, doc } => {
            let (_, clients) = connect(&cli.config, &metrics).await?;
            let db = database.unwrap_or_else(|| tenant.clone());
            let coll = clients.tenant_store().collection_in(&tenant, &db, &collection).await?;
            let ids = match serde_json::from_str::<Value>(&doc)? {
                Value::Array(docs) => coll.insert_many(&docs).await?,
                single => vec![coll.insert_one(&single).await?],
            };
            ui::success(&format!("Inserted {} document(s) into {}.{}", ids.len(), db, collection));
            for id in ids {
                ui::summary_row("_id", &id.to_string());
            }
        }

        Commands::Count { tenant, database, collection, filter } => {
            let (_, clients) = connect(&cli.config, &metrics).await?;
            let db = database.unwrap_or_else(|| tenant.clone());
            let coll = clients.tenant_store().collection_in(&tenant, &db, &collection).await?;
            let filter = Filter::from_json(&serde_json::from_str(&filter)?)?;
            println!("{}", coll.count(&filter).await?);
        }

        Commands::Reap { database } => {
            let (_, clients) = connect(&cli.config, &metrics).await?;
            ui::header("Purging expired documents");
            for (endpoint, handle) in clients.document_handles() {
                let mut names = handle.cached_databases();
                names.extend(database.iter().cloned());
                names.sort();
                names.dedup();
                for name in names {
                    let purged = handle.database(&name).await?.purge_expired().await?;
                    ui::status(Icons::DATABASE, &format!("{} {}", redact(&endpoint), name), &purged.to_string());
                }
            }
        }

        Commands::Lock { action } => {
            let (_, clients) = connect(&cli.config, &metrics).await?;
            match action {
                LockAction::Acquire { tenant, key, token, ttl_ms } => {
                    let mutex = clients.mutex(&tenant)?;
                    if mutex.acquire(&key, &token, Duration::from_millis(ttl_ms)).await? {
                        ui::success(&format!("{} held by {} for {}ms", key, token, ttl_ms));
                    } else {
                        ui::warn(&format!("{} is busy", key));
                        std::process::exit(1);
                    }
                }
                LockAction::Release { tenant, key, token } => {
                    let mutex = clients.mutex(&tenant)?;
                    match token {
                        Some(token) => {
                            if mutex.release_owned(&key, &token).await? {
                                ui::success(&format!("{} released", key));
                            } else {
                                ui::warn(&format!("{} is not held by {}", key, token));
                            }
                        }
                        None => {
                            mutex.release(&key).await?;
                            ui::success(&format!("{} released", key));
                        }
                    }
                }
            }
        }
    }

    if cli.verbose {
        ui::section("Operations");
        for (operation, calls, micros) in metrics.summary() {
            ui::summary_row(&operation, &format!("{} call(s), {}µs", calls, micros));
        }
    }

    Ok(())
}

async fn connect(path: &Path, metrics: &Arc<RecordingMetrics>) -> anyhow::Result<(TenantDbConfig, Clients)> {
    let Some(config) = config::load_config(Some(path))? else {
        anyhow::bail!("no config at {} (run `tenantdb init`)", path.display());
    };
    let clients = bootstrap::connect_all(&config).await?.with_metrics(metrics.clone());
    Ok((config, clients))
}

fn check(config: &TenantDbConfig, clients: &Clients) {
    ui::header("Tenantdb routing");

    ui::section("Document stores");
    for tenant in clients.documents.tenants() {
        if let Some(endpoint) = config.document.tenants.get(tenant) {
            ui::status(Icons::LINK, tenant, &redact(endpoint));
        }
    }
    match &config.document.default {
        Some(endpoint) => ui::status(Icons::LINK, "(default)", &redact(endpoint)),
        None => ui::info("(default)", "none"),
    }
    for (endpoint, handle) in clients.document_handles() {
        ui::summary_row(&redact(&endpoint), &handle.cached_databases().join(", "));
    }

    ui::section("Key-value stores");
    for tenant in clients.kv.tenants() {
        if let Some(endpoint) = config.kv.tenants.get(tenant) {
            ui::status(Icons::LINK, tenant, &redact(endpoint));
        }
    }
    match &config.kv.default {
        Some(endpoint) => ui::status(Icons::LINK, "(default)", &redact(endpoint)),
        None => ui::info("(default)", "none"),
    }

    let skipped: Vec<&str> = config
        .document
        .tenants
        .keys()
        .chain(config.kv.tenants.keys())
        .filter(|tenant| !config.admits(tenant))
        .map(String::as_str)
        .collect();
    if !skipped.is_empty() {
        ui::warn(&format!("Not in valid_projects: {}", skipped.join(", ")));
    }
    ui::success("All endpoints connected");
}
