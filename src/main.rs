//! Command-line interface for the tenant database lifecycle engine.
//!
//! # Usage Examples
//!
//! ```bash
//! # Snapshot a live database
//! tenantdb snapshot create acme_live
//!
//! # Promote a draft database to live
//! tenantdb swap --live acme_live --incoming acme_draft
//!
//! # Roll back to a snapshot, salvaging rows created since
//! tenantdb rollback --live acme_live \
//!   --snapshot acme_live_backup_1700000000000 --mode smart
//!
//! # Diff two databases and merge with per-table strategies
//! tenantdb diff --source acme_draft --target acme_live --json
//! tenantdb merge --source acme_draft --target acme_live \
//!   --strategy upsert --set audit_log=ignore --set sessions=overwrite
//! ```
//!
//! Connection options come from flags or `TENANTDB_PG_*` environment
//! variables; the configured user must be allowed to create, rename and
//! drop databases.

use anyhow::Context;
use clap::{Parser, Subcommand};
use tenantdb_lifecycle::{
    diff, merge, naming, snapshot, swap, ConnectOptions, ConnectionRegistry, MergeOptions,
    MergePlan, MergeStrategy, RollbackMode,
};

#[derive(Parser)]
#[command(name = "tenantdb")]
#[command(about = "Lifecycle engine for multi-tenant PostgreSQL project databases")]
#[command(long_about = None)]
struct Cli {
    #[command(flatten)]
    connect: ConnectOptions,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Prepare a fresh tenant database (roles and grants)
    InitSchema {
        /// Database name
        db: String,
    },

    /// Check whether a database exists
    Exists {
        /// Database name
        db: String,
    },

    /// Forcibly terminate all sessions on a database
    Terminate {
        /// Database name
        db: String,
    },

    /// Snapshot operations
    #[command(subcommand)]
    Snapshot(SnapshotCommands),

    /// Clone a database under a new name
    Clone {
        /// Source database
        from: String,
        /// New database name
        to: String,
    },

    /// Drop a database (idempotent)
    Drop {
        /// Database name
        db: String,
    },

    /// Truncate every public table in a database
    Truncate {
        /// Database name
        db: String,
    },

    /// Probabilistically delete rows to shrink a non-production copy
    Prune {
        /// Database name
        db: String,
        /// Percentage of rows to keep (0-100)
        #[arg(long, default_value = "10")]
        percent_to_keep: f64,
    },

    /// Re-grant the standard tenant roles on a database
    FixPermissions {
        /// Database name
        db: String,
    },

    /// Atomically promote a database to the live name
    Swap {
        /// Current live database name
        #[arg(long)]
        live: String,
        /// Database to promote
        #[arg(long)]
        incoming: String,
    },

    /// Roll a live database back to a snapshot
    Rollback {
        /// Live database name
        #[arg(long)]
        live: String,
        /// Snapshot database name
        #[arg(long)]
        snapshot: String,
        /// Rollback mode
        #[arg(long, value_enum, default_value = "hard")]
        mode: RollbackMode,
    },

    /// Compare primary-key sets between two databases, per table
    Diff {
        /// Source database
        #[arg(long)]
        source: String,
        /// Target database
        #[arg(long)]
        target: String,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Merge data from one database into another
    Merge {
        /// Source database
        #[arg(long)]
        source: String,
        /// Target database
        #[arg(long)]
        target: String,
        /// Restrict the merge to one table
        #[arg(long)]
        table: Option<String>,
        /// Global strategy for tables without a per-table entry
        #[arg(long, value_enum, default_value = "upsert")]
        strategy: MergeStrategy,
        /// Per-table strategy override (format: table=strategy, repeatable)
        #[arg(long = "set", value_name = "TABLE=STRATEGY")]
        overrides: Vec<String>,
        /// Rows per batch
        #[arg(long, default_value = "2000")]
        batch_size: usize,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum SnapshotCommands {
    /// Create a timestamped snapshot of a database
    Create {
        /// Database to snapshot
        db: String,
    },
    /// List snapshots of a database, newest first
    List {
        /// Live database name
        db: String,
    },
    /// Drop a snapshot
    Drop {
        /// Snapshot database name
        name: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = run().await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}

async fn run() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let registry = ConnectionRegistry::new(cli.connect.clone());

    match cli.command {
        Commands::InitSchema { db } => {
            snapshot::initialize_schema(&registry, &db)
                .await
                .with_context(|| format!("initializing schema of {db}"))?;
            println!("initialized {db}");
        }
        Commands::Exists { db } => {
            let exists = registry.database_exists(&db).await?;
            println!("{exists}");
            if !exists {
                std::process::exit(1);
            }
        }
        Commands::Terminate { db } => {
            registry.terminate(&db).await?;
            println!("terminated sessions on {db}");
        }
        Commands::Snapshot(cmd) => match cmd {
            SnapshotCommands::Create { db } => {
                let info = snapshot::create_timestamped_snapshot(&registry, &db)
                    .await
                    .with_context(|| format!("snapshotting {db}"))?;
                println!("{}", info.name);
            }
            SnapshotCommands::List { db } => {
                for info in snapshot::list_snapshots(&registry, &db).await? {
                    println!("{}\t{}", info.name, info.created_at_ms);
                }
            }
            SnapshotCommands::Drop { name } => {
                if naming::parse_snapshot_name(&name).is_none() {
                    anyhow::bail!("{name} is not a snapshot name; refusing to drop it");
                }
                snapshot::drop_database(&registry, &name).await?;
                println!("dropped {name}");
            }
        },
        Commands::Clone { from, to } => {
            snapshot::clone_database(&registry, &from, &to)
                .await
                .with_context(|| format!("cloning {from} into {to}"))?;
            println!("cloned {from} -> {to}");
        }
        Commands::Drop { db } => {
            snapshot::drop_database(&registry, &db).await?;
            println!("dropped {db}");
        }
        Commands::Truncate { db } => {
            snapshot::truncate_public_tables(&registry, &db).await?;
            println!("truncated {db}");
        }
        Commands::Prune { db, percent_to_keep } => {
            snapshot::prune_database(&registry, &db, percent_to_keep).await?;
            println!("pruned {db}");
        }
        Commands::FixPermissions { db } => {
            snapshot::fix_permissions(&registry, &db).await?;
            println!("fixed permissions on {db}");
        }
        Commands::Swap { live, incoming } => {
            let backup = swap::perform_database_swap(&registry, &live, &incoming)
                .await
                .with_context(|| format!("promoting {incoming} to {live}"))?;
            println!("{backup}");
        }
        Commands::Rollback { live, snapshot, mode } => {
            let quarantine = swap::rollback_to_snapshot(&registry, &live, &snapshot, mode)
                .await
                .with_context(|| format!("rolling {live} back to {snapshot}"))?;
            println!("{quarantine}");
        }
        Commands::Diff { source, target, json } => {
            let report = diff::generate_data_diff(&registry, &source, &target).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("table\tnew\tupdate\tmissing\tsource\ttarget");
                for summary in &report {
                    println!(
                        "{}\t{}\t{}\t{}\t{}\t{}",
                        summary.table,
                        summary.new_rows,
                        summary.update_rows,
                        summary.missing_rows,
                        summary.total_source,
                        summary.total_target
                    );
                }
            }
        }
        Commands::Merge {
            source,
            target,
            table,
            strategy,
            overrides,
            batch_size,
            json,
        } => {
            let mut plan = MergePlan::new(strategy);
            for entry in &overrides {
                let (table_name, strategy_name) = entry.split_once('=').ok_or_else(|| {
                    anyhow::anyhow!("invalid --set {entry:?}, expected table=strategy")
                })?;
                let parsed: MergeStrategy = strategy_name
                    .parse()
                    .map_err(|e: String| anyhow::anyhow!(e))?;
                plan.set(table_name, parsed);
            }
            let opts = MergeOptions {
                table,
                plan,
                batch_size,
            };
            let report = merge::merge_data(&registry, &source, &target, &opts)
                .await
                .with_context(|| format!("merging {source} into {target}"))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("table\trows\tstrategy\tdropped_columns");
                for entry in &report {
                    println!(
                        "{}\t{}\t{}\t{}",
                        entry.table,
                        entry.rows,
                        entry.strategy,
                        entry.dropped_columns.join(",")
                    );
                }
            }
        }
    }

    Ok(())
}
