//! Atomic swap & rollback engine.
//!
//! Which physical database answers to a tenant's logical name is changed
//! only by `ALTER DATABASE .. RENAME`, never by copying data into the live
//! name. Every destructive path here either fully succeeds, fully reverts
//! via a compensating rename, or succeeds with the displaced state parked
//! under a quarantine name; the live name is never left unbound.

use crate::depsort;
use crate::error::{LifecycleError, Result};
use crate::introspect;
use crate::merge;
use crate::naming::{self, quote_ident};
use crate::registry::ConnectionRegistry;
use crate::snapshot::clone_database;
use chrono::{DateTime, TimeZone, Utc};
use clap::ValueEnum;
use std::collections::HashMap;
use tracing::{error, info, warn};

/// Boundary buffer subtracted from the snapshot timestamp when selecting
/// rows to salvage, so rows created in the same second as the snapshot are
/// not lost to clock granularity.
const SALVAGE_BUFFER_MS: i64 = 1000;

/// Rows inserted per reinjection statement.
const REINJECT_BATCH_SIZE: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RollbackMode {
    /// Restore the snapshot, discarding everything created since.
    Hard,
    /// Restore the snapshot, then re-inject rows whose `created_at` is
    /// newer than the snapshot.
    Smart,
}

/// Rows salvaged from the live database before a smart rollback, keyed by
/// table. In-memory only; consumed by reinjection and then discarded.
#[derive(Debug, Default)]
pub struct SalvagedDataSet {
    rows_by_table: HashMap<String, Vec<serde_json::Value>>,
}

impl SalvagedDataSet {
    pub fn is_empty(&self) -> bool {
        self.rows_by_table.values().all(Vec::is_empty)
    }

    pub fn row_count(&self) -> usize {
        self.rows_by_table.values().map(Vec::len).sum()
    }

    pub fn tables(&self) -> Vec<String> {
        let mut tables: Vec<String> = self
            .rows_by_table
            .iter()
            .filter(|(_, rows)| !rows.is_empty())
            .map(|(table, _)| table.clone())
            .collect();
        tables.sort();
        tables
    }

    pub fn rows(&self, table: &str) -> &[serde_json::Value] {
        self.rows_by_table
            .get(table)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn insert(&mut self, table: String, rows: Vec<serde_json::Value>) {
        self.rows_by_table.insert(table, rows);
    }
}

/// Disable new connections on `from`, terminate existing backends, rename,
/// then re-allow connections under the new name.
///
/// The disallow-then-terminate ordering closes the race where a new session
/// opens against the database between the terminate step and the rename.
pub async fn kill_and_rename(
    registry: &ConnectionRegistry,
    from: &str,
    to: &str,
) -> Result<()> {
    let maintenance = registry.maintenance().await?;
    let client = maintenance.get().await?;

    client
        .execute(
            &format!(
                "ALTER DATABASE {} WITH ALLOW_CONNECTIONS false",
                quote_ident(from)
            ),
            &[],
        )
        .await?;
    registry.terminate(from).await?;

    let renamed = client
        .execute(
            &format!(
                "ALTER DATABASE {} RENAME TO {}",
                quote_ident(from),
                quote_ident(to)
            ),
            &[],
        )
        .await;
    if let Err(e) = renamed {
        // Leave the database reachable under its old name before bailing.
        let reallow = client
            .execute(
                &format!(
                    "ALTER DATABASE {} WITH ALLOW_CONNECTIONS true",
                    quote_ident(from)
                ),
                &[],
            )
            .await;
        if let Err(reallow_err) = reallow {
            error!("failed to re-allow connections on {from} after rename failure: {reallow_err}");
        }
        return Err(e.into());
    }

    client
        .execute(
            &format!(
                "ALTER DATABASE {} WITH ALLOW_CONNECTIONS true",
                quote_ident(to)
            ),
            &[],
        )
        .await?;

    registry.invalidate(from).await;
    registry.invalidate(to).await;
    info!("renamed database {from} -> {to}");
    Ok(())
}

/// Promote `incoming_db` to the live name.
///
/// Renames live -> backup, then incoming -> live. If the second rename
/// fails, the backup is renamed back to live before the error propagates,
/// so exactly one database answers to the live name afterwards either way.
/// Returns the backup name holding the previous live content.
pub async fn perform_database_swap(
    registry: &ConnectionRegistry,
    live_db: &str,
    incoming_db: &str,
) -> Result<String> {
    for db in [live_db, incoming_db] {
        if !registry.database_exists(db).await? {
            return Err(LifecycleError::MissingDatabase {
                name: db.to_string(),
            });
        }
    }

    let backup = naming::snapshot_name(live_db, naming::now_millis());
    kill_and_rename(registry, live_db, &backup).await?;

    if let Err(e) = kill_and_rename(registry, incoming_db, live_db).await {
        warn!("promotion of {incoming_db} failed, renaming {backup} back to {live_db}");
        if let Err(compensate_err) = kill_and_rename(registry, &backup, live_db).await {
            // Both renames failed; the previous live content still exists
            // under the backup name.
            error!(
                "compensating rename {backup} -> {live_db} failed: {compensate_err}; \
                 previous live content remains under {backup}"
            );
        }
        return Err(LifecycleError::SwapReverted {
            live: live_db.to_string(),
            source: Box::new(e),
        });
    }

    registry.reload(live_db).await?;
    info!("promoted {incoming_db} to {live_db}, previous live kept as {backup}");
    Ok(backup)
}

/// Roll a live database back to a snapshot.
///
/// Hard mode: rename live -> quarantine, clone the snapshot into the live
/// name. Smart mode additionally salvages rows created after the snapshot's
/// embedded timestamp and re-injects them after the swap. Returns the
/// quarantine name holding the pre-rollback live content.
pub async fn rollback_to_snapshot(
    registry: &ConnectionRegistry,
    live_db: &str,
    snapshot_name: &str,
    mode: RollbackMode,
) -> Result<String> {
    if !registry.database_exists(snapshot_name).await? {
        return Err(LifecycleError::MissingDatabase {
            name: snapshot_name.to_string(),
        });
    }
    if !registry.database_exists(live_db).await? {
        return Err(LifecycleError::MissingDatabase {
            name: live_db.to_string(),
        });
    }

    let salvaged = match mode {
        RollbackMode::Hard => None,
        RollbackMode::Smart => {
            let snapshot_ms = naming::snapshot_timestamp_millis(snapshot_name).ok_or_else(|| {
                LifecycleError::precondition(format!(
                    "snapshot name {snapshot_name:?} does not carry a parseable \
                     timestamp; smart rollback needs one to decide which rows to salvage"
                ))
            })?;
            let cutoff = millis_to_datetime(snapshot_ms - SALVAGE_BUFFER_MS)?;
            let set = salvage_recent_rows(registry, live_db, cutoff).await?;
            info!(
                "salvaged {} row(s) across {} table(s) from {live_db}",
                set.row_count(),
                set.tables().len()
            );
            Some(set)
        }
    };

    let quarantine = naming::quarantine_name(live_db, naming::now_millis());
    kill_and_rename(registry, live_db, &quarantine).await?;

    if let Err(e) = clone_database(registry, snapshot_name, live_db).await {
        warn!("restore of {snapshot_name} failed, renaming {quarantine} back to {live_db}");
        if let Err(compensate_err) = kill_and_rename(registry, &quarantine, live_db).await {
            error!(
                "compensating rename {quarantine} -> {live_db} failed: {compensate_err}; \
                 previous live content remains under {quarantine}"
            );
        }
        return Err(LifecycleError::SwapReverted {
            live: live_db.to_string(),
            source: Box::new(e),
        });
    }

    registry.reload(live_db).await?;
    info!("restored {live_db} from {snapshot_name}, previous live kept as {quarantine}");

    if let Some(set) = salvaged {
        if !set.is_empty() {
            // A failure past this point must not undo the swap: the restored
            // snapshot is a consistent state, and the salvaged rows are still
            // present in the quarantine database.
            reinject_salvaged(registry, live_db, &set)
                .await
                .map_err(|e| LifecycleError::ReinjectionFailed {
                    quarantine: quarantine.clone(),
                    source: Box::new(e),
                })?;
        }
    }

    Ok(quarantine)
}

/// Collect rows created after `cutoff` from every table that carries a
/// `created_at` column.
pub async fn salvage_recent_rows(
    registry: &ConnectionRegistry,
    db_name: &str,
    cutoff: DateTime<Utc>,
) -> Result<SalvagedDataSet> {
    let pool = registry.get(db_name).await?;
    let client = pool.get().await?;
    let pg: &tokio_postgres::Client = &client;

    let mut set = SalvagedDataSet::default();
    for table in introspect::list_tables(pg).await? {
        if !introspect::has_column(pg, &table, "created_at").await? {
            continue;
        }
        let rows = pg
            .query(
                &format!(
                    "SELECT to_jsonb(t) FROM {} t WHERE t.created_at > $1",
                    quote_ident(&table)
                ),
                &[&cutoff],
            )
            .await?;
        if rows.is_empty() {
            continue;
        }
        let payload: Vec<serde_json::Value> = rows.iter().map(|row| row.get(0)).collect();
        info!("salvaging {} recent row(s) from {db_name}.{table}", payload.len());
        set.insert(table, payload);
    }
    Ok(set)
}

/// Re-inject salvaged rows into `target_db` inside one transaction, with
/// constraints suspended, tables visited in dependency order, and each row
/// inserted with `ON CONFLICT DO NOTHING` so rows already present in the
/// snapshot are not duplicated. Sequences are reset afterwards. Running the
/// reinjection twice yields the same final row set as running it once.
pub async fn reinject_salvaged(
    registry: &ConnectionRegistry,
    target_db: &str,
    set: &SalvagedDataSet,
) -> Result<u64> {
    let pool = registry.get(target_db).await?;
    let mut client = pool.get().await?;
    let txn = client.transaction().await?;
    let tx: &tokio_postgres::Transaction<'_> = &txn;

    // Scoped to the transaction; cannot leak onto the pooled connection.
    tx.batch_execute("SET LOCAL session_replication_role = replica")
        .await?;

    let tables = set.tables();
    let order = match introspect::foreign_key_edges(tx).await {
        Ok(edges) => depsort::dependency_order(&tables, &edges),
        Err(e) => {
            warn!("foreign-key introspection failed, reinjecting in name order: {e}");
            tables.clone()
        }
    };

    let mut inserted = 0u64;
    for table in &order {
        let rows = set.rows(table);
        let ident = quote_ident(table);
        let statement = format!(
            "INSERT INTO {ident} SELECT * FROM jsonb_populate_recordset(NULL::{ident}, $1) \
             ON CONFLICT DO NOTHING"
        );
        for batch in rows.chunks(REINJECT_BATCH_SIZE) {
            let payload = serde_json::Value::Array(batch.to_vec());
            inserted += tx.execute(&statement, &[&payload]).await?;
        }
    }

    merge::reset_sequences(tx).await?;
    txn.commit().await?;
    info!("re-injected {inserted} salvaged row(s) into {target_db}");
    Ok(inserted)
}

fn millis_to_datetime(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single().ok_or_else(|| {
        LifecycleError::precondition(format!("timestamp {ms} ms is out of range"))
    })
}
