//! Streaming merge engine.
//!
//! Copies rows table-by-table from a source database into a target under a
//! per-table strategy. Source rows stream through a server-side portal in
//! fixed-size batches and land as one parameterized insert per batch, so no
//! table is ever held in memory whole. The target transaction runs with
//! constraint checking suspended and tables visited in dependency order, so
//! foreign keys are satisfiable when checking resumes at commit.

use crate::depsort;
use crate::error::{LifecycleError, Result};
use crate::introspect;
use crate::naming::{quote_ident, quote_literal};
use crate::registry::ConnectionRegistry;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tokio_postgres::{GenericClient, Transaction};
use tracing::{debug, info, warn};

/// Default rows fetched per portal round trip and written per insert.
pub const DEFAULT_BATCH_SIZE: usize = 2000;

/// Per-table policy for combining source rows into the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Leave the target table untouched. The only strategy guaranteed to
    /// perform no write at all.
    Ignore,
    /// Insert rows whose primary key is absent from the target.
    #[value(alias = "missing_only")]
    Append,
    /// Insert new rows, update existing ones column-by-column.
    Upsert,
    /// Truncate the target table, then copy everything.
    Overwrite,
    /// Conflict handling identical to upsert; selected by diff-driven
    /// recommendations.
    #[value(name = "smart_sync")]
    SmartSync,
}

impl std::fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MergeStrategy::Ignore => "ignore",
            MergeStrategy::Append => "append",
            MergeStrategy::Upsert => "upsert",
            MergeStrategy::Overwrite => "overwrite",
            MergeStrategy::SmartSync => "smart_sync",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for MergeStrategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "ignore" => Ok(MergeStrategy::Ignore),
            "append" | "missing_only" => Ok(MergeStrategy::Append),
            "upsert" => Ok(MergeStrategy::Upsert),
            "overwrite" => Ok(MergeStrategy::Overwrite),
            "smart_sync" => Ok(MergeStrategy::SmartSync),
            other => Err(format!("unknown merge strategy {other:?}")),
        }
    }
}

/// Table-name → strategy mapping with a global fallback.
#[derive(Debug, Clone)]
pub struct MergePlan {
    default: MergeStrategy,
    per_table: HashMap<String, MergeStrategy>,
}

impl Default for MergePlan {
    fn default() -> Self {
        MergePlan::new(MergeStrategy::Upsert)
    }
}

impl MergePlan {
    pub fn new(default: MergeStrategy) -> Self {
        MergePlan {
            default,
            per_table: HashMap::new(),
        }
    }

    pub fn set(&mut self, table: impl Into<String>, strategy: MergeStrategy) {
        self.per_table.insert(table.into(), strategy);
    }

    pub fn with_table(mut self, table: impl Into<String>, strategy: MergeStrategy) -> Self {
        self.set(table, strategy);
        self
    }

    /// Effective strategy for a table: its own entry, else the global
    /// default.
    pub fn resolve(&self, table: &str) -> MergeStrategy {
        self.per_table.get(table).copied().unwrap_or(self.default)
    }
}

#[derive(Debug, Clone)]
pub struct MergeOptions {
    /// Restrict the merge to a single table.
    pub table: Option<String>,
    pub plan: MergePlan,
    pub batch_size: usize,
}

impl Default for MergeOptions {
    fn default() -> Self {
        MergeOptions {
            table: None,
            plan: MergePlan::default(),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

/// Outcome of merging one table.
#[derive(Debug, Clone, Serialize)]
pub struct TableMergeReport {
    pub table: String,
    pub rows: u64,
    pub strategy: MergeStrategy,
    /// Source columns absent from the target, excluded by intersection.
    /// Data in these columns did not move.
    pub dropped_columns: Vec<String>,
}

/// Merge `source_db` into `target_db`, owning the target transaction.
///
/// Commits on success; any failure rolls the whole merge back, leaving the
/// target as it was. Callers composing the merge into a larger atomic
/// operation use [`merge_into_transaction`] instead and keep commit/rollback
/// to themselves.
pub async fn merge_data(
    registry: &ConnectionRegistry,
    source_db: &str,
    target_db: &str,
    opts: &MergeOptions,
) -> Result<Vec<TableMergeReport>> {
    for db in [source_db, target_db] {
        if !registry.database_exists(db).await? {
            return Err(LifecycleError::MissingDatabase {
                name: db.to_string(),
            });
        }
    }

    let source_pool = registry.get(source_db).await?;
    let target_pool = registry.get(target_db).await?;
    let mut source = source_pool.get().await?;
    let mut target = target_pool.get().await?;

    let txn = target.transaction().await?;
    let reports = merge_into_transaction(&mut source, &txn, opts).await?;
    txn.commit().await?;

    let total: u64 = reports.iter().map(|r| r.rows).sum();
    info!("merged {total} row(s) from {source_db} into {target_db}");
    Ok(reports)
}

/// Merge into a caller-supplied target transaction. The transaction is not
/// committed here; dropping it without commit rolls every write back,
/// including the `SET LOCAL` that suspends constraints.
pub async fn merge_into_transaction(
    source: &mut tokio_postgres::Client,
    target: &Transaction<'_>,
    opts: &MergeOptions,
) -> Result<Vec<TableMergeReport>> {
    validate_batch_size(opts.batch_size)?;
    let source_txn = source.transaction().await?;

    let source_tables = introspect::list_tables(&source_txn).await?;
    let target_tables: HashSet<String> =
        introspect::list_tables(target).await?.into_iter().collect();

    let working_set: Vec<String> = match &opts.table {
        Some(table) => {
            if !source_tables.contains(table) {
                return Err(LifecycleError::precondition(format!(
                    "table {table:?} does not exist in the source database"
                )));
            }
            vec![table.clone()]
        }
        None => source_tables,
    };

    // Constraint checking stays off for the whole merge; the SET LOCAL is
    // transaction-scoped, so the suspended state ends with commit/rollback.
    target
        .batch_execute("SET LOCAL session_replication_role = replica")
        .await?;

    let ordered = match introspect::foreign_key_edges(target).await {
        Ok(edges) => depsort::dependency_order(&working_set, &edges),
        Err(e) => {
            warn!("foreign-key introspection failed, merging in source order: {e}");
            working_set.clone()
        }
    };

    let explicit_table = opts.table.is_some();
    let mut reports = Vec::with_capacity(ordered.len());
    for table in &ordered {
        let strategy = opts.plan.resolve(table);
        if strategy == MergeStrategy::Ignore {
            debug!("merge skipping {table} (strategy ignore)");
            reports.push(TableMergeReport {
                table: table.clone(),
                rows: 0,
                strategy,
                dropped_columns: Vec::new(),
            });
            continue;
        }

        if !target_tables.contains(table) {
            if explicit_table {
                return Err(LifecycleError::precondition(format!(
                    "table {table:?} does not exist in the target database"
                )));
            }
            warn!("merge skipping {table}: missing from target");
            continue;
        }

        let source_columns = introspect::table_columns(&source_txn, table).await?;
        let target_columns: HashSet<String> = introspect::table_columns(target, table)
            .await?
            .into_iter()
            .collect();
        let columns: Vec<String> = source_columns
            .iter()
            .filter(|c| target_columns.contains(*c))
            .cloned()
            .collect();
        let dropped_columns: Vec<String> = source_columns
            .iter()
            .filter(|c| !target_columns.contains(*c))
            .cloned()
            .collect();
        if columns.is_empty() {
            if explicit_table {
                return Err(LifecycleError::precondition(format!(
                    "tables {table:?} share no columns between source and target"
                )));
            }
            warn!("merge skipping {table}: no common columns");
            continue;
        }
        if !dropped_columns.is_empty() {
            warn!(
                "merge of {table} drops source column(s) absent from target: {}",
                dropped_columns.join(", ")
            );
        }

        let pk = introspect::primary_key_column(target, table).await;

        if strategy == MergeStrategy::Overwrite {
            target
                .execute(&format!("TRUNCATE {} CASCADE", quote_ident(table)), &[])
                .await?;
        }

        let rows = copy_table(
            &source_txn,
            target,
            table,
            &columns,
            &pk,
            strategy,
            opts.batch_size,
        )
        .await?;
        debug!("merged {rows} row(s) into {table} ({strategy})");

        reports.push(TableMergeReport {
            table: table.clone(),
            rows,
            strategy,
            dropped_columns,
        });
    }

    reset_sequences(target).await?;
    Ok(reports)
}

/// Portal fetch counts are `i32` on the wire, so an oversized batch size
/// would otherwise truncate silently.
fn validate_batch_size(batch_size: usize) -> Result<()> {
    if batch_size == 0 || batch_size > i32::MAX as usize {
        return Err(LifecycleError::precondition(format!(
            "batch_size must be within 1..={}, got {batch_size}",
            i32::MAX
        )));
    }
    Ok(())
}

/// Stream one table through a server-side portal and write it in batches.
async fn copy_table(
    source_txn: &Transaction<'_>,
    target: &Transaction<'_>,
    table: &str,
    columns: &[String],
    pk: &str,
    strategy: MergeStrategy,
    batch_size: usize,
) -> Result<u64> {
    let column_list = columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    let select = format!(
        "SELECT to_jsonb(t) FROM (SELECT {column_list} FROM {}) t",
        quote_ident(table)
    );
    let insert = build_insert_sql(table, columns, pk, strategy);

    let statement = source_txn.prepare(&select).await?;
    let portal = source_txn.bind(&statement, &[]).await?;

    let mut written = 0u64;
    loop {
        let rows = source_txn
            .query_portal(&portal, batch_size as i32)
            .await?;
        if rows.is_empty() {
            break;
        }
        let exhausted = rows.len() < batch_size;
        let payload = serde_json::Value::Array(
            rows.iter().map(|row| row.get::<_, serde_json::Value>(0)).collect(),
        );
        written += target.execute(&insert, &[&payload]).await?;
        if exhausted {
            break;
        }
    }
    Ok(written)
}

/// Build the batched insert for one table under a strategy. `$1` is a jsonb
/// array of row objects.
fn build_insert_sql(
    table: &str,
    columns: &[String],
    pk: &str,
    strategy: MergeStrategy,
) -> String {
    let ident = quote_ident(table);
    let column_list = columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    let base = format!(
        "INSERT INTO {ident} ({column_list}) \
         SELECT {column_list} FROM jsonb_populate_recordset(NULL::{ident}, $1)"
    );
    match strategy {
        MergeStrategy::Ignore | MergeStrategy::Overwrite => base,
        MergeStrategy::Append => {
            format!("{base} ON CONFLICT ({}) DO NOTHING", quote_ident(pk))
        }
        MergeStrategy::Upsert | MergeStrategy::SmartSync => {
            let updates: Vec<String> = columns
                .iter()
                .filter(|c| c.as_str() != pk)
                .map(|c| {
                    let c = quote_ident(c);
                    format!("{c} = EXCLUDED.{c}")
                })
                .collect();
            if updates.is_empty() {
                // Nothing but the key to update.
                format!("{base} ON CONFLICT ({}) DO NOTHING", quote_ident(pk))
            } else {
                format!(
                    "{base} ON CONFLICT ({}) DO UPDATE SET {}",
                    quote_ident(pk),
                    updates.join(", ")
                )
            }
        }
    }
}

/// Reset every sequence in the schema to follow the maximum value of its
/// owning column. Ownership comes from `pg_depend`, so any `serial` or
/// identity column is covered regardless of name.
pub async fn reset_sequences(client: &impl GenericClient) -> Result<usize> {
    let owners = introspect::sequence_owners(client).await?;
    for owner in &owners {
        client
            .execute(
                &format!(
                    "SELECT setval({}, COALESCE((SELECT MAX({}) FROM {}), 0) + 1, false)",
                    quote_literal(&quote_ident(&owner.sequence)),
                    quote_ident(&owner.column),
                    quote_ident(&owner.table)
                ),
                &[],
            )
            .await?;
        debug!(
            "reset sequence {} from {}.{}",
            owner.sequence, owner.table, owner.column
        );
    }
    Ok(owners.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn plan_per_table_entry_wins_over_default() {
        let plan = MergePlan::new(MergeStrategy::Append)
            .with_table("users", MergeStrategy::Overwrite);
        assert_eq!(plan.resolve("users"), MergeStrategy::Overwrite);
        assert_eq!(plan.resolve("posts"), MergeStrategy::Append);
    }

    #[test]
    fn plan_defaults_to_upsert() {
        let plan = MergePlan::default();
        assert_eq!(plan.resolve("anything"), MergeStrategy::Upsert);
    }

    #[test]
    fn strategy_parses_snake_case_and_alias() {
        assert_eq!("upsert".parse(), Ok(MergeStrategy::Upsert));
        assert_eq!("smart_sync".parse(), Ok(MergeStrategy::SmartSync));
        assert_eq!("missing_only".parse(), Ok(MergeStrategy::Append));
        assert!("replace".parse::<MergeStrategy>().is_err());
    }

    #[test]
    fn append_insert_does_nothing_on_conflict() {
        let sql = build_insert_sql("users", &cols(&["id", "name"]), "id", MergeStrategy::Append);
        assert!(sql.starts_with("INSERT INTO \"users\" (\"id\", \"name\")"));
        assert!(sql.ends_with("ON CONFLICT (\"id\") DO NOTHING"));
    }

    #[test]
    fn upsert_updates_every_non_key_column() {
        let sql = build_insert_sql(
            "users",
            &cols(&["id", "name", "email"]),
            "id",
            MergeStrategy::Upsert,
        );
        assert!(sql.contains(
            "ON CONFLICT (\"id\") DO UPDATE SET \"name\" = EXCLUDED.\"name\", \
             \"email\" = EXCLUDED.\"email\""
        ));
        assert!(!sql.contains("\"id\" = EXCLUDED"));
    }

    #[test]
    fn upsert_with_only_key_column_degrades_to_do_nothing() {
        let sql = build_insert_sql("joins", &cols(&["id"]), "id", MergeStrategy::Upsert);
        assert!(sql.ends_with("ON CONFLICT (\"id\") DO NOTHING"));
    }

    #[test]
    fn overwrite_insert_has_no_conflict_clause() {
        let sql = build_insert_sql("users", &cols(&["id", "name"]), "id", MergeStrategy::Overwrite);
        assert!(!sql.contains("ON CONFLICT"));
    }

    #[test]
    fn batch_size_outside_portal_range_is_rejected() {
        assert!(validate_batch_size(0).is_err());
        assert!(validate_batch_size(i32::MAX as usize + 1).is_err());
        assert!(validate_batch_size(1).is_ok());
        assert!(validate_batch_size(DEFAULT_BATCH_SIZE).is_ok());
        assert!(validate_batch_size(i32::MAX as usize).is_ok());
    }

    #[test]
    fn smart_sync_matches_upsert_conflict_handling() {
        let columns = cols(&["id", "name"]);
        assert_eq!(
            build_insert_sql("t", &columns, "id", MergeStrategy::SmartSync),
            build_insert_sql("t", &columns, "id", MergeStrategy::Upsert)
        );
    }
}
