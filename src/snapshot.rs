//! Snapshot & clone engine.
//!
//! Whole-database copies use Postgres template cloning, which is atomic and
//! crash-safe at the filesystem level; there is no row-by-row snapshot path.
//! Every destructive DDL statement is preceded by forcible termination of
//! the sessions that would otherwise block it.

use crate::error::{LifecycleError, Result};
use crate::introspect;
use crate::naming::{self, quote_ident, SnapshotInfo};
use crate::registry::ConnectionRegistry;
use tracing::{info, warn};

/// Create a snapshot of `source_db` under `snapshot_name`, replacing any
/// existing snapshot of the same name.
pub async fn create_snapshot(
    registry: &ConnectionRegistry,
    source_db: &str,
    snapshot_name: &str,
) -> Result<()> {
    if !registry.database_exists(source_db).await? {
        return Err(LifecycleError::MissingDatabase {
            name: source_db.to_string(),
        });
    }
    if registry.database_exists(snapshot_name).await? {
        warn!("snapshot {snapshot_name} already exists, replacing it");
        drop_database(registry, snapshot_name).await?;
    }
    clone_database(registry, source_db, snapshot_name).await?;
    info!("created snapshot {snapshot_name} of {source_db}");
    Ok(())
}

/// Create a snapshot named by the current time, returning its parsed info.
pub async fn create_timestamped_snapshot(
    registry: &ConnectionRegistry,
    source_db: &str,
) -> Result<SnapshotInfo> {
    let created_at_ms = naming::now_millis();
    let name = naming::snapshot_name(source_db, created_at_ms);
    create_snapshot(registry, source_db, &name).await?;
    Ok(SnapshotInfo {
        name,
        base: source_db.to_string(),
        created_at_ms,
    })
}

/// List the snapshots of a live database, newest first.
pub async fn list_snapshots(
    registry: &ConnectionRegistry,
    base: &str,
) -> Result<Vec<SnapshotInfo>> {
    let maintenance = registry.maintenance().await?;
    let client = maintenance.get().await?;
    let pattern = format!("{base}{}%", naming::BACKUP_INFIX);
    let rows = client
        .query(
            "SELECT datname FROM pg_database WHERE datname LIKE $1",
            &[&pattern],
        )
        .await?;
    let mut snapshots: Vec<SnapshotInfo> = rows
        .iter()
        .filter_map(|row| naming::parse_snapshot_name(row.get(0)))
        .filter(|info| info.base == base)
        .collect();
    snapshots.sort_by_key(|info| std::cmp::Reverse(info.created_at_ms));
    Ok(snapshots)
}

/// Clone `from_db` into a new database `to_db` via `CREATE DATABASE ..
/// TEMPLATE`. Terminates sessions on the source first; a template clone
/// requires the source to have no other connections.
pub async fn clone_database(
    registry: &ConnectionRegistry,
    from_db: &str,
    to_db: &str,
) -> Result<()> {
    registry.terminate(from_db).await?;
    let maintenance = registry.maintenance().await?;
    let client = maintenance.get().await?;
    client
        .execute(
            &format!(
                "CREATE DATABASE {} TEMPLATE {}",
                quote_ident(to_db),
                quote_ident(from_db)
            ),
            &[],
        )
        .await?;
    Ok(())
}

/// Drop a database, terminating its sessions first. Idempotent on a
/// non-existent database.
pub async fn drop_database(registry: &ConnectionRegistry, db_name: &str) -> Result<()> {
    registry.terminate(db_name).await?;
    let maintenance = registry.maintenance().await?;
    let client = maintenance.get().await?;
    client
        .execute(
            &format!("DROP DATABASE IF EXISTS {}", quote_ident(db_name)),
            &[],
        )
        .await?;
    Ok(())
}

/// Truncate every public base table in one transaction, cascading.
pub async fn truncate_public_tables(
    registry: &ConnectionRegistry,
    db_name: &str,
) -> Result<()> {
    let pool = registry.get(db_name).await?;
    let mut client = pool.get().await?;
    let txn = client.transaction().await?;
    let tables = {
        let tx: &tokio_postgres::Transaction<'_> = &txn;
        introspect::list_tables(tx).await?
    };
    if tables.is_empty() {
        txn.commit().await?;
        return Ok(());
    }
    let list = tables
        .iter()
        .map(|t| quote_ident(t))
        .collect::<Vec<_>>()
        .join(", ");
    txn.execute(&format!("TRUNCATE {list} CASCADE"), &[]).await?;
    txn.commit().await?;
    info!("truncated {} table(s) in {db_name}", tables.len());
    Ok(())
}

/// Probabilistically delete rows from every table so that roughly
/// `percent_to_keep` percent survive, then reclaim the space. Used to
/// produce smaller non-production copies.
pub async fn prune_database(
    registry: &ConnectionRegistry,
    db_name: &str,
    percent_to_keep: f64,
) -> Result<()> {
    if !(0.0..=100.0).contains(&percent_to_keep) {
        return Err(LifecycleError::precondition(format!(
            "percent_to_keep must be within 0..=100, got {percent_to_keep}"
        )));
    }
    let delete_chance = 1.0 - percent_to_keep / 100.0;
    let pool = registry.get(db_name).await?;
    let client = pool.get().await?;
    let pg: &tokio_postgres::Client = &client;
    let tables = introspect::list_tables(pg).await?;

    // Constraint checking stays off for the whole pass; the deletes are
    // random per table, so FK pairs can vanish in either order.
    client
        .batch_execute("SET session_replication_role = replica")
        .await?;
    let mut result: Result<()> = Ok(());
    for table in &tables {
        let deleted = client
            .execute(
                &format!(
                    "DELETE FROM {} WHERE random() < $1",
                    quote_ident(table)
                ),
                &[&delete_chance],
            )
            .await;
        match deleted {
            Ok(n) => info!("pruned {n} row(s) from {db_name}.{table}"),
            Err(e) => {
                result = Err(e.into());
                break;
            }
        }
    }
    // Reset the session GUC before the connection returns to the pool,
    // whatever happened above. If the reset itself fails the connection
    // must not be recycled with the replica role still set, and a delete
    // error, when there is one, is the root cause worth reporting.
    if let Err(reset_err) = client
        .batch_execute("SET session_replication_role = origin")
        .await
    {
        warn!("failed to reset session_replication_role on {db_name}, discarding its pool: {reset_err}");
        registry.invalidate(db_name).await;
        return result.and(Err(reset_err.into()));
    }
    result?;

    client.batch_execute("VACUUM FULL").await?;
    info!("pruned {db_name} to ~{percent_to_keep}% of rows");
    Ok(())
}

/// Standard tenant roles re-granted by [`fix_permissions`].
pub const TENANT_ROLES: [&str; 3] = ["anon", "authenticated", "service_role"];

/// Idempotently re-grant the standard roles on everything in `public`.
/// Required after any clone or truncate; privilege grants are not
/// guaranteed to survive every DDL path identically.
pub async fn fix_permissions(registry: &ConnectionRegistry, db_name: &str) -> Result<()> {
    let pool = registry.get(db_name).await?;
    let client = pool.get().await?;
    let roles = TENANT_ROLES.join(", ");
    let grants = format!(
        "GRANT USAGE ON SCHEMA public TO {roles};\n\
         GRANT ALL ON ALL TABLES IN SCHEMA public TO {roles};\n\
         GRANT ALL ON ALL SEQUENCES IN SCHEMA public TO {roles};\n\
         GRANT ALL ON ALL FUNCTIONS IN SCHEMA public TO {roles};\n\
         ALTER DEFAULT PRIVILEGES IN SCHEMA public GRANT ALL ON TABLES TO {roles};\n\
         ALTER DEFAULT PRIVILEGES IN SCHEMA public GRANT ALL ON SEQUENCES TO {roles};\n\
         ALTER DEFAULT PRIVILEGES IN SCHEMA public GRANT ALL ON FUNCTIONS TO {roles};"
    );
    client.batch_execute(&grants).await?;
    info!("re-granted standard roles on {db_name}");
    Ok(())
}

/// Prepare a fresh tenant database: ensure the standard roles exist on the
/// cluster, then apply the grants.
pub async fn initialize_schema(registry: &ConnectionRegistry, db_name: &str) -> Result<()> {
    if !registry.database_exists(db_name).await? {
        return Err(LifecycleError::MissingDatabase {
            name: db_name.to_string(),
        });
    }
    let maintenance = registry.maintenance().await?;
    let client = maintenance.get().await?;
    for role in TENANT_ROLES {
        let exists: bool = client
            .query_one(
                "SELECT EXISTS(SELECT 1 FROM pg_roles WHERE rolname = $1)",
                &[&role],
            )
            .await?
            .get(0);
        if !exists {
            client
                .execute(&format!("CREATE ROLE {} NOLOGIN", quote_ident(role)), &[])
                .await?;
            info!("created role {role}");
        }
    }
    fix_permissions(registry, db_name).await
}
