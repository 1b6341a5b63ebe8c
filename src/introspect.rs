//! Topology introspection over `information_schema` and `pg_catalog`.
//!
//! All helpers are generic over [`GenericClient`] so they run equally
//! against a pooled client and an open transaction.

use crate::error::Result;
use tokio_postgres::GenericClient;
use tracing::warn;

/// A foreign-key edge: `table` has a FK pointing into `references`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKeyEdge {
    pub table: String,
    pub references: String,
}

/// Ownership of a sequence by a table column, as recorded in `pg_depend`.
/// Covers any `serial`/`identity` column regardless of its name.
#[derive(Debug, Clone)]
pub struct SequenceOwner {
    pub sequence: String,
    pub table: String,
    pub column: String,
}

/// List public base tables, alphabetically.
pub async fn list_tables(client: &impl GenericClient) -> Result<Vec<String>> {
    let rows = client
        .query(
            "SELECT table_name FROM information_schema.tables \
             WHERE table_schema = 'public' AND table_type = 'BASE TABLE' \
             ORDER BY table_name",
            &[],
        )
        .await?;
    Ok(rows.iter().map(|row| row.get(0)).collect())
}

/// The single primary-key column of a table.
///
/// Tables with no primary key or a composite one fall back to the literal
/// `id`, which keeps diff and merge degrading per table instead of aborting.
pub async fn primary_key_column(client: &impl GenericClient, table: &str) -> String {
    // The parameter stays text-typed; binding $1 as regclass directly
    // would reject the &str on the client side before the query runs.
    let query = "SELECT a.attname \
                 FROM pg_index i \
                 JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey) \
                 WHERE i.indrelid = ($1::text)::regclass AND i.indisprimary \
                 ORDER BY array_position(i.indkey, a.attnum)";
    match client.query(query, &[&table]).await {
        Ok(rows) if rows.len() == 1 => rows[0].get(0),
        Ok(_) => "id".to_string(),
        Err(e) => {
            warn!("primary-key lookup for {table} failed, assuming \"id\": {e}");
            "id".to_string()
        }
    }
}

/// All foreign-key edges between public tables.
pub async fn foreign_key_edges(client: &impl GenericClient) -> Result<Vec<ForeignKeyEdge>> {
    let rows = client
        .query(
            "SELECT tc.table_name, ccu.table_name AS referenced_table \
             FROM information_schema.table_constraints tc \
             JOIN information_schema.key_column_usage kcu \
               ON tc.constraint_name = kcu.constraint_name \
              AND tc.table_schema = kcu.table_schema \
             JOIN information_schema.constraint_column_usage ccu \
               ON ccu.constraint_name = tc.constraint_name \
              AND ccu.table_schema = tc.table_schema \
             WHERE tc.constraint_type = 'FOREIGN KEY' \
               AND tc.table_schema = 'public'",
            &[],
        )
        .await?;
    Ok(rows
        .iter()
        .map(|row| ForeignKeyEdge {
            table: row.get(0),
            references: row.get(1),
        })
        .collect())
}

/// Whether a table has a column of the given name.
pub async fn has_column(
    client: &impl GenericClient,
    table: &str,
    column: &str,
) -> Result<bool> {
    let row = client
        .query_one(
            "SELECT EXISTS(SELECT 1 FROM information_schema.columns \
             WHERE table_schema = 'public' AND table_name = $1 AND column_name = $2)",
            &[&table, &column],
        )
        .await?;
    Ok(row.get(0))
}

/// Column names of a table, in ordinal order.
pub async fn table_columns(client: &impl GenericClient, table: &str) -> Result<Vec<String>> {
    let rows = client
        .query(
            "SELECT column_name FROM information_schema.columns \
             WHERE table_schema = 'public' AND table_name = $1 \
             ORDER BY ordinal_position",
            &[&table],
        )
        .await?;
    Ok(rows.iter().map(|row| row.get(0)).collect())
}

/// Every sequence in the public schema together with its owning table and
/// column, located through `pg_depend` auto-dependency entries.
pub async fn sequence_owners(client: &impl GenericClient) -> Result<Vec<SequenceOwner>> {
    let rows = client
        .query(
            "SELECT s.relname AS sequence, t.relname AS table, a.attname AS column \
             FROM pg_class s \
             JOIN pg_depend d ON d.objid = s.oid AND d.deptype = 'a' \
             JOIN pg_class t ON d.refobjid = t.oid \
             JOIN pg_attribute a ON a.attrelid = t.oid AND a.attnum = d.refobjsubid \
             WHERE s.relkind = 'S' \
               AND s.relnamespace = 'public'::regnamespace",
            &[],
        )
        .await?;
    Ok(rows
        .iter()
        .map(|row| SequenceOwner {
            sequence: row.get(0),
            table: row.get(1),
            column: row.get(2),
        })
        .collect())
}
