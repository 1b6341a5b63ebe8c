//! The database naming contract.
//!
//! A database's lifecycle role is encoded entirely in its name; there is no
//! metadata table. `<base>` is the live name, `<base>_backup_<unixMillis>` a
//! snapshot, `<base>_quarantine_<unixMillis>` the copy displaced by a
//! rollback or swap. Every component that lists or ages snapshots parses
//! this suffix.

use chrono::Utc;

pub const BACKUP_INFIX: &str = "_backup_";
pub const QUARANTINE_INFIX: &str = "_quarantine_";

/// A snapshot database, parsed from its name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotInfo {
    /// Full physical database name.
    pub name: String,
    /// The live name this snapshot was taken from.
    pub base: String,
    /// Snapshot creation time, Unix milliseconds.
    pub created_at_ms: i64,
}

pub fn snapshot_name(base: &str, unix_millis: i64) -> String {
    format!("{base}{BACKUP_INFIX}{unix_millis}")
}

pub fn quarantine_name(base: &str, unix_millis: i64) -> String {
    format!("{base}{QUARANTINE_INFIX}{unix_millis}")
}

pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Parse `<base>_backup_<ms>` into a [`SnapshotInfo`].
///
/// Returns `None` for names that do not carry a well-formed backup suffix,
/// so listings can ignore unrelated databases.
pub fn parse_snapshot_name(name: &str) -> Option<SnapshotInfo> {
    let (base, millis) = split_suffix(name, BACKUP_INFIX)?;
    Some(SnapshotInfo {
        name: name.to_string(),
        base: base.to_string(),
        created_at_ms: millis,
    })
}

/// Extract the embedded millisecond timestamp from a snapshot name.
pub fn snapshot_timestamp_millis(name: &str) -> Option<i64> {
    split_suffix(name, BACKUP_INFIX).map(|(_, ms)| ms)
}

fn split_suffix<'a>(name: &'a str, infix: &str) -> Option<(&'a str, i64)> {
    // The base name may itself contain the infix, so split on the last one.
    let idx = name.rfind(infix)?;
    let (base, rest) = name.split_at(idx);
    let millis: i64 = rest[infix.len()..].parse().ok()?;
    if base.is_empty() {
        return None;
    }
    Some((base, millis))
}

/// Quote an identifier for interpolation into DDL. Database and table names
/// cannot be bound as statement parameters.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Quote a string literal, for spots like `setval('"seq"', ..)` where a
/// regclass name travels inside a literal rather than a bound parameter.
pub fn quote_literal(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}
