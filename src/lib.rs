//! tenantdb-lifecycle
//!
//! Database lifecycle and migration engine for a multi-tenant PostgreSQL
//! control plane: one physical database per tenant project, with snapshots,
//! atomic promotion, rollback with data salvage, and strategy-driven merges
//! built from primitive Postgres operations (`CREATE DATABASE .. TEMPLATE`,
//! `ALTER DATABASE .. RENAME`).
//!
//! # Components
//!
//! - [`registry`] - one cached connection pool per physical database name
//! - [`introspect`] - tables, primary keys, foreign-key edges, sequences
//! - [`depsort`] - foreign-key dependency ordering for bulk writes
//! - [`snapshot`] - template-clone snapshots, truncate, prune, permissions
//! - [`swap`] - atomic rename-based promotion and hard/smart rollback
//! - [`diff`] - primary-key-set comparison between two databases
//! - [`merge`] - streaming per-table merge under configurable strategies
//!
//! # Required external invariant
//!
//! Operations targeting *different* tenant databases may run concurrently;
//! two concurrent operations on the *same* logical name can interleave
//! their terminate/rename steps and corrupt the swap guarantee. Callers
//! must serialize same-tenant operations (e.g. one in-flight operation per
//! project); this engine deliberately carries no internal lock so it stays
//! composable with callers that already serialize at a higher level.
//!
//! # Naming contract
//!
//! `<base>` answers live traffic; `<base>_backup_<unixMillis>` is a
//! snapshot; `<base>_quarantine_<unixMillis>` holds whatever a rollback or
//! failed promotion displaced, kept for forensic recovery.

pub mod config;
pub mod depsort;
pub mod diff;
pub mod error;
pub mod introspect;
pub mod merge;
pub mod naming;
pub mod registry;
pub mod snapshot;
pub mod swap;

pub use config::ConnectOptions;
pub use diff::DataDiffSummary;
pub use error::{LifecycleError, Result};
pub use introspect::ForeignKeyEdge;
pub use merge::{MergeOptions, MergePlan, MergeStrategy, TableMergeReport};
pub use naming::SnapshotInfo;
pub use registry::ConnectionRegistry;
pub use swap::{RollbackMode, SalvagedDataSet};
