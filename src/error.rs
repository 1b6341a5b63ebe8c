//! Error taxonomy for the lifecycle engine.
//!
//! The distinction that matters operationally is *where a failure leaves the
//! tenant's live name*:
//!
//! - [`LifecycleError::Precondition`] - nothing was touched.
//! - [`LifecycleError::SwapReverted`] - a destructive step failed, but the
//!   compensating rename already ran; the live name still answers with the
//!   pre-operation content.
//! - [`LifecycleError::ReinjectionFailed`] - the restore itself succeeded and
//!   stands; only the post-swap salvage merge rolled back, and the salvaged
//!   rows remain recoverable from the named quarantine database.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, LifecycleError>;

#[derive(Debug, Error)]
pub enum LifecycleError {
    /// Rejected before any state change.
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// Database expected to exist did not.
    #[error("database {name:?} does not exist")]
    MissingDatabase { name: String },

    /// A rename/clone step failed mid-swap. The compensating rename has
    /// already restored the previous live database.
    #[error("swap of {live:?} failed and was reverted to the previous live database: {source}")]
    SwapReverted {
        live: String,
        #[source]
        source: Box<LifecycleError>,
    },

    /// Smart-rollback reinjection failed after the swap completed. The
    /// restored snapshot is live and consistent; rows created after the
    /// snapshot are still present in the quarantine database.
    #[error(
        "restore to snapshot succeeded but reinjecting post-snapshot rows failed; \
         the data remains recoverable in quarantine database {quarantine:?}: {source}"
    )]
    ReinjectionFailed {
        quarantine: String,
        #[source]
        source: Box<LifecycleError>,
    },

    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    #[error("failed to build connection pool for {db:?}: {source}")]
    PoolBuild {
        db: String,
        #[source]
        source: deadpool_postgres::BuildError,
    },
}

impl LifecycleError {
    pub fn precondition(msg: impl Into<String>) -> Self {
        LifecycleError::Precondition(msg.into())
    }
}
