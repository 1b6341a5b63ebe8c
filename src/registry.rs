//! Connection registry: one pooled connection set per physical database.
//!
//! The registry is the single owner of every pool the engine uses. All code
//! needing a connection goes through [`ConnectionRegistry::get`], never
//! constructs a pool independently, so that [`terminate`] and [`reload`]
//! stay authoritative over every live connection to a given database name.
//!
//! [`terminate`]: ConnectionRegistry::terminate
//! [`reload`]: ConnectionRegistry::reload

use crate::config::ConnectOptions;
use crate::error::{LifecycleError, Result};
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use std::collections::HashMap;
use tokio::sync::Mutex;
use tokio_postgres::NoTls;
use tracing::{debug, info};

pub struct ConnectionRegistry {
    options: ConnectOptions,
    pools: Mutex<HashMap<String, Pool>>,
}

impl ConnectionRegistry {
    pub fn new(options: ConnectOptions) -> Self {
        ConnectionRegistry {
            options,
            pools: Mutex::new(HashMap::new()),
        }
    }

    pub fn options(&self) -> &ConnectOptions {
        &self.options
    }

    /// Get the cached pool for a database, creating it lazily.
    pub async fn get(&self, db_name: &str) -> Result<Pool> {
        let mut pools = self.pools.lock().await;
        if let Some(pool) = pools.get(db_name) {
            return Ok(pool.clone());
        }
        let pool = self.build_pool(db_name)?;
        pools.insert(db_name.to_string(), pool.clone());
        debug!("created connection pool for database {db_name}");
        Ok(pool)
    }

    /// Pool for the maintenance database, through which all
    /// CREATE/RENAME/DROP DATABASE statements run. Those statements cannot
    /// be issued from a session connected to the database they target.
    pub async fn maintenance(&self) -> Result<Pool> {
        let db = self.options.maintenance_db.clone();
        self.get(&db).await
    }

    /// Forcibly end every other backend session on a database and dispose
    /// the cached pool.
    ///
    /// A rename or drop issued while sessions remain fails with "database is
    /// being accessed by other users"; that failure is deliberately fatal
    /// here rather than retried, to avoid proceeding into a destructive DDL
    /// step in an unknown state.
    pub async fn terminate(&self, db_name: &str) -> Result<()> {
        self.invalidate(db_name).await;
        let maintenance = self.maintenance().await?;
        let client = maintenance.get().await?;
        let terminated = client
            .query(
                "SELECT pg_terminate_backend(pid) FROM pg_stat_activity \
                 WHERE datname = $1 AND pid <> pg_backend_pid()",
                &[&db_name],
            )
            .await?;
        if !terminated.is_empty() {
            info!(
                "terminated {} backend session(s) on database {db_name}",
                terminated.len()
            );
        }
        Ok(())
    }

    /// Drop and recreate the cached pool, so that subsequent queries
    /// reconnect under the database's current identity. Used after renames.
    pub async fn reload(&self, db_name: &str) -> Result<Pool> {
        self.invalidate(db_name).await;
        self.get(db_name).await
    }

    /// Close and evict the cached pool without rebuilding it.
    pub async fn invalidate(&self, db_name: &str) {
        let mut pools = self.pools.lock().await;
        if let Some(pool) = pools.remove(db_name) {
            pool.close();
            debug!("closed connection pool for database {db_name}");
        }
    }

    /// Whether a database of this name exists in `pg_database`.
    pub async fn database_exists(&self, db_name: &str) -> Result<bool> {
        let maintenance = self.maintenance().await?;
        let client = maintenance.get().await?;
        let row = client
            .query_one(
                "SELECT EXISTS(SELECT 1 FROM pg_database WHERE datname = $1)",
                &[&db_name],
            )
            .await?;
        Ok(row.get(0))
    }

    fn build_pool(&self, db_name: &str) -> Result<Pool> {
        let manager = Manager::from_config(
            self.options.pg_config(db_name),
            NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );
        Pool::builder(manager)
            .max_size(self.options.pool_size)
            .build()
            .map_err(|source| LifecycleError::PoolBuild {
                db: db_name.to_string(),
                source,
            })
    }
}
