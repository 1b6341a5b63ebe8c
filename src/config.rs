//! Connection configuration shared by the library and the CLI.

use clap::Parser;

/// PostgreSQL server connection options.
///
/// The engine connects to many physical databases on the same server; these
/// options cover everything except the database name, which every operation
/// supplies per call.
#[derive(Parser, Clone, Debug)]
pub struct ConnectOptions {
    /// PostgreSQL host
    #[arg(long, default_value = "localhost", env = "TENANTDB_PG_HOST")]
    pub pg_host: String,

    /// PostgreSQL port
    #[arg(long, default_value = "5432", env = "TENANTDB_PG_PORT")]
    pub pg_port: u16,

    /// PostgreSQL superuser (must be allowed to create, rename and drop databases)
    #[arg(long, default_value = "postgres", env = "TENANTDB_PG_USER")]
    pub pg_user: String,

    /// PostgreSQL password
    #[arg(long, default_value = "postgres", env = "TENANTDB_PG_PASSWORD")]
    pub pg_password: String,

    /// Maintenance database used for CREATE/RENAME/DROP DATABASE statements
    #[arg(long, default_value = "postgres", env = "TENANTDB_MAINTENANCE_DB")]
    pub maintenance_db: String,

    /// Maximum pooled connections per database
    #[arg(long, default_value = "8", env = "TENANTDB_POOL_SIZE")]
    pub pool_size: usize,
}

impl ConnectOptions {
    /// Build a `tokio_postgres::Config` for one physical database.
    pub fn pg_config(&self, db_name: &str) -> tokio_postgres::Config {
        let mut config = tokio_postgres::Config::new();
        config
            .host(&self.pg_host)
            .port(self.pg_port)
            .user(&self.pg_user)
            .password(&self.pg_password)
            .dbname(db_name);
        config
    }
}
