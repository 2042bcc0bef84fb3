//! Test scaffolding: one PostgreSQL server per test binary, one
//! freshly-migrated throwaway database per test.
//!
//! When `AGENTCTL_TEST_PG_URL` points at a server (e.g. from a nextest
//! setup script) it is used directly; otherwise a testcontainers
//! instance starts on first use and lives for the rest of the process.
//! Database creation, connection and teardown all go through
//! `agentctl_db::pool`, so the tests exercise the same plumbing the
//! orchestrator uses.

use sqlx::PgPool;
use testcontainers::ContainerAsync;
use testcontainers::ImageExt;
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;
use uuid::Uuid;

use agentctl_db::config::DbConfig;
use agentctl_db::pool;

struct PgServer {
    /// Settings addressing the server's maintenance database; per-test
    /// databases are derived with [`DbConfig::with_database`].
    admin: DbConfig,
    /// Keeps the container running; `None` with an external server.
    _container: Option<ContainerAsync<Postgres>>,
}

static PG_SERVER: OnceCell<PgServer> = OnceCell::const_new();

async fn pg_server() -> &'static PgServer {
    PG_SERVER
        .get_or_init(|| async {
            if let Ok(url) = std::env::var("AGENTCTL_TEST_PG_URL") {
                let admin =
                    DbConfig::parse(&format!("{}/postgres", url.trim_end_matches('/')))
                        .expect("AGENTCTL_TEST_PG_URL must be a postgres server url");
                return PgServer {
                    admin,
                    _container: None,
                };
            }

            let container = Postgres::default()
                .with_tag("18")
                .start()
                .await
                .expect("failed to start PostgreSQL container");
            let host = container.get_host().await.expect("container host");
            let port = container
                .get_host_port_ipv4(5432)
                .await
                .expect("container port");

            let admin = DbConfig::parse(&format!(
                "postgresql://postgres:postgres@{host}:{port}/postgres"
            ))
            .expect("container url is well-formed");

            PgServer {
                admin,
                _container: Some(container),
            }
        })
        .await
}

/// A disposable database with migrations applied.
///
/// Create one per test and call [`TestDb::close`] at the end; the
/// database is dropped with force so stray connections cannot leak it.
pub struct TestDb {
    pool: PgPool,
    config: DbConfig,
}

impl TestDb {
    pub async fn new() -> Self {
        let server = pg_server().await;
        let config = server
            .admin
            .with_database(format!("agentctl_test_{}", Uuid::new_v4().simple()));

        pool::create_database(&config)
            .await
            .expect("test database should be creatable");
        let pool = pool::connect(&config)
            .await
            .expect("test database should accept connections");
        pool::run_migrations(&pool)
            .await
            .expect("migrations should apply");

        Self { pool, config }
    }

    /// The connection pool for this database.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// A pool handle for harnesses that keep their own clone.
    pub fn pool_owned(&self) -> PgPool {
        self.pool.clone()
    }

    /// Name of the throwaway database.
    pub fn name(&self) -> &str {
        self.config.database()
    }

    /// Close the pool and drop the database.
    pub async fn close(self) {
        self.pool.close().await;
        if let Err(e) = pool::drop_database(&self.config).await {
            eprintln!(
                "failed to drop test database {}: {e:#}",
                self.config.database()
            );
        }
    }
}
