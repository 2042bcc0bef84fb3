use std::env;

use thiserror::Error;

/// Errors from parsing a database URL.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DbConfigError {
    #[error("unsupported database url {0:?} (expected postgres:// or postgresql://)")]
    UnsupportedScheme(String),

    #[error("database url {0:?} is missing a database name")]
    MissingDatabase(String),
}

/// Connection settings for the orchestrator's PostgreSQL state store.
///
/// The URL is held split into the server root and the database name, so
/// the same settings can address the target database, the `postgres`
/// maintenance database (for `CREATE DATABASE` when the target does not
/// exist yet), or a sibling database on the same server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbConfig {
    /// Scheme, credentials, host and port; everything before the
    /// database path.
    server_root: String,
    /// Name of the database to address.
    database: String,
}

impl DbConfig {
    /// Environment variable the connection URL is read from.
    pub const ENV_VAR: &str = "AGENTCTL_DATABASE_URL";

    /// Split and validate a connection URL.
    pub fn parse(url: &str) -> Result<Self, DbConfigError> {
        let after_scheme = url
            .strip_prefix("postgresql://")
            .or_else(|| url.strip_prefix("postgres://"))
            .ok_or_else(|| DbConfigError::UnsupportedScheme(url.to_owned()))?;

        // The database name is the single path segment after the
        // authority.
        match after_scheme.split_once('/') {
            Some((_, database)) if !database.is_empty() && !database.contains('/') => {
                let split_at = url.len() - database.len() - 1;
                Ok(Self {
                    server_root: url[..split_at].to_owned(),
                    database: database.to_owned(),
                })
            }
            _ => Err(DbConfigError::MissingDatabase(url.to_owned())),
        }
    }

    /// Local development default: `postgresql://localhost:5432/agentctl`.
    pub fn default_local() -> Self {
        Self {
            server_root: "postgresql://localhost:5432".to_owned(),
            database: "agentctl".to_owned(),
        }
    }

    /// Read the URL from [`Self::ENV_VAR`], falling back to the local
    /// default when unset.
    pub fn from_env() -> Result<Self, DbConfigError> {
        match env::var(Self::ENV_VAR) {
            Ok(url) => Self::parse(&url),
            Err(_) => Ok(Self::default_local()),
        }
    }

    /// The full connection URL.
    pub fn url(&self) -> String {
        format!("{}/{}", self.server_root, self.database)
    }

    /// The database name.
    pub fn database(&self) -> &str {
        &self.database
    }

    /// The same server, addressed at the `postgres` maintenance database.
    pub fn maintenance(&self) -> Self {
        self.with_database("postgres")
    }

    /// The same server, addressed at another database.
    pub fn with_database(&self, database: impl Into<String>) -> Self {
        Self {
            server_root: self.server_root.clone(),
            database: database.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_splits_server_and_database() {
        let cfg = DbConfig::parse("postgresql://localhost:5432/agentctl").unwrap();
        assert_eq!(cfg.database(), "agentctl");
        assert_eq!(cfg.url(), "postgresql://localhost:5432/agentctl");
    }

    #[test]
    fn parse_accepts_short_scheme_and_credentials() {
        let cfg = DbConfig::parse("postgres://user:pw@db.internal:6432/state").unwrap();
        assert_eq!(cfg.database(), "state");
        assert_eq!(cfg.url(), "postgres://user:pw@db.internal:6432/state");
    }

    #[test]
    fn parse_rejects_other_schemes() {
        let err = DbConfig::parse("mysql://localhost/agentctl").unwrap_err();
        assert!(matches!(err, DbConfigError::UnsupportedScheme(_)));
    }

    #[test]
    fn parse_rejects_missing_database() {
        for url in [
            "postgresql://localhost:5432",
            "postgresql://localhost:5432/",
            "postgresql://localhost:5432/a/b",
        ] {
            let err = DbConfig::parse(url).unwrap_err();
            assert!(matches!(err, DbConfigError::MissingDatabase(_)), "url {url:?}");
        }
    }

    #[test]
    fn maintenance_addresses_postgres() {
        let cfg = DbConfig::parse("postgresql://localhost:5432/agentctl").unwrap();
        assert_eq!(
            cfg.maintenance().url(),
            "postgresql://localhost:5432/postgres"
        );
        // The original is untouched.
        assert_eq!(cfg.database(), "agentctl");
    }

    #[test]
    fn with_database_rebases_the_name() {
        let cfg = DbConfig::parse("postgresql://localhost:5432/agentctl").unwrap();
        let other = cfg.with_database("agentctl_test_1");
        assert_eq!(other.url(), "postgresql://localhost:5432/agentctl_test_1");
    }

    #[test]
    fn default_local_url() {
        assert_eq!(
            DbConfig::default_local().url(),
            "postgresql://localhost:5432/agentctl"
        );
    }
}
