use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::Dialect;

/// Where and how to connect.
///
/// Deserialises from a tagged object, e.g.
/// `{"dialect": "sqlite", "path": "app.db"}` or
/// `{"dialect": "postgres", "url": "host=localhost user=app dbname=app"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "dialect", rename_all = "lowercase")]
pub enum Connector {
    /// File-backed `SQLite` database.
    #[cfg(feature = "sqlite")]
    Sqlite { path: String },
    /// `PostgreSQL` connection string (URL or key/value form).
    #[cfg(feature = "postgres")]
    Postgres { url: String },
}

impl Connector {
    #[must_use]
    pub fn dialect(&self) -> Dialect {
        match self {
            #[cfg(feature = "sqlite")]
            Connector::Sqlite { .. } => Dialect::Sqlite,
            #[cfg(feature = "postgres")]
            Connector::Postgres { .. } => Dialect::Postgres,
        }
    }
}

/// Construction inputs for [`Handle::open`](crate::Handle::open).
///
/// Zero numeric values leave the pool default unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub connector: Connector,
    /// Connections kept warm in the pool.
    #[serde(default)]
    pub max_idle_conn: u32,
    /// Upper bound on pooled connections.
    #[serde(default)]
    pub max_open_conn: u32,
    /// Maximum connection lifetime in seconds.
    #[serde(default)]
    pub max_lifetime: i64,
    /// Start with a statement-logging session.
    #[serde(default)]
    pub debug: bool,
}

impl Config {
    #[must_use]
    pub fn new(connector: Connector) -> Self {
        Self {
            connector,
            max_idle_conn: 0,
            max_open_conn: 0,
            max_lifetime: 0,
            debug: false,
        }
    }

    #[must_use]
    pub fn max_idle_conn(mut self, max_idle_conn: u32) -> Self {
        self.max_idle_conn = max_idle_conn;
        self
    }

    #[must_use]
    pub fn max_open_conn(mut self, max_open_conn: u32) -> Self {
        self.max_open_conn = max_open_conn;
        self
    }

    #[must_use]
    pub fn max_lifetime(mut self, seconds: i64) -> Self {
        self.max_lifetime = seconds;
        self
    }

    #[must_use]
    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Apply the connection limits to a pool builder.
    pub(crate) fn pool_builder<M: bb8::ManageConnection>(&self) -> bb8::Builder<M> {
        let mut builder = bb8::Pool::builder();
        if self.max_open_conn > 0 {
            builder = builder.max_size(self.max_open_conn);
        }
        if self.max_idle_conn > 0 {
            let idle = match self.max_open_conn {
                0 => self.max_idle_conn,
                open => self.max_idle_conn.min(open),
            };
            builder = builder.min_idle(Some(idle));
        }
        if let Some(lifetime) = self.lifetime() {
            builder = builder.max_lifetime(Some(lifetime));
        }
        builder
    }

    fn lifetime(&self) -> Option<Duration> {
        u64::try_from(self.max_lifetime)
            .ok()
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

#[cfg(all(test, feature = "sqlite", feature = "postgres"))]
mod tests {
    use super::*;

    #[test]
    fn parses_tagged_connectors() {
        let cfg: Config = serde_json::from_str(
            r#"{"connector": {"dialect": "sqlite", "path": "app.db"}, "max_open_conn": 10, "debug": true}"#,
        )
        .unwrap();
        assert_eq!(
            cfg.connector,
            Connector::Sqlite {
                path: "app.db".into()
            }
        );
        assert_eq!(cfg.max_open_conn, 10);
        assert_eq!(cfg.max_idle_conn, 0);
        assert!(cfg.debug);

        let cfg: Config = serde_json::from_str(
            r#"{"connector": {"dialect": "postgres", "url": "postgres://u@localhost/db"}}"#,
        )
        .unwrap();
        assert_eq!(cfg.connector.dialect(), Dialect::Postgres);
        assert_eq!(cfg.max_lifetime, 0);
    }

    #[test]
    fn non_positive_lifetime_keeps_default() {
        let base = Config::new(Connector::Sqlite { path: "x".into() });
        assert_eq!(base.clone().max_lifetime(0).lifetime(), None);
        assert_eq!(base.clone().max_lifetime(-3).lifetime(), None);
        assert_eq!(
            base.max_lifetime(1000).lifetime(),
            Some(Duration::from_secs(1000))
        );
    }
}
