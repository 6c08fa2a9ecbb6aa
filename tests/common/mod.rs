#![allow(dead_code)]

use serde::{Deserialize, Serialize};
use sql_handle::prelude::*;
#[cfg(feature = "sqlite")]
use tempfile::tempdir;

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub nickname: String,
    pub age: i64,
}

impl Record for User {
    const TABLE: &'static str = "test_users";
}

#[cfg(feature = "sqlite")]
pub fn unique_db_path(prefix: &str) -> String {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join(format!("{prefix}.db"));
    // keep the directory for the life of the test binary
    std::mem::forget(dir);
    path.to_string_lossy().into_owned()
}

#[cfg(feature = "sqlite")]
pub fn sqlite_config(prefix: &str) -> Config {
    sqlite_config_at(&unique_db_path(prefix))
}

#[cfg(feature = "sqlite")]
pub fn sqlite_config_at(path: &str) -> Config {
    Config::new(Connector::Sqlite { path: path.into() })
        .max_idle_conn(10)
        .max_open_conn(10)
        .max_lifetime(1000)
}

#[cfg(feature = "sqlite")]
/// Create `test_users` and seed "hello 0" / "hello 1".
pub async fn init_users(db: &Handle) -> Result<Vec<User>, SqlHandleError> {
    db.exec_batch(
        "CREATE TABLE test_users (
            id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
            nickname VARCHAR(64) NOT NULL,
            age INTEGER DEFAULT 0
        );",
    )
    .await?;
    let mut users: Vec<User> = (0..2)
        .map(|i| User {
            id: 0,
            nickname: format!("hello {i}"),
            age: i,
        })
        .collect();
    db.insert_all(&mut users, &[]).await?;
    Ok(users)
}

#[cfg(feature = "sqlite")]
pub async fn open_users(prefix: &str) -> Result<Handle, SqlHandleError> {
    let db = Handle::open(sqlite_config(prefix)).await?;
    init_users(&db).await?;
    Ok(db)
}
