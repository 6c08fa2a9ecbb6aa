#![cfg(feature = "sqlite")]

mod common;

use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use common::{User, open_users};
use sql_handle::prelude::*;
use tracing::Level;
use tracing_subscriber::fmt::writer::MakeWriter;

type TestResult = Result<(), Box<dyn std::error::Error>>;

/// Collects formatted log lines in memory.
#[derive(Clone, Default)]
struct Capture {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl Capture {
    fn lines(&self) -> Vec<String> {
        let buf = self.buf.lock().expect("capture lock");
        String::from_utf8_lossy(&buf)
            .lines()
            .map(str::to_owned)
            .collect()
    }

    fn statements(&self) -> Vec<String> {
        self.lines()
            .into_iter()
            .filter(|line| line.contains("statement"))
            .collect()
    }
}

struct CaptureGuard {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl<'a> MakeWriter<'a> for Capture {
    type Writer = CaptureGuard;

    fn make_writer(&'a self) -> Self::Writer {
        CaptureGuard {
            buf: Arc::clone(&self.buf),
        }
    }
}

impl Write for CaptureGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.lock().expect("capture lock").extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn capture_info() -> (Capture, tracing::subscriber::DefaultGuard) {
    let capture = Capture::default();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_ansi(false)
        .with_writer(capture.clone())
        .finish();
    let guard = tracing::subscriber::set_default(subscriber);
    (capture, guard)
}

#[tokio::test]
async fn exists_runs_a_single_statement() -> TestResult {
    let db = open_users("trace_exists").await?;
    let (capture, _guard) = capture_info();

    let found = db
        .debug()
        .exists(&User { id: 1, ..User::default() }, &[])
        .await?;
    assert!(found);

    let statements = capture.statements();
    assert_eq!(statements.len(), 1, "{statements:#?}");
    assert!(statements[0].contains("SELECT EXISTS("), "{}", statements[0]);
    assert!(statements[0].contains("rows=1"), "{}", statements[0]);
    Ok(())
}

#[tokio::test]
async fn exists_projects_every_column_over_chosen_columns() -> TestResult {
    let db = open_users("trace_exists_columns").await?;
    let (capture, _guard) = capture_info();

    let found = db
        .debug()
        .exists(&User { id: 1, ..User::default() }, &[columns(&["nickname"])])
        .await?;
    assert!(found);

    let statements = capture.statements();
    assert_eq!(statements.len(), 1, "{statements:#?}");
    assert!(statements[0].contains("SELECT EXISTS(SELECT * FROM"), "{}", statements[0]);
    assert!(!statements[0].contains("nickname"), "{}", statements[0]);
    Ok(())
}

#[tokio::test]
async fn statements_are_logged_only_in_debug_sessions() -> TestResult {
    let db = open_users("trace_debug").await?;
    let (capture, _guard) = capture_info();

    db.table("test_users").count(&[]).await?;
    assert!(capture.statements().is_empty(), "{:#?}", capture.lines());

    let loud = db.debug();
    let mut user = User::default();
    loud.find_one(&mut user, &[with_id(2)]).await?;
    let err = loud
        .model(&User { id: -1, ..User::default() })?
        .update("age", 3, &[])
        .await
        .unwrap_err();
    assert!(matches!(err, SqlHandleError::NoRowsAffected));
    let _ = loud.exec("select * from missing_table", &[]).await.unwrap_err();

    let statements = capture.statements();
    assert_eq!(statements.len(), 3, "{statements:#?}");
    assert!(statements[0].contains("LIMIT 1"));
    assert!(statements[1].contains("UPDATE"));
    assert!(statements[1].contains("rows=0"));
    assert!(statements[2].contains("statement failed"));
    assert!(statements[2].contains("missing_table"));
    Ok(())
}

#[tokio::test]
async fn debug_config_starts_a_logging_session() -> TestResult {
    let db = Handle::open(common::sqlite_config("trace_config").debug(true)).await?;
    assert!(db.is_debug());
    common::init_users(&db).await?;

    let (capture, _guard) = capture_info();
    let ctx = Context::background().with_span(tracing::info_span!("request", id = 7));
    db.with_context(ctx).table("test_users").count(&[]).await?;

    let statements = capture.statements();
    assert_eq!(statements.len(), 1, "{statements:#?}");
    assert!(statements[0].contains("request{id=7}"), "{}", statements[0]);
    Ok(())
}
