#![cfg(feature = "sqlite")]

mod common;

use std::time::Duration;

use common::{User, open_users};
use sql_handle::prelude::*;

type TestResult = Result<(), Box<dyn std::error::Error>>;

async fn nickname(db: &Handle, id: i64) -> Result<String, SqlHandleError> {
    let mut user = User::default();
    db.find_one(&mut user, &[with_id(id)]).await?;
    Ok(user.nickname)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn commit_persists_every_statement() -> TestResult {
    let db = open_users("tx_commit").await?;
    let mut inserted = User {
        nickname: "hello tx insert".into(),
        age: 133,
        ..User::default()
    };

    let slot = &mut inserted;
    db.tx(move |tx| async move {
        assert!(tx.in_transaction());
        tx.model(&User { id: 1, ..User::default() })?
            .update("nickname", "hello tx", &[])
            .await?;
        tx.insert(slot, &[]).await?;
        Ok::<_, SqlHandleError>(())
    })
    .await?;

    assert!(!db.in_transaction());
    assert_eq!(nickname(&db, 1).await?, "hello tx");
    let mut found = User::default();
    db.find_one(&mut found, &[with_id(inserted.id)]).await?;
    assert_eq!(found, inserted);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn callback_error_rolls_back_and_is_returned() -> TestResult {
    let db = open_users("tx_rollback").await?;

    #[derive(Debug, PartialEq)]
    enum AppError {
        Db(String),
        Refused,
    }
    impl From<SqlHandleError> for AppError {
        fn from(err: SqlHandleError) -> Self {
            AppError::Db(err.to_string())
        }
    }

    let res: Result<(), AppError> = db
        .tx(|tx| async move {
            tx.model(&User { id: 1, ..User::default() })?
                .update("nickname", "never seen", &[])
                .await?;
            tx.insert(
                &mut User {
                    nickname: "never stored".into(),
                    ..User::default()
                },
                &[],
            )
            .await?;
            Err(AppError::Refused)
        })
        .await;
    assert_eq!(res, Err(AppError::Refused));

    assert_eq!(nickname(&db, 1).await?, "hello 0");
    assert_eq!(db.table("test_users").count(&[]).await?, 2);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn nested_scope_rolls_back_alone() -> TestResult {
    let db = open_users("tx_nested").await?;

    db.tx(|outer| async move {
        outer
            .model(&User { id: 1, ..User::default() })?
            .update("nickname", "outer", &[])
            .await?;

        let inner: Result<(), SqlHandleError> = outer
            .tx(|inner| async move {
                assert!(inner.in_transaction());
                inner
                    .model(&User { id: 2, ..User::default() })?
                    .update("nickname", "inner", &[])
                    .await?;
                Err(SqlHandleError::ExecutionError("abandon inner".into()))
            })
            .await;
        assert!(inner.is_err());

        // the outer scope still sees its own write and not the inner one
        assert_eq!(nickname(&outer, 1).await?, "outer");
        assert_eq!(nickname(&outer, 2).await?, "hello 1");

        outer
            .tx(|inner| async move {
                inner
                    .model(&User { id: 2, ..User::default() })?
                    .update("age", 42, &[])
                    .await?;
                Ok::<_, SqlHandleError>(())
            })
            .await?;
        Ok::<_, SqlHandleError>(())
    })
    .await?;

    let mut users: Vec<User> = Vec::new();
    db.find_many(&mut users, &[order_by("id")]).await?;
    assert_eq!(users[0].nickname, "outer");
    assert_eq!((users[1].nickname.as_str(), users[1].age), ("hello 1", 42));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scoped_handle_is_closed_after_finish() -> TestResult {
    let db = open_users("tx_closed").await?;
    let mut escaped: Option<Handle> = None;

    let slot = &mut escaped;
    db.tx(move |tx| async move {
        *slot = Some(tx.clone());
        Ok::<_, SqlHandleError>(())
    })
    .await?;

    let Some(stale) = escaped else {
        panic!("callback did not run");
    };
    let err = stale.table("test_users").count(&[]).await.unwrap_err();
    assert!(matches!(err, SqlHandleError::TransactionClosed), "{err}");

    // the pool itself is unaffected
    assert_eq!(db.table("test_users").count(&[]).await?, 2);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn insert_all_is_atomic() -> TestResult {
    let db = open_users("tx_insert_all").await?;
    let mut batch = vec![
        User {
            nickname: "first".into(),
            ..User::default()
        },
        User {
            id: 1,
            nickname: "clashes with seed".into(),
            age: 1,
        },
    ];
    assert!(db.insert_all(&mut batch, &[]).await.is_err());
    assert_eq!(db.table("test_users").count(&[]).await?, 2);

    let mut none: Vec<User> = Vec::new();
    db.find_many(&mut none, &[where_eq("nickname", "first")]).await?;
    assert!(none.is_empty());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unsupported_options_are_rejected() -> TestResult {
    let db = open_users("tx_options").await?;

    let res = db
        .tx_with(TxOptions::default().read_only(true), |_tx| async move {
            Ok::<_, SqlHandleError>(())
        })
        .await;
    assert!(matches!(res, Err(SqlHandleError::ConfigError(_))));

    let res = db
        .tx_with(
            TxOptions::default().isolation(IsolationLevel::ReadCommitted),
            |_tx| async move { Ok::<_, SqlHandleError>(()) },
        )
        .await;
    assert!(matches!(res, Err(SqlHandleError::ConfigError(_))));

    let ran = db
        .tx_with(
            TxOptions::default().isolation(IsolationLevel::Serializable),
            |tx| async move { tx.table("test_users").count(&[]).await },
        )
        .await?;
    assert_eq!(ran, 2);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelled_context_stops_work() -> TestResult {
    let db = open_users("tx_cancel").await?;
    let ctx = Context::background();
    ctx.cancel();
    let cancelled = db.with_context(ctx);

    let err = cancelled.table("test_users").count(&[]).await.unwrap_err();
    assert!(matches!(err, SqlHandleError::Cancelled));

    let res = cancelled
        .tx(|tx| async move {
            tx.exec("delete from test_users", &[]).await?;
            Ok::<_, SqlHandleError>(())
        })
        .await;
    assert!(matches!(res, Err(SqlHandleError::Cancelled)));
    assert_eq!(db.table("test_users").count(&[]).await?, 2);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn expired_deadline_is_reported() -> TestResult {
    let db = open_users("tx_deadline").await?;
    let ctx = Context::background().with_timeout(Duration::ZERO);
    tokio::time::sleep(Duration::from_millis(5)).await;

    let err = db
        .with_context(ctx)
        .table("test_users")
        .count(&[])
        .await
        .unwrap_err();
    assert!(matches!(err, SqlHandleError::DeadlineExceeded), "{err}");
    Ok(())
}
