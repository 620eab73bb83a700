use std::sync::Arc;

use memoizer_service::statements::{PreparedStatementCache, SessionError, StatementError};

use crate::SlowSession;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_prepares() {
    memoizer_test::setup();
    let cache = PreparedStatementCache::new(Arc::new(SlowSession::default()));

    let queries = [
        "SELECT * FROM videos WHERE id = ?",
        "SELECT * FROM users WHERE id = ?",
        "INSERT INTO comments (video_id, body) VALUES (?, ?)",
    ];

    let tasks: Vec<_> = (0..60)
        .map(|i| {
            let cache = cache.clone();
            let query = queries[i % queries.len()];
            tokio::spawn(async move { (query, cache.prepare(query).await.unwrap()) })
        })
        .collect();

    let mut prepared = std::collections::HashMap::new();
    for task in futures::future::join_all(tasks).await {
        let (query, statement) = task.unwrap();
        let known = prepared.entry(query).or_insert_with(|| statement.clone());
        assert_eq!(*known, statement);
    }

    assert_eq!(prepared.len(), 3);
    assert_eq!(cache.session().prepares.get(), 3);
}

#[tokio::test]
async fn test_prepare_all_reports_rejection() {
    memoizer_test::setup();
    let session = Arc::new(SlowSession::default());
    session
        .rejected
        .lock()
        .insert("DELETE FROM videos".to_owned());
    let cache = PreparedStatementCache::new(Arc::clone(&session));

    let err = cache
        .prepare_all(["SELECT 1", "DELETE FROM videos"])
        .await
        .unwrap_err();
    assert_eq!(
        err,
        StatementError::Session(SessionError::new("rejected `DELETE FROM videos`"))
    );
    insta::assert_snapshot!(err.to_string(), @"failed to prepare statement");

    session.rejected.lock().clear();
    let statements = cache
        .prepare_all(["SELECT 1", "DELETE FROM videos"])
        .await
        .unwrap();
    assert_eq!(statements.len(), 2);
    assert_eq!(session.prepares.get(), 3);
}
