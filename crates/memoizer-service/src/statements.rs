//! Memoization of prepared statements.
//!
//! Preparing a statement is a round-trip to the database that yields the same result every time
//! for the same query text. The [`PreparedStatementCache`] makes sure every distinct query is
//! prepared once per session, even when many requests need it at the same time, and tries again
//! if a preparation fails.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use thiserror::Error;

use crate::caching::{Factory, MemoizingCache};

/// An error reported by a database [`Session`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct SessionError {
    message: Arc<str>,
}

impl SessionError {
    /// Creates an error with the given message.
    pub fn new(message: impl Into<Arc<str>>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// The error message reported by the session.
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// An error preparing statements through a [`PreparedStatementCache`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StatementError {
    /// A batch of statements was requested without any queries.
    #[error("at least one query is required")]
    NoQueries,
    /// The session failed to prepare a statement.
    #[error("failed to prepare statement")]
    Session(#[from] SessionError),
}

/// A connection to a database that is able to prepare statements.
#[async_trait]
pub trait Session: Send + Sync + 'static {
    /// A handle to a prepared statement.
    type Statement: Clone + Send + Sync + 'static;

    /// Prepares `query` for execution.
    async fn prepare(&self, query: &str) -> Result<Self::Statement, SessionError>;
}

/// A [`Factory`] preparing statements against a [`Session`], keyed by query text.
pub struct StatementPreparer<S> {
    session: Arc<S>,
}

impl<S> StatementPreparer<S> {
    pub fn new(session: Arc<S>) -> Self {
        Self { session }
    }
}

impl<S> fmt::Debug for StatementPreparer<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatementPreparer").finish_non_exhaustive()
    }
}

impl<S: Session> Factory for StatementPreparer<S> {
    type Key = Arc<str>;
    type Value = S::Statement;
    type Error = SessionError;

    fn create<'a>(&'a self, query: Arc<str>) -> BoxFuture<'a, Result<S::Statement, SessionError>> {
        Box::pin(async move {
            tracing::debug!(%query, "preparing statement");
            let result = self.session.prepare(&query).await;
            if let Err(error) = &result {
                tracing::warn!(%query, %error, "failed to prepare statement");
            }
            result
        })
    }
}

/// Prepares statements at most once per distinct query.
pub struct PreparedStatementCache<S: Session> {
    session: Arc<S>,
    cache: MemoizingCache<StatementPreparer<S>>,
}

impl<S: Session> Clone for PreparedStatementCache<S> {
    fn clone(&self) -> Self {
        Self {
            session: Arc::clone(&self.session),
            cache: self.cache.clone(),
        }
    }
}

impl<S: Session> fmt::Debug for PreparedStatementCache<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreparedStatementCache")
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

impl<S: Session> PreparedStatementCache<S> {
    /// Creates an empty cache of statements prepared against `session`.
    pub fn new(session: Arc<S>) -> Self {
        let preparer = StatementPreparer::new(Arc::clone(&session));
        Self {
            session,
            cache: MemoizingCache::new("statements", preparer),
        }
    }

    /// The session statements are prepared against.
    pub fn session(&self) -> &S {
        &self.session
    }

    /// The underlying memoizing cache.
    pub fn cache(&self) -> &MemoizingCache<StatementPreparer<S>> {
        &self.cache
    }

    /// Returns the prepared statement for `query`, preparing it if necessary.
    pub async fn prepare(&self, query: impl Into<Arc<str>>) -> Result<S::Statement, StatementError> {
        Ok(self.cache.get_or_add(query.into()).await?)
    }

    /// Returns the prepared statements for all `queries`, in order.
    ///
    /// Fails with the first preparation error encountered. Statements that are still being
    /// prepared at that point continue in the background and are cached once done.
    pub async fn prepare_all<I, Q>(&self, queries: I) -> Result<Vec<S::Statement>, StatementError>
    where
        I: IntoIterator<Item = Q>,
        Q: Into<Arc<str>>,
    {
        let batch = self
            .cache
            .get_or_add_all(queries.into_iter().map(Into::into))
            .map_err(|_| StatementError::NoQueries)?;

        Ok(batch.await?)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use memoizer_test::CallCounter;
    use parking_lot::Mutex;

    use super::*;

    /// A session handing out numbered statements.
    ///
    /// Queries containing `BROKEN` fail to prepare until `repair` is called.
    #[derive(Default)]
    struct FakeSession {
        prepares: CallCounter,
        per_query: Mutex<HashMap<String, usize>>,
        repaired: Mutex<bool>,
    }

    impl FakeSession {
        fn repair(&self) {
            *self.repaired.lock() = true;
        }

        fn prepares_of(&self, query: &str) -> usize {
            self.per_query.lock().get(query).copied().unwrap_or_default()
        }
    }

    #[async_trait]
    impl Session for FakeSession {
        type Statement = usize;

        async fn prepare(&self, query: &str) -> Result<usize, SessionError> {
            let id = self.prepares.increment();
            *self.per_query.lock().entry(query.to_owned()).or_default() += 1;
            tokio::task::yield_now().await;

            if query.contains("BROKEN") && !*self.repaired.lock() {
                return Err(SessionError::new(format!("syntax error in `{query}`")));
            }
            Ok(id)
        }
    }

    #[tokio::test]
    async fn test_prepares_once() {
        memoizer_test::setup();
        let cache = PreparedStatementCache::new(Arc::new(FakeSession::default()));

        let query = "SELECT * FROM videos WHERE id = ?";
        let (a, b, c) = futures::join!(
            cache.prepare(query),
            cache.prepare(query),
            cache.prepare(query)
        );
        assert_eq!((a, b, c), (Ok(1), Ok(1), Ok(1)));
        assert_eq!(cache.prepare(query).await, Ok(1));

        assert_eq!(cache.session().prepares_of(query), 1);
        assert_eq!(cache.cache().len(), 1);
    }

    #[tokio::test]
    async fn test_retries_failed_preparation() {
        memoizer_test::setup();
        let cache = PreparedStatementCache::new(Arc::new(FakeSession::default()));

        let query = "SELECT BROKEN FROM videos";
        let err = cache.prepare(query).await.unwrap_err();
        assert_eq!(
            err,
            StatementError::Session(SessionError::new(
                "syntax error in `SELECT BROKEN FROM videos`"
            ))
        );

        cache.session().repair();
        assert_eq!(cache.prepare(query).await, Ok(2));
        assert_eq!(cache.session().prepares_of(query), 2);
    }

    #[tokio::test]
    async fn test_prepare_all() {
        memoizer_test::setup();
        let cache = PreparedStatementCache::new(Arc::new(FakeSession::default()));

        let first = cache.prepare("SELECT 1").await.unwrap();
        let statements = cache
            .prepare_all(["SELECT 2", "SELECT 1", "SELECT 2"])
            .await
            .unwrap();

        assert_eq!(statements[1], first);
        assert_eq!(statements[0], statements[2]);
        assert_eq!(cache.session().prepares.get(), 2);
    }

    #[tokio::test]
    async fn test_prepare_all_without_queries() {
        let cache = PreparedStatementCache::new(Arc::new(FakeSession::default()));

        let err = cache.prepare_all(Vec::<String>::new()).await.unwrap_err();
        assert_eq!(err, StatementError::NoQueries);
        assert_eq!(cache.session().prepares.get(), 0);
    }
}
