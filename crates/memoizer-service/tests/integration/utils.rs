use std::collections::HashSet;
use std::sync::Arc;

use futures::future::BoxFuture;
use memoizer_service::caching::Factory;
use memoizer_service::statements::{Session, SessionError};
use memoizer_test::{CallCounter, Gate};
use parking_lot::Mutex;

/// A resolved asset, as produced by [`AssetResolver`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Asset {
    pub name: String,
    pub revision: usize,
}

/// The error produced by [`AssetResolver`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Unavailable(pub String);

/// Resolves asset names to [`Asset`]s.
///
/// Every resolution waits for `gate`, and resolving a name in `unavailable` fails.
#[derive(Debug, Default)]
pub struct AssetResolver {
    pub gate: Gate,
    pub resolutions: CallCounter,
    pub unavailable: Mutex<HashSet<String>>,
}

impl AssetResolver {
    /// A resolver whose gate is already open.
    pub fn open() -> Self {
        let resolver = Self::default();
        resolver.gate.open();
        resolver
    }

    pub fn set_unavailable(&self, name: &str, unavailable: bool) {
        let mut names = self.unavailable.lock();
        if unavailable {
            names.insert(name.to_owned());
        } else {
            names.remove(name);
        }
    }
}

impl Factory for AssetResolver {
    type Key = String;
    type Value = Arc<Asset>;
    type Error = Unavailable;

    fn create<'a>(&'a self, name: String) -> BoxFuture<'a, Result<Arc<Asset>, Unavailable>> {
        Box::pin(async move {
            let revision = self.resolutions.increment();
            self.gate.wait().await;

            if self.unavailable.lock().contains(&name) {
                return Err(Unavailable(name));
            }
            Ok(Arc::new(Asset { name, revision }))
        })
    }
}

/// A session that prepares statements after a short delay.
///
/// Statements are identified by the number of the `prepare` call that produced them.
#[derive(Debug, Default)]
pub struct SlowSession {
    pub prepares: CallCounter,
    pub rejected: Mutex<HashSet<String>>,
}

#[async_trait::async_trait]
impl Session for SlowSession {
    type Statement = Arc<str>;

    async fn prepare(&self, query: &str) -> Result<Arc<str>, SessionError> {
        let id = self.prepares.increment();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        if self.rejected.lock().contains(query) {
            return Err(SessionError::new(format!("rejected `{query}`")));
        }
        Ok(format!("stmt-{id}").into())
    }
}
