use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;
use whispr_core::{ClientConfig, RpcClient};
use whispr_storage::Appstorage;

/// One explicit data model tying the RPC base URL to the on-disk storage
/// root, instead of wiring `RpcClient`/`Appstorage` by hand at every call
/// site.
#[derive(Clone, Debug)]
pub struct AppConfig {
    base_url: String,
    storage_root: PathBuf,
    request_timeout: Duration,
}

impl AppConfig {
    pub fn new(base_url: impl Into<String>, storage_root: impl Into<PathBuf>) -> Self {
        Self {
            base_url: base_url.into(),
            storage_root: storage_root.into(),
            request_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// Top-level handle bundling an [`RpcClient`] with per-prefix [`Appstorage`]
/// access, so a caller only needs one import to reach the client, server-side
/// persisted state, and search over it.
#[derive(Clone)]
pub struct App {
    pub client: Arc<RpcClient>,
    storage_root: PathBuf,
}

impl App {
    pub fn new(config: AppConfig) -> Self {
        let client_config = ClientConfig::new(config.base_url).with_timeout(config.request_timeout);
        Self {
            client: Arc::new(RpcClient::new(client_config)),
            storage_root: config.storage_root,
        }
    }

    /// Returns the process-wide storage namespace for `prefix`, rooted under
    /// this app's `storage_root`.
    pub fn storage<T>(&self, prefix: &str) -> Arc<Appstorage<T>>
    where
        T: Clone + PartialEq + Send + Sync + Serialize + DeserializeOwned + 'static,
    {
        Appstorage::for_prefix(self.storage_root.clone(), prefix)
    }

    /// Adds `data` under a fresh UUIDv4 key, for callers that don't carry a
    /// natural key of their own. Returns the generated key.
    pub fn add_generated<T>(&self, prefix: &str, data: T) -> String
    where
        T: Clone + PartialEq + Send + Sync + Serialize + DeserializeOwned + 'static,
    {
        let key = Uuid::new_v4().to_string();
        self.storage::<T>(prefix)
            .add(&key, data)
            .expect("freshly generated uuid key cannot already exist");
        key
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn add_generated_round_trips_through_storage() {
        let dir = tempfile::tempdir().unwrap();
        let app = App::new(AppConfig::new("http://localhost:0", dir.path()));
        let key = app.add_generated("notes", "hello".to_owned());
        let stored = app.storage::<String>("notes").get(&key).expect("just written");
        assert_eq!((stored.key, stored.data), (key, "hello".to_owned()));
    }
}
