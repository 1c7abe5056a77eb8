//! Provider client cache.
//!
//! One client per credential location (`{namespace}/{credential}`), rebuilt
//! whenever the credential content hash changes so rotated tokens take
//! effect without a restart. Entries are reference counted by dependent
//! identity and evicted when the last dependent releases them. Targets
//! without a credential share the process-wide default client.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use rungrid_core::map_hash;
use rungrid_state::{Credential, StateStore};
use tracing::{debug, info};

use crate::error::{ProviderError, ProviderResult};
use crate::github::GithubClient;
use crate::provider::Provider;

/// Builds a provider client from credential content.
pub trait ProviderFactory: Send + Sync {
    fn build(&self, data: &BTreeMap<String, String>) -> ProviderResult<Arc<dyn Provider>>;
}

/// Builds [`GithubClient`]s from `token` and optional `api_url` keys.
pub struct GithubFactory {
    api_url: String,
}

impl GithubFactory {
    pub fn new(api_url: &str) -> Self {
        Self {
            api_url: api_url.to_string(),
        }
    }
}

impl ProviderFactory for GithubFactory {
    fn build(&self, data: &BTreeMap<String, String>) -> ProviderResult<Arc<dyn Provider>> {
        let token = data
            .get("token")
            .ok_or_else(|| ProviderError::Credential("credential has no `token` key".into()))?;
        let api_url = data.get("api_url").map_or(self.api_url.as_str(), String::as_str);
        Ok(Arc::new(GithubClient::new(api_url, token)?))
    }
}

struct CacheEntry {
    hash: String,
    client: Arc<dyn Provider>,
    dependents: HashSet<String>,
}

pub struct ClientCache {
    store: StateStore,
    factory: Arc<dyn ProviderFactory>,
    default: Option<Arc<dyn Provider>>,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl ClientCache {
    pub fn new(
        store: StateStore,
        factory: Arc<dyn ProviderFactory>,
        default: Option<Arc<dyn Provider>>,
    ) -> Self {
        Self {
            store,
            factory,
            default,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// The client used when no credential override is configured.
    pub fn default_client(&self) -> Option<Arc<dyn Provider>> {
        self.default.clone()
    }

    /// Client for `credential` in `namespace`, registering `dependent` as a
    /// user of the entry. `None` selects the default client.
    pub fn resolve(
        &self,
        namespace: &str,
        credential: Option<&str>,
        dependent: &str,
    ) -> ProviderResult<Arc<dyn Provider>> {
        let Some(name) = credential else {
            return self.default.clone().ok_or_else(|| {
                ProviderError::Credential("no credential configured and no default client".into())
            });
        };

        let cred: Credential = self.store.get(namespace, name)?.ok_or_else(|| {
            ProviderError::Credential(format!("credential {namespace}/{name} not found"))
        })?;
        let hash = map_hash(&cred.data);
        let location = format!("{namespace}/{name}");

        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(&location)
            && entry.hash == hash
        {
            entry.dependents.insert(dependent.to_string());
            return Ok(entry.client.clone());
        }

        let client = self.factory.build(&cred.data)?;
        let mut dependents = match entries.remove(&location) {
            Some(old) => {
                info!(%location, "credential content changed, client rebuilt");
                old.dependents
            }
            None => {
                debug!(%location, "client created");
                HashSet::new()
            }
        };
        dependents.insert(dependent.to_string());
        entries.insert(
            location,
            CacheEntry {
                hash,
                client: client.clone(),
                dependents,
            },
        );
        Ok(client)
    }

    /// Drop `dependent` from the entry; the entry is evicted once no
    /// dependents remain.
    pub fn release(&self, namespace: &str, credential: Option<&str>, dependent: &str) {
        let Some(name) = credential else {
            return;
        };
        let location = format!("{namespace}/{name}");
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(&location) else {
            return;
        };
        entry.dependents.remove(dependent);
        if entry.dependents.is_empty() {
            entries.remove(&location);
            debug!(%location, "client evicted");
        }
    }

    /// Number of cached credential clients.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use rungrid_state::ObjectMeta;

    use super::*;
    use crate::fake::FakeProvider;

    #[derive(Default)]
    struct CountingFactory {
        built: AtomicUsize,
    }

    impl ProviderFactory for CountingFactory {
        fn build(&self, data: &BTreeMap<String, String>) -> ProviderResult<Arc<dyn Provider>> {
            if !data.contains_key("token") {
                return Err(ProviderError::Credential("no token".into()));
            }
            self.built.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(FakeProvider::new()))
        }
    }

    fn put_credential(store: &StateStore, name: &str, token: &str) {
        let mut data = BTreeMap::new();
        data.insert("token".to_string(), token.to_string());
        match store.get::<Credential>("ci", name).unwrap() {
            Some(mut cred) => {
                cred.data = data;
                store.update(cred).unwrap();
            }
            None => {
                store
                    .create(Credential {
                        meta: ObjectMeta::new("ci", name),
                        data,
                    })
                    .unwrap();
            }
        }
    }

    fn cache_with(factory: Arc<CountingFactory>) -> (StateStore, ClientCache) {
        let store = StateStore::open_in_memory().unwrap();
        let default: Arc<dyn Provider> = Arc::new(FakeProvider::new());
        let cache = ClientCache::new(store.clone(), factory, Some(default));
        (store, cache)
    }

    #[test]
    fn reuses_client_while_content_is_unchanged() {
        let factory = Arc::new(CountingFactory::default());
        let (store, cache) = cache_with(factory.clone());
        put_credential(&store, "gh", "one");

        let a = cache.resolve("ci", Some("gh"), "ci/agent-1").unwrap();
        let b = cache.resolve("ci", Some("gh"), "ci/agent-2").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(factory.built.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn rotation_rebuilds_client() {
        let factory = Arc::new(CountingFactory::default());
        let (store, cache) = cache_with(factory.clone());
        put_credential(&store, "gh", "one");
        let a = cache.resolve("ci", Some("gh"), "ci/agent-1").unwrap();

        put_credential(&store, "gh", "two");
        let b = cache.resolve("ci", Some("gh"), "ci/agent-1").unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(factory.built.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn release_evicts_after_last_dependent() {
        let factory = Arc::new(CountingFactory::default());
        let (store, cache) = cache_with(factory);
        put_credential(&store, "gh", "one");
        cache.resolve("ci", Some("gh"), "ci/agent-1").unwrap();
        cache.resolve("ci", Some("gh"), "ci/agent-2").unwrap();

        cache.release("ci", Some("gh"), "ci/agent-1");
        assert_eq!(cache.len(), 1);
        cache.release("ci", Some("gh"), "ci/agent-2");
        assert!(cache.is_empty());
    }

    #[test]
    fn no_credential_uses_default() {
        let factory = Arc::new(CountingFactory::default());
        let (_store, cache) = cache_with(factory.clone());
        let client = cache.resolve("ci", None, "ci/agent-1").unwrap();
        assert!(Arc::ptr_eq(&client, &cache.default_client().unwrap()));
        assert_eq!(factory.built.load(Ordering::SeqCst), 0);
        assert!(cache.is_empty());
    }

    #[test]
    fn missing_credential_is_an_error() {
        let factory = Arc::new(CountingFactory::default());
        let (_store, cache) = cache_with(factory);
        let err = cache.resolve("ci", Some("nope"), "ci/agent-1").err().unwrap();
        assert!(matches!(err, ProviderError::Credential(_)));
    }

    #[test]
    fn github_factory_requires_token() {
        let factory = GithubFactory::new("https://api.github.com");
        assert!(factory.build(&BTreeMap::new()).is_err());

        let mut data = BTreeMap::new();
        data.insert("token".to_string(), "abc".to_string());
        assert!(factory.build(&data).is_ok());
    }
}
