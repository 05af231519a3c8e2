//! Request coalescing and caching of rendering results.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use flight_core::{ClientConfig, FlightError, FlightKey, FlightTree};

use crate::{render_request, FlightHandle, FlightTransport};

struct CacheInner {
    transport: Arc<dyn FlightTransport>,
    config: ClientConfig,
    entries: Mutex<HashMap<FlightKey, FlightHandle>>,
    active: Mutex<Option<FlightKey>>,
}

/// Client-side cache of rendering requests keyed by `FlightKey`.
///
/// At most one network call is outstanding per key. Failed entries are
/// evicted so a later `request` retries.
#[derive(Clone)]
pub struct ClientFlightCache {
    inner: Arc<CacheInner>,
}

impl ClientFlightCache {
    pub fn new(transport: Arc<dyn FlightTransport>, config: ClientConfig) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                transport,
                config,
                entries: Mutex::new(HashMap::new()),
                active: Mutex::new(None),
            }),
        }
    }

    /// Handle for `(component_id, props)`, fetching it on first use.
    ///
    /// Repeated calls return the same handle until the entry is evicted.
    /// The requested key becomes the active one. Must be called within a
    /// tokio runtime.
    pub fn request(&self, component_id: &str, props: &str) -> FlightHandle {
        let key = FlightKey::new(component_id, props);
        self.set_active(Some(key.clone()));

        let handle = {
            let mut entries = self.entries();
            if let Some(existing) = entries.get(&key) {
                tracing::trace!(key = %key, "flight cache hit");
                return existing.clone();
            }
            let handle = FlightHandle::new(key.clone());
            entries.insert(key, handle.clone());
            handle
        };

        tracing::debug!(key = %handle.key(), "flight cache miss, fetching");
        tokio::spawn(fetch(self.clone(), handle.clone()));
        handle
    }

    /// Cached handle for `key`, if any.
    pub fn get(&self, key: &FlightKey) -> Option<FlightHandle> {
        self.entries().get(key).cloned()
    }

    /// Drop the entry for `key`. Returns whether one existed.
    pub fn invalidate(&self, key: &FlightKey) -> bool {
        self.entries().remove(key).is_some()
    }

    /// Apply a fresh render pushed by a server action.
    ///
    /// The update is discarded unless `key` is still the active identity
    /// and has an entry.
    pub fn push_update(&self, key: &FlightKey, tree: FlightTree) -> bool {
        if self.active().as_ref() != Some(key) {
            tracing::debug!(key = %key, "stale push update discarded");
            return false;
        }

        let Some(handle) = self.get(key) else {
            tracing::debug!(key = %key, "push update without a cache entry discarded");
            return false;
        };
        handle.apply_update(tree);
        tracing::debug!(key = %key, "push update applied");
        true
    }

    /// Set the identity currently displayed.
    pub fn set_active(&self, key: Option<FlightKey>) {
        *self.inner.active.lock().unwrap_or_else(PoisonError::into_inner) = key;
    }

    /// Identity currently displayed.
    pub fn active(&self) -> Option<FlightKey> {
        self.inner
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    pub fn transport(&self) -> &Arc<dyn FlightTransport> {
        &self.inner.transport
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<FlightKey, FlightHandle>> {
        self.inner.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Remove `handle` unless its entry was already replaced.
    fn evict(&self, handle: &FlightHandle) {
        let mut entries = self.entries();
        if entries.get(handle.key()).is_some_and(|current| current.ptr_eq(handle)) {
            entries.remove(handle.key());
        }
    }
}

impl std::fmt::Debug for ClientFlightCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientFlightCache")
            .field("config", &self.inner.config)
            .field("entries", &self.len())
            .field("active", &self.active())
            .finish()
    }
}

async fn fetch(cache: ClientFlightCache, handle: FlightHandle) {
    let result = async {
        let request = render_request(&cache.config().base_path, handle.key())?;
        let response = cache.transport().send(request).await?;
        let body = response.into_payload().await?;
        handle.consume(body).await
    }
    .await;

    if let Err(err) = result {
        if handle.is_superseded() {
            tracing::debug!(key = %handle.key(), error = %err, "superseded fetch failed, keeping pushed update");
            return;
        }
        tracing::warn!(key = %handle.key(), error = %err, "flight request failed, evicting entry");
        cache.evict(&handle);
        handle.fail(err);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{FlightResponse, Phase};
    use async_trait::async_trait;
    use flight_core::{encode_row, ErrorKind, Row, SerializedError, ROOT_ROW};
    use http::{Request, StatusCode};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Answers every request with the same response, counting calls.
    pub(crate) struct CannedTransport {
        pub(crate) calls: AtomicUsize,
        pub(crate) uris: Mutex<Vec<String>>,
        response: Box<dyn Fn() -> Result<FlightResponse, FlightError> + Send + Sync>,
    }

    impl CannedTransport {
        pub(crate) fn new(
            response: impl Fn() -> Result<FlightResponse, FlightError> + Send + Sync + 'static,
        ) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                uris: Mutex::new(Vec::new()),
                response: Box::new(response),
            })
        }

        pub(crate) fn payload(bytes: Vec<u8>) -> Arc<Self> {
            Self::new(move || Ok(FlightResponse::from_bytes(StatusCode::OK, bytes.clone())))
        }

        pub(crate) fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl FlightTransport for CannedTransport {
        async fn send(&self, request: Request<Vec<u8>>) -> Result<FlightResponse, FlightError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.uris.lock().unwrap().push(request.uri().to_string());
            (self.response)()
        }
    }

    fn root_payload(value: serde_json::Value) -> Vec<u8> {
        encode_row(&Row::model(ROOT_ROW, value)).unwrap()
    }

    #[tokio::test]
    async fn test_repeated_request_shares_one_fetch() {
        let transport = CannedTransport::payload(root_payload(json!("page")));
        let cache = ClientFlightCache::new(transport.clone(), ClientConfig::default());

        let first = cache.request("Page", r#"{"id":1}"#);
        let second = cache.request("Page", r#"{"id":1}"#);
        assert!(first.ptr_eq(&second));

        assert_eq!(first.root().await.unwrap(), json!("page"));
        assert_eq!(transport.calls(), 1);
        assert_eq!(
            transport.uris.lock().unwrap()[0],
            "/rw-rsc/Page?props=%7B%22id%22%3A1%7D"
        );
    }

    #[tokio::test]
    async fn test_entries_keyed_by_component_and_props() {
        let transport = CannedTransport::payload(root_payload(json!(null)));
        let cache = ClientFlightCache::new(transport.clone(), ClientConfig::default());

        let page = cache.request("Page", "{}");
        let sidebar = cache.request("Sidebar", "{}");
        assert!(!page.ptr_eq(&sidebar));
        assert_eq!(cache.len(), 2);

        page.complete().await.unwrap();
        sidebar.complete().await.unwrap();
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn test_transport_failure_evicts_entry() {
        let transport = CannedTransport::new(|| Err(FlightError::Transport("connection refused".into())));
        let cache = ClientFlightCache::new(transport.clone(), ClientConfig::default());

        let handle = cache.request("Page", "{}");
        assert!(matches!(handle.root().await, Err(FlightError::Transport(_))));
        assert!(cache.is_empty());

        let retry = cache.request("Page", "{}");
        assert!(!retry.ptr_eq(&handle));
        let _ = retry.complete().await;
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn test_server_error_response_evicts_entry() {
        let transport = CannedTransport::new(|| {
            let body = serde_json::to_vec(&SerializedError::new(ErrorKind::Render, "boom")).unwrap();
            Ok(FlightResponse::from_bytes(StatusCode::INTERNAL_SERVER_ERROR, body))
        });
        let cache = ClientFlightCache::new(transport, ClientConfig::default());

        let handle = cache.request("Page", "{}");
        let err = handle.complete().await.unwrap_err();
        assert!(err.to_string().contains("boom"));
        assert!(matches!(handle.phase(), Phase::Failed(_)));
        assert!(cache.get(handle.key()).is_none());
    }

    #[tokio::test]
    async fn test_stale_push_update_discarded() {
        let transport = CannedTransport::payload(root_payload(json!("old")));
        let cache = ClientFlightCache::new(transport, ClientConfig::default());

        let counter = cache.request("Counter", "{}");
        counter.complete().await.unwrap();
        cache.request("Other", "{}");

        let mut tree = FlightTree::new();
        tree.insert(Row::model(ROOT_ROW, json!("new")));
        assert!(!cache.push_update(counter.key(), tree.clone()));
        assert_eq!(counter.root().await.unwrap(), json!("old"));

        cache.set_active(Some(counter.key().clone()));
        assert!(cache.push_update(counter.key(), tree));
        assert_eq!(counter.root().await.unwrap(), json!("new"));
    }

    #[tokio::test]
    async fn test_invalidate_forces_refetch() {
        let transport = CannedTransport::payload(root_payload(json!(1)));
        let cache = ClientFlightCache::new(transport.clone(), ClientConfig::default());

        let first = cache.request("Page", "{}");
        first.complete().await.unwrap();
        assert!(cache.invalidate(first.key()));
        assert!(!cache.invalidate(first.key()));

        cache.request("Page", "{}").complete().await.unwrap();
        assert_eq!(transport.calls(), 2);
    }
}
