//! Incrementally decoded result of one rendering request.

use std::sync::{Arc, Mutex, PoisonError};

use flight_core::{FlightDecoder, FlightError, FlightKey, FlightTree, RowPayload};
use flight_streaming::TRAILER_ROW;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::watch;

use crate::BodyStream;

type UpdateCallback = Arc<dyn Fn(&FlightTree) + Send + Sync>;

/// Progress of a handle.
#[derive(Debug, Clone, PartialEq)]
pub enum Phase {
    /// No byte has arrived yet.
    Pending,
    /// Rows are arriving.
    Streaming,
    /// The payload ended cleanly.
    Complete,
    /// The request failed.
    Failed(FlightError),
}

impl Phase {
    /// Whether no further rows will arrive.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed(_))
    }
}

#[derive(Debug, Clone)]
struct HandleState {
    tree: FlightTree,
    phase: Phase,
    /// Set once a pushed update replaced the fetched tree. The fetch that was
    /// still running no longer owns the state.
    superseded: bool,
}

struct HandleInner {
    key: FlightKey,
    state: watch::Sender<HandleState>,
    update: Mutex<Option<UpdateCallback>>,
}

/// Shared view of a rendering request.
///
/// Clones observe the same rows. Awaiting `root()` suspends only until the
/// root row has arrived, not until the whole payload is in.
#[derive(Clone)]
pub struct FlightHandle {
    inner: Arc<HandleInner>,
}

impl FlightHandle {
    pub(crate) fn new(key: FlightKey) -> Self {
        let (state, _) = watch::channel(HandleState {
            tree: FlightTree::new(),
            phase: Phase::Pending,
            superseded: false,
        });
        Self {
            inner: Arc::new(HandleInner {
                key,
                state,
                update: Mutex::new(None),
            }),
        }
    }

    /// Identity this handle renders.
    pub fn key(&self) -> &FlightKey {
        &self.inner.key
    }

    /// Whether both handles are the same entry.
    pub fn ptr_eq(&self, other: &FlightHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Rows decoded so far.
    pub fn snapshot(&self) -> FlightTree {
        self.inner.state.borrow().tree.clone()
    }

    /// Current phase.
    pub fn phase(&self) -> Phase {
        self.inner.state.borrow().phase.clone()
    }

    /// Resolved root value, available as soon as the root row arrives.
    pub async fn root(&self) -> Result<Value, FlightError> {
        let mut rx = self.inner.state.subscribe();
        let state = rx
            .wait_for(|s| s.tree.has_root() || s.phase.is_terminal())
            .await
            .map_err(|_| FlightError::ChannelClosed)?;

        if let Phase::Failed(err) = &state.phase {
            return Err(err.clone());
        }
        state.tree.resolve_root()
    }

    /// Full tree once the payload has ended.
    pub async fn complete(&self) -> Result<FlightTree, FlightError> {
        let mut rx = self.inner.state.subscribe();
        let state = rx
            .wait_for(|s| s.phase.is_terminal())
            .await
            .map_err(|_| FlightError::ChannelClosed)?;

        match &state.phase {
            Phase::Failed(err) => Err(err.clone()),
            _ => Ok(state.tree.clone()),
        }
    }

    /// Register the push-update callback, replacing any earlier one.
    pub fn on_update(&self, callback: impl Fn(&FlightTree) + Send + Sync + 'static) {
        let mut slot = self.inner.update.lock().unwrap_or_else(PoisonError::into_inner);
        *slot = Some(Arc::new(callback));
    }

    /// Whether a push-update callback is registered.
    pub fn has_update_callback(&self) -> bool {
        self.inner
            .update
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Replace the tree with a pushed update and notify the consumer.
    pub(crate) fn apply_update(&self, tree: FlightTree) {
        self.inner.state.send_modify(|state| {
            state.tree = tree.clone();
            state.phase = Phase::Complete;
            state.superseded = true;
        });

        let callback = self
            .inner
            .update
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(callback) = callback {
            callback(&tree);
        }
    }

    /// Decode a response body into this handle.
    ///
    /// Stops as soon as a pushed update supersedes the fetch; the rest of
    /// the body is dropped.
    pub(crate) async fn consume(&self, mut body: BodyStream) -> Result<(), FlightError> {
        let mut decoder = FlightDecoder::new();

        while let Some(chunk) = body.next().await {
            let rows = decoder.push(&chunk?)?;
            if rows.is_empty() {
                continue;
            }

            let mut trailer = None;
            let mut stale = false;
            self.inner.state.send_if_modified(|state| {
                if state.superseded {
                    stale = true;
                    return false;
                }
                for row in rows {
                    if row.id == TRAILER_ROW {
                        if let RowPayload::Error(err) = &row.payload {
                            trailer = Some(FlightError::from_serialized(err.clone()));
                        }
                    }
                    state.tree.insert(row);
                }
                state.phase = Phase::Streaming;
                true
            });
            if stale {
                tracing::debug!(key = %self.inner.key, "fetch superseded by a pushed update");
                return Ok(());
            }
            if let Some(err) = trailer {
                return Err(err);
            }
        }

        decoder.finish()?;
        self.inner.state.send_if_modified(|state| {
            if state.superseded {
                return false;
            }
            state.phase = Phase::Complete;
            true
        });
        Ok(())
    }

    /// Whether a pushed update replaced the fetched tree.
    pub(crate) fn is_superseded(&self) -> bool {
        self.inner.state.borrow().superseded
    }

    /// Fail the handle, unless a pushed update already replaced its tree.
    pub(crate) fn fail(&self, err: FlightError) {
        self.inner.state.send_if_modified(|state| {
            if state.superseded {
                return false;
            }
            state.phase = Phase::Failed(err);
            true
        });
    }
}

impl std::fmt::Debug for FlightHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlightHandle")
            .field("key", &self.inner.key)
            .field("phase", &self.phase())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flight_core::{encode_row, model_ref, ErrorKind, Row, SerializedError, ROOT_ROW};
    use flight_streaming::error_trailer;
    use futures::stream;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn body(chunks: Vec<Vec<u8>>) -> BodyStream {
        stream::iter(chunks.into_iter().map(Ok)).boxed()
    }

    #[tokio::test]
    async fn test_root_resolves_across_split_chunks() {
        let handle = FlightHandle::new(FlightKey::new("Page", "{}"));
        let mut payload = encode_row(&Row::model(1, json!("Hi"))).unwrap();
        payload.extend(encode_row(&Row::model(ROOT_ROW, json!({ "h": model_ref(1) }))).unwrap());
        let (a, b) = payload.split_at(5);

        handle.consume(body(vec![a.to_vec(), b.to_vec()])).await.unwrap();

        assert_eq!(handle.root().await.unwrap(), json!({ "h": "Hi" }));
        assert_eq!(handle.phase(), Phase::Complete);
        assert_eq!(handle.complete().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_root_available_before_payload_ends() {
        let handle = FlightHandle::new(FlightKey::new("Page", "{}"));
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<Result<Vec<u8>, FlightError>>();
        let stream = stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|i| (i, rx)) }).boxed();

        let consumer = handle.clone();
        let task = tokio::spawn(async move { consumer.consume(stream).await });

        tx.send(Ok(encode_row(&Row::model(ROOT_ROW, json!(1))).unwrap())).unwrap();
        assert_eq!(handle.root().await.unwrap(), json!(1));
        assert_eq!(handle.phase(), Phase::Streaming);

        drop(tx);
        task.await.unwrap().unwrap();
        assert_eq!(handle.phase(), Phase::Complete);
    }

    #[tokio::test]
    async fn test_trailer_fails_the_handle() {
        let handle = FlightHandle::new(FlightKey::new("Page", "{}"));
        let err = FlightError::Render(SerializedError::new(ErrorKind::Render, "boom"));
        let result = handle
            .consume(body(vec![encode_row(&Row::model(1, json!(0))).unwrap(), error_trailer(&err)]))
            .await;

        assert!(matches!(result, Err(FlightError::Render(e)) if e.message.contains("boom")));
    }

    #[tokio::test]
    async fn test_failure_reaches_waiters() {
        let handle = FlightHandle::new(FlightKey::new("Page", "{}"));
        let waiter = handle.clone();
        let task = tokio::spawn(async move { waiter.root().await });

        handle.fail(FlightError::Transport("refused".into()));
        assert!(matches!(task.await.unwrap(), Err(FlightError::Transport(_))));
    }

    #[tokio::test]
    async fn test_later_update_callback_replaces_earlier() {
        let handle = FlightHandle::new(FlightKey::new("Page", "{}"));
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let counter = first.clone();
        handle.on_update(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let counter = second.clone();
        handle.on_update(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let mut tree = FlightTree::new();
        tree.insert(Row::model(ROOT_ROW, json!("fresh")));
        handle.apply_update(tree);

        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
        assert_eq!(handle.root().await.unwrap(), json!("fresh"));
    }

    #[tokio::test]
    async fn test_pushed_update_wins_over_running_fetch() {
        let handle = FlightHandle::new(FlightKey::new("Counter", "{}"));
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<Result<Vec<u8>, FlightError>>();
        let stream = stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|i| (i, rx)) }).boxed();

        let consumer = handle.clone();
        let task = tokio::spawn(async move { consumer.consume(stream).await });

        let mut fresh = FlightTree::new();
        fresh.insert(Row::model(1, json!({ "count": 2 })));
        handle.apply_update(fresh.rebased(1));
        assert_eq!(handle.root().await.unwrap(), json!({ "count": 2 }));

        // The older render arrives after the push.
        tx.send(Ok(encode_row(&Row::model(1, json!({ "count": 0 }))).unwrap())).unwrap();
        tx.send(Ok(encode_row(&Row::model(ROOT_ROW, model_ref(1))).unwrap())).unwrap();
        drop(tx);
        task.await.unwrap().unwrap();

        assert!(handle.is_superseded());
        assert_eq!(handle.phase(), Phase::Complete);
        assert_eq!(handle.root().await.unwrap(), json!({ "count": 2 }));
    }

    #[tokio::test]
    async fn test_failed_fetch_keeps_pushed_update() {
        let handle = FlightHandle::new(FlightKey::new("Counter", "{}"));
        let mut fresh = FlightTree::new();
        fresh.insert(Row::model(ROOT_ROW, json!({ "count": 2 })));
        handle.apply_update(fresh);

        handle.fail(FlightError::Transport("reset".into()));

        assert_eq!(handle.phase(), Phase::Complete);
        assert_eq!(handle.complete().await.unwrap().resolve_root().unwrap(), json!({ "count": 2 }));
    }
}
