//! Server action calls from the client.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use flight_core::{ActionArgs, FlightDecoder, FlightError, FlightTree, MultipartBody, RowId, RowPayload};
use flight_streaming::TRAILER_ROW;
use futures::StreamExt;
use serde_json::Value;

use crate::{action_request, ClientFlightCache};

/// Key of the action's own value in an action response root.
pub const RESULT_FIELD: &str = "result";
/// Key of the reference to the fresh render in an action response root.
pub const RENDER_FIELD: &str = "render";

/// Depth of nested mutating blocks.
#[derive(Debug, Clone, Default)]
pub struct MutationCounter(Arc<AtomicUsize>);

impl MutationCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter a mutating block until the guard drops.
    pub fn enter(&self) -> MutationGuard {
        self.0.fetch_add(1, Ordering::SeqCst);
        MutationGuard(self.0.clone())
    }

    pub fn depth(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    pub fn is_active(&self) -> bool {
        self.depth() > 0
    }
}

/// Leaves the mutating block on drop, including on early return or panic.
#[derive(Debug)]
#[must_use = "the mutating block ends when the guard is dropped"]
pub struct MutationGuard(Arc<AtomicUsize>);

impl Drop for MutationGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Invokes server actions and routes fresh renders into the cache.
#[derive(Debug, Clone)]
pub struct ServerActionBridge {
    cache: ClientFlightCache,
    mutations: MutationCounter,
}

impl ServerActionBridge {
    pub fn new(cache: ClientFlightCache) -> Self {
        Self {
            cache,
            mutations: MutationCounter::new(),
        }
    }

    /// Share a mutation counter with other bridges.
    pub fn with_counter(mut self, counter: MutationCounter) -> Self {
        self.mutations = counter;
        self
    }

    pub fn counter(&self) -> &MutationCounter {
        &self.mutations
    }

    pub fn cache(&self) -> &ClientFlightCache {
        &self.cache
    }

    /// Enter mutation mode until the guard drops.
    pub fn begin_mutation(&self) -> MutationGuard {
        self.mutations.enter()
    }

    /// Run `f` in mutation mode.
    ///
    /// Actions called inside also re-render the active component and push
    /// the result into its cache entry.
    pub async fn mutate<F, Fut, T>(&self, f: F) -> T
    where
        F: FnOnce(Self) -> Fut,
        Fut: Future<Output = T>,
    {
        let _guard = self.begin_mutation();
        f(self.clone()).await
    }

    /// Call `action_id` and return its result.
    ///
    /// An argument that cannot be encoded fails the call before anything is
    /// sent.
    pub async fn call(&self, action_id: &str, args: ActionArgs) -> Result<Value, FlightError> {
        let args = args.into_args()?;
        let body = MultipartBody::encode(&args)?;

        let target = if self.mutations.is_active() {
            self.cache.active()
        } else {
            None
        };

        tracing::debug!(
            action = action_id,
            target = ?target.as_ref().map(|k| k.component_id.as_str()),
            args = args.len(),
            "calling server action"
        );

        let request = action_request(&self.cache.config().base_path, action_id, target.as_ref(), body)?;
        let response = self.cache.transport().send(request).await?;
        let tree = collect_tree(response.into_payload().await?).await?;

        let root = tree.resolve_root()?;
        let result = root.get(RESULT_FIELD).cloned().unwrap_or(Value::Null);

        if let (Some(key), Some(render)) = (target, render_row(&tree)) {
            self.cache.push_update(&key, tree.rebased(render));
        }

        Ok(result)
    }
}

async fn collect_tree(mut body: crate::BodyStream) -> Result<FlightTree, FlightError> {
    let mut decoder = FlightDecoder::new();
    let mut tree = FlightTree::new();

    while let Some(chunk) = body.next().await {
        for row in decoder.push(&chunk?)? {
            if row.id == TRAILER_ROW {
                if let RowPayload::Error(err) = row.payload {
                    return Err(FlightError::from_serialized(err));
                }
            }
            tree.insert(row);
        }
    }
    decoder.finish()?;
    Ok(tree)
}

/// Row holding the fresh render, read from the unresolved root.
fn render_row(tree: &FlightTree) -> Option<RowId> {
    let RowPayload::Model(root) = tree.get(tree.root_id())? else {
        return None;
    };
    let id = root.get(RENDER_FIELD)?.get("$R")?.as_u64()?;
    RowId::try_from(id).ok()
}
