//! The isolated rendering context.
//!
//! Owns the module registry and the client entries table, and talks to the
//! host only through request and event channels.

use std::any::Any;
use std::path::PathBuf;
use std::sync::Arc;

use flight_core::{
    CallId, ClientEntriesSource, ErrorKind, FlightError, RenderInput, SerializedError, WorkerEvent,
    WorkerRequest,
};
use flight_manifest::EntryMap;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::registry::ModuleRegistry;
use crate::scope::RenderScope;

/// Rendering side of a [`RenderWorkerChannel`](crate::RenderWorkerChannel).
#[derive(Debug)]
pub struct RenderContext {
    registry: Arc<ModuleRegistry>,
    entries: Arc<EntryMap>,
    artifact: PathBuf,
}

impl RenderContext {
    /// Create a context serving `registry`, reading entries from `artifact`.
    pub fn new(registry: ModuleRegistry, artifact: impl Into<PathBuf>) -> Self {
        Self {
            registry: Arc::new(registry),
            entries: Arc::new(EntryMap::default()),
            artifact: artifact.into(),
        }
    }

    /// Start with a given entries table.
    pub fn with_entries(mut self, entries: EntryMap) -> Self {
        self.entries = Arc::new(entries);
        self
    }

    /// Serve requests until shutdown or until the host goes away.
    pub async fn run(mut self, mut requests: mpsc::Receiver<WorkerRequest>, events: mpsc::Sender<WorkerEvent>) {
        tracing::info!(artifact = %self.artifact.display(), "rendering context started");

        while let Some(request) = requests.recv().await {
            let id = request.id();
            tracing::debug!(call_id = id, kind = %request.kind(), "request received");

            let outcome = match request {
                WorkerRequest::Render { id, input } => {
                    self.spawn_render(id, input, events.clone());
                    continue;
                }
                WorkerRequest::SetClientEntries { input, .. } => self.set_client_entries(input),
                WorkerRequest::Build { .. } => self.build(&events).await,
                WorkerRequest::GetCustomModules { .. } => {
                    self.send_json(id, json!(self.registry.custom_modules()), &events)
                        .await
                }
                WorkerRequest::Shutdown { .. } => {
                    let _ = events.send(WorkerEvent::End { id }).await;
                    break;
                }
            };

            let terminal = match outcome {
                Ok(()) => WorkerEvent::End { id },
                Err(error) => WorkerEvent::Error { id, error },
            };
            if events.send(terminal).await.is_err() {
                break;
            }
        }

        tracing::info!("rendering context stopped");
    }

    fn set_client_entries(&mut self, source: ClientEntriesSource) -> Result<(), SerializedError> {
        let entries = match source {
            ClientEntriesSource::Mapping(client_entries) => EntryMap {
                client_entries,
                ..(*self.entries).clone()
            },
            ClientEntriesSource::LoadDefault => self.load_artifact()?,
        };

        tracing::debug!(entries = entries.client_entries.len(), "client entries set");
        self.entries = Arc::new(entries);
        Ok(())
    }

    async fn build(&mut self, events: &mpsc::Sender<WorkerEvent>) -> Result<(), SerializedError> {
        self.entries = Arc::new(self.load_artifact()?);
        tracing::info!(entries = self.entries.client_entries.len(), "build reloaded entries");
        let _ = events.send(WorkerEvent::FullReload).await;
        Ok(())
    }

    fn load_artifact(&self) -> Result<EntryMap, SerializedError> {
        EntryMap::load(&self.artifact).map_err(|e| SerializedError::from_anyhow(ErrorKind::Render, &e))
    }

    async fn send_json(
        &self,
        id: CallId,
        value: Value,
        events: &mpsc::Sender<WorkerEvent>,
    ) -> Result<(), SerializedError> {
        events
            .send(WorkerEvent::chunk(id, value.to_string().into_bytes()))
            .await
            .map_err(|_| SerializedError::new(ErrorKind::Render, "render channel closed"))
    }

    /// Run a render in its own task. Exactly one terminal frame follows,
    /// even if the component panics.
    fn spawn_render(&self, id: CallId, input: RenderInput, events: mpsc::Sender<WorkerEvent>) {
        let registry = Arc::clone(&self.registry);
        let entries = Arc::clone(&self.entries);
        let kind = if input.is_action() {
            ErrorKind::Action
        } else {
            ErrorKind::Render
        };

        tokio::spawn(async move {
            let scope = RenderScope::new(id, events.clone(), entries);
            let task = tokio::spawn(execute(registry, input, scope));

            let terminal = match task.await {
                Ok(Ok(())) => WorkerEvent::End { id },
                Ok(Err(error)) => WorkerEvent::Error { id, error },
                Err(join) => {
                    let message = if join.is_panic() {
                        panic_message(join.into_panic())
                    } else {
                        "render task aborted".to_string()
                    };
                    tracing::error!(call_id = id, error = %message, "render task panicked");
                    WorkerEvent::Error {
                        id,
                        error: SerializedError::new(kind, message),
                    }
                }
            };
            let _ = events.send(terminal).await;
        });
    }
}

async fn execute(
    registry: Arc<ModuleRegistry>,
    input: RenderInput,
    mut scope: RenderScope,
) -> Result<(), SerializedError> {
    let RenderInput {
        component_id,
        props,
        action_id,
        args,
    } = input;
    let props = props.unwrap_or(Value::Null);

    let Some(action_id) = action_id else {
        let component_id = component_id.ok_or_else(|| {
            SerializedError::new(
                ErrorKind::InvalidRequest,
                "render input names neither a component nor an action",
            )
        })?;
        let root = render_component(&registry, &component_id, &props, &mut scope).await?;
        return scope.write_root(root).await.map_err(|e| e.to_serialized());
    };

    let action = registry.action(&action_id).ok_or_else(|| {
        SerializedError::new(ErrorKind::Action, format!("unknown server action '{}'", action_id))
    })?;
    tracing::debug!(call_id = scope.call_id(), action = %action_id, "running server action");
    let result = action
        .call(args)
        .await
        .map_err(|e| SerializedError::from_anyhow(ErrorKind::Action, &e))?;

    let render = match component_id {
        Some(component_id) => {
            let tree = render_component(&registry, &component_id, &props, &mut scope).await?;
            scope.emit(tree).await.map_err(|e| e.to_serialized())?
        }
        None => Value::Null,
    };

    scope
        .write_root(json!({ "result": result, "render": render }))
        .await
        .map_err(|e| e.to_serialized())
}

async fn render_component(
    registry: &ModuleRegistry,
    component_id: &str,
    props: &Value,
    scope: &mut RenderScope,
) -> Result<Value, SerializedError> {
    let component = registry.component(component_id).ok_or_else(|| {
        SerializedError::new(ErrorKind::Render, format!("unknown component '{}'", component_id))
    })?;
    tracing::debug!(call_id = scope.call_id(), component = component_id, "rendering component");
    component
        .render(props, scope)
        .await
        .map_err(|e| {
            let kind = match e.downcast_ref::<FlightError>() {
                Some(FlightError::EntryMapping { .. }) => ErrorKind::EntryMapping,
                _ => ErrorKind::Render,
            };
            SerializedError::from_anyhow(kind, &e)
        })
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "render task panicked".to_string()
    }
}
