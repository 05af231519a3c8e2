//! Server components and actions known to a rendering context.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use flight_core::ActionArg;
use serde_json::Value;

use crate::scope::RenderScope;

/// A component rendered on the server.
///
/// Returns the root model of its output. Sub-trees can be streamed ahead of
/// the root through [`RenderScope::emit`], and client-boundary components
/// are referenced through [`RenderScope::client_reference`].
#[async_trait]
pub trait ServerComponent: Send + Sync {
    async fn render(&self, props: &Value, scope: &mut RenderScope) -> anyhow::Result<Value>;
}

/// A named server-side function callable from the client.
#[async_trait]
pub trait ServerAction: Send + Sync {
    async fn call(&self, args: Vec<ActionArg>) -> anyhow::Result<Value>;
}

/// Component rendering synchronously from its props.
pub struct FnComponent<F>(F);

/// Wrap a synchronous render function as a component.
pub fn component_fn<F>(f: F) -> FnComponent<F>
where
    F: Fn(&Value) -> anyhow::Result<Value> + Send + Sync,
{
    FnComponent(f)
}

#[async_trait]
impl<F> ServerComponent for FnComponent<F>
where
    F: Fn(&Value) -> anyhow::Result<Value> + Send + Sync,
{
    async fn render(&self, props: &Value, _scope: &mut RenderScope) -> anyhow::Result<Value> {
        (self.0)(props)
    }
}

/// Action backed by an async function.
pub struct FnAction<F>(F);

/// Wrap an async function as an action.
pub fn action_fn<F, Fut>(f: F) -> FnAction<F>
where
    F: Fn(Vec<ActionArg>) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send,
{
    FnAction(f)
}

#[async_trait]
impl<F, Fut> ServerAction for FnAction<F>
where
    F: Fn(Vec<ActionArg>) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send,
{
    async fn call(&self, args: Vec<ActionArg>) -> anyhow::Result<Value> {
        (self.0)(args).await
    }
}

/// Registry of everything a rendering context can serve.
///
/// Owned by the context for its whole lifetime and dropped on shutdown.
#[derive(Default, Clone)]
pub struct ModuleRegistry {
    components: HashMap<String, Arc<dyn ServerComponent>>,
    actions: HashMap<String, Arc<dyn ServerAction>>,
    custom_modules: BTreeMap<String, String>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a component under an id.
    pub fn with_component(
        mut self,
        id: impl Into<String>,
        component: impl ServerComponent + 'static,
    ) -> Self {
        self.components.insert(id.into(), Arc::new(component));
        self
    }

    /// Register an action under an id.
    pub fn with_action(mut self, id: impl Into<String>, action: impl ServerAction + 'static) -> Self {
        self.actions.insert(id.into(), Arc::new(action));
        self
    }

    /// Register a custom module by name.
    pub fn with_custom_module(mut self, name: impl Into<String>, path: impl Into<String>) -> Self {
        self.custom_modules.insert(name.into(), path.into());
        self
    }

    /// Look up a component.
    pub fn component(&self, id: &str) -> Option<Arc<dyn ServerComponent>> {
        self.components.get(id).cloned()
    }

    /// Look up an action.
    pub fn action(&self, id: &str) -> Option<Arc<dyn ServerAction>> {
        self.actions.get(id).cloned()
    }

    /// Custom modules, name to path.
    pub fn custom_modules(&self) -> &BTreeMap<String, String> {
        &self.custom_modules
    }

    /// Registered component ids, sorted.
    pub fn component_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.components.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}

impl std::fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut actions: Vec<&String> = self.actions.keys().collect();
        actions.sort_unstable();
        f.debug_struct("ModuleRegistry")
            .field("components", &self.component_ids())
            .field("actions", &actions)
            .field("custom_modules", &self.custom_modules)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_registry_lookups() {
        let registry = ModuleRegistry::new()
            .with_component("Page", component_fn(|props| Ok(json!({ "echo": props }))))
            .with_action("inc", action_fn(|_args| async { Ok(json!(1)) }))
            .with_custom_module("auth", "web/src/auth.ts");

        assert!(registry.component("Page").is_some());
        assert!(registry.component("Missing").is_none());
        assert_eq!(registry.custom_modules().get("auth").unwrap(), "web/src/auth.ts");

        let action = registry.action("inc").unwrap();
        assert_eq!(action.call(Vec::new()).await.unwrap(), json!(1));
    }

    #[test]
    fn test_debug_lists_ids() {
        let registry = ModuleRegistry::new()
            .with_component("B", component_fn(|_| Ok(Value::Null)))
            .with_component("A", component_fn(|_| Ok(Value::Null)));
        let debug = format!("{:?}", registry);
        assert!(debug.contains("[\"A\", \"B\"]"));
    }
}
