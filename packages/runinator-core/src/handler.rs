//! Action handler contract and the process-local registry.
//!
//! The registry maps `(action_name, action_function)` pairs (e.g.
//! `("Console", "run_console")`) to boxed async handlers. Workers resolve a
//! leased firing to a handler here; an unregistered pair is dropped with
//! `handler_not_found`. Registration is static at process start.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use runinator_core::handler::{ActionRegistry, HandlerOutcome};
//!
//! let mut registry = ActionRegistry::new();
//! registry.register("Console", "echo", |configuration, _budget| async move {
//!     HandlerOutcome::Success {
//!         stdout: Some(String::from_utf8_lossy(&configuration).into_owned()),
//!     }
//! });
//! assert!(registry.is_registered("Console", "echo"));
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// Result of one handler invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// The handler completed; `stdout` carries captured output when the
    /// handler produces any.
    Success { stdout: Option<String> },
    /// The handler ran and failed. `retryable` decides requeue vs drop.
    Failure { message: String, retryable: bool },
    /// The wall-clock budget elapsed before the handler finished.
    Timeout,
}

impl HandlerOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, HandlerOutcome::Success { .. })
    }
}

/// Boxed async handler: `(configuration, budget) -> outcome`.
///
/// `budget` is the wall-clock allowance; the worker additionally enforces it
/// from the outside, so a handler that ignores the budget is still cut off.
pub type HandlerFn = Arc<
    dyn Fn(Vec<u8>, Duration) -> Pin<Box<dyn Future<Output = HandlerOutcome> + Send>>
        + Send
        + Sync,
>;

/// Process-local map from `(action_name, action_function)` to handlers.
#[derive(Default, Clone)]
pub struct ActionRegistry {
    handlers: HashMap<(String, String), HandlerFn>,
}

impl ActionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for an action pair.
    ///
    /// # Panics
    ///
    /// Panics if the pair is already registered; registration happens once
    /// at startup, so a duplicate is a wiring bug.
    pub fn register<F, Fut>(&mut self, action_name: &str, action_function: &str, handler: F)
    where
        F: Fn(Vec<u8>, Duration) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerOutcome> + Send + 'static,
    {
        let key = (action_name.to_string(), action_function.to_string());
        if self.handlers.contains_key(&key) {
            panic!(
                "handler already registered for {}/{}",
                action_name, action_function
            );
        }
        let boxed: HandlerFn =
            Arc::new(move |configuration, budget| Box::pin(handler(configuration, budget)));
        self.handlers.insert(key, boxed);
    }

    /// Look up the handler for an action pair.
    pub fn resolve(&self, action_name: &str, action_function: &str) -> Option<HandlerFn> {
        self.handlers
            .get(&(action_name.to_string(), action_function.to_string()))
            .cloned()
    }

    /// Check whether an action pair is registered.
    pub fn is_registered(&self, action_name: &str, action_function: &str) -> bool {
        self.handlers
            .contains_key(&(action_name.to_string(), action_function.to_string()))
    }

    /// All registered `(action_name, action_function)` pairs.
    pub fn registered_actions(&self) -> Vec<(String, String)> {
        self.handlers.keys().cloned().collect()
    }
}

impl std::fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionRegistry")
            .field("actions", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo_registry() -> ActionRegistry {
        let mut registry = ActionRegistry::new();
        registry.register("Console", "echo", |configuration, _budget| async move {
            HandlerOutcome::Success {
                stdout: Some(String::from_utf8_lossy(&configuration).into_owned()),
            }
        });
        registry
    }

    #[tokio::test]
    async fn test_register_and_invoke() {
        let registry = echo_registry();
        let handler = registry.resolve("Console", "echo").unwrap();
        let outcome = handler(b"hello".to_vec(), Duration::from_secs(1)).await;
        assert_eq!(
            outcome,
            HandlerOutcome::Success {
                stdout: Some("hello".to_string())
            }
        );
    }

    #[test]
    fn test_unknown_action_resolves_to_none() {
        let registry = echo_registry();
        assert!(registry.resolve("Console", "missing").is_none());
        assert!(!registry.is_registered("Other", "echo"));
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn test_duplicate_registration_panics() {
        let mut registry = echo_registry();
        registry.register("Console", "echo", |_c, _b| async {
            HandlerOutcome::Timeout
        });
    }

    #[test]
    fn test_registered_actions() {
        let registry = echo_registry();
        let actions = registry.registered_actions();
        assert!(actions.contains(&("Console".to_string(), "echo".to_string())));
    }
}
