use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

/// An action a worker can run: takes the step run's input document and
/// resolves to its output, or to an error message.
pub type ActionFn =
    Arc<dyn Fn(Value) -> BoxFuture<'static, std::result::Result<Value, String>> + Send + Sync>;

pub fn action_fn<F, Fut>(f: F) -> ActionFn
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<Value, String>> + Send + 'static,
{
    Arc::new(move |input| f(input).boxed())
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Succeeded(Value),
    Failed(String),
    Cancelled,
}

/// Runs step runs against a table of named actions.
#[derive(Clone, Default)]
pub struct StepExecutor {
    actions: HashMap<String, ActionFn>,
}

impl StepExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// `echo` returns the trigger input, `fail` always fails.
    pub fn with_builtin_actions() -> Self {
        Self::new()
            .register("echo", |input: Value| async move {
                Ok(json!({ "echo": input.get("input").cloned().unwrap_or(Value::Null) }))
            })
            .register("fail", |_input: Value| async { Err("requested failure".to_string()) })
    }

    pub fn register<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Value, String>> + Send + 'static,
    {
        self.actions.insert(name.into(), action_fn(f));
        self
    }

    pub fn actions(&self) -> Vec<String> {
        let mut names: Vec<String> = self.actions.keys().cloned().collect();
        names.sort();
        names
    }

    /// Run `action` until it completes or `token` is cancelled.
    pub async fn execute(&self, action: &str, input: Value, token: CancellationToken) -> StepOutcome {
        let Some(f) = self.actions.get(action) else {
            return StepOutcome::Failed(format!("no handler registered for action {}", action));
        };
        tracing::debug!(action, "Executing step");

        tokio::select! {
            _ = token.cancelled() => StepOutcome::Cancelled,
            result = f(input) => match result {
                Ok(output) => StepOutcome::Succeeded(output),
                Err(e) => StepOutcome::Failed(e),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn echo_returns_trigger_input() {
        let executor = StepExecutor::with_builtin_actions();
        let outcome = executor
            .execute("echo", json!({"input": {"n": 1}}), CancellationToken::new())
            .await;
        assert_eq!(outcome, StepOutcome::Succeeded(json!({"echo": {"n": 1}})));
    }

    #[tokio::test]
    async fn unknown_action_fails() {
        let executor = StepExecutor::new();
        let outcome = executor
            .execute("missing", Value::Null, CancellationToken::new())
            .await;
        assert!(matches!(outcome, StepOutcome::Failed(_)));
    }

    #[tokio::test]
    async fn cancellation_stops_a_running_action() {
        let executor = StepExecutor::new().register("slow", |_input: Value| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(Value::Null)
        });
        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });

        let outcome = executor.execute("slow", Value::Null, token).await;
        assert_eq!(outcome, StepOutcome::Cancelled);
    }
}
