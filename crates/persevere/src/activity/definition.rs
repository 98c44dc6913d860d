//! Activity handler types

use futures::future::BoxFuture;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;

use super::scope::DependencyScope;

/// Error type for activity failures
///
/// An activity failure is durable and terminal: it is stored on the
/// activity entity and re-raised at the same call site on every future
/// replay. Activities that want retries implement them internally and are
/// expected to be idempotent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityError {
    /// Error message, persisted verbatim
    pub message: String,
}

impl ActivityError {
    /// Create an error from a message
    pub fn msg(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ActivityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ActivityError {}

impl From<anyhow::Error> for ActivityError {
    fn from(err: anyhow::Error) -> Self {
        Self::msg(format!("{err:#}"))
    }
}

/// One invocation of a registered activity
///
/// Carries the decoded argument payload and a fresh [`DependencyScope`]
/// built by the engine's scope factory.
pub struct ActivityInvocation {
    /// Workflow the call site belongs to
    pub workflow_id: String,

    /// Name the activity was registered under
    pub method: String,

    /// Decoded argument payload
    pub args: Value,

    /// Dependencies resolved for this invocation
    pub scope: DependencyScope,
}

impl ActivityInvocation {
    /// Decode the argument payload into a concrete type
    pub fn args<T: DeserializeOwned>(&self) -> Result<T, ActivityError> {
        serde_json::from_value(self.args.clone())
            .map_err(|e| ActivityError::msg(format!("invalid arguments for {}: {e}", self.method)))
    }
}

/// Result of one activity invocation
pub type ActivityResult = Result<Value, ActivityError>;

/// Boxed activity handler stored in the registry
pub type ActivityHandler =
    Arc<dyn Fn(ActivityInvocation) -> BoxFuture<'static, ActivityResult> + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize, PartialEq)]
    struct ChargeArgs {
        cents: u64,
    }

    fn invocation(args: Value) -> ActivityInvocation {
        ActivityInvocation {
            workflow_id: "wf-1".to_string(),
            method: "charge".to_string(),
            args,
            scope: DependencyScope::new(),
        }
    }

    #[test]
    fn test_typed_args() {
        let inv = invocation(json!({"cents": 500}));
        let args: ChargeArgs = inv.args().unwrap();
        assert_eq!(args, ChargeArgs { cents: 500 });
    }

    #[test]
    fn test_typed_args_mismatch() {
        let inv = invocation(json!({"cents": "five"}));
        let result = inv.args::<ChargeArgs>();
        assert!(result.is_err());
    }

    #[test]
    fn test_error_from_anyhow() {
        let err: ActivityError = anyhow::anyhow!("connection refused").into();
        assert!(err.message.contains("connection refused"));
    }
}
