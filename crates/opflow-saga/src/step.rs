use async_trait::async_trait;
use opflow_core::{HandlerError, SagaId};
use serde_json::{Map, Value};

/// What a handler knows about the saga it is running in.
#[derive(Debug, Clone, PartialEq)]
pub struct StepContext {
    pub saga_id: SagaId,
    pub saga_name: String,
    pub tenant_id: String,
    pub correlation_id: String,
    pub step_name: String,
    pub step_index: usize,
    /// 1-based attempt number of this execution or compensation.
    pub attempt: u32,
    /// The saga's start input.
    pub saga_input: Value,
    /// Outputs of the steps completed before this one, keyed by step name.
    pub prior_outputs: Map<String, Value>,
}

impl StepContext {
    #[must_use]
    pub fn output_of(&self, step: &str) -> Option<&Value> {
        self.prior_outputs.get(step)
    }
}

/// A named, versioned collaborator invoked for one saga step.
///
/// Handlers are invoked at least once per attempt and must be idempotent
/// against their own external system; handlers that call other services
/// should pair each call with an idempotency key.
#[async_trait]
pub trait StepHandler: Send + Sync {
    /// Operation name the handler is registered under.
    fn name(&self) -> &str;

    fn version(&self) -> u32 {
        1
    }

    /// Perform the step's forward action.
    ///
    /// # Errors
    ///
    /// Returns an error if the step fails; the executor retries it.
    async fn execute(&self, ctx: &StepContext, input: Value) -> Result<Value, HandlerError>;

    /// Undo the step, given the output recorded when it completed.
    ///
    /// The returned value, if any, is stored as the step's compensation data.
    /// The default implementation is a no-op, suitable for read-only steps.
    ///
    /// # Errors
    ///
    /// Returns an error if compensation fails; the coordinator retries it.
    async fn compensate(
        &self,
        ctx: &StepContext,
        output: Value,
    ) -> Result<Option<Value>, HandlerError> {
        let _ = (ctx, output);
        Ok(None)
    }

    /// Human-readable description of what compensation will do.
    fn compensation_description(&self) -> String {
        format!("undo {}", self.name())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    struct Echo;

    #[async_trait]
    impl StepHandler for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        async fn execute(&self, _ctx: &StepContext, input: Value) -> Result<Value, HandlerError> {
            Ok(input)
        }
    }

    fn context() -> StepContext {
        let mut prior_outputs = Map::new();
        prior_outputs.insert("create_db".to_string(), json!({"db": "t1"}));
        StepContext {
            saga_id: SagaId::new(),
            saga_name: "tenant-provisioning".to_string(),
            tenant_id: "t1".to_string(),
            correlation_id: "c1".to_string(),
            step_name: "echo".to_string(),
            step_index: 1,
            attempt: 1,
            saga_input: json!({}),
            prior_outputs,
        }
    }

    #[tokio::test]
    async fn default_compensation_is_a_no_op() -> anyhow::Result<()> {
        let data = Echo.compensate(&context(), json!({"x": 1})).await?;

        assert_eq!(data, None);
        Ok(())
    }

    #[test]
    fn defaults_describe_handler() {
        assert_eq!(Echo.version(), 1);
        assert_eq!(Echo.compensation_description(), "undo echo");
    }

    #[test]
    fn context_exposes_prior_outputs() {
        let ctx = context();

        assert_eq!(ctx.output_of("create_db"), Some(&json!({"db": "t1"})));
        assert_eq!(ctx.output_of("missing"), None);
    }
}
