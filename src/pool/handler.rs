use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use crate::core::errors::{ParallelError, Result};
use crate::pool::unit::UnitId;

/// Read-only state produced once per unit by a [`ContextInitializer`]
pub type ContextState = Arc<dyn Any + Send + Sync>;

/// Logic run by every execution unit of a pool, once per payload
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn execute(&self, call: Invocation) -> anyhow::Result<Value>;
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(Invocation) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn execute(&self, call: Invocation) -> anyhow::Result<Value> {
        (self)(call).await
    }
}

/// One-time per-unit setup whose result is handed to every call on that unit
#[async_trait]
pub trait ContextInitializer: Send + Sync + 'static {
    async fn initialize(&self) -> anyhow::Result<ContextState>;
}

#[async_trait]
impl<F, Fut> ContextInitializer for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<ContextState>> + Send + 'static,
{
    async fn initialize(&self) -> anyhow::Result<ContextState> {
        (self)().await
    }
}

/// What a positional handler argument receives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamRole {
    /// The decoded payload
    Data,
    /// The unit's [`UnitContext`]
    Context,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParamBinding {
    pub role: ParamRole,
    pub position: usize,
}

impl ParamBinding {
    pub fn data(position: usize) -> Self {
        Self {
            role: ParamRole::Data,
            position,
        }
    }

    pub fn context(position: usize) -> Self {
        Self {
            role: ParamRole::Context,
            position,
        }
    }

    /// Payload first, context second
    pub fn defaults() -> Vec<ParamBinding> {
        vec![ParamBinding::data(0), ParamBinding::context(1)]
    }

    /// Positions must be unique and cover `0..len` without gaps
    pub fn validate(bindings: &[ParamBinding]) -> Result<()> {
        let mut seen = vec![false; bindings.len()];
        for binding in bindings {
            match seen.get_mut(binding.position) {
                Some(slot) if !*slot => *slot = true,
                Some(_) => {
                    return Err(ParallelError::configuration_field(
                        format!("duplicate parameter position {}", binding.position),
                        "bindings",
                    ))
                }
                None => {
                    return Err(ParallelError::configuration_field(
                        format!(
                            "parameter position {} out of range for {} bindings",
                            binding.position,
                            bindings.len()
                        ),
                        "bindings",
                    ))
                }
            }
        }
        Ok(())
    }
}

/// Per-unit context passed to handlers bound with [`ParamRole::Context`]
pub struct UnitContext {
    unit: UnitId,
    namespace: Arc<str>,
    state: Option<ContextState>,
}

impl UnitContext {
    pub(crate) fn new(unit: UnitId, namespace: Arc<str>, state: Option<ContextState>) -> Self {
        Self {
            unit,
            namespace,
            state,
        }
    }

    pub fn unit(&self) -> UnitId {
        self.unit
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Typed access to the initializer's state
    pub fn state<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.state.as_ref()?.downcast_ref::<T>()
    }

    pub fn has_state(&self) -> bool {
        self.state.is_some()
    }
}

impl fmt::Debug for UnitContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitContext")
            .field("unit", &self.unit)
            .field("namespace", &self.namespace)
            .field("has_state", &self.state.is_some())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub enum Argument {
    Data(Value),
    Context(Arc<UnitContext>),
}

/// Positional arguments for one handler call, laid out by the pool's bindings
#[derive(Debug, Clone)]
pub struct Invocation {
    args: Vec<Argument>,
}

impl Invocation {
    /// Bindings are validated at pool creation, so every position is filled
    pub(crate) fn bind(bindings: &[ParamBinding], payload: Value, ctx: &Arc<UnitContext>) -> Self {
        let mut ordered = bindings.to_vec();
        ordered.sort_by_key(|b| b.position);
        let args = ordered
            .iter()
            .map(|binding| match binding.role {
                ParamRole::Data => Argument::Data(payload.clone()),
                ParamRole::Context => Argument::Context(ctx.clone()),
            })
            .collect();
        Self { args }
    }

    pub fn args(&self) -> &[Argument] {
        &self.args
    }

    pub fn arg(&self, position: usize) -> Option<&Argument> {
        self.args.get(position)
    }

    /// First argument bound to the payload
    pub fn data(&self) -> Option<&Value> {
        self.args.iter().find_map(|arg| match arg {
            Argument::Data(value) => Some(value),
            Argument::Context(_) => None,
        })
    }

    /// First argument bound to the unit context
    pub fn context(&self) -> Option<&UnitContext> {
        self.args.iter().find_map(|arg| match arg {
            Argument::Context(ctx) => Some(ctx.as_ref()),
            Argument::Data(_) => None,
        })
    }

    pub fn into_data(self) -> Option<Value> {
        self.args.into_iter().find_map(|arg| match arg {
            Argument::Data(value) => Some(value),
            Argument::Context(_) => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Parser {
        prefix: String,
    }

    fn ctx(state: Option<ContextState>) -> Arc<UnitContext> {
        Arc::new(UnitContext::new(3, Arc::from("parserLine"), state))
    }

    #[test]
    fn test_bindings_validation() {
        assert!(ParamBinding::validate(&ParamBinding::defaults()).is_ok());
        assert!(ParamBinding::validate(&[]).is_ok());
        assert!(
            ParamBinding::validate(&[ParamBinding::context(0), ParamBinding::data(0)]).is_err()
        );
        assert!(ParamBinding::validate(&[ParamBinding::data(1)]).is_err());
    }

    #[test]
    fn test_invocation_follows_positions() {
        let bindings = vec![ParamBinding::data(1), ParamBinding::context(0)];
        let call = Invocation::bind(&bindings, json!({"id": 1}), &ctx(None));

        assert!(matches!(call.arg(0), Some(Argument::Context(_))));
        assert!(matches!(call.arg(1), Some(Argument::Data(_))));
        assert_eq!(call.data(), Some(&json!({"id": 1})));
        assert_eq!(call.context().map(|c| c.unit()), Some(3));
        assert_eq!(call.into_data(), Some(json!({"id": 1})));
    }

    #[test]
    fn test_data_only_binding_has_no_context() {
        let call = Invocation::bind(&[ParamBinding::data(0)], json!(7), &ctx(None));
        assert_eq!(call.args().len(), 1);
        assert!(call.context().is_none());
    }

    #[test]
    fn test_typed_state_access() {
        let state: ContextState = Arc::new(Parser {
            prefix: "cust-".into(),
        });
        let ctx = ctx(Some(state));
        assert!(ctx.has_state());
        assert_eq!(ctx.namespace(), "parserLine");
        assert_eq!(ctx.state::<Parser>().map(|p| p.prefix.as_str()), Some("cust-"));
        assert!(ctx.state::<String>().is_none());
    }

    #[tokio::test]
    async fn test_closure_handler() {
        let handler = |call: Invocation| async move {
            let n = call.data().and_then(Value::as_i64).unwrap_or_default();
            Ok::<_, anyhow::Error>(json!(n * 2))
        };
        let call = Invocation::bind(&ParamBinding::defaults(), json!(21), &ctx(None));
        assert_eq!(handler.execute(call).await.unwrap(), json!(42));
    }
}
