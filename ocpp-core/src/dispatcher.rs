//! Action name -> handler registry
//!
//! Every Call handed to [`ActionDispatcher::dispatch`] yields exactly one
//! CallResult or CallError with the Call's correlation id, whatever the
//! handler does: returns, fails, panics or never finishes.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use parking_lot::RwLock;
use tracing::{debug, error, warn};

use crate::error::{DispatchError, HandlerError};
use crate::messages::{Call, CallResult, Message};
use crate::role::Side;
use crate::types::{Action, Payload, PeerIdentity};

pub type HandlerFuture = BoxFuture<'static, Result<Payload, HandlerError>>;

/// Business logic bound to one action
pub trait Handler: Send + Sync + 'static {
    fn call(&self, peer: PeerIdentity, payload: Payload) -> HandlerFuture;
}

impl<F, Fut> Handler for F
where
    F: Fn(PeerIdentity, Payload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Payload, HandlerError>> + Send + 'static,
{
    fn call(&self, peer: PeerIdentity, payload: Payload) -> HandlerFuture {
        Box::pin(self(peer, payload))
    }
}

pub struct ActionDispatcher {
    side: Side,
    handlers: RwLock<HashMap<Action, Arc<dyn Handler>>>,
    handler_timeout: Duration,
}

impl ActionDispatcher {
    pub fn new(side: Side, handler_timeout: Duration) -> Self {
        Self {
            side,
            handlers: RwLock::new(HashMap::new()),
            handler_timeout,
        }
    }

    pub fn side(&self) -> Side {
        self.side
    }

    /// Bind `handler` to `action`. Last registration wins; returns true when
    /// an earlier handler was replaced.
    pub fn register<F, Fut>(&self, action: impl Into<Action>, handler: F) -> bool
    where
        F: Fn(PeerIdentity, Payload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Payload, HandlerError>> + Send + 'static,
    {
        self.register_handler(action, Arc::new(handler))
    }

    pub fn register_handler(&self, action: impl Into<Action>, handler: Arc<dyn Handler>) -> bool {
        let action = action.into();
        let replaced = self
            .handlers
            .write()
            .insert(action.clone(), handler)
            .is_some();
        if replaced {
            debug!("Handler for {} replaced", action);
        }
        replaced
    }

    pub fn actions(&self) -> Vec<Action> {
        let mut actions: Vec<Action> = self.handlers.read().keys().cloned().collect();
        actions.sort();
        actions
    }

    /// Run the handler for `action` in its own task
    pub async fn invoke(
        &self,
        peer: PeerIdentity,
        action: &Action,
        payload: Payload,
    ) -> Result<Payload, DispatchError> {
        let handler = self
            .handlers
            .read()
            .get(action)
            .cloned()
            .ok_or_else(|| DispatchError::NotImplemented(action.clone()))?;

        let task = tokio::spawn(async move { handler.call(peer, payload).await });
        let abort = task.abort_handle();

        match tokio::time::timeout(self.handler_timeout, task).await {
            Ok(Ok(result)) => result.map_err(DispatchError::from),
            Ok(Err(join_error)) if join_error.is_panic() => {
                error!("Handler for {} panicked", action);
                Err(DispatchError::Fault(format!("handler for {} panicked", action)))
            }
            Ok(Err(_)) => Err(DispatchError::Fault(format!("handler for {} was cancelled", action))),
            Err(_) => {
                abort.abort();
                warn!("Handler for {} exceeded {:?}", action, self.handler_timeout);
                Err(DispatchError::TimedOut(self.handler_timeout))
            }
        }
    }

    /// Turn a Call into its one response
    pub async fn dispatch(&self, peer: PeerIdentity, call: Call) -> Message {
        let Call {
            correlation_id,
            action,
            payload,
        } = call;

        match self.invoke(peer, &action, payload).await {
            Ok(payload) => CallResult::new(correlation_id, payload).into(),
            Err(e) => {
                debug!("{} {} -> {}", action, correlation_id, e);
                e.into_call_error(correlation_id).into()
            }
        }
    }
}

impl std::fmt::Debug for ActionDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionDispatcher")
            .field("side", &self.side)
            .field("actions", &self.actions())
            .field("handler_timeout", &self.handler_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::ErrorCode;
    use serde_json::json;

    fn dispatcher() -> ActionDispatcher {
        ActionDispatcher::new(Side::CentralSystem, Duration::from_secs(5))
    }

    fn call(action: &str) -> Call {
        Call::new("c-1", action, json!({}))
    }

    #[tokio::test]
    async fn test_result_keeps_correlation_id() {
        let d = dispatcher();
        d.register("BootNotification", |_peer, _payload| async move {
            Ok(json!({"status": "Accepted"}))
        });

        match d.dispatch("CS1".into(), call("BootNotification")).await {
            Message::CallResult(result) => {
                assert_eq!(result.correlation_id, "c-1");
                assert_eq!(result.payload, json!({"status": "Accepted"}));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_action_not_implemented() {
        match dispatcher().dispatch("CS1".into(), call("Foo")).await {
            Message::CallError(e) => {
                assert_eq!(e.correlation_id, "c-1");
                assert_eq!(e.error_code, ErrorCode::NotImplemented);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_business_error_code_preserved() {
        let d = dispatcher();
        d.register("Authorize", |_peer, _payload| async move {
            Err(HandlerError::new(ErrorCode::SecurityError, "unknown token"))
        });
        match d.dispatch("CS1".into(), call("Authorize")).await {
            Message::CallError(e) => {
                assert_eq!(e.error_code, ErrorCode::SecurityError);
                assert_eq!(e.error_description, "unknown token");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_panic_becomes_internal_error() {
        let d = dispatcher();
        d.register("Reset", |_peer, _payload| async move {
            if true {
                panic!("boom");
            }
            Ok(json!({}))
        });
        match d.dispatch("CS1".into(), call("Reset")).await {
            Message::CallError(e) => assert_eq!(e.error_code, ErrorCode::InternalError),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_handler_times_out() {
        let d = ActionDispatcher::new(Side::CentralSystem, Duration::from_millis(100));
        d.register("Heartbeat", |_peer, _payload| async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(json!({}))
        });
        match d.dispatch("CS1".into(), call("Heartbeat")).await {
            Message::CallError(e) => assert_eq!(e.error_code, ErrorCode::InternalError),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_last_registration_wins() {
        let d = dispatcher();
        assert!(!d.register("Heartbeat", |_p, _x| async move { Ok(json!({"n": 1})) }));
        assert!(d.register("Heartbeat", |_p, _x| async move { Ok(json!({"n": 2})) }));
        assert_eq!(d.invoke("CS1".into(), &"Heartbeat".into(), json!({})).await.unwrap(), json!({"n": 2}));
        assert_eq!(d.actions(), vec![Action::from("Heartbeat")]);
    }
}
