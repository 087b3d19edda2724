//! Multi-hop routing
//!
//! A routed Call carries its destination and the path of nodes it has
//! crossed. Each networking node appends itself and hands the Call to the
//! next hop towards the destination. The answer carries the same path and
//! walks it backwards, so intermediate nodes keep no per-request state.
//!
//! ```text
//!   Call      CSMS ──▶ NN1 ──▶ NN2 ──▶ CP7      path grows: [CSMS] [CSMS,NN1] [CSMS,NN1,NN2]
//!   Result    CSMS ◀── NN1 ◀── NN2 ◀── CP7      each hop reads the entry before its own
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, error, warn};

use crate::error::{RequestError, RoutingError};
use crate::events::{EventBus, ProtocolEvent};
use crate::messages::{CallError, Envelope, ErrorCode, Message};
use crate::registry::PeerRegistry;
use crate::types::{Action, NodeId, Payload, PeerIdentity, Route};

/// What a node does with an inbound envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    /// Addressed to this node
    Local,
    /// Call continuing towards its destination
    Forward { next_hop: NodeId },
    /// Answer walking the path backwards
    Back { previous_hop: NodeId },
    /// Call that cannot be routed; answered with a RoutingFailure
    Reject(RoutingError),
    /// Answer with nowhere to go; only observable here
    Drop(RoutingError),
}

pub struct Router {
    node_id: NodeId,
    routes: RwLock<HashMap<NodeId, NodeId>>,
    default_route: RwLock<Option<NodeId>>,
    neighbors: Arc<PeerRegistry>,
    events: EventBus,
}

impl Router {
    pub fn new(node_id: impl Into<NodeId>, neighbors: Arc<PeerRegistry>, events: EventBus) -> Self {
        Self {
            node_id: node_id.into(),
            routes: RwLock::new(HashMap::new()),
            default_route: RwLock::new(None),
            neighbors,
            events,
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Reach `destination` through the neighbor `via`
    pub fn add_route(&self, destination: impl Into<NodeId>, via: impl Into<NodeId>) {
        self.routes.write().insert(destination.into(), via.into());
    }

    pub fn remove_route(&self, destination: &str) -> Option<NodeId> {
        self.routes.write().remove(destination)
    }

    /// Neighbor used for destinations without an explicit route
    pub fn set_default_route(&self, via: Option<NodeId>) {
        *self.default_route.write() = via;
    }

    /// Neighbor towards `destination`: a connected neighbor of that name,
    /// then the route table, then the default route.
    pub fn next_hop(&self, destination: &str) -> Option<NodeId> {
        if self.neighbors.contains(&PeerIdentity::from(destination)) {
            return Some(destination.to_string());
        }
        if let Some(via) = self.routes.read().get(destination) {
            return Some(via.clone());
        }
        self.default_route.read().clone()
    }

    pub fn decide(&self, envelope: &Envelope) -> RouteDecision {
        let Some(route) = &envelope.route else {
            return RouteDecision::Local;
        };
        let path = &route.network_path;

        if envelope.message.is_call() {
            if let Some(node) = path.first_repeated() {
                return RouteDecision::Reject(RoutingError::Loop {
                    node: node.clone(),
                    path: path.clone(),
                });
            }
            if path.contains(&self.node_id) {
                return RouteDecision::Reject(RoutingError::Loop {
                    node: self.node_id.clone(),
                    path: path.clone(),
                });
            }
            if route.destination == self.node_id {
                return RouteDecision::Local;
            }
            // Without a recorded originator the answer could never find its way back
            if path.is_empty() {
                return RouteDecision::Reject(RoutingError::NoReturnPath(path.clone()));
            }
            match self.next_hop(&route.destination) {
                Some(next_hop) => RouteDecision::Forward { next_hop },
                None => {
                    error!(
                        "No route from {} towards {} (path {})",
                        self.node_id, route.destination, path
                    );
                    RouteDecision::Reject(RoutingError::NoRoute(route.destination.clone()))
                }
            }
        } else {
            if route.destination == self.node_id {
                return RouteDecision::Local;
            }
            match path.previous_hop(&self.node_id) {
                Some(previous_hop) => RouteDecision::Back {
                    previous_hop: previous_hop.clone(),
                },
                None => RouteDecision::Drop(RoutingError::NoReturnPath(path.clone())),
            }
        }
    }

    /// Append this node to the path and send the Call to `next_hop`
    pub async fn forward(&self, mut envelope: Envelope, next_hop: &NodeId) -> Result<(), RoutingError> {
        let from = envelope
            .route
            .as_ref()
            .and_then(|route| route.network_path.last().cloned())
            .unwrap_or_else(|| self.node_id.clone());
        if let Some(route) = envelope.route.as_mut() {
            route.network_path.push(self.node_id.clone());
        }

        self.send_to(&envelope, next_hop).await?;
        debug!("Forwarded {} from {} to {}", envelope.correlation_id(), from, next_hop);
        self.events.publish(ProtocolEvent::Forwarded {
            correlation_id: envelope.correlation_id().clone(),
            from,
            to: next_hop.clone(),
        });
        Ok(())
    }

    /// Send an answer one step back along its path; the path is not modified
    pub async fn route_back(&self, envelope: Envelope, previous_hop: &NodeId) -> Result<(), RoutingError> {
        self.send_to(&envelope, previous_hop).await?;
        debug!("Routed {} back to {}", envelope.correlation_id(), previous_hop);
        self.events.publish(ProtocolEvent::Forwarded {
            correlation_id: envelope.correlation_id().clone(),
            from: self.node_id.clone(),
            to: previous_hop.clone(),
        });
        Ok(())
    }

    async fn send_to(&self, envelope: &Envelope, hop: &NodeId) -> Result<(), RoutingError> {
        let connection = self
            .neighbors
            .get(&PeerIdentity::from(hop.as_str()))
            .ok_or_else(|| RoutingError::HopUnavailable(hop.clone()))?;
        connection.send_envelope(envelope).await.map_err(|e| {
            warn!("Next hop {} unusable: {}", hop, e);
            RoutingError::HopUnavailable(hop.clone())
        })
    }

    /// RoutingFailure answer for a rejected Call, addressed back to its
    /// originator along the traversed prefix. `None` for answers.
    pub fn rejection(&self, envelope: &Envelope, error: &RoutingError) -> Option<Envelope> {
        let Message::Call(call) = &envelope.message else {
            return None;
        };
        warn!("Rejecting {} ({}): {}", call.correlation_id, call.action, error);
        self.events.publish(ProtocolEvent::RoutingRejected {
            correlation_id: call.correlation_id.clone(),
            error: error.clone(),
        });

        let answer = CallError::new(
            call.correlation_id.clone(),
            ErrorCode::RoutingFailure,
            error.to_string(),
        );
        Some(
            Envelope::direct(answer)
                .with_route(envelope.route.as_ref().and_then(Route::reply))
                .with_action(call.action.clone()),
        )
    }

    /// Send a Call to any node this one can reach.
    ///
    /// Neighbors get a direct exchange; anything further away gets a route
    /// originating here.
    pub async fn request(
        &self,
        destination: &str,
        action: impl Into<Action>,
        payload: Payload,
    ) -> Result<Payload, RequestError> {
        let hop = self
            .next_hop(destination)
            .ok_or_else(|| RoutingError::NoRoute(destination.to_string()))?;
        let connection = self
            .neighbors
            .get(&PeerIdentity::from(hop.as_str()))
            .ok_or_else(|| RoutingError::HopUnavailable(hop.clone()))?;

        if hop == destination {
            connection.send_request(action, payload).await
        } else {
            let route = Route::originate(destination, self.node_id.clone());
            connection.send_routed_request(route, action, payload).await
        }
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("node_id", &self.node_id)
            .field("routes", &*self.routes.read())
            .field("default_route", &*self.default_route.read())
            .finish()
    }
}
