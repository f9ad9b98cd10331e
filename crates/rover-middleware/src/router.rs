//! Type-based command routing.
//!
//! The routing table is assembled once with a [`RouterBuilder`] and frozen
//! into a [`CommandRouter`]; there is no way to add or remove a controller
//! after [`RouterBuilder::build`] has run.

use std::collections::HashMap;
use std::sync::Arc;

use rover_kernel::Controller;
use rover_types::{Envelope, RoverError};
use tracing::{debug, warn};

/// Collects controllers before the router is frozen.
#[derive(Default)]
pub struct RouterBuilder {
    controllers: Vec<Arc<dyn Controller>>,
}

impl RouterBuilder {
    /// Register `controller` under its [`Controller::capability`].
    ///
    /// Several controllers may share a capability; each receives every
    /// envelope of that type, in registration order.
    pub fn register(mut self, controller: Arc<dyn Controller>) -> Self {
        self.controllers.push(controller);
        self
    }

    pub fn build(self) -> CommandRouter {
        let mut routes: HashMap<String, Vec<Arc<dyn Controller>>> = HashMap::new();
        for controller in &self.controllers {
            routes
                .entry(controller.capability().to_string())
                .or_default()
                .push(Arc::clone(controller));
        }
        CommandRouter {
            routes,
            controllers: self.controllers,
        }
    }
}

/// Immutable capability table mapping a message `type` to its controllers.
pub struct CommandRouter {
    routes: HashMap<String, Vec<Arc<dyn Controller>>>,
    controllers: Vec<Arc<dyn Controller>>,
}

impl CommandRouter {
    pub fn builder() -> RouterBuilder {
        RouterBuilder::default()
    }

    /// Hand `envelope` to every controller registered for its type.
    ///
    /// Returns how many controllers accepted it. Unmatched types and
    /// payloads a controller rejects are logged and dropped; neither is an
    /// error for the caller.
    pub fn route(&self, envelope: &Envelope) -> usize {
        let Some(targets) = self.routes.get(&envelope.kind) else {
            warn!(kind = %envelope.kind, "no controller registered for message type, dropping");
            return 0;
        };

        let mut delivered = 0;
        for controller in targets {
            match controller.handle_command(envelope) {
                Ok(()) => {
                    delivered += 1;
                    debug!(controller = controller.name(), kind = %envelope.kind, "command delivered");
                }
                Err(e) => {
                    warn!(controller = controller.name(), error = %e, "controller rejected command");
                }
            }
        }
        delivered
    }

    /// Parse a raw frame and route it.
    ///
    /// # Errors
    ///
    /// Returns [`RoverError::MalformedMessage`] when `frame` is not a valid
    /// envelope. No controller is touched in that case.
    pub fn route_frame(&self, frame: &str) -> Result<usize, RoverError> {
        let envelope = Envelope::parse(frame)?;
        Ok(self.route(&envelope))
    }

    /// Every registered controller, in registration order.
    pub fn controllers(&self) -> &[Arc<dyn Controller>] {
        &self.controllers
    }

    /// Distinct capabilities with at least one controller, sorted.
    pub fn capabilities(&self) -> Vec<&str> {
        let mut caps: Vec<&str> = self.routes.keys().map(String::as_str).collect();
        caps.sort_unstable();
        caps
    }

    pub fn len(&self) -> usize {
        self.controllers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.controllers.is_empty()
    }
}
