//! The `Controller` trait.
//!
//! A controller owns one capability (the message `type` it consumes) and the
//! hardware behind it. The router calls [`Controller::handle_command`] from
//! the receive loop; the supervisor spawns [`Controller::run`] once and calls
//! [`Controller::cleanup`] on shutdown.

use async_trait::async_trait;
use rover_types::{Envelope, RoverError};
use tokio_util::sync::CancellationToken;

#[async_trait]
pub trait Controller: Send + Sync {
    /// Human-readable name used in logs, e.g. `"MotorController"`.
    fn name(&self) -> &str;

    /// Message `type` this controller consumes; the routing key.
    fn capability(&self) -> &str;

    /// Accept an inbound command.
    ///
    /// Must be O(1) and must never block or touch hardware: it only records
    /// the command for the controller's own loop to act on.
    ///
    /// # Errors
    ///
    /// Returns [`RoverError::MalformedMessage`] when the payload cannot be
    /// interpreted. The previous command stays in effect.
    fn handle_command(&self, envelope: &Envelope) -> Result<(), RoverError>;

    /// Run the controller's periodic loop until `shutdown` fires.
    async fn run(&self, shutdown: CancellationToken);

    /// Diagnostic single-shot: apply `envelope` (or a built-in default)
    /// straight to the hardware, bypassing the periodic loop.
    fn test(&self, envelope: Option<&Envelope>) -> Result<(), RoverError>;

    /// Drive the hardware to its safe state and release it.
    ///
    /// Idempotent; never fails.
    fn cleanup(&self);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingController {
        commands: AtomicUsize,
    }

    #[async_trait]
    impl Controller for CountingController {
        fn name(&self) -> &str {
            "CountingController"
        }

        fn capability(&self) -> &str {
            "count"
        }

        fn handle_command(&self, _envelope: &Envelope) -> Result<(), RoverError> {
            self.commands.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn run(&self, shutdown: CancellationToken) {
            shutdown.cancelled().await;
        }

        fn test(&self, _envelope: Option<&Envelope>) -> Result<(), RoverError> {
            Ok(())
        }

        fn cleanup(&self) {}
    }

    #[tokio::test]
    async fn controller_is_usable_as_trait_object() {
        let controller: Arc<dyn Controller> = Arc::new(CountingController {
            commands: AtomicUsize::new(0),
        });
        controller.handle_command(&Envelope::new("count")).unwrap();
        assert_eq!(controller.capability(), "count");

        let token = CancellationToken::new();
        let runner = {
            let controller = Arc::clone(&controller);
            let token = token.clone();
            tokio::spawn(async move { controller.run(token).await })
        };
        token.cancel();
        runner.await.unwrap();
    }
}
