//! Bridge wiring and lifecycle.
//!
//! Everything the bridge will ever run is handed to a [`BridgeBuilder`]
//! before [`BridgeBuilder::build`]; the routing table is frozen at that point
//! so no task can observe a half-registered set.
//!
//! Start order: controller loops (so the actuators are held safe while the
//! link is still down), connect, receive loop, sensor loops.
//!
//! Shutdown order: cancel every task, wait up to [`SHUTDOWN_GRACE`] for each
//! (abort stragglers), clean up controllers in registration order, stop the
//! sensors, close the link.

use std::sync::Arc;
use std::time::Duration;

use rover_kernel::Controller;
use rover_middleware::{CommandRouter, ConnectionManager, Outbound, RouterBuilder, Sensor};
use rover_types::RoverError;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// How long each background task gets to stop after cancellation.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Default)]
pub struct BridgeBuilder {
    router: RouterBuilder,
    sensors: Vec<Arc<dyn Sensor>>,
}

impl BridgeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn controller(mut self, controller: Arc<dyn Controller>) -> Self {
        self.router = self.router.register(controller);
        self
    }

    pub fn sensor(mut self, sensor: Arc<dyn Sensor>) -> Self {
        self.sensors.push(sensor);
        self
    }

    pub fn build(self, link: ConnectionManager) -> BridgeSupervisor {
        BridgeSupervisor {
            link: Arc::new(link),
            router: Arc::new(self.router.build()),
            sensors: self.sensors,
            shutdown: CancellationToken::new(),
            tasks: Vec::new(),
        }
    }
}

/// Owns the link, the frozen routing table and every background task.
pub struct BridgeSupervisor {
    link: Arc<ConnectionManager>,
    router: Arc<CommandRouter>,
    sensors: Vec<Arc<dyn Sensor>>,
    shutdown: CancellationToken,
    tasks: Vec<(String, JoinHandle<()>)>,
}

impl BridgeSupervisor {
    /// Token that stops the bridge when cancelled. Hand a clone to the
    /// signal handler.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn link(&self) -> &Arc<ConnectionManager> {
        &self.link
    }

    pub fn router(&self) -> &CommandRouter {
        &self.router
    }

    /// Start every task.
    ///
    /// Returns once the link is up and all loops are running.
    ///
    /// # Errors
    ///
    /// Returns [`RoverError::Shutdown`] if the shutdown token fires while
    /// still connecting. Controller loops are already running at that
    /// point; call [`BridgeSupervisor::shutdown`] to stop them.
    pub async fn start(&mut self) -> Result<(), RoverError> {
        for controller in self.router.controllers() {
            let controller = Arc::clone(controller);
            let token = self.shutdown.child_token();
            let name = controller.name().to_string();
            info!(controller = %name, capability = controller.capability(), "starting controller");
            self.tasks
                .push((name, tokio::spawn(async move { controller.run(token).await })));
        }

        tokio::select! {
            biased;
            () = self.shutdown.cancelled() => return Err(RoverError::Shutdown),
            attempts = self.link.connect() => {
                info!(endpoint = self.link.endpoint(), attempts, "link established");
            }
        }

        {
            let link = Arc::clone(&self.link);
            let router = Arc::clone(&self.router);
            let token = self.shutdown.child_token();
            self.tasks.push((
                "receive-loop".to_string(),
                tokio::spawn(async move { link.receive_loop(&router, token).await }),
            ));
        }

        for sensor in &self.sensors {
            let sensor = Arc::clone(sensor);
            let outbound: Arc<dyn Outbound> = self.link.clone();
            let token = self.shutdown.child_token();
            let name = sensor.name().to_string();
            info!(sensor = %name, "starting sensor");
            self.tasks
                .push((name, tokio::spawn(async move { sensor.run(outbound, token).await })));
        }

        info!(
            controllers = self.router.len(),
            sensors = self.sensors.len(),
            "bridge running"
        );
        Ok(())
    }

    /// Stop the bridge. Safe to call more than once.
    pub async fn shutdown(&mut self) {
        info!("shutting down bridge");
        self.shutdown.cancel();

        for (name, mut handle) in self.tasks.drain(..) {
            match time::timeout(SHUTDOWN_GRACE, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(task = %name, error = %e, "task failed"),
                Err(_) => {
                    warn!(task = %name, "task ignored cancellation, aborting");
                    handle.abort();
                    // Cleanup must not race a task still mid-poll on another worker.
                    if let Err(e) = handle.await
                        && !e.is_cancelled()
                    {
                        warn!(task = %name, error = %e, "task failed while aborting");
                    }
                }
            }
        }

        for controller in self.router.controllers() {
            controller.cleanup();
        }
        for sensor in &self.sensors {
            sensor.cleanup();
        }

        self.link.close().await;
        info!("bridge stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use rover_hal::sim::{SimCamera, SimMotorDriver, SimMotorProbe};
    use rover_kernel::MotorController;
    use rover_middleware::CameraSensor;
    use rover_middleware::sim::{LoopbackConnector, LoopbackPeer};
    use rover_types::{CAMERA_FRAME, ConnectionState, Envelope, MOTOR_CMD, MotorCommand};
    use std::num::NonZeroU32;
    use tokio::sync::mpsc;

    const WAIT: Duration = Duration::from_secs(2);

    fn motor() -> (Arc<MotorController<SimMotorDriver>>, SimMotorProbe) {
        let (driver, probe) = SimMotorDriver::new("drive_base");
        (Arc::new(MotorController::new(driver)), probe)
    }

    fn loopback_link(connector: &LoopbackConnector) -> ConnectionManager {
        ConnectionManager::new("loop://operator", Arc::new(connector.clone()))
            .with_backoff(Duration::from_millis(10))
    }

    async fn next_peer(peers: &mut mpsc::UnboundedReceiver<LoopbackPeer>) -> LoopbackPeer {
        time::timeout(WAIT, peers.recv()).await.unwrap().unwrap()
    }

    type Events = Arc<Mutex<Vec<String>>>;

    /// Records when the task holding it is dropped.
    struct StopMarker {
        name: &'static str,
        events: Events,
    }

    impl Drop for StopMarker {
        fn drop(&mut self) {
            self.events.lock().push(format!("{} stopped", self.name));
        }
    }

    struct Stubborn {
        name: &'static str,
        events: Events,
    }

    #[async_trait]
    impl Controller for Stubborn {
        fn name(&self) -> &str {
            self.name
        }

        fn capability(&self) -> &str {
            "stubborn_cmd"
        }

        fn handle_command(&self, _envelope: &Envelope) -> Result<(), RoverError> {
            Ok(())
        }

        async fn run(&self, _shutdown: CancellationToken) {
            let _marker = StopMarker {
                name: self.name,
                events: Arc::clone(&self.events),
            };
            std::future::pending::<()>().await;
        }

        fn test(&self, _envelope: Option<&Envelope>) -> Result<(), RoverError> {
            Ok(())
        }

        fn cleanup(&self) {
            self.events.lock().push(format!("{} cleaned", self.name));
        }
    }

    #[tokio::test]
    async fn commands_drive_motors_and_frames_reach_operator() {
        let (connector, mut peers) = LoopbackConnector::new();
        let (motor, probe) = motor();
        let camera = Arc::new(
            CameraSensor::new(SimCamera::new("front_camera"))
                .with_fps(NonZeroU32::new(50).unwrap())
                .with_warmup(Duration::ZERO),
        );

        let mut bridge = BridgeBuilder::new()
            .controller(motor.clone())
            .sensor(camera)
            .build(loopback_link(&connector));
        bridge.start().await.unwrap();
        assert_eq!(bridge.link().state(), ConnectionState::Connected);

        let mut peer = next_peer(&mut peers).await;
        let command = Envelope::new(MOTOR_CMD)
            .with_field("left_motor", 0.8)
            .with_field("right_motor", -0.5);
        assert!(peer.send_envelope(&command));

        time::timeout(WAIT, async {
            while probe.last_output() != MotorCommand::new(0.8, -0.5) {
                time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("command never reached the motor");

        let frame = time::timeout(WAIT, peer.recv()).await.unwrap().unwrap();
        assert_eq!(Envelope::parse(&frame).unwrap().kind, CAMERA_FRAME);

        bridge.shutdown().await;
        assert!(probe.is_released());
        assert!(probe.last_output().is_stop());
        assert_eq!(bridge.link().state(), ConnectionState::Disconnected);

        // Drain whatever was in flight; the stream must then end.
        while time::timeout(WAIT, peer.recv()).await.unwrap().is_some() {}
    }

    #[tokio::test]
    async fn actuators_are_held_safe_while_offline_and_shutdown_interrupts_connect() {
        let (connector, _peers) = LoopbackConnector::new();
        let connector = connector.failing_first(u32::MAX);
        let (motor, probe) = motor();

        let mut bridge = BridgeBuilder::new()
            .controller(motor)
            .build(loopback_link(&connector));
        let token = bridge.shutdown_token();
        tokio::spawn(async move {
            time::sleep(Duration::from_millis(250)).await;
            token.cancel();
        });

        let started = time::timeout(WAIT, bridge.start()).await.unwrap();
        assert!(matches!(started, Err(RoverError::Shutdown)));
        assert!(connector.attempts() > 1);
        assert!(probe.apply_count() > 0);
        assert!(probe.history().iter().all(MotorCommand::is_stop));

        bridge.shutdown().await;
        assert!(probe.is_released());
    }

    #[tokio::test(start_paused = true)]
    async fn stragglers_are_gone_before_cleanup_runs_in_registration_order() {
        let (connector, _peers) = LoopbackConnector::new();
        let events: Events = Arc::new(Mutex::new(Vec::new()));
        let first = Arc::new(Stubborn {
            name: "first",
            events: Arc::clone(&events),
        });
        let second = Arc::new(Stubborn {
            name: "second",
            events: Arc::clone(&events),
        });

        let mut bridge = BridgeBuilder::new()
            .controller(first)
            .controller(second)
            .build(loopback_link(&connector));
        bridge.start().await.unwrap();

        let before = time::Instant::now();
        bridge.shutdown().await;
        assert!(before.elapsed() >= SHUTDOWN_GRACE);
        assert_eq!(
            *events.lock(),
            vec!["first stopped", "second stopped", "first cleaned", "second cleaned"]
        );

        bridge.shutdown().await;
        assert_eq!(events.lock().len(), 6);
    }
}
