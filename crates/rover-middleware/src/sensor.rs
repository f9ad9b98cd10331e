//! Sensor producers.
//!
//! A [`Sensor`] produces one bounded payload per cycle and pushes it through
//! an [`Outbound`] handle. Sends are fire-and-forget: a failed send is
//! logged and the next cycle runs as usual.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::Utc;
use governor::{Quota, RateLimiter};
use parking_lot::Mutex;
use rover_hal::Camera;
use rover_types::{Envelope, RoverError, TelemetryFrame};
use tokio::task;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::connection::Outbound;

/// Default capture rate, frames per second.
pub const DEFAULT_FPS: u32 = 10;

/// Default settling time between starting the camera and the first capture.
pub const DEFAULT_WARMUP: Duration = Duration::from_secs(1);

/// Largest raw image accepted for a single frame.
pub const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// Outcome of the previous send, so a run of refused frames is reported
/// once at `warn` and then quietly.
#[derive(Debug, Default)]
struct DeliveryStreak {
    failing: bool,
}

impl DeliveryStreak {
    /// Record one send. Returns `true` when it is the first failure since
    /// the last delivered frame.
    fn record(&mut self, delivered: bool) -> bool {
        let first_failure = !delivered && !self.failing;
        self.failing = !delivered;
        first_failure
    }
}

#[async_trait]
pub trait Sensor: Send + Sync {
    fn name(&self) -> &str;

    /// Bring the device up, then produce and send one payload per cycle
    /// until `shutdown` fires.
    async fn run(&self, outbound: Arc<dyn Outbound>, shutdown: CancellationToken);

    /// Produce one payload.
    ///
    /// # Errors
    ///
    /// Returns [`RoverError::HardwareFault`] when the device cannot deliver
    /// a usable reading.
    async fn get_data(&self) -> Result<Envelope, RoverError>;

    /// Diagnostic single-shot: start the device if needed and produce one
    /// payload without sending it.
    async fn test(&self) -> Result<Envelope, RoverError>;

    /// Stop the device. Idempotent; never fails.
    fn cleanup(&self);
}

/// Streams base64-encoded camera frames as `camera_frame` envelopes.
///
/// Capture and encoding run on the blocking pool so a slow exposure never
/// stalls the receive loop.
pub struct CameraSensor<C: Camera + 'static> {
    name: String,
    camera: Arc<Mutex<C>>,
    seq: AtomicU64,
    fps: NonZeroU32,
    warmup: Duration,
    started: AtomicBool,
}

impl<C: Camera + 'static> CameraSensor<C> {
    pub fn new(camera: C) -> Self {
        Self {
            name: "CameraSensor".to_string(),
            camera: Arc::new(Mutex::new(camera)),
            seq: AtomicU64::new(0),
            fps: NonZeroU32::new(DEFAULT_FPS).unwrap_or(NonZeroU32::MIN),
            warmup: DEFAULT_WARMUP,
            started: AtomicBool::new(false),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_fps(mut self, fps: NonZeroU32) -> Self {
        self.fps = fps;
        self
    }

    pub fn with_warmup(mut self, warmup: Duration) -> Self {
        self.warmup = warmup;
        self
    }

    pub fn fps(&self) -> NonZeroU32 {
        self.fps
    }

    /// Sequence number the next frame will carry.
    pub fn next_seq(&self) -> u64 {
        self.seq.load(Ordering::SeqCst)
    }

    /// Start the camera and wait out the warm-up. No-op once started.
    async fn ensure_started(&self) -> Result<(), RoverError> {
        if self.started.load(Ordering::SeqCst) {
            return Ok(());
        }

        let camera = Arc::clone(&self.camera);
        task::spawn_blocking(move || {
            let mut camera = camera.lock();
            camera.start()
        })
        .await
        .map_err(|e| RoverError::hardware(&self.name, format!("start task failed: {e}")))??;
        self.started.store(true, Ordering::SeqCst);

        info!(sensor = %self.name, warmup_ms = self.warmup.as_millis() as u64, "camera started");
        time::sleep(self.warmup).await;
        Ok(())
    }

    /// Capture one frame and base64-encode it off the async executor.
    /// Capture on the blocking pool. Returns the raw size in KiB and the
    /// base64 payload.
    async fn capture_encoded(&self) -> Result<(f64, String), RoverError> {
        let camera = Arc::clone(&self.camera);
        task::spawn_blocking(move || {
            let mut camera = camera.lock();
            let frame = camera.capture()?;
            if frame.data.len() > MAX_FRAME_BYTES {
                return Err(RoverError::hardware(
                    camera.id(),
                    format!(
                        "frame of {} bytes exceeds the {MAX_FRAME_BYTES} byte limit",
                        frame.data.len()
                    ),
                ));
            }
            Ok((frame.size_kb(), STANDARD.encode(&frame.data)))
        })
        .await
        .map_err(|e| RoverError::hardware(&self.name, format!("capture task failed: {e}")))?
    }
}

#[async_trait]
impl<C: Camera + 'static> Sensor for CameraSensor<C> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, outbound: Arc<dyn Outbound>, shutdown: CancellationToken) {
        tokio::select! {
            biased;
            () = shutdown.cancelled() => return,
            started = self.ensure_started() => {
                if let Err(e) = started {
                    error!(sensor = %self.name, error = %e, "camera failed to start, sensor disabled");
                    return;
                }
            }
        }

        let limiter = RateLimiter::direct(Quota::per_second(self.fps).allow_burst(NonZeroU32::MIN));
        info!(sensor = %self.name, fps = self.fps.get(), "streaming frames");
        let mut streak = DeliveryStreak::default();

        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                () = limiter.until_ready() => {}
            }

            match self.get_data().await {
                Ok(envelope) => {
                    let delivered = outbound.send(&envelope).await;
                    if streak.record(delivered) {
                        warn!(sensor = %self.name, "frames are not being delivered, dropping until the link recovers");
                    } else if !delivered {
                        debug!(sensor = %self.name, "frame not delivered");
                    }
                }
                Err(e) => warn!(sensor = %self.name, error = %e, "capture failed"),
            }
        }
        debug!(sensor = %self.name, "sensor loop stopped");
    }

    async fn get_data(&self) -> Result<Envelope, RoverError> {
        let (size_kb, data) = self.capture_encoded().await?;
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let timestamp = Utc::now().timestamp_micros() as f64 / 1_000_000.0;
        debug!(sensor = %self.name, seq, size_kb, "frame captured");
        Ok(TelemetryFrame {
            timestamp,
            seq,
            data,
        }
        .into_envelope())
    }

    async fn test(&self) -> Result<Envelope, RoverError> {
        self.ensure_started().await?;
        let envelope = self.get_data().await?;
        info!(sensor = %self.name, "test frame captured");
        Ok(envelope)
    }

    fn cleanup(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.camera.lock().stop() {
            warn!(sensor = %self.name, error = %e, "camera stop failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rover_hal::CameraFrame;
    use rover_hal::sim::SimCamera;
    use rover_types::CAMERA_FRAME;

    #[derive(Default)]
    struct RecordingOutbound {
        frames: Mutex<Vec<Envelope>>,
        attempts: AtomicU64,
        refuse: bool,
    }

    impl RecordingOutbound {
        fn refusing() -> Self {
            Self {
                refuse: true,
                ..Self::default()
            }
        }

        fn attempts(&self) -> u64 {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Outbound for RecordingOutbound {
        async fn send(&self, envelope: &Envelope) -> bool {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.refuse {
                return false;
            }
            self.frames.lock().push(envelope.clone());
            true
        }
    }

    struct OversizedCamera;

    impl Camera for OversizedCamera {
        fn id(&self) -> &str {
            "oversized"
        }

        fn start(&mut self) -> Result<(), RoverError> {
            Ok(())
        }

        fn capture(&mut self) -> Result<CameraFrame, RoverError> {
            Ok(CameraFrame {
                width: 8192,
                height: 8192,
                data: vec![0; MAX_FRAME_BYTES + 1],
            })
        }
    }

    struct DeadCamera;

    impl Camera for DeadCamera {
        fn id(&self) -> &str {
            "dead"
        }

        fn start(&mut self) -> Result<(), RoverError> {
            Err(RoverError::hardware("dead", "no device"))
        }

        fn capture(&mut self) -> Result<CameraFrame, RoverError> {
            Err(RoverError::hardware("dead", "no device"))
        }
    }

    fn fast_sensor() -> CameraSensor<SimCamera> {
        CameraSensor::new(SimCamera::new("front_camera"))
            .with_fps(NonZeroU32::new(200).unwrap())
            .with_warmup(Duration::ZERO)
    }

    async fn wait_until(mut done: impl FnMut() -> bool) {
        time::timeout(Duration::from_secs(2), async {
            while !done() {
                time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_frame_is_a_base64_camera_envelope() {
        let sensor = fast_sensor();
        let envelope = sensor.test().await.unwrap();

        assert_eq!(envelope.kind, CAMERA_FRAME);
        assert_eq!(envelope.field("seq").and_then(|v| v.as_u64()), Some(0));
        assert!(envelope.field("timestamp").and_then(|v| v.as_f64()).unwrap() > 0.0);

        let data = envelope.field("data").and_then(|v| v.as_str()).unwrap();
        let bytes = STANDARD.decode(data).unwrap();
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
        assert_eq!(&bytes[bytes.len() - 2..], &[0xFF, 0xD9]);
    }

    #[tokio::test]
    async fn capture_before_start_fails_without_consuming_seq() {
        let sensor = fast_sensor();
        assert!(matches!(
            sensor.get_data().await,
            Err(RoverError::HardwareFault { .. })
        ));
        assert_eq!(sensor.next_seq(), 0);
    }

    #[tokio::test]
    async fn oversized_frames_are_rejected() {
        let sensor = CameraSensor::new(OversizedCamera).with_warmup(Duration::ZERO);
        let err = sensor.test().await.unwrap_err();
        assert!(matches!(err, RoverError::HardwareFault { ref component, .. } if component == "oversized"));
        assert_eq!(sensor.next_seq(), 0);
    }

    #[tokio::test]
    async fn run_streams_frames_with_increasing_seq() {
        let sensor = Arc::new(fast_sensor());
        let outbound = Arc::new(RecordingOutbound::default());
        let token = CancellationToken::new();

        let handle = {
            let sensor = Arc::clone(&sensor);
            let outbound: Arc<dyn Outbound> = outbound.clone();
            let token = token.clone();
            tokio::spawn(async move { sensor.run(outbound, token).await })
        };

        wait_until(|| outbound.frames.lock().len() >= 3).await;
        token.cancel();
        handle.await.unwrap();

        let seqs: Vec<u64> = outbound
            .frames
            .lock()
            .iter()
            .map(|e| e.field("seq").and_then(|v| v.as_u64()).unwrap())
            .collect();
        assert_eq!(seqs[0], 0);
        assert!(seqs.windows(2).all(|w| w[1] == w[0] + 1), "{seqs:?}");
    }

    #[tokio::test]
    async fn failed_sends_do_not_stop_the_cycle() {
        let sensor = Arc::new(fast_sensor());
        let outbound = Arc::new(RecordingOutbound::refusing());
        let token = CancellationToken::new();

        let handle = {
            let sensor = Arc::clone(&sensor);
            let outbound: Arc<dyn Outbound> = outbound.clone();
            let token = token.clone();
            tokio::spawn(async move { sensor.run(outbound, token).await })
        };

        wait_until(|| outbound.attempts() >= 3).await;
        token.cancel();
        handle.await.unwrap();
        assert!(sensor.next_seq() >= 3);
    }

    #[test]
    fn only_the_first_refusal_of_a_streak_is_flagged() {
        let mut streak = DeliveryStreak::default();
        assert!(!streak.record(true));
        assert!(streak.record(false));
        assert!(!streak.record(false));
        assert!(!streak.record(false));
        assert!(!streak.record(true));
        assert!(streak.record(false));
    }

    #[test]
    fn refusal_before_any_delivery_is_flagged() {
        assert!(DeliveryStreak::default().record(false));
    }

    #[tokio::test]
    async fn run_gives_up_when_camera_cannot_start() {
        let sensor = CameraSensor::new(DeadCamera).with_warmup(Duration::ZERO);
        let outbound: Arc<dyn Outbound> = Arc::new(RecordingOutbound::default());
        time::timeout(
            Duration::from_secs(1),
            sensor.run(outbound, CancellationToken::new()),
        )
        .await
        .expect("run should return when the camera fails to start");
    }

    #[tokio::test]
    async fn cleanup_stops_the_camera_once() {
        let sensor = fast_sensor();
        sensor.test().await.unwrap();
        sensor.cleanup();
        sensor.cleanup();
        assert!(sensor.get_data().await.is_err());
    }
}
