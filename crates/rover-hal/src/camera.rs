//! Generic `Camera` trait and supporting types for image-capture hardware.

use rover_types::RoverError;

/// One encoded image returned by a camera driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraFrame {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Encoded image bytes (JPEG for the production camera).
    pub data: Vec<u8>,
}

impl CameraFrame {
    /// Encoded size in KiB, for logging.
    pub fn size_kb(&self) -> f64 {
        self.data.len() as f64 / 1024.0
    }
}

/// A camera or image-capture device.
///
/// Capture may block for a full exposure, so callers on an async runtime
/// should drive it from the blocking pool.
pub trait Camera: Send {
    /// Stable identifier for this camera, e.g. `"front_camera"`.
    fn id(&self) -> &str;

    /// Power up the sensor and begin streaming. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`RoverError::HardwareFault`] if the device cannot be opened.
    fn start(&mut self) -> Result<(), RoverError>;

    /// Capture and return the next available frame.
    ///
    /// # Errors
    ///
    /// Returns [`RoverError::HardwareFault`] if the frame cannot be captured
    /// (e.g. the device is disconnected or was never started).
    fn capture(&mut self) -> Result<CameraFrame, RoverError>;

    /// Stop streaming. Idempotent.
    fn stop(&mut self) -> Result<(), RoverError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MockCamera;

    impl Camera for MockCamera {
        fn id(&self) -> &str {
            "front_camera"
        }

        fn start(&mut self) -> Result<(), RoverError> {
            Ok(())
        }

        fn capture(&mut self) -> Result<CameraFrame, RoverError> {
            Ok(CameraFrame {
                width: 2,
                height: 2,
                data: vec![0u8; 2048],
            })
        }
    }

    #[test]
    fn mock_camera_capture() {
        let mut cam = MockCamera;
        assert_eq!(cam.id(), "front_camera");
        cam.start().unwrap();
        let frame = cam.capture().unwrap();
        assert_eq!(frame.width, 2);
        assert!((frame.size_kb() - 2.0).abs() < f64::EPSILON);
        cam.stop().unwrap();
    }
}
