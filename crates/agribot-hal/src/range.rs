//! Ultrasonic range sensors and the three-sensor proximity array.

use agribot_types::{AgriError, ProximityReadings};

/// A single distance sensor.
pub trait RangeSensor: Send + Sync {
    fn id(&self) -> &str;

    /// Latest distance in centimetres.  `0.0` or below means no echo.
    fn distance_cm(&mut self) -> Result<f32, AgriError>;
}

/// Front, left and right sensors read as one snapshot.
pub struct ProximityArray {
    front: Box<dyn RangeSensor>,
    left: Box<dyn RangeSensor>,
    right: Box<dyn RangeSensor>,
}

impl ProximityArray {
    pub fn new(
        front: Box<dyn RangeSensor>,
        left: Box<dyn RangeSensor>,
        right: Box<dyn RangeSensor>,
    ) -> Self {
        Self { front, left, right }
    }

    /// Read all three sensors.
    ///
    /// # Errors
    ///
    /// The first sensor failure is returned; the snapshot is never partial.
    pub fn read(&mut self) -> Result<ProximityReadings, AgriError> {
        Ok(ProximityReadings::new(
            self.front.distance_cm()?,
            self.left.distance_cm()?,
            self.right.distance_cm()?,
        ))
    }
}
