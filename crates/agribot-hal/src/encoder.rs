//! Quadrature pulse counters and the pulse/length conversion.

use agribot_types::AgriError;

/// A pulse counter attached to a lead screw or wheel.
pub trait Encoder: Send + Sync {
    fn id(&self) -> &str;

    /// Signed pulse count since the last [`reset`][Self::reset].
    fn pulses(&self) -> Result<i64, AgriError>;

    /// Zero the count at the current physical position.
    fn reset(&mut self) -> Result<(), AgriError>;
}

/// Convert a pulse count to centimetres of travel.
pub fn pulses_to_cm(pulses: i64, pulses_per_cm: f32) -> f32 {
    if pulses_per_cm <= 0.0 {
        return 0.0;
    }
    pulses as f32 / pulses_per_cm
}

/// Convert centimetres of travel to the nearest whole pulse count.
pub fn cm_to_pulses(cm: f32, pulses_per_cm: f32) -> i64 {
    (cm * pulses_per_cm).round() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversion_is_symmetric() {
        assert_eq!(cm_to_pulses(6.5, 20.0), 130);
        assert!((pulses_to_cm(130, 20.0) - 6.5).abs() < f32::EPSILON);
        assert!((pulses_to_cm(-40, 20.0) + 2.0).abs() < f32::EPSILON);
    }

    #[test]
    fn zero_resolution_reads_zero() {
        assert_eq!(pulses_to_cm(500, 0.0), 0.0);
    }
}
