//! On/off outputs.  The unit has one: the spray pump.

use std::time::Duration;

use agribot_types::AgriError;
use tracing::debug;

pub trait Relay: Send + Sync {
    /// e.g. `"pump"`.
    fn id(&self) -> &str;

    /// Energise (`true`) or release the output.
    ///
    /// # Errors
    ///
    /// [`AgriError::Hardware`] if the driver cannot apply the state.
    fn set_state(&mut self, active: bool) -> Result<(), AgriError>;

    fn state(&self) -> bool;

    /// Like [`set_state`][Self::set_state] but skips the driver when the
    /// output is already there.  Returns whether anything changed.
    fn switch(&mut self, active: bool) -> Result<bool, AgriError> {
        if self.state() == active {
            return Ok(false);
        }
        self.set_state(active)?;
        debug!(relay = self.id(), active, "relay switched");
        Ok(true)
    }
}

/// Hold `relay` on for `duration`, then release it.
///
/// The release is attempted even when switching on failed.
pub async fn pulse(relay: &mut dyn Relay, duration: Duration) -> Result<(), AgriError> {
    let on = relay.switch(true);
    if on.is_ok() {
        tokio::time::sleep(duration).await;
    }
    let off = relay.set_state(false);
    on.and(off)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Records every state the driver was asked to apply.
    #[derive(Default)]
    struct Recorder {
        applied: Vec<bool>,
        fail_on: bool,
    }

    impl Relay for Recorder {
        fn id(&self) -> &str {
            "pump"
        }

        fn set_state(&mut self, active: bool) -> Result<(), AgriError> {
            self.applied.push(active);
            if active && self.fail_on {
                return Err(AgriError::Hardware {
                    component: "pump".into(),
                    details: "coil open".into(),
                });
            }
            Ok(())
        }

        fn state(&self) -> bool {
            self.applied.last().copied().unwrap_or(false)
        }
    }

    #[test]
    fn switch_only_drives_on_change() {
        let mut pump = Recorder::default();
        assert!(!pump.switch(false).unwrap());
        assert!(pump.switch(true).unwrap());
        assert!(!pump.switch(true).unwrap());
        assert!(pump.switch(false).unwrap());
        assert_eq!(pump.applied, vec![true, false]);
    }

    #[tokio::test(start_paused = true)]
    async fn pulse_holds_then_releases() {
        let mut pump = Recorder::default();
        let started = tokio::time::Instant::now();
        pulse(&mut pump, Duration::from_secs(2)).await.unwrap();
        assert_eq!(started.elapsed(), Duration::from_secs(2));
        assert_eq!(pump.applied, vec![true, false]);
        assert!(!pump.state());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_pulse_still_releases() {
        let mut pump = Recorder {
            fail_on: true,
            ..Recorder::default()
        };
        let err = pulse(&mut pump, Duration::from_secs(2)).await.unwrap_err();
        assert!(matches!(err, AgriError::Hardware { .. }));
        assert_eq!(pump.applied, vec![true, false]);
    }
}
