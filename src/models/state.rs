//! Instrument state for one sequencing run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Mutable instrument configuration tracked by the sequencer.
///
/// A fresh state is built for every run and passed by `&mut` through each
/// operation; it is never shared between runs. The type is serializable so
/// a caller can persist a snapshot and seed the next run with it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentState {
    /// Sequencer clock.
    pub current_time: DateTime<Utc>,
    /// Current azimuth (deg).
    pub az_now: f64,
    /// Current altitude (deg).
    pub alt_now: f64,
    /// Current boresight rotation (deg).
    pub boresight_rot_now: f64,
    /// Whether the half-wave plate is spinning.
    pub hwp_spinning: bool,
    /// Time of the last detector relock.
    pub last_relock_time: Option<DateTime<Utc>>,
    /// Time of the last detector setup (IV + bias).
    pub last_det_setup: Option<DateTime<Utc>>,
    /// Azimuth scan speed in effect (deg/s).
    pub az_speed_now: Option<f64>,
    /// Azimuth scan acceleration in effect (deg/s^2).
    pub az_accel_now: Option<f64>,
}

impl InstrumentState {
    /// Creates a state at `current_time`, parked at az=0, alt=0.
    pub fn new(current_time: DateTime<Utc>) -> Self {
        Self {
            current_time,
            az_now: 0.0,
            alt_now: 0.0,
            boresight_rot_now: 0.0,
            hwp_spinning: false,
            last_relock_time: None,
            last_det_setup: None,
            az_speed_now: None,
            az_accel_now: None,
        }
    }

    /// Sets the current pointing.
    pub fn with_pointing(mut self, az: f64, alt: f64) -> Self {
        self.az_now = az;
        self.alt_now = alt;
        self
    }

    /// Sets the boresight rotation.
    pub fn with_boresight_rot(mut self, rot: f64) -> Self {
        self.boresight_rot_now = rot;
        self
    }

    /// Sets the half-wave plate status.
    pub fn with_hwp_spinning(mut self, spinning: bool) -> Self {
        self.hwp_spinning = spinning;
        self
    }

    /// Sets the last relock time.
    pub fn with_last_relock(mut self, at: DateTime<Utc>) -> Self {
        self.last_relock_time = Some(at);
        self
    }

    /// Sets the scan parameters in effect.
    pub fn with_scan_params(mut self, az_speed: f64, az_accel: f64) -> Self {
        self.az_speed_now = Some(az_speed);
        self.az_accel_now = Some(az_accel);
        self
    }

    /// Moves the commanded pointing.
    pub(crate) fn point_to(&mut self, az: f64, alt: f64) {
        self.az_now = az;
        self.alt_now = alt;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_state_builder() {
        let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let state = InstrumentState::new(t0)
            .with_pointing(180.0, 60.0)
            .with_boresight_rot(45.0)
            .with_hwp_spinning(true)
            .with_scan_params(0.5, 0.25);

        assert_eq!(state.current_time, t0);
        assert_eq!(state.az_now, 180.0);
        assert_eq!(state.alt_now, 60.0);
        assert_eq!(state.boresight_rot_now, 45.0);
        assert!(state.hwp_spinning);
        assert_eq!(state.az_speed_now, Some(0.5));
        assert!(state.last_relock_time.is_none());
    }

    #[test]
    fn test_state_snapshot_roundtrip() {
        let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let state = InstrumentState::new(t0).with_last_relock(t0);
        let json = serde_json::to_string(&state).unwrap();
        let back: InstrumentState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }
}
