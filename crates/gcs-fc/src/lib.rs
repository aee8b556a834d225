pub mod cancel;
pub mod coordinator;
pub mod doctor;
pub mod error;
pub mod link;
pub mod mav;
pub mod mode;
pub mod safety;
pub mod sampler;
pub mod state;
pub mod station;
pub mod velocity;

#[cfg(test)]
mod testing;

use std::time::Duration;

use serde::Deserialize;

use crate::coordinator::{CoordinatorConfig, DEFAULT_CONFIRM_TIMEOUT, MAX_CONFIRM_TIMEOUT};
use crate::safety::{AirborneGuard, DEFAULT_AIRBORNE_ALTITUDE_M};

pub use cancel::{cancel_pair, CancelToken, Canceller};
pub use error::{CommandError, CommandOutcome, LinkError, Phase};
pub use link::{LinkConnection, LinkState, VehicleCommand, VelocitySetpoint};
pub use mode::FlightMode;
pub use state::{VehicleSnapshot, VehicleState};
pub use station::{CommandRequest, GroundStation};

/// Upper bound for every `*_ms` setting.
pub const MAX_PERIOD_MS: u64 = 3_600_000;

fn period(ms: Option<u64>, default_ms: u64) -> Duration {
    Duration::from_millis(ms.unwrap_or(default_ms).clamp(1, MAX_PERIOD_MS))
}

#[derive(Debug, Clone, Deserialize)]
pub struct FcConfig {
    /// Where the vehicle is:
    /// "127.0.0.1:14550" (UDP listen), "/dev/ttyUSB0:57600" (serial),
    /// or a raw mavlink url such as "tcpout:10.0.0.2:5760".
    pub address: String,

    /// MAVLink ids we use (GCS side). 255/190 is the usual ground station pair.
    pub sys_id: u8,
    pub comp_id: u8,

    /// target system/component (FC side). 1/1 is common for ArduPilot.
    pub target_sys: u8,
    pub target_comp: u8,

    /// GCS heartbeat rate. Default 1 Hz.
    pub send_heartbeat_hz: Option<f32>,

    /// Telemetry counts as unavailable once the last FC heartbeat is older than this.
    pub heartbeat_timeout_ms: Option<u64>,

    /// Sampler cadence. Default 100 ms.
    pub sample_interval_ms: Option<u64>,

    /// Deadline for each confirmation wait (armable, armed, mode...). Default 10 s.
    pub confirm_timeout_ms: Option<u64>,

    /// Above this relative altitude disarm becomes LAND and takeoff is refused.
    pub airborne_altitude_m: Option<f32>,

    /// Velocity setpoint period. Default 1 s.
    pub velocity_tick_ms: Option<u64>,

    /// Default target for `takeoff` when none is given.
    pub takeoff_altitude_m: Option<f32>,
}

impl FcConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        let hz = self.send_heartbeat_hz.unwrap_or(1.0).max(0.2).min(50.0);
        Duration::from_secs_f32(1.0 / hz)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        period(self.heartbeat_timeout_ms, 3_000)
    }

    pub fn sample_interval(&self) -> Duration {
        period(self.sample_interval_ms, 100)
    }

    pub fn velocity_tick(&self) -> Duration {
        period(self.velocity_tick_ms, 1_000)
    }

    pub fn takeoff_altitude_m(&self) -> f32 {
        self.takeoff_altitude_m.unwrap_or(25.0)
    }

    pub fn coordinator(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            confirm_timeout: self
                .confirm_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_CONFIRM_TIMEOUT)
                .min(MAX_CONFIRM_TIMEOUT),
            airborne: AirborneGuard::new(self.airborne_altitude_m.unwrap_or(DEFAULT_AIRBORNE_ALTITUDE_M)),
        }
    }
}
