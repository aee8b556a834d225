use crate::state::VehicleSnapshot;

pub const DEFAULT_AIRBORNE_ALTITUDE_M: f32 = 1.0;

/// Altitude above home past which the vehicle counts as flying:
/// disarm turns into LAND and takeoff is refused.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AirborneGuard {
    threshold_m: f32,
}

impl AirborneGuard {
    pub fn new(threshold_m: f32) -> Self {
        Self { threshold_m }
    }

    pub fn threshold_m(&self) -> f32 {
        self.threshold_m
    }

    pub fn is_airborne(&self, snap: &VehicleSnapshot) -> bool {
        snap.altitude_m() > self.threshold_m
    }
}

impl Default for AirborneGuard {
    fn default() -> Self {
        Self::new(DEFAULT_AIRBORNE_ALTITUDE_M)
    }
}
