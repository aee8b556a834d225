use serde::{Deserialize, Serialize};

/// Published vehicle state, in presentation units (angles in degrees).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryFrame {
    pub seq: u64,
    pub ts_unix_ms: i64,
    pub roll_deg: f32,
    pub pitch_deg: f32,
    pub yaw_deg: f32,
    pub altitude_m: f32,
    // Battery monitoring
    pub battery_voltage: Option<f32>,
    pub battery_current: Option<f32>,
    pub battery_percent: Option<u8>,
    pub ground_speed_ms: f32,
    pub air_speed_ms: f32,
    pub gps_sats: u8,
    pub flight_mode: Option<String>,
    pub armed: bool,
    pub home_lat: Option<f64>,
    pub home_lon: Option<f64>,
    pub lat: f64,
    pub lon: f64,
    pub home_distance_km: Option<f64>,
}

/// The whole contract with the map renderer: current position only.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MapPosition {
    pub lat: f64,
    pub lon: f64,
}
