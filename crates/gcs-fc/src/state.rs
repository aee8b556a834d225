use time::OffsetDateTime;

use gcs_geo::{degrees, haversine_km};
use gcs_proto::telemetry::TelemetryFrame;

use crate::mode::FlightMode;

/// Radians, as reported by the autopilot.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Attitude {
    pub roll: f32,
    pub pitch: f32,
    pub yaw: f32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Location {
    pub lat: f64,
    pub lon: f64,
    /// Metres above home.
    pub alt: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HomeLocation {
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BatteryStatus {
    pub voltage: Option<f32>,      // Volts
    pub current: Option<f32>,      // Amps
    pub remaining: Option<u8>,     // Percent 0-100
}

/// Live vehicle state as accumulated by a link session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VehicleState {
    pub attitude: Attitude,
    pub location: Location,
    pub home: Option<HomeLocation>,
    pub battery: BatteryStatus,
    pub ground_speed_ms: f32,
    pub air_speed_ms: f32,
    pub gps_sats: u8,
    /// MAVLink GPS_FIX_TYPE (0 no gps, 1 no fix, 2 2D, 3 3D, ...).
    pub gps_fix_type: u8,
    pub flight_mode: Option<FlightMode>,
    pub armed: bool,
    /// Autopilot finished booting (HEARTBEAT system_status past BOOT).
    pub system_ready: bool,
}

impl VehicleState {
    /// Ready to accept an arm command: booted and holding at least a 2D fix.
    pub fn armable(&self) -> bool {
        self.system_ready && self.gps_fix_type >= 2
    }
}

/// Immutable point-in-time capture published by the sampler.
#[derive(Debug, Clone, PartialEq)]
pub struct VehicleSnapshot {
    pub seq: u64,
    pub captured_at: OffsetDateTime,
    pub state: VehicleState,
}

impl VehicleSnapshot {
    pub fn capture(seq: u64, state: VehicleState) -> Self {
        Self { seq, captured_at: OffsetDateTime::now_utc(), state }
    }

    pub fn altitude_m(&self) -> f32 {
        self.state.location.alt
    }

    pub fn home_distance_km(&self) -> Option<f64> {
        let home = self.state.home?;
        let here = &self.state.location;
        Some(haversine_km(home.lat, home.lon, here.lat, here.lon))
    }

    pub fn frame(&self) -> TelemetryFrame {
        let s = &self.state;
        TelemetryFrame {
            seq: self.seq,
            ts_unix_ms: (self.captured_at.unix_timestamp_nanos() / 1_000_000) as i64,
            roll_deg: degrees(s.attitude.roll),
            pitch_deg: degrees(s.attitude.pitch),
            yaw_deg: degrees(s.attitude.yaw),
            altitude_m: s.location.alt,
            battery_voltage: s.battery.voltage,
            battery_current: s.battery.current,
            battery_percent: s.battery.remaining,
            ground_speed_ms: s.ground_speed_ms,
            air_speed_ms: s.air_speed_ms,
            gps_sats: s.gps_sats,
            flight_mode: s.flight_mode.map(|m| m.to_string()),
            armed: s.armed,
            home_lat: s.home.map(|h| h.lat),
            home_lon: s.home.map(|h| h.lon),
            lat: s.location.lat,
            lon: s.location.lon,
            home_distance_km: self.home_distance_km(),
        }
    }
}
