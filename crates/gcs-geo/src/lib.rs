pub mod geo;

pub use geo::{degrees, haversine_km, EARTH_RADIUS_KM};
