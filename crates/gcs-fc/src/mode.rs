use std::fmt;
use std::str::FromStr;

/// ArduCopter flight modes, keyed by their HEARTBEAT `custom_mode` number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlightMode {
    Stabilize,
    Acro,
    AltHold,
    Auto,
    Guided,
    Loiter,
    Rtl,
    Circle,
    Land,
    Drift,
    Sport,
    Flip,
    AutoTune,
    PosHold,
    Brake,
    Throw,
    SmartRtl,
    /// Reported by the vehicle but outside our vocabulary; never requested.
    Unknown(u32),
}

const TABLE: &[(FlightMode, u32, &str)] = &[
    (FlightMode::Stabilize, 0, "STABILIZE"),
    (FlightMode::Acro, 1, "ACRO"),
    (FlightMode::AltHold, 2, "ALT_HOLD"),
    (FlightMode::Auto, 3, "AUTO"),
    (FlightMode::Guided, 4, "GUIDED"),
    (FlightMode::Loiter, 5, "LOITER"),
    (FlightMode::Rtl, 6, "RTL"),
    (FlightMode::Circle, 7, "CIRCLE"),
    (FlightMode::Land, 9, "LAND"),
    (FlightMode::Drift, 11, "DRIFT"),
    (FlightMode::Sport, 13, "SPORT"),
    (FlightMode::Flip, 14, "FLIP"),
    (FlightMode::AutoTune, 15, "AUTOTUNE"),
    (FlightMode::PosHold, 16, "POSHOLD"),
    (FlightMode::Brake, 17, "BRAKE"),
    (FlightMode::Throw, 18, "THROW"),
    (FlightMode::SmartRtl, 21, "SMART_RTL"),
];

impl FlightMode {
    pub fn from_custom_mode(n: u32) -> Self {
        TABLE
            .iter()
            .find(|(_, num, _)| *num == n)
            .map(|(m, _, _)| *m)
            .unwrap_or(FlightMode::Unknown(n))
    }

    pub fn custom_mode(self) -> u32 {
        match self {
            FlightMode::Unknown(n) => n,
            m => TABLE
                .iter()
                .find(|(t, _, _)| *t == m)
                .map(|(_, num, _)| *num)
                .unwrap_or_default(),
        }
    }

    pub fn name(self) -> Option<&'static str> {
        TABLE.iter().find(|(t, _, _)| *t == self).map(|(_, _, name)| *name)
    }

    pub fn vocabulary() -> impl Iterator<Item = &'static str> {
        TABLE.iter().map(|(_, _, name)| *name)
    }
}

impl fmt::Display for FlightMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "UNKNOWN({})", self.custom_mode()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown flight mode {0:?}")]
pub struct UnknownMode(pub String);

impl FromStr for FlightMode {
    type Err = UnknownMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_uppercase().replace(['-', ' '], "_");
        TABLE
            .iter()
            .find(|(_, _, name)| *name == wanted)
            .map(|(m, _, _)| *m)
            .ok_or_else(|| UnknownMode(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_case_insensitively() {
        assert_eq!("guided".parse::<FlightMode>().unwrap(), FlightMode::Guided);
        assert_eq!("Land".parse::<FlightMode>().unwrap(), FlightMode::Land);
        assert_eq!("alt-hold".parse::<FlightMode>().unwrap(), FlightMode::AltHold);
        assert!("HOVER".parse::<FlightMode>().is_err());
    }

    #[test]
    fn custom_mode_numbers_match_arducopter() {
        assert_eq!(FlightMode::Stabilize.custom_mode(), 0);
        assert_eq!(FlightMode::Guided.custom_mode(), 4);
        assert_eq!(FlightMode::Land.custom_mode(), 9);
        assert_eq!(FlightMode::from_custom_mode(6), FlightMode::Rtl);
        assert_eq!(FlightMode::from_custom_mode(8), FlightMode::Unknown(8));
        assert_eq!(FlightMode::Unknown(8).to_string(), "UNKNOWN(8)");
    }

    #[test]
    fn unknown_is_not_parseable() {
        assert!(FlightMode::vocabulary().all(|n| n.parse::<FlightMode>().is_ok()));
        assert!("UNKNOWN(8)".parse::<FlightMode>().is_err());
    }
}
