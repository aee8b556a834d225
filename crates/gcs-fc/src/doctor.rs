use anyhow::Result;

use crate::mav::MavAddress;
use crate::{FcConfig, MAX_PERIOD_MS};

pub fn check_address(address: &str) -> Result<()> {
    MavAddress::parse(address)?;
    Ok(())
}

pub fn check_ids(cfg: &FcConfig) -> Result<()> {
    anyhow::ensure!(cfg.target_sys > 0, "fc.target_sys must be non-zero");
    anyhow::ensure!(cfg.sys_id != cfg.target_sys, "fc.sys_id collides with fc.target_sys");
    Ok(())
}

pub fn check_timing(cfg: &FcConfig) -> Result<()> {
    if let Some(hz) = cfg.send_heartbeat_hz {
        anyhow::ensure!(hz.is_finite() && hz > 0.0, "fc.send_heartbeat_hz must be positive");
    }
    for (name, v) in [
        ("fc.heartbeat_timeout_ms", cfg.heartbeat_timeout_ms),
        ("fc.sample_interval_ms", cfg.sample_interval_ms),
        ("fc.confirm_timeout_ms", cfg.confirm_timeout_ms),
        ("fc.velocity_tick_ms", cfg.velocity_tick_ms),
    ] {
        anyhow::ensure!(v != Some(0), "{} must be > 0", name);
        anyhow::ensure!(v.map_or(true, |ms| ms <= MAX_PERIOD_MS), "{} must be <= {}", name, MAX_PERIOD_MS);
    }
    // a confirmation has to see at least a couple of samples
    anyhow::ensure!(
        cfg.coordinator().confirm_timeout >= cfg.sample_interval() * 2,
        "fc.confirm_timeout_ms shorter than two sample intervals"
    );
    Ok(())
}

pub fn check_safety(cfg: &FcConfig) -> Result<()> {
    if let Some(alt) = cfg.airborne_altitude_m {
        anyhow::ensure!(alt.is_finite() && alt >= 0.0, "fc.airborne_altitude_m out of range");
    }
    let takeoff = cfg.takeoff_altitude_m();
    anyhow::ensure!(takeoff.is_finite() && takeoff > 0.0, "fc.takeoff_altitude_m must be positive");
    Ok(())
}

pub fn check_fc(cfg: &FcConfig) -> Result<()> {
    check_address(&cfg.address)?;
    check_ids(cfg)?;
    check_timing(cfg)?;
    check_safety(cfg)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> FcConfig {
        toml::from_str(
            r#"
            address = "127.0.0.1:14550"
            sys_id = 255
            comp_id = 190
            target_sys = 1
            target_comp = 1
            "#,
        )
        .unwrap()
    }

    #[test]
    fn accepts_defaults() {
        check_fc(&cfg()).unwrap();
    }

    #[test]
    fn rejects_bad_values() {
        let mut c = cfg();
        c.address = "nowhere".into();
        assert!(check_fc(&c).is_err());

        let mut c = cfg();
        c.sample_interval_ms = Some(0);
        assert!(check_fc(&c).is_err());

        let mut c = cfg();
        c.confirm_timeout_ms = Some(50);
        assert!(check_fc(&c).is_err());

        let mut c = cfg();
        c.confirm_timeout_ms = Some(u64::MAX);
        assert!(check_fc(&c).is_err());

        let mut c = cfg();
        c.airborne_altitude_m = Some(-1.0);
        assert!(check_fc(&c).is_err());

        let mut c = cfg();
        c.sys_id = 1;
        assert!(check_fc(&c).is_err());
    }
}
