use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::error::{CommandError, CommandOutcome};
use crate::link::{LinkConnection, VehicleCommand, VelocitySetpoint};

pub const DEFAULT_TICK: Duration = Duration::from_secs(1);

/// Streams one velocity setpoint per tick for a fixed number of ticks.
///
/// Holds the link's write path for the whole run, so it never overlaps a
/// coordinator sequence.
pub struct VelocitySequencer {
    link: Arc<LinkConnection>,
    tick: Duration,
}

impl VelocitySequencer {
    pub fn new(link: Arc<LinkConnection>, tick: Duration) -> Self {
        Self { link, tick }
    }

    pub async fn run(&self, setpoint: VelocitySetpoint, duration_s: u32, cancel: &CancelToken) -> CommandOutcome {
        let outcome = self.run_inner(setpoint, duration_s, cancel).await;
        match &outcome {
            CommandOutcome::Succeeded => info!("velocity: sequence complete"),
            other => warn!("velocity: {}", other),
        }
        outcome
    }

    async fn run_inner(&self, sp: VelocitySetpoint, duration_s: u32, cancel: &CancelToken) -> CommandOutcome {
        if ![sp.vx, sp.vy, sp.vz].iter().all(|v| v.is_finite()) {
            return CommandError::InvalidArgument(format!("velocity setpoint {:?}", sp)).into();
        }
        if let Err(e) = self.link.ensure_connected() {
            return e.into();
        }
        let Some(writer) = self.link.try_writer() else {
            return CommandError::Busy.into();
        };
        if duration_s == 0 {
            return CommandOutcome::Succeeded;
        }

        info!("velocity: vx={} vy={} vz={} for {} ticks", sp.vx, sp.vy, sp.vz, duration_s);
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        for n in 1..=duration_s {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return CommandOutcome::Cancelled,
                _ = ticker.tick() => {}
            }
            if let Err(e) = writer.send(&VehicleCommand::Velocity(sp)) {
                return e.into();
            }
            debug!("velocity: setpoint {}/{}", n, duration_s);
        }

        // the last setpoint stays in effect for one more tick
        tokio::select! {
            biased;
            _ = cancel.cancelled() => CommandOutcome::Cancelled,
            _ = ticker.tick() => CommandOutcome::Succeeded,
        }
    }
}
