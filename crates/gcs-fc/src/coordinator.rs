use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::error::{CommandError, CommandOutcome, Phase};
use crate::link::{LinkConnection, VehicleCommand, WriteGuard};
use crate::mode::FlightMode;
use crate::safety::AirborneGuard;
use crate::sampler::Telemetry;
use crate::state::VehicleSnapshot;

pub const DEFAULT_CONFIRM_TIMEOUT: Duration = Duration::from_secs(10);
pub const MAX_CONFIRM_TIMEOUT: Duration = Duration::from_secs(3_600);

/// Early exit from a command sequence carries its terminal outcome.
type Step<T> = Result<T, CommandOutcome>;

#[derive(Debug, Clone, Copy)]
pub struct CoordinatorConfig {
    /// Deadline for each confirmation wait.
    pub confirm_timeout: Duration,
    pub airborne: AirborneGuard,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self { confirm_timeout: DEFAULT_CONFIRM_TIMEOUT, airborne: AirborneGuard::default() }
    }
}

/// Runs arm, disarm, mode change and takeoff as confirmation sequences.
///
/// Each sequence holds the link's write path from start to finish; a request
/// arriving while one is in flight fails with [`CommandError::Busy`]. Vehicle
/// state is only ever read from published snapshots, and every decision is
/// made on a snapshot published after the command started.
pub struct CommandCoordinator {
    link: Arc<LinkConnection>,
    telemetry: Telemetry,
    cfg: CoordinatorConfig,
}

impl CommandCoordinator {
    pub fn new(link: Arc<LinkConnection>, telemetry: Telemetry, cfg: CoordinatorConfig) -> Self {
        Self { link, telemetry, cfg }
    }

    pub async fn arm(&self, cancel: &CancelToken) -> CommandOutcome {
        finish("arm", self.arm_steps(cancel).await)
    }

    pub async fn disarm(&self, cancel: &CancelToken) -> CommandOutcome {
        finish("disarm", self.disarm_steps(cancel).await)
    }

    pub async fn set_mode(&self, mode: FlightMode, cancel: &CancelToken) -> CommandOutcome {
        finish("mode", self.set_mode_steps(mode, cancel).await)
    }

    pub async fn takeoff(&self, altitude_m: f32, cancel: &CancelToken) -> CommandOutcome {
        finish("takeoff", self.takeoff_steps(altitude_m, cancel).await)
    }

    fn begin(&self) -> Step<(WriteGuard<'_>, Telemetry)> {
        self.link.ensure_connected()?;
        let writer = self.link.try_writer().ok_or(CommandError::Busy)?;
        let mut rx = self.telemetry.clone();
        // whatever is published now may predate a reconnect or a run of failed reads
        rx.mark_unchanged();
        Ok((writer, rx))
    }

    /// First snapshot published after `begin`.
    async fn fresh(&self, rx: &mut Telemetry, cancel: &CancelToken) -> Step<Arc<VehicleSnapshot>> {
        self.wait(rx, cancel, Phase::AwaitingTelemetry, true, |_| true).await
    }

    async fn arm_steps(&self, cancel: &CancelToken) -> Step<()> {
        let (writer, mut rx) = self.begin()?;
        let snap = self.fresh(&mut rx, cancel).await?;
        if snap.state.armed {
            info!("arm: already armed");
            return Ok(());
        }
        self.wait_for(&mut rx, cancel, Phase::AwaitingArmable, |s| s.state.armable()).await?;
        issue(&writer, cancel, &VehicleCommand::Arm)?;
        info!("arm: command sent, waiting for confirmation");
        self.wait_for(&mut rx, cancel, Phase::AwaitingArmed, |s| s.state.armed).await?;
        Ok(())
    }

    async fn disarm_steps(&self, cancel: &CancelToken) -> Step<()> {
        let (writer, mut rx) = self.begin()?;
        let snap = self.fresh(&mut rx, cancel).await?;
        if self.cfg.airborne.is_airborne(&snap) {
            warn!(
                "disarm: refused at {:.1} m (limit {:.1} m), switching to LAND",
                snap.altitude_m(),
                self.cfg.airborne.threshold_m()
            );
            return self.change_mode(&writer, &mut rx, cancel, &snap, FlightMode::Land).await;
        }
        if !snap.state.armed {
            info!("disarm: already disarmed");
            return Ok(());
        }
        issue(&writer, cancel, &VehicleCommand::Disarm)?;
        info!("disarm: command sent, waiting for confirmation");
        self.wait_for(&mut rx, cancel, Phase::AwaitingDisarmed, |s| !s.state.armed).await?;
        Ok(())
    }

    async fn set_mode_steps(&self, mode: FlightMode, cancel: &CancelToken) -> Step<()> {
        if mode.name().is_none() {
            return Err(CommandError::InvalidArgument(format!("cannot request mode {}", mode)).into());
        }
        let (writer, mut rx) = self.begin()?;
        let snap = self.fresh(&mut rx, cancel).await?;
        self.change_mode(&writer, &mut rx, cancel, &snap, mode).await
    }

    async fn takeoff_steps(&self, altitude_m: f32, cancel: &CancelToken) -> Step<()> {
        if !(altitude_m.is_finite() && altitude_m > 0.0) {
            return Err(CommandError::InvalidArgument(format!("takeoff altitude {}", altitude_m)).into());
        }
        let (writer, mut rx) = self.begin()?;
        let snap = self.fresh(&mut rx, cancel).await?;
        if self.cfg.airborne.is_airborne(&snap) {
            return Err(CommandError::AlreadyAirborne { altitude_m: snap.altitude_m() }.into());
        }
        // reaching the target altitude is the autopilot's job
        issue(&writer, cancel, &VehicleCommand::Takeoff { altitude_m })?;
        info!("takeoff: climbing to {:.1} m", altitude_m);
        Ok(())
    }

    async fn change_mode(
        &self,
        writer: &WriteGuard<'_>,
        rx: &mut Telemetry,
        cancel: &CancelToken,
        current: &VehicleSnapshot,
        mode: FlightMode,
    ) -> Step<()> {
        if current.state.flight_mode == Some(mode) {
            info!("mode: already {}", mode);
            return Ok(());
        }
        issue(writer, cancel, &VehicleCommand::SetMode(mode))?;
        info!("mode: requested {}", mode);
        self.wait_for(rx, cancel, Phase::AwaitingMode(mode), |s| s.state.flight_mode == Some(mode)).await?;
        Ok(())
    }

    /// Wait until a published snapshot satisfies `pred`, bounded by the
    /// confirmation timeout and the cancel signal.
    async fn wait_for<F>(&self, rx: &mut Telemetry, cancel: &CancelToken, phase: Phase, pred: F) -> Step<Arc<VehicleSnapshot>>
    where
        F: Fn(&VehicleSnapshot) -> bool,
    {
        self.wait(rx, cancel, phase, false, pred).await
    }

    /// With `skip_current`, the snapshot already seen by `rx` is not a candidate.
    async fn wait<F>(
        &self,
        rx: &mut Telemetry,
        cancel: &CancelToken,
        phase: Phase,
        skip_current: bool,
        pred: F,
    ) -> Step<Arc<VehicleSnapshot>>
    where
        F: Fn(&VehicleSnapshot) -> bool,
    {
        let deadline = Instant::now() + self.cfg.confirm_timeout.min(MAX_CONFIRM_TIMEOUT);
        let mut check = !skip_current;
        loop {
            if check {
                let current = rx.borrow_and_update().clone();
                if let Some(snap) = current.filter(|s| pred(s.as_ref())) {
                    return Ok(snap);
                }
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(CommandOutcome::Cancelled),
                _ = tokio::time::sleep_until(deadline) => return Err(CommandOutcome::TimedOut(phase)),
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(CommandError::TelemetryClosed.into());
                    }
                    check = true;
                }
            }
        }
    }
}

fn issue(writer: &WriteGuard<'_>, cancel: &CancelToken, cmd: &VehicleCommand) -> Step<()> {
    if cancel.is_cancelled() {
        return Err(CommandOutcome::Cancelled);
    }
    writer.send(cmd)?;
    Ok(())
}

fn finish(what: &str, r: Step<()>) -> CommandOutcome {
    let outcome = r.err().unwrap_or(CommandOutcome::Succeeded);
    match &outcome {
        CommandOutcome::Succeeded => debug!("{}: succeeded", what),
        other => warn!("{}: {}", what, other),
    }
    outcome
}
