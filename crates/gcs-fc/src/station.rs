use std::sync::Arc;

use tracing::{info, warn};

use crate::cancel::CancelToken;
use crate::coordinator::CommandCoordinator;
use crate::error::{CommandOutcome, LinkError};
use crate::link::{LinkConnection, LinkDriver, LinkState, VelocitySetpoint};
use crate::mav::MavDriver;
use crate::mode::FlightMode;
use crate::sampler::{Telemetry, TelemetrySampler};
use crate::state::VehicleSnapshot;
use crate::velocity::VelocitySequencer;
use crate::FcConfig;

/// An operator request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CommandRequest {
    Arm,
    Disarm,
    SetMode(FlightMode),
    Takeoff { altitude_m: f32 },
    SendVelocity { setpoint: VelocitySetpoint, duration_s: u32 },
}

/// One vehicle connection and everything that runs against it.
pub struct GroundStation {
    link: Arc<LinkConnection>,
    sampler: TelemetrySampler,
    coordinator: CommandCoordinator,
    velocity: VelocitySequencer,
}

impl GroundStation {
    pub fn new(driver: Arc<dyn LinkDriver>, cfg: &FcConfig) -> Self {
        let link = Arc::new(LinkConnection::new(driver));
        let sampler = TelemetrySampler::new(link.clone(), cfg.sample_interval());
        let coordinator = CommandCoordinator::new(link.clone(), sampler.subscribe(), cfg.coordinator());
        let velocity = VelocitySequencer::new(link.clone(), cfg.velocity_tick());
        Self { link, sampler, coordinator, velocity }
    }

    /// Station talking MAVLink with the ids in `cfg`.
    pub fn mavlink(cfg: &FcConfig) -> Self {
        Self::new(Arc::new(MavDriver::from_config(cfg)), cfg)
    }

    pub fn link_state(&self) -> LinkState {
        self.link.state()
    }

    pub fn subscribe(&self) -> Telemetry {
        self.sampler.subscribe()
    }

    pub fn latest(&self) -> Option<Arc<VehicleSnapshot>> {
        self.sampler.latest()
    }

    /// Connect and start sampling. Opening the transport runs on the
    /// blocking pool.
    pub async fn connect(&self, address: &str) -> Result<LinkState, LinkError> {
        let link = self.link.clone();
        let target = address.to_string();
        let state = tokio::task::spawn_blocking(move || link.connect(&target))
            .await
            .map_err(|e| LinkError::Connect { address: address.to_string(), reason: format!("connect task: {}", e) })??;
        self.sampler.start().await;
        Ok(state)
    }

    /// Stop sampling, then close the link.
    pub async fn disconnect(&self) {
        self.sampler.stop().await;
        let link = self.link.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || link.disconnect()).await {
            warn!("station: disconnect task: {}", e);
        }
        info!("station: disconnected");
    }

    pub async fn execute(&self, req: CommandRequest, cancel: &CancelToken) -> CommandOutcome {
        info!("station: {:?}", req);
        match req {
            CommandRequest::Arm => self.coordinator.arm(cancel).await,
            CommandRequest::Disarm => self.coordinator.disarm(cancel).await,
            CommandRequest::SetMode(mode) => self.coordinator.set_mode(mode, cancel).await,
            CommandRequest::Takeoff { altitude_m } => self.coordinator.takeoff(altitude_m, cancel).await,
            CommandRequest::SendVelocity { setpoint, duration_s } => {
                self.velocity.run(setpoint, duration_s, cancel).await
            }
        }
    }
}
