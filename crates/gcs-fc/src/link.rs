use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::LinkError;
use crate::mode::FlightMode;
use crate::state::VehicleState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Lost,
}

/// NED velocity setpoint in m/s.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VelocitySetpoint {
    pub vx: f32,
    pub vy: f32,
    pub vz: f32,
}

/// What actually goes out on the wire; encoding is the driver's job.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum VehicleCommand {
    Arm,
    Disarm,
    SetMode(FlightMode),
    Takeoff { altitude_m: f32 },
    Velocity(VelocitySetpoint),
}

/// Opens sessions to a vehicle. Implemented by the MAVLink driver and by test fakes.
pub trait LinkDriver: Send + Sync {
    fn open(&self, address: &str) -> Result<Arc<dyn LinkSession>, LinkError>;
}

/// One open transport to the vehicle.
///
/// `read_state` must not block on the wire; sessions keep their own view of
/// the vehicle up to date and hand out copies.
pub trait LinkSession: Send + Sync {
    fn send(&self, cmd: &VehicleCommand) -> Result<(), LinkError>;
    fn read_state(&self) -> Result<VehicleState, LinkError>;
    /// Release the transport. Once this returns the address can be opened again.
    fn close(&self) {}
}

struct Inner {
    state: LinkState,
    address: Option<String>,
    session: Option<Arc<dyn LinkSession>>,
}

/// Owns the transport to the vehicle and serialises every command writer.
pub struct LinkConnection {
    driver: Arc<dyn LinkDriver>,
    inner: Mutex<Inner>,
    writer: tokio::sync::Mutex<()>,
    state_tx: watch::Sender<LinkState>,
}

impl LinkConnection {
    pub fn new(driver: Arc<dyn LinkDriver>) -> Self {
        let (state_tx, _) = watch::channel(LinkState::Disconnected);
        Self {
            driver,
            inner: Mutex::new(Inner { state: LinkState::Disconnected, address: None, session: None }),
            writer: tokio::sync::Mutex::new(()),
            state_tx,
        }
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, inner: &mut Inner, state: LinkState) {
        if inner.state != state {
            debug!("link: {:?} -> {:?}", inner.state, state);
        }
        inner.state = state;
        self.state_tx.send_replace(state);
    }

    pub fn state(&self) -> LinkState {
        self.inner().state
    }

    pub fn address(&self) -> Option<String> {
        self.inner().address.clone()
    }

    /// Observe link health transitions.
    pub fn watch_state(&self) -> watch::Receiver<LinkState> {
        self.state_tx.subscribe()
    }

    /// Connect to `address`. A no-op while already connected or connecting.
    ///
    /// Opening may block on I/O; the connection state stays readable meanwhile
    /// and reports `Connecting`.
    pub fn connect(&self, address: &str) -> Result<LinkState, LinkError> {
        {
            let mut inner = self.inner();
            match inner.state {
                LinkState::Connected => {
                    debug!("link: already connected to {:?}", inner.address);
                    return Ok(LinkState::Connected);
                }
                LinkState::Connecting => {
                    debug!("link: connect already in progress");
                    return Ok(LinkState::Connecting);
                }
                LinkState::Disconnected | LinkState::Lost => {}
            }
            self.set_state(&mut inner, LinkState::Connecting);
        }

        let opened = self.driver.open(address);

        let mut inner = self.inner();
        if inner.state != LinkState::Connecting {
            // disconnect() ran while we were opening
            drop(inner);
            if let Ok(session) = opened {
                session.close();
            }
            info!("link: connect to {} abandoned", address);
            return Err(LinkError::NotConnected);
        }
        match opened {
            Ok(session) => {
                inner.session = Some(session);
                inner.address = Some(address.to_string());
                self.set_state(&mut inner, LinkState::Connected);
                info!("link: connected to {}", address);
                Ok(LinkState::Connected)
            }
            Err(e) => {
                inner.session = None;
                self.set_state(&mut inner, LinkState::Disconnected);
                warn!("link: connect {} failed: {}", address, e);
                Err(e)
            }
        }
    }

    pub fn disconnect(&self) {
        let session = {
            let mut inner = self.inner();
            self.set_state(&mut inner, LinkState::Disconnected);
            inner.session.take()
        };
        if let Some(session) = session {
            session.close();
            info!("link: disconnected from {:?}", self.address());
        }
    }

    fn session(&self) -> Result<Arc<dyn LinkSession>, LinkError> {
        let inner = self.inner();
        match (inner.state, &inner.session) {
            (LinkState::Connected, Some(s)) => Ok(s.clone()),
            (LinkState::Lost, _) => Err(LinkError::Lost),
            _ => Err(LinkError::NotConnected),
        }
    }

    /// Fails fast unless the link is up.
    pub fn ensure_connected(&self) -> Result<(), LinkError> {
        self.session().map(|_| ())
    }

    fn check(&self, session: &Arc<dyn LinkSession>, err: LinkError) -> LinkError {
        if !err.is_fatal() {
            return err;
        }
        let failed = {
            let mut inner = self.inner();
            // a reconnect may already have replaced the failed session
            let current = inner.session.as_ref().is_some_and(|s| Arc::ptr_eq(s, session));
            if current {
                warn!("link: lost ({})", err);
                self.set_state(&mut inner, LinkState::Lost);
                inner.session.take()
            } else {
                None
            }
        };
        if let Some(s) = failed {
            s.close();
        }
        err
    }

    pub fn read_state(&self) -> Result<VehicleState, LinkError> {
        let session = self.session()?;
        session.read_state().map_err(|e| self.check(&session, e))
    }

    /// Take the write path, or `None` if another writer holds it.
    pub fn try_writer(&self) -> Option<WriteGuard<'_>> {
        let permit = self.writer.try_lock().ok()?;
        Some(WriteGuard { link: self, _permit: permit })
    }
}

/// Exclusive write access to the link. Released on drop.
pub struct WriteGuard<'a> {
    link: &'a LinkConnection,
    _permit: tokio::sync::MutexGuard<'a, ()>,
}

impl WriteGuard<'_> {
    pub fn send(&self, cmd: &VehicleCommand) -> Result<(), LinkError> {
        let session = self.link.session()?;
        debug!("link: send {:?}", cmd);
        session.send(cmd).map_err(|e| self.link.check(&session, e))
    }
}
