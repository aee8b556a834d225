//! Recording fake vehicle for unit tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::time::Instant;

use crate::error::LinkError;
use crate::link::{LinkDriver, LinkSession, VehicleCommand};
use crate::mode::FlightMode;
use crate::state::{Location, VehicleState};

struct Inner {
    state: VehicleState,
    sent: Vec<(Instant, VehicleCommand)>,
    reads: usize,
    read_error: Option<LinkError>,
    refuse_open: bool,
    opens: usize,
    closed: bool,
    honour_arm: bool,
    honour_disarm: bool,
    honour_mode: bool,
}

pub struct FakeVehicle {
    inner: Mutex<Inner>,
    in_send: AtomicBool,
    overlapped: AtomicBool,
}

impl FakeVehicle {
    /// Booted, 3D fix, disarmed on the ground in STABILIZE; obeys every command.
    pub fn on_ground() -> Arc<Self> {
        let state = VehicleState {
            location: Location { lat: 39.925, lon: 32.836, alt: 0.0 },
            gps_sats: 12,
            gps_fix_type: 3,
            flight_mode: Some(FlightMode::Stabilize),
            system_ready: true,
            ..Default::default()
        };
        Arc::new(Self {
            inner: Mutex::new(Inner {
                state,
                sent: Vec::new(),
                reads: 0,
                read_error: None,
                refuse_open: false,
                opens: 0,
                closed: false,
                honour_arm: true,
                honour_disarm: true,
                honour_mode: true,
            }),
            in_send: AtomicBool::new(false),
            overlapped: AtomicBool::new(false),
        })
    }

    pub fn update(&self, f: impl FnOnce(&mut VehicleState)) {
        f(&mut self.inner.lock().unwrap().state);
    }

    pub fn state(&self) -> VehicleState {
        self.inner.lock().unwrap().state.clone()
    }

    pub fn ignore_arm(&self) {
        self.inner.lock().unwrap().honour_arm = false;
    }

    pub fn ignore_disarm(&self) {
        self.inner.lock().unwrap().honour_disarm = false;
    }

    pub fn ignore_mode(&self) {
        self.inner.lock().unwrap().honour_mode = false;
    }

    pub fn fail_reads(&self, err: Option<LinkError>) {
        self.inner.lock().unwrap().read_error = err;
    }

    pub fn refuse_open(&self, refuse: bool) {
        self.inner.lock().unwrap().refuse_open = refuse;
    }

    pub fn sent(&self) -> Vec<VehicleCommand> {
        self.inner.lock().unwrap().sent.iter().map(|(_, c)| *c).collect()
    }

    pub fn sent_at(&self) -> Vec<Instant> {
        self.inner.lock().unwrap().sent.iter().map(|(t, _)| *t).collect()
    }

    pub fn reads(&self) -> usize {
        self.inner.lock().unwrap().reads
    }

    pub fn opens(&self) -> usize {
        self.inner.lock().unwrap().opens
    }

    pub fn closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    /// True if two sends were ever in progress at the same time.
    pub fn overlapped(&self) -> bool {
        self.overlapped.load(Ordering::SeqCst)
    }
}

impl LinkSession for FakeVehicle {
    fn send(&self, cmd: &VehicleCommand) -> Result<(), LinkError> {
        if self.in_send.swap(true, Ordering::SeqCst) {
            self.overlapped.store(true, Ordering::SeqCst);
        }
        {
            let mut inner = self.inner.lock().unwrap();
            inner.sent.push((Instant::now(), *cmd));
            match *cmd {
                VehicleCommand::Arm if inner.honour_arm => inner.state.armed = true,
                VehicleCommand::Disarm if inner.honour_disarm => inner.state.armed = false,
                VehicleCommand::SetMode(m) if inner.honour_mode => inner.state.flight_mode = Some(m),
                _ => {}
            }
        }
        std::thread::yield_now();
        self.in_send.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn read_state(&self) -> Result<VehicleState, LinkError> {
        let mut inner = self.inner.lock().unwrap();
        inner.reads += 1;
        match &inner.read_error {
            Some(e) => Err(e.clone()),
            None => Ok(inner.state.clone()),
        }
    }

    fn close(&self) {
        self.inner.lock().unwrap().closed = true;
    }
}

pub struct FakeDriver {
    vehicle: Arc<FakeVehicle>,
}

impl FakeDriver {
    pub fn new(vehicle: Arc<FakeVehicle>) -> Self {
        Self { vehicle }
    }
}

impl LinkDriver for FakeDriver {
    fn open(&self, address: &str) -> Result<Arc<dyn LinkSession>, LinkError> {
        let mut inner = self.vehicle.inner.lock().unwrap();
        if inner.refuse_open {
            return Err(LinkError::Connect { address: address.to_string(), reason: "refused".into() });
        }
        inner.opens += 1;
        inner.closed = false;
        drop(inner);
        Ok(self.vehicle.clone())
    }
}
