use std::io::{self, ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use mavlink::{
    common::{
        MavAutopilot, MavCmd, MavFrame, MavMessage, MavModeFlag, MavState, MavType,
        PositionTargetTypemask, COMMAND_LONG_DATA, HEARTBEAT_DATA, SET_POSITION_TARGET_LOCAL_NED_DATA,
        SYS_STATUS_DATA,
    },
    error::MessageReadError,
    MavHeader, MavlinkVersion,
};
use tracing::{debug, info, warn};

use crate::error::LinkError;
use crate::link::{LinkDriver, LinkSession, VehicleCommand};
use crate::mode::FlightMode;
use crate::state::{HomeLocation, VehicleState};
use crate::FcConfig;

/// SET_POSITION_TARGET_LOCAL_NED mask: ignore position, acceleration and yaw; use velocity only.
pub const VELOCITY_ONLY_MASK: u16 = 0b0000_1111_1100_0111;

/// Every transport read gives up after this, so the reader notices `close`.
const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// tcpout connect and tcpin accept.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const MAVLINK_SCHEMES: &[&str] = &["udpin:", "udpout:", "udpbcast:", "tcpin:", "tcpout:", "serial:"];

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MavAddress {
    Serial { dev: String, baud: u32 },
    Url(String),
}

impl MavAddress {
    /// `host:port` listens on UDP (SITL style), `/dev/tty*:baud` or `COMn:baud`
    /// is a serial port, and full mavlink urls pass through.
    pub fn parse(address: &str) -> Result<Self, LinkError> {
        let address = address.trim();
        let invalid = || LinkError::InvalidAddress(address.to_string());
        if let Some(rest) = address.strip_prefix("serial:") {
            return MavAddress::parse(rest)
                .ok()
                .filter(|a| matches!(a, MavAddress::Serial { .. }))
                .ok_or_else(invalid);
        }
        if MAVLINK_SCHEMES.iter().any(|s| address.starts_with(s)) {
            return Ok(MavAddress::Url(address.to_string()));
        }
        let (left, right) = address.rsplit_once(':').ok_or_else(invalid)?;
        if left.is_empty() {
            return Err(invalid());
        }
        let n: u32 = right.parse().map_err(|_| invalid())?;
        let serial = left.starts_with('/') || left.to_ascii_uppercase().starts_with("COM");
        if n == 0 || (!serial && n > u16::MAX as u32) {
            return Err(invalid());
        }
        if serial {
            Ok(MavAddress::Serial { dev: left.to_string(), baud: n })
        } else {
            Ok(MavAddress::Url(format!("udpin:{}:{}", left, n)))
        }
    }

    pub fn url(&self) -> String {
        match self {
            MavAddress::Serial { dev, baud } => format!("serial:{}:{}", dev, baud),
            MavAddress::Url(u) => u.clone(),
        }
    }

    fn open(&self) -> io::Result<Port> {
        let url = match self {
            MavAddress::Serial { dev, baud } => {
                let port = tokio_serial::new(dev, *baud).timeout(READ_TIMEOUT).open()?;
                let writer: Box<dyn Write + Send> = Box::new(port.try_clone()?);
                let reader: Box<dyn Read + Send> = Box::new(port);
                return Ok(Port::Stream { reader: Mutex::new(reader), writer: Mutex::new(writer) });
            }
            MavAddress::Url(u) => u,
        };
        let (scheme, target) = url
            .split_once(':')
            .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, format!("no scheme in {}", url)))?;
        let resolve = || {
            target
                .to_socket_addrs()?
                .next()
                .ok_or_else(|| io::Error::new(ErrorKind::AddrNotAvailable, format!("cannot resolve {}", target)))
        };
        match scheme {
            "udpin" => Port::udp(UdpSocket::bind(resolve()?)?, None),
            "udpout" => Port::udp(UdpSocket::bind("0.0.0.0:0")?, Some(resolve()?)),
            "udpbcast" => {
                let socket = UdpSocket::bind("0.0.0.0:0")?;
                socket.set_broadcast(true)?;
                Port::udp(socket, Some(resolve()?))
            }
            "tcpout" => Port::tcp(TcpStream::connect_timeout(&resolve()?, CONNECT_TIMEOUT)?),
            "tcpin" => Port::tcp(accept_within(&TcpListener::bind(resolve()?)?, CONNECT_TIMEOUT)?),
            other => Err(io::Error::new(ErrorKind::Unsupported, format!("unsupported scheme {}", other))),
        }
    }
}

fn accept_within(listener: &TcpListener, within: Duration) -> io::Result<TcpStream> {
    listener.set_nonblocking(true)?;
    let deadline = Instant::now() + within;
    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                info!("mav: accepted {}", peer);
                stream.set_nonblocking(false)?;
                return Ok(stream);
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock && Instant::now() < deadline => {
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                return Err(io::Error::new(ErrorKind::TimedOut, "no incoming connection"));
            }
            Err(e) => return Err(e),
        }
    }
}

/// The byte transport under a session.
enum Port {
    /// A listening socket learns its peer from the last datagram received.
    Udp { socket: UdpSocket, peer: Mutex<Option<SocketAddr>>, learn_peer: bool },
    Stream { reader: Mutex<Box<dyn Read + Send>>, writer: Mutex<Box<dyn Write + Send>> },
}

impl Port {
    fn udp(socket: UdpSocket, dest: Option<SocketAddr>) -> io::Result<Self> {
        socket.set_read_timeout(Some(READ_TIMEOUT))?;
        Ok(Port::Udp { socket, peer: Mutex::new(dest), learn_peer: dest.is_none() })
    }

    fn tcp(stream: TcpStream) -> io::Result<Self> {
        stream.set_read_timeout(Some(READ_TIMEOUT))?;
        stream.set_nodelay(true)?;
        let writer: Box<dyn Write + Send> = Box::new(stream.try_clone()?);
        let reader: Box<dyn Read + Send> = Box::new(stream);
        Ok(Port::Stream { reader: Mutex::new(reader), writer: Mutex::new(writer) })
    }

    /// Read what is available into `out`. Undecodable bytes are dropped;
    /// a timeout surfaces as an `io::Error` of kind `WouldBlock`/`TimedOut`.
    fn recv(&self, buf: &mut [u8], out: &mut Vec<(MavHeader, MavMessage)>) -> io::Result<()> {
        match self {
            Port::Udp { socket, peer, learn_peer } => {
                let (len, src) = match socket.recv_from(buf) {
                    // ICMP unreachable from an earlier send on some platforms
                    Err(e) if e.kind() == ErrorKind::ConnectionReset => return Ok(()),
                    r => r?,
                };
                if *learn_peer {
                    *lock(peer) = Some(src);
                }
                let mut datagram = &buf[..len];
                while !datagram.is_empty() {
                    match mavlink::read_versioned_msg::<MavMessage, _>(&mut datagram, MavlinkVersion::V2) {
                        Ok(frame) => out.push(frame),
                        Err(_) => break,
                    }
                }
                Ok(())
            }
            Port::Stream { reader, .. } => {
                match mavlink::read_versioned_msg::<MavMessage, _>(&mut *lock(reader), MavlinkVersion::V2) {
                    Ok(frame) => out.push(frame),
                    Err(MessageReadError::Io(e)) => return Err(e),
                    Err(MessageReadError::Parse(_)) => {}
                }
                Ok(())
            }
        }
    }

    fn send(&self, frame: &[u8]) -> io::Result<()> {
        match self {
            Port::Udp { socket, peer, .. } => {
                // a listening socket has nobody to talk to until the vehicle speaks
                if let Some(dest) = *lock(peer) {
                    socket.send_to(frame, dest)?;
                }
                Ok(())
            }
            Port::Stream { writer, .. } => {
                let mut w = lock(writer);
                w.write_all(frame)?;
                w.flush()
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MavIds {
    pub sys_id: u8,
    pub comp_id: u8,
    pub target_sys: u8,
    pub target_comp: u8,
}

/// Opens MAVLink sessions over UDP, TCP or serial; framing comes from the
/// `mavlink` crate.
pub struct MavDriver {
    ids: MavIds,
    heartbeat_interval: Duration,
    heartbeat_timeout: Duration,
}

impl MavDriver {
    pub fn new(ids: MavIds, heartbeat_interval: Duration, heartbeat_timeout: Duration) -> Self {
        Self { ids, heartbeat_interval, heartbeat_timeout }
    }

    pub fn from_config(cfg: &FcConfig) -> Self {
        Self::new(
            MavIds {
                sys_id: cfg.sys_id,
                comp_id: cfg.comp_id,
                target_sys: cfg.target_sys,
                target_comp: cfg.target_comp,
            },
            cfg.heartbeat_interval(),
            cfg.heartbeat_timeout(),
        )
    }
}

impl LinkDriver for MavDriver {
    fn open(&self, address: &str) -> Result<Arc<dyn LinkSession>, LinkError> {
        let addr = MavAddress::parse(address)?;
        let url = addr.url();
        let fail = |e: io::Error| LinkError::Connect { address: address.to_string(), reason: format!("{}: {}", url, e) };

        let port = addr.open().map_err(fail)?;
        let session = MavSession::start(port, self.ids, self.heartbeat_interval, self.heartbeat_timeout).map_err(fail)?;
        info!("mav: opened {}", url);
        Ok(session)
    }
}

struct Wire {
    port: Port,
    sys_id: u8,
    comp_id: u8,
    seq: AtomicU8,
}

impl Wire {
    fn send(&self, msg: &MavMessage) -> Result<(), LinkError> {
        let hdr = MavHeader {
            system_id: self.sys_id,
            component_id: self.comp_id,
            sequence: self.seq.fetch_add(1, Ordering::Relaxed),
        };
        let mut frame = Vec::with_capacity(280);
        mavlink::write_versioned_msg(&mut frame, MavlinkVersion::V2, hdr, msg)
            .map_err(|e| LinkError::Transport(format!("mavlink encode: {:?}", e)))?;
        self.port
            .send(&frame)
            .map_err(|e| LinkError::Transport(format!("mavlink send: {}", e)))
    }
}

#[derive(Default)]
struct Tracked {
    state: VehicleState,
    last_heartbeat: Option<Instant>,
    fault: Option<String>,
}

#[derive(Default)]
struct Shared {
    tracked: Mutex<Tracked>,
    closed: AtomicBool,
}

impl Shared {
    fn tracked(&self) -> MutexGuard<'_, Tracked> {
        lock(&self.tracked)
    }

    fn fault(&self, reason: String) {
        if !self.closed.load(Ordering::Relaxed) {
            warn!("mav: link fault: {}", reason);
            self.tracked().fault.get_or_insert(reason);
        }
    }
}

/// A live MAVLink connection: a reader thread folds vehicle messages into
/// [`VehicleState`], a second thread sends our GCS heartbeat.
///
/// `close` stops both threads and drops the transport before returning, so
/// the same address can be opened again right away.
pub struct MavSession {
    wire: Mutex<Option<Arc<Wire>>>,
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    heartbeat_stop: Mutex<Option<mpsc::Sender<()>>>,
    ids: MavIds,
    heartbeat_timeout: Duration,
}

impl MavSession {
    fn start(port: Port, ids: MavIds, heartbeat_interval: Duration, heartbeat_timeout: Duration) -> io::Result<Arc<Self>> {
        let wire = Arc::new(Wire { port, sys_id: ids.sys_id, comp_id: ids.comp_id, seq: AtomicU8::new(0) });
        let (heartbeat_stop, stop_rx) = mpsc::channel();
        let session = Arc::new(Self {
            wire: Mutex::new(Some(wire.clone())),
            shared: Arc::new(Shared::default()),
            workers: Mutex::new(Vec::new()),
            heartbeat_stop: Mutex::new(Some(heartbeat_stop)),
            ids,
            heartbeat_timeout,
        });

        let (w, s) = (wire.clone(), session.shared.clone());
        let reader = std::thread::Builder::new()
            .name("mav-reader".into())
            .spawn(move || read_loop(&w, &s, ids.target_sys));
        lock(&session.workers).push(reader?);

        let (w, s) = (wire, session.shared.clone());
        let heartbeat = std::thread::Builder::new()
            .name("mav-heartbeat".into())
            .spawn(move || heartbeat_loop(&w, &s, heartbeat_interval, stop_rx));
        match heartbeat {
            Ok(h) => lock(&session.workers).push(h),
            Err(e) => {
                session.close();
                return Err(e);
            }
        }
        Ok(session)
    }

    fn wire(&self) -> Result<Arc<Wire>, LinkError> {
        lock(&self.wire).clone().ok_or(LinkError::NotConnected)
    }
}

impl LinkSession for MavSession {
    fn send(&self, cmd: &VehicleCommand) -> Result<(), LinkError> {
        if let Some(f) = &self.shared.tracked().fault {
            return Err(LinkError::Transport(f.clone()));
        }
        let msg = encode_command(cmd, self.ids.target_sys, self.ids.target_comp);
        self.wire()?.send(&msg).map_err(|e| {
            self.shared.fault(e.to_string());
            e
        })
    }

    fn read_state(&self) -> Result<VehicleState, LinkError> {
        let t = self.shared.tracked();
        if let Some(f) = &t.fault {
            return Err(LinkError::Transport(f.clone()));
        }
        match t.last_heartbeat {
            Some(at) if at.elapsed() <= self.heartbeat_timeout => Ok(t.state.clone()),
            _ => Err(LinkError::NoTelemetry),
        }
    }

    fn close(&self) {
        self.shared.closed.store(true, Ordering::Relaxed);
        // dropping the sender wakes the heartbeat thread
        lock(&self.heartbeat_stop).take();
        let workers = std::mem::take(&mut *lock(&self.workers));
        for w in workers {
            if w.join().is_err() {
                warn!("mav: worker thread panicked");
            }
        }
        if lock(&self.wire).take().is_some() {
            debug!("mav: transport released");
        }
    }
}

impl Drop for MavSession {
    fn drop(&mut self) {
        self.close();
    }
}

fn read_loop(wire: &Wire, shared: &Shared, target_sys: u8) {
    let mut buf = vec![0u8; 65_536];
    let mut frames = Vec::new();
    while !shared.closed.load(Ordering::Relaxed) {
        match wire.port.recv(&mut buf, &mut frames) {
            Ok(()) => {
                if frames.is_empty() {
                    continue;
                }
                let mut t = shared.tracked();
                for (hdr, msg) in frames.drain(..) {
                    if hdr.system_id == target_sys && apply_message(&mut t.state, &msg) {
                        t.last_heartbeat = Some(Instant::now());
                    }
                }
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted) => {}
            Err(e) => {
                shared.fault(format!("mavlink recv: {}", e));
                break;
            }
        }
    }
    debug!("mav: reader exited");
}

fn heartbeat_loop(wire: &Wire, shared: &Shared, interval: Duration, stop: mpsc::Receiver<()>) {
    let hb = MavMessage::HEARTBEAT(HEARTBEAT_DATA {
        custom_mode: 0,
        mavtype: MavType::MAV_TYPE_GCS,
        autopilot: MavAutopilot::MAV_AUTOPILOT_INVALID,
        base_mode: MavModeFlag::empty(),
        system_status: MavState::MAV_STATE_ACTIVE,
        mavlink_version: 3,
    });
    loop {
        if let Err(e) = wire.send(&hb) {
            shared.fault(e.to_string());
            break;
        }
        match stop.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {}
            _ => break,
        }
    }
    debug!("mav: heartbeat exited");
}

/// Fold one message from the autopilot into `state`.
/// Returns true for an autopilot HEARTBEAT.
pub fn apply_message(state: &mut VehicleState, msg: &MavMessage) -> bool {
    match msg {
        MavMessage::HEARTBEAT(hb) => {
            // gimbals, cameras and other GCSes share the system id
            if hb.autopilot == MavAutopilot::MAV_AUTOPILOT_INVALID || hb.mavtype == MavType::MAV_TYPE_GCS {
                return false;
            }
            state.armed = hb.base_mode.contains(MavModeFlag::MAV_MODE_FLAG_SAFETY_ARMED);
            state.flight_mode = Some(FlightMode::from_custom_mode(hb.custom_mode));
            state.system_ready = !matches!(hb.system_status, MavState::MAV_STATE_UNINIT | MavState::MAV_STATE_BOOT);
            return true;
        }
        MavMessage::ATTITUDE(a) => {
            state.attitude.roll = a.roll;
            state.attitude.pitch = a.pitch;
            state.attitude.yaw = a.yaw;
        }
        MavMessage::GLOBAL_POSITION_INT(p) => {
            state.location.lat = p.lat as f64 / 1e7;
            state.location.lon = p.lon as f64 / 1e7;
            // relative_alt is millimetres above home
            state.location.alt = p.relative_alt as f32 / 1000.0;
        }
        MavMessage::HOME_POSITION(h) => {
            state.home = Some(HomeLocation { lat: h.latitude as f64 / 1e7, lon: h.longitude as f64 / 1e7 });
        }
        MavMessage::SYS_STATUS(s) => update_battery(state, s),
        MavMessage::VFR_HUD(v) => {
            state.air_speed_ms = v.airspeed;
            state.ground_speed_ms = v.groundspeed;
        }
        MavMessage::GPS_RAW_INT(g) => {
            state.gps_fix_type = g.fix_type as u8;
            // 255 means unknown
            state.gps_sats = if g.satellites_visible == u8::MAX { 0 } else { g.satellites_visible };
        }
        _ => {}
    }
    false
}

fn update_battery(state: &mut VehicleState, status: &SYS_STATUS_DATA) {
    // voltage_battery is in millivolts, UINT16_MAX when unknown
    if status.voltage_battery != u16::MAX {
        state.battery.voltage = Some(status.voltage_battery as f32 / 1000.0);
    }
    // current_battery is in centiamps (0.01A), -1 means invalid
    if status.current_battery != -1 {
        state.battery.current = Some(status.current_battery as f32 / 100.0);
    }
    // battery_remaining is percentage 0-100, -1 means invalid
    if (0..=100).contains(&status.battery_remaining) {
        state.battery.remaining = Some(status.battery_remaining as u8);
    }
}

fn command_long(target_sys: u8, target_comp: u8, command: MavCmd, params: [f32; 7]) -> MavMessage {
    let [param1, param2, param3, param4, param5, param6, param7] = params;
    MavMessage::COMMAND_LONG(COMMAND_LONG_DATA {
        target_system: target_sys,
        target_component: target_comp,
        command,
        confirmation: 0,
        param1,
        param2,
        param3,
        param4,
        param5,
        param6,
        param7,
    })
}

pub fn encode_command(cmd: &VehicleCommand, target_sys: u8, target_comp: u8) -> MavMessage {
    match *cmd {
        VehicleCommand::Arm => command_long(
            target_sys, target_comp,
            MavCmd::MAV_CMD_COMPONENT_ARM_DISARM,
            [1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
        ),
        VehicleCommand::Disarm => command_long(
            target_sys, target_comp,
            MavCmd::MAV_CMD_COMPONENT_ARM_DISARM,
            [0.0; 7],
        ),
        VehicleCommand::SetMode(mode) => command_long(
            target_sys, target_comp,
            MavCmd::MAV_CMD_DO_SET_MODE,
            [
                MavModeFlag::MAV_MODE_FLAG_CUSTOM_MODE_ENABLED.bits() as f32,
                mode.custom_mode() as f32,
                0.0, 0.0, 0.0, 0.0, 0.0,
            ],
        ),
        VehicleCommand::Takeoff { altitude_m } => command_long(
            target_sys, target_comp,
            MavCmd::MAV_CMD_NAV_TAKEOFF,
            [0.0, 0.0, 0.0, 0.0, 0.0, 0.0, altitude_m],
        ),
        VehicleCommand::Velocity(sp) => MavMessage::SET_POSITION_TARGET_LOCAL_NED(SET_POSITION_TARGET_LOCAL_NED_DATA {
            time_boot_ms: 0,
            target_system: target_sys,
            target_component: target_comp,
            coordinate_frame: MavFrame::MAV_FRAME_LOCAL_NED,
            type_mask: PositionTargetTypemask::from_bits_truncate(VELOCITY_ONLY_MASK),
            x: 0.0,
            y: 0.0,
            z: 0.0,
            vx: sp.vx,
            vy: sp.vy,
            vz: sp.vz,
            afx: 0.0,
            afy: 0.0,
            afz: 0.0,
            yaw: 0.0,
            yaw_rate: 0.0,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::{LinkConnection, LinkState, VelocitySetpoint};
    use mavlink::common::{GpsFixType, ATTITUDE_DATA, GLOBAL_POSITION_INT_DATA, GPS_RAW_INT_DATA, HOME_POSITION_DATA};

    #[test]
    fn address_forms() {
        assert_eq!(MavAddress::parse("127.0.0.1:14550").unwrap().url(), "udpin:127.0.0.1:14550");
        assert_eq!(
            MavAddress::parse("/dev/ttyUSB0:57600").unwrap(),
            MavAddress::Serial { dev: "/dev/ttyUSB0".into(), baud: 57600 }
        );
        assert_eq!(MavAddress::parse("COM3:115200").unwrap().url(), "serial:COM3:115200");
        assert_eq!(MavAddress::parse("tcpout:10.0.0.2:5760").unwrap().url(), "tcpout:10.0.0.2:5760");
        assert!(MavAddress::parse("localhost").is_err());
        assert!(MavAddress::parse(":14550").is_err());
        assert!(MavAddress::parse("host:99999").is_err());
        assert!(MavAddress::parse("/dev/ttyS0:fast").is_err());
        assert_eq!(
            MavAddress::parse("serial:/dev/ttyACM0:115200").unwrap(),
            MavAddress::Serial { dev: "/dev/ttyACM0".into(), baud: 115200 }
        );
        assert!(MavAddress::parse("serial:10.0.0.2:5760").is_err());
    }

    fn heartbeat(armed: bool, custom_mode: u32, status: MavState) -> MavMessage {
        let mut base_mode = MavModeFlag::MAV_MODE_FLAG_CUSTOM_MODE_ENABLED;
        if armed {
            base_mode |= MavModeFlag::MAV_MODE_FLAG_SAFETY_ARMED;
        }
        MavMessage::HEARTBEAT(HEARTBEAT_DATA {
            custom_mode,
            mavtype: MavType::MAV_TYPE_QUADROTOR,
            autopilot: MavAutopilot::MAV_AUTOPILOT_ARDUPILOTMEGA,
            base_mode,
            system_status: status,
            mavlink_version: 3,
        })
    }

    #[test]
    fn heartbeat_sets_armed_and_mode() {
        let mut s = VehicleState::default();
        assert!(apply_message(&mut s, &heartbeat(true, 4, MavState::MAV_STATE_ACTIVE)));
        assert!(s.armed);
        assert_eq!(s.flight_mode, Some(FlightMode::Guided));
        assert!(s.system_ready);

        assert!(apply_message(&mut s, &heartbeat(false, 9, MavState::MAV_STATE_BOOT)));
        assert!(!s.armed);
        assert_eq!(s.flight_mode, Some(FlightMode::Land));
        assert!(!s.system_ready);
    }

    #[test]
    fn gcs_heartbeat_is_ignored() {
        let mut s = VehicleState::default();
        let msg = MavMessage::HEARTBEAT(HEARTBEAT_DATA {
            custom_mode: 4,
            mavtype: MavType::MAV_TYPE_GCS,
            autopilot: MavAutopilot::MAV_AUTOPILOT_INVALID,
            base_mode: MavModeFlag::MAV_MODE_FLAG_SAFETY_ARMED,
            system_status: MavState::MAV_STATE_ACTIVE,
            mavlink_version: 3,
        });
        assert!(!apply_message(&mut s, &msg));
        assert_eq!(s, VehicleState::default());
    }

    #[test]
    fn position_and_attitude_are_scaled() {
        let mut s = VehicleState::default();
        apply_message(&mut s, &MavMessage::GLOBAL_POSITION_INT(GLOBAL_POSITION_INT_DATA {
            lat: 399_250_000,
            lon: 328_360_000,
            relative_alt: 12_500,
            ..Default::default()
        }));
        apply_message(&mut s, &MavMessage::ATTITUDE(ATTITUDE_DATA { roll: 0.1, pitch: -0.2, yaw: 1.5, ..Default::default() }));
        apply_message(&mut s, &MavMessage::HOME_POSITION(HOME_POSITION_DATA {
            latitude: 399_000_000,
            longitude: 328_000_000,
            ..Default::default()
        }));
        assert!((s.location.lat - 39.925).abs() < 1e-9);
        assert!((s.location.lon - 32.836).abs() < 1e-9);
        assert!((s.location.alt - 12.5).abs() < 1e-6);
        assert_eq!(s.attitude.yaw, 1.5);
        let home = s.home.unwrap();
        assert!((home.lat - 39.9).abs() < 1e-9);
    }

    #[test]
    fn battery_sentinels_are_dropped() {
        let mut s = VehicleState::default();
        apply_message(&mut s, &MavMessage::SYS_STATUS(SYS_STATUS_DATA {
            voltage_battery: 12_600,
            current_battery: 1_250,
            battery_remaining: 87,
            ..Default::default()
        }));
        assert_eq!(s.battery.voltage, Some(12.6));
        assert_eq!(s.battery.current, Some(12.5));
        assert_eq!(s.battery.remaining, Some(87));

        apply_message(&mut s, &MavMessage::SYS_STATUS(SYS_STATUS_DATA {
            voltage_battery: u16::MAX,
            current_battery: -1,
            battery_remaining: -1,
            ..Default::default()
        }));
        // last good values survive
        assert_eq!(s.battery.voltage, Some(12.6));
        assert_eq!(s.battery.remaining, Some(87));
    }

    #[test]
    fn gps_fix_makes_armable() {
        let mut s = VehicleState::default();
        apply_message(&mut s, &heartbeat(false, 0, MavState::MAV_STATE_STANDBY));
        assert!(!s.armable());
        apply_message(&mut s, &MavMessage::GPS_RAW_INT(GPS_RAW_INT_DATA {
            fix_type: GpsFixType::GPS_FIX_TYPE_3D_FIX,
            satellites_visible: 14,
            ..Default::default()
        }));
        assert_eq!(s.gps_sats, 14);
        assert!(s.armable());
    }

    #[test]
    fn encodes_arm_and_mode() {
        match encode_command(&VehicleCommand::Arm, 1, 1) {
            MavMessage::COMMAND_LONG(c) => {
                assert_eq!(c.command, MavCmd::MAV_CMD_COMPONENT_ARM_DISARM);
                assert_eq!(c.param1, 1.0);
                assert_eq!(c.target_system, 1);
            }
            other => panic!("unexpected {:?}", other),
        }
        match encode_command(&VehicleCommand::SetMode(FlightMode::Land), 1, 1) {
            MavMessage::COMMAND_LONG(c) => {
                assert_eq!(c.command, MavCmd::MAV_CMD_DO_SET_MODE);
                assert_eq!(c.param2, 9.0);
            }
            other => panic!("unexpected {:?}", other),
        }
        match encode_command(&VehicleCommand::Takeoff { altitude_m: 25.0 }, 1, 1) {
            MavMessage::COMMAND_LONG(c) => {
                assert_eq!(c.command, MavCmd::MAV_CMD_NAV_TAKEOFF);
                assert_eq!(c.param7, 25.0);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn encodes_velocity_only_setpoint() {
        let sp = VelocitySetpoint { vx: 5.0, vy: 0.0, vz: -1.0 };
        match encode_command(&VehicleCommand::Velocity(sp), 1, 1) {
            MavMessage::SET_POSITION_TARGET_LOCAL_NED(d) => {
                assert_eq!(d.coordinate_frame, MavFrame::MAV_FRAME_LOCAL_NED);
                assert_eq!(d.type_mask.bits(), VELOCITY_ONLY_MASK);
                assert_eq!((d.vx, d.vy, d.vz), (5.0, 0.0, -1.0));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    fn free_udp_port() -> u16 {
        UdpSocket::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port()
    }

    fn driver() -> MavDriver {
        let ids = MavIds { sys_id: 255, comp_id: 190, target_sys: 1, target_comp: 1 };
        MavDriver::new(ids, Duration::from_millis(200), Duration::from_secs(3))
    }

    fn frame(sys_id: u8, msg: &MavMessage) -> Vec<u8> {
        let hdr = MavHeader { system_id: sys_id, component_id: 1, sequence: 0 };
        let mut buf = Vec::new();
        mavlink::write_versioned_msg(&mut buf, MavlinkVersion::V2, hdr, msg).unwrap();
        buf
    }

    #[test]
    fn udp_port_is_released_on_disconnect() {
        let address = format!("127.0.0.1:{}", free_udp_port());
        let link = LinkConnection::new(Arc::new(driver()));
        for _ in 0..3 {
            assert_eq!(link.connect(&address).unwrap(), LinkState::Connected);
            link.disconnect();
        }
        UdpSocket::bind(&address).unwrap();
    }

    #[test]
    fn udp_session_tracks_vehicle_and_sends_heartbeat() {
        let port = free_udp_port();
        let session = driver().open(&format!("127.0.0.1:{}", port)).unwrap();
        assert_eq!(session.read_state().unwrap_err(), LinkError::NoTelemetry);

        let vehicle = UdpSocket::bind("127.0.0.1:0").unwrap();
        vehicle.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let hb = frame(1, &heartbeat(true, 4, MavState::MAV_STATE_ACTIVE));
        let deadline = Instant::now() + Duration::from_secs(5);
        let state = loop {
            vehicle.send_to(&hb, ("127.0.0.1", port)).unwrap();
            match session.read_state() {
                Ok(s) => break s,
                Err(_) if Instant::now() < deadline => std::thread::sleep(Duration::from_millis(20)),
                Err(e) => panic!("no telemetry: {}", e),
            }
        };
        assert!(state.armed);
        assert_eq!(state.flight_mode, Some(FlightMode::Guided));

        // the listening socket learned the vehicle's address
        let mut buf = [0u8; 512];
        let (len, _) = vehicle.recv_from(&mut buf).unwrap();
        let (hdr, msg) = mavlink::read_versioned_msg::<MavMessage, _>(&mut &buf[..len], MavlinkVersion::V2).unwrap();
        assert_eq!(hdr.system_id, 255);
        assert!(matches!(msg, MavMessage::HEARTBEAT(h) if h.mavtype == MavType::MAV_TYPE_GCS));
        session.close();
    }

    #[test]
    fn traffic_from_other_systems_is_ignored() {
        let port = free_udp_port();
        let session = driver().open(&format!("127.0.0.1:{}", port)).unwrap();
        let other = UdpSocket::bind("127.0.0.1:0").unwrap();
        for _ in 0..5 {
            other.send_to(&frame(7, &heartbeat(true, 4, MavState::MAV_STATE_ACTIVE)), ("127.0.0.1", port)).unwrap();
            std::thread::sleep(Duration::from_millis(20));
        }
        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(session.read_state().unwrap_err(), LinkError::NoTelemetry);
        session.close();
    }
}
