use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use gcs_fc::{
    cancel_pair, doctor as fc_doctor, CommandRequest, FcConfig, FlightMode, GroundStation,
    LinkState, VehicleSnapshot, VelocitySetpoint,
};
use gcs_map::{doctor as map_doctor, MapServer};

use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Parser)]
#[command(name = "gcs", version, about = "Ground control station for MAVLink vehicles")]
struct Cli {
    #[arg(long)]
    config: String,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Validate the config file.
    Doctor,
    /// Connect, sample telemetry and serve the map endpoint until ctrl-c.
    Run,
    /// Print one telemetry frame as JSON.
    Status,
    Arm,
    /// Disarm on the ground; switches to LAND when airborne.
    Disarm,
    /// Change flight mode (GUIDED, LOITER, RTL, LAND, STABILIZE, ...).
    Mode { name: String },
    Takeoff {
        /// Target altitude in metres (default from config).
        #[arg(long)]
        alt: Option<f32>,
    },
    /// Send a NED velocity setpoint once per tick for SECONDS ticks.
    Velocity {
        #[arg(allow_negative_numbers = true)]
        vx: f32,
        #[arg(allow_negative_numbers = true)]
        vy: f32,
        #[arg(allow_negative_numbers = true)]
        vz: f32,
        seconds: u32,
    },
}

#[derive(Debug, serde::Deserialize)]
struct Config {
    fc: FcConfig,
    map: Option<MapCfg>,
}

#[derive(Debug, serde::Deserialize)]
struct MapCfg {
    enable: bool,
    bind: String,
}

fn load_config(path: &str) -> Result<Config> {
    let s = std::fs::read_to_string(path).context("read config")?;
    toml::from_str(&s).context("parse config toml")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let cfg = load_config(&cli.config)?;

    match cli.cmd {
        Command::Doctor => doctor(&cfg),
        Command::Run => run(&cfg).await,
        Command::Status => status(&cfg).await,
        Command::Arm => command(&cfg, CommandRequest::Arm).await,
        Command::Disarm => command(&cfg, CommandRequest::Disarm).await,
        Command::Mode { name } => {
            let mode: FlightMode = name.parse().with_context(|| {
                format!("known modes: {}", FlightMode::vocabulary().collect::<Vec<_>>().join(", "))
            })?;
            command(&cfg, CommandRequest::SetMode(mode)).await
        }
        Command::Takeoff { alt } => {
            let altitude_m = alt.unwrap_or_else(|| cfg.fc.takeoff_altitude_m());
            command(&cfg, CommandRequest::Takeoff { altitude_m }).await
        }
        Command::Velocity { vx, vy, vz, seconds } => {
            let setpoint = VelocitySetpoint { vx, vy, vz };
            command(&cfg, CommandRequest::SendVelocity { setpoint, duration_s: seconds }).await
        }
    }
}

fn doctor(cfg: &Config) -> Result<()> {
    info!("doctor: starting");
    fc_doctor::check_fc(&cfg.fc)?;
    if let Some(m) = &cfg.map {
        if m.enable {
            map_doctor::check_bind(&m.bind)?;
        }
    }
    info!("doctor: OK");
    Ok(())
}

async fn connect(cfg: &Config) -> Result<GroundStation> {
    let station = GroundStation::mavlink(&cfg.fc);
    station
        .connect(&cfg.fc.address)
        .await
        .with_context(|| format!("connect {}", cfg.fc.address))?;
    Ok(station)
}

async fn wait_telemetry(station: &GroundStation, within: Duration) -> Result<Arc<VehicleSnapshot>> {
    let mut rx = station.subscribe();
    tokio::time::timeout(within, rx.wait_for(Option::is_some))
        .await
        .context("no telemetry from vehicle")?
        .context("telemetry stopped")?;
    station.latest().context("no telemetry from vehicle")
}

async fn status(cfg: &Config) -> Result<()> {
    let station = connect(cfg).await?;
    let snap = wait_telemetry(&station, cfg.fc.coordinator().confirm_timeout).await;
    station.disconnect().await;
    println!("{}", serde_json::to_string_pretty(&snap?.frame())?);
    Ok(())
}

async fn command(cfg: &Config, req: CommandRequest) -> Result<()> {
    let station = connect(cfg).await?;
    if let Err(e) = wait_telemetry(&station, cfg.fc.coordinator().confirm_timeout).await {
        station.disconnect().await;
        return Err(e);
    }

    let (canceller, cancel) = cancel_pair();
    let exec = station.execute(req, &cancel);
    tokio::pin!(exec);
    let outcome = loop {
        tokio::select! {
            outcome = &mut exec => break outcome,
            _ = tokio::signal::ctrl_c() => {
                warn!("ctrl-c: cancelling {:?}", req);
                canceller.cancel();
            }
        }
    };

    station.disconnect().await;
    println!("{:?}: {}", req, outcome);
    anyhow::ensure!(outcome.is_success(), "{:?} {}", req, outcome);
    Ok(())
}

async fn run(cfg: &Config) -> Result<()> {
    info!("run: starting");
    // bind first so a taken port fails the run before we touch the vehicle
    let map = match cfg.map.as_ref().filter(|m| m.enable) {
        Some(m) => Some(gcs_map::listen(&m.bind).await?),
        None => None,
    };

    let station = connect(cfg).await?;
    let (canceller, cancel) = cancel_pair();
    let map_handle =
        map.map(|listener| tokio::spawn(MapServer::new(station.subscribe()).serve_on(listener, cancel.clone())));

    let mut report = tokio::time::interval(Duration::from_secs(5));
    'run: loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = report.tick() => {
                if station.link_state() == LinkState::Lost {
                    tokio::select! {
                        r = station.connect(&cfg.fc.address) => match r {
                            Ok(_) => info!("run: reconnected to {}", cfg.fc.address),
                            Err(e) => warn!("run: reconnect failed: {}", e),
                        },
                        _ = tokio::signal::ctrl_c() => break 'run,
                    }
                }
                log_status(&station);
            }
        }
    }

    info!("run: shutting down");
    canceller.cancel();
    station.disconnect().await;
    if let Some(h) = map_handle {
        h.await.context("map task")??;
    }
    Ok(())
}

fn log_status(station: &GroundStation) {
    let Some(snap) = station.latest() else {
        warn!("status: no telemetry yet (link {:?})", station.link_state());
        return;
    };
    let f = snap.frame();
    info!(
        "status: mode={} armed={} alt={:.1}m gs={:.1}m/s bat={:?}% sats={} home={}",
        f.flight_mode.as_deref().unwrap_or("?"),
        f.armed,
        f.altitude_m,
        f.ground_speed_ms,
        f.battery_percent,
        f.gps_sats,
        f.home_distance_km.map(|d| format!("{:.2} km", d)).unwrap_or_else(|| "-".into()),
    );
}
