use thiserror::Error;

use crate::mode::FlightMode;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum LinkError {
    #[error("link not connected")]
    NotConnected,
    #[error("link lost; reconnect required")]
    Lost,
    #[error("invalid link address {0:?}")]
    InvalidAddress(String),
    #[error("connect {address} failed: {reason}")]
    Connect { address: String, reason: String },
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("no telemetry from vehicle")]
    NoTelemetry,
}

impl LinkError {
    /// Transport-level failures take the whole link down; everything else is transient.
    pub fn is_fatal(&self) -> bool {
        matches!(self, LinkError::Transport(_))
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CommandError {
    #[error("another command is in flight")]
    Busy,
    #[error("vehicle already airborne ({altitude_m:.1} m)")]
    AlreadyAirborne { altitude_m: f32 },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("telemetry stream closed")]
    TelemetryClosed,
    #[error(transparent)]
    Link(#[from] LinkError),
}

/// Which confirmation wait a command was in when it stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    AwaitingTelemetry,
    AwaitingArmable,
    AwaitingArmed,
    AwaitingDisarmed,
    AwaitingMode(FlightMode),
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::AwaitingTelemetry => f.write_str("awaiting telemetry"),
            Phase::AwaitingArmable => f.write_str("awaiting armable"),
            Phase::AwaitingArmed => f.write_str("awaiting armed"),
            Phase::AwaitingDisarmed => f.write_str("awaiting disarmed"),
            Phase::AwaitingMode(m) => write!(f, "awaiting mode {}", m),
        }
    }
}

/// Terminal result of every operator command.
#[derive(Debug, Clone, PartialEq)]
#[must_use]
pub enum CommandOutcome {
    Succeeded,
    Failed(CommandError),
    TimedOut(Phase),
    Cancelled,
}

impl CommandOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, CommandOutcome::Succeeded)
    }
}

impl From<CommandError> for CommandOutcome {
    fn from(e: CommandError) -> Self {
        CommandOutcome::Failed(e)
    }
}

impl From<LinkError> for CommandOutcome {
    fn from(e: LinkError) -> Self {
        CommandOutcome::Failed(CommandError::Link(e))
    }
}

impl std::fmt::Display for CommandOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandOutcome::Succeeded => f.write_str("succeeded"),
            CommandOutcome::Failed(e) => write!(f, "failed: {}", e),
            CommandOutcome::TimedOut(p) => write!(f, "timed out ({})", p),
            CommandOutcome::Cancelled => f.write_str("cancelled"),
        }
    }
}
