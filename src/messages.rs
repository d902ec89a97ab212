// Message types for the command WebSocket

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::health::HealthReport;
use crate::motor::{BodyVelocity, Direction, DutyLimits, WheelVelocity};

// Command from the operator GUI -> runtime
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Inbound {
    #[serde(default)]
    pub action: String,
    // Echoed back verbatim by PING
    #[serde(default)]
    pub timestamp: Option<Value>,
    // Optional motion duty in percent of max_duty
    #[serde(default)]
    pub duty: Option<Value>,
}

/// Directional motion commands and the body velocity each one asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionKind {
    Forward,
    Reverse,
    Left,
    Right,
    Stop,
}

impl MotionKind {
    pub fn from_action(action: &str) -> Option<Self> {
        match action {
            "FORWARD" => Some(Self::Forward),
            "REVERSE" => Some(Self::Reverse),
            "LEFT" => Some(Self::Left),
            "RIGHT" => Some(Self::Right),
            "DRIVE_STOP" => Some(Self::Stop),
            _ => None,
        }
    }

    pub fn action(&self) -> &'static str {
        match self {
            Self::Forward => "FORWARD",
            Self::Reverse => "REVERSE",
            Self::Left => "LEFT",
            Self::Right => "RIGHT",
            Self::Stop => "DRIVE_STOP",
        }
    }

    /// (v m/s, w rad/s)
    pub fn velocity(&self) -> BodyVelocity {
        match self {
            Self::Forward => BodyVelocity::new(0.5, 0.0),
            Self::Reverse => BodyVelocity::new(-0.5, 0.0),
            Self::Left => BodyVelocity::new(0.0, 0.8),
            Self::Right => BodyVelocity::new(0.0, -0.8),
            Self::Stop => BodyVelocity::default(),
        }
    }

    /// (left, right) H-bridge directions
    pub fn directions(&self) -> (Direction, Direction) {
        match self {
            Self::Forward => (Direction::Forward, Direction::Forward),
            Self::Reverse => (Direction::Reverse, Direction::Reverse),
            Self::Left => (Direction::Reverse, Direction::Forward),
            Self::Right => (Direction::Forward, Direction::Reverse),
            Self::Stop => (Direction::Stop, Direction::Stop),
        }
    }
}

/// A decoded, validated inbound command
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Motion {
        kind: MotionKind,
        /// Percent of max_duty, `None` means full
        duty: Option<f32>,
    },
    SetDuty {
        a: f32,
        b: f32,
    },
    Ping {
        timestamp: Value,
    },
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Bad JSON")]
    BadJson,

    #[error("Invalid command")]
    UnknownAction(String),

    #[error("Invalid duty: expected a number between 0 and 100")]
    InvalidDuty,

    #[error("Invalid SET_DUTY: expected SET_DUTY <min> <max>")]
    InvalidSetDuty,

    #[error("Session is not the controller")]
    NotController,

    #[error("Actuation loop is not running")]
    NotRunning,
}

impl Command {
    /// Parse one text frame into a command
    pub fn parse(text: &str) -> Result<(String, Command), ProtocolError> {
        let inbound: Inbound = serde_json::from_str(text).map_err(|_| ProtocolError::BadJson)?;
        let action = inbound.action.trim().to_uppercase();
        let command = Self::decode(&action, &inbound)?;
        Ok((action, command))
    }

    /// True for commands that can only bring the robot to rest
    pub fn is_stop(&self) -> bool {
        match self {
            Command::Motion { kind, duty } => *kind == MotionKind::Stop || *duty == Some(0.0),
            _ => false,
        }
    }

    fn decode(action: &str, inbound: &Inbound) -> Result<Command, ProtocolError> {
        if action == "PING" {
            return Ok(Command::Ping {
                timestamp: inbound.timestamp.clone().unwrap_or(Value::Null),
            });
        }

        if let Some(kind) = MotionKind::from_action(action) {
            let duty = match &inbound.duty {
                None | Some(Value::Null) => None,
                Some(value) => {
                    let duty = value.as_f64().ok_or(ProtocolError::InvalidDuty)? as f32;
                    if !(0.0..=100.0).contains(&duty) {
                        return Err(ProtocolError::InvalidDuty);
                    }
                    Some(duty)
                }
            };
            return Ok(Command::Motion { kind, duty });
        }

        let mut parts = action.split_whitespace();
        if parts.next() == Some("SET_DUTY") {
            let mut number = || -> Result<f32, ProtocolError> {
                let raw = parts.next().ok_or(ProtocolError::InvalidSetDuty)?;
                let value: f32 = raw.parse().map_err(|_| ProtocolError::InvalidSetDuty)?;
                if value.is_finite() {
                    Ok(value)
                } else {
                    Err(ProtocolError::InvalidSetDuty)
                }
            };
            let a = number()?;
            let b = number()?;
            if parts.next().is_some() {
                return Err(ProtocolError::InvalidSetDuty);
            }
            return Ok(Command::SetDuty { a, b });
        }

        Err(ProtocolError::UnknownAction(action.to_string()))
    }
}

/// Health status published by the runtime
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeHealth {
    Ok,
    CmdStale,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SidePair {
    pub left: f32,
    pub right: f32,
}

// Runtime -> GUI
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Outbound {
    MotionAck {
        status: &'static str,
        command: String,
        velocities: WheelVelocity,
        duty_cycles: SidePair,
    },
    DutyAck {
        status: &'static str,
        command: &'static str,
        duty_limits: DutyLimits,
    },
    Error {
        status: &'static str,
        msg: String,
    },
    Pong {
        action: &'static str,
        timestamp: Value,
    },
    Status {
        status_update: HealthReport,
    },
    Velocity {
        head: &'static str,
        vel: BodyVelocity,
        l: f32,
        r: f32,
    },
}

impl Outbound {
    pub fn motion_ack(kind: MotionKind, velocities: WheelVelocity, duty_cycles: SidePair) -> Self {
        Self::MotionAck {
            status: "ok",
            command: kind.action().to_string(),
            velocities,
            duty_cycles,
        }
    }

    pub fn duty_ack(limits: DutyLimits) -> Self {
        Self::DutyAck {
            status: "ok",
            command: "SET_DUTY",
            duty_limits: limits,
        }
    }

    pub fn error(err: &ProtocolError) -> Self {
        Self::Error {
            status: "error",
            msg: err.to_string(),
        }
    }

    pub fn pong(timestamp: Value) -> Self {
        Self::Pong {
            action: "PONG",
            timestamp,
        }
    }

    pub fn status(report: HealthReport) -> Self {
        Self::Status { status_update: report }
    }

    /// Smoothed body velocity with the current left/right duty cycles
    pub fn velocity(vel: BodyVelocity, l: f32, r: f32) -> Self {
        Self::Velocity {
            head: "velocity_update",
            vel,
            l,
            r,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
