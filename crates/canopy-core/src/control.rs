//! # Controller State Machine
//!
//! Pure operating-state transitions for an edge controller. The edge agent
//! wraps this with audit logging and status publishing; nothing here touches
//! hardware or I/O.
//!
//! ## States
//! ```text
//!                 start(program)
//!     ┌──────┐ ─────────────────► ┌─────────┐
//!     │ IDLE │                    │ RUNNING │
//!     └──────┘ ◄───────────────── └─────────┘
//!        ▲  │         stop             │
//!  reset │  │ emergency-stop           │ emergency-stop
//!        │  ▼                          ▼
//!     ┌───────────────────────────────────┐
//!     │            EMERGENCY              │  all actuators forced off
//!     └───────────────────────────────────┘
//! ```
//!
//! Every action is keyed by target state: repeating an action that is already
//! in effect reports [`Transition::Unchanged`] instead of failing.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Channel name of the main pump; switched on by `start`.
pub const PUMP_CHANNEL: &str = "pump";

// =============================================================================
// Operating State
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperatingState {
    #[default]
    Idle,
    Running,
    Emergency,
}

impl std::fmt::Display for OperatingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperatingState::Idle => write!(f, "IDLE"),
            OperatingState::Running => write!(f, "RUNNING"),
            OperatingState::Emergency => write!(f, "EMERGENCY"),
        }
    }
}

// =============================================================================
// Actions
// =============================================================================

/// A parsed command the controller knows how to apply.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlAction {
    EmergencyStop,
    Start { program_id: String },
    Stop,
    Manual { channel: String, on: bool },
    Reset,
}

impl ControlAction {
    /// Parses a wire command type plus its detail document.
    ///
    /// ## Wire Names
    /// `emergency-stop`, `start` (`{programId}`), `stop`,
    /// `manual` (`{channel, on}`), `reset`.
    pub fn parse(command_type: &str, detail: &serde_json::Value) -> Result<Self, CoreError> {
        match command_type {
            "emergency-stop" => Ok(ControlAction::EmergencyStop),
            "start" => {
                let program_id = detail
                    .get("programId")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| CoreError::InvalidCommand {
                        command: command_type.to_string(),
                        reason: "missing programId".to_string(),
                    })?;
                Ok(ControlAction::Start {
                    program_id: program_id.to_string(),
                })
            }
            "stop" => Ok(ControlAction::Stop),
            "manual" => {
                let channel = detail.get("channel").and_then(|v| v.as_str());
                let on = detail.get("on").and_then(|v| v.as_bool());
                match (channel, on) {
                    (Some(channel), Some(on)) => Ok(ControlAction::Manual {
                        channel: channel.to_string(),
                        on,
                    }),
                    _ => Err(CoreError::InvalidCommand {
                        command: command_type.to_string(),
                        reason: "expected {channel, on}".to_string(),
                    }),
                }
            }
            "reset" => Ok(ControlAction::Reset),
            other => Err(CoreError::UnknownCommand(other.to_string())),
        }
    }

    /// Wire name of this action.
    pub fn name(&self) -> &'static str {
        match self {
            ControlAction::EmergencyStop => "emergency-stop",
            ControlAction::Start { .. } => "start",
            ControlAction::Stop => "stop",
            ControlAction::Manual { .. } => "manual",
            ControlAction::Reset => "reset",
        }
    }
}

/// Result of applying an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// State or actuators changed.
    Changed,
    /// The action was already in effect.
    Unchanged,
}

// =============================================================================
// Controller State
// =============================================================================

/// Operating state plus actuator outputs of one site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerState {
    pub state: OperatingState,
    pub active_program: Option<String>,
    /// Actuator channel → output flag.
    pub actuators: BTreeMap<String, bool>,
}

impl ControllerState {
    /// Creates an idle controller with every listed channel off.
    pub fn new<I, S>(channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ControllerState {
            state: OperatingState::default(),
            active_program: None,
            actuators: channels.into_iter().map(|c| (c.into(), false)).collect(),
        }
    }

    /// Whether any actuator output is on.
    pub fn any_output_on(&self) -> bool {
        self.actuators.values().any(|on| *on)
    }

    fn all_off(&mut self) -> bool {
        let mut changed = false;
        for on in self.actuators.values_mut() {
            changed |= *on;
            *on = false;
        }
        changed
    }

    /// Applies an action.
    ///
    /// Emergency-stop never fails. Start and manual actions are refused while
    /// in EMERGENCY; the state is left untouched on every error.
    pub fn apply(&mut self, action: &ControlAction) -> Result<Transition, CoreError> {
        match action {
            ControlAction::EmergencyStop => {
                let outputs_changed = self.all_off();
                let was = self.state;
                self.state = OperatingState::Emergency;
                self.active_program = None;
                if outputs_changed || was != OperatingState::Emergency {
                    Ok(Transition::Changed)
                } else {
                    Ok(Transition::Unchanged)
                }
            }

            ControlAction::Start { program_id } => match self.state {
                OperatingState::Emergency => Err(self.refused(action)),
                OperatingState::Running if self.active_program.as_deref() == Some(program_id.as_str()) => {
                    Ok(Transition::Unchanged)
                }
                _ => {
                    self.state = OperatingState::Running;
                    self.active_program = Some(program_id.clone());
                    if let Some(pump) = self.actuators.get_mut(PUMP_CHANNEL) {
                        *pump = true;
                    }
                    Ok(Transition::Changed)
                }
            },

            ControlAction::Stop => match self.state {
                OperatingState::Running => {
                    self.all_off();
                    self.state = OperatingState::Idle;
                    self.active_program = None;
                    Ok(Transition::Changed)
                }
                _ => Ok(Transition::Unchanged),
            },

            ControlAction::Manual { channel, on } => {
                if self.state == OperatingState::Emergency {
                    return Err(self.refused(action));
                }
                let slot = self
                    .actuators
                    .get_mut(channel)
                    .ok_or_else(|| CoreError::UnknownChannel(channel.clone()))?;
                if *slot == *on {
                    Ok(Transition::Unchanged)
                } else {
                    *slot = *on;
                    Ok(Transition::Changed)
                }
            }

            ControlAction::Reset => match self.state {
                OperatingState::Emergency => {
                    self.state = OperatingState::Idle;
                    Ok(Transition::Changed)
                }
                _ => Ok(Transition::Unchanged),
            },
        }
    }

    fn refused(&self, action: &ControlAction) -> CoreError {
        CoreError::InvalidTransition {
            command: action.name().to_string(),
            state: self.state.to_string(),
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
