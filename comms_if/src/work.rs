//! # Work Protocol
//!
//! Messages exchanged between the rover and its remote workers. The rover broadcasts
//! [`WorkRequest`]s, each tagged with a unique id, and workers answer with a [`WorkResponse`]
//! carrying the same id.
//!
//! All messages are JSON. Workers additionally wrap their traffic in a [`WorkerMessage`] envelope
//! so the rover can track which workers are alive.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use serde::{Deserialize, Serialize};

use crate::eqpt::motor::{Command, Side};

// ------------------------------------------------------------------------------------------------
// MACROS
// ------------------------------------------------------------------------------------------------

/// Declare the label set along with its wire names.
macro_rules! obstacle_labels {
    ($($variant:ident => $wire:expr),+ $(,)?) => {
        /// A label a vision worker can assign to an obstacle face.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum ObstacleLabel {
            $($variant,)+

            /// No label could be assigned.
            Unknown,
        }

        impl ObstacleLabel {
            /// Name of the label as sent by workers.
            pub fn as_wire(&self) -> &'static str {
                match self {
                    $(ObstacleLabel::$variant => $wire,)+
                    ObstacleLabel::Unknown => "UNKNOWN",
                }
            }

            /// Parse a label from its wire name. Unrecognised names map to `Unknown`.
            pub fn from_wire(s: &str) -> Self {
                match s.trim().to_ascii_uppercase().as_str() {
                    $($wire => ObstacleLabel::$variant,)+
                    _ => ObstacleLabel::Unknown,
                }
            }
        }
    };
}

obstacle_labels! {
    Bullseye => "BULLSEYE",
    One => "ONE",
    Two => "TWO",
    Three => "THREE",
    Four => "FOUR",
    Five => "FIVE",
    Six => "SIX",
    Seven => "SEVEN",
    Eight => "EIGHT",
    Nine => "NINE",
    A => "A",
    B => "B",
    C => "C",
    D => "D",
    E => "E",
    F => "F",
    G => "G",
    H => "H",
    S => "S",
    T => "T",
    U => "U",
    V => "V",
    W => "W",
    X => "X",
    Y => "Y",
    Z => "Z",
    Up => "UP",
    Down => "DOWN",
    Right => "RIGHT",
    Left => "LEFT",
    Circle => "CIRCLE",
}

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// A unit of work broadcast to all connected workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkRequest {
    /// Unique id used to correlate the response.
    pub id: String,

    #[serde(flatten)]
    pub body: WorkBody,
}

/// The answer to a [`WorkRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkResponse {
    pub id: String,

    /// `None` if the worker could not produce a result.
    #[serde(default)]
    pub result: Option<WorkResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisionPayload {
    /// Base64 encoded JPEG image.
    pub image: String,

    /// Ask the worker not to report the neutral (bullseye) label.
    #[serde(default)]
    pub ignore_neutral_label: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanningPayload {
    pub obstacles: Vec<Obstacle>,
}

/// An obstacle on the arena grid.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Obstacle {
    pub id: u32,
    pub x: i32,
    pub y: i32,

    /// Direction the labelled face of the obstacle points in.
    pub direction: Heading,
}

/// A pose on the arena grid.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EndPosition {
    pub x: i32,
    pub y: i32,
    pub d: Heading,
}

/// One step of a plan produced by a planning worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedCommand {
    pub action: PlannedAction,

    /// Pose of the rover once the step is complete.
    pub end_position: EndPosition,
}

/// Speeds and turn geometry used to convert planned actions to motor commands.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionProfile {
    pub straight_speed: f64,
    pub turn_speed: f64,

    /// Heading change of a single planned turn, in degrees.
    pub turn_angle_deg: f64,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

/// The payload of a request, tagged by kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkBody {
    Vision(VisionPayload),
    Planning(PlanningPayload),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkKind {
    Vision,
    Planning,
}

/// The result carried by a response. Vision workers answer with a label, planning workers with a
/// list of commands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WorkResult {
    Label(String),
    Commands(Vec<PlannedCommand>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Heading {
    North,
    South,
    East,
    West,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MoveDirection {
    Forward,
    ForwardRight,
    ForwardLeft,
    Backward,
    BackwardRight,
    BackwardLeft,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlannedAction {
    /// Drive in `direction`. `amount` is the distance for straight moves and is ignored for
    /// turns.
    Move {
        direction: MoveDirection,
        #[serde(default)]
        amount: f64,
    },

    /// Stop and capture the face of the given obstacle.
    Capture { obstacle_id: u32 },

    /// End of the plan.
    Finish,
}

/// Envelope for every message a worker sends to the rover.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerMessage {
    /// Announce the worker. Sent once on connection.
    Hello {
        #[serde(default)]
        name: Option<String>,
    },

    /// Sent periodically to show the worker is still alive.
    Heartbeat,

    /// Sent when the worker shuts down cleanly.
    Goodbye,

    Response(WorkResponse),
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl WorkBody {
    pub fn kind(&self) -> WorkKind {
        match self {
            WorkBody::Vision(_) => WorkKind::Vision,
            WorkBody::Planning(_) => WorkKind::Planning,
        }
    }
}

impl WorkResult {
    /// Whether this result can answer a request of the given kind.
    pub fn answers(&self, kind: WorkKind) -> bool {
        matches!(
            (self, kind),
            (WorkResult::Label(_), WorkKind::Vision) | (WorkResult::Commands(_), WorkKind::Planning)
        )
    }
}

impl ObstacleLabel {
    /// Direction of the arrow, if this label is one of the left/right arrows.
    pub fn arrow(&self) -> Option<Side> {
        match self {
            ObstacleLabel::Left => Some(Side::Left),
            ObstacleLabel::Right => Some(Side::Right),
            _ => None,
        }
    }
}

impl std::fmt::Display for ObstacleLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_wire())
    }
}

impl Default for MotionProfile {
    fn default() -> Self {
        Self {
            straight_speed: 55.0,
            turn_speed: 40.0,
            turn_angle_deg: 90.0,
        }
    }
}

impl PlannedAction {
    /// Convert the action into the motor command that executes it, if it needs one.
    ///
    /// Captures stop the rover so the image is sharp, the end of a plan needs no motion.
    pub fn to_motor_command(&self, profile: &MotionProfile) -> Option<Command> {
        match *self {
            PlannedAction::Move { direction, amount } => {
                let turn = |angle: f64, forward: bool| Command::Turn {
                    angle,
                    speed: profile.turn_speed,
                    forward,
                };
                let straight = |forward: bool| Command::MoveStraight {
                    distance: amount,
                    speed: profile.straight_speed,
                    forward,
                };

                Some(match direction {
                    MoveDirection::Forward => straight(true),
                    MoveDirection::Backward => straight(false),
                    MoveDirection::ForwardRight => turn(profile.turn_angle_deg, true),
                    MoveDirection::ForwardLeft => turn(-profile.turn_angle_deg, true),
                    MoveDirection::BackwardRight => turn(profile.turn_angle_deg, false),
                    MoveDirection::BackwardLeft => turn(-profile.turn_angle_deg, false),
                })
            }
            PlannedAction::Capture { .. } => Some(Command::Stop),
            PlannedAction::Finish => None,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------
