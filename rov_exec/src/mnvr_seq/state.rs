//! # Maneuver state

use std::fmt::Display;

use comms_if::eqpt::motor::Side;
use serde::Serialize;

/// Phases of the obstacle course mission, in the order they are normally visited.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Phase {
    ApproachFirst,
    ClassifyFirst,
    BypassFirst,
    ApproachSecond,
    ClassifySecond,
    GoAroundSecond,
    Return,

    /// The rover is parked.
    Complete,

    /// The mission was given up.
    Aborted(AbortCause),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum AbortCause {
    /// No arrow could be read on an obstacle.
    Unclassified { obstacle: u8, attempts: u32 },

    MotorLink(String),

    FrameCapture(String),
}

/// Everything the sequencer knows about the mission.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ManeuverState {
    pub phase: Phase,

    /// Distance travelled away from the start along the course.
    pub accumulated_backtrack_distance: f64,

    /// Width of the second obstacle, measured while going around it.
    pub measured_obstacle_width: f64,

    pub first_turn_was_right: bool,

    pub second_turn_was_right: bool,

    /// Inconclusive classifications of the current obstacle so far.
    pub classify_attempts: u32,
}

impl ManeuverState {
    pub fn new() -> Self {
        Self {
            phase: Phase::ApproachFirst,
            accumulated_backtrack_distance: 0.0,
            measured_obstacle_width: 0.0,
            first_turn_was_right: false,
            second_turn_was_right: false,
            classify_attempts: 0,
        }
    }

    pub fn first_side(&self) -> Side {
        Side::from_is_right(self.first_turn_was_right)
    }

    pub fn second_side(&self) -> Side {
        Side::from_is_right(self.second_turn_was_right)
    }
}

impl Default for ManeuverState {
    fn default() -> Self {
        Self::new()
    }
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Complete | Phase::Aborted(_))
    }

    /// Number of the obstacle being classified, if this is a classification phase.
    pub fn classified_obstacle(&self) -> Option<u8> {
        match self {
            Phase::ClassifyFirst => Some(1),
            Phase::ClassifySecond => Some(2),
            _ => None,
        }
    }
}

impl Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Aborted(cause) => write!(f, "Phase::Aborted({})", cause),
            p => write!(f, "Phase::{:?}", p),
        }
    }
}

impl Display for AbortCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AbortCause::Unclassified { obstacle, attempts } => write!(
                f,
                "no arrow read on obstacle {} after {} attempt(s)",
                obstacle, attempts
            ),
            AbortCause::MotorLink(e) => write!(f, "motor link failure: {}", e),
            AbortCause::FrameCapture(e) => write!(f, "frame capture failure: {}", e),
        }
    }
}
