//! # Maneuver sequencer parameters
//!
//! Distances are in the motor controller's odometry units, speeds in its speed units and angles in
//! degrees.

use comms_if::eqpt::motor::Side;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManeuverParams {
    /// Speed of straight line moves
    pub forward_speed: f64,

    /// Speed of turns, wiggles and side hugs
    pub turn_speed: f64,

    /// Speed of moves which drive until a distance is reached
    pub approach_speed: f64,

    /// Distance from the first obstacle at which the first approach stops
    pub front_distance_threshold: f64,

    /// Distance the rover reverses before approaching the second obstacle
    pub second_backoff_distance: f64,

    /// Distance from the second obstacle at which the second approach stops
    pub closeup_distance_threshold: f64,

    /// Distance from the second obstacle the rover retreats to before turning
    pub turn_front_distance_threshold: f64,

    /// Heading change of the first turn of the bypass, the middle turn is twice this
    pub bypass_angle_deg: f64,

    /// Distance travelled along the course by the bypass of the first obstacle
    pub bypass_distance: f64,

    /// Lateral distance kept from the second obstacle while going around it
    pub hug_threshold: f64,

    /// Subtracted from the diagonal offset of the return path
    pub return_offset_constant: f64,

    /// Subtracted from the accumulated distance to get the straight part of the return path
    pub backtrack_margin: f64,

    /// Heading change of the two turns of the return path
    pub realign_angle_deg: f64,

    /// Distance from the carpark wall at which the rover parks
    pub parking_distance: f64,

    /// Which arrow decides the sign of the return path turns
    pub realign_reference: RealignReference,

    /// Stop and wait for the rover to settle before capturing each frame
    pub settle_before_capture: bool,

    /// Number of times an inconclusive classification is retried
    pub max_classify_retries: u32,

    /// Time to wait for a classification before counting it as inconclusive, in seconds
    pub classify_timeout_s: f64,

    /// Direction to take when no arrow could be read. If not set the mission aborts instead.
    pub fallback_direction: Option<Side>,

    /// Period between steps while waiting for a classification, in seconds
    pub cycle_period_s: f64,
}

/// Selects the arrow whose direction is mirrored by the return path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RealignReference {
    First,
    Second,
}

impl Default for ManeuverParams {
    fn default() -> Self {
        Self {
            forward_speed: 70.0,
            turn_speed: 40.0,
            approach_speed: 40.0,
            front_distance_threshold: 30.0,
            second_backoff_distance: 10.0,
            closeup_distance_threshold: 20.0,
            turn_front_distance_threshold: 30.0,
            bypass_angle_deg: 45.0,
            bypass_distance: 105.0,
            hug_threshold: 25.0,
            return_offset_constant: 5.0,
            backtrack_margin: 20.0,
            realign_angle_deg: 45.0,
            parking_distance: 15.0,
            realign_reference: RealignReference::First,
            settle_before_capture: true,
            max_classify_retries: 2,
            classify_timeout_s: 10.0,
            fallback_direction: None,
            cycle_period_s: 0.05,
        }
    }
}
