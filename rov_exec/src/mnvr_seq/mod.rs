//! # Maneuver Sequencer
//!
//! This module implements the [`Sequencer`] state machine, which drives the rover through the
//! two obstacle course. The mission is broken down into a number of phases:
//!
//! - `ApproachFirst` - Drive up to the first obstacle, measuring the distance, and ask the workers
//!   to classify its arrow.
//! - `ClassifyFirst` - Wait for the classification of the first arrow.
//! - `BypassFirst` - Pass the first obstacle on the side its arrow points to.
//! - `ApproachSecond` - Drive up to the second obstacle, measuring the distance, then retreat to
//!   a safe turning distance and ask the workers to classify its arrow.
//! - `ClassifySecond` - Wait for the classification of the second arrow.
//! - `GoAroundSecond` - Go around the second obstacle on the side its arrow points to, measuring
//!   its width.
//! - `Return` - Drive back to the carpark using the accumulated distance and measured width.
//!
//! The mission ends in `Complete`, or in `Aborted` if a phase fails. Motor commands are issued
//! synchronously, classifications are requested without blocking and polled on each step.

// ------------------------------------------------------------------------------------------------
// MODULES
// ------------------------------------------------------------------------------------------------

pub mod moves;
mod params;
mod state;

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use std::{
    thread,
    time::{Duration, Instant},
};

use comms_if::{
    eqpt::motor::{Command, Side},
    work::ObstacleLabel,
};
use log::{error, info, warn};
use serde::Serialize;

use crate::{
    frame_source::{FrameSource, FrameSourceError},
    motor_link::{MotorLink, MotorLinkError},
    work_dispatcher::{PendingWork, WorkDispatcher},
};

pub use params::{ManeuverParams, RealignReference};
pub use state::{AbortCause, ManeuverState, Phase};

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Obstacle course mission state machine.
pub struct Sequencer<'a> {
    params: ManeuverParams,

    motor: &'a mut MotorLink,

    dispatcher: &'a WorkDispatcher,

    frames: &'a mut dyn FrameSource,

    state: ManeuverState,

    /// Classification in flight, if any.
    pending: Option<PendingClassification>,

    start: Instant,

    on_mission_end: Option<Box<dyn FnOnce(&MissionReport) + 'a>>,
}

struct PendingClassification {
    work: PendingWork<ObstacleLabel>,

    deadline: Instant,
}

/// Summary of a finished mission.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MissionReport {
    pub outcome: MissionOutcome,

    pub final_state: ManeuverState,

    /// Time from the creation of the sequencer to the end of the mission, in seconds.
    pub elapsed_s: f64,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

#[derive(thiserror::Error, Debug)]
pub enum SequencerError {
    #[error("Motor link error: {0}")]
    MotorLink(#[from] MotorLinkError),

    #[error("Could not capture a frame: {0}")]
    FrameCapture(#[from] FrameSourceError),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum MissionOutcome {
    Complete,
    Aborted(AbortCause),
}

/// Result of a single [`Sequencer::step`].
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// The mission moved on to a new phase.
    Progressed,

    /// Still in the same phase, waiting for a classification.
    Waiting,

    /// The mission has ended.
    Finished(MissionOutcome),
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl<'a> Sequencer<'a> {
    pub fn new(
        params: ManeuverParams,
        motor: &'a mut MotorLink,
        dispatcher: &'a WorkDispatcher,
        frames: &'a mut dyn FrameSource,
    ) -> Self {
        Self {
            params,
            motor,
            dispatcher,
            frames,
            state: ManeuverState::new(),
            pending: None,
            start: Instant::now(),
            on_mission_end: None,
        }
    }

    /// Set a handler invoked once with the report when the mission ends.
    pub fn with_mission_end_handler<F>(mut self, handler: F) -> Self
    where
        F: FnOnce(&MissionReport) + 'a,
    {
        self.on_mission_end = Some(Box::new(handler));
        self
    }

    pub fn state(&self) -> &ManeuverState {
        &self.state
    }

    /// Step the sequencer until the mission ends, returning the mission report.
    pub fn run(mut self) -> MissionReport {
        info!("Mission started");

        let cycle_period = Duration::from_secs_f64(self.params.cycle_period_s.max(0.0));

        let outcome = loop {
            match self.step() {
                StepOutcome::Finished(o) => break o,
                StepOutcome::Waiting => thread::sleep(cycle_period),
                StepOutcome::Progressed => (),
            }
        };

        let report = MissionReport {
            outcome,
            final_state: self.state.clone(),
            elapsed_s: self.start.elapsed().as_secs_f64(),
        };

        match report.outcome {
            MissionOutcome::Complete => info!("Mission complete in {:.1} s", report.elapsed_s),
            MissionOutcome::Aborted(ref cause) => {
                error!("Mission aborted after {:.1} s: {}", report.elapsed_s, cause)
            }
        }

        if let Some(handler) = self.on_mission_end.take() {
            handler(&report);
        }

        report
    }

    /// Execute the current phase.
    ///
    /// Errors are logged and abort the mission rather than being returned.
    pub fn step(&mut self) -> StepOutcome {
        if let Some(outcome) = self.outcome() {
            return StepOutcome::Finished(outcome);
        }

        let next = match self.step_phase() {
            Ok(p) => p,
            Err(e) => {
                error!("{} failed: {}", self.state.phase, e);
                Phase::Aborted(e.abort_cause())
            }
        };

        if next == self.state.phase {
            return StepOutcome::Waiting;
        }

        info!("Maneuver phase change to: {}", next);
        self.state.phase = next;

        match self.outcome() {
            Some(o) => StepOutcome::Finished(o),
            None => StepOutcome::Progressed,
        }
    }

    fn outcome(&self) -> Option<MissionOutcome> {
        if !self.state.phase.is_terminal() {
            return None;
        }

        match self.state.phase {
            Phase::Aborted(ref cause) => Some(MissionOutcome::Aborted(cause.clone())),
            _ => Some(MissionOutcome::Complete),
        }
    }

    /// Run the current phase and return the phase to move to.
    fn step_phase(&mut self) -> Result<Phase, SequencerError> {
        match self.state.phase {
            Phase::ApproachFirst => self.approach_first(),
            Phase::ClassifyFirst | Phase::ClassifySecond => self.classify(),
            Phase::BypassFirst => self.bypass_first(),
            Phase::ApproachSecond => self.approach_second(),
            Phase::GoAroundSecond => self.go_around_second(),
            Phase::Return => self.return_to_carpark(),
            ref p => Ok(p.clone()),
        }
    }

    fn approach_first(&mut self) -> Result<Phase, SequencerError> {
        self.motor.start_measurement()?;
        self.motor.send_and_wait(&[Command::MoveToDistance {
            distance: self.params.front_distance_threshold,
            speed: self.params.approach_speed,
            forward: true,
        }])?;
        let travelled = self.motor.stop_measurement()?;

        self.state.accumulated_backtrack_distance += travelled as f64;
        info!("Travelled {} to the first obstacle", travelled);

        self.request_classification()?;

        Ok(Phase::ClassifyFirst)
    }

    fn classify(&mut self) -> Result<Phase, SequencerError> {
        let obstacle = match self.state.phase.classified_obstacle() {
            Some(o) => o,
            None => return Ok(self.state.phase.clone()),
        };
        let next = match obstacle {
            1 => Phase::BypassFirst,
            _ => Phase::GoAroundSecond,
        };

        let label = match self.poll_classification() {
            Some(l) => l,
            None => return Ok(self.state.phase.clone()),
        };

        if let Some(side) = label.arrow() {
            info!("Obstacle {} arrow points {:?}", obstacle, side);
            self.record_arrow(obstacle, side);
            return Ok(next);
        }

        self.state.classify_attempts += 1;
        let attempts = self.state.classify_attempts;
        warn!(
            "Obstacle {} classified as {}, not an arrow (attempt {})",
            obstacle, label, attempts
        );

        if attempts <= self.params.max_classify_retries {
            self.request_classification()?;
            return Ok(self.state.phase.clone());
        }

        match self.params.fallback_direction {
            Some(side) => {
                warn!("Direction arrow not read, going {:?} by default", side);
                self.record_arrow(obstacle, side);
                Ok(next)
            }
            None => {
                error!("Direction arrow not read on obstacle {}", obstacle);
                Ok(Phase::Aborted(AbortCause::Unclassified { obstacle, attempts }))
            }
        }
    }

    fn bypass_first(&mut self) -> Result<Phase, SequencerError> {
        let cmds = moves::bypass(self.state.first_side(), &self.params);

        let sent = self.motor.send_fire_and_forget(&cmds)?;
        self.motor.drain_acks(sent)?;

        self.state.accumulated_backtrack_distance += self.params.bypass_distance;

        Ok(Phase::ApproachSecond)
    }

    fn approach_second(&mut self) -> Result<Phase, SequencerError> {
        self.motor.send_and_wait(&[Command::MoveStraight {
            distance: self.params.second_backoff_distance,
            speed: self.params.approach_speed,
            forward: false,
        }])?;

        self.motor.start_measurement()?;
        self.motor.send_and_wait(&[Command::MoveToDistance {
            distance: self.params.closeup_distance_threshold,
            speed: self.params.approach_speed,
            forward: true,
        }])?;
        let travelled = self.motor.stop_measurement()?;

        self.state.accumulated_backtrack_distance += travelled as f64;
        info!("Travelled {} to the second obstacle", travelled);

        self.motor.send_and_wait(&[Command::MoveToDistance {
            distance: self.params.turn_front_distance_threshold,
            speed: self.params.approach_speed,
            forward: false,
        }])?;

        self.request_classification()?;

        Ok(Phase::ClassifySecond)
    }

    fn go_around_second(&mut self) -> Result<Phase, SequencerError> {
        let side = self.state.second_side();

        self.motor
            .send_and_wait(&moves::go_around_lead_in(side, &self.params))?;

        self.motor.start_measurement()?;
        self.motor
            .send_and_wait(&[moves::go_around_measure(side, &self.params)])?;
        let width = self.motor.stop_measurement()?;

        self.state.measured_obstacle_width = width as f64;
        info!("Second obstacle is {} wide", width);

        self.motor
            .send_and_wait(&moves::go_around_exit(side, &self.params))?;

        Ok(Phase::Return)
    }

    fn return_to_carpark(&mut self) -> Result<Phase, SequencerError> {
        let offset = moves::offset_distance(
            self.state.measured_obstacle_width,
            self.params.return_offset_constant,
        );

        let accumulated = self.state.accumulated_backtrack_distance;
        let backtrack = moves::backtrack_distance(accumulated, self.params.backtrack_margin);
        if accumulated < self.params.backtrack_margin {
            warn!(
                "Accumulated distance {} is shorter than the backtrack margin, not backtracking",
                accumulated
            );
        }

        let reference = match self.params.realign_reference {
            RealignReference::First => self.state.first_side(),
            RealignReference::Second => self.state.second_side(),
        };

        info!(
            "Returning: backtrack {}, offset {}, mirrored on the {:?} arrow",
            backtrack, offset, self.params.realign_reference
        );

        self.motor.send_and_wait(&moves::return_path(
            reference,
            backtrack,
            offset,
            &self.params,
        ))?;

        Ok(Phase::Complete)
    }

    /// Capture a frame and ask the workers to classify it.
    fn request_classification(&mut self) -> Result<(), SequencerError> {
        if self.params.settle_before_capture {
            self.motor.wait_settled()?;
        }

        let image = self.frames.capture_encoded()?;
        let work = self.dispatcher.submit_vision(image, true);

        self.pending = Some(PendingClassification {
            work,
            deadline: Instant::now()
                + Duration::from_secs_f64(self.params.classify_timeout_s.max(0.0)),
        });

        Ok(())
    }

    /// Take the pending classification's label if it is available. Timed out or lost requests
    /// give `Unknown`.
    fn poll_classification(&mut self) -> Option<ObstacleLabel> {
        let pending = match self.pending.take() {
            Some(p) => p,
            None => {
                warn!("No classification in flight");
                return Some(ObstacleLabel::Unknown);
            }
        };

        match pending.work.try_take() {
            Ok(Some(label)) => Some(label),
            Ok(None) if Instant::now() < pending.deadline => {
                self.pending = Some(pending);
                None
            }
            Ok(None) => {
                warn!("Classification {} timed out", pending.work.id());
                Some(ObstacleLabel::Unknown)
            }
            Err(e) => {
                warn!("{}", e);
                Some(ObstacleLabel::Unknown)
            }
        }
    }

    fn record_arrow(&mut self, obstacle: u8, side: Side) {
        self.state.classify_attempts = 0;

        match obstacle {
            1 => self.state.first_turn_was_right = side.is_right(),
            _ => self.state.second_turn_was_right = side.is_right(),
        }
    }
}

impl SequencerError {
    pub fn abort_cause(&self) -> AbortCause {
        match self {
            SequencerError::MotorLink(e) => AbortCause::MotorLink(e.to_string()),
            SequencerError::FrameCapture(e) => AbortCause::FrameCapture(e.to_string()),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------
