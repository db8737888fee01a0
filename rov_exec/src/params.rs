//! # Rover Executable Parameters
//!
//! This module provide parameters for the rover executable, loaded from a single TOML file with
//! one table per module.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use comms_if::net::NetParams;
use serde::Deserialize;

use crate::{
    frame_source::FrameParams, mnvr_seq::ManeuverParams, motor_link::MotorLinkParams,
    work_dispatcher::WorkerServerParams,
};

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct RovExecParams {
    pub net: NetParams,

    pub motor_link: MotorLinkParams,

    #[serde(default)]
    pub worker_server: WorkerServerParams,

    #[serde(default)]
    pub maneuver: ManeuverParams,

    pub frames: FrameParams,
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;
    use crate::mnvr_seq::RealignReference;
    use comms_if::eqpt::motor::Side;

    #[test]
    fn test_minimal_params() {
        let params: RovExecParams = util::params::from_str(
            r#"
            [net]
            worker_endpoint = "tcp://*:5100"

            [motor_link]
            port = "/dev/ttyACM0"

            [frames]
            image_path = "/tmp/frame.jpg"
            jpeg_quality = 80
            "#,
        )
        .unwrap();

        assert_eq!(params.motor_link.baud_rate, 115_200);
        assert_eq!(params.motor_link.ack_timeout_s, None);
        assert_eq!(params.worker_server.worker_timeout_s, 5.0);
        assert_eq!(params.maneuver.max_classify_retries, 2);
        assert_eq!(params.maneuver.realign_reference, RealignReference::First);
    }

    #[test]
    fn test_maneuver_overrides() {
        let params: RovExecParams = util::params::from_str(
            r#"
            [net]
            worker_endpoint = "tcp://*:5100"

            [motor_link]
            port = "/dev/ttyACM0"
            ack_timeout_s = 12.5

            [maneuver]
            forward_speed = 60
            fallback_direction = "Right"
            realign_reference = "Second"

            [frames]
            image_path = "/tmp/frame.jpg"
            jpeg_quality = 80
            "#,
        )
        .unwrap();

        assert_eq!(params.motor_link.ack_timeout_s, Some(12.5));
        assert_eq!(params.maneuver.forward_speed, 60.0);
        assert_eq!(params.maneuver.fallback_direction, Some(Side::Right));
        assert_eq!(params.maneuver.realign_reference, RealignReference::Second);
        assert_eq!(params.maneuver.turn_speed, 40.0);
    }

    #[test]
    fn test_shipped_params() {
        let params: RovExecParams =
            util::params::from_str(include_str!("../../params/rov_exec.toml")).unwrap();

        assert_eq!(params.net.worker_endpoint, "tcp://*:5100");
        assert_eq!(params.maneuver.fallback_direction, None);
    }

    #[test]
    fn test_shipped_fallback_direction() {
        let shipped = include_str!("../../params/rov_exec.toml");
        let enabled = shipped.replace("# fallback_direction", "fallback_direction");
        assert_ne!(enabled, shipped);

        let params: RovExecParams = util::params::from_str(&enabled).unwrap();
        assert_eq!(params.maneuver.fallback_direction, Some(Side::Left));
    }
}
