//! # Maneuver moves
//!
//! Command sequences of the fixed maneuvers. Every maneuver which depends on an arrow direction is
//! built from the direction's sign, so the left and right versions are exact mirrors.

use std::f64::consts::SQRT_2;

use comms_if::eqpt::motor::{Command, Side};

use super::params::ManeuverParams;

/// Pass the first obstacle on the side its arrow points to, ending back on the course line.
pub fn bypass(side: Side, params: &ManeuverParams) -> Vec<Command> {
    let s = side.sign();
    let a = params.bypass_angle_deg;

    vec![
        turn(s * a, params),
        Command::Wiggle,
        turn(-s * 2.0 * a, params),
        Command::Wiggle,
        turn(s * a, params),
        Command::Wiggle,
    ]
}

/// Leave the front of the second obstacle toward its arrow and hug it round to its back face,
/// ready to measure it.
pub fn go_around_lead_in(side: Side, params: &ManeuverParams) -> Vec<Command> {
    let s = side.sign();

    vec![
        turn(s * 90.0, params),
        Command::Wiggle,
        hug(side, params),
        turn(-s * 90.0, params),
        Command::Wiggle,
        hug(side, params),
        turn(-s * 90.0, params),
        Command::Wiggle,
    ]
}

/// Hug along the back face of the second obstacle. Measured with odometry.
pub fn go_around_measure(side: Side, params: &ManeuverParams) -> Command {
    hug(side, params)
}

/// Turn from the back face of the second obstacle onto the heading back to the carpark.
pub fn go_around_exit(side: Side, params: &ManeuverParams) -> Vec<Command> {
    vec![turn(-side.sign() * 90.0, params), Command::Wiggle]
}

/// Drive back to the carpark, cutting diagonally back onto the course line before parking.
///
/// The diagonal turns away from `reference`, the direction of the arrow the return is mirrored
/// on.
pub fn return_path(
    reference: Side,
    backtrack: f64,
    offset: f64,
    params: &ManeuverParams,
) -> Vec<Command> {
    let m = reference.opposite().sign();

    vec![
        straight(backtrack, params),
        turn(m * params.realign_angle_deg, params),
        straight(offset, params),
        turn(-m * params.realign_angle_deg, params),
        Command::MoveToDistance {
            distance: params.parking_distance,
            speed: params.approach_speed,
            forward: true,
        },
    ]
}

/// Length of the diagonal leg of the return path.
pub fn offset_distance(width: f64, constant: f64) -> f64 {
    ((SQRT_2 * width / 2.0).floor() - constant).max(0.0)
}

/// Length of the straight leg of the return path.
pub fn backtrack_distance(accumulated: f64, margin: f64) -> f64 {
    (accumulated - margin).max(0.0)
}

fn turn(angle: f64, params: &ManeuverParams) -> Command {
    Command::Turn {
        angle,
        speed: params.turn_speed,
        forward: true,
    }
}

fn straight(distance: f64, params: &ManeuverParams) -> Command {
    Command::MoveStraight {
        distance,
        speed: params.forward_speed,
        forward: true,
    }
}

/// Hug the obstacle, which is on the side opposite the arrow.
fn hug(arrow: Side, params: &ManeuverParams) -> Command {
    Command::SideHug {
        side: arrow.opposite(),
        threshold: params.hug_threshold,
        speed: params.turn_speed,
        forward: true,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    /// Reflect a command about the forward axis.
    fn mirror(cmd: &Command) -> Command {
        match *cmd {
            Command::Turn {
                angle,
                speed,
                forward,
            } => Command::Turn {
                angle: -angle,
                speed,
                forward,
            },
            Command::SideHug {
                side,
                threshold,
                speed,
                forward,
            } => Command::SideHug {
                side: side.opposite(),
                threshold,
                speed,
                forward,
            },
            c => c,
        }
    }

    #[test]
    fn test_bypass_is_mirrored() {
        let params = ManeuverParams::default();

        let right = bypass(Side::Right, &params);
        let left = bypass(Side::Left, &params);

        assert_eq!(right.len(), 6);
        assert_eq!(left, right.iter().map(mirror).collect::<Vec<_>>());

        // The bypass ends on the original heading
        let net: f64 = right
            .iter()
            .map(|c| match c {
                Command::Turn { angle, .. } => *angle,
                _ => 0.0,
            })
            .sum();
        assert_eq!(net, 0.0);
        assert_eq!(
            right[0],
            Command::Turn {
                angle: 45.0,
                speed: 40.0,
                forward: true
            }
        );
    }

    #[test]
    fn test_go_around_is_mirrored() {
        let params = ManeuverParams::default();

        let build = |side| {
            let mut cmds = go_around_lead_in(side, &params);
            cmds.push(go_around_measure(side, &params));
            cmds.extend(go_around_exit(side, &params));
            cmds
        };
        let right = build(Side::Right);
        let left = build(Side::Left);

        assert_eq!(left, right.iter().map(mirror).collect::<Vec<_>>());

        // Arrow to the right means the obstacle is hugged on the left
        assert!(right.iter().all(|c| match c {
            Command::SideHug { side, .. } => *side == Side::Left,
            _ => true,
        }));

        // Ends facing back the way the rover came
        let net: f64 = right
            .iter()
            .map(|c| match c {
                Command::Turn { angle, .. } => *angle,
                _ => 0.0,
            })
            .sum();
        assert_eq!(net, -180.0);
    }

    #[test]
    fn test_return_distances() {
        assert_eq!(offset_distance(40.0, 5.0), 23.0);
        assert_eq!(offset_distance(40.0, 0.0), 28.0);
        assert_eq!(offset_distance(4.0, 5.0), 0.0);

        assert_eq!(backtrack_distance(255.0, 20.0), 235.0);
        assert_eq!(backtrack_distance(10.0, 20.0), 0.0);
    }

    #[test]
    fn test_return_path() {
        let params = ManeuverParams::default();

        let cmds = return_path(Side::Right, 235.0, 23.0, &params);
        assert_eq!(
            cmds,
            vec![
                Command::MoveStraight {
                    distance: 235.0,
                    speed: 70.0,
                    forward: true
                },
                Command::Turn {
                    angle: -45.0,
                    speed: 40.0,
                    forward: true
                },
                Command::MoveStraight {
                    distance: 23.0,
                    speed: 70.0,
                    forward: true
                },
                Command::Turn {
                    angle: 45.0,
                    speed: 40.0,
                    forward: true
                },
                Command::MoveToDistance {
                    distance: 15.0,
                    speed: 40.0,
                    forward: true
                },
            ]
        );

        let mirrored = return_path(Side::Left, 235.0, 23.0, &params);
        assert_eq!(mirrored, cmds.iter().map(mirror).collect::<Vec<_>>());
    }
}
