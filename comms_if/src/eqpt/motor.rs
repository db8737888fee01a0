//! # Motor Controller Commands
//!
//! The command vocabulary understood by the motor controller, and the acknowledgement lines it
//! sends back once a command has been executed.
//!
//! Every command is sent as a single ASCII line. Motion commands share the layout
//! `<flag><speed>|<angle>|<distance>\n`, where `flag` selects the motion mode and direction:
//!
//! | Flag      | Meaning                                    |
//! |-----------|--------------------------------------------|
//! | `T` / `t` | drive forwards / backwards                 |
//! | `W` / `w` | drive forwards / backwards until odometry  |
//! | `L` / `l` | hug an obstacle on the left, fwd / bwd     |
//! | `R` / `r` | hug an obstacle on the right, fwd / bwd    |
//!
//! The zero-argument commands `S` (stop), `D` (toggle distance measurement) and `M` (stop marker)
//! carry no numeric payload.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use log::warn;
use serde::{Deserialize, Serialize};

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Empirical calibration of the steering rig, used when reducing turns to straight-line moves.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Calibration {
    /// Servo angle used for every turn, in degrees. Turns are always performed at full lock.
    pub turn_servo_angle_deg: f64,

    /// Distance driven per degree of heading change when turning at full lock.
    pub turn_distance_scale: f64,

    /// Servo angle the steering is kicked to by a wiggle, in degrees.
    pub wiggle_servo_angle_deg: f64,
}

/// A single motion line, the form all motion commands are reduced to before being sent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Motion {
    pub flag: char,
    pub speed: f64,
    pub servo_angle_deg: f64,
    pub distance: f64,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

/// A directive for the motor controller.
///
/// Angles follow the controller's steering convention: positive angles turn to the right,
/// negative angles to the left.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Command {
    /// Drive in a straight line for the given distance.
    MoveStraight {
        distance: f64,
        speed: f64,
        forward: bool,
    },

    /// Change heading by `angle` degrees, driving at full steering lock.
    Turn { angle: f64, speed: f64, forward: bool },

    /// Drive until the front distance sensor reads `distance`.
    MoveToDistance {
        distance: f64,
        speed: f64,
        forward: bool,
    },

    /// Drive while holding the lateral sensor on `side` at `threshold` from an obstacle edge,
    /// until the edge is lost.
    SideHug {
        side: Side,
        threshold: f64,
        speed: f64,
        forward: bool,
    },

    /// Start or stop the odometry accumulator on the controller.
    ToggleDistanceMeasurement,

    /// Kick the steering servo and return it to centre without moving.
    Wiggle,

    /// Stop and report once settled.
    Stop,

    /// Signal a stop marker.
    StopMarker,
}

/// A side of the rover. Also used for the direction an arrow points in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Side {
    #[serde(alias = "Left")]
    Left,

    #[serde(alias = "Right")]
    Right,
}

/// A line received from the motor controller.
#[derive(Debug, Clone, PartialEq)]
pub enum Ack {
    /// The rover has settled after a stop.
    Settled,

    /// Result of a distance measurement, truncated to a whole number.
    Measurement(i32),

    /// A motion command has been completed.
    Completed {
        flag: char,
        speed: f64,
        angle: f64,
        distance: f64,
    },

    /// Anything the link does not understand.
    Other(String),
}

/// What a command is sent as.
enum Line {
    Motion(Motion),

    /// A zero-argument command.
    Flag(char),
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl Default for Calibration {
    fn default() -> Self {
        Self {
            turn_servo_angle_deg: 25.0,
            turn_distance_scale: 0.95,
            wiggle_servo_angle_deg: -20.0,
        }
    }
}

impl Motion {
    /// Render this motion as a wire line.
    pub fn to_line(&self) -> String {
        format!(
            "{}{}|{}|{}\n",
            self.flag,
            fmt_num(self.speed),
            fmt_num(self.servo_angle_deg),
            fmt_num(self.distance)
        )
    }
}

impl Command {
    /// Serialize the command using the default calibration.
    pub fn serialize(&self) -> String {
        self.serialize_with(&Calibration::default())
    }

    /// Serialize the command into a newline terminated wire line.
    pub fn serialize_with(&self, cal: &Calibration) -> String {
        match self.line(cal) {
            Line::Motion(m) => m.to_line(),
            Line::Flag(flag) => format!("{}\n", flag),
        }
    }

    /// Reduce the command to the motion line the controller executes, or `None` for the
    /// zero-argument commands.
    pub fn motion(&self, cal: &Calibration) -> Option<Motion> {
        match self.line(cal) {
            Line::Motion(m) => Some(m),
            Line::Flag(_) => None,
        }
    }

    fn line(&self, cal: &Calibration) -> Line {
        match *self {
            Command::MoveStraight {
                distance,
                speed,
                forward,
            } => Line::Motion(Motion {
                flag: if forward { 'T' } else { 't' },
                speed,
                servo_angle_deg: 0.0,
                distance,
            }),
            Command::Turn {
                angle,
                speed,
                forward,
            } => {
                let servo_angle_deg = if angle == 0.0 {
                    0.0
                } else {
                    cal.turn_servo_angle_deg.copysign(angle)
                };

                Line::Motion(Motion {
                    flag: if forward { 'T' } else { 't' },
                    speed,
                    servo_angle_deg,
                    distance: (cal.turn_distance_scale * angle.abs()).round(),
                })
            }
            Command::MoveToDistance {
                distance,
                speed,
                forward,
            } => Line::Motion(Motion {
                flag: if forward { 'W' } else { 'w' },
                speed,
                servo_angle_deg: 0.0,
                distance,
            }),
            Command::SideHug {
                side,
                threshold,
                speed,
                forward,
            } => {
                let flag = match (side, forward) {
                    (Side::Left, true) => 'L',
                    (Side::Left, false) => 'l',
                    (Side::Right, true) => 'R',
                    (Side::Right, false) => 'r',
                };
                Line::Motion(Motion {
                    flag,
                    speed,
                    servo_angle_deg: 0.0,
                    distance: threshold,
                })
            }
            Command::Wiggle => Line::Motion(Motion {
                flag: 'T',
                speed: 0.0,
                servo_angle_deg: cal.wiggle_servo_angle_deg,
                distance: 0.0,
            }),
            Command::ToggleDistanceMeasurement => Line::Flag('D'),
            Command::Stop => Line::Flag('S'),
            Command::StopMarker => Line::Flag('M'),
        }
    }
}

impl Side {
    pub fn opposite(self) -> Self {
        match self {
            Side::Left => Side::Right,
            Side::Right => Side::Left,
        }
    }

    /// Steering sign of this side: `+1.0` for right, `-1.0` for left.
    pub fn sign(self) -> f64 {
        match self {
            Side::Left => -1.0,
            Side::Right => 1.0,
        }
    }

    pub fn is_right(self) -> bool {
        self == Side::Right
    }

    pub fn from_is_right(is_right: bool) -> Self {
        if is_right {
            Side::Right
        } else {
            Side::Left
        }
    }
}

impl Ack {
    /// Parse a line received from the controller.
    pub fn parse(line: &str) -> Self {
        let line = line.trim();

        if !line.starts_with('f') {
            return Ack::Other(line.into());
        }

        if line.contains('S') {
            return Ack::Settled;
        }

        if line.starts_with("fD") {
            return Ack::Measurement(parse_odometry(line));
        }

        // Completion echoes the command: f<flag><speed>|<angle>|<distance>
        let mut chars = line[1..].chars();
        let flag = match chars.next() {
            Some(c) => c,
            None => return Ack::Other(line.into()),
        };
        let fields: Vec<&str> = chars.as_str().split('|').collect();
        if fields.len() != 3 {
            return Ack::Other(line.into());
        }

        match (
            fields[0].parse::<f64>(),
            fields[1].parse::<f64>(),
            fields[2].parse::<f64>(),
        ) {
            (Ok(speed), Ok(angle), Ok(distance)) => Ack::Completed {
                flag,
                speed,
                angle,
                distance,
            },
            _ => Ack::Other(line.into()),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// PUBLIC FUNCTIONS
// ------------------------------------------------------------------------------------------------

/// Parse an odometry report of the form `fD<distance>`, truncating to a whole number.
///
/// A malformed report is not fatal: a warning is logged and a distance of `0` returned.
pub fn parse_odometry(line: &str) -> i32 {
    let line = line.trim();
    let value = line.strip_prefix("fD").unwrap_or(line);

    match value.trim().parse::<f64>() {
        Ok(d) if d.is_finite() => d.trunc() as i32,
        _ => {
            warn!("Could not parse odometry report {:?}, assuming 0", line);
            0
        }
    }
}

// ------------------------------------------------------------------------------------------------
// PRIVATE FUNCTIONS
// ------------------------------------------------------------------------------------------------

/// Round to 2 decimal places and print without trailing zeros.
fn fmt_num(value: f64) -> String {
    let rounded = (value * 100.0).round() / 100.0;

    // -0 would otherwise be printed with its sign
    if rounded == 0.0 {
        "0".into()
    } else {
        format!("{}", rounded)
    }
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_move_straight() {
        let fwd = Command::MoveStraight {
            distance: 42.0,
            speed: 70.0,
            forward: true,
        };
        let bwd = Command::MoveStraight {
            distance: 12.345,
            speed: 55.5,
            forward: false,
        };

        assert_eq!(fwd.serialize(), "T70|0|42\n");
        assert_eq!(bwd.serialize(), "t55.5|0|12.35\n");
    }

    #[test]
    fn test_turn() {
        let cal = Calibration::default();

        let right = Command::Turn {
            angle: 90.0,
            speed: 40.0,
            forward: true,
        };
        let m = right.motion(&cal).unwrap();
        assert_eq!(m.servo_angle_deg, 25.0);
        assert_eq!(m.distance, (0.95f64 * 90.0).round());
        assert_eq!(right.serialize(), "T40|25|86\n");

        let left = Command::Turn {
            angle: -45.0,
            speed: 40.0,
            forward: true,
        };
        let m = left.motion(&cal).unwrap();
        assert_eq!(m.servo_angle_deg, -25.0);
        assert_eq!(m.distance, 43.0);
        assert_eq!(left.serialize(), "T40|-25|43\n");

        let reverse = Command::Turn {
            angle: 45.0,
            speed: 40.0,
            forward: false,
        };
        assert_eq!(reverse.serialize(), "t40|25|43\n");
    }

    #[test]
    fn test_zero_turn_still_moves() {
        let zero = Command::Turn {
            angle: 0.0,
            speed: 40.0,
            forward: true,
        };
        assert_eq!(zero.serialize(), "T40|0|0\n");
    }

    #[test]
    fn test_turn_uses_calibration() {
        let cal = Calibration {
            turn_servo_angle_deg: 20.0,
            turn_distance_scale: 0.98,
            ..Default::default()
        };
        let turn = Command::Turn {
            angle: -100.0,
            speed: 40.0,
            forward: true,
        };
        assert_eq!(turn.serialize_with(&cal), "T40|-20|98\n");
    }

    #[test]
    fn test_move_to_distance_and_side_hug() {
        let to = Command::MoveToDistance {
            distance: 30.0,
            speed: 40.0,
            forward: true,
        };
        let back = Command::MoveToDistance {
            distance: 30.0,
            speed: 40.0,
            forward: false,
        };
        assert_eq!(to.serialize(), "W40|0|30\n");
        assert_eq!(back.serialize(), "w40|0|30\n");

        let flags: Vec<String> = [
            (Side::Left, true),
            (Side::Left, false),
            (Side::Right, true),
            (Side::Right, false),
        ]
        .iter()
        .map(|&(side, forward)| {
            Command::SideHug {
                side,
                threshold: 25.0,
                speed: 40.0,
                forward,
            }
            .serialize()
        })
        .collect();
        assert_eq!(
            flags,
            vec!["L40|0|25\n", "l40|0|25\n", "R40|0|25\n", "r40|0|25\n"]
        );
    }

    #[test]
    fn test_flag_commands() {
        assert_eq!(Command::ToggleDistanceMeasurement.serialize(), "D\n");
        assert_eq!(Command::Stop.serialize(), "S\n");
        assert_eq!(Command::StopMarker.serialize(), "M\n");
        assert_eq!(Command::Wiggle.serialize(), "T0|-20|0\n");

        assert_eq!(Command::ToggleDistanceMeasurement.motion(&Calibration::default()), None);
        assert_eq!(Command::Stop.motion(&Calibration::default()), None);
    }

    #[test]
    fn test_side_names() {
        #[derive(Deserialize)]
        struct Wrapper {
            side: Side,
        }

        for (text, side) in [
            ("LEFT", Side::Left),
            ("Left", Side::Left),
            ("RIGHT", Side::Right),
            ("Right", Side::Right),
        ]
        .iter()
        {
            let json = format!(r#"{{"side": "{}"}}"#, text);
            let w: Wrapper = serde_json::from_str(&json).unwrap();
            assert_eq!(w.side, *side);
        }

        assert_eq!(serde_json::to_string(&Side::Left).unwrap(), r#""LEFT""#);
        assert!(serde_json::from_str::<Side>(r#""left""#).is_err());
    }

    #[test]
    fn test_ack_parse() {
        assert_eq!(Ack::parse("fS\n"), Ack::Settled);
        assert_eq!(Ack::parse("fD57.9"), Ack::Measurement(57));
        assert_eq!(
            Ack::parse("fT40|-25|43\r\n"),
            Ack::Completed {
                flag: 'T',
                speed: 40.0,
                angle: -25.0,
                distance: 43.0
            }
        );
        assert_eq!(Ack::parse("fT40|25"), Ack::Other("fT40|25".into()));
        assert_eq!(Ack::parse("hello"), Ack::Other("hello".into()));
    }

    #[test]
    fn test_parse_odometry() {
        assert_eq!(parse_odometry("fD123.45"), 123);
        assert_eq!(parse_odometry("fD80\n"), 80);
        assert_eq!(parse_odometry("garbage"), 0);
        assert_eq!(parse_odometry("fD"), 0);
    }
}
