//! # Motor link parameters

use std::time::Duration;

use comms_if::eqpt::motor::Calibration;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct MotorLinkParams {
    /// Path to the serial device the motor controller is attached to
    pub port: String,

    /// Baud rate of the serial link
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// Timeout of a single read from the port, in milliseconds
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    /// Maximum time to wait for an acknowledgement line, in seconds. If not set the link waits
    /// indefinitely.
    #[serde(default)]
    pub ack_timeout_s: Option<f64>,

    /// Steering calibration used when serializing turns
    #[serde(default)]
    pub calibration: Calibration,
}

impl MotorLinkParams {
    pub fn ack_timeout(&self) -> Option<Duration> {
        self.ack_timeout_s
            .filter(|t| t.is_finite() && *t >= 0.0)
            .map(Duration::from_secs_f64)
    }
}

impl Default for MotorLinkParams {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".into(),
            baud_rate: default_baud_rate(),
            read_timeout_ms: default_read_timeout_ms(),
            ack_timeout_s: Some(30.0),
            calibration: Calibration::default(),
        }
    }
}

fn default_baud_rate() -> u32 {
    115_200
}

fn default_read_timeout_ms() -> u64 {
    100
}
