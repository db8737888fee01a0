//! # Motor Link
//!
//! This module owns the serial channel to the motor controller. Commands are written as single
//! lines, and the controller answers each executed command with an acknowledgement line.
//!
//! The link is strictly sequential: at most one caller drives it at a time, and every blocking
//! call waits for the acknowledgement of the command it sent before returning.

// ------------------------------------------------------------------------------------------------
// MODULES
// ------------------------------------------------------------------------------------------------

mod params;

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use std::{
    io::{self, BufRead, BufReader, Read, Write},
    time::{Duration, Instant},
};

use comms_if::eqpt::motor::{parse_odometry, Ack, Command};
use log::{debug, info, trace, warn};
use tokio_serial::SerialPort as _;

pub use params::MotorLinkParams;

// ------------------------------------------------------------------------------------------------
// TRAITS
// ------------------------------------------------------------------------------------------------

/// A byte channel to the motor controller.
///
/// Reads are expected to time out periodically (returning `TimedOut` or `WouldBlock`) rather than
/// block forever, so the link can enforce its acknowledgement timeout.
pub trait ControllerChannel: Read + Write + Send {}

impl<T: Read + Write + Send + ?Sized> ControllerChannel for T {}

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

pub struct MotorLink {
    params: MotorLinkParams,

    /// The open channel, `None` while disconnected.
    channel: Option<BufReader<Box<dyn ControllerChannel>>>,

    /// Partial line carried between reads.
    line_buf: Vec<u8>,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

#[derive(thiserror::Error, Debug)]
pub enum MotorLinkError {
    #[error("Could not open the motor controller port {0}: {1}")]
    OpenError(String, tokio_serial::Error),

    #[error("The motor link is not connected")]
    NotConnected,

    #[error("Could not write to the motor controller: {0}")]
    WriteError(io::Error),

    #[error("Could not read from the motor controller: {0}")]
    ReadError(io::Error),

    #[error("The motor controller closed the channel")]
    ChannelClosed,

    #[error("No response from the motor controller within {0:?}")]
    AckTimeout(Duration),
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl MotorLink {
    /// Create a new, disconnected, link.
    pub fn new(params: MotorLinkParams) -> Self {
        Self {
            params,
            channel: None,
            line_buf: Vec::new(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.channel.is_some()
    }

    /// Open the serial port to the controller. Does nothing if already connected.
    pub fn connect(&mut self) -> Result<(), MotorLinkError> {
        if self.is_connected() {
            debug!("Motor link already connected");
            return Ok(());
        }

        let port = tokio_serial::new(&self.params.port, self.params.baud_rate)
            .timeout(Duration::from_millis(self.params.read_timeout_ms))
            .open()
            .map_err(|e| MotorLinkError::OpenError(self.params.port.clone(), e))?;

        if let Err(e) = port.clear(tokio_serial::ClearBuffer::All) {
            warn!("Could not clear the motor controller port buffers: {}", e);
        }

        info!(
            "Motor link connected on {} at {} baud",
            self.params.port, self.params.baud_rate
        );

        self.connect_with(Box::new(port));

        Ok(())
    }

    /// Connect the link over an already open channel. Does nothing if already connected.
    pub fn connect_with(&mut self, channel: Box<dyn ControllerChannel>) {
        if self.is_connected() {
            debug!("Motor link already connected");
            return;
        }

        self.line_buf.clear();
        self.channel = Some(BufReader::new(channel));
    }

    /// Close the channel to the controller.
    pub fn disconnect(&mut self) {
        if self.channel.take().is_some() {
            info!("Motor link disconnected");
        }
    }

    /// Write a single command to the controller without waiting for an acknowledgement.
    pub fn send(&mut self, cmd: &Command) -> Result<(), MotorLinkError> {
        let line = cmd.serialize_with(&self.params.calibration);

        let reader = self.channel.as_mut().ok_or(MotorLinkError::NotConnected)?;
        let writer = reader.get_mut();
        writer
            .write_all(line.as_bytes())
            .and_then(|_| writer.flush())
            .map_err(MotorLinkError::WriteError)?;

        debug!("Sent to motor controller: {}", line.trim_end());

        Ok(())
    }

    /// Block until a complete line arrives from the controller, returning it without the
    /// terminator.
    pub fn wait_receive(&mut self) -> Result<String, MotorLinkError> {
        let deadline = self.ack_deadline();
        self.wait_receive_until(deadline)
    }

    /// Deadline for an acknowledgement expected from now, if the link has an ack timeout.
    fn ack_deadline(&self) -> Option<(Instant, Duration)> {
        self.params.ack_timeout().map(|t| (Instant::now() + t, t))
    }

    fn wait_receive_until(
        &mut self,
        deadline: Option<(Instant, Duration)>,
    ) -> Result<String, MotorLinkError> {
        let reader = self.channel.as_mut().ok_or(MotorLinkError::NotConnected)?;

        loop {
            match reader.read_until(b'\n', &mut self.line_buf) {
                Ok(0) => return Err(MotorLinkError::ChannelClosed),
                Ok(_) if self.line_buf.ends_with(b"\n") => {
                    let line = String::from_utf8_lossy(&self.line_buf).trim().to_string();
                    self.line_buf.clear();

                    if line.is_empty() {
                        continue;
                    }

                    trace!("Received from motor controller: {}", line);
                    return Ok(line);
                }
                // Partial line, keep it and carry on reading
                Ok(_) => (),
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::TimedOut
                            | io::ErrorKind::WouldBlock
                            | io::ErrorKind::Interrupted
                    ) => {}
                Err(e) => return Err(MotorLinkError::ReadError(e)),
            }

            if let Some((at, t)) = deadline {
                if Instant::now() >= at {
                    return Err(MotorLinkError::AckTimeout(t));
                }
            }
        }
    }

    /// Send each command in turn, waiting for each acknowledgement before sending the next.
    pub fn send_and_wait(&mut self, cmds: &[Command]) -> Result<Vec<Ack>, MotorLinkError> {
        let mut acks = Vec::with_capacity(cmds.len());

        for cmd in cmds {
            self.send(cmd)?;
            let ack = Ack::parse(&self.wait_receive()?);

            if let Ack::Other(ref line) = ack {
                warn!("Unexpected response to {:?}: {:?}", cmd, line);
            }

            acks.push(ack);
        }

        Ok(acks)
    }

    /// Send all commands back to back without reading any acknowledgements. Returns the number
    /// of commands sent, which should later be passed to [`MotorLink::drain_acks`].
    pub fn send_fire_and_forget(&mut self, cmds: &[Command]) -> Result<usize, MotorLinkError> {
        for cmd in cmds {
            self.send(cmd)?;
        }

        Ok(cmds.len())
    }

    /// Read and discard `count` acknowledgement lines.
    pub fn drain_acks(&mut self, count: usize) -> Result<Vec<Ack>, MotorLinkError> {
        let mut acks = Vec::with_capacity(count);

        for _ in 0..count {
            acks.push(Ack::parse(&self.wait_receive()?));
        }

        debug!("Drained {} acknowledgements", count);

        Ok(acks)
    }

    /// Stop the rover and wait until the controller reports it has settled.
    pub fn wait_settled(&mut self) -> Result<(), MotorLinkError> {
        self.send(&Command::Stop)?;

        // One deadline for the whole wait, other lines do not extend it
        let deadline = self.ack_deadline();

        loop {
            if let Some((at, t)) = deadline {
                if Instant::now() >= at {
                    return Err(MotorLinkError::AckTimeout(t));
                }
            }

            match Ack::parse(&self.wait_receive_until(deadline)?) {
                Ack::Settled => return Ok(()),
                other => debug!("Ignoring {:?} while waiting to settle", other),
            }
        }
    }

    /// Start the odometry accumulator. The controller does not acknowledge this.
    pub fn start_measurement(&mut self) -> Result<(), MotorLinkError> {
        self.send(&Command::ToggleDistanceMeasurement)
    }

    /// Stop the odometry accumulator and return the distance travelled since it was started.
    ///
    /// A malformed report is logged and counted as 0.
    pub fn stop_measurement(&mut self) -> Result<i32, MotorLinkError> {
        self.send(&Command::ToggleDistanceMeasurement)?;

        let distance = parse_odometry(&self.wait_receive()?);
        debug!("Measured distance: {}", distance);

        Ok(distance)
    }
}

impl MotorLinkError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, MotorLinkError::AckTimeout(_))
    }
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_support::ScriptedController;

    fn link(controller: &ScriptedController) -> MotorLink {
        let mut link = MotorLink::new(MotorLinkParams {
            ack_timeout_s: Some(0.2),
            ..Default::default()
        });
        link.connect_with(Box::new(controller.clone()));
        link
    }

    #[test]
    fn test_not_connected() {
        let mut link = MotorLink::new(MotorLinkParams::default());

        assert!(!link.is_connected());
        assert!(matches!(
            link.send(&Command::Stop),
            Err(MotorLinkError::NotConnected)
        ));
        assert!(matches!(
            link.wait_receive(),
            Err(MotorLinkError::NotConnected)
        ));
    }

    #[test]
    fn test_send_and_wait() {
        let controller = ScriptedController::new();
        let mut link = link(&controller);

        let cmds = [
            Command::MoveStraight {
                distance: 20.0,
                speed: 70.0,
                forward: true,
            },
            Command::Turn {
                angle: -90.0,
                speed: 40.0,
                forward: true,
            },
        ];
        let acks = link.send_and_wait(&cmds).unwrap();

        assert_eq!(controller.written(), vec!["T70|0|20", "T40|-25|86"]);
        assert_eq!(
            acks,
            vec![
                Ack::Completed {
                    flag: 'T',
                    speed: 70.0,
                    angle: 0.0,
                    distance: 20.0
                },
                Ack::Completed {
                    flag: 'T',
                    speed: 40.0,
                    angle: -25.0,
                    distance: 86.0
                },
            ]
        );
    }

    #[test]
    fn test_measurement() {
        let controller = ScriptedController::new();
        controller.push_odometry("57.8");
        controller.push_odometry("rubbish");
        let mut link = link(&controller);

        link.start_measurement().unwrap();
        assert_eq!(link.stop_measurement().unwrap(), 57);

        link.start_measurement().unwrap();
        assert_eq!(link.stop_measurement().unwrap(), 0);

        assert_eq!(controller.written(), vec!["D", "D", "D", "D"]);
    }

    #[test]
    fn test_fire_and_forget_then_drain() {
        let controller = ScriptedController::new();
        let mut link = link(&controller);

        let cmds = [Command::Wiggle, Command::Wiggle, Command::Wiggle];
        let sent = link.send_fire_and_forget(&cmds).unwrap();
        assert_eq!(sent, 3);
        assert_eq!(controller.written().len(), 3);

        let acks = link.drain_acks(sent).unwrap();
        assert_eq!(acks.len(), 3);
    }

    #[test]
    fn test_wait_settled() {
        let controller = ScriptedController::new();
        let mut link = link(&controller);

        link.wait_settled().unwrap();
        assert_eq!(controller.written(), vec!["S"]);
    }

    #[test]
    fn test_ack_timeout() {
        let controller = ScriptedController::silent();
        let mut link = link(&controller);

        let start = Instant::now();
        let err = link.send_and_wait(&[Command::Wiggle]).unwrap_err();
        assert!(err.is_timeout());
        assert!(start.elapsed() >= Duration::from_millis(200));
    }

    #[test]
    fn test_wait_settled_times_out_under_chatter() {
        let controller = ScriptedController::chatty();
        let mut link = MotorLink::new(MotorLinkParams {
            ack_timeout_s: Some(0.05),
            ..Default::default()
        });
        link.connect_with(Box::new(controller.clone()));

        let start = Instant::now();
        let err = link.wait_settled().unwrap_err();
        assert!(err.is_timeout());
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_split_lines() {
        let controller = ScriptedController::silent();
        controller.push_raw(b"fT0|-2");
        controller.push_raw(b"0|0\r\n\nfS\n");
        let mut link = link(&controller);

        assert_eq!(link.wait_receive().unwrap(), "fT0|-20|0");
        assert_eq!(link.wait_receive().unwrap(), "fS");
    }

    #[test]
    fn test_connect_idempotent_and_disconnect() {
        let controller = ScriptedController::new();
        let mut link = link(&controller);

        // A second channel is ignored while connected
        link.connect_with(Box::new(ScriptedController::silent()));
        link.wait_settled().unwrap();
        assert_eq!(controller.written(), vec!["S"]);

        link.disconnect();
        assert!(!link.is_connected());
        link.disconnect();
    }
}
