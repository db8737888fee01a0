//! Fakes for the motor controller and remote workers, used by the unit tests.

use std::{
    collections::VecDeque,
    io::{self, Read, Write},
    sync::{Arc, Mutex},
    time::Duration,
};

use comms_if::work::WorkRequest;

use crate::work_dispatcher::{WorkerChannel, WorkerSendError};

/// A motor controller which acknowledges every command the way the real firmware does.
///
/// - motion lines are echoed back prefixed with `f`
/// - `S` is answered with `fS`
/// - the first `D` of a pair starts measuring silently, the second answers with the next
///   scripted odometry value
/// - `M` is not answered
#[derive(Clone, Default)]
pub struct ScriptedController {
    inner: Arc<Mutex<ControllerState>>,
}

#[derive(Default)]
struct ControllerState {
    silent: bool,
    chatty: bool,
    measuring: bool,
    partial: Vec<u8>,
    written: Vec<String>,
    rx: VecDeque<u8>,
    odometry: VecDeque<String>,
}

/// A worker channel which records everything sent to it.
#[derive(Clone, Default)]
pub struct RecordingWorker {
    pub sent: Arc<Mutex<Vec<String>>>,
    pub fail: bool,
}

impl ScriptedController {
    pub fn new() -> Self {
        Self::default()
    }

    /// A controller which never answers.
    pub fn silent() -> Self {
        let c = Self::default();
        c.state().silent = true;
        c
    }

    /// A controller which never acknowledges, but keeps sending unrelated lines.
    pub fn chatty() -> Self {
        let c = Self::silent();
        c.state().chatty = true;
        c
    }

    /// Queue the value reported by the next measurement stop.
    pub fn push_odometry(&self, value: &str) {
        self.state().odometry.push_back(value.into());
    }

    /// Queue raw bytes to be read by the link.
    pub fn push_raw(&self, bytes: &[u8]) {
        self.state().rx.extend(bytes.iter().copied());
    }

    /// All lines written by the link so far, without terminators.
    pub fn written(&self) -> Vec<String> {
        self.state().written.clone()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ControllerState> {
        self.inner.lock().unwrap()
    }
}

impl ControllerState {
    fn handle_line(&mut self, line: String) {
        self.written.push(line.clone());

        if self.silent {
            return;
        }

        let reply = match line.as_str() {
            "D" => {
                self.measuring = !self.measuring;
                if self.measuring {
                    None
                } else {
                    let value = self.odometry.pop_front().unwrap_or_else(|| "0".into());
                    Some(format!("fD{}", value))
                }
            }
            "S" => Some("fS".to_string()),
            "M" => None,
            _ => Some(format!("f{}", line)),
        };

        if let Some(r) = reply {
            self.rx.extend(r.bytes());
            self.rx.push_back(b'\n');
        }
    }
}

impl Read for ScriptedController {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state();

        if state.rx.is_empty() {
            let chatty = state.chatty;
            drop(state);
            std::thread::sleep(Duration::from_millis(1));

            if !chatty {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"));
            }

            state = self.state();
            state.rx.extend(b"noise\n".iter().copied());
        }

        let n = buf.len().min(state.rx.len());
        for (i, b) in state.rx.drain(..n).enumerate() {
            buf[i] = b;
        }
        Ok(n)
    }
}

impl Write for ScriptedController {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state();

        for &b in buf {
            if b == b'\n' {
                let line = String::from_utf8_lossy(&state.partial).to_string();
                state.partial.clear();
                state.handle_line(line);
            } else {
                state.partial.push(b);
            }
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl RecordingWorker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    /// Parse every request received so far.
    pub fn requests(&self) -> Vec<WorkRequest> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|s| serde_json::from_str(s).unwrap())
            .collect()
    }

    pub fn last_request(&self) -> WorkRequest {
        self.requests().pop().expect("no request received")
    }
}

impl WorkerChannel for RecordingWorker {
    fn name(&self) -> String {
        "recording".into()
    }

    fn send(&mut self, message: &str) -> Result<(), WorkerSendError> {
        if self.fail {
            return Err(WorkerSendError::Disconnected);
        }
        self.sent.lock().unwrap().push(message.into());
        Ok(())
    }
}
