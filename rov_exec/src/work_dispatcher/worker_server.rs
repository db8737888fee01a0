//! # Worker Server
//!
//! zmq transport for the [`WorkDispatcher`]. Workers connect a `DEALER` socket to the rover's
//! `ROUTER` socket and announce themselves with a `HELLO` message. The server registers each
//! worker with the dispatcher, forwards requests to it, and routes its responses back.
//!
//! A worker is considered gone when it says `GOODBYE`, when it has been silent for longer than
//! `worker_timeout_s`, or when a request can no longer be routed to it.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver, Sender},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use comms_if::{
    net::{zmq, MonitoredSocket, MonitoredSocketError, NetParams, SocketOptions},
    work::WorkerMessage,
};
use log::{debug, info, warn};
use serde::Deserialize;

use super::{WorkDispatcher, WorkerChannel, WorkerId, WorkerSendError};

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerServerParams {
    /// Time without any message after which a worker is dropped, in seconds
    pub worker_timeout_s: f64,

    /// Receive timeout of the server socket, bounds the latency of outgoing requests, in
    /// milliseconds
    pub poll_period_ms: i32,
}

/// Runs the `ROUTER` socket on a background thread.
pub struct WorkerServer {
    shutdown: Arc<AtomicBool>,

    join_handle: Option<thread::JoinHandle<()>>,
}

/// Sends requests to one worker through the server thread.
struct ZmqWorkerChannel {
    identity: Vec<u8>,

    name: String,

    outbox: Sender<(Vec<u8>, String)>,
}

struct Peer {
    id: WorkerId,

    last_seen: Instant,
}

/// State owned by the server thread.
struct ServerLoop {
    socket: MonitoredSocket,

    dispatcher: Arc<WorkDispatcher>,

    outbox_tx: Sender<(Vec<u8>, String)>,

    outbox_rx: Receiver<(Vec<u8>, String)>,

    peers: HashMap<Vec<u8>, Peer>,

    worker_timeout: Duration,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

#[derive(thiserror::Error, Debug)]
pub enum WorkerServerError {
    #[error("Socket error: {0}")]
    SocketError(MonitoredSocketError),
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl WorkerServer {
    /// Bind the server socket and start serving workers in the background.
    ///
    /// This function does not wait for any worker to connect.
    pub fn start(
        ctx: &zmq::Context,
        net_params: &NetParams,
        params: &WorkerServerParams,
        dispatcher: Arc<WorkDispatcher>,
    ) -> Result<Self, WorkerServerError> {
        let socket_options = SocketOptions {
            bind: true,
            block_on_first_connect: false,
            router_mandatory: true,
            recv_timeout: params.poll_period_ms,
            send_timeout: 10,
            linger: 1,
            heartbeat_ivl: 500,
            heartbeat_ttl: 1000,
            heartbeat_timeout: 1000,
            ..Default::default()
        };

        let socket = MonitoredSocket::new(
            ctx,
            zmq::ROUTER,
            socket_options,
            &net_params.worker_endpoint,
        )
        .map_err(WorkerServerError::SocketError)?;

        info!("Worker server listening on {}", net_params.worker_endpoint);

        let (outbox_tx, outbox_rx) = mpsc::channel();
        let mut server = ServerLoop {
            socket,
            dispatcher,
            outbox_tx,
            outbox_rx,
            peers: HashMap::new(),
            worker_timeout: Duration::from_secs_f64(params.worker_timeout_s.max(0.0)),
        };

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_clone = shutdown.clone();
        let join_handle = thread::spawn(move || server.run(shutdown_clone));

        Ok(Self {
            shutdown,
            join_handle: Some(join_handle),
        })
    }

    /// Stop the server thread, deregistering all workers.
    pub fn stop(mut self) {
        self.shutdown_and_join();
    }

    fn shutdown_and_join(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);

        if let Some(jh) = self.join_handle.take() {
            if jh.join().is_err() {
                warn!("Worker server thread panicked");
            }
        }
    }
}

impl Drop for WorkerServer {
    fn drop(&mut self) {
        self.shutdown_and_join();
    }
}

impl ServerLoop {
    fn run(&mut self, shutdown: Arc<AtomicBool>) {
        while !shutdown.load(Ordering::Relaxed) {
            match self.socket.recv_multipart(0) {
                Ok(frames) => self.handle_frames(frames),
                Err(zmq::Error::EAGAIN) => (),
                Err(e) => warn!("Worker server receive error: {}", e),
            }

            self.flush_outbox();
            self.expire_peers();
        }

        for (_, peer) in self.peers.drain() {
            self.dispatcher.remove_worker(peer.id);
        }

        info!("Worker server stopped");
    }

    fn handle_frames(&mut self, frames: Vec<Vec<u8>>) {
        // ROUTER prepends the sender identity, the payload is the last frame
        let (identity, payload) = match (frames.first(), frames.last()) {
            (Some(i), Some(p)) if frames.len() >= 2 => (i.clone(), p),
            _ => {
                warn!("Dropping malformed message with {} frame(s)", frames.len());
                return;
            }
        };

        let message: WorkerMessage = match serde_json::from_slice(payload) {
            Ok(m) => m,
            Err(e) => {
                warn!("Could not parse message from a worker: {}", e);
                return;
            }
        };

        match message {
            WorkerMessage::Hello { name } => {
                self.touch(&identity, name);
            }
            WorkerMessage::Heartbeat => {
                self.touch(&identity, None);
            }
            WorkerMessage::Goodbye => self.drop_peer(&identity),
            WorkerMessage::Response(response) => {
                let worker = self.touch(&identity, None);
                debug!("Worker {} answered request {}", worker, response.id);
                self.dispatcher.on_response_received(response);
            }
        }
    }

    /// Refresh a peer, registering it with the dispatcher if it is new.
    fn touch(&mut self, identity: &[u8], name: Option<String>) -> WorkerId {
        if let Some(peer) = self.peers.get_mut(identity) {
            peer.last_seen = Instant::now();
            return peer.id;
        }

        let channel = ZmqWorkerChannel {
            identity: identity.to_vec(),
            name: name.unwrap_or_else(|| format!("zmq-{}", hex(identity))),
            outbox: self.outbox_tx.clone(),
        };
        let id = self.dispatcher.register_worker(Box::new(channel));

        self.peers.insert(
            identity.to_vec(),
            Peer {
                id,
                last_seen: Instant::now(),
            },
        );

        id
    }

    fn drop_peer(&mut self, identity: &[u8]) {
        if let Some(peer) = self.peers.remove(identity) {
            self.dispatcher.remove_worker(peer.id);
        }
    }

    fn flush_outbox(&mut self) {
        while let Ok((identity, message)) = self.outbox_rx.try_recv() {
            let frames = vec![identity.clone(), message.into_bytes()];

            match self.socket.send_multipart(frames, 0) {
                Ok(()) => (),
                Err(zmq::Error::EHOSTUNREACH) => {
                    warn!("Worker {} is unreachable", hex(&identity));
                    self.drop_peer(&identity);
                }
                Err(e) => warn!("Could not send to worker {}: {}", hex(&identity), e),
            }
        }
    }

    fn expire_peers(&mut self) {
        let timeout = self.worker_timeout;
        let expired: Vec<Vec<u8>> = self
            .peers
            .iter()
            .filter(|(_, p)| p.last_seen.elapsed() > timeout)
            .map(|(i, _)| i.clone())
            .collect();

        for identity in expired {
            warn!("Worker {} timed out", hex(&identity));
            self.drop_peer(&identity);
        }
    }
}

impl WorkerChannel for ZmqWorkerChannel {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn send(&mut self, message: &str) -> Result<(), WorkerSendError> {
        self.outbox
            .send((self.identity.clone(), message.to_string()))
            .map_err(|_| WorkerSendError::Disconnected)
    }
}

impl Default for WorkerServerParams {
    fn default() -> Self {
        Self {
            worker_timeout_s: 5.0,
            poll_period_ms: 10,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// PRIVATE FUNCTIONS
// ------------------------------------------------------------------------------------------------

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;
    use comms_if::work::{ObstacleLabel, WorkRequest, WorkResponse, WorkResult};

    fn send(socket: &MonitoredSocket, msg: &WorkerMessage) {
        socket
            .send(serde_json::to_string(msg).unwrap().as_str(), 0)
            .unwrap();
    }

    fn wait_for<F: Fn() -> bool>(f: F) -> bool {
        let start = Instant::now();
        while start.elapsed() < Duration::from_secs(5) {
            if f() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_worker_round_trip() {
        let ctx = zmq::Context::new();
        let endpoint = "inproc://worker_server_test";
        let dispatcher = Arc::new(WorkDispatcher::new());

        let server = WorkerServer::start(
            &ctx,
            &NetParams {
                worker_endpoint: endpoint.into(),
            },
            &WorkerServerParams::default(),
            dispatcher.clone(),
        )
        .unwrap();

        let worker = MonitoredSocket::new(
            &ctx,
            zmq::DEALER,
            SocketOptions {
                block_on_first_connect: false,
                recv_timeout: 5000,
                linger: 0,
                ..Default::default()
            },
            endpoint,
        )
        .unwrap();

        send(&worker, &WorkerMessage::Hello { name: Some("bench".into()) });
        assert!(wait_for(|| dispatcher.worker_count() == 1));

        let pending = dispatcher.submit_vision("aW1n".into(), true);

        let msg = worker.recv_msg(0).unwrap();
        let request: WorkRequest = serde_json::from_slice(&msg).unwrap();
        assert_eq!(request.id, pending.id());

        send(
            &worker,
            &WorkerMessage::Response(WorkResponse {
                id: request.id.clone(),
                result: Some(WorkResult::Label("RIGHT".into())),
            }),
        );
        assert_eq!(
            pending.wait(Duration::from_secs(5)).unwrap(),
            ObstacleLabel::Right
        );

        send(&worker, &WorkerMessage::Goodbye);
        assert!(wait_for(|| dispatcher.worker_count() == 0));

        server.stop();
    }
}
