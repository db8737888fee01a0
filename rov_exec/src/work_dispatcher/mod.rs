//! # Work Dispatcher
//!
//! Offloads image classification and path planning to remote workers.
//!
//! Every request is broadcast to all connected workers and tagged with a fresh unique id. The
//! first response carrying that id completes the request, any later response for the same id is
//! dropped. If no worker can be reached the request is completed immediately with an empty result
//! (`ObstacleLabel::Unknown` for vision, an empty plan for planning).
//!
//! The dispatcher itself is transport agnostic. Transports register one [`WorkerChannel`] per
//! connected worker and feed received responses back through
//! [`WorkDispatcher::on_message_received`] or [`WorkDispatcher::on_response_received`]. The zmq
//! transport used by the rover is provided by [`WorkerServer`].

// ------------------------------------------------------------------------------------------------
// MODULES
// ------------------------------------------------------------------------------------------------

mod worker_server;

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicU64, Ordering},
        mpsc::{self, Receiver, RecvTimeoutError, TryRecvError},
        Arc, Mutex, MutexGuard, Weak,
    },
    time::Duration,
};

use comms_if::work::{
    Obstacle, ObstacleLabel, PlannedCommand, PlanningPayload, VisionPayload, WorkBody, WorkKind,
    WorkRequest, WorkResponse, WorkResult,
};
use log::{debug, info, warn};
use uuid::Uuid;

pub use worker_server::{WorkerServer, WorkerServerError, WorkerServerParams};

// ------------------------------------------------------------------------------------------------
// TRAITS
// ------------------------------------------------------------------------------------------------

/// A channel to a single connected worker.
pub trait WorkerChannel: Send {
    /// Name of the worker, used in logs.
    fn name(&self) -> String;

    /// Send a serialized request to the worker.
    fn send(&mut self, message: &str) -> Result<(), WorkerSendError>;
}

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Identifies a worker registered with the dispatcher.
pub type WorkerId = u64;

pub struct WorkDispatcher {
    inner: Arc<Mutex<DispatcherInner>>,

    next_worker_id: AtomicU64,
}

#[derive(Default)]
struct DispatcherInner {
    workers: BTreeMap<WorkerId, Box<dyn WorkerChannel>>,

    /// Requests which have not been completed yet, keyed by request id.
    pending: HashMap<String, Completion>,
}

/// The result of a request, which can be polled or waited on.
///
/// Dropping the handle before the result arrives withdraws the request, later responses to it
/// are then ignored.
pub struct PendingWork<T> {
    id: String,
    receiver: Receiver<T>,
    table: Weak<Mutex<DispatcherInner>>,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

#[derive(thiserror::Error, Debug)]
pub enum WorkerSendError {
    #[error("The worker is disconnected")]
    Disconnected,
}

#[derive(thiserror::Error, Debug)]
pub enum DispatchError {
    #[error("No response to request {0} within {1:?}")]
    Timeout(String, Duration),

    #[error("Request {0} was abandoned by the dispatcher")]
    Abandoned(String),
}

/// What to do with the result of a request.
enum Completion {
    Vision(Box<dyn FnOnce(ObstacleLabel) + Send>),
    Planning(Box<dyn FnOnce(Vec<PlannedCommand>) + Send>),
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl WorkDispatcher {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(DispatcherInner::default())),
            next_worker_id: AtomicU64::new(0),
        }
    }

    /// Register a newly connected worker, returning the id it is known by.
    pub fn register_worker(&self, channel: Box<dyn WorkerChannel>) -> WorkerId {
        let id = self.next_worker_id.fetch_add(1, Ordering::Relaxed);
        let name = channel.name();

        let count = {
            let mut inner = self.lock();
            inner.workers.insert(id, channel);
            inner.workers.len()
        };

        info!("Worker {} ({}) connected, {} worker(s) available", id, name, count);

        id
    }

    /// Forget a worker. Requests already sent to it stay pending.
    pub fn remove_worker(&self, id: WorkerId) {
        let mut inner = self.lock();

        if let Some(channel) = inner.workers.remove(&id) {
            info!(
                "Worker {} ({}) disconnected, {} worker(s) available",
                id,
                channel.name(),
                inner.workers.len()
            );
        }
    }

    pub fn worker_count(&self) -> usize {
        self.lock().workers.len()
    }

    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    /// Ask the workers to classify an image. `callback` is invoked exactly once with the label.
    pub fn request_vision<F>(&self, image: String, ignore_neutral_label: bool, callback: F) -> String
    where
        F: FnOnce(ObstacleLabel) + Send + 'static,
    {
        self.dispatch(
            WorkBody::Vision(VisionPayload {
                image,
                ignore_neutral_label,
            }),
            Completion::Vision(Box::new(callback)),
        )
    }

    /// Ask the workers to plan a path through the given obstacles. `callback` is invoked exactly
    /// once with the plan.
    pub fn request_planning<F>(&self, obstacles: Vec<Obstacle>, callback: F) -> String
    where
        F: FnOnce(Vec<PlannedCommand>) + Send + 'static,
    {
        self.dispatch(
            WorkBody::Planning(PlanningPayload { obstacles }),
            Completion::Planning(Box::new(callback)),
        )
    }

    /// Same as [`WorkDispatcher::request_vision`] but returns a handle to poll for the label.
    pub fn submit_vision(&self, image: String, ignore_neutral_label: bool) -> PendingWork<ObstacleLabel> {
        let (tx, rx) = mpsc::channel();
        let id = self.request_vision(image, ignore_neutral_label, move |label| {
            tx.send(label).ok();
        });

        PendingWork {
            id,
            receiver: rx,
            table: Arc::downgrade(&self.inner),
        }
    }

    /// Same as [`WorkDispatcher::request_planning`] but returns a handle to poll for the plan.
    pub fn submit_planning(&self, obstacles: Vec<Obstacle>) -> PendingWork<Vec<PlannedCommand>> {
        let (tx, rx) = mpsc::channel();
        let id = self.request_planning(obstacles, move |plan| {
            tx.send(plan).ok();
        });

        PendingWork {
            id,
            receiver: rx,
            table: Arc::downgrade(&self.inner),
        }
    }

    /// Handle raw bytes received from a worker.
    ///
    /// Returns `true` if the message completed a pending request.
    pub fn on_message_received(&self, worker: WorkerId, bytes: &[u8]) -> bool {
        match serde_json::from_slice::<WorkResponse>(bytes) {
            Ok(response) => self.on_response_received(response),
            Err(e) => {
                warn!("Could not parse message from worker {}: {}", worker, e);
                false
            }
        }
    }

    /// Complete the request matching the response's id, if it is still pending.
    ///
    /// Responses to unknown, completed or duplicated requests are dropped, as are responses whose
    /// result does not match the kind of request. Returns `true` if a request was completed.
    pub fn on_response_received(&self, response: WorkResponse) -> bool {
        let completion = {
            let mut inner = self.lock();

            let kind = match inner.pending.get(&response.id) {
                Some(c) => c.kind(),
                None => {
                    debug!(
                        "Dropping response to {}, no such pending request",
                        response.id
                    );
                    return false;
                }
            };

            if let Some(ref result) = response.result {
                if !result.answers(kind) {
                    warn!(
                        "Response to {:?} request {} has the wrong result type, ignoring",
                        kind, response.id
                    );
                    return false;
                }
            }

            inner.pending.remove(&response.id)
        };

        // Callbacks run outside the lock so they can issue new requests
        match completion {
            Some(c) => {
                debug!("Request {} completed", response.id);
                c.complete(response.result);
                true
            }
            None => false,
        }
    }

    /// Broadcast a request to all workers.
    fn dispatch(&self, body: WorkBody, completion: Completion) -> String {
        let id = Uuid::new_v4().to_string();
        let kind = body.kind();

        let request = WorkRequest {
            id: id.clone(),
            body,
        };
        let message = match serde_json::to_string(&request) {
            Ok(m) => m,
            Err(e) => {
                warn!("Could not serialize {:?} request {}: {}", kind, id, e);
                completion.fail();
                return id;
            }
        };

        let mut inner = self.lock();

        if inner.workers.is_empty() {
            drop(inner);
            warn!("No workers available for {:?} request {}", kind, id);
            completion.fail();
            return id;
        }

        inner.pending.insert(id.clone(), completion);

        let mut delivered = 0;
        let mut dead = Vec::new();
        for (worker_id, channel) in inner.workers.iter_mut() {
            match channel.send(&message) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!("Could not send request {} to worker {}: {}", id, worker_id, e);
                    dead.push(*worker_id);
                }
            }
        }

        for worker_id in dead {
            inner.workers.remove(&worker_id);
        }

        if delivered == 0 {
            let completion = inner.pending.remove(&id);
            drop(inner);

            warn!("{:?} request {} could not be delivered to any worker", kind, id);
            if let Some(c) = completion {
                c.fail();
            }
        } else {
            info!(
                "{:?} request {} sent to {} worker(s)",
                kind, id, delivered
            );
        }

        id
    }

    fn lock(&self) -> MutexGuard<'_, DispatcherInner> {
        lock_table(&self.inner)
    }
}

impl Default for WorkDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Completion {
    fn kind(&self) -> WorkKind {
        match self {
            Completion::Vision(_) => WorkKind::Vision,
            Completion::Planning(_) => WorkKind::Planning,
        }
    }

    fn complete(self, result: Option<WorkResult>) {
        match (self, result) {
            (Completion::Vision(cb), Some(WorkResult::Label(label))) => {
                cb(ObstacleLabel::from_wire(&label))
            }
            (Completion::Planning(cb), Some(WorkResult::Commands(plan))) => cb(plan),
            (c, _) => c.fail(),
        }
    }

    /// Complete with the empty result.
    fn fail(self) {
        match self {
            Completion::Vision(cb) => cb(ObstacleLabel::Unknown),
            Completion::Planning(cb) => cb(Vec::new()),
        }
    }
}

impl<T> PendingWork<T> {
    /// Id of the underlying request.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Take the result if it has arrived.
    pub fn try_take(&self) -> Result<Option<T>, DispatchError> {
        match self.receiver.try_recv() {
            Ok(r) => Ok(Some(r)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(DispatchError::Abandoned(self.id.clone())),
        }
    }

    /// Block until the result arrives or the timeout elapses.
    pub fn wait(self, timeout: Duration) -> Result<T, DispatchError> {
        match self.receiver.recv_timeout(timeout) {
            Ok(r) => Ok(r),
            Err(RecvTimeoutError::Timeout) => {
                Err(DispatchError::Timeout(self.id.clone(), timeout))
            }
            Err(RecvTimeoutError::Disconnected) => Err(DispatchError::Abandoned(self.id.clone())),
        }
    }
}

impl<T> Drop for PendingWork<T> {
    fn drop(&mut self) {
        let table = match self.table.upgrade() {
            Some(t) => t,
            None => return,
        };

        let withdrawn = lock_table(&table).pending.remove(&self.id);
        if withdrawn.is_some() {
            debug!("Request {} withdrawn", self.id);
        }
    }
}

// ------------------------------------------------------------------------------------------------
// PRIVATE FUNCTIONS
// ------------------------------------------------------------------------------------------------

fn lock_table(table: &Mutex<DispatcherInner>) -> MutexGuard<'_, DispatcherInner> {
    // Tables are never left half updated, so poisoning is ignored
    table.lock().unwrap_or_else(|e| e.into_inner())
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_support::RecordingWorker;
    use comms_if::work::{EndPosition, Heading, PlannedAction};
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    fn label_response(id: &str, label: &str) -> WorkResponse {
        WorkResponse {
            id: id.into(),
            result: Some(WorkResult::Label(label.into())),
        }
    }

    #[test]
    fn test_no_workers_completes_immediately() {
        let dispatcher = WorkDispatcher::new();
        let calls = Arc::new(Mutex::new(Vec::new()));

        let calls_clone = calls.clone();
        dispatcher.request_vision("img".into(), false, move |label| {
            calls_clone.lock().unwrap().push(label)
        });

        assert_eq!(*calls.lock().unwrap(), vec![ObstacleLabel::Unknown]);
        assert_eq!(dispatcher.pending_count(), 0);

        let plan = dispatcher.submit_planning(vec![]);
        assert_eq!(plan.try_take().unwrap(), Some(vec![]));
    }

    #[test]
    fn test_request_is_broadcast() {
        let dispatcher = WorkDispatcher::new();
        let workers = [RecordingWorker::new(), RecordingWorker::new()];
        for w in workers.iter() {
            dispatcher.register_worker(Box::new(w.clone()));
        }

        let pending = dispatcher.submit_vision("aGk=".into(), true);

        for w in workers.iter() {
            let req = w.last_request();
            assert_eq!(req.id, pending.id());
            assert_eq!(
                req.body,
                WorkBody::Vision(VisionPayload {
                    image: "aGk=".into(),
                    ignore_neutral_label: true
                })
            );
        }
        assert_eq!(dispatcher.pending_count(), 1);
        assert_eq!(pending.try_take().unwrap(), None);
    }

    #[test]
    fn test_out_of_order_responses() {
        let dispatcher = WorkDispatcher::new();
        let worker = RecordingWorker::new();
        let worker_id = dispatcher.register_worker(Box::new(worker.clone()));

        let first = dispatcher.submit_vision("a".into(), false);
        let second = dispatcher.submit_vision("b".into(), false);
        assert_ne!(first.id(), second.id());

        let second_resp = serde_json::to_vec(&label_response(second.id(), "RIGHT")).unwrap();
        assert!(dispatcher.on_message_received(worker_id, &second_resp));
        assert!(dispatcher.on_response_received(label_response(first.id(), "left")));

        assert_eq!(
            first.wait(Duration::from_millis(10)).unwrap(),
            ObstacleLabel::Left
        );
        assert_eq!(
            second.wait(Duration::from_millis(10)).unwrap(),
            ObstacleLabel::Right
        );
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[test]
    fn test_first_response_wins() {
        let dispatcher = WorkDispatcher::new();
        let workers: Vec<RecordingWorker> = (0..3).map(|_| RecordingWorker::new()).collect();
        for w in workers.iter() {
            dispatcher.register_worker(Box::new(w.clone()));
        }

        let count = Arc::new(AtomicUsize::new(0));
        let label = Arc::new(Mutex::new(None));
        let (count_clone, label_clone) = (count.clone(), label.clone());
        let id = dispatcher.request_vision("img".into(), true, move |l| {
            count_clone.fetch_add(1, Ordering::SeqCst);
            *label_clone.lock().unwrap() = Some(l);
        });

        let answers = ["UP", "DOWN", "LEFT"];
        let completed: Vec<bool> = answers
            .iter()
            .map(|a| dispatcher.on_response_received(label_response(&id, a)))
            .collect();

        assert_eq!(completed, vec![true, false, false]);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(*label.lock().unwrap(), Some(ObstacleLabel::Up));
    }

    #[test]
    fn test_ignored_responses() {
        let dispatcher = WorkDispatcher::new();
        let worker_id = dispatcher.register_worker(Box::new(RecordingWorker::new()));

        let pending = dispatcher.submit_vision("img".into(), false);

        // Unknown id
        assert!(!dispatcher.on_response_received(label_response("nope", "LEFT")));

        // Malformed
        assert!(!dispatcher.on_message_received(worker_id, b"{not json"));

        // Wrong result type for a vision request
        let plan = WorkResponse {
            id: pending.id().into(),
            result: Some(WorkResult::Commands(vec![PlannedCommand {
                action: PlannedAction::Finish,
                end_position: EndPosition {
                    x: 0,
                    y: 0,
                    d: Heading::North,
                },
            }])),
        };
        assert!(!dispatcher.on_response_received(plan));
        assert_eq!(pending.try_take().unwrap(), None);

        // A null result still completes the request
        assert!(dispatcher.on_response_received(WorkResponse {
            id: pending.id().into(),
            result: None
        }));
        assert_eq!(pending.try_take().unwrap(), Some(ObstacleLabel::Unknown));
    }

    #[test]
    fn test_failed_workers_are_removed() {
        let dispatcher = WorkDispatcher::new();
        let good = RecordingWorker::new();
        dispatcher.register_worker(Box::new(RecordingWorker::failing()));
        dispatcher.register_worker(Box::new(good.clone()));

        let pending = dispatcher.submit_vision("img".into(), false);
        assert_eq!(dispatcher.worker_count(), 1);
        assert_eq!(good.requests().len(), 1);
        assert_eq!(pending.try_take().unwrap(), None);

        // With only a failing worker the request completes straight away
        let dispatcher = WorkDispatcher::new();
        dispatcher.register_worker(Box::new(RecordingWorker::failing()));
        let pending = dispatcher.submit_vision("img".into(), false);
        assert_eq!(pending.try_take().unwrap(), Some(ObstacleLabel::Unknown));
        assert_eq!(dispatcher.worker_count(), 0);
    }

    #[test]
    fn test_remove_worker_keeps_pending() {
        let dispatcher = WorkDispatcher::new();
        let id = dispatcher.register_worker(Box::new(RecordingWorker::new()));

        let pending = dispatcher.submit_vision("img".into(), false);
        dispatcher.remove_worker(id);

        assert_eq!(dispatcher.worker_count(), 0);
        assert_eq!(dispatcher.pending_count(), 1);
        assert!(matches!(
            pending.wait(Duration::from_millis(5)),
            Err(DispatchError::Timeout(_, _))
        ));
    }

    #[test]
    fn test_dropped_request_is_withdrawn() {
        let dispatcher = WorkDispatcher::new();
        dispatcher.register_worker(Box::new(RecordingWorker::new()));

        let kept = dispatcher.submit_vision("a".into(), false);
        let dropped = dispatcher.submit_vision("b".into(), false);
        let dropped_id = dropped.id().to_string();
        assert_eq!(dispatcher.pending_count(), 2);

        drop(dropped);
        assert_eq!(dispatcher.pending_count(), 1);
        assert!(!dispatcher.on_response_received(label_response(&dropped_id, "LEFT")));

        // Timing out while waiting also withdraws the request
        let kept_id = kept.id().to_string();
        assert!(kept.wait(Duration::from_millis(5)).is_err());
        assert_eq!(dispatcher.pending_count(), 0);
        assert!(!dispatcher.on_response_received(label_response(&kept_id, "LEFT")));
    }

    #[test]
    fn test_callback_can_issue_new_request() {
        let dispatcher = Arc::new(WorkDispatcher::new());
        dispatcher.register_worker(Box::new(RecordingWorker::new()));

        let follow_up = Arc::new(Mutex::new(None));
        let (d, f) = (dispatcher.clone(), follow_up.clone());
        let id = dispatcher.request_vision("img".into(), false, move |_| {
            *f.lock().unwrap() = Some(d.submit_planning(vec![]));
        });

        assert!(dispatcher.on_response_received(label_response(&id, "A")));
        assert!(follow_up.lock().unwrap().is_some());
        assert_eq!(dispatcher.pending_count(), 1);
    }
}
