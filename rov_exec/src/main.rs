//! Main rover-side executable entry point.
//!
//! # Architecture
//!
//! The executable runs a single obstacle course mission:
//!
//!     - Initialise the session, logging and parameters
//!     - Connect to the motor controller over serial
//!     - Start the worker server and wait for vision workers to connect
//!     - Run the maneuver sequencer until the mission completes or aborts
//!     - Save the mission report to the session directory
//!
//! Parameters are loaded from `$ROVER_SW_ROOT/params/rov_exec.toml` unless another file is given
//! on the command line.

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

// External
use color_eyre::{
    eyre::{eyre, WrapErr},
    Report,
};
use log::{info, warn};
use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant},
};
use structopt::StructOpt;

// Internal
use rov_lib::{
    frame_source::FileFrameSource,
    mnvr_seq::{MissionOutcome, Sequencer},
    motor_link::MotorLink,
    params::RovExecParams,
    work_dispatcher::{WorkDispatcher, WorkerServer},
};
use util::{
    host,
    logger::{logger_init, LevelFilter},
    session::Session,
};

// ---------------------------------------------------------------------------
// CONSTANTS
// ---------------------------------------------------------------------------

/// Period at which the worker count is checked while waiting for workers.
const WORKER_POLL_PERIOD: Duration = Duration::from_millis(100);

// ---------------------------------------------------------------------------
// STRUCTS
// ---------------------------------------------------------------------------

#[derive(Debug, StructOpt)]
#[structopt(name = "rov_exec", about = "Runs the obstacle course mission")]
struct Opts {
    /// Parameter file, relative to `$ROVER_SW_ROOT/params`
    #[structopt(short, long, default_value = "rov_exec.toml")]
    params: String,

    /// Number of workers to wait for before starting the mission
    #[structopt(short, long, default_value = "1")]
    min_workers: usize,

    /// Maximum time to wait for workers, in seconds
    #[structopt(short, long, default_value = "30")]
    worker_wait_s: f64,
}

// ---------------------------------------------------------------------------
// FUNCTIONS
// ---------------------------------------------------------------------------

/// Executable main function, entry point.
fn main() -> Result<(), Report> {
    color_eyre::install()?;

    let opts = Opts::from_args();

    // ---- EARLY INITIALISATION ----

    // Initialise session
    let session = Session::new("rov_exec", "sessions").wrap_err("Failed to create the session")?;

    // Initialise logger
    logger_init(LevelFilter::Trace, &session).wrap_err("Failed to initialise logging")?;

    // Log information on this execution.
    info!("Rover Obstacle Course Executable\n");
    info!(
        "Running on: {:#?}",
        host::get_uname().wrap_err("Failed to get host information")?
    );
    info!("Session directory: {:?}\n", session.session_root);

    // ---- LOAD PARAMETERS ----

    let params: RovExecParams = util::params::load(&opts.params)
        .wrap_err_with(|| format!("Could not load exec params from {}", opts.params))?;

    info!("Exec parameters loaded");

    // ---- INITIALISE MOTOR LINK ----

    let mut motor = MotorLink::new(params.motor_link.clone());
    motor
        .connect()
        .wrap_err("Failed to connect to the motor controller")?;
    info!("MotorLink initialised");

    // ---- INITIALISE NETWORK ----

    info!("Initialising network");

    let dispatcher = Arc::new(WorkDispatcher::new());
    let zmq_ctx = comms_if::net::zmq::Context::new();

    let worker_server = WorkerServer::start(
        &zmq_ctx,
        &params.net,
        &params.worker_server,
        dispatcher.clone(),
    )
    .wrap_err("Failed to start the WorkerServer")?;
    info!("WorkerServer initialised");

    wait_for_workers(&dispatcher, opts.min_workers, opts.worker_wait_s);

    info!("Network initialisation complete\n");

    // ---- MISSION ----

    let mut frames = FileFrameSource::new(params.frames.clone());

    let report = Sequencer::new(
        params.maneuver.clone(),
        &mut motor,
        &dispatcher,
        &mut frames,
    )
    .with_mission_end_handler(|report| info!("Final state: {:#?}", report.final_state))
    .run();

    match session.save_json("mission_report.json", &report) {
        Ok(path) => info!("Mission report saved to {:?}", path),
        Err(e) => warn!("Could not save the mission report: {}", e),
    }

    // ---- SHUTDOWN ----

    worker_server.stop();
    motor.disconnect();

    info!("End of execution");

    match report.outcome {
        MissionOutcome::Complete => Ok(()),
        MissionOutcome::Aborted(cause) => Err(eyre!("Mission aborted: {}", cause)),
    }
}

/// Block until at least `min_workers` workers are registered, or until the timeout expires.
fn wait_for_workers(dispatcher: &WorkDispatcher, min_workers: usize, timeout_s: f64) {
    let timeout = Duration::from_secs_f64(timeout_s.max(0.0));
    let start = Instant::now();

    info!("Waiting for {} worker(s)", min_workers);

    while dispatcher.worker_count() < min_workers {
        if start.elapsed() > timeout {
            warn!(
                "Only {} of {} worker(s) connected after {:.0} s, starting anyway",
                dispatcher.worker_count(),
                min_workers,
                timeout_s
            );
            return;
        }

        thread::sleep(WORKER_POLL_PERIOD);
    }

    info!("{} worker(s) connected", dispatcher.worker_count());
}
