//! Stand-in worker for bench testing the rover's work dispatcher.
//!
//! Connects to the rover's worker server, answers every vision request with a fixed label and
//! every planning request with an empty plan.

use std::time::{Duration, Instant};

use comms_if::{
    net::{zmq, MonitoredSocket, SocketOptions},
    work::{WorkBody, WorkRequest, WorkResponse, WorkResult, WorkerMessage},
};
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(name = "test_worker", about = "Answers rover work requests with canned results")]
struct Opts {
    /// Endpoint of the rover's worker server
    #[structopt(short, long, default_value = "tcp://localhost:5100")]
    endpoint: String,

    /// Label returned for every vision request
    #[structopt(short, long, default_value = "LEFT")]
    label: String,

    /// Name announced to the rover
    #[structopt(short, long)]
    name: Option<String>,

    /// Delay before answering each request, in milliseconds
    #[structopt(short, long, default_value = "0")]
    delay_ms: u64,

    /// Interval between heartbeats, in milliseconds
    #[structopt(long, default_value = "1000")]
    heartbeat_ms: u64,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let opts = Opts::from_args();

    let ctx = zmq::Context::new();

    let socket_options = SocketOptions {
        block_on_first_connect: false,
        recv_timeout: 50,
        send_timeout: 100,
        linger: 0,
        ..Default::default()
    };

    let socket = MonitoredSocket::new(&ctx, zmq::DEALER, socket_options, &opts.endpoint)?;

    println!("Worker connecting to {}", opts.endpoint);

    send(&socket, &WorkerMessage::Hello { name: opts.name.clone() })?;
    let mut last_heartbeat = Instant::now();
    let mut was_connected = socket.connected();

    loop {
        // Announce again after a reconnect, the rover may have dropped this worker meanwhile
        let connected = socket.connected();
        if connected != was_connected {
            println!(
                "Link to {} {}",
                opts.endpoint,
                if connected { "up" } else { "down" }
            );
            if connected {
                send(&socket, &WorkerMessage::Hello { name: opts.name.clone() })?;
            }
            was_connected = connected;
        }

        if last_heartbeat.elapsed() > Duration::from_millis(opts.heartbeat_ms) {
            send(&socket, &WorkerMessage::Heartbeat)?;
            last_heartbeat = Instant::now();
        }

        let msg = match socket.recv_msg(0) {
            Ok(m) => m,
            Err(zmq::Error::EAGAIN) => continue,
            Err(e) => return Err(e.into()),
        };

        let request: WorkRequest = match serde_json::from_slice(&msg) {
            Ok(r) => r,
            Err(e) => {
                println!("Received invalid request: {}", e);
                continue;
            }
        };

        println!("Received {:?} request {}", request.body.kind(), request.id);

        std::thread::sleep(Duration::from_millis(opts.delay_ms));

        let result = match request.body {
            WorkBody::Vision(_) => WorkResult::Label(opts.label.clone()),
            WorkBody::Planning(_) => WorkResult::Commands(vec![]),
        };

        send(
            &socket,
            &WorkerMessage::Response(WorkResponse {
                id: request.id,
                result: Some(result),
            }),
        )?;
    }
}

fn send(socket: &MonitoredSocket, msg: &WorkerMessage) -> Result<(), Box<dyn std::error::Error>> {
    let data = serde_json::to_string(msg)?;
    socket.send(data.as_str(), 0)?;
    Ok(())
}
