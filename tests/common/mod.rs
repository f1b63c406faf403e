#![allow(dead_code)]

use std::net;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time;

use parking_lot::Mutex;
use serde_json::{json, Value};

use udprpc::codec::{self, Frame};
use udprpc::{Args, HandlerError, MethodRegistry};

const RELAY_POLL_INTERVAL: time::Duration = time::Duration::from_millis(1);
const RELAY_BUFFER_SIZE: usize = 65536;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    ToServer,
    ToClient,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameKind {
    Ack,
    Call,
    Response,
    Other,
}

impl FrameKind {
    pub fn of(frame_bytes: &[u8]) -> Self {
        match codec::decode(frame_bytes) {
            Ok(Frame::Ack) => FrameKind::Ack,
            Ok(Frame::Call(_)) => FrameKind::Call,
            Ok(Frame::Response(_)) => FrameKind::Response,
            Err(_) => FrameKind::Other,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct RelayRecord {
    pub direction: Direction,
    pub kind: FrameKind,
    pub dropped: bool,
}

/// Decides whether a datagram is dropped.
pub type DropPolicy = Box<dyn FnMut(Direction, &[u8]) -> bool + Send>;

/// A UDP relay between one client and a server which drops datagrams according to a policy.
pub struct Relay {
    addr: net::SocketAddr,
    records: Arc<Mutex<Vec<RelayRecord>>>,
    stop: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Relay {
    pub fn spawn<F>(server_addr: net::SocketAddr, policy: F) -> Self
    where
        F: FnMut(Direction, &[u8]) -> bool + Send + 'static,
    {
        let policy: DropPolicy = Box::new(policy);

        let front = net::UdpSocket::bind("127.0.0.1:0").expect("failed to bind relay socket");
        front
            .set_read_timeout(Some(RELAY_POLL_INTERVAL))
            .expect("failed to set relay read timeout");

        let back = net::UdpSocket::bind("127.0.0.1:0").expect("failed to bind relay socket");
        back.connect(server_addr)
            .expect("failed to connect relay socket");
        back.set_read_timeout(Some(RELAY_POLL_INTERVAL))
            .expect("failed to set relay read timeout");

        let addr = front.local_addr().unwrap();
        let records = Arc::new(Mutex::new(Vec::new()));
        let stop = Arc::new(AtomicBool::new(false));

        let thread = {
            let records = Arc::clone(&records);
            let stop = Arc::clone(&stop);

            thread::spawn(move || relay_main(front, back, policy, records, stop))
        };

        Self {
            addr,
            records,
            stop,
            thread: Some(thread),
        }
    }

    /// A relay which forwards everything.
    pub fn lossless(server_addr: net::SocketAddr) -> Self {
        Self::spawn(server_addr, |_, _| false)
    }

    /// The address clients should connect to.
    pub fn addr(&self) -> net::SocketAddr {
        self.addr
    }

    pub fn records(&self) -> Vec<RelayRecord> {
        self.records.lock().clone()
    }

    /// Number of frames of `kind` seen travelling in `direction`, dropped or not.
    pub fn seen(&self, direction: Direction, kind: FrameKind) -> usize {
        self.records
            .lock()
            .iter()
            .filter(|r| r.direction == direction && r.kind == kind)
            .count()
    }

    /// Number of frames of `kind` delivered in `direction`.
    pub fn forwarded(&self, direction: Direction, kind: FrameKind) -> usize {
        self.records
            .lock()
            .iter()
            .filter(|r| r.direction == direction && r.kind == kind && !r.dropped)
            .count()
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);

        if let Some(thread) = self.thread.take() {
            thread.join().unwrap();
        }
    }
}

fn relay_main(
    front: net::UdpSocket,
    back: net::UdpSocket,
    mut policy: DropPolicy,
    records: Arc<Mutex<Vec<RelayRecord>>>,
    stop: Arc<AtomicBool>,
) {
    let mut buffer = vec![0u8; RELAY_BUFFER_SIZE];
    let mut client_addr = None;

    while !stop.load(Ordering::Relaxed) {
        if let Ok((len, sender_addr)) = front.recv_from(&mut buffer) {
            client_addr = Some(sender_addr);

            let frame = &buffer[..len];
            let dropped = policy(Direction::ToServer, frame);

            records.lock().push(RelayRecord {
                direction: Direction::ToServer,
                kind: FrameKind::of(frame),
                dropped,
            });

            if !dropped {
                let _ = back.send(frame);
            }
        }

        if let Ok(len) = back.recv(&mut buffer) {
            let frame = &buffer[..len];
            let dropped = policy(Direction::ToClient, frame);

            records.lock().push(RelayRecord {
                direction: Direction::ToClient,
                kind: FrameKind::of(frame),
                dropped,
            });

            if let (false, Some(client_addr)) = (dropped, client_addr) {
                let _ = front.send_to(frame, client_addr);
            }
        }
    }
}

/// Runs a server on its own thread until dropped.
pub struct ServerGuard {
    addr: net::SocketAddr,
    stop: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl ServerGuard {
    pub fn addr(&self) -> net::SocketAddr {
        self.addr
    }
}

impl Drop for ServerGuard {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);

        if let Some(thread) = self.thread.take() {
            thread.join().unwrap();
        }
    }
}

pub fn spawn_server(config: udprpc::server::Config, registry: MethodRegistry) -> ServerGuard {
    let mut server = udprpc::Server::bind_with_config(("127.0.0.1", 0), registry, config)
        .expect("failed to create udprpc server");

    let addr = server.local_addr();
    let stop = Arc::new(AtomicBool::new(false));

    let thread = {
        let stop = Arc::clone(&stop);

        thread::spawn(move || {
            server.serve_until(&stop).expect("server failed");
        })
    };

    ServerGuard {
        addr,
        stop,
        thread: Some(thread),
    }
}

fn binary(args: &Args, op: fn(i64, i64) -> i64) -> Result<Value, HandlerError> {
    args.expect_arity(2)?;

    let a: i64 = args.arg(0)?;
    let b: i64 = args.arg(1)?;

    Ok(json!(op(a, b)))
}

/// add, subtract and multiply over integers, plus `sleep(ms)` which returns its argument late.
pub fn arithmetic_registry() -> MethodRegistry {
    let mut registry = MethodRegistry::new();

    registry
        .register("add", |args: &Args| binary(args, |a, b| a + b))
        .unwrap();
    registry
        .register("subtract", |args: &Args| binary(args, |a, b| a - b))
        .unwrap();
    registry
        .register("multiply", |args: &Args| binary(args, |a, b| a * b))
        .unwrap();
    registry
        .register("sleep", |args: &Args| {
            let ms: u64 = args.arg(0)?;
            thread::sleep(time::Duration::from_millis(ms));
            Ok(json!(ms))
        })
        .unwrap();

    registry
}

/// Client settings scaled down so that failures surface quickly.
pub fn fast_client_config() -> udprpc::client::Config {
    udprpc::client::Config {
        ack_timeout_ms: 100,
        max_retries: 5,
        response_timeout_ms: 1000,
        ..Default::default()
    }
}

pub fn fast_server_config() -> udprpc::server::Config {
    udprpc::server::Config {
        ack_timeout_ms: 100,
        max_retries: 5,
        ..Default::default()
    }
}
