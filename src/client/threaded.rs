use std::collections::HashMap;
use std::io;
use std::net;
use std::sync::{mpsc, Arc};
use std::thread;
use std::time;

use parking_lot::Mutex;

use super::session::{ClientCore, FlowRef};
use super::{Call, CallError, Config, Reply};
use crate::epoch::Epoch;
use crate::sequence::SequenceCounter;
use crate::socket;

type ReplySender = mpsc::Sender<Result<Reply, CallError>>;

enum Command {
    Call {
        sequence: u64,
        call: Call,
        reply_tx: ReplySender,
    },
    Abandon(u64),
    Shutdown,
}

// Owns the socket and every call state machine. Runs on its own thread.
struct Driver {
    core: ClientCore,
    epoch: Epoch,
    socket_tx: socket::ConnectedSocketTx,
    socket_rx: socket::ConnectedSocketRx,
    commands: mpsc::Receiver<Command>,
    // Completion channel of each unsettled call
    waiters: HashMap<u64, ReplySender>,
}

impl Driver {
    fn run(mut self) {
        log::debug!("[ThreadedClient] driver started");

        loop {
            if !self.handle_commands() {
                break;
            }

            self.deliver_completions();

            let now_ms = self.epoch.time_now_ms();
            let wait_timeout = self.core.next_timer_timeout(now_ms);

            if let Err(err) = self.handle_frames_wait(wait_timeout) {
                log::error!("[ThreadedClient] socket error: {}", err);
                self.fail_all(|| CallError::Io(io::Error::new(err.kind(), err.to_string())));
                return;
            }

            let now_ms = self.epoch.time_now_ms();
            self.core.process_timeouts(now_ms, &mut self.socket_tx);

            self.deliver_completions();
        }

        self.fail_all(|| CallError::Abandoned);

        log::debug!("[ThreadedClient] driver stopped");
    }

    // Returns false once the driver should stop.
    fn handle_commands(&mut self) -> bool {
        loop {
            match self.commands.try_recv() {
                Ok(Command::Call {
                    sequence,
                    call,
                    reply_tx,
                }) => {
                    self.waiters.insert(sequence, reply_tx);

                    let now_ms = self.epoch.time_now_ms();
                    self.core
                        .issue(sequence, &call, now_ms, &mut self.socket_tx);
                }
                Ok(Command::Abandon(sequence)) => {
                    self.waiters.remove(&sequence);

                    let now_ms = self.epoch.time_now_ms();
                    self.core.abandon(sequence, now_ms, &mut self.socket_tx);
                }
                Ok(Command::Shutdown) | Err(mpsc::TryRecvError::Disconnected) => return false,
                Err(mpsc::TryRecvError::Empty) => return true,
            }
        }
    }

    fn handle_frames_wait(&mut self, wait_timeout: Option<time::Duration>) -> io::Result<()> {
        if let Some(frame_bytes) = self.socket_rx.wait_for_frame(wait_timeout)? {
            let now_ms = self.epoch.time_now_ms();
            self.core
                .handle_frame(frame_bytes, now_ms, &mut self.socket_tx);

            while let Some(frame_bytes) = self.socket_rx.try_read_frame()? {
                self.core
                    .handle_frame(frame_bytes, now_ms, &mut self.socket_tx);
            }
        }

        Ok(())
    }

    fn deliver_completions(&mut self) {
        while let Some((sequence, result)) = self.core.pop_completion() {
            if let Some(reply_tx) = self.waiters.remove(&sequence) {
                // The receiver may have been dropped
                let _ = reply_tx.send(result);
            }
        }
    }

    fn fail_all(&mut self, error: impl Fn() -> CallError) {
        for (_, reply_tx) in self.waiters.drain() {
            let _ = reply_tx.send(Err(error()));
        }
    }
}

/// A cloneable handle for submitting calls to a [`ThreadedClient`] from any thread.
#[derive(Clone)]
pub struct ClientHandle {
    commands: mpsc::Sender<Command>,
    waker: socket::Waker,
    // Held while a call is numbered and queued, so the driver receives sequences in order
    sequence: Arc<Mutex<SequenceCounter>>,
    flow: FlowRef,
}

impl ClientHandle {
    /// Submits a call without waiting for it.
    pub fn submit(&self, call: Call) -> PendingReply {
        let (reply_tx, reply_rx) = mpsc::channel();

        let sequence = {
            let counter = self.sequence.lock();
            let sequence = counter.allocate();

            // If the driver is gone, the reply sender is dropped and the wait reports it
            let _ = self.commands.send(Command::Call {
                sequence,
                call,
                reply_tx,
            });

            sequence
        };
        self.waker.wake();

        PendingReply {
            sequence,
            reply_rx,
            commands: self.commands.clone(),
            waker: self.waker.clone(),
            settled: false,
        }
    }

    /// Performs a call, blocking until a response arrives or the call fails.
    pub fn call(&self, call: Call) -> Result<Reply, CallError> {
        self.submit(call).wait()
    }

    /// Submits a batch of calls at once and waits for all of them. Results are returned in the
    /// order of `calls`.
    pub fn call_batch(&self, calls: Vec<Call>) -> Vec<Result<Reply, CallError>> {
        let pending: Vec<PendingReply> = calls.into_iter().map(|call| self.submit(call)).collect();

        pending.into_iter().map(PendingReply::wait).collect()
    }

    /// Returns the current window size.
    pub fn window_size(&self) -> usize {
        self.flow.lock().window_size()
    }
}

/// Completion handle of a submitted call. Dropping it before the call settles abandons the
/// call.
pub struct PendingReply {
    sequence: u64,
    reply_rx: mpsc::Receiver<Result<Reply, CallError>>,
    commands: mpsc::Sender<Command>,
    waker: socket::Waker,
    settled: bool,
}

impl PendingReply {
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Blocks until the call settles.
    pub fn wait(mut self) -> Result<Reply, CallError> {
        self.settled = true;

        self.reply_rx.recv().unwrap_or(Err(CallError::Disconnected))
    }

    /// Blocks for a duration of up to `timeout` for the call to settle. Returns `None` if it is
    /// still outstanding.
    pub fn wait_timeout(&mut self, timeout: time::Duration) -> Option<Result<Reply, CallError>> {
        if self.settled {
            return Some(Err(CallError::Disconnected));
        }

        match self.reply_rx.recv_timeout(timeout) {
            Ok(result) => {
                self.settled = true;
                Some(result)
            }
            Err(mpsc::RecvTimeoutError::Timeout) => None,
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                self.settled = true;
                Some(Err(CallError::Disconnected))
            }
        }
    }

    /// Gives up on the call. No further retransmissions are made.
    pub fn abandon(mut self) {
        self.cancel();
    }

    fn cancel(&mut self) {
        if self.settled {
            return;
        }

        self.settled = true;

        let _ = self.commands.send(Command::Abandon(self.sequence));
        self.waker.wake();
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// A concurrent RPC client. A background thread owns the socket and demultiplexes responses
/// to the [`ClientHandle`]s which submitted them.
pub struct ThreadedClient {
    handle: ClientHandle,
    local_addr: net::SocketAddr,
    server_addr: net::SocketAddr,
    thread: Option<thread::JoinHandle<()>>,
}

impl ThreadedClient {
    /// Equivalent to calling [`ThreadedClient::connect_with_config`] with default
    /// configuration.
    pub fn connect<A>(server_addr: A) -> io::Result<Self>
    where
        A: net::ToSocketAddrs,
    {
        Self::connect_with_config(server_addr, Default::default())
    }

    /// Binds a UDP socket to an ephemeral address, connects it to the server at the provided
    /// address, and starts the driver thread.
    pub fn connect_with_config<A>(server_addr: A, config: Config) -> io::Result<Self>
    where
        A: net::ToSocketAddrs,
    {
        config.validate();

        let bind_address = (net::Ipv4Addr::UNSPECIFIED, 0);

        let (socket_tx, socket_rx) =
            socket::new_connected(bind_address, server_addr, config.frame_size_max)?;

        let local_addr = socket_rx.local_addr();
        let server_addr = socket_rx.peer_addr();

        log::info!("[ThreadedClient] {} -> {}", local_addr, server_addr);

        let core = ClientCore::new(config, server_addr);

        let (commands_tx, commands_rx) = mpsc::channel();

        let handle = ClientHandle {
            commands: commands_tx,
            waker: socket_rx.waker(),
            sequence: Arc::new(Mutex::new(SequenceCounter::new())),
            flow: core.flow_ref(),
        };

        let driver = Driver {
            core,
            epoch: Epoch::new(),
            socket_tx,
            socket_rx,
            commands: commands_rx,
            waiters: HashMap::new(),
        };

        let thread = thread::Builder::new()
            .name("udprpc-client".into())
            .spawn(move || driver.run())?;

        Ok(Self {
            handle,
            local_addr,
            server_addr,
            thread: Some(thread),
        })
    }

    /// Returns a new handle for submitting calls.
    pub fn handle(&self) -> ClientHandle {
        self.handle.clone()
    }

    /// Equivalent to [`ClientHandle::call`].
    pub fn call(&self, call: Call) -> Result<Reply, CallError> {
        self.handle.call(call)
    }

    /// Equivalent to [`ClientHandle::submit`].
    pub fn submit(&self, call: Call) -> PendingReply {
        self.handle.submit(call)
    }

    /// Equivalent to [`ClientHandle::call_batch`].
    pub fn call_batch(&self, calls: Vec<Call>) -> Vec<Result<Reply, CallError>> {
        self.handle.call_batch(calls)
    }

    pub fn window_size(&self) -> usize {
        self.handle.window_size()
    }

    /// Returns the local address of the internal UDP socket.
    pub fn local_addr(&self) -> net::SocketAddr {
        self.local_addr
    }

    /// Returns the server address for this client.
    pub fn server_addr(&self) -> net::SocketAddr {
        self.server_addr
    }
}

impl Drop for ThreadedClient {
    /// Stops the driver thread. Calls still outstanding fail with [`CallError::Abandoned`].
    fn drop(&mut self) {
        let _ = self.handle.commands.send(Command::Shutdown);
        self.handle.waker.wake();

        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("[ThreadedClient] driver thread panicked");
            }
        }
    }
}
