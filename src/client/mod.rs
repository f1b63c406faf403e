use std::io;
use std::net;
use std::time;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::ack::{AckPolicy, FailureReason, RetryPolicy};
use crate::codec::{self, RpcResult};
use crate::epoch::Epoch;
use crate::sequence::SequenceCounter;
use crate::socket;

mod session;
mod threaded;

use session::ClientCore;

pub use threaded::{ClientHandle, PendingReply, ThreadedClient};

const ACK_TIMEOUT_DEFAULT_MS: u64 = 1_000;
const MAX_RETRIES_DEFAULT: u32 = 5;
const RESPONSE_TIMEOUT_DEFAULT_MS: u64 = 5_000;
const INITIAL_WINDOW_SIZE_DEFAULT: usize = 1;
const FRAME_SIZE_MAX_DEFAULT: usize = 4096;

/// Smallest payload which still fits the ACK marker and a minimal response.
const FRAME_SIZE_MAX_MIN: usize = 16;

/// Configuration for a [`Client`] or [`ThreadedClient`] object.
#[derive(Clone, Debug)]
pub struct Config {
    /// Time to wait for an acknowledgment before a request is resent, in milliseconds.
    ///
    /// Minimum value: 1 \
    /// Default value: 1,000
    pub ack_timeout_ms: u64,

    /// Number of times a request is sent before the call fails.
    ///
    /// Minimum value: 1 \
    /// Default value: 5
    pub max_retries: u32,

    /// Time to wait for a response once a request has been acknowledged, in milliseconds.
    ///
    /// Minimum value: 1 \
    /// Default value: 5,000
    pub response_timeout_ms: u64,

    /// Number of calls which may be outstanding before any acknowledgment has arrived.
    ///
    /// Minimum value: 1 \
    /// Default value: 1
    pub initial_window_size: usize,

    /// Optional ceiling on the number of outstanding calls.
    ///
    /// Default value: None
    pub window_size_max: Option<usize>,

    /// Acknowledgment policy of the server. A batching server makes calls pipelined.
    ///
    /// Default value: [`AckPolicy::PerRequest`]
    pub ack_policy: AckPolicy,

    /// Whether each received response is acknowledged.
    ///
    /// Default value: true
    pub response_ack: bool,

    /// Largest datagram payload sent or received, in bytes.
    ///
    /// Minimum value: 16 \
    /// Default value: 4,096
    pub frame_size_max: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ack_timeout_ms: ACK_TIMEOUT_DEFAULT_MS,
            max_retries: MAX_RETRIES_DEFAULT,
            response_timeout_ms: RESPONSE_TIMEOUT_DEFAULT_MS,
            initial_window_size: INITIAL_WINDOW_SIZE_DEFAULT,
            window_size_max: None,
            ack_policy: AckPolicy::PerRequest,
            response_ack: true,
            frame_size_max: FRAME_SIZE_MAX_DEFAULT,
        }
    }
}

impl Config {
    fn validate(&self) {
        assert!(
            self.ack_timeout_ms > 0,
            "invalid client configuration: ack_timeout_ms == 0"
        );
        assert!(
            self.max_retries > 0,
            "invalid client configuration: max_retries == 0"
        );
        assert!(
            self.response_timeout_ms > 0,
            "invalid client configuration: response_timeout_ms == 0"
        );
        assert!(
            self.initial_window_size > 0,
            "invalid client configuration: initial_window_size == 0"
        );
        if let Some(window_size_max) = self.window_size_max {
            assert!(
                window_size_max >= self.initial_window_size,
                "invalid client configuration: window_size_max < initial_window_size"
            );
        }
        if let AckPolicy::Batched(batch) = self.ack_policy {
            assert!(
                batch >= 2,
                "invalid client configuration: ack batch < 2"
            );
        }
        assert!(
            self.frame_size_max >= FRAME_SIZE_MAX_MIN,
            "invalid client configuration: frame_size_max < {}",
            FRAME_SIZE_MAX_MIN
        );
    }

    pub(crate) fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            ack_timeout_ms: self.ack_timeout_ms,
            max_retries: self.max_retries,
            response_timeout_ms: self.response_timeout_ms,
            pipelined: self.ack_policy.is_pipelined(),
        }
    }
}

/// A remote call under construction.
///
/// ```
/// let call = udprpc::Call::new("add").arg(5).arg(10);
/// # assert_eq!(call.positional_args().len(), 2);
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct Call {
    function_name: String,
    positional_args: Vec<Value>,
    named_args: Map<String, Value>,
}

impl Call {
    pub fn new(function_name: impl Into<String>) -> Self {
        Self {
            function_name: function_name.into(),
            positional_args: Vec::new(),
            named_args: Map::new(),
        }
    }

    /// Appends a positional argument. Values which cannot be represented as JSON become null.
    pub fn arg(mut self, value: impl Serialize) -> Self {
        self.positional_args
            .push(serde_json::to_value(value).unwrap_or(Value::Null));
        self
    }

    /// Sets a named argument, replacing any previous value under the same name.
    pub fn kwarg(mut self, name: impl Into<String>, value: impl Serialize) -> Self {
        self.named_args.insert(
            name.into(),
            serde_json::to_value(value).unwrap_or(Value::Null),
        );
        self
    }

    /// Replaces the positional arguments wholesale.
    pub fn args(mut self, values: Vec<Value>) -> Self {
        self.positional_args = values;
        self
    }

    pub fn function_name(&self) -> &str {
        &self.function_name
    }

    pub fn positional_args(&self) -> &[Value] {
        &self.positional_args
    }

    pub fn named_args(&self) -> &Map<String, Value> {
        &self.named_args
    }

    pub(crate) fn envelope(&self, sequence_number: u64) -> codec::CallEnvelope {
        codec::CallEnvelope::new(
            self.function_name.clone(),
            self.positional_args.clone(),
            self.named_args.clone(),
            sequence_number,
        )
    }
}

/// A completed call. Application failures are carried in `result`.
#[derive(Clone, Debug, PartialEq)]
pub struct Reply {
    pub sequence: u64,
    /// Number of times the request was sent.
    pub attempts: u32,
    /// Time from the first send until the response arrived.
    pub elapsed: time::Duration,
    pub result: RpcResult,
}

/// Transport-level failure of a call.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error("call {sequence} failed after {attempts} attempts ({reason:?})")]
    DeliveryFailed {
        sequence: u64,
        attempts: u32,
        reason: FailureReason,
    },
    #[error("failed to encode call {sequence}: {source}")]
    Encode {
        sequence: u64,
        #[source]
        source: codec::EncodeError,
    },
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
    #[error("client driver has stopped")]
    Disconnected,
    #[error("call was abandoned")]
    Abandoned,
}

/// A sequential RPC client. Calls are driven by the calling thread.
pub struct Client {
    // Call state machines and flow control
    core: ClientCore,
    // Timestamps are computed relative to this
    epoch: Epoch,
    // Sequence numbers of this session
    sequence: SequenceCounter,
    // Socket handles
    socket_tx: socket::ConnectedSocketTx,
    socket_rx: socket::ConnectedSocketRx,
}

impl Client {
    /// Equivalent to calling [`Client::connect_with_config`] with default configuration.
    pub fn connect<A>(server_addr: A) -> io::Result<Self>
    where
        A: net::ToSocketAddrs,
    {
        Self::connect_with_config(server_addr, Default::default())
    }

    /// Binds a UDP socket to an ephemeral address, connects it to the server at the provided
    /// address, and returns a new client object. Errors encountered during socket initialization
    /// are forwarded to the caller.
    ///
    /// *Note*: No datagrams are exchanged until the first call.
    pub fn connect_with_config<A>(server_addr: A, config: Config) -> io::Result<Self>
    where
        A: net::ToSocketAddrs,
    {
        config.validate();

        let bind_address = (net::Ipv4Addr::UNSPECIFIED, 0);

        let (socket_tx, socket_rx) =
            socket::new_connected(bind_address, server_addr, config.frame_size_max)?;

        log::info!(
            "[Client] {} -> {}",
            socket_rx.local_addr(),
            socket_rx.peer_addr()
        );

        let core = ClientCore::new(config, socket_rx.peer_addr());

        Ok(Self {
            core,
            epoch: Epoch::new(),
            sequence: SequenceCounter::new(),
            socket_tx,
            socket_rx,
        })
    }

    /// Performs a call, blocking until a response arrives or the call fails.
    pub fn call(&mut self, call: Call) -> Result<Reply, CallError> {
        let sequence = self.sequence.allocate();

        let now_ms = self.epoch.time_now_ms();
        self.core.issue(sequence, &call, now_ms, &mut self.socket_tx);

        loop {
            if let Some(result) = self.core.take_completion(sequence) {
                return result;
            }

            if let Err(err) = self.pump() {
                let now_ms = self.epoch.time_now_ms();
                self.core.abandon(sequence, now_ms, &mut self.socket_tx);
                return Err(err.into());
            }
        }
    }

    /// Performs a batch of calls concurrently, as far as the window allows. Replies are matched
    /// by sequence number in whatever order they arrive, and returned in the order of `calls`.
    pub fn call_batch(&mut self, calls: Vec<Call>) -> Vec<Result<Reply, CallError>> {
        let now_ms = self.epoch.time_now_ms();

        let mut sequences = Vec::with_capacity(calls.len());

        for call in calls.iter() {
            let sequence = self.sequence.allocate();
            self.core.issue(sequence, call, now_ms, &mut self.socket_tx);
            sequences.push(sequence);
        }

        let mut results: Vec<Option<Result<Reply, CallError>>> =
            sequences.iter().map(|_| None).collect();
        let mut remaining = sequences.len();

        while remaining > 0 {
            while let Some((sequence, result)) = self.core.pop_completion() {
                if let Some(idx) = sequences.iter().position(|&s| s == sequence) {
                    results[idx] = Some(result);
                    remaining -= 1;
                }
            }

            if remaining == 0 {
                break;
            }

            if let Err(err) = self.pump() {
                let now_ms = self.epoch.time_now_ms();

                for (idx, &sequence) in sequences.iter().enumerate() {
                    if results[idx].is_none() {
                        self.core.abandon(sequence, now_ms, &mut self.socket_tx);
                        results[idx] = Some(Err(io::Error::new(err.kind(), err.to_string()).into()));
                    }
                }

                break;
            }
        }

        results
            .into_iter()
            .map(|result| result.unwrap_or(Err(CallError::Abandoned)))
            .collect()
    }

    // Waits for the next frame or timer, then processes everything that is ready.
    fn pump(&mut self) -> io::Result<()> {
        let now_ms = self.epoch.time_now_ms();
        let wait_timeout = self.core.next_timer_timeout(now_ms);

        if let Some(frame_bytes) = self.socket_rx.wait_for_frame(wait_timeout)? {
            let now_ms = self.epoch.time_now_ms();
            self.core.handle_frame(frame_bytes, now_ms, &mut self.socket_tx);

            // Process any further frames without blocking
            while let Some(frame_bytes) = self.socket_rx.try_read_frame()? {
                self.core.handle_frame(frame_bytes, now_ms, &mut self.socket_tx);
            }
        }

        let now_ms = self.epoch.time_now_ms();
        self.core.process_timeouts(now_ms, &mut self.socket_tx);

        Ok(())
    }

    /// Returns the current window size.
    pub fn window_size(&self) -> usize {
        self.core.window_size()
    }

    /// Returns the sequence number the next call will carry.
    pub fn next_sequence(&self) -> u64 {
        self.sequence.peek()
    }

    /// Returns the local address of the internal UDP socket.
    pub fn local_addr(&self) -> net::SocketAddr {
        self.socket_rx.local_addr()
    }

    /// Returns the server address for this client.
    pub fn server_addr(&self) -> net::SocketAddr {
        self.socket_rx.peer_addr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn call_builder() {
        let call = Call::new("scale")
            .arg(3)
            .arg("text")
            .kwarg("factor", 2.5)
            .kwarg("factor", 4);

        assert_eq!(call.function_name(), "scale");
        assert_eq!(call.positional_args(), &[json!(3), json!("text")]);
        assert_eq!(call.named_args().get("factor"), Some(&json!(4)));

        let envelope = call.envelope(9);
        assert_eq!(envelope.sequence_number, 9);
        assert_eq!(envelope.function_name, "scale");
    }

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        config.validate();

        let policy = config.retry_policy();
        assert_eq!(policy.ack_timeout_ms, 1000);
        assert_eq!(policy.max_retries, 5);
        assert!(!policy.pipelined);
    }

    #[test]
    #[should_panic(expected = "max_retries")]
    fn zero_retries_rejected() {
        Config {
            max_retries: 0,
            ..Default::default()
        }
        .validate();
    }

    #[test]
    #[should_panic(expected = "initial_window_size")]
    fn zero_window_rejected() {
        Config {
            initial_window_size: 0,
            ..Default::default()
        }
        .validate();
    }
}
