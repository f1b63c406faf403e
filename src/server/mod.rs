mod peer;

use std::collections::HashMap;
use std::io;
use std::net;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time;

use crate::ack::{AckPolicy, RetryPolicy};
use crate::codec::{self, Frame, RemoteError};
use crate::dispatch::MethodRegistry;
use crate::epoch::Epoch;
use crate::socket::{self, FrameSink};

use peer::Peer;

const ACK_TIMEOUT_DEFAULT_MS: u64 = 1_000;
const MAX_RETRIES_DEFAULT: u32 = 5;
const FRAME_SIZE_MAX_DEFAULT: usize = 4096;
const FRAME_SIZE_MAX_MIN: usize = 64;
const BASE_BUFFER_SIZE_DEFAULT: usize = 1024;
const MAX_BUFFER_SIZE_DEFAULT: usize = 4096;
const RESPONSE_CACHE_LEN_DEFAULT: usize = 64;
const PEER_IDLE_TIMEOUT_DEFAULT_MS: u64 = 60_000;

const STOP_CHECK_INTERVAL: time::Duration = time::Duration::from_millis(100);

/// Configuration for a [`Server`] object.
#[derive(Clone, Debug)]
pub struct Config {
    /// Time to wait for a response acknowledgment before the response is resent, in
    /// milliseconds.
    ///
    /// Minimum value: 1 \
    /// Default value: 1,000
    pub ack_timeout_ms: u64,

    /// Number of times a response is sent before the server stops waiting for its
    /// acknowledgment.
    ///
    /// Minimum value: 1 \
    /// Default value: 5
    pub max_retries: u32,

    /// Which requests are acknowledged.
    ///
    /// Default value: [`AckPolicy::PerRequest`]
    pub ack_policy: AckPolicy,

    /// Whether responses are resent until the client acknowledges them.
    ///
    /// Default value: true
    pub response_ack: bool,

    /// Largest datagram payload sent or received, in bytes.
    ///
    /// Minimum value: 64 \
    /// Default value: 4,096
    pub frame_size_max: usize,

    /// Initial per-peer buffer hint, and the step by which it grows.
    ///
    /// Minimum value: 1 \
    /// Default value: 1,024
    pub base_buffer_size: usize,

    /// Per-peer buffer hint ceiling.
    ///
    /// Minimum value: `base_buffer_size` \
    /// Default value: 4,096
    pub max_buffer_size: usize,

    /// Number of recent responses kept per peer for answering retransmitted requests.
    ///
    /// Default value: 64
    pub response_cache_len: usize,

    /// Time after which a silent peer is forgotten, in milliseconds.
    ///
    /// Minimum value: 1 \
    /// Default value: 60,000
    pub peer_idle_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ack_timeout_ms: ACK_TIMEOUT_DEFAULT_MS,
            max_retries: MAX_RETRIES_DEFAULT,
            ack_policy: AckPolicy::PerRequest,
            response_ack: true,
            frame_size_max: FRAME_SIZE_MAX_DEFAULT,
            base_buffer_size: BASE_BUFFER_SIZE_DEFAULT,
            max_buffer_size: MAX_BUFFER_SIZE_DEFAULT,
            response_cache_len: RESPONSE_CACHE_LEN_DEFAULT,
            peer_idle_timeout_ms: PEER_IDLE_TIMEOUT_DEFAULT_MS,
        }
    }
}

impl Config {
    fn validate(&self) {
        assert!(
            self.ack_timeout_ms > 0,
            "invalid server configuration: ack_timeout_ms == 0"
        );
        assert!(
            self.max_retries > 0,
            "invalid server configuration: max_retries == 0"
        );
        if let AckPolicy::Batched(batch) = self.ack_policy {
            assert!(batch >= 2, "invalid server configuration: ack batch < 2");
        }
        assert!(
            self.frame_size_max >= FRAME_SIZE_MAX_MIN,
            "invalid server configuration: frame_size_max < {}",
            FRAME_SIZE_MAX_MIN
        );
        assert!(
            self.base_buffer_size > 0,
            "invalid server configuration: base_buffer_size == 0"
        );
        assert!(
            self.max_buffer_size >= self.base_buffer_size,
            "invalid server configuration: max_buffer_size < base_buffer_size"
        );
        assert!(
            self.peer_idle_timeout_ms > 0,
            "invalid server configuration: peer_idle_timeout_ms == 0"
        );
    }

    pub(crate) fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            ack_timeout_ms: self.ack_timeout_ms,
            max_retries: self.max_retries,
            response_timeout_ms: self.ack_timeout_ms,
            pipelined: false,
        }
    }
}

struct ServerCore {
    // Saved configuration
    config: Config,
    policy: RetryPolicy,
    // Injected by the application, read-only while serving
    registry: MethodRegistry,
    // Table of known clients
    peers: HashMap<net::SocketAddr, Peer>,
}

/// A UDP RPC server.
pub struct Server {
    // Peer table and registry
    core: ServerCore,
    // Source of integer timestamps
    epoch: Epoch,
    // Socket handles
    socket_tx: socket::SocketTx,
    socket_rx: socket::SocketRx,
}

impl ServerCore {
    fn new(config: Config, registry: MethodRegistry) -> Self {
        Self {
            policy: config.retry_policy(),
            config,
            registry,
            peers: HashMap::new(),
        }
    }

    fn handle_frame(
        &mut self,
        frame_bytes: &[u8],
        addr: net::SocketAddr,
        now_ms: u64,
        ctx: &mut impl FrameSink,
    ) {
        let Self {
            config,
            policy,
            registry,
            peers,
        } = self;

        let peer = peers.entry(addr).or_insert_with(|| {
            log::debug!("[Server] new peer {}", addr);
            Peer::new(addr, config, now_ms)
        });

        peer.touch(now_ms);

        match codec::decode(frame_bytes) {
            Ok(Frame::Call(call)) => {
                peer.handle_request(call.sequence_number, now_ms, config, policy, ctx, || {
                    log::debug!(
                        "[Server] {} calls '{}' ({})",
                        addr,
                        call.function_name,
                        call.sequence_number
                    );

                    registry.dispatch(&call.function_name, &call.positional_args, &call.named_args)
                });
            }
            Ok(Frame::Ack) => match peer.handle_ack() {
                Some(sequence) => {
                    log::debug!("[Server] response {} acknowledged by {}", sequence, addr);
                }
                None => {
                    log::trace!("[Server] ack from {} with nothing outstanding", addr);
                }
            },
            Ok(Frame::Response(response)) => {
                log::warn!(
                    "[Server] dropping unexpected response {} from {}",
                    response.sequence_number,
                    addr
                );
            }
            Err(err) => match codec::recover_sequence(frame_bytes) {
                Some(sequence) => {
                    log::warn!(
                        "[Server] malformed request {} from {}: {}",
                        sequence,
                        addr,
                        err
                    );

                    peer.handle_request(sequence, now_ms, config, policy, ctx, || {
                        Err(RemoteError::DecodeError(err.to_string()))
                    });
                }
                None => {
                    log::warn!("[Server] dropping malformed frame from {}: {}", addr, err);
                }
            },
        }
    }

    fn process_timeouts(&mut self, now_ms: u64, ctx: &mut impl FrameSink) {
        let config = &self.config;
        let policy = &self.policy;

        self.peers.retain(|addr, peer| {
            if now_ms >= peer.idle_deadline_ms(config) {
                log::debug!("[Server] forgetting idle peer {}", addr);
                return false;
            }

            peer.process_timeouts(now_ms, policy, ctx);

            true
        });
    }

    /// Returns the time remaining until the next timer expires.
    fn next_timer_timeout(&self, now_ms: u64) -> Option<time::Duration> {
        self.peers
            .values()
            .map(|peer| peer.next_deadline_ms(&self.config))
            .min()
            .map(|deadline_ms| time::Duration::from_millis(deadline_ms.saturating_sub(now_ms)))
    }
}

impl Server {
    /// Equivalent to calling [`Server::bind_with_config`] with default configuration.
    pub fn bind<A>(bind_address: A, registry: MethodRegistry) -> io::Result<Self>
    where
        A: net::ToSocketAddrs,
    {
        Self::bind_with_config(bind_address, registry, Default::default())
    }

    /// Binds a UDP socket at the provided address, and returns a new server object which serves
    /// the functions in `registry`. Errors encountered during socket initialization are
    /// forwarded to the caller.
    pub fn bind_with_config<A>(
        bind_address: A,
        registry: MethodRegistry,
        config: Config,
    ) -> io::Result<Self>
    where
        A: net::ToSocketAddrs,
    {
        config.validate();

        let (socket_tx, socket_rx) = socket::new(bind_address, config.frame_size_max)?;

        log::info!(
            "[Server] listening on {} with {} functions",
            socket_rx.local_addr(),
            registry.len()
        );

        Ok(Self {
            core: ServerCore::new(config, registry),
            epoch: Epoch::new(),
            socket_tx,
            socket_rx,
        })
    }

    /// Waits up to `timeout` for a datagram, handles it, and services any expired timers.
    /// Returns only socket errors.
    pub fn poll(&mut self, timeout: Option<time::Duration>) -> io::Result<()> {
        let now_ms = self.epoch.time_now_ms();

        let wait_timeout = match (timeout, self.core.next_timer_timeout(now_ms)) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };

        if let Some((frame_bytes, addr)) = self.socket_rx.wait_for_frame(wait_timeout)? {
            let now_ms = self.epoch.time_now_ms();
            self.core
                .handle_frame(frame_bytes, addr, now_ms, &mut self.socket_tx);
        }

        let now_ms = self.epoch.time_now_ms();
        self.core.process_timeouts(now_ms, &mut self.socket_tx);

        Ok(())
    }

    /// Serves requests forever. Returns only if the socket fails.
    pub fn serve(&mut self) -> io::Result<()> {
        loop {
            self.poll(None)?;
        }
    }

    /// Serves requests until `stop` is set.
    pub fn serve_until(&mut self, stop: &AtomicBool) -> io::Result<()> {
        while !stop.load(Ordering::Relaxed) {
            self.poll(Some(STOP_CHECK_INTERVAL))?;
        }

        log::info!("[Server] stopped");

        Ok(())
    }

    /// Returns the local address of the internal UDP socket.
    pub fn local_addr(&self) -> net::SocketAddr {
        self.socket_rx.local_addr()
    }

    /// Returns the number of clients heard from recently.
    pub fn peer_count(&self) -> usize {
        self.core.peers.len()
    }

    /// Returns the current buffer hint for the client at `addr`, if it is known.
    pub fn buffer_hint(&self, addr: &net::SocketAddr) -> Option<usize> {
        self.core.peers.get(addr).map(|peer| peer.buffer_hint())
    }

    pub fn registry(&self) -> &MethodRegistry {
        &self.core.registry
    }

    /// Returns a handle which interrupts a blocked [`Server::poll`].
    pub fn waker(&self) -> socket::Waker {
        self.socket_rx.waker()
    }
}
