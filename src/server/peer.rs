use std::collections::VecDeque;
use std::net;

use crate::ack::{self, AckBatcher, AckPolicy, ResponseDelivery, RetryPolicy, TimerOutcome};
use crate::codec::{EncodeError, RemoteError, ResponseEnvelope, RpcResult};
use crate::flow::BufferSizer;
use crate::socket::FrameSink;

use super::Config;

/// Per-client server state.
pub struct Peer {
    // Remote address
    addr: net::SocketAddr,
    // Decides which requests are acknowledged
    ack_batcher: AckBatcher,
    // Advisory receive buffer hint
    buffer: BufferSizer,
    // Recently sent responses, oldest first
    recent: VecDeque<(u64, Box<[u8]>)>,
    // Responses awaiting acknowledgment, oldest first
    deliveries: VecDeque<ResponseDelivery>,
    // Time of the last datagram from this peer
    last_seen_ms: u64,
}

impl Peer {
    pub fn new(addr: net::SocketAddr, config: &Config, now_ms: u64) -> Self {
        Self {
            addr,
            ack_batcher: AckBatcher::new(config.ack_policy),
            buffer: BufferSizer::new(config.base_buffer_size, config.max_buffer_size),
            recent: VecDeque::new(),
            deliveries: VecDeque::new(),
            last_seen_ms: now_ms,
        }
    }

    pub fn touch(&mut self, now_ms: u64) {
        self.last_seen_ms = now_ms;
    }

    pub fn buffer_hint(&self) -> usize {
        self.buffer.current()
    }

    #[cfg(test)]
    pub fn delivery_count(&self) -> usize {
        self.deliveries.len()
    }

    pub fn idle_deadline_ms(&self, config: &Config) -> u64 {
        self.last_seen_ms + config.peer_idle_timeout_ms
    }

    /// Earliest time at which this peer needs attention.
    pub fn next_deadline_ms(&self, config: &Config) -> u64 {
        self.deliveries
            .iter()
            .map(|delivery| delivery.deadline_ms())
            .fold(self.idle_deadline_ms(config), u64::min)
    }

    fn remember(&mut self, sequence: u64, frame: Box<[u8]>, cache_len: usize) {
        if cache_len == 0 {
            return;
        }

        while self.recent.len() >= cache_len {
            self.recent.pop_front();
        }

        self.recent.push_back((sequence, frame));
    }

    /// Answers a request. `execute` runs only if no response to `sequence` was sent recently.
    pub fn handle_request<F>(
        &mut self,
        sequence: u64,
        now_ms: u64,
        config: &Config,
        policy: &RetryPolicy,
        ctx: &mut impl FrameSink,
        execute: F,
    ) where
        F: FnOnce() -> RpcResult,
    {
        let hint = self.buffer.on_request();

        log::trace!(
            "[Server] request {} from {}, buffer hint {}",
            sequence,
            self.addr,
            hint
        );

        let per_request_ack = config.ack_policy == AckPolicy::PerRequest;

        let cached = self
            .recent
            .iter()
            .rev()
            .find(|(s, _)| *s == sequence)
            .map(|(_, frame)| frame);

        if let Some(frame) = cached {
            log::debug!(
                "[Server] duplicate request {} from {}, resending response",
                sequence,
                self.addr
            );

            if per_request_ack {
                ack::send_ack(ctx, &self.addr);
            }

            let addr = self.addr;

            match self
                .deliveries
                .iter_mut()
                .find(|delivery| delivery.sequence() == sequence)
            {
                Some(delivery) => delivery.resend(now_ms, policy, ctx, &addr),
                None => ctx.send_frame(frame, &addr),
            }

            return;
        }

        let batch_ack = self.ack_batcher.on_request();

        if per_request_ack {
            ack::send_ack(ctx, &self.addr);
        }

        let response = ResponseEnvelope {
            result: execute(),
            sequence_number: sequence,
        };

        let frame = match encode_response(response, config.frame_size_max) {
            Some(frame) => frame,
            None => return,
        };

        ctx.send_frame(&frame, &self.addr);

        if config.response_ack {
            self.deliveries
                .push_back(ResponseDelivery::sent(sequence, frame.clone(), now_ms, policy));
        }

        self.remember(sequence, frame, config.response_cache_len);

        if !per_request_ack && batch_ack {
            log::trace!(
                "[Server] batched ack after {} requests from {}",
                self.ack_batcher.request_count(),
                self.addr
            );

            ack::send_ack(ctx, &self.addr);
        }
    }

    /// Credits an ACK to the oldest unacknowledged response.
    pub fn handle_ack(&mut self) -> Option<u64> {
        self.deliveries.pop_front().map(|delivery| delivery.sequence())
    }

    /// Resends or gives up on expired response deliveries.
    pub fn process_timeouts(&mut self, now_ms: u64, policy: &RetryPolicy, ctx: &mut impl FrameSink) {
        let addr = self.addr;

        self.deliveries.retain_mut(|delivery| {
            match delivery.on_timer(now_ms, policy, ctx, &addr) {
                TimerOutcome::Pending | TimerOutcome::Retransmitted => true,
                TimerOutcome::Failed(_) => {
                    log::warn!(
                        "[Server] response {} to {} unacknowledged after {} attempts",
                        delivery.sequence(),
                        addr,
                        delivery.attempts_made()
                    );
                    false
                }
            }
        });
    }
}

// An oversized result is replaced by an error the caller can see.
fn encode_response(response: ResponseEnvelope, frame_size_max: usize) -> Option<Box<[u8]>> {
    let sequence_number = response.sequence_number;

    let err = match response.encode(frame_size_max) {
        Ok(frame) => return Some(frame),
        Err(err) => err,
    };

    log::warn!("[Server] response {} not sendable: {}", sequence_number, err);

    let message = match err {
        EncodeError::Oversized { size, limit } => {
            format!("result of {} bytes exceeds the {} byte frame limit", size, limit)
        }
        EncodeError::Json(err) => format!("result could not be serialized: {}", err),
    };

    let fallback = ResponseEnvelope {
        result: Err(RemoteError::HandlerError(message)),
        sequence_number,
    };

    match fallback.encode(frame_size_max) {
        Ok(frame) => Some(frame),
        Err(err) => {
            log::error!("[Server] response {} dropped: {}", sequence_number, err);
            None
        }
    }
}
