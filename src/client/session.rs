use std::collections::{BTreeMap, VecDeque};
use std::net;
use std::sync::Arc;
use std::time;

use parking_lot::Mutex;

use super::{Call, CallError, Config, Reply};
use crate::ack::{self, CallPhase, PendingCall, ResponseOutcome, RetryPolicy, TimerOutcome};
use crate::codec::{self, Frame};
use crate::flow::FlowState;
use crate::sequence::SequenceMismatch;
use crate::socket::FrameSink;

pub type FlowRef = Arc<Mutex<FlowState>>;

/// Socket-free client state: every outstanding call of one session and the window governing
/// them. Time is passed in by the caller, in milliseconds.
pub struct ClientCore {
    config: Config,
    policy: RetryPolicy,
    server_addr: net::SocketAddr,
    // Shared with handles which report the window size
    flow: FlowRef,
    // Admitted calls, keyed by sequence
    pending: BTreeMap<u64, PendingCall>,
    // Calls waiting for window space, in issue order
    backlog: VecDeque<PendingCall>,
    // Settled calls not yet collected
    completions: VecDeque<(u64, Result<Reply, CallError>)>,
}

impl ClientCore {
    pub fn new(config: Config, server_addr: net::SocketAddr) -> Self {
        let flow = FlowState::new(config.initial_window_size, config.window_size_max);

        Self {
            policy: config.retry_policy(),
            config,
            server_addr,
            flow: Arc::new(Mutex::new(flow)),
            pending: BTreeMap::new(),
            backlog: VecDeque::new(),
            completions: VecDeque::new(),
        }
    }

    pub fn flow_ref(&self) -> FlowRef {
        Arc::clone(&self.flow)
    }

    pub fn window_size(&self) -> usize {
        self.flow.lock().window_size()
    }

    /// Number of calls sent and not yet settled.
    #[cfg(test)]
    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }

    #[cfg(test)]
    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    #[cfg(test)]
    pub fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.backlog.is_empty()
    }

    /// Encodes a new call and sends it as soon as the window allows.
    pub fn issue(&mut self, sequence: u64, call: &Call, now_ms: u64, ctx: &mut impl FrameSink) {
        let frame = match call.envelope(sequence).encode(self.config.frame_size_max) {
            Ok(frame) => frame,
            Err(source) => {
                log::warn!("[Client] call {} not sent: {}", sequence, source);
                self.completions
                    .push_back((sequence, Err(CallError::Encode { sequence, source })));
                return;
            }
        };

        log::trace!(
            "[Client] issuing call {} to '{}'",
            sequence,
            call.function_name()
        );

        self.backlog
            .push_back(PendingCall::new(sequence, frame, now_ms));

        self.admit(now_ms, ctx);
    }

    /// Moves backlogged calls into flight while the window has room.
    fn admit(&mut self, now_ms: u64, ctx: &mut impl FrameSink) {
        let window_size = {
            let flow = self.flow.lock();

            if !flow.admits(self.pending.len()) {
                return;
            }

            flow.window_size()
        };

        while self.pending.len() < window_size {
            let mut call = match self.backlog.pop_front() {
                Some(call) => call,
                None => break,
            };

            call.start(window_size, now_ms, &self.policy, ctx, &self.server_addr);

            self.pending.insert(call.sequence(), call);
        }
    }

    pub fn handle_frame(&mut self, frame_bytes: &[u8], now_ms: u64, ctx: &mut impl FrameSink) {
        let frame = match codec::decode(frame_bytes) {
            Ok(frame) => frame,
            Err(err) => {
                log::warn!("[Client] dropping malformed frame: {}", err);
                return;
            }
        };

        match frame {
            Frame::Ack => self.handle_ack(now_ms),
            Frame::Response(response) => self.handle_response(response, now_ms, ctx),
            Frame::Call(call) => {
                log::warn!(
                    "[Client] dropping unexpected call frame {}",
                    call.sequence_number
                );
            }
        }

        self.admit(now_ms, ctx);
    }

    fn handle_ack(&mut self, now_ms: u64) {
        if self.policy.pipelined {
            log::trace!("[Client] ignoring batched ack");
            return;
        }

        let policy = self.policy;

        let call = self
            .pending
            .values_mut()
            .find(|call| call.phase() == CallPhase::AwaitingAck);

        match call {
            Some(call) => {
                call.on_ack(now_ms, &policy);

                let mut flow = self.flow.lock();
                flow.on_success(now_ms);

                log::debug!(
                    "[Client] call {} acknowledged, window {} after {} successes",
                    call.sequence(),
                    flow.window_size(),
                    flow.consecutive_successes()
                );
            }
            None => {
                log::debug!("[Client] ack with no call awaiting one");
            }
        }
    }

    fn handle_response(
        &mut self,
        response: codec::ResponseEnvelope,
        now_ms: u64,
        ctx: &mut impl FrameSink,
    ) {
        let sequence = response.sequence_number;

        // Stale duplicates are acknowledged too, so the server stops resending them
        if self.config.response_ack {
            ack::send_ack(ctx, &self.server_addr);
        }

        let outcome = match self.pending.get_mut(&sequence) {
            Some(call) => call.on_response(&response),
            None => ResponseOutcome::Rejected,
        };

        match outcome {
            ResponseOutcome::Accepted { implied_ack } => {
                if implied_ack || self.policy.pipelined {
                    self.flow.lock().on_success(now_ms);
                }

                if let Some(call) = self.pending.remove(&sequence) {
                    log::debug!(
                        "[Client] call {} complete after {} attempts",
                        sequence,
                        call.attempts_made()
                    );

                    let reply = Reply {
                        sequence,
                        attempts: call.attempts_made(),
                        elapsed: time::Duration::from_millis(
                            now_ms.saturating_sub(call.created_ms()),
                        ),
                        result: response.result,
                    };

                    self.completions.push_back((sequence, Ok(reply)));
                }
            }
            ResponseOutcome::Rejected => {
                let mismatch = SequenceMismatch {
                    expected: self.pending.keys().next().copied(),
                    received: sequence,
                };

                log::warn!("[Client] discarding response: {}", mismatch);
            }
        }
    }

    /// Fires every expired timer.
    pub fn process_timeouts(&mut self, now_ms: u64, ctx: &mut impl FrameSink) {
        let policy = self.policy;
        let mut failed = Vec::new();

        for (&sequence, call) in self.pending.iter_mut() {
            match call.on_timer(now_ms, &policy, ctx, &self.server_addr) {
                TimerOutcome::Pending => (),
                TimerOutcome::Retransmitted => {
                    shrink_window(&self.flow, now_ms);
                }
                TimerOutcome::Failed(reason) => {
                    shrink_window(&self.flow, now_ms);
                    failed.push((sequence, call.attempts_made(), reason));
                }
            }
        }

        for (sequence, attempts, reason) in failed {
            log::warn!(
                "[Client] call {} failed after {} attempts: {:?}",
                sequence,
                attempts,
                reason
            );

            self.pending.remove(&sequence);
            self.completions.push_back((
                sequence,
                Err(CallError::DeliveryFailed {
                    sequence,
                    attempts,
                    reason,
                }),
            ));
        }

        self.admit(now_ms, ctx);
    }

    /// Returns the time remaining until the next timer expires.
    pub fn next_timer_timeout(&self, now_ms: u64) -> Option<time::Duration> {
        self.pending
            .values()
            .filter_map(|call| call.deadline_ms())
            .min()
            .map(|deadline_ms| time::Duration::from_millis(deadline_ms.saturating_sub(now_ms)))
    }

    /// Forgets a call, stopping any further retransmission. Returns true if the call was still
    /// unsettled.
    pub fn abandon(&mut self, sequence: u64, now_ms: u64, ctx: &mut impl FrameSink) -> bool {
        let found = if self.pending.remove(&sequence).is_some() {
            true
        } else if let Some(idx) = self.backlog.iter().position(|c| c.sequence() == sequence) {
            self.backlog.remove(idx);
            true
        } else {
            false
        };

        if found {
            log::debug!("[Client] call {} abandoned", sequence);
            self.admit(now_ms, ctx);
        }

        found
    }

    /// Removes and returns the outcome of `sequence`, if it has settled.
    pub fn take_completion(&mut self, sequence: u64) -> Option<Result<Reply, CallError>> {
        let idx = self.completions.iter().position(|(s, _)| *s == sequence)?;

        self.completions.remove(idx).map(|(_, result)| result)
    }

    pub fn pop_completion(&mut self) -> Option<(u64, Result<Reply, CallError>)> {
        self.completions.pop_front()
    }
}

fn shrink_window(flow: &FlowRef, now_ms: u64) {
    let mut flow = flow.lock();
    flow.on_failure(now_ms);

    log::debug!(
        "[Client] window {} after {} timeouts (adjusted at {}ms)",
        flow.window_size(),
        flow.consecutive_failures(),
        flow.last_adjustment_ms()
    );
}
