//! Acknowledgment engine.
//!
//! A call moves through the phases below. Both waiting phases resend the request when their timer
//! expires, sharing one attempt budget. The server answers a request it has already executed from
//! its response cache, so a slow handler or a lost response never runs the handler twice.
//!
//! ```text
//!   Idle --admit--> Sending --sent--> AwaitingAck --ACK--> AwaitingResponse --response--> Complete
//!                      ^                  |                       |
//!                      +---- timeout -----+-----------------------+
//!                      (attempts < max)   |                       |
//!                                         +-- attempts == max --> Failed(NoAck)
//!                                                                 +-- attempts == max --> Failed(NoResponse)
//! ```
//!
//! When the server batches its ACKs, the client cannot wait for a per-request ACK. Calls are then
//! pipelined: a sent call goes straight to `AwaitingResponse`, and a response timeout retransmits
//! the request until the attempt budget is exhausted.
//!
//! ACK frames carry no sequence number. An ACK is credited to the oldest call of the peer still
//! awaiting one, and in the same way to the oldest response delivery on the server side.

use std::net;

use crate::codec::{ResponseEnvelope, ACK_FRAME};
use crate::socket::FrameSink;

/// How the server acknowledges requests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AckPolicy {
    /// Every request is acknowledged before its handler runs.
    PerRequest,
    /// Every n-th request of a peer is acknowledged, after its response has been sent.
    Batched(u32),
}

impl AckPolicy {
    /// Interprets an `ACK_BATCH` setting, where 1 means every request is acknowledged.
    pub fn from_batch(batch: u32) -> Self {
        if batch <= 1 {
            AckPolicy::PerRequest
        } else {
            AckPolicy::Batched(batch)
        }
    }

    pub fn is_pipelined(&self) -> bool {
        matches!(self, AckPolicy::Batched(_))
    }
}

impl Default for AckPolicy {
    fn default() -> Self {
        AckPolicy::PerRequest
    }
}

/// Timing and attempt limits shared by the client and server halves.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub ack_timeout_ms: u64,
    pub max_retries: u32,
    pub response_timeout_ms: u64,
    pub pipelined: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallPhase {
    Idle,
    Sending,
    AwaitingAck,
    AwaitingResponse,
    Complete,
    Failed,
}

/// Why a call gave up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureReason {
    /// No acknowledgment after the last attempt.
    NoAck,
    /// The request was acknowledged, but no response followed in time.
    NoResponse,
}

#[derive(Debug, PartialEq, Eq)]
pub enum TimerOutcome {
    /// The timer has not expired yet.
    Pending,
    Retransmitted,
    Failed(FailureReason),
}

#[derive(Debug, PartialEq, Eq)]
pub enum ResponseOutcome {
    /// The response completed this call. The flag is set if it also stood in for a missing ACK.
    Accepted { implied_ack: bool },
    /// The response belongs to some other call, or this call is not waiting for one.
    Rejected,
}

/// Client-side record of one outstanding call.
#[derive(Debug)]
pub struct PendingCall {
    sequence: u64,
    frame: Box<[u8]>,
    phase: CallPhase,
    attempts_made: u32,
    deadline_ms: Option<u64>,
    window_credit: usize,
    created_ms: u64,
}

impl PendingCall {
    pub fn new(sequence: u64, frame: Box<[u8]>, created_ms: u64) -> Self {
        Self {
            sequence,
            frame,
            phase: CallPhase::Idle,
            attempts_made: 0,
            deadline_ms: None,
            window_credit: 0,
            created_ms,
        }
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn phase(&self) -> CallPhase {
        self.phase
    }

    pub fn attempts_made(&self) -> u32 {
        self.attempts_made
    }

    pub fn deadline_ms(&self) -> Option<u64> {
        self.deadline_ms
    }

    pub fn created_ms(&self) -> u64 {
        self.created_ms
    }

    /// Admits an idle call and sends its first attempt.
    pub fn start(
        &mut self,
        window_credit: usize,
        now_ms: u64,
        policy: &RetryPolicy,
        ctx: &mut impl FrameSink,
        addr: &net::SocketAddr,
    ) {
        debug_assert_eq!(self.phase, CallPhase::Idle);

        self.window_credit = window_credit;
        self.transmit(now_ms, policy, ctx, addr);
    }

    fn transmit(
        &mut self,
        now_ms: u64,
        policy: &RetryPolicy,
        ctx: &mut impl FrameSink,
        addr: &net::SocketAddr,
    ) {
        self.phase = CallPhase::Sending;
        self.attempts_made += 1;

        log::trace!(
            "[PendingCall {}] sending attempt {}/{} (admitted at window {})",
            self.sequence,
            self.attempts_made,
            policy.max_retries,
            self.window_credit
        );

        ctx.send_frame(&self.frame, addr);

        self.phase = if policy.pipelined {
            CallPhase::AwaitingResponse
        } else {
            CallPhase::AwaitingAck
        };
        self.deadline_ms = Some(now_ms + policy.ack_timeout_ms);
    }

    /// Handles an ACK credited to this call. Returns true if the call was waiting for one.
    pub fn on_ack(&mut self, now_ms: u64, policy: &RetryPolicy) -> bool {
        if self.phase != CallPhase::AwaitingAck {
            return false;
        }

        self.phase = CallPhase::AwaitingResponse;
        self.deadline_ms = Some(now_ms + policy.response_timeout_ms);

        true
    }

    /// Offers a response to this call.
    pub fn on_response(&mut self, response: &ResponseEnvelope) -> ResponseOutcome {
        if crate::sequence::validate(self.sequence, response.sequence_number).is_err() {
            return ResponseOutcome::Rejected;
        }

        let implied_ack = match self.phase {
            CallPhase::AwaitingAck => true,
            CallPhase::AwaitingResponse => false,
            _ => return ResponseOutcome::Rejected,
        };

        self.phase = CallPhase::Complete;
        self.deadline_ms = None;

        ResponseOutcome::Accepted { implied_ack }
    }

    /// Fires the timer if it has expired, retransmitting or failing the call.
    pub fn on_timer(
        &mut self,
        now_ms: u64,
        policy: &RetryPolicy,
        ctx: &mut impl FrameSink,
        addr: &net::SocketAddr,
    ) -> TimerOutcome {
        match self.deadline_ms {
            Some(deadline_ms) if now_ms >= deadline_ms => (),
            _ => return TimerOutcome::Pending,
        }

        let awaited = match self.phase {
            CallPhase::AwaitingAck => "ack",
            CallPhase::AwaitingResponse => "response",
            _ => return TimerOutcome::Pending,
        };

        // A resent request that already ran is answered from the server's response cache
        if self.attempts_made < policy.max_retries {
            log::warn!(
                "[PendingCall {}] no {} after attempt {}, resending",
                self.sequence,
                awaited,
                self.attempts_made
            );

            self.transmit(now_ms, policy, ctx, addr);

            return TimerOutcome::Retransmitted;
        }

        let reason = if self.phase == CallPhase::AwaitingAck || policy.pipelined {
            FailureReason::NoAck
        } else {
            FailureReason::NoResponse
        };

        self.phase = CallPhase::Failed;
        self.deadline_ms = None;

        TimerOutcome::Failed(reason)
    }
}

/// Server-side record of a response which must be acknowledged by the client.
#[derive(Debug)]
pub struct ResponseDelivery {
    sequence: u64,
    frame: Box<[u8]>,
    attempts_made: u32,
    deadline_ms: u64,
}

impl ResponseDelivery {
    /// Tracks a response whose first transmission happened at `now_ms`.
    pub fn sent(sequence: u64, frame: Box<[u8]>, now_ms: u64, policy: &RetryPolicy) -> Self {
        Self {
            sequence,
            frame,
            attempts_made: 1,
            deadline_ms: now_ms + policy.ack_timeout_ms,
        }
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn attempts_made(&self) -> u32 {
        self.attempts_made
    }

    pub fn deadline_ms(&self) -> u64 {
        self.deadline_ms
    }

    /// Sends the response again immediately and restarts its timer, without spending an attempt.
    pub fn resend(
        &mut self,
        now_ms: u64,
        policy: &RetryPolicy,
        ctx: &mut impl FrameSink,
        addr: &net::SocketAddr,
    ) {
        ctx.send_frame(&self.frame, addr);
        self.deadline_ms = now_ms + policy.ack_timeout_ms;
    }

    pub fn on_timer(
        &mut self,
        now_ms: u64,
        policy: &RetryPolicy,
        ctx: &mut impl FrameSink,
        addr: &net::SocketAddr,
    ) -> TimerOutcome {
        if now_ms < self.deadline_ms {
            return TimerOutcome::Pending;
        }

        if self.attempts_made >= policy.max_retries {
            return TimerOutcome::Failed(FailureReason::NoAck);
        }

        self.attempts_made += 1;

        log::warn!(
            "[ResponseDelivery {}] no ack from {}, resending attempt {}/{}",
            self.sequence,
            addr,
            self.attempts_made,
            policy.max_retries
        );

        ctx.send_frame(&self.frame, addr);
        self.deadline_ms = now_ms + policy.ack_timeout_ms;

        TimerOutcome::Retransmitted
    }
}

/// Decides which requests of a peer are acknowledged.
#[derive(Clone, Debug)]
pub struct AckBatcher {
    policy: AckPolicy,
    request_count: u64,
}

impl AckBatcher {
    pub fn new(policy: AckPolicy) -> Self {
        Self {
            policy,
            request_count: 0,
        }
    }

    /// Counts a new request. Returns true if an ACK should be sent for it.
    pub fn on_request(&mut self) -> bool {
        self.request_count += 1;

        match self.policy {
            AckPolicy::PerRequest => true,
            AckPolicy::Batched(batch) => self.request_count % batch as u64 == 0,
        }
    }

    pub fn request_count(&self) -> u64 {
        self.request_count
    }
}

pub fn send_ack(ctx: &mut impl FrameSink, addr: &net::SocketAddr) {
    ctx.send_frame(ACK_FRAME, addr);
}
