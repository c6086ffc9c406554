//! Connection lifecycle state machine for clients.
//!
//! Retries are driven by explicit state transitions, not callbacks: the
//! embedding client reports what happened (`connect`, `connection_opened`,
//! `connection_lost`, `retry_failed`) and acts on what comes back (a delay to
//! sleep before the next attempt, or `None` once attempts are exhausted).
//!
//! In-flight operations are guarded by the connection epoch: a history load
//! or send started under one connection is abandoned when that connection
//! dies, never retried transparently. The caller re-issues after reconnect,
//! reusing the idempotency key for sends.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use uuid::Uuid;

use crate::config::ReconnectConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// What to replay after reconnecting: for each conversation the client has
/// open, everything past the last sequence it saw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeRequest {
    pub conversation_id: Uuid,
    pub after_sequence: i64,
}

/// Ticket for one in-flight operation. Valid only while the connection it was
/// started under is still the live one.
#[derive(Debug, Clone, Copy)]
pub struct OperationGuard {
    epoch: u64,
}

pub struct ReconnectionManager {
    state: ConnectionState,
    policy: ReconnectConfig,
    attempt: u32,
    epoch: u64,
    connected_at: Option<Instant>,
    cursors: HashMap<Uuid, i64>,
    rng: StdRng,
}

impl ReconnectionManager {
    pub fn new(policy: ReconnectConfig) -> Self {
        Self::with_seed(policy, rand::thread_rng().gen())
    }

    /// Deterministic variant for tests.
    pub fn with_seed(policy: ReconnectConfig, seed: u64) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            policy,
            attempt: 0,
            epoch: 0,
            connected_at: None,
            cursors: HashMap::new(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// The client is about to dial. Valid from `Disconnected` (first connect,
    /// or user-initiated after giving up) and `Reconnecting` (scheduled
    /// retry).
    pub fn connect(&mut self) {
        match self.state {
            ConnectionState::Disconnected | ConnectionState::Reconnecting => {
                self.state = ConnectionState::Connecting;
            }
            _ => {}
        }
    }

    pub fn connection_opened(&mut self, now: Instant) {
        self.state = ConnectionState::Connected;
        self.epoch += 1;
        self.connected_at = Some(now);
    }

    /// Network loss while connected. Returns the delay before the next
    /// attempt, or `None` when attempts are exhausted and the machine parks
    /// in `Disconnected`.
    pub fn connection_lost(&mut self, now: Instant) -> Option<Duration> {
        if self.state == ConnectionState::Connected {
            let held = self
                .connected_at
                .map(|at| now.duration_since(at))
                .unwrap_or_default();
            if held >= self.policy.stable_after {
                self.attempt = 0;
            }
        }
        self.connected_at = None;
        self.next_attempt()
    }

    /// A dial that never completed. Same bookkeeping as a lost connection.
    pub fn retry_failed(&mut self) -> Option<Duration> {
        self.next_attempt()
    }

    fn next_attempt(&mut self) -> Option<Duration> {
        self.attempt += 1;
        if self.attempt > self.policy.max_attempts {
            self.state = ConnectionState::Disconnected;
            self.attempt = 0;
            return None;
        }
        self.state = ConnectionState::Reconnecting;
        Some(self.backoff_delay())
    }

    /// Exponential backoff with jitter: the deterministic exponential term is
    /// capped, then jittered into [exp/2, exp] so herds of clients spread out
    /// while growth stays monotonic.
    fn backoff_delay(&mut self) -> Duration {
        let base_ms = self.policy.base.as_millis() as f64;
        let cap_ms = self.policy.cap.as_millis() as f64;
        let exp_ms = (base_ms * self.policy.factor.powi(self.attempt.saturating_sub(1) as i32))
            .min(cap_ms)
            .max(1.0);
        let half = exp_ms / 2.0;
        let jittered = half + self.rng.gen_range(0.0..=half);
        Duration::from_millis(jittered as u64)
    }

    /// Record the highest sequence seen for a conversation. Cursors only move
    /// forward; an out-of-order or abandoned history load cannot drag one
    /// back.
    pub fn record_sequence(&mut self, conversation_id: Uuid, sequence: i64) {
        let cursor = self.cursors.entry(conversation_id).or_insert(0);
        if sequence > *cursor {
            *cursor = sequence;
        }
    }

    pub fn cursor(&self, conversation_id: Uuid) -> Option<i64> {
        self.cursors.get(&conversation_id).copied()
    }

    /// Resume requests for every conversation with local state, issued after
    /// each reconnect instead of a full reload.
    pub fn resume_requests(&self) -> Vec<ResumeRequest> {
        let mut requests: Vec<ResumeRequest> = self
            .cursors
            .iter()
            .map(|(conversation_id, after_sequence)| ResumeRequest {
                conversation_id: *conversation_id,
                after_sequence: *after_sequence,
            })
            .collect();
        requests.sort_by_key(|r| r.conversation_id);
        requests
    }

    /// Starts an operation tied to the current connection; `None` while not
    /// connected.
    pub fn begin_operation(&self) -> Option<OperationGuard> {
        if self.state == ConnectionState::Connected {
            Some(OperationGuard { epoch: self.epoch })
        } else {
            None
        }
    }

    /// An operation result is only applied when its guard is still current;
    /// anything started under a previous connection is abandoned.
    pub fn is_current(&self, guard: &OperationGuard) -> bool {
        self.state == ConnectionState::Connected && guard.epoch == self.epoch
    }
}
