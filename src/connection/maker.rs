//! Connection maker: which peers to dial, and when.
//!
//! Tracks the set of target addresses this router should keep connections
//! to: the command-line peers, addresses learned from gossiped peer
//! records, and anything added through the control API. Targets that fail
//! to connect back off exponentially with jitter; a forgotten target is
//! dropped without disturbing a live connection.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use rand::Rng;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

/// First retry delay after a failed attempt.
pub const INITIAL_BACKOFF: Duration = Duration::from_secs(5);

/// Ceiling for the exponential backoff.
pub const MAX_BACKOFF: Duration = Duration::from_secs(600);

/// Interval between scheduling passes.
pub const TICK_INTERVAL: Duration = Duration::from_secs(5);

/// Errors from target address parsing.
#[derive(Debug, Error)]
pub enum TargetError {
    #[error("invalid peer address '{0}'")]
    Invalid(String),
}

/// Normalize user input `host[:port]` to `host:port`.
///
/// Bare IPv6 addresses must come bracketed when a port is attached, same
/// as any socket address literal.
pub fn normalize_target(input: &str, default_port: u16) -> Result<String, TargetError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(TargetError::Invalid(input.to_string()));
    }
    // Already a full socket address?
    if trimmed.parse::<SocketAddr>().is_ok() {
        return Ok(trimmed.to_string());
    }
    // host:port where host is a name or IPv4 literal
    if let Some((host, port)) = trimmed.rsplit_once(':') {
        if !host.contains(':') {
            if port.parse::<u16>().is_err() {
                return Err(TargetError::Invalid(input.to_string()));
            }
            if host.is_empty() {
                return Err(TargetError::Invalid(input.to_string()));
            }
            return Ok(trimmed.to_string());
        }
    }
    if trimmed.contains(':') {
        // Unbracketed IPv6 literal.
        return Ok(format!("[{}]:{}", trimmed, default_port));
    }
    Ok(format!("{}:{}", trimmed, default_port))
}

/// Per-target scheduling state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetState {
    /// Eligible for an attempt at the next tick.
    Idle,
    /// A dial is in flight.
    Trying,
    /// Waiting out a backoff delay.
    Backoff,
}

impl fmt::Display for TargetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TargetState::Idle => "idle",
            TargetState::Trying => "trying",
            TargetState::Backoff => "backoff",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug)]
struct Target {
    state: TargetState,
    attempts: u32,
    next_attempt_at: Instant,
}

impl Target {
    fn new() -> Self {
        Target { state: TargetState::Idle, attempts: 0, next_attempt_at: Instant::now() }
    }

    /// Exponential backoff with +/-20% jitter, capped.
    fn backoff_delay(attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(20);
        let base = INITIAL_BACKOFF
            .saturating_mul(1u32.checked_shl(exponent).unwrap_or(u32::MAX))
            .min(MAX_BACKOFF);
        let jitter = rand::thread_rng().gen_range(0.8..=1.2);
        base.mul_f64(jitter)
    }
}

/// One target's externally visible state, for `/status`.
#[derive(Clone, Debug, Serialize)]
pub struct TargetStatus {
    pub address: String,
    pub state: TargetState,
    pub attempts: u32,
}

/// The retry/backoff state machine over target addresses.
///
/// Pure bookkeeping: the router performs the dials and reports outcomes
/// back in.
pub struct ConnectionMaker {
    targets: HashMap<String, Target>,
}

impl ConnectionMaker {
    pub fn new() -> Self {
        ConnectionMaker { targets: HashMap::new() }
    }

    /// Add a target; duplicates are a no-op. Returns true when new.
    pub fn add_target(&mut self, address: String) -> bool {
        if self.targets.contains_key(&address) {
            return false;
        }
        debug!(%address, "new connection target");
        self.targets.insert(address, Target::new());
        true
    }

    /// Remove a target. A live connection to it is left to die naturally.
    pub fn forget(&mut self, address: &str) -> bool {
        self.targets.remove(address).is_some()
    }

    pub fn is_target(&self, address: &str) -> bool {
        self.targets.contains_key(address)
    }

    /// Targets due for a dial, given the set of addresses we already have
    /// connections (pending or established) to. Marks them trying.
    pub fn due_targets(&mut self, now: Instant, connected: &dyn Fn(&str) -> bool) -> Vec<String> {
        let mut due = Vec::new();
        for (address, target) in &mut self.targets {
            if connected(address) {
                continue;
            }
            match target.state {
                TargetState::Trying => continue,
                TargetState::Backoff if now < target.next_attempt_at => continue,
                _ => {}
            }
            target.state = TargetState::Trying;
            due.push(address.clone());
        }
        due
    }

    /// A dial (or the connection it produced) succeeded to established.
    pub fn attempt_succeeded(&mut self, address: &str) {
        if let Some(target) = self.targets.get_mut(address) {
            target.attempts = 0;
            target.state = TargetState::Idle;
        }
    }

    /// A dial failed, or the connection failed before establishment.
    pub fn attempt_failed(&mut self, address: &str, now: Instant) {
        if let Some(target) = self.targets.get_mut(address) {
            target.attempts += 1;
            let delay = Target::backoff_delay(target.attempts);
            target.state = TargetState::Backoff;
            target.next_attempt_at = now + delay;
            debug!(
                %address,
                attempts = target.attempts,
                delay_secs = delay.as_secs(),
                "connection attempt failed, backing off"
            );
        }
    }

    /// An established connection to a target address went away; retry at
    /// the next tick without backoff.
    pub fn connection_terminated(&mut self, address: &str) {
        if let Some(target) = self.targets.get_mut(address) {
            target.state = TargetState::Idle;
        }
    }

    /// Snapshot for status reporting, sorted by address.
    pub fn status(&self) -> Vec<TargetStatus> {
        let mut out: Vec<TargetStatus> = self
            .targets
            .iter()
            .map(|(address, t)| TargetStatus {
                address: address.clone(),
                state: t.state,
                attempts: t.attempts,
            })
            .collect();
        out.sort_by(|a, b| a.address.cmp(&b.address));
        out
    }
}

impl Default for ConnectionMaker {
    fn default() -> Self {
        Self::new()
    }
}
