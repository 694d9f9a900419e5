//! Retransmission policy: exponential backoff with jitter, panic
//! escalation, and the media-list walk.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use rand::Rng;

#[derive(Debug, Clone, Copy)]
pub struct RetransmitConfig {
    pub initial_interval: Duration,
    pub backoff_cutoff: Duration,
    /// Per-state panic timeout — total wall-clock budget for the exchange.
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct RetransmitState {
    pub first_sending: Instant,
    pub interval: Duration,
}

impl RetransmitState {
    pub fn start(now: Instant) -> Self {
        Self { first_sending: now, interval: Duration::ZERO }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetransmitOutcome {
    /// Panic timeout reached: the caller abandons the exchange.
    Panic,
    /// The media list has an untried entry; the caller should invoke the
    /// configurator with reason `MEDIUM` for it before the next send.
    AdvanceMedium(String),
    /// Retransmit now; the next tick should be scheduled `next_interval`
    /// from `now`, landing at `next_tick`.
    Retransmit { next_interval: Duration, next_tick: Instant },
}

/// Advance the retransmission state machine by one tick.
///
/// `media` is consumed front-to-back: each call that still has an
/// un-walked medium and has not yet received any offer returns
/// `AdvanceMedium` instead of backing off further. Once `media` is empty
/// (or the caller has already received an offer), normal exponential
/// backoff resumes.
pub fn tick(
    state: &mut RetransmitState,
    now: Instant,
    cfg: &RetransmitConfig,
    media: &mut VecDeque<String>,
    offer_received: bool,
    rng: &mut impl Rng,
) -> RetransmitOutcome {
    if now.saturating_duration_since(state.first_sending) > cfg.timeout {
        return RetransmitOutcome::Panic;
    }

    if !offer_received {
        if let Some(next_medium) = media.pop_front() {
            return RetransmitOutcome::AdvanceMedium(next_medium);
        }
    }

    if state.interval.is_zero() {
        state.interval = cfg.initial_interval;
    } else {
        let span = 2 * state.interval.as_millis().max(1) as u64;
        let jitter_ms = rng.random_range(0..span);
        state.interval += Duration::from_millis(jitter_ms);
    }

    if state.interval > cfg.backoff_cutoff {
        let half = cfg.backoff_cutoff / 2;
        let jitter = rng.random_range(0..cfg.backoff_cutoff.as_millis().max(1) as u64);
        state.interval = half + Duration::from_millis(jitter);
    }

    let panic_point = state.first_sending + cfg.timeout;
    if now + state.interval > panic_point {
        state.interval = panic_point.saturating_duration_since(now) + Duration::from_secs(1);
    }

    // Microsecond-level jitter on the scheduled wakeup itself, distinct
    // from the interval jitter above — avoids every client on the link
    // waking at exactly the same instant.
    let micros = rng.random_range(0..1_000u64);
    let next_tick = now + state.interval + Duration::from_micros(micros);

    RetransmitOutcome::Retransmit { next_interval: state.interval, next_tick }
}

/// Destination choice for an outbound REQUEST.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    Broadcast,
    Unicast,
}

pub fn request_destination(
    state_is_requesting_or_rebooting: bool,
    now_after_rebind: bool,
) -> Destination {
    if state_is_requesting_or_rebooting || now_after_rebind {
        Destination::Broadcast
    } else {
        Destination::Unicast
    }
}
