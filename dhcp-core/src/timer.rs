//! Timer/dispatch: a cooperative scheduling primitive keyed by
//! `(client, tag)` rather than by code-pointer identity, so timers stay
//! comparable and cancellable across process boundaries without needing
//! raw pointers.
//!
//! `Dispatcher` itself is synchronous and does no I/O: it only tracks
//! "what fires when". The actual wait loop (socket recv interleaved with
//! timer wakeups) lives in `dhclient::orchestrator`, which is the only
//! place in the system allowed to touch a clock or a socket directly;
//! everything in `dhcp-core` is driven by values passed in.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::Instant;

pub type ClientId = u32;

/// Per-client timer identity. One pending entry per `(ClientId, TimerTag)`
/// pair may exist at a time; scheduling the same pair again replaces the
/// prior entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerTag {
    /// The one tag `machine::Client` never schedules itself: the
    /// orchestrator's initial per-interface kick (the startup
    /// `initial_delay` jitter), fired once at startup to choose between
    /// `enter_init` and `start_reboot` depending on whether a saved lease
    /// was found. Not passed to `Client::on_timer`.
    Start,
    SendDiscover,
    SelectTimeout,
    SendRequest,
    StateBound,
    Panic,
    Decline,
    RebootTimeout,
    Retry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Entry {
    when: Instant,
    seq: u64,
    client: ClientId,
    tag: TimerTag,
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.when, self.seq).cmp(&(other.when, other.seq))
    }
}

/// A min-heap of pending timer firings. Cancellation is lazy: cancelled
/// entries are marked in a parallel generation map and skipped when
/// popped, rather than removed from the heap in place (which `BinaryHeap`
/// doesn't support efficiently), so `cancel`/`schedule_replacing` stay
/// O(log n) amortized and idempotent: a second `cancel_timeout` on the
/// same pair is a no-op.
#[derive(Default)]
pub struct Dispatcher {
    heap: BinaryHeap<Reverse<Entry>>,
    seq: u64,
    /// Current live generation per (client, tag); an entry popped whose
    /// seq doesn't match the live generation for its tag is stale and is
    /// silently dropped.
    live: std::collections::HashMap<(ClientId, TimerTag), u64>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `(client, tag)` to fire at `when`, replacing any prior
    /// pending entry for the same pair.
    pub fn schedule_replacing(&mut self, client: ClientId, tag: TimerTag, when: Instant) {
        self.seq += 1;
        let seq = self.seq;
        self.live.insert((client, tag), seq);
        self.heap.push(Reverse(Entry { when, seq, client, tag }));
    }

    /// Cancel any pending entry for `(client, tag)`. Safe to call when
    /// nothing is pending; calling it twice in a row is a no-op the
    /// second time.
    pub fn cancel(&mut self, client: ClientId, tag: TimerTag) {
        self.live.remove(&(client, tag));
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse(e)| e.when)
    }

    /// Pop and return the next live (non-stale, non-cancelled) entry due
    /// at or before `now`, if any. Callers drive a loop:
    /// `while let Some((c, t)) = dispatcher.pop_ready(now) { ... }`.
    pub fn pop_ready(&mut self, now: Instant) -> Option<(ClientId, TimerTag)> {
        while let Some(Reverse(entry)) = self.heap.peek() {
            if entry.when > now {
                return None;
            }
            let Reverse(entry) = self.heap.pop().unwrap();
            match self.live.get(&(entry.client, entry.tag)) {
                Some(&live_seq) if live_seq == entry.seq => {
                    self.live.remove(&(entry.client, entry.tag));
                    return Some((entry.client, entry.tag));
                }
                _ => continue, // stale: superseded or cancelled
            }
        }
        None
    }

    pub fn is_pending(&self, client: ClientId, tag: TimerTag) -> bool {
        self.live.contains_key(&(client, tag))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn replacing_a_pending_timer_keeps_only_the_latest() {
        let mut d = Dispatcher::new();
        let t0 = Instant::now();
        d.schedule_replacing(1, TimerTag::Panic, t0 + Duration::from_secs(5));
        d.schedule_replacing(1, TimerTag::Panic, t0 + Duration::from_secs(10));

        assert_eq!(d.pop_ready(t0 + Duration::from_secs(20)), Some((1, TimerTag::Panic)));
        assert_eq!(d.pop_ready(t0 + Duration::from_secs(20)), None);
    }

    #[test]
    fn cancel_is_idempotent() {
        let mut d = Dispatcher::new();
        let t0 = Instant::now();
        d.schedule_replacing(1, TimerTag::Decline, t0 + Duration::from_secs(1));
        d.cancel(1, TimerTag::Decline);
        d.cancel(1, TimerTag::Decline); // no-op, must not panic
        assert_eq!(d.pop_ready(t0 + Duration::from_secs(5)), None);
    }

    #[test]
    fn distinct_clients_are_independent() {
        let mut d = Dispatcher::new();
        let t0 = Instant::now();
        d.schedule_replacing(1, TimerTag::SendDiscover, t0);
        d.schedule_replacing(2, TimerTag::SendDiscover, t0);
        let mut fired = vec![];
        while let Some(e) = d.pop_ready(t0 + Duration::from_secs(1)) {
            fired.push(e);
        }
        assert_eq!(fired.len(), 2);
    }
}
