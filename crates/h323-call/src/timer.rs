//! Per-call protocol timers
//!
//! Every outstanding H.245 or H.225.0 request arms one timer. The timer is
//! cancelled when the awaited answer arrives; if it fires instead, the call
//! retries (round-trip delay) or is cleared (everything else).
//!
//! ```text
//!   arm(class, channel, delay) ──▶ ┌────────────┐ ──▶ cancel / cancel_class
//!                                  │ CallTimers │
//!   pop_expired(now) ◀──────────── └────────────┘   ordered by (deadline, id)
//! ```
//!
//! Entries are kept in a `BTreeMap` keyed by deadline so expired timers pop
//! out in chronological order, with a side index by [`TimerId`] for
//! cancellation. Each handle fires at most once.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::{Duration, Instant};

use rvoip_h323_proto::ChannelNumber;

/// Protocol timer classes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerClass {
    /// MasterSlaveDetermination awaiting Ack/Reject
    Msd,
    /// TerminalCapabilitySet awaiting Ack/Reject
    Tcs,
    /// OpenLogicalChannel awaiting Ack/Reject
    Olc,
    /// CloseLogicalChannel awaiting Ack
    Clc,
    /// RequestChannelClose awaiting Ack/Reject
    Rcc,
    /// EndSessionCommand awaiting the remote EndSessionCommand
    Session,
    /// Next round-trip delay request
    Rtd,
    /// Outgoing SETUP awaiting CONNECT
    CallEstablish,
}

impl fmt::Display for TimerClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TimerClass::Msd => "MSD",
            TimerClass::Tcs => "TCS",
            TimerClass::Olc => "OLC",
            TimerClass::Clc => "CLC",
            TimerClass::Rcc => "RCC",
            TimerClass::Session => "Session",
            TimerClass::Rtd => "RTD",
            TimerClass::CallEstablish => "CallEstablish",
        };
        f.write_str(name)
    }
}

/// Handle of an armed timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer-{}", self.0)
    }
}

/// A timer that has been armed and not yet fired or cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingTimer {
    pub id: TimerId,
    pub class: TimerClass,
    /// Logical channel the timer guards, for OLC/CLC/RCC
    pub channel: Option<ChannelNumber>,
    pub deadline: Instant,
}

/// Ordered set of the timers of one call
#[derive(Debug, Default)]
pub struct CallTimers {
    next_id: u64,
    by_deadline: BTreeMap<(Instant, TimerId), PendingTimer>,
    deadlines: HashMap<TimerId, Instant>,
}

impl CallTimers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a timer `delay` from now
    pub fn arm(
        &mut self,
        class: TimerClass,
        channel: Option<ChannelNumber>,
        delay: Duration,
    ) -> TimerId {
        self.arm_at(class, channel, Instant::now() + delay)
    }

    pub fn arm_at(
        &mut self,
        class: TimerClass,
        channel: Option<ChannelNumber>,
        deadline: Instant,
    ) -> TimerId {
        self.next_id += 1;
        let id = TimerId(self.next_id);
        self.by_deadline.insert((deadline, id), PendingTimer { id, class, channel, deadline });
        self.deadlines.insert(id, deadline);
        id
    }

    /// Cancel one timer; false when it already fired or was cancelled
    pub fn cancel(&mut self, id: TimerId) -> bool {
        match self.deadlines.remove(&id) {
            Some(deadline) => self.by_deadline.remove(&(deadline, id)).is_some(),
            None => false,
        }
    }

    /// Cancel every timer of a class, optionally restricted to one channel
    pub fn cancel_class(&mut self, class: TimerClass, channel: Option<ChannelNumber>) -> usize {
        let ids: Vec<TimerId> = self
            .by_deadline
            .values()
            .filter(|t| t.class == class && (channel.is_none() || t.channel == channel))
            .map(|t| t.id)
            .collect();
        ids.into_iter().filter(|id| self.cancel(*id)).count()
    }

    pub fn cancel_all(&mut self) -> usize {
        let count = self.by_deadline.len();
        self.by_deadline.clear();
        self.deadlines.clear();
        count
    }

    pub fn is_armed(&self, class: TimerClass, channel: Option<ChannelNumber>) -> bool {
        self.by_deadline
            .values()
            .any(|t| t.class == class && (channel.is_none() || t.channel == channel))
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.by_deadline.keys().next().map(|(deadline, _)| *deadline)
    }

    /// Remove and return the earliest timer whose deadline is not after `now`
    pub fn pop_expired(&mut self, now: Instant) -> Option<PendingTimer> {
        let key = *self.by_deadline.keys().next()?;
        if key.0 > now {
            return None;
        }
        self.deadlines.remove(&key.1);
        self.by_deadline.remove(&key)
    }

    pub fn len(&self) -> usize {
        self.by_deadline.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_deadline.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expired_timers_pop_in_order() {
        let mut timers = CallTimers::new();
        let base = Instant::now();
        timers.arm_at(TimerClass::Tcs, None, base + Duration::from_secs(20));
        timers.arm_at(TimerClass::Msd, None, base + Duration::from_secs(10));
        timers.arm_at(TimerClass::Olc, Some(1001), base + Duration::from_secs(30));

        let now = base + Duration::from_secs(25);
        assert_eq!(timers.pop_expired(now).map(|t| t.class), Some(TimerClass::Msd));
        assert_eq!(timers.pop_expired(now).map(|t| t.class), Some(TimerClass::Tcs));
        assert_eq!(timers.pop_expired(now), None);
        assert_eq!(timers.len(), 1);
        assert_eq!(timers.next_deadline(), Some(base + Duration::from_secs(30)));
    }

    #[test]
    fn test_cancel_fires_at_most_once() {
        let mut timers = CallTimers::new();
        let id = timers.arm(TimerClass::Session, None, Duration::from_secs(15));
        assert!(timers.cancel(id));
        assert!(!timers.cancel(id));
        assert!(timers.is_empty());
        assert_eq!(timers.pop_expired(Instant::now() + Duration::from_secs(60)), None);
    }

    #[test]
    fn test_cancel_by_class_and_channel() {
        let mut timers = CallTimers::new();
        timers.arm(TimerClass::Olc, Some(1001), Duration::from_secs(30));
        timers.arm(TimerClass::Olc, Some(1002), Duration::from_secs(30));
        timers.arm(TimerClass::Rcc, Some(1001), Duration::from_secs(30));

        assert_eq!(timers.cancel_class(TimerClass::Olc, Some(1001)), 1);
        assert!(timers.is_armed(TimerClass::Olc, Some(1002)));
        assert!(!timers.is_armed(TimerClass::Olc, Some(1001)));
        assert!(timers.is_armed(TimerClass::Rcc, Some(1001)));

        assert_eq!(timers.cancel_all(), 2);
        assert!(timers.is_empty());
    }
}
