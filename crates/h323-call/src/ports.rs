//! RTP/RTCP port allocation shared by every call of an endpoint

use parking_lot::Mutex;

use crate::config::PortRange;

/// Hands out consecutive (even RTP, odd RTCP) port pairs, wrapping at the end of the range
#[derive(Debug)]
pub struct RtpPortPool {
    range: PortRange,
    next: Mutex<u16>,
}

impl RtpPortPool {
    pub fn new(range: PortRange) -> Self {
        let start = even_at_or_above(range.start);
        Self { range, next: Mutex::new(start) }
    }

    /// Next RTP port and its RTCP companion
    pub fn next_pair(&self) -> (u16, u16) {
        let mut next = self.next.lock();
        let start = even_at_or_above(self.range.start);
        if next.checked_add(1).map_or(true, |rtcp| rtcp >= self.range.end) {
            *next = start;
        }
        let rtp = *next;
        *next = rtp.saturating_add(2);
        (rtp, rtp + 1)
    }
}

fn even_at_or_above(port: u16) -> u16 {
    if port % 2 == 0 { port } else { port.saturating_add(1) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pairs_are_even_odd_and_wrap() {
        let pool = RtpPortPool::new(PortRange { start: 5001, end: 5006 });
        assert_eq!(pool.next_pair(), (5002, 5003));
        assert_eq!(pool.next_pair(), (5004, 5005));
        assert_eq!(pool.next_pair(), (5002, 5003));
    }
}
