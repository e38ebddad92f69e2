//! Logical channel records and the per-call channel table

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use rvoip_h323_proto::{ChannelNumber, MediaFormat, MediaKind};

/// Direction of a logical channel, seen from this endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ChannelDirection {
    Transmit,
    Receive,
}

impl fmt::Display for ChannelDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelDirection::Transmit => write!(f, "transmit"),
            ChannelDirection::Receive => write!(f, "receive"),
        }
    }
}

/// Lifecycle state of a logical channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelState {
    /// OpenLogicalChannel sent, awaiting the answer
    Proposed,
    /// Offered or accepted through fast start, not answered yet
    ProposedFastStart,
    Established,
    /// CloseLogicalChannel sent, awaiting the Ack
    ClosePending,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelState::Proposed => "Proposed",
            ChannelState::ProposedFastStart => "ProposedFastStart",
            ChannelState::Established => "Established",
            ChannelState::ClosePending => "ClosePending",
        };
        f.write_str(name)
    }
}

/// One directional media stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalChannel {
    pub number: ChannelNumber,
    /// 0 until the master assigns one
    pub session_id: u8,
    pub direction: ChannelDirection,
    pub format: MediaFormat,
    pub state: ChannelState,
    pub local_rtp: SocketAddr,
    pub local_rtcp: SocketAddr,
    pub remote_rtp: Option<SocketAddr>,
    pub remote_rtcp: Option<SocketAddr>,
}

impl LogicalChannel {
    pub fn kind(&self) -> MediaKind {
        self.format.kind()
    }

    pub fn is_established(&self) -> bool {
        self.state == ChannelState::Established
    }
}

impl fmt::Display for LogicalChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} channel {} ({}, session {}, {})",
            self.direction, self.number, self.format.codec, self.session_id, self.state
        )
    }
}

/// Channel table of one call, indexed by (number, direction)
///
/// Both endpoints allocate forward channel numbers independently, so a
/// number alone does not identify a channel.
#[derive(Debug, Default)]
pub struct ChannelTable {
    channels: BTreeMap<(ChannelNumber, ChannelDirection), LogicalChannel>,
}

impl ChannelTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a channel, replacing any record with the same key
    pub fn insert(&mut self, channel: LogicalChannel) -> Option<LogicalChannel> {
        self.channels.insert((channel.number, channel.direction), channel)
    }

    pub fn get(
        &self,
        number: ChannelNumber,
        direction: ChannelDirection,
    ) -> Option<&LogicalChannel> {
        self.channels.get(&(number, direction))
    }

    pub fn get_mut(
        &mut self,
        number: ChannelNumber,
        direction: ChannelDirection,
    ) -> Option<&mut LogicalChannel> {
        self.channels.get_mut(&(number, direction))
    }

    pub fn remove(
        &mut self,
        number: ChannelNumber,
        direction: ChannelDirection,
    ) -> Option<LogicalChannel> {
        self.channels.remove(&(number, direction))
    }

    pub fn contains(&self, number: ChannelNumber, direction: ChannelDirection) -> bool {
        self.channels.contains_key(&(number, direction))
    }

    pub fn find_by_session(
        &self,
        session_id: u8,
        direction: ChannelDirection,
    ) -> Option<&LogicalChannel> {
        self.channels.values().find(|c| c.session_id == session_id && c.direction == direction)
    }

    pub fn has_direction(&self, direction: ChannelDirection) -> bool {
        self.channels.values().any(|c| c.direction == direction)
    }

    pub fn has_kind(&self, kind: MediaKind, direction: ChannelDirection) -> bool {
        self.channels.values().any(|c| c.direction == direction && c.kind() == kind)
    }

    /// Channel numbers of one direction, in table order
    pub fn numbers(&self, direction: ChannelDirection) -> Vec<ChannelNumber> {
        self.channels
            .values()
            .filter(|c| c.direction == direction)
            .map(|c| c.number)
            .collect()
    }

    /// Keys of every channel, in table order
    pub fn keys(&self) -> Vec<(ChannelNumber, ChannelDirection)> {
        self.channels.keys().copied().collect()
    }

    /// Established channels sharing a session and direction, except `number`
    pub fn established_peers(
        &self,
        number: ChannelNumber,
        session_id: u8,
        direction: ChannelDirection,
    ) -> Vec<ChannelNumber> {
        self.channels
            .values()
            .filter(|c| c.number != number && c.direction == direction)
            .filter(|c| c.session_id == session_id && c.is_established())
            .map(|c| c.number)
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LogicalChannel> {
        self.channels.values()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rvoip_h323_proto::Codec;

    fn channel(
        number: ChannelNumber,
        session_id: u8,
        direction: ChannelDirection,
    ) -> LogicalChannel {
        LogicalChannel {
            number,
            session_id,
            direction,
            format: MediaFormat::audio(Codec::G711Ulaw64k, 20),
            state: ChannelState::Established,
            local_rtp: "127.0.0.1:10000".parse().unwrap(),
            local_rtcp: "127.0.0.1:10001".parse().unwrap(),
            remote_rtp: None,
            remote_rtcp: None,
        }
    }

    #[test]
    fn test_same_number_both_directions() {
        let mut table = ChannelTable::new();
        table.insert(channel(1001, 1, ChannelDirection::Transmit));
        table.insert(channel(1001, 1, ChannelDirection::Receive));

        assert_eq!(table.len(), 2);
        assert!(table.remove(1001, ChannelDirection::Transmit).is_some());
        assert!(!table.has_direction(ChannelDirection::Transmit));
        assert!(table.has_direction(ChannelDirection::Receive));
    }

    #[test]
    fn test_session_lookup_and_peers() {
        let mut table = ChannelTable::new();
        table.insert(channel(1001, 1, ChannelDirection::Transmit));
        table.insert(channel(1002, 1, ChannelDirection::Transmit));
        table.insert(channel(1003, 2, ChannelDirection::Transmit));

        let found = table.find_by_session(2, ChannelDirection::Transmit);
        assert_eq!(found.map(|c| c.number), Some(1003));
        assert_eq!(table.established_peers(1002, 1, ChannelDirection::Transmit), vec![1001]);
        assert_eq!(table.numbers(ChannelDirection::Transmit), vec![1001, 1002, 1003]);
        assert!(table.has_kind(MediaKind::Audio, ChannelDirection::Transmit));
        assert!(!table.has_kind(MediaKind::Audio, ChannelDirection::Receive));
    }
}
