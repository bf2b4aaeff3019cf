//! Remote ICE candidates waiting for their remote description
//!
//! Candidates and descriptions travel on separate signaling paths and can
//! arrive in any order. A candidate is held here until the session of its
//! epoch has a remote description, then replayed in arrival order.

use super::description::IceCandidateMessage;
use super::room::RoomId;
use log::debug;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

/// One negotiation epoch of a room
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId {
    pub room: RoomId,
    pub epoch: u32,
}

impl SessionId {
    pub fn new(room: RoomId, epoch: u32) -> Self {
        Self { room, epoch }
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.room, self.epoch)
    }
}

/// Outcome of [`CandidateBuffer::enqueue`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    /// Held until the session is ready
    Buffered,
    /// The session is ready; the caller may apply after draining
    Ready,
    /// The room is closed; candidate dropped
    Discarded,
}

#[derive(Default)]
struct Entry {
    ready: bool,
    queue: VecDeque<IceCandidateMessage>,
}

#[derive(Default)]
pub struct CandidateBuffer {
    entries: HashMap<SessionId, Entry>,
    closed_rooms: HashSet<RoomId>,
}

impl CandidateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, id: &SessionId, candidate: IceCandidateMessage) -> Enqueued {
        if self.closed_rooms.contains(&id.room) {
            debug!("Discarding candidate for closed session {}", id);
            return Enqueued::Discarded;
        }
        let entry = self.entries.entry(id.clone()).or_default();
        entry.queue.push_back(candidate);
        if entry.ready {
            Enqueued::Ready
        } else {
            Enqueued::Buffered
        }
    }

    /// Record that `id` now has its remote description
    pub fn mark_ready(&mut self, id: &SessionId) {
        if self.closed_rooms.contains(&id.room) {
            return;
        }
        self.entries.entry(id.clone()).or_default().ready = true;
    }

    pub fn is_ready(&self, id: &SessionId) -> bool {
        self.entries.get(id).map(|e| e.ready).unwrap_or(false)
    }

    /// Take every buffered candidate of `id` if it is ready; empty otherwise
    pub fn drain_if_ready(&mut self, id: &SessionId) -> Vec<IceCandidateMessage> {
        match self.entries.get_mut(id) {
            Some(entry) if entry.ready => entry.queue.drain(..).collect(),
            _ => Vec::new(),
        }
    }

    pub fn pending(&self, id: &SessionId) -> usize {
        self.entries.get(id).map(|e| e.queue.len()).unwrap_or(0)
    }

    /// Drop the entries of epochs older than `epoch`
    pub fn retire_before(&mut self, room: &RoomId, epoch: u32) {
        self.entries
            .retain(|id, _| &id.room != room || id.epoch >= epoch);
    }

    /// Drop everything for `room`; later candidates are discarded
    pub fn close_room(&mut self, room: &RoomId) {
        self.entries.retain(|id, _| &id.room != room);
        self.closed_rooms.insert(room.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::room::PeerId;

    fn room() -> RoomId {
        RoomId::for_pair(&PeerId::from("a"), &PeerId::from("b")).unwrap()
    }

    fn candidate(n: u32) -> IceCandidateMessage {
        IceCandidateMessage::new(format!("candidate:{}", n), Some("0".to_string()), Some(0))
    }

    #[test]
    fn test_not_ready_returns_nothing() {
        let mut buffer = CandidateBuffer::new();
        let id = SessionId::new(room(), 0);
        assert_eq!(buffer.enqueue(&id, candidate(1)), Enqueued::Buffered);
        assert!(buffer.drain_if_ready(&id).is_empty());
        assert_eq!(buffer.pending(&id), 1);
    }

    #[test]
    fn test_drain_preserves_arrival_order() {
        let mut buffer = CandidateBuffer::new();
        let id = SessionId::new(room(), 0);
        for n in 1..=3 {
            buffer.enqueue(&id, candidate(n));
        }
        buffer.mark_ready(&id);
        let drained: Vec<String> = buffer
            .drain_if_ready(&id)
            .into_iter()
            .map(|c| c.candidate)
            .collect();
        assert_eq!(drained, vec!["candidate:1", "candidate:2", "candidate:3"]);
        assert!(buffer.drain_if_ready(&id).is_empty());
    }

    #[test]
    fn test_epochs_are_separate() {
        let mut buffer = CandidateBuffer::new();
        let old = SessionId::new(room(), 0);
        let new = SessionId::new(room(), 1);
        buffer.enqueue(&old, candidate(1));
        buffer.enqueue(&new, candidate(2));
        buffer.mark_ready(&new);
        assert_eq!(buffer.drain_if_ready(&new).len(), 1);
        buffer.retire_before(&room(), 1);
        assert_eq!(buffer.pending(&old), 0);
    }

    #[test]
    fn test_closed_room_discards_silently() {
        let mut buffer = CandidateBuffer::new();
        let id = SessionId::new(room(), 0);
        buffer.enqueue(&id, candidate(1));
        buffer.close_room(&room());
        assert_eq!(buffer.enqueue(&id, candidate(2)), Enqueued::Discarded);
        assert_eq!(buffer.pending(&id), 0);
    }
}
