//! Room and role derivation
//!
//! Both participants compute the room id and their roles on their own,
//! from the two peer ids alone.

use super::SessionError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable peer identifier supplied by the identity provider
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for PeerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What the identity provider hands us. Only `id` matters here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerIdentity {
    pub id: PeerId,
    #[serde(default, rename = "displayName")]
    pub display_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

impl PeerIdentity {
    pub fn new(id: impl Into<PeerId>) -> Self {
        Self {
            id: id.into(),
            display_name: None,
            email: None,
        }
    }
}

/// Role in the offer/answer exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerRole {
    Offerer,
    Answerer,
}

impl PeerRole {
    /// Role of `local` when paired with `remote`.
    ///
    /// The lexicographically smaller id offers.
    pub fn for_pair(local: &PeerId, remote: &PeerId) -> PeerRole {
        if local < remote {
            PeerRole::Offerer
        } else {
            PeerRole::Answerer
        }
    }

    pub fn counterpart(self) -> PeerRole {
        match self {
            PeerRole::Offerer => PeerRole::Answerer,
            PeerRole::Answerer => PeerRole::Offerer,
        }
    }
}

impl fmt::Display for PeerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerRole::Offerer => write!(f, "offerer"),
            PeerRole::Answerer => write!(f, "answerer"),
        }
    }
}

/// Logical pairing of two participants.
///
/// Rendered as the two ids sorted and joined with `_`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoomId {
    low: PeerId,
    high: PeerId,
    key: String,
}

impl RoomId {
    pub fn for_pair(a: &PeerId, b: &PeerId) -> Result<Self, SessionError> {
        if a.as_str().is_empty() || b.as_str().is_empty() {
            return Err(SessionError::InvalidRoom("empty peer id".to_string()));
        }
        for peer in [a, b] {
            if peer.as_str().contains(['_', '/']) {
                return Err(SessionError::InvalidRoom(format!(
                    "peer id {} contains a reserved character ('_' or '/')",
                    peer
                )));
            }
        }
        if a == b {
            return Err(SessionError::InvalidRoom(format!("peer {} cannot call itself", a)));
        }
        let (low, high) = if a < b { (a.clone(), b.clone()) } else { (b.clone(), a.clone()) };
        let key = format!("{}_{}", low, high);
        Ok(Self { low, high, key })
    }

    pub fn as_str(&self) -> &str {
        &self.key
    }

    pub fn participants(&self) -> (&PeerId, &PeerId) {
        (&self.low, &self.high)
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        &self.low == peer || &self.high == peer
    }

    /// The other participant
    pub fn counterpart(&self, local: &PeerId) -> Result<&PeerId, SessionError> {
        if local == &self.low {
            Ok(&self.high)
        } else if local == &self.high {
            Ok(&self.low)
        } else {
            Err(SessionError::InvalidRoom(format!(
                "peer {} is not a participant of room {}",
                local, self.key
            )))
        }
    }

    /// Role of `local` in this room
    pub fn role_of(&self, local: &PeerId) -> Result<PeerRole, SessionError> {
        let remote = self.counterpart(local)?;
        Ok(PeerRole::for_pair(local, remote))
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_id_is_order_independent() {
        let a = PeerId::from("alice");
        let b = PeerId::from("bob");
        let ab = RoomId::for_pair(&a, &b).unwrap();
        let ba = RoomId::for_pair(&b, &a).unwrap();
        assert_eq!(ab, ba);
        assert_eq!(ab.as_str(), "alice_bob");
    }

    #[test]
    fn test_roles_are_deterministic_and_complementary() {
        let pairs = [("a", "b"), ("zed", "amy"), ("user-10", "user-9"), ("Ab", "ab")];
        for (x, y) in pairs {
            let x = PeerId::from(x);
            let y = PeerId::from(y);
            let room = RoomId::for_pair(&x, &y).unwrap();
            let rx = room.role_of(&x).unwrap();
            let ry = room.role_of(&y).unwrap();
            assert_eq!(rx, room.role_of(&x).unwrap());
            assert_eq!(rx.counterpart(), ry);
        }
    }

    #[test]
    fn test_smaller_id_offers() {
        let room = RoomId::for_pair(&PeerId::from("b"), &PeerId::from("a")).unwrap();
        assert_eq!(room.role_of(&PeerId::from("a")).unwrap(), PeerRole::Offerer);
        assert_eq!(room.role_of(&PeerId::from("b")).unwrap(), PeerRole::Answerer);
    }

    #[test]
    fn test_self_call_rejected() {
        let a = PeerId::from("a");
        assert!(matches!(RoomId::for_pair(&a, &a), Err(SessionError::InvalidRoom(_))));
    }

    #[test]
    fn test_separator_in_id_rejected() {
        let colliding = [("alice_x", "bob"), ("alice", "x_bob"), ("a/b", "c")];
        for (x, y) in colliding {
            assert!(matches!(
                RoomId::for_pair(&PeerId::from(x), &PeerId::from(y)),
                Err(SessionError::InvalidRoom(_))
            ));
        }
    }

    #[test]
    fn test_stranger_has_no_role() {
        let room = RoomId::for_pair(&PeerId::from("a"), &PeerId::from("b")).unwrap();
        assert!(room.role_of(&PeerId::from("c")).is_err());
    }

    #[test]
    fn test_identity_parses_provider_fields() {
        let identity: PeerIdentity =
            serde_json::from_str(r#"{"id":"u1","displayName":"Ada","email":"ada@example.com"}"#).unwrap();
        assert_eq!(identity.id, PeerId::from("u1"));
        assert_eq!(identity.display_name.as_deref(), Some("Ada"));
    }
}
