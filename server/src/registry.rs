use std::collections::HashMap;

use system::uuid::Uuid;
use system::{Color, ParticipantInfo, PresenceData, RoomEvent, SessionId, UserId};

use crate::connection::ConnectionEvent;

pub type SessionTx = tokio::sync::mpsc::Sender<ConnectionEvent>;

// Palette and name pools match the original whiteboard's join experience.
const PALETTE: [Color; 10] = [
    Color { r: 255, g: 107, b: 107 },
    Color { r: 78, g: 205, b: 196 },
    Color { r: 255, g: 209, b: 102 },
    Color { r: 6, g: 214, b: 160 },
    Color { r: 17, g: 138, b: 178 },
    Color { r: 239, g: 71, b: 111 },
    Color { r: 114, g: 9, b: 183 },
    Color { r: 58, g: 134, b: 255 },
    Color { r: 251, g: 86, b: 7 },
    Color { r: 131, g: 56, b: 236 },
];

const ADJECTIVES: [&str; 8] = [
    "Creative", "Artistic", "Clever", "Bright", "Quick", "Witty", "Sharp", "Smart",
];
const NOUNS: [&str; 8] = [
    "Artist", "Designer", "Creator", "Thinker", "Drafter", "Sketch", "Drawer", "Planner",
];

pub struct Member {
    tx: SessionTx,
    pub info: ParticipantInfo,
    pub presence: PresenceData,
}

/// Connected participants of one room: presence, outbound queues and the
/// roster broadcast to joiners. Sends never block the room actor; a session
/// whose bounded queue overflows is reported back for disconnection.
pub struct SessionRegistry {
    attached: HashMap<SessionId, SessionTx>,
    members: HashMap<SessionId, Member>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            attached: HashMap::new(),
            members: HashMap::new(),
        }
    }

    /// Registers a freshly accepted connection that has not joined yet.
    pub fn attach(&mut self, session_id: SessionId, tx: SessionTx) {
        self.attached.insert(session_id, tx);
    }

    pub fn join(
        &mut self,
        session_id: SessionId,
        token: &str,
        name: Option<String>,
    ) -> Option<ParticipantInfo> {
        let tx = self.attached.remove(&session_id)?;
        let user_id = derive_user_id(token);
        let info = ParticipantInfo {
            session_id,
            user_id,
            name: name.unwrap_or_else(|| generate_name(&user_id)),
            color: self.assign_color(),
        };
        self.members.insert(
            session_id,
            Member {
                tx,
                info: info.clone(),
                presence: PresenceData::default(),
            },
        );
        Some(info)
    }

    /// Removes a session in any state, returning its member record if it had
    /// joined. Dropping the record closes the session's outbound channel.
    pub fn detach(&mut self, session_id: SessionId) -> Option<Member> {
        self.attached.remove(&session_id);
        self.members.remove(&session_id)
    }

    pub fn is_member(&self, session_id: SessionId) -> bool {
        self.members.contains_key(&session_id)
    }

    pub fn is_empty(&self) -> bool {
        self.attached.is_empty() && self.members.is_empty()
    }

    pub fn roster(&self) -> Vec<ParticipantInfo> {
        self.members
            .values()
            .map(|member| member.info.clone())
            .collect()
    }

    pub fn set_presence(&mut self, session_id: SessionId, presence: PresenceData) -> bool {
        if let Some(member) = self.members.get_mut(&session_id) {
            member.presence = presence;
            true
        } else {
            false
        }
    }

    /// Current presence of every member, for replaying to a joiner.
    pub fn presences(&self) -> Vec<(SessionId, PresenceData)> {
        self.members
            .iter()
            .map(|(session_id, member)| (*session_id, member.presence.clone()))
            .collect()
    }

    pub fn rename(&mut self, session_id: SessionId, name: String) -> bool {
        if let Some(member) = self.members.get_mut(&session_id) {
            member.info.name = name;
            true
        } else {
            false
        }
    }

    /// Queues an event for one session. Returns false when the session is
    /// gone or its queue is full.
    pub fn send_to(&mut self, session_id: SessionId, event: RoomEvent) -> bool {
        if let Some(member) = self.members.get_mut(&session_id) {
            member.tx.try_send(ConnectionEvent::Event(event)).is_ok()
        } else if let Some(tx) = self.attached.get_mut(&session_id) {
            tx.try_send(ConnectionEvent::Event(event)).is_ok()
        } else {
            false
        }
    }

    /// Fans out in a single pass, preserving log order per session. Returns
    /// the sessions that must be dropped because their queue overflowed or
    /// their connection already closed.
    pub fn broadcast(&mut self, event: RoomEvent, exclude: Option<SessionId>) -> Vec<SessionId> {
        let mut dropped = Vec::new();
        for (session_id, member) in self.members.iter_mut() {
            if exclude == Some(*session_id) {
                continue;
            }
            if let Err(err) = member.tx.try_send(ConnectionEvent::Event(event.clone())) {
                log::warn!("dropping slow or closed session {}: {}", session_id, err);
                dropped.push(*session_id);
            }
        }
        dropped
    }

    fn assign_color(&self) -> Color {
        let used: Vec<Color> = self.members.values().map(|m| m.info.color).collect();
        PALETTE
            .iter()
            .find(|candidate| !used.iter().any(|c| c == *candidate))
            .copied()
            .unwrap_or(PALETTE[self.members.len() % PALETTE.len()])
    }
}

/// Stable user identity from an opaque token, fresh identity when anonymous.
fn derive_user_id(token: &str) -> UserId {
    if token.is_empty() {
        Uuid::new_v4()
    } else {
        Uuid::new_v5(&Uuid::NAMESPACE_OID, token.as_bytes())
    }
}

fn generate_name(user_id: &UserId) -> String {
    let bytes = user_id.as_bytes();
    format!(
        "{} {}",
        ADJECTIVES[bytes[0] as usize % ADJECTIVES.len()],
        NOUNS[bytes[1] as usize % NOUNS.len()]
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_derives_stable_user_ids_from_tokens() {
        assert_eq!(derive_user_id("alice"), derive_user_id("alice"));
        assert_ne!(derive_user_id("alice"), derive_user_id("bob"));
        assert_ne!(derive_user_id(""), derive_user_id(""));
    }

    #[test]
    fn it_tracks_presence_per_member_for_join_replay() {
        let (tx, _rx) = tokio::sync::mpsc::channel(8);
        let mut registry = SessionRegistry::new();
        registry.attach(1, tx.clone());
        registry.join(1, "alice", None).unwrap();
        registry.attach(2, tx);
        registry.join(2, "bob", None).unwrap();

        let presence = PresenceData {
            cursor: Some(system::euclid::default::Point2D::new(4.0, 2.0)),
            selection: Vec::new(),
        };
        assert!(registry.set_presence(1, presence));

        let presences = registry.presences();
        assert_eq!(presences.len(), 2);
        let alice = presences
            .iter()
            .find(|(session_id, _)| *session_id == 1)
            .unwrap();
        assert!(alice.1.cursor.is_some());
        let bob = presences
            .iter()
            .find(|(session_id, _)| *session_id == 2)
            .unwrap();
        assert!(bob.1.cursor.is_none());
    }

    #[test]
    fn it_generates_a_display_name_per_user() {
        let user_id = derive_user_id("alice");
        let name = generate_name(&user_id);
        assert_eq!(name, generate_name(&user_id));
        assert!(name.contains(' '));
    }
}
