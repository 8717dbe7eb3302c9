use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::operation::Mutation;
use crate::types::{SequenceNumber, SessionId};

const MAX_UNDO_DEPTH: usize = 256;

/// Everything needed to compensate one committed operation later. The inverse
/// is computed against the state immediately before the forward mutations, so
/// it stays correct even after unrelated operations commit on top.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    /// Sequence of the operation this entry inverts.
    pub sequence: SequenceNumber,
    pub forward: Vec<Mutation>,
    pub inverse: Vec<Mutation>,
    pub session_id: SessionId,
    pub committed_at: u64,
}

#[derive(Default)]
struct SessionHistory {
    undo: Vec<HistoryEntry>,
    redo: Vec<HistoryEntry>,
}

/// Per-session undo/redo stacks. A session can only undo its own operations;
/// entries are data referencing log positions, never live object references.
pub struct HistoryManager {
    sessions: HashMap<SessionId, SessionHistory>,
}

impl HistoryManager {
    pub fn new() -> Self {
        Self {
            sessions: HashMap::new(),
        }
    }

    /// Records a freshly committed operation as undoable. Any redoable tail
    /// for the session is invalidated.
    pub fn record(&mut self, entry: HistoryEntry) {
        let history = self.sessions.entry(entry.session_id).or_default();
        history.redo.clear();
        history.undo.push(entry);
        if history.undo.len() > MAX_UNDO_DEPTH {
            history.undo.remove(0);
        }
    }

    pub fn take_undo(&mut self, session_id: SessionId) -> Option<HistoryEntry> {
        self.sessions.get_mut(&session_id)?.undo.pop()
    }

    pub fn push_redo(&mut self, session_id: SessionId, entry: HistoryEntry) {
        self.sessions.entry(session_id).or_default().redo.push(entry);
    }

    pub fn take_redo(&mut self, session_id: SessionId) -> Option<HistoryEntry> {
        self.sessions.get_mut(&session_id)?.redo.pop()
    }

    /// Re-arms an entry as undoable after a successful redo, without touching
    /// the rest of the redo stack.
    pub fn push_undo(&mut self, session_id: SessionId, entry: HistoryEntry) {
        self.sessions.entry(session_id).or_default().undo.push(entry);
    }

    pub fn remove_session(&mut self, session_id: SessionId) {
        self.sessions.remove(&session_id);
    }

    pub fn undo_depth(&self, session_id: SessionId) -> usize {
        self.sessions
            .get(&session_id)
            .map(|history| history.undo.len())
            .unwrap_or(0)
    }

    pub fn redo_depth(&self, session_id: SessionId) -> usize {
        self.sessions
            .get(&session_id)
            .map(|history| history.redo.len())
            .unwrap_or(0)
    }
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(session_id: SessionId, sequence: SequenceNumber) -> HistoryEntry {
        HistoryEntry {
            sequence,
            forward: Vec::new(),
            inverse: Vec::new(),
            session_id,
            committed_at: now_millis(),
        }
    }

    #[test]
    fn it_tracks_stacks_per_session() {
        let mut manager = HistoryManager::new();
        manager.record(entry(1, 1));
        manager.record(entry(2, 2));

        assert_eq!(manager.undo_depth(1), 1);
        assert_eq!(manager.undo_depth(2), 1);
        assert!(manager.take_undo(3).is_none());
    }

    #[test]
    fn it_invalidates_redo_on_new_record() {
        let mut manager = HistoryManager::new();
        manager.record(entry(1, 1));

        let undone = manager.take_undo(1).unwrap();
        manager.push_redo(1, undone);
        assert_eq!(manager.redo_depth(1), 1);

        manager.record(entry(1, 3));
        assert_eq!(manager.redo_depth(1), 0);
    }

    #[test]
    fn it_caps_undo_depth() {
        let mut manager = HistoryManager::new();
        for sequence in 0..(MAX_UNDO_DEPTH as u64 + 10) {
            manager.record(entry(1, sequence));
        }
        assert_eq!(manager.undo_depth(1), MAX_UNDO_DEPTH);
    }
}
