use std::collections::{HashMap, HashSet};

use base95::Base95;

use crate::document::DocumentStore;
use crate::history::{now_millis, HistoryEntry, HistoryManager};
use crate::message::RejectReason;
use crate::operation::{ClientOperation, CommittedOperation, Mutation, OperationKind};
use crate::sequencer::Sequencer;
use crate::types::*;

#[derive(Debug)]
pub enum Submission {
    Committed(CommittedOperation),
    /// Accepted but produced no new commit: the client clock did not advance,
    /// or the operation had no effect. Silently dropped.
    Discarded,
}

/// Room-scoped ordering and conflict resolution. Owned by exactly one room
/// actor; every submission for the room passes through here one at a time,
/// which is the whole concurrency story inside a room.
pub struct RoomCoordinator {
    document: DocumentStore,
    sequencer: Sequencer,
    history: HistoryManager,
    users: HashMap<SessionId, UserId>,
    last_clock: HashMap<UserId, ClientClock>,
}

impl RoomCoordinator {
    pub fn new(room_id: RoomId) -> Self {
        Self {
            document: DocumentStore::new(room_id),
            sequencer: Sequencer::new(),
            history: HistoryManager::new(),
            users: HashMap::new(),
            last_clock: HashMap::new(),
        }
    }

    /// Resumes a room from durably recovered state.
    pub fn recover(document: DocumentStore) -> Self {
        let sequencer = Sequencer::resume_after(document.head_sequence());
        Self {
            document,
            sequencer,
            history: HistoryManager::new(),
            users: HashMap::new(),
            last_clock: HashMap::new(),
        }
    }

    pub fn document(&self) -> &DocumentStore {
        &self.document
    }

    pub fn document_mut(&mut self) -> &mut DocumentStore {
        &mut self.document
    }

    /// Binds a joined session to its user identity. The duplicate-submission
    /// clock is tracked per user so it survives reconnects under a new
    /// session id.
    pub fn bind(&mut self, session_id: SessionId, user_id: UserId) {
        self.users.insert(session_id, user_id);
    }

    pub fn unbind(&mut self, session_id: SessionId) {
        self.users.remove(&session_id);
        self.history.remove_session(session_id);
    }

    pub fn submit(
        &mut self,
        session_id: SessionId,
        operation: ClientOperation,
    ) -> Result<Submission, RejectReason> {
        let user_id = self.user_of(session_id)?;
        if self.is_duplicate(user_id, operation.client_clock) {
            return Ok(Submission::Discarded);
        }

        let mutations = self.expand(operation.kind)?;
        self.ensure_applicable(&mutations, false)?;

        let committed = self.commit(session_id, operation.client_clock, mutations, true);
        self.last_clock.insert(user_id, operation.client_clock);
        Ok(Submission::Committed(committed))
    }

    /// Undo appends a compensating operation with its own sequence number; it
    /// never rewrites history.
    pub fn undo(
        &mut self,
        session_id: SessionId,
        client_clock: ClientClock,
    ) -> Result<Submission, RejectReason> {
        let user_id = self.user_of(session_id)?;
        if self.is_duplicate(user_id, client_clock) {
            return Ok(Submission::Discarded);
        }

        let entry = self
            .history
            .take_undo(session_id)
            .ok_or(RejectReason::NoHistory)?;
        // A target deleted by someone else makes the entry permanently
        // inapplicable; it is dropped, not retried.
        self.ensure_applicable(&entry.inverse, true)?;

        let committed = self.commit(session_id, client_clock, entry.inverse.clone(), false);
        self.history.push_redo(session_id, entry);
        self.last_clock.insert(user_id, client_clock);
        Ok(Submission::Committed(committed))
    }

    pub fn redo(
        &mut self,
        session_id: SessionId,
        client_clock: ClientClock,
    ) -> Result<Submission, RejectReason> {
        let user_id = self.user_of(session_id)?;
        if self.is_duplicate(user_id, client_clock) {
            return Ok(Submission::Discarded);
        }

        let entry = self
            .history
            .take_redo(session_id)
            .ok_or(RejectReason::NoHistory)?;
        self.ensure_applicable(&entry.forward, true)?;

        let forward = entry.forward.clone();
        let inverse = self.document.invert(&forward);
        let committed = self.commit(session_id, client_clock, forward, false);
        self.history.push_undo(
            session_id,
            HistoryEntry {
                sequence: committed.sequence,
                forward: entry.forward,
                inverse,
                session_id,
                committed_at: now_millis(),
            },
        );
        self.last_clock.insert(user_id, client_clock);
        Ok(Submission::Committed(committed))
    }

    /// Deletes every live object as one atomic, undoable operation.
    pub fn clear(
        &mut self,
        session_id: SessionId,
        client_clock: ClientClock,
    ) -> Result<Submission, RejectReason> {
        let user_id = self.user_of(session_id)?;
        if self.is_duplicate(user_id, client_clock) {
            return Ok(Submission::Discarded);
        }

        let mutations = self
            .document
            .live_object_ids()
            .into_iter()
            .map(Mutation::DeleteObject)
            .collect::<Vec<_>>();
        if mutations.is_empty() {
            self.last_clock.insert(user_id, client_clock);
            return Ok(Submission::Discarded);
        }

        let committed = self.commit(session_id, client_clock, mutations, true);
        self.last_clock.insert(user_id, client_clock);
        Ok(Submission::Committed(committed))
    }

    fn user_of(&self, session_id: SessionId) -> Result<UserId, RejectReason> {
        self.users
            .get(&session_id)
            .copied()
            .ok_or(RejectReason::NotJoined)
    }

    fn is_duplicate(&self, user_id: UserId, client_clock: ClientClock) -> bool {
        self.last_clock
            .get(&user_id)
            .map(|last| client_clock <= *last)
            .unwrap_or(false)
    }

    fn commit(
        &mut self,
        session_id: SessionId,
        client_clock: ClientClock,
        mutations: Vec<Mutation>,
        undoable: bool,
    ) -> CommittedOperation {
        let sequence = self.sequencer.next();
        let inverse = self.document.invert(&mutations);
        let committed = CommittedOperation {
            sequence,
            origin: session_id,
            client_clock,
            mutations,
        };
        self.document.apply(&committed);
        if undoable {
            self.history.record(HistoryEntry {
                sequence,
                forward: committed.mutations.clone(),
                inverse,
                session_id,
                committed_at: now_millis(),
            });
        }
        committed
    }

    /// Lowers client intent into canonical mutations. Batches expand into one
    /// mutation list committed under a single sequence number; any failure
    /// rejects the whole submission.
    fn expand(&self, kind: OperationKind) -> Result<Vec<Mutation>, RejectReason> {
        let mut mutations = Vec::new();
        match kind {
            OperationKind::Batch(kinds) => {
                for inner in kinds {
                    if let OperationKind::Batch(_) = inner {
                        return Err(RejectReason::InvalidOperation);
                    }
                    self.expand_single(inner, &mut mutations)?;
                }
            }
            single => self.expand_single(single, &mut mutations)?,
        }
        Ok(mutations)
    }

    fn expand_single(
        &self,
        kind: OperationKind,
        mutations: &mut Vec<Mutation>,
    ) -> Result<(), RejectReason> {
        match kind {
            OperationKind::Create {
                object_id,
                object_kind,
                attrs,
            } => {
                mutations.push(Mutation::CreateObject(object_id, object_kind));
                for (attr_kind, attr_value) in attrs {
                    mutations.push(Mutation::UpsertAttr(object_id, attr_kind, Some(attr_value)));
                }
            }
            OperationKind::Update { object_id, attrs } => {
                if attrs.is_empty() {
                    return Err(RejectReason::InvalidOperation);
                }
                for (attr_kind, attr_value_opt) in attrs {
                    mutations.push(Mutation::UpsertAttr(object_id, attr_kind, attr_value_opt));
                }
            }
            OperationKind::Delete { object_id } => {
                mutations.push(Mutation::DeleteObject(object_id));
            }
            OperationKind::Reorder {
                object_id,
                int_index,
            } => {
                let z_index = self.resolve_reorder(&object_id, int_index)?;
                mutations.push(Mutation::UpsertAttr(
                    object_id,
                    AttrKind::ZIndex,
                    Some(AttrValue::String(z_index.to_string())),
                ));
            }
            OperationKind::Batch(_) => return Err(RejectReason::InvalidOperation),
        }
        Ok(())
    }

    fn resolve_reorder(
        &self,
        object_id: &ObjectId,
        int_index: usize,
    ) -> Result<Base95, RejectReason> {
        if !self.document.is_live(object_id) {
            return Err(self.missing_target_reason(object_id));
        }
        let mut order = self.document.zorder();
        order.retain(|(id, _)| id != object_id);

        if int_index > order.len() {
            return Err(RejectReason::InvalidOperation);
        }
        Ok(if order.is_empty() {
            Base95::mid()
        } else if int_index == 0 {
            Base95::avg_with_zero(&order[0].1)
        } else if int_index == order.len() {
            Base95::avg_with_one(&order[order.len() - 1].1)
        } else {
            Base95::avg(&order[int_index - 1].1, &order[int_index].1)
        })
    }

    /// Validates mutation targets against current state. Objects created
    /// earlier in the same list count as present, so a batch may update what
    /// it creates. Deletion is terminal for clients: creating over a
    /// tombstone is stale unless `allow_revival` is set, which only the
    /// undo/redo path does to bring an undone delete back.
    fn ensure_applicable(
        &self,
        mutations: &[Mutation],
        allow_revival: bool,
    ) -> Result<(), RejectReason> {
        let mut pending: HashSet<ObjectId> = HashSet::new();
        for mutation in mutations {
            match mutation {
                Mutation::CreateObject(object_id, _) => {
                    if self.document.is_live(object_id) || pending.contains(object_id) {
                        return Err(RejectReason::InvalidOperation);
                    }
                    if !allow_revival && self.document.is_tombstoned(object_id) {
                        return Err(RejectReason::StaleReference);
                    }
                    pending.insert(*object_id);
                }
                Mutation::UpsertAttr(object_id, _, _) | Mutation::DeleteObject(object_id) => {
                    if !self.document.is_live(object_id) && !pending.contains(object_id) {
                        return Err(self.missing_target_reason(object_id));
                    }
                }
            }
        }
        Ok(())
    }

    fn missing_target_reason(&self, object_id: &ObjectId) -> RejectReason {
        if self.document.is_tombstoned(object_id) {
            RejectReason::StaleReference
        } else {
            RejectReason::InvalidOperation
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn joined_coordinator() -> (RoomCoordinator, SessionId) {
        let mut coordinator = RoomCoordinator::new(uuid::Uuid::new_v4());
        let session_id = 1;
        coordinator.bind(session_id, uuid::Uuid::new_v4());
        (coordinator, session_id)
    }

    fn create_op(clock: ClientClock, object_id: ObjectId) -> ClientOperation {
        ClientOperation {
            client_clock: clock,
            kind: OperationKind::Create {
                object_id,
                object_kind: ObjectKind::Shape,
                attrs: HashMap::new(),
            },
        }
    }

    fn committed(submission: Submission) -> CommittedOperation {
        match submission {
            Submission::Committed(operation) => operation,
            Submission::Discarded => panic!("expected a commit"),
        }
    }

    #[test]
    fn it_rejects_submissions_before_join() {
        let mut coordinator = RoomCoordinator::new(uuid::Uuid::new_v4());
        let result = coordinator.submit(7, create_op(1, uuid::Uuid::new_v4()));
        assert_eq!(result.unwrap_err(), RejectReason::NotJoined);
    }

    #[test]
    fn it_applies_batches_atomically() {
        let (mut coordinator, session_id) = joined_coordinator();
        let a = uuid::Uuid::new_v4();
        let missing = uuid::Uuid::new_v4();

        let batch = ClientOperation {
            client_clock: 1,
            kind: OperationKind::Batch(vec![
                OperationKind::Create {
                    object_id: a,
                    object_kind: ObjectKind::Shape,
                    attrs: HashMap::new(),
                },
                OperationKind::Delete { object_id: missing },
            ]),
        };

        let result = coordinator.submit(session_id, batch);
        assert_eq!(result.unwrap_err(), RejectReason::InvalidOperation);
        // Nothing from the failed batch was applied.
        assert!(coordinator.document().get(&a).is_none());
        assert_eq!(coordinator.document().head_sequence(), 0);
    }

    #[test]
    fn it_lets_a_batch_update_what_it_creates() {
        let (mut coordinator, session_id) = joined_coordinator();
        let a = uuid::Uuid::new_v4();

        let mut attrs = HashMap::new();
        attrs.insert(AttrKind::PosX, Some(AttrValue::Float(5.0)));
        let batch = ClientOperation {
            client_clock: 1,
            kind: OperationKind::Batch(vec![
                OperationKind::Create {
                    object_id: a,
                    object_kind: ObjectKind::Text,
                    attrs: HashMap::new(),
                },
                OperationKind::Update {
                    object_id: a,
                    attrs,
                },
            ]),
        };

        let operation = committed(coordinator.submit(session_id, batch).unwrap());
        assert_eq!(operation.sequence, 1);
        assert!(coordinator.document().is_live(&a));
    }

    #[test]
    fn it_resolves_reorder_to_a_fractional_index() {
        let (mut coordinator, session_id) = joined_coordinator();
        let a = uuid::Uuid::new_v4();
        let b = uuid::Uuid::new_v4();

        coordinator.submit(session_id, create_op(1, a)).unwrap();
        coordinator.submit(session_id, create_op(2, b)).unwrap();

        let reorder = ClientOperation {
            client_clock: 3,
            kind: OperationKind::Reorder {
                object_id: b,
                int_index: 0,
            },
        };
        committed(coordinator.submit(session_id, reorder).unwrap());

        let order = coordinator.document().zorder();
        assert_eq!(order[0].0, b);
        assert_eq!(order[1].0, a);
    }

    #[test]
    fn it_rejects_reorder_out_of_range() {
        let (mut coordinator, session_id) = joined_coordinator();
        let a = uuid::Uuid::new_v4();
        coordinator.submit(session_id, create_op(1, a)).unwrap();

        let reorder = ClientOperation {
            client_clock: 2,
            kind: OperationKind::Reorder {
                object_id: a,
                int_index: 5,
            },
        };
        assert_eq!(
            coordinator.submit(session_id, reorder).unwrap_err(),
            RejectReason::InvalidOperation
        );
    }

    #[test]
    fn it_clears_all_live_objects_at_once() {
        let (mut coordinator, session_id) = joined_coordinator();
        let a = uuid::Uuid::new_v4();
        let b = uuid::Uuid::new_v4();
        coordinator.submit(session_id, create_op(1, a)).unwrap();
        coordinator.submit(session_id, create_op(2, b)).unwrap();

        let operation = committed(coordinator.clear(session_id, 3).unwrap());
        assert_eq!(operation.mutations.len(), 2);
        assert!(coordinator.document().live_object_ids().is_empty());

        // Clearing is undoable like any other operation.
        committed(coordinator.undo(session_id, 4).unwrap());
        assert_eq!(coordinator.document().live_object_ids().len(), 2);
    }

    #[test]
    fn it_discards_clear_when_nothing_is_live() {
        let (mut coordinator, session_id) = joined_coordinator();

        match coordinator.clear(session_id, 1).unwrap() {
            Submission::Discarded => {}
            Submission::Committed(_) => panic!("empty clear must not commit"),
        }
        // No sequence number was consumed and nothing is undoable.
        assert_eq!(coordinator.document().head_sequence(), 0);
        assert_eq!(
            coordinator.undo(session_id, 2).unwrap_err(),
            RejectReason::NoHistory
        );
    }
}
