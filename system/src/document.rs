use std::collections::HashMap;
use std::str::FromStr;

use base95::Base95;
use serde::{Deserialize, Serialize};

use crate::operation::{CommittedOperation, Mutation};
use crate::types::*;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanvasObject {
    pub id: ObjectId,
    pub kind: ObjectKind,
    pub attrs: HashMap<AttrKind, AttrValue>,
    /// Sequence number of the last committed operation touching this object.
    pub last_sequence: SequenceNumber,
    /// Tombstone. Kept so stale references can be told apart from unknown ids.
    pub deleted: bool,
}

#[derive(Debug)]
pub enum ReplayError {
    /// The requested point predates the retained log; the caller must fall
    /// back to a full snapshot catch-up.
    TooOld,
}

/// Authoritative object set of one room plus its append-only operation log.
/// Mutated only through already-sequenced, coordinator-approved operations.
#[derive(Debug, Serialize, Deserialize)]
pub struct DocumentStore {
    room_id: RoomId,
    objects: HashMap<ObjectId, CanvasObject>,
    head: SequenceNumber,
    #[serde(skip)]
    log: Vec<CommittedOperation>,
    #[serde(skip)]
    last_checkpoint: SequenceNumber,
}

impl DocumentStore {
    pub fn new(room_id: RoomId) -> Self {
        Self {
            room_id,
            objects: HashMap::new(),
            head: 0,
            log: Vec::new(),
            last_checkpoint: 0,
        }
    }

    pub fn from_snapshot(snapshot: &DocumentSnapshot) -> bincode::Result<Self> {
        let mut store: DocumentStore = bincode::deserialize(snapshot.content())?;
        store.last_checkpoint = store.head;
        Ok(store)
    }

    pub fn room_id(&self) -> RoomId {
        self.room_id
    }

    pub fn head_sequence(&self) -> SequenceNumber {
        self.head
    }

    pub fn last_checkpoint(&self) -> SequenceNumber {
        self.last_checkpoint
    }

    pub fn get(&self, object_id: &ObjectId) -> Option<&CanvasObject> {
        self.objects.get(object_id)
    }

    pub fn objects(&self) -> &HashMap<ObjectId, CanvasObject> {
        &self.objects
    }

    pub fn is_live(&self, object_id: &ObjectId) -> bool {
        self.objects
            .get(object_id)
            .map(|object| !object.deleted)
            .unwrap_or(false)
    }

    pub fn is_tombstoned(&self, object_id: &ObjectId) -> bool {
        self.objects
            .get(object_id)
            .map(|object| object.deleted)
            .unwrap_or(false)
    }

    pub fn live_object_ids(&self) -> Vec<ObjectId> {
        self.objects
            .values()
            .filter(|object| !object.deleted)
            .map(|object| object.id)
            .collect()
    }

    /// Live objects in stacking order, bottom first.
    pub fn zorder(&self) -> Vec<(ObjectId, Base95)> {
        let mut result = self
            .objects
            .values()
            .filter(|object| !object.deleted)
            .map(|object| {
                let index = object
                    .attrs
                    .get(&AttrKind::ZIndex)
                    .and_then(|value| value.as_str())
                    .and_then(|index_str| Base95::from_str(index_str).ok())
                    .unwrap_or(Base95::mid());
                (object.id, index)
            })
            .collect::<Vec<_>>();
        result.sort_by(|(_, index1), (_, index2)| index1.cmp(index2));
        result
    }

    /// Applies a committed operation. Sequences must arrive gap-free.
    pub fn apply(&mut self, operation: &CommittedOperation) {
        debug_assert_eq!(operation.sequence, self.head + 1);
        for mutation in &operation.mutations {
            self.mutate(mutation, operation.sequence);
        }
        self.head = operation.sequence;
        self.log.push(operation.clone());
    }

    fn mutate(&mut self, mutation: &Mutation, sequence: SequenceNumber) {
        match mutation {
            Mutation::CreateObject(object_id, object_kind) => {
                // Overwrites a tombstone on undo-of-delete revival.
                self.objects.insert(
                    *object_id,
                    CanvasObject {
                        id: *object_id,
                        kind: *object_kind,
                        attrs: HashMap::new(),
                        last_sequence: sequence,
                        deleted: false,
                    },
                );
            }
            Mutation::UpsertAttr(object_id, attr_kind, attr_value_opt) => {
                if let Some(object) = self.objects.get_mut(object_id) {
                    match attr_value_opt {
                        Some(attr_value) => {
                            object.attrs.insert(*attr_kind, attr_value.clone());
                        }
                        None => {
                            object.attrs.remove(attr_kind);
                        }
                    }
                    object.last_sequence = sequence;
                } else {
                    log::warn!(
                        "upsert for unknown object {} at sequence {}",
                        object_id,
                        sequence
                    );
                }
            }
            Mutation::DeleteObject(object_id) => {
                if let Some(object) = self.objects.get_mut(object_id) {
                    object.deleted = true;
                    object.last_sequence = sequence;
                }
            }
        }
    }

    /// Inverse of `mutations` against the current (pre-apply) state. Applying
    /// the result right after the forward mutations restores this exact state.
    pub fn invert(&self, mutations: &[Mutation]) -> Vec<Mutation> {
        let mut inverse = Vec::new();
        for mutation in mutations.iter().rev() {
            match mutation {
                Mutation::CreateObject(object_id, _) => {
                    inverse.push(Mutation::DeleteObject(*object_id));
                }
                Mutation::UpsertAttr(object_id, attr_kind, _) => {
                    let prior = self
                        .objects
                        .get(object_id)
                        .filter(|object| !object.deleted)
                        .and_then(|object| object.attrs.get(attr_kind))
                        .cloned();
                    inverse.push(Mutation::UpsertAttr(*object_id, *attr_kind, prior));
                }
                Mutation::DeleteObject(object_id) => {
                    if let Some(object) = self.objects.get(object_id) {
                        inverse.push(Mutation::CreateObject(*object_id, object.kind));
                        for (attr_kind, attr_value) in &object.attrs {
                            inverse.push(Mutation::UpsertAttr(
                                *object_id,
                                *attr_kind,
                                Some(attr_value.clone()),
                            ));
                        }
                    }
                }
            }
        }
        inverse
    }

    /// Committed operations with sequence greater than `after`, oldest first.
    pub fn replay_from(
        &self,
        after: SequenceNumber,
    ) -> Result<impl Iterator<Item = &CommittedOperation>, ReplayError> {
        let oldest_retained = self.head - self.log.len() as u64;
        if after < oldest_retained {
            return Err(ReplayError::TooOld);
        }
        Ok(self
            .log
            .iter()
            .skip_while(move |operation| operation.sequence <= after))
    }

    pub fn snapshot(&self) -> DocumentSnapshot {
        self.into()
    }

    pub fn mark_checkpoint(&mut self, sequence: SequenceNumber) {
        debug_assert!(sequence <= self.head);
        self.last_checkpoint = sequence;
    }

    /// Drops log entries covered by a durable checkpoint. Sessions whose
    /// catch-up point predates it fall back to the snapshot path.
    pub fn prune_log(&mut self, upto: SequenceNumber) {
        self.log.retain(|operation| operation.sequence > upto);
    }
}

/// Opaque point-in-time copy of a room's object set, cheap to hand to a
/// joining session or a snapshot flush.
#[derive(Clone, Serialize, Deserialize)]
pub struct DocumentSnapshot {
    content: Vec<u8>,
}

impl DocumentSnapshot {
    pub fn from_vec(content: Vec<u8>) -> Self {
        Self { content }
    }

    pub fn content(&self) -> &[u8] {
        &self.content
    }
}

impl std::fmt::Debug for DocumentSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentSnapshot")
            .field("size", &self.content.len())
            .finish()
    }
}

impl From<&DocumentStore> for DocumentSnapshot {
    fn from(store: &DocumentStore) -> Self {
        DocumentSnapshot {
            content: bincode::serialize(store).expect("object set must serialize"),
        }
    }
}
