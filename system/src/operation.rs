use crate::types::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Canonical, already-validated unit of change. Committed operations are a
/// flat list of these; folding them in sequence order is the only way any
/// replica mutates its object set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Mutation {
    CreateObject(ObjectId, ObjectKind),
    /// `None` unsets the attribute.
    UpsertAttr(ObjectId, AttrKind, Option<AttrValue>),
    DeleteObject(ObjectId),
}

impl Mutation {
    pub fn target(&self) -> &ObjectId {
        match self {
            Mutation::CreateObject(id, _) => id,
            Mutation::UpsertAttr(id, _, _) => id,
            Mutation::DeleteObject(id) => id,
        }
    }
}

/// Client intent, before ordering and validation. `Reorder` carries an
/// integer position; the coordinator resolves it to a fractional z-index so
/// the committed form is deterministic for every replica.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OperationKind {
    Create {
        object_id: ObjectId,
        object_kind: ObjectKind,
        attrs: HashMap<AttrKind, AttrValue>,
    },
    Update {
        object_id: ObjectId,
        attrs: HashMap<AttrKind, Option<AttrValue>>,
    },
    Delete {
        object_id: ObjectId,
    },
    Reorder {
        object_id: ObjectId,
        int_index: usize,
    },
    /// Applied atomically under a single sequence number. Nesting is not
    /// allowed.
    Batch(Vec<OperationKind>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientOperation {
    pub client_clock: ClientClock,
    pub kind: OperationKind,
}

/// Immutable once sequenced; append-only in the room log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommittedOperation {
    pub sequence: SequenceNumber,
    pub origin: SessionId,
    pub client_clock: ClientClock,
    pub mutations: Vec<Mutation>,
}
