use euclid::default::Point2D;
use serde::{Deserialize, Serialize};

use crate::document::DocumentSnapshot;
use crate::operation::{CommittedOperation, OperationKind};
use crate::types::*;

/// Every inbound frame carries the session's logical clock so a retried
/// submission after reconnect is recognized and applied exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentifiableCommand {
    pub client_clock: ClientClock,
    pub command: RoomCommand,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RoomCommand {
    Join {
        /// Opaque user identity token; empty means anonymous.
        token: String,
        name: Option<String>,
        /// Last sequence this client observed before disconnecting, if any.
        resume_from: Option<SequenceNumber>,
    },
    Leave,
    Operation(OperationKind),
    Undo,
    Redo,
    ClearRoom,
    /// Best-effort: not sequenced, not persisted, not replayed on reconnect.
    Presence(PresenceData),
    RenameUser {
        name: String,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PresenceData {
    pub cursor: Option<Point2D<f32>>,
    pub selection: Vec<ObjectId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantInfo {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub name: String,
    pub color: Color,
}

/// Join catch-up payload. A reconnecting session whose resume point is still
/// in the retained log receives only the missed operations; everyone else
/// gets a full snapshot, avoiding unbounded replay for long-lived rooms.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CatchUp {
    Snapshot(DocumentSnapshot),
    Replay(Vec<CommittedOperation>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RoomEvent {
    Joined {
        session_id: SessionId,
        participants: Vec<ParticipantInfo>,
        catch_up: CatchUp,
        head_sequence: SequenceNumber,
    },
    /// Delivered to every member including the originator, in log order.
    Committed(CommittedOperation),
    Rejected {
        reason: RejectReason,
        client_clock: ClientClock,
    },
    ParticipantJoined(ParticipantInfo),
    ParticipantLeft {
        session_id: SessionId,
    },
    ParticipantRenamed {
        session_id: SessionId,
        name: String,
    },
    PresenceChanged {
        session_id: SessionId,
        presence: PresenceData,
    },
    /// Durability lost; changes may not be saved and new writes are refused.
    Degraded,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
pub enum RejectReason {
    /// Malformed, or references an object that never existed.
    InvalidOperation,
    /// Target was deleted or superseded; the client must resync.
    StaleReference,
    NoHistory,
    PersistenceFailure,
    /// Command sent before a successful join handshake.
    NotJoined,
}
