use std::collections::HashMap;

use system::{
    AttrKind, AttrValue, ClientOperation, CommittedOperation, ObjectId, ObjectKind,
    OperationKind, RejectReason, RoomCoordinator, SessionId, Submission,
};

fn coordinator_with_sessions(sessions: &[SessionId]) -> RoomCoordinator {
    let mut coordinator = RoomCoordinator::new(uuid::Uuid::new_v4());
    for session_id in sessions {
        coordinator.bind(*session_id, uuid::Uuid::new_v4());
    }
    coordinator
}

fn committed(submission: Submission) -> CommittedOperation {
    match submission {
        Submission::Committed(operation) => operation,
        Submission::Discarded => panic!("expected a commit"),
    }
}

fn create_with_pos(
    coordinator: &mut RoomCoordinator,
    session_id: SessionId,
    clock: u64,
    pos_x: f32,
) -> ObjectId {
    let object_id = uuid::Uuid::new_v4();
    let mut attrs = HashMap::new();
    attrs.insert(AttrKind::PosX, AttrValue::Float(pos_x));
    coordinator
        .submit(
            session_id,
            ClientOperation {
                client_clock: clock,
                kind: OperationKind::Create {
                    object_id,
                    object_kind: ObjectKind::Shape,
                    attrs,
                },
            },
        )
        .unwrap();
    object_id
}

fn move_to(
    coordinator: &mut RoomCoordinator,
    session_id: SessionId,
    clock: u64,
    object_id: ObjectId,
    pos_x: f32,
) {
    let mut attrs = HashMap::new();
    attrs.insert(AttrKind::PosX, Some(AttrValue::Float(pos_x)));
    coordinator
        .submit(
            session_id,
            ClientOperation {
                client_clock: clock,
                kind: OperationKind::Update { object_id, attrs },
            },
        )
        .unwrap();
}

fn pos_x(coordinator: &RoomCoordinator, object_id: &ObjectId) -> Option<f32> {
    coordinator
        .document()
        .get(object_id)
        .and_then(|object| object.attrs.get(&AttrKind::PosX))
        .and_then(|value| value.as_float().copied())
}

#[test]
fn undo_appends_a_compensating_operation() {
    let mut coordinator = coordinator_with_sessions(&[1]);
    let object_id = create_with_pos(&mut coordinator, 1, 1, 10.0);
    move_to(&mut coordinator, 1, 2, object_id, 20.0);

    let operation = committed(coordinator.undo(1, 3).unwrap());
    // History is never rewritten; the undo gets the next sequence number.
    assert_eq!(operation.sequence, 3);
    assert_eq!(pos_x(&coordinator, &object_id), Some(10.0));

    let operation = committed(coordinator.redo(1, 4).unwrap());
    assert_eq!(operation.sequence, 4);
    assert_eq!(pos_x(&coordinator, &object_id), Some(20.0));
}

#[test]
fn undo_of_a_create_deletes_and_redo_revives() {
    let mut coordinator = coordinator_with_sessions(&[1]);
    let object_id = create_with_pos(&mut coordinator, 1, 1, 10.0);

    committed(coordinator.undo(1, 2).unwrap());
    assert!(coordinator.document().is_tombstoned(&object_id));

    committed(coordinator.redo(1, 3).unwrap());
    assert!(coordinator.document().is_live(&object_id));
    assert_eq!(pos_x(&coordinator, &object_id), Some(10.0));
}

#[test]
fn undo_of_a_delete_restores_all_attributes() {
    let mut coordinator = coordinator_with_sessions(&[1]);
    let object_id = create_with_pos(&mut coordinator, 1, 1, 10.0);
    move_to(&mut coordinator, 1, 2, object_id, 30.0);

    coordinator
        .submit(
            1,
            ClientOperation {
                client_clock: 3,
                kind: OperationKind::Delete { object_id },
            },
        )
        .unwrap();
    assert!(coordinator.document().is_tombstoned(&object_id));

    committed(coordinator.undo(1, 4).unwrap());
    assert!(coordinator.document().is_live(&object_id));
    // Attributes come back as they were at the moment of deletion.
    assert_eq!(pos_x(&coordinator, &object_id), Some(30.0));
}

#[test]
fn histories_are_scoped_per_session() {
    let mut coordinator = coordinator_with_sessions(&[1, 2]);
    let a = create_with_pos(&mut coordinator, 1, 1, 10.0);
    let b = create_with_pos(&mut coordinator, 2, 1, 50.0);

    // Session 2's undo takes back its own create, not session 1's.
    committed(coordinator.undo(2, 2).unwrap());
    assert!(coordinator.document().is_live(&a));
    assert!(coordinator.document().is_tombstoned(&b));
}

#[test]
fn undo_with_no_history_is_rejected() {
    let mut coordinator = coordinator_with_sessions(&[1]);
    assert_eq!(
        coordinator.undo(1, 1).unwrap_err(),
        RejectReason::NoHistory
    );
    assert_eq!(
        coordinator.redo(1, 2).unwrap_err(),
        RejectReason::NoHistory
    );
}

#[test]
fn a_new_submission_clears_the_redo_stack() {
    let mut coordinator = coordinator_with_sessions(&[1]);
    let object_id = create_with_pos(&mut coordinator, 1, 1, 10.0);
    move_to(&mut coordinator, 1, 2, object_id, 20.0);

    committed(coordinator.undo(1, 3).unwrap());
    move_to(&mut coordinator, 1, 4, object_id, 99.0);

    assert_eq!(
        coordinator.redo(1, 5).unwrap_err(),
        RejectReason::NoHistory
    );
}

#[test]
fn undo_whose_target_was_deleted_by_someone_else_is_stale() {
    let mut coordinator = coordinator_with_sessions(&[1, 2]);
    let object_id = create_with_pos(&mut coordinator, 1, 1, 10.0);
    move_to(&mut coordinator, 1, 2, object_id, 20.0);

    coordinator
        .submit(
            2,
            ClientOperation {
                client_clock: 1,
                kind: OperationKind::Delete { object_id },
            },
        )
        .unwrap();

    // The move can no longer be taken back; the entry is dropped for good.
    assert_eq!(
        coordinator.undo(1, 3).unwrap_err(),
        RejectReason::StaleReference
    );
    // Next undo reaches the create underneath, stale for the same reason,
    // and after that the stack is empty.
    assert_eq!(
        coordinator.undo(1, 4).unwrap_err(),
        RejectReason::StaleReference
    );
    assert_eq!(coordinator.undo(1, 5).unwrap_err(), RejectReason::NoHistory);
}
