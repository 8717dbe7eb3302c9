use tokio::sync::mpsc::{channel, Sender};
use tokio::time::{interval, Duration, Instant};

use system::{
    CatchUp, ClientOperation, CommittedOperation, IdentifiableCommand, RejectReason,
    RoomCommand, RoomCoordinator, RoomEvent, RoomId, SequenceNumber, SessionId, Submission,
};

use crate::config::ServerConfig;
use crate::persistence::{self, LogCommand};
use crate::registry::{SessionRegistry, SessionTx};
use crate::server::{ServerCommand, ServerTx};

const TICK_INTERVAL: Duration = Duration::from_secs(1);

pub type RoomTx = Sender<RoomMessage>;

#[derive(Debug)]
pub enum RoomMessage {
    Attach {
        session_id: SessionId,
        tx: SessionTx,
    },
    Detach {
        session_id: SessionId,
    },
    Command {
        from: SessionId,
        command: IdentifiableCommand,
    },
    /// Router-confirmed end of life; the actor flushes and exits.
    Shutdown,
    Internal(RoomInternal),
}

#[derive(Debug)]
pub enum RoomInternal {
    SnapshotWritten { sequence: SequenceNumber },
    SnapshotFailed,
    /// The operation log could not be appended even after retries.
    LogDead,
}

/// The serial actor owning one room: every submission is ordered, applied
/// and fanned out here, one message at a time. Rooms never share state, so
/// the runtime may run any number of them in parallel.
struct RoomActor {
    room_id: RoomId,
    config: ServerConfig,
    coordinator: RoomCoordinator,
    registry: SessionRegistry,
    srv_tx: ServerTx,
    self_tx: RoomTx,
    log_tx: Sender<LogCommand>,
    degraded: bool,
    snapshot_in_flight: bool,
    last_checkpoint_at: Instant,
    empty_since: Option<Instant>,
}

pub fn spawn_room(room_id: RoomId, config: ServerConfig, srv_tx: ServerTx) -> RoomTx {
    let (room_tx, mut room_rx) = channel::<RoomMessage>(64);
    let self_tx = room_tx.clone();

    tokio::spawn(async move {
        let (coordinator, degraded) =
            match persistence::load_room(&config.data_dir, &room_id).await {
                Ok(Some(document)) => {
                    log::info!(
                        "room {} recovered at sequence {}",
                        room_id,
                        document.head_sequence()
                    );
                    (RoomCoordinator::recover(document), false)
                }
                Ok(None) => (RoomCoordinator::new(room_id), false),
                Err(err) => {
                    // Durable state exists but cannot be read; refuse writes
                    // rather than risk overwriting it.
                    log::error!("room {} recovery failed: {:?}", room_id, err);
                    (RoomCoordinator::new(room_id), true)
                }
            };

        let (log_tx, log_writer) =
            persistence::spawn_log_writer(config.data_dir.clone(), room_id, self_tx.clone());
        let mut done_tx = srv_tx.clone();

        let mut actor = RoomActor {
            room_id,
            config,
            coordinator,
            registry: SessionRegistry::new(),
            srv_tx,
            self_tx,
            log_tx,
            degraded,
            snapshot_in_flight: false,
            last_checkpoint_at: Instant::now(),
            empty_since: None,
        };

        let mut ticker = interval(TICK_INTERVAL);
        loop {
            tokio::select! {
                message = room_rx.recv() => match message {
                    Some(RoomMessage::Shutdown) | None => break,
                    Some(message) => actor.handle(message).await,
                },
                _ = ticker.tick() => actor.tick().await,
            }
        }

        actor.final_flush().await;
        // Close the writer's queue and wait for queued appends to hit disk.
        // Only then may the router let a successor recover this room's files.
        drop(actor);
        let _ = log_writer.await;
        let _ = done_tx
            .send(ServerCommand::RoomClosed { room_id })
            .await;
        log::info!("room {} closed", room_id);
    });

    room_tx
}

impl RoomActor {
    async fn handle(&mut self, message: RoomMessage) {
        match message {
            RoomMessage::Attach { session_id, tx } => {
                self.registry.attach(session_id, tx);
                self.empty_since = None;
            }
            RoomMessage::Detach { session_id } => {
                self.remove_session(session_id, false);
            }
            RoomMessage::Command { from, command } => {
                self.handle_command(from, command).await;
            }
            RoomMessage::Internal(internal) => self.handle_internal(internal),
            RoomMessage::Shutdown => unreachable!("handled by the actor loop"),
        }
    }

    async fn handle_command(&mut self, from: SessionId, command: IdentifiableCommand) {
        let IdentifiableCommand {
            client_clock,
            command,
        } = command;

        if let RoomCommand::Join {
            token,
            name,
            resume_from,
        } = command
        {
            self.handle_join(from, token, name, resume_from);
            return;
        }

        if !self.registry.is_member(from) {
            self.reject(from, RejectReason::NotJoined, client_clock);
            return;
        }

        match command {
            RoomCommand::Leave => {
                self.remove_session(from, true);
            }
            RoomCommand::Operation(kind) => {
                let operation = ClientOperation { client_clock, kind };
                let result = self
                    .writable()
                    .and_then(|actor| actor.coordinator.submit(from, operation));
                self.finish_submission(from, client_clock, result);
            }
            RoomCommand::Undo => {
                let result = self
                    .writable()
                    .and_then(|actor| actor.coordinator.undo(from, client_clock));
                self.finish_submission(from, client_clock, result);
            }
            RoomCommand::Redo => {
                let result = self
                    .writable()
                    .and_then(|actor| actor.coordinator.redo(from, client_clock));
                self.finish_submission(from, client_clock, result);
            }
            RoomCommand::ClearRoom => {
                let result = self
                    .writable()
                    .and_then(|actor| actor.coordinator.clear(from, client_clock));
                self.finish_submission(from, client_clock, result);
            }
            RoomCommand::Presence(presence) => {
                if self.registry.set_presence(from, presence.clone()) {
                    let dropped = self.registry.broadcast(
                        RoomEvent::PresenceChanged {
                            session_id: from,
                            presence,
                        },
                        Some(from),
                    );
                    self.drop_sessions(dropped);
                }
            }
            RoomCommand::RenameUser { name } => {
                if self.registry.rename(from, name.clone()) {
                    let dropped = self.registry.broadcast(
                        RoomEvent::ParticipantRenamed {
                            session_id: from,
                            name,
                        },
                        Some(from),
                    );
                    self.drop_sessions(dropped);
                }
            }
            RoomCommand::Join { .. } => unreachable!("handled above"),
        }
    }

    fn handle_join(
        &mut self,
        from: SessionId,
        token: String,
        name: Option<String>,
        resume_from: Option<SequenceNumber>,
    ) {
        let info = match self.registry.join(from, &token, name) {
            Some(info) => info,
            None => {
                log::warn!("join from unattached or already joined session {}", from);
                return;
            }
        };
        self.coordinator.bind(from, info.user_id);

        let document = self.coordinator.document();
        let head_sequence = document.head_sequence();
        let catch_up = match resume_from {
            Some(observed) => match document.replay_from(observed) {
                Ok(operations) => CatchUp::Replay(operations.cloned().collect()),
                Err(_) => CatchUp::Snapshot(document.snapshot()),
            },
            None => CatchUp::Snapshot(document.snapshot()),
        };

        self.registry.send_to(
            from,
            RoomEvent::Joined {
                session_id: from,
                participants: self.registry.roster(),
                catch_up,
                head_sequence,
            },
        );
        if self.degraded {
            self.registry.send_to(from, RoomEvent::Degraded);
        }
        // Cursors and selections of everyone already here; presence is not in
        // the snapshot, so the joiner learns it here or on the next change.
        for (session_id, presence) in self.registry.presences() {
            if session_id == from {
                continue;
            }
            self.registry.send_to(
                from,
                RoomEvent::PresenceChanged {
                    session_id,
                    presence,
                },
            );
        }
        let dropped = self
            .registry
            .broadcast(RoomEvent::ParticipantJoined(info), Some(from));
        self.drop_sessions(dropped);
    }

    /// Gate for state-changing commands while durability is lost.
    fn writable(&mut self) -> Result<&mut Self, RejectReason> {
        if self.degraded {
            Err(RejectReason::PersistenceFailure)
        } else {
            Ok(self)
        }
    }

    fn finish_submission(
        &mut self,
        from: SessionId,
        client_clock: u64,
        result: Result<Submission, RejectReason>,
    ) {
        match result {
            Ok(Submission::Committed(operation)) => self.commit(operation),
            Ok(Submission::Discarded) => {
                log::debug!(
                    "discarding submission from {} at clock {}",
                    from,
                    client_clock
                );
            }
            Err(reason) => self.reject(from, reason, client_clock),
        }
    }

    fn commit(&mut self, operation: CommittedOperation) {
        if self
            .log_tx
            .try_send(LogCommand::Append(operation.clone()))
            .is_err()
        {
            // Writer dead or hopelessly behind; either way durability is gone.
            log::error!("room {} cannot queue log append", self.room_id);
            self.enter_degraded();
        }

        let dropped = self
            .registry
            .broadcast(RoomEvent::Committed(operation), None);
        self.drop_sessions(dropped);
    }

    fn reject(&mut self, from: SessionId, reason: RejectReason, client_clock: u64) {
        log::debug!("rejecting clock {} from {}: {:?}", client_clock, from, reason);
        self.registry.send_to(
            from,
            RoomEvent::Rejected {
                reason,
                client_clock,
            },
        );
    }

    /// Removes a session and tells the rest of the room. Dropping the member
    /// record closes its outbound queue, which ends the connection actor.
    fn remove_session(&mut self, session_id: SessionId, explicit_leave: bool) {
        let was_member = self.registry.detach(session_id).is_some();
        self.coordinator.unbind(session_id);
        if was_member {
            log::info!(
                "session {} {} room {}",
                session_id,
                if explicit_leave { "left" } else { "dropped from" },
                self.room_id
            );
            let dropped = self
                .registry
                .broadcast(RoomEvent::ParticipantLeft { session_id }, None);
            self.drop_sessions(dropped);
        }
        if self.registry.is_empty() {
            self.empty_since.get_or_insert(Instant::now());
        }
    }

    /// Sessions whose queue overflowed mid-broadcast. Removing them is itself
    /// a broadcast, so keep going until the registry settles.
    fn drop_sessions(&mut self, mut dropped: Vec<SessionId>) {
        while let Some(session_id) = dropped.pop() {
            self.remove_session(session_id, false);
        }
    }

    fn handle_internal(&mut self, internal: RoomInternal) {
        match internal {
            RoomInternal::SnapshotWritten { sequence } => {
                self.snapshot_in_flight = false;
                self.last_checkpoint_at = Instant::now();

                let retained: Vec<CommittedOperation> = self
                    .coordinator
                    .document()
                    .replay_from(sequence)
                    .map(|operations| operations.cloned().collect())
                    .unwrap_or_default();
                let document = self.coordinator.document_mut();
                document.mark_checkpoint(sequence);
                document.prune_log(sequence);
                let _ = self.log_tx.try_send(LogCommand::Rewrite {
                    operations: retained,
                });
                log::debug!("room {} checkpointed at {}", self.room_id, sequence);
            }
            RoomInternal::SnapshotFailed => {
                // Leave the dirty window open; the next tick retries.
                self.snapshot_in_flight = false;
            }
            RoomInternal::LogDead => self.enter_degraded(),
        }
    }

    fn enter_degraded(&mut self) {
        if self.degraded {
            return;
        }
        log::error!(
            "room {} lost log durability, refusing further writes",
            self.room_id
        );
        self.degraded = true;
        let dropped = self.registry.broadcast(RoomEvent::Degraded, None);
        self.drop_sessions(dropped);
    }

    async fn tick(&mut self) {
        self.maybe_checkpoint();

        if self.registry.is_empty() {
            if let Some(empty_since) = self.empty_since {
                if empty_since.elapsed() >= self.config.idle_timeout && !self.snapshot_in_flight {
                    let _ = self
                        .srv_tx
                        .send(ServerCommand::RoomIdle {
                            room_id: self.room_id,
                        })
                        .await;
                }
            }
        }
    }

    fn maybe_checkpoint(&mut self) {
        let document = self.coordinator.document();
        let dirty_ops = document.head_sequence() - document.last_checkpoint();
        if self.snapshot_in_flight || dirty_ops == 0 {
            return;
        }
        let due = dirty_ops >= self.config.checkpoint_ops
            || self.last_checkpoint_at.elapsed() >= self.config.checkpoint_interval;
        if !due {
            return;
        }

        // Point-in-time copy; the room keeps serving while the flush runs.
        self.snapshot_in_flight = true;
        let sequence = document.head_sequence();
        let snapshot = document.snapshot();
        let data_dir = self.config.data_dir.clone();
        let room_id = self.room_id;
        let mut self_tx = self.self_tx.clone();

        tokio::spawn(async move {
            let outcome =
                match persistence::write_snapshot(&data_dir, &room_id, sequence, &snapshot).await
                {
                    Ok(()) => RoomInternal::SnapshotWritten { sequence },
                    Err(err) => {
                        log::warn!("room {} snapshot flush failed: {:?}", room_id, err);
                        RoomInternal::SnapshotFailed
                    }
                };
            let _ = self_tx.send(RoomMessage::Internal(outcome)).await;
        });
    }

    async fn final_flush(&mut self) {
        let document = self.coordinator.document();
        if document.head_sequence() > document.last_checkpoint() {
            let sequence = document.head_sequence();
            let snapshot = document.snapshot();
            if let Err(err) =
                persistence::write_snapshot(&self.config.data_dir, &self.room_id, sequence, &snapshot)
                    .await
            {
                // Operations are still in the log, so nothing is lost.
                log::warn!("room {} final snapshot failed: {:?}", self.room_id, err);
            }
        }
    }
}
