use std::collections::HashMap;
use std::num::Wrapping;

use tokio::sync::mpsc::{channel, Sender};

use system::{IdentifiableCommand, RoomId, SessionId};

use crate::config::ServerConfig;
use crate::registry::SessionTx;
use crate::room::{spawn_room, RoomMessage, RoomTx};

pub type ServerTx = Sender<ServerCommand>;

#[derive(Debug)]
pub enum ServerCommand {
    Connect {
        room_id: RoomId,
        tx: SessionTx,
    },
    Disconnect {
        from: SessionId,
    },
    Command {
        from: SessionId,
        command: IdentifiableCommand,
    },
    /// A room reporting that it has been empty past its idle timeout. The
    /// router confirms nobody raced a join in before shutting it down.
    RoomIdle {
        room_id: RoomId,
    },
    /// A shut-down room confirming its final flush and log drain finished.
    /// Until this arrives, no successor may touch the room's files.
    RoomClosed {
        room_id: RoomId,
    },
}

/// Routes connections and commands to per-room actors. Rooms run as
/// independent tasks; the router only owns the session-to-room index and the
/// room handles, so cross-room traffic never serializes.
struct Server {
    config: ServerConfig,
    srv_tx: ServerTx,
    session_id_source: Wrapping<SessionId>,
    locations: HashMap<SessionId, RoomId>,
    rooms: HashMap<RoomId, RoomTx>,
    /// Rooms told to shut down that have not confirmed yet, with connects
    /// that arrived in the meantime and wait for the confirmation.
    closing: HashMap<RoomId, Vec<(SessionId, SessionTx)>>,
}

impl Server {
    fn new(config: ServerConfig, srv_tx: ServerTx) -> Self {
        Self {
            config,
            srv_tx,
            session_id_source: Wrapping(0),
            locations: HashMap::new(),
            rooms: HashMap::new(),
            closing: HashMap::new(),
        }
    }

    async fn handle_command(&mut self, command: ServerCommand) {
        match command {
            ServerCommand::Connect { room_id, mut tx } => {
                let session_id = self.new_session_id();
                let _ = tx
                    .send(crate::connection::ConnectionEvent::Connected { session_id })
                    .await;

                if let Some(pending) = self.closing.get_mut(&room_id) {
                    // The previous actor is still flushing this room's files.
                    log::info!(
                        "session {} waiting for room {} to finish closing",
                        session_id,
                        room_id
                    );
                    pending.push((session_id, tx));
                    return;
                }

                let config = self.config.clone();
                let srv_tx = self.srv_tx.clone();
                self.rooms
                    .entry(room_id)
                    .or_insert_with(|| spawn_room(room_id, config, srv_tx));
                self.attach(room_id, session_id, tx).await;
            }
            ServerCommand::Disconnect { from } => {
                if let Some(room_id) = self.locations.remove(&from) {
                    if let Some(room_tx) = self.rooms.get_mut(&room_id) {
                        let _ = room_tx.send(RoomMessage::Detach { session_id: from }).await;
                    }
                } else {
                    // May still sit in a closing room's waiting list.
                    for pending in self.closing.values_mut() {
                        pending.retain(|(session_id, _)| *session_id != from);
                    }
                }
            }
            ServerCommand::Command { from, command } => {
                let room_id = self.locations.get(&from).copied();
                let room_tx = room_id.and_then(|room_id| self.rooms.get_mut(&room_id));
                match room_tx {
                    Some(room_tx) => {
                        let _ = room_tx.send(RoomMessage::Command { from, command }).await;
                    }
                    None => log::warn!("command from unrouted session {}", from),
                }
            }
            ServerCommand::RoomIdle { room_id } => {
                if self.locations.values().any(|located| *located == room_id) {
                    // Someone joined while the idle report was in flight.
                    return;
                }
                if let Some(mut room_tx) = self.rooms.remove(&room_id) {
                    let _ = room_tx.send(RoomMessage::Shutdown).await;
                    self.closing.insert(room_id, Vec::new());
                    log::info!("room {} shutting down after idle timeout", room_id);
                }
            }
            ServerCommand::RoomClosed { room_id } => {
                let pending = self.closing.remove(&room_id).unwrap_or_default();
                log::info!("room {} closed", room_id);
                if pending.is_empty() {
                    return;
                }
                let room_tx = spawn_room(room_id, self.config.clone(), self.srv_tx.clone());
                self.rooms.insert(room_id, room_tx);
                for (session_id, tx) in pending {
                    self.attach(room_id, session_id, tx).await;
                }
            }
        }
    }

    async fn attach(&mut self, room_id: RoomId, session_id: SessionId, tx: SessionTx) {
        if let Some(room_tx) = self.rooms.get_mut(&room_id) {
            if room_tx
                .send(RoomMessage::Attach { session_id, tx })
                .await
                .is_ok()
            {
                self.locations.insert(session_id, room_id);
                log::info!("session {} attached to room {}", session_id, room_id);
            }
        }
    }

    fn new_session_id(&mut self) -> SessionId {
        self.session_id_source += Wrapping(1);
        self.session_id_source.0
    }
}

pub fn spawn_server(config: ServerConfig) -> ServerTx {
    let (srv_tx, mut srv_rx) = channel::<ServerCommand>(64);
    let tx_for_rooms = srv_tx.clone();

    tokio::spawn(async move {
        let mut server = Server::new(config, tx_for_rooms);

        while let Some(command) = srv_rx.recv().await {
            server.handle_command(command).await;
        }
    });

    srv_tx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionEvent;
    use std::time::Duration;
    use system::uuid::Uuid;
    use tokio::time::timeout;

    fn test_config() -> ServerConfig {
        ServerConfig {
            bind_addr: String::new(),
            data_dir: std::env::temp_dir(),
            checkpoint_ops: 100,
            checkpoint_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(300),
            outbound_queue: 8,
        }
    }

    #[tokio::test]
    async fn it_holds_connects_until_a_closing_room_confirms() {
        let (srv_tx, mut srv_rx) = channel::<ServerCommand>(64);
        let mut server = Server::new(test_config(), srv_tx);
        let room_id = Uuid::new_v4();

        let (tx1, mut rx1) = channel::<ConnectionEvent>(8);
        server
            .handle_command(ServerCommand::Connect { room_id, tx: tx1 })
            .await;
        let first = match rx1.recv().await {
            Some(ConnectionEvent::Connected { session_id }) => session_id,
            other => panic!("expected the session id, got {:?}", other),
        };
        assert_eq!(server.locations.get(&first), Some(&room_id));

        server
            .handle_command(ServerCommand::Disconnect { from: first })
            .await;
        server
            .handle_command(ServerCommand::RoomIdle { room_id })
            .await;
        assert!(!server.rooms.contains_key(&room_id));
        assert!(server.closing.contains_key(&room_id));

        // A connect racing the shutdown must not spawn a second actor on the
        // same files; it waits for the confirmation instead.
        let (tx2, mut rx2) = channel::<ConnectionEvent>(8);
        server
            .handle_command(ServerCommand::Connect { room_id, tx: tx2 })
            .await;
        let second = match rx2.recv().await {
            Some(ConnectionEvent::Connected { session_id }) => session_id,
            other => panic!("expected the session id, got {:?}", other),
        };
        assert!(!server.rooms.contains_key(&room_id));
        assert!(server.locations.get(&second).is_none());

        let closed = timeout(Duration::from_secs(5), srv_rx.recv())
            .await
            .expect("the dying room must confirm")
            .expect("router channel must stay open");
        match &closed {
            ServerCommand::RoomClosed { room_id: closed_id } => {
                assert_eq!(*closed_id, room_id)
            }
            other => panic!("expected the close confirmation, got {:?}", other),
        }
        server.handle_command(closed).await;

        assert!(server.rooms.contains_key(&room_id));
        assert_eq!(server.locations.get(&second), Some(&room_id));
        assert!(!server.closing.contains_key(&room_id));
    }
}
