use std::time::{Duration, Instant};

use actix::{Actor, ActorContext, AsyncContext, Handler, Message, Running, StreamHandler};
use actix_web::{error, web, Error, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use actix_web_actors::ws::{CloseCode, CloseReason};

use system::{bincode, IdentifiableCommand, RoomEvent, RoomId, SessionId};

use crate::config::ServerConfig;
use crate::server::{ServerCommand, ServerTx};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
// Three missed heartbeats and the session is considered gone.
const CLIENT_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug)]
pub enum ConnectionEvent {
    Connected { session_id: SessionId },
    Event(RoomEvent),
    Disconnected,
}

#[derive(Message)]
#[rtype(result = "()")]
struct ConnectionActorMessage(ConnectionEvent);

enum ConnectionState {
    Idle,
    Connected(SessionId),
}

/// One actor per WebSocket; it shuttles bincode frames between the socket
/// and the room the session lives in.
struct ConnectionActor {
    state: ConnectionState,
    srv_tx: ServerTx,
    room_id: RoomId,
    outbound_queue: usize,
    last_heartbeat: Instant,
}

impl Actor for ConnectionActor {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        self.spawn_heartbeat(ctx);

        let (tx, mut rx) =
            tokio::sync::mpsc::channel::<ConnectionEvent>(self.outbound_queue);

        if self
            .srv_tx
            .try_send(ServerCommand::Connect {
                room_id: self.room_id,
                tx,
            })
            .is_err()
        {
            // Router backlogged or gone; shed this connection rather than
            // taking the whole actor down.
            log::warn!("router queue unavailable, refusing connection");
            ctx.close(Some(CloseReason {
                code: CloseCode::Again,
                description: None,
            }));
            ctx.stop();
            return;
        }

        let addr = ctx.address().recipient();

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if addr.try_send(ConnectionActorMessage(event)).is_err() {
                    return;
                }
            }
            // Room dropped our queue (leave, overflow or shutdown).
            let _ = addr.try_send(ConnectionActorMessage(ConnectionEvent::Disconnected));
        });
    }

    fn stopping(&mut self, _: &mut Self::Context) -> Running {
        if let ConnectionState::Connected(session_id) = self.state {
            let _ = self
                .srv_tx
                .try_send(ServerCommand::Disconnect { from: session_id });
        }
        Running::Stop
    }
}

impl ConnectionActor {
    fn spawn_heartbeat(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(HEARTBEAT_INTERVAL, |actor, ctx| {
            if Instant::now().duration_since(actor.last_heartbeat) > CLIENT_TIMEOUT {
                log::info!("session timed out, closing connection");
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }
}

/// Ingress
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for ConnectionActor {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Ping(msg)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&msg);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Binary(bin)) => {
                self.last_heartbeat = Instant::now();
                if let ConnectionState::Connected(from) = self.state {
                    if let Ok(command) = bincode::deserialize::<IdentifiableCommand>(&bin) {
                        log::debug!("ingress from {}: {:?}", from, command);
                        if self
                            .srv_tx
                            .try_send(ServerCommand::Command { from, command })
                            .is_err()
                        {
                            ctx.close(Some(CloseReason {
                                code: CloseCode::Again,
                                description: None,
                            }));
                        }
                    } else {
                        ctx.close(Some(CloseReason {
                            code: CloseCode::Invalid,
                            description: None,
                        }));
                    }
                }
            }
            Ok(ws::Message::Close(_)) => {
                ctx.stop();
            }
            _ => (),
        }
    }
}

/// Egress
impl Handler<ConnectionActorMessage> for ConnectionActor {
    type Result = ();

    fn handle(
        &mut self,
        msg: ConnectionActorMessage,
        ctx: &mut ws::WebsocketContext<Self>,
    ) -> Self::Result {
        match msg.0 {
            ConnectionEvent::Connected { session_id } => {
                self.state = ConnectionState::Connected(session_id);
            }
            ConnectionEvent::Disconnected => {
                ctx.close(None);
                ctx.stop();
            }
            ConnectionEvent::Event(event) => {
                log::debug!("egress: {:?}", event);
                let serialized = bincode::serialize(&event).expect("events must serialize");
                ctx.binary(serialized);
            }
        }
    }
}

pub async fn ws_index(
    req: HttpRequest,
    stream: web::Payload,
    srv_tx: web::Data<ServerTx>,
    config: web::Data<ServerConfig>,
) -> Result<HttpResponse, Error> {
    let room_id: RoomId = req
        .match_info()
        .get("room_id")
        .and_then(|raw| raw.parse().ok())
        .ok_or_else(|| error::ErrorBadRequest("invalid room id"))?;

    ws::start(
        ConnectionActor {
            state: ConnectionState::Idle,
            srv_tx: srv_tx.get_ref().clone(),
            room_id,
            outbound_queue: config.outbound_queue,
            last_heartbeat: Instant::now(),
        },
        &req,
        stream,
    )
}
