use actix_cors::Cors;
use actix_web::{web, App, HttpResponse, HttpServer};
use serde::Serialize;

use whiteboard_server::config::ServerConfig;
use whiteboard_server::connection::ws_index;
use whiteboard_server::server::spawn_server;

#[derive(Serialize)]
struct Health {
    message: &'static str,
}

async fn health() -> HttpResponse {
    HttpResponse::Ok().json(Health {
        message: "Whiteboard sync server is running",
    })
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    env_logger::init();

    let config = ServerConfig::from_env();
    let bind_addr = config.bind_addr.clone();
    let srv_tx = spawn_server(config.clone());

    log::info!("listening on {}", bind_addr);
    HttpServer::new(move || {
        App::new()
            .wrap(Cors::permissive())
            .data(srv_tx.clone())
            .data(config.clone())
            .route("/", web::get().to(health))
            .route("/ws/{room_id}/", web::get().to(ws_index))
    })
    .bind(&bind_addr)?
    .run()
    .await
}
