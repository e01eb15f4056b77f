#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! PulseForm server.
//!
//! Every WebSocket connection gets a simulated upload progress stream and can
//! submit a form, which is stored in a JSON file keyed by connection.

use std::{net::TcpListener, sync::Arc};

use actix_cors::Cors;
use actix_web::{App, HttpServer, http, middleware, web};
use pulseform_store::RecordStore;
use tokio::try_join;

use crate::{config::ServerConfig, ws::server::WsServer};

pub mod api;
pub mod config;
pub mod progress;
pub mod ws;

/// Runs the HTTP and WebSocket server until it is stopped (ctrl-c).
///
/// With a `listener`, the server accepts on it instead of binding
/// `config.bind_addr:config.port`.
///
/// # Errors
///
/// * If the server fails to bind
/// * If the server fails during execution
pub async fn run(config: ServerConfig, listener: Option<TcpListener>) -> std::io::Result<()> {
    let store = Arc::new(RecordStore::in_dir(&config.data_dir));

    if let Err(e) = store.ensure_data_dir().await {
        log::error!(
            "Failed to create data directory {}: {e:?}",
            config.data_dir.display()
        );
    }

    let (ws_server, ws_server_handle) = WsServer::new(store, config.progress_interval);
    let ws_server_join = tokio::spawn(ws_server.run());

    let origins = config.allowed_origins();
    log::debug!("Allowed CORS origins: {origins:?}");

    let ws_data = web::Data::new(ws_server_handle.clone());

    let app = move || {
        let cors = origins
            .iter()
            .fold(Cors::default(), |cors, origin| cors.allowed_origin(origin))
            .allowed_methods(vec!["GET", "OPTIONS"])
            .allowed_headers(vec![http::header::ACCEPT, http::header::CONTENT_TYPE])
            .supports_credentials()
            .max_age(3600);

        App::new()
            .wrap(cors)
            .wrap(middleware::Logger::default())
            .app_data(ws_data.clone())
            .configure(api::bind_services)
    };

    let mut http_server = HttpServer::new(app);

    if let Some(workers) = config.actix_workers {
        log::debug!("Running with {workers} Actix workers");
        http_server = http_server.workers(workers);
    }

    let http_server = if let Some(listener) = listener {
        let addr = listener.local_addr()?;
        log::info!("PulseForm server listening on {addr}");
        http_server.listen(listener)?
    } else {
        log::info!(
            "PulseForm server listening on {}:{}",
            config.bind_addr,
            config.port
        );
        http_server.bind((config.bind_addr.as_str(), config.port))?
    };
    let http_server = http_server.run();

    if let Err(err) = try_join!(
        async move {
            let resp = http_server.await;

            log::debug!("Shutting down ws server...");
            ws_server_handle.shutdown();

            resp
        },
        async move {
            ws_server_join.await.map_err(std::io::Error::other)?;
            log::debug!("Ws server closed");
            Ok::<_, std::io::Error>(())
        },
    ) {
        log::error!("Error on shutdown: {err:?}");
        return Err(err);
    }

    log::debug!("Server shut down");

    Ok(())
}
