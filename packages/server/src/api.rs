use actix_web::{
    Result, route,
    web::{self, Json},
};
use pulseform_models::HealthResponse;

use crate::ws;

#[route("/health", method = "GET")]
pub async fn health_endpoint() -> Result<Json<HealthResponse>> {
    log::trace!("Healthy");
    Ok(Json(HealthResponse::ok()))
}

/// Registers the health endpoint and the WebSocket upgrade on `/` and `/ws`.
///
/// The WebSocket routes expect a [`WsServerHandle`] in the app data.
///
/// [`WsServerHandle`]: crate::ws::server::WsServerHandle
pub fn bind_services(cfg: &mut web::ServiceConfig) {
    cfg.service(health_endpoint)
        .service(web::resource("/").route(web::get().to(ws::api::websocket)))
        .service(web::resource("/ws").route(web::get().to(ws::api::websocket)));
}
