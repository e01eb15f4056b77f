use actix_web::{HttpRequest, HttpResponse, web};

use crate::ws::{handler, server::WsServerHandle};

/// Upgrades the request to a WebSocket and hands the connection to
/// [`handler::handle_ws`].
///
/// # Errors
///
/// * If the request is not a valid WebSocket upgrade
#[allow(clippy::future_not_send)]
pub async fn websocket(
    req: HttpRequest,
    stream: web::Payload,
    ws_server: web::Data<WsServerHandle>,
) -> Result<HttpResponse, actix_web::Error> {
    let (response, session, msg_stream) = actix_ws::handle(&req, stream)?;

    // spawn websocket handler (and don't await it) so that the response is returned immediately
    actix_web::rt::spawn(handler::handle_ws(
        ws_server.get_ref().clone(),
        session,
        msg_stream,
    ));

    Ok(response)
}
