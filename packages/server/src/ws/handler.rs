use actix_ws::Message;
use futures_util::{
    StreamExt as _,
    future::{Either, select},
};
use tokio::{pin, sync::mpsc};

use crate::ws::server::WsServerHandle;

/// Relays text frames between one client and the [`WsServer`], answers
/// pings, and unregisters the connection once the client goes away.
///
/// No heartbeat timeout is enforced: the connection lives until the client
/// closes it or the transport fails.
///
/// [`WsServer`]: crate::ws::server::WsServer
#[allow(clippy::future_not_send)]
pub async fn handle_ws(
    ws_server: WsServerHandle,
    mut session: actix_ws::Session,
    mut msg_stream: actix_ws::MessageStream,
) {
    let (conn_tx, mut conn_rx) = mpsc::unbounded_channel();

    let conn_id = match ws_server.connect(conn_tx).await {
        Ok(conn_id) => conn_id,
        Err(e) => {
            log::error!("Failed to register connection: {e:?}");
            let _ = session.close(None).await;
            return;
        }
    };

    log::info!("Connected conn_id={conn_id}");

    let close_reason = loop {
        let msg_rx = conn_rx.recv();
        pin!(msg_rx);

        match select(msg_stream.next(), msg_rx).await {
            // frames received from the client
            Either::Left((Some(Ok(msg)), _)) => match msg {
                Message::Ping(bytes) => {
                    if let Err(e) = session.pong(&bytes).await {
                        log::debug!("Failed to send pong to conn_id={conn_id}: {e:?}");
                        break None;
                    }
                }

                Message::Pong(_) | Message::Nop => {}

                Message::Text(text) => {
                    if let Err(e) = ws_server.send_message(conn_id, text.to_string()).await {
                        log::error!("Failed to forward message from conn_id={conn_id}: {e:?}");
                        break None;
                    }
                }

                Message::Binary(bytes) => {
                    log::warn!(
                        "Dropping binary message ({} bytes) from conn_id={conn_id}",
                        bytes.len()
                    );
                }

                Message::Continuation(_) => {
                    log::warn!("Dropping continuation frame from conn_id={conn_id}");
                }

                Message::Close(reason) => break reason,
            },

            // client WebSocket stream error
            Either::Left((Some(Err(err)), _)) => {
                log::error!("WebSocket error on conn_id={conn_id}: {err}");
                break None;
            }

            // client WebSocket stream ended
            Either::Left((None, _)) => break None,

            // events produced by the ws server for this connection
            Either::Right((Some(ws_msg), _)) => {
                if let Err(err) = session.text(ws_msg).await {
                    log::error!("Failed to send text message to conn_id={conn_id}: {err:?}");
                    break None;
                }
            }

            // the ws server dropped the session
            Either::Right((None, _)) => {
                log::debug!("Session for conn_id={conn_id} was closed by the server");
                break None;
            }
        }
    };

    log::info!("Disconnected conn_id={conn_id}");

    if let Err(e) = ws_server.disconnect(conn_id).await {
        log::debug!("Failed to unregister conn_id={conn_id}: {e:?}");
    }

    // attempt to close connection gracefully
    let _ = session.close(close_reason).await;
}
