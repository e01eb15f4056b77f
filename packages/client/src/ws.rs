//! Reconnecting WebSocket transport.
//!
//! [`WsClient::start`] keeps one connection to the server open, reconnecting
//! after a loss (immediately once, then every [`RECONNECT_DELAY`]) until the
//! [`WsHandle`] is closed. Connection lifecycle and text frames are reported
//! as [`WsEvent`]s, in the order they happen.

use std::{
    sync::{Arc, RwLock},
    time::Duration,
};

use async_trait::async_trait;
use futures_channel::mpsc::{UnboundedReceiver, UnboundedSender};
use futures_util::{StreamExt as _, pin_mut};
use thiserror::Error;
use tokio::{
    net::TcpStream,
    select,
    sync::mpsc::{Sender, error::SendError},
    time::sleep,
};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{Error, Message, http::StatusCode},
};
use tokio_util::sync::CancellationToken;

pub const RECONNECT_DELAY: Duration = Duration::from_millis(5000);
pub const PING_INTERVAL: Duration = Duration::from_millis(5000);

#[derive(Debug, Error)]
pub enum ConnectWsError {
    #[error("Unauthorized")]
    Unauthorized,
}

/// Frames queued for the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsMessage {
    TextMessage(String),
    Ping,
}

/// What happened on the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsEvent {
    Open,
    TextMessage(String),
    /// The connection ended. `clean` is set when a close frame was
    /// exchanged or the client itself shut down.
    Close {
        clean: bool,
    },
    /// A connection attempt failed before the handshake completed.
    ConnectError,
}

#[derive(Debug, Error)]
pub enum WebsocketSendError {
    #[error("Not connected")]
    NotConnected,
    #[error("Unknown: {0}")]
    Unknown(String),
}

#[async_trait]
pub trait WebsocketSender: Send + Sync {
    /// # Errors
    ///
    /// * If the frame could not be queued on the open connection
    async fn send(&self, data: &str) -> Result<(), WebsocketSendError>;

    /// # Errors
    ///
    /// * If the ping could not be queued on the open connection
    async fn ping(&self) -> Result<(), WebsocketSendError>;
}

impl core::fmt::Debug for dyn WebsocketSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{WebsocketSender}}")
    }
}

type SharedSender = Arc<RwLock<Option<UnboundedSender<WsMessage>>>>;

/// Sends frames on whichever connection is currently open and closes the
/// client.
#[derive(Debug, Clone)]
pub struct WsHandle {
    sender: SharedSender,
    cancellation_token: CancellationToken,
}

impl WsHandle {
    pub fn close(&self) {
        self.cancellation_token.cancel();
    }

    fn queue(&self, message: WsMessage) -> Result<(), WebsocketSendError> {
        let sender = self
            .sender
            .read()
            .map_err(|e| WebsocketSendError::Unknown(e.to_string()))?;

        // nothing is queued while disconnected
        let Some(sender) = sender.as_ref() else {
            return Err(WebsocketSendError::NotConnected);
        };

        sender
            .unbounded_send(message)
            .map_err(|e| WebsocketSendError::Unknown(e.to_string()))
    }
}

#[async_trait]
impl WebsocketSender for WsHandle {
    async fn send(&self, data: &str) -> Result<(), WebsocketSendError> {
        self.queue(WsMessage::TextMessage(data.to_string()))
    }

    async fn ping(&self) -> Result<(), WebsocketSendError> {
        self.queue(WsMessage::Ping)
    }
}

#[derive(Debug, Clone)]
pub struct WsClient {
    url: String,
    sender: SharedSender,
    cancellation_token: CancellationToken,
}

impl WsClient {
    #[must_use]
    pub fn new(url: String) -> (Self, WsHandle) {
        let sender = Arc::new(RwLock::new(None));
        let cancellation_token = CancellationToken::new();
        let handle = WsHandle {
            sender: sender.clone(),
            cancellation_token: cancellation_token.clone(),
        };

        (
            Self {
                url,
                sender,
                cancellation_token,
            },
            handle,
        )
    }

    #[must_use]
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancellation_token = token;
        self
    }

    fn set_sender(&self, sender: Option<UnboundedSender<WsMessage>>) {
        match self.sender.write() {
            Ok(mut current) => *current = sender,
            Err(e) => log::error!("Failed to update ws sender: {e:?}"),
        }
    }

    async fn message_handler(tx: &Sender<WsEvent>, m: Message) -> Result<(), SendError<WsEvent>> {
        log::trace!("Message from ws server: {m:?}");

        match m {
            Message::Text(text) => tx.send(WsEvent::TextMessage(text.to_string())).await,
            Message::Binary(bytes) => {
                log::warn!("Ignoring binary message ({} bytes)", bytes.len());
                Ok(())
            }
            Message::Ping(_) | Message::Pong(_) | Message::Close(_) | Message::Frame(_) => {
                log::trace!("Ignoring control frame");
                Ok(())
            }
        }
    }

    /// Keeps a connection open until the handle is closed or `tx` is
    /// dropped, reporting every lifecycle change to `tx`.
    ///
    /// # Errors
    ///
    /// * If the server rejects the connection as unauthorized
    pub async fn start(&self, tx: Sender<WsEvent>) -> Result<(), ConnectWsError> {
        let mut just_retried = false;

        loop {
            log::debug!("Connecting to websocket '{}'...", self.url);

            #[allow(clippy::redundant_pub_crate)]
            let event = match select!(
                resp = connect_async(self.url.as_str()) => resp,
                () = self.cancellation_token.cancelled() => {
                    log::debug!("Cancelling connect");
                    break;
                }
            ) {
                Ok((ws_stream, _)) => {
                    log::debug!("WebSocket handshake has been successfully completed");

                    if just_retried {
                        log::info!("WebSocket successfully reconnected");
                        just_retried = false;
                    }

                    let (txf, rxf) = futures_channel::mpsc::unbounded();
                    self.set_sender(Some(txf.clone()));

                    if tx.send(WsEvent::Open).await.is_err() {
                        self.set_sender(None);
                        break;
                    }

                    let clean = self.run_connection(ws_stream, txf, rxf, &tx).await;
                    self.set_sender(None);
                    log::info!("WebSocket connection closed clean={clean}");

                    WsEvent::Close { clean }
                }
                Err(err) => {
                    if let Error::Http(response) = &err {
                        if response.status() == StatusCode::UNAUTHORIZED {
                            log::error!("Unauthorized ws connection");
                            return Err(ConnectWsError::Unauthorized);
                        }
                        log::error!("Websocket error ({})", response.status());
                    } else {
                        log::error!("Failed to connect to websocket server: {err:?}");
                    }

                    WsEvent::ConnectError
                }
            };

            if tx.send(event).await.is_err() {
                log::debug!("Event receiver dropped");
                break;
            }

            if self.cancellation_token.is_cancelled() {
                break;
            }

            #[allow(clippy::redundant_pub_crate)]
            if just_retried {
                select!(
                    () = sleep(RECONNECT_DELAY) => {}
                    () = self.cancellation_token.cancelled() => {
                        log::debug!("Cancelling retry");
                        break;
                    }
                );
            } else {
                just_retried = true;
            }
        }

        log::debug!("Handler closed");

        Ok(())
    }

    /// Pumps one open connection. Returns whether it ended cleanly.
    async fn run_connection(
        &self,
        ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
        txf: UnboundedSender<WsMessage>,
        rxf: UnboundedReceiver<WsMessage>,
        tx: &Sender<WsEvent>,
    ) -> bool {
        let close_token = CancellationToken::new();
        let (write, mut read) = ws_stream.split();

        let ws_writer = rxf
            .map(|message| match message {
                WsMessage::TextMessage(message) => {
                    pulseform_logging::debug_or_trace!(
                        ("Sending text packet"),
                        ("Sending text packet message={message}")
                    );
                    Ok(Message::Text(message.into()))
                }
                WsMessage::Ping => {
                    log::trace!("Sending ping");
                    Ok(Message::Ping(vec![].into()))
                }
            })
            .forward(write);

        let ws_reader = async {
            while let Some(m) = read.next().await {
                match m {
                    Ok(Message::Close(frame)) => {
                        log::debug!("Server closed the connection: {frame:?}");
                        return true;
                    }
                    Ok(m) => {
                        if let Err(e) = Self::message_handler(tx, m).await {
                            log::debug!("Event receiver dropped: {e:?}");
                            return true;
                        }
                    }
                    Err(e) => {
                        log::error!("Receive loop error: {e:?}");
                        return false;
                    }
                }
            }
            false
        };

        let pinger = tokio::spawn({
            let close_token = close_token.clone();
            let cancellation_token = self.cancellation_token.clone();

            async move {
                loop {
                    #[allow(clippy::redundant_pub_crate)]
                    {
                        select!(
                            () = close_token.cancelled() => { break; }
                            () = cancellation_token.cancelled() => { break; }
                            () = sleep(PING_INTERVAL) => {
                                log::trace!("Sending ping to server");
                                if let Err(e) = txf.unbounded_send(WsMessage::Ping) {
                                    log::error!("Pinger Send Loop error: {e:?}");
                                    close_token.cancel();
                                    break;
                                }
                            }
                        );
                    }
                }
            }
        });

        pin_mut!(ws_writer, ws_reader);

        #[allow(clippy::redundant_pub_crate)]
        let clean = select!(
            () = close_token.cancelled() => false,
            () = self.cancellation_token.cancelled() => true,
            clean = &mut ws_reader => clean,
            result = &mut ws_writer => {
                if let Err(e) = result {
                    log::error!("Send loop error: {e:?}");
                }
                false
            }
        );

        close_token.cancel();

        log::debug!("run_connection: Waiting for pinger to finish...");
        if let Err(e) = pinger.await {
            log::warn!("run_connection: Pinger failed to finish: {e:?}");
        }

        clean
    }
}
