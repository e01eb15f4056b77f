//! Client-side view of one server connection.
//!
//! [`ClientController`] turns [`WsEvent`]s into a [`ClientState`] published
//! on a `watch` channel, and sends the two user commands over a
//! [`WebsocketSender`].

use pulseform_models::{
    FormData, FormDataSavedPayload, InboundMessagePayload, OutboundPayload,
    UploadCompletePayload, UploadProgressPayload,
};
use thiserror::Error;
use tokio::sync::{mpsc, watch};

use crate::ws::{WebsocketSendError, WebsocketSender, WsEvent};

pub const DEFAULT_UPLOAD_COMPLETE_MESSAGE: &str = "Upload complete!";
pub const FORM_SENT_MESSAGE: &str = "Form data sent to server...";
pub const NOT_CONNECTED_MESSAGE: &str = "Error: Not connected to server to send message.";
pub const CLEAN_CLOSE_MESSAGE: &str = "Disconnected cleanly.";
pub const UNCLEAN_CLOSE_MESSAGE: &str = "Disconnected. Check server or network.";
pub const CONNECT_ERROR_MESSAGE: &str =
    "WebSocket connection error. Is the server running and configured for ws?";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientState {
    pub progress: u8,
    pub connected: bool,
    pub status_message: String,
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Not connected")]
    NotConnected,
    #[error(transparent)]
    Send(#[from] WebsocketSendError),
    #[error(transparent)]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug)]
pub struct ClientController<S: WebsocketSender> {
    sender: S,
    state_tx: watch::Sender<ClientState>,
}

impl<S: WebsocketSender> ClientController<S> {
    #[must_use]
    pub fn new(sender: S) -> Self {
        let (state_tx, _) = watch::channel(ClientState::default());
        Self { sender, state_tx }
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ClientState> {
        self.state_tx.subscribe()
    }

    #[must_use]
    pub fn state(&self) -> ClientState {
        self.state_tx.borrow().clone()
    }

    fn set_status(&self, message: impl Into<String>) {
        let message = message.into();
        self.state_tx.send_modify(|state| state.status_message = message);
    }

    /// A new connection starts from a blank display. Server-side progress is
    /// not touched.
    pub fn on_open(&self) {
        log::info!("Connected to server");
        self.state_tx.send_replace(ClientState {
            progress: 0,
            connected: true,
            status_message: String::new(),
        });
    }

    pub fn on_close(&self, clean: bool) {
        log::info!("Disconnected from server clean={clean}");
        self.state_tx.send_modify(|state| {
            state.connected = false;
            state.status_message = if clean {
                CLEAN_CLOSE_MESSAGE
            } else {
                UNCLEAN_CLOSE_MESSAGE
            }
            .to_string();
        });
    }

    pub fn on_connect_error(&self) {
        self.state_tx.send_modify(|state| {
            state.connected = false;
            state.status_message = CONNECT_ERROR_MESSAGE.to_string();
        });
    }

    /// Applies a server event. Anything unparseable is logged and ignored.
    ///
    /// Progress above 100 is shown as 100. The `formDataSaved` message is
    /// shown as the server sent it, whether or not the save succeeded.
    pub fn on_text(&self, text: &str) {
        let payload = match serde_json::from_str::<OutboundPayload>(text) {
            Ok(payload) => payload,
            Err(e) => {
                log::warn!("Ignoring unhandled server message: {e} ({text:?})");
                return;
            }
        };

        log::trace!("Received {payload}");

        match payload {
            OutboundPayload::UploadProgress(UploadProgressPayload { progress }) => {
                self.state_tx
                    .send_modify(|state| state.progress = progress.min(100));
            }
            OutboundPayload::UploadComplete(UploadCompletePayload { message }) => {
                if message.is_empty() {
                    self.set_status(DEFAULT_UPLOAD_COMPLETE_MESSAGE);
                } else {
                    self.set_status(message);
                }
            }
            OutboundPayload::FormDataSaved(FormDataSavedPayload { success, message }) => {
                if !success {
                    log::warn!("Server failed to save form data: {message}");
                }
                self.set_status(format!("Server: {message}"));
            }
        }
    }

    pub fn handle_event(&self, event: WsEvent) {
        match event {
            WsEvent::Open => self.on_open(),
            WsEvent::TextMessage(text) => self.on_text(&text),
            WsEvent::Close { clean } => self.on_close(clean),
            WsEvent::ConnectError => self.on_connect_error(),
        }
    }

    /// Applies events until the transport stops sending them.
    pub async fn run(&self, mut events: mpsc::Receiver<WsEvent>) {
        while let Some(event) = events.recv().await {
            self.handle_event(event);
        }

        log::debug!("Event stream ended");
    }

    async fn send(&self, payload: &InboundMessagePayload) -> Result<(), CommandError> {
        if !self.state_tx.borrow().connected {
            log::debug!("Not connected, dropping {payload}");
            self.set_status(NOT_CONNECTED_MESSAGE);
            return Err(CommandError::NotConnected);
        }

        let message = payload.to_message_string()?;
        log::debug!("Sending {payload}");

        // the transport may drop the connection before its close event lands
        match self.sender.send(&message).await {
            Ok(()) => Ok(()),
            Err(WebsocketSendError::NotConnected) => {
                log::debug!("Connection gone, dropping {payload}");
                self.set_status(NOT_CONNECTED_MESSAGE);
                Err(CommandError::NotConnected)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// # Errors
    ///
    /// * If not connected; the state shows [`NOT_CONNECTED_MESSAGE`]
    /// * If the message could not be queued
    pub async fn submit(&self, form: FormData) -> Result<(), CommandError> {
        self.send(&InboundMessagePayload::SubmitFormData(form)).await?;
        self.set_status(FORM_SENT_MESSAGE);
        Ok(())
    }

    /// # Errors
    ///
    /// * If not connected; the state shows [`NOT_CONNECTED_MESSAGE`]
    /// * If the message could not be queued
    pub async fn reset_progress(&self) -> Result<(), CommandError> {
        self.send(&InboundMessagePayload::ResetProgress).await
    }
}
