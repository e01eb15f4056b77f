#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Messages exchanged between a `PulseForm` client and server.
//!
//! Every frame is a JSON object with a `type` tag and an optional `payload`.
//! Inbound (client to server) messages are parsed in two steps so that an
//! unknown tag can be told apart from a malformed frame. Outbound messages
//! are a plain adjacently tagged enum.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum_macros::{AsRefStr, EnumString};
use thiserror::Error;

pub const UPLOAD_COMPLETE_MESSAGE: &str = "Upload finished!";
pub const FORM_SAVED_MESSAGE: &str = "Data saved/updated successfully!";
pub const FORM_READ_ERROR_MESSAGE: &str = "Error reading data file.";
pub const FORM_WRITE_ERROR_MESSAGE: &str = "Error writing data file.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, AsRefStr)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum InboundMessageType {
    ResetProgress,
    SubmitFormData,
}

impl std::fmt::Display for InboundMessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.as_ref())
    }
}

/// The raw shape of an inbound frame, before the tag is interpreted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

/// Form fields submitted by a client.
///
/// Only `message` is known. Any other fields are carried along untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FormData {
    #[serde(default)]
    pub message: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl FormData {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            extra: Map::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, AsRefStr)]
#[strum(serialize_all = "camelCase")]
pub enum InboundMessagePayload {
    ResetProgress,
    SubmitFormData(FormData),
}

impl std::fmt::Display for InboundMessagePayload {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.as_ref())
    }
}

#[derive(Debug, Error)]
pub enum InboundMessageError {
    #[error("Invalid message: {0}")]
    InvalidJson(#[source] serde_json::Error),
    #[error("Unknown message type '{0}'")]
    UnknownType(String),
    #[error("Invalid payload for {message_type}: {source}")]
    InvalidPayload {
        message_type: InboundMessageType,
        source: serde_json::Error,
    },
}

impl TryFrom<InboundMessage> for InboundMessagePayload {
    type Error = InboundMessageError;

    fn try_from(value: InboundMessage) -> Result<Self, Self::Error> {
        let message_type = InboundMessageType::from_str(&value.message_type)
            .map_err(|_| InboundMessageError::UnknownType(value.message_type.clone()))?;

        Ok(match message_type {
            InboundMessageType::ResetProgress => Self::ResetProgress,
            InboundMessageType::SubmitFormData => Self::SubmitFormData(match value.payload {
                Some(payload) => serde_json::from_value(payload).map_err(|source| {
                    InboundMessageError::InvalidPayload {
                        message_type,
                        source,
                    }
                })?,
                None => FormData::default(),
            }),
        })
    }
}

impl FromStr for InboundMessagePayload {
    type Err = InboundMessageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_str::<InboundMessage>(s)
            .map_err(InboundMessageError::InvalidJson)?
            .try_into()
    }
}

impl InboundMessagePayload {
    #[must_use]
    pub const fn message_type(&self) -> InboundMessageType {
        match self {
            Self::ResetProgress => InboundMessageType::ResetProgress,
            Self::SubmitFormData(_) => InboundMessageType::SubmitFormData,
        }
    }

    /// Serializes this payload as a frame ready to be sent to the server.
    ///
    /// # Errors
    ///
    /// * If the form data fails to serialize
    pub fn to_message_string(&self) -> Result<String, serde_json::Error> {
        let payload = match self {
            Self::ResetProgress => None,
            Self::SubmitFormData(form) => Some(serde_json::to_value(form)?),
        };

        serde_json::to_string(&InboundMessage {
            message_type: self.message_type().to_string(),
            payload,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadProgressPayload {
    pub progress: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadCompletePayload {
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormDataSavedPayload {
    pub success: bool,
    pub message: String,
}

impl FormDataSavedPayload {
    #[must_use]
    pub fn saved() -> Self {
        Self {
            success: true,
            message: FORM_SAVED_MESSAGE.to_string(),
        }
    }

    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, AsRefStr)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum OutboundPayload {
    UploadProgress(UploadProgressPayload),
    UploadComplete(UploadCompletePayload),
    FormDataSaved(FormDataSavedPayload),
}

impl std::fmt::Display for OutboundPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.as_ref())
    }
}

impl OutboundPayload {
    #[must_use]
    pub const fn upload_progress(progress: u8) -> Self {
        Self::UploadProgress(UploadProgressPayload { progress })
    }

    #[must_use]
    pub fn upload_complete() -> Self {
        Self::UploadComplete(UploadCompletePayload {
            message: UPLOAD_COMPLETE_MESSAGE.to_string(),
        })
    }
}

/// Body of the liveness endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}

impl HealthResponse {
    #[must_use]
    pub fn ok() -> Self {
        Self {
            status: "OK".to_string(),
        }
    }
}
