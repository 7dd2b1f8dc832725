//
// jupyter_message.rs
//
// Copyright (C) 2025 ktransport contributors. All rights reserved.
//
//

use std::iter;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// The version of the Jupyter messaging protocol spoken by this transport.
pub const PROTOCOL_VERSION: &str = "5.3";

/// The full header of a Jupyter message, as it appears on the wire.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct JupyterMessageHeader {
    /// The message ID
    pub msg_id: String,

    /// The name of the user that owns the session
    pub username: String,

    /// The session ID
    pub session: String,

    /// The type of the message
    pub msg_type: String,

    /// The ISO 8601 date/time the message was created
    pub date: String,

    /// The version of the Jupyter protocol
    pub version: String,
}

impl JupyterMessageHeader {
    /// Create a new header with a fresh message ID and the current time.
    pub fn new(msg_type: &str, session: &str, username: &str) -> Self {
        let date = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        JupyterMessageHeader {
            msg_id: make_message_id(),
            username: username.to_string(),
            session: session.to_string(),
            msg_type: msg_type.to_string(),
            date,
            version: String::from(PROTOCOL_VERSION),
        }
    }
}

/// The set of Jupyter sockets ("channels") over which messages are sent and
/// received.
#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JupyterChannel {
    /// The shell channel (execution, completion, introspection, shutdown)
    Shell,

    /// The stdin channel (kernel-initiated input requests)
    Stdin,

    /// The iopub channel (broadcast status, stream output, display data)
    IOPub,

    /// The heartbeat channel (liveness echo)
    Heartbeat,
}

/// A Jupyter message.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct JupyterMessage {
    /// The routing identity frames that preceded the message delimiter, if
    /// any. Preserved verbatim on decode and echoed on reply.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub idents: Vec<Vec<u8>>,

    /// The header of the message
    pub header: JupyterMessageHeader,

    /// The header of the message's parent (the message that caused this one),
    /// or None for an unsolicited/initiating message
    pub parent_header: Option<JupyterMessageHeader>,

    /// The channel on which the message was received (or is to be sent)
    pub channel: JupyterChannel,

    /// The message payload
    pub content: serde_json::Value,

    /// Additional metadata
    pub metadata: serde_json::Value,

    /// Auxiliary binary payloads; pass-through only
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub buffers: Vec<Vec<u8>>,
}

impl JupyterMessage {
    /// Create an initiating request message (no parent, no idents).
    pub fn request(
        msg_type: &str,
        channel: JupyterChannel,
        content: serde_json::Value,
        session: &str,
        username: &str,
    ) -> Self {
        JupyterMessage {
            idents: Vec::new(),
            header: JupyterMessageHeader::new(msg_type, session, username),
            parent_header: None,
            channel,
            content,
            metadata: serde_json::json!({}),
            buffers: Vec::new(),
        }
    }

    /// The message ID of this message's parent, if it has one.
    pub fn parent_id(&self) -> Option<&str> {
        self.parent_header.as_ref().map(|h| h.msg_id.as_str())
    }
}

/// Generate a unique message ID for Jupyter messages.
///
/// # Returns
///
/// A random hexadecimal string of 10 characters.
pub fn make_message_id() -> String {
    let mut rng = rand::thread_rng();
    iter::repeat_with(|| format!("{:x}", rng.gen_range(0..16)))
        .take(10)
        .collect()
}
