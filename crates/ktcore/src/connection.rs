//
// connection.rs
//
// Copyright (C) 2025 ktransport contributors. All rights reserved.
//
//

use hmac::Mac;
use ktshared::jupyter_message::{JupyterChannel, JupyterMessage};

use crate::wire_message::HmacSha256;

/// Immutable identity and signing state for one kernel connection.
#[derive(Debug, Clone)]
pub struct KernelConnection {
    /// The ID of the session
    pub session_id: String,

    /// The username of the user who owns the session
    pub username: String,

    /// The HMAC key used to sign messages, if any
    pub hmac_key: Option<HmacSha256>,
}

impl KernelConnection {
    /// Create a connection identity. An empty key disables message signing
    /// and verification.
    pub fn new(session_id: String, username: String, key: String) -> Result<Self, anyhow::Error> {
        let hmac_key = if key.is_empty() {
            None
        } else {
            Some(HmacSha256::new_from_slice(key.as_bytes())?)
        };

        Ok(Self {
            session_id,
            username,
            hmac_key,
        })
    }

    /// Build an initiating request message carrying this connection's
    /// session identity.
    pub fn request(
        &self,
        msg_type: &str,
        channel: JupyterChannel,
        content: serde_json::Value,
    ) -> JupyterMessage {
        JupyterMessage::request(msg_type, channel, content, &self.session_id, &self.username)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_carry_the_connection_identity() {
        let connection =
            KernelConnection::new("s1".to_string(), "tester".to_string(), String::new()).unwrap();
        assert!(connection.hmac_key.is_none());

        let message = connection.request(
            "kernel_info_request",
            JupyterChannel::Shell,
            serde_json::json!({}),
        );
        assert_eq!(message.header.session, "s1");
        assert_eq!(message.header.username, "tester");
        assert_eq!(message.channel, JupyterChannel::Shell);
    }

    #[test]
    fn non_empty_key_enables_signing() {
        let connection =
            KernelConnection::new("s1".to_string(), "tester".to_string(), "secret".to_string())
                .unwrap();
        assert!(connection.hmac_key.is_some());
    }
}
