//
// wire_message.rs
//
// Copyright (C) 2025 ktransport contributors. All rights reserved.
//
//

use std::fmt;

use bytes::Bytes;
use hmac::{Hmac, Mac};
use ktshared::jupyter_message::{JupyterChannel, JupyterMessage, JupyterMessageHeader};
use sha2::Sha256;
use zeromq::ZmqMessage;

/// The HMAC used to sign Jupyter wire messages.
pub type HmacSha256 = Hmac<Sha256>;

/// The frame that separates routing identities from the message body.
pub const DELIMITER: &[u8] = b"<IDS|MSG>";

/// A Jupyter message in its wire form: a sequence of raw frames.
///
/// Frame layout: `[...idents, "<IDS|MSG>", signature, header, parent_header,
/// metadata, content, ...buffers]`.
pub struct WireMessage {
    /// The parts of the message, as an array of byte arrays
    pub parts: Vec<Vec<u8>>,
}

/// The ways an inbound frame set can fail to decode. Decode failures are
/// logged and dropped; they are never surfaced to request callbacks, because
/// malformed kernel output must not crash the transport.
#[derive(Debug)]
pub enum DecodeFailure {
    /// No `<IDS|MSG>` delimiter frame was found
    MissingDelimiter,

    /// Fewer than five frames followed the delimiter
    TooFewFrames(usize),

    /// The signature frame did not match the recomputed HMAC
    BadSignature,

    /// The header frame was missing a message ID or message type
    MissingHeader,

    /// A JSON frame could not be parsed
    MalformedJson(serde_json::Error),
}

impl fmt::Display for DecodeFailure {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DecodeFailure::MissingDelimiter => write!(f, "no message delimiter frame"),
            DecodeFailure::TooFewFrames(n) => {
                write!(f, "only {} frames after the delimiter (need 5)", n)
            }
            DecodeFailure::BadSignature => write!(f, "HMAC signature mismatch"),
            DecodeFailure::MissingHeader => write!(f, "header has no msg_id or msg_type"),
            DecodeFailure::MalformedJson(err) => write!(f, "malformed JSON frame: {}", err),
        }
    }
}

impl WireMessage {
    /// Serialize a Jupyter message into wire frames, signing the four JSON
    /// frames with `hmac_key` if one is present. An absent key produces an
    /// empty signature frame.
    pub fn from_jupyter(
        msg: &JupyterMessage,
        hmac_key: Option<&HmacSha256>,
    ) -> Result<Self, serde_json::Error> {
        let header = serde_json::to_vec(&msg.header)?;
        let parent_header = match &msg.parent_header {
            Some(parent) => serde_json::to_vec(parent)?,
            None => serde_json::to_vec(&serde_json::Map::new())?,
        };
        let metadata = serde_json::to_vec(&msg.metadata)?;
        let content = serde_json::to_vec(&msg.content)?;

        // Compute the HMAC signature over the four JSON frames
        let signature = match hmac_key {
            Some(key) => {
                let mut mac = key.clone();
                mac.update(&header);
                mac.update(&parent_header);
                mac.update(&metadata);
                mac.update(&content);
                hex::encode(mac.finalize().into_bytes())
            }
            None => String::new(),
        };

        let mut parts: Vec<Vec<u8>> =
            Vec::with_capacity(msg.idents.len() + 6 + msg.buffers.len());
        parts.extend(msg.idents.iter().cloned());
        parts.push(DELIMITER.to_vec());
        parts.push(signature.into_bytes());
        parts.push(header);
        parts.push(parent_header);
        parts.push(metadata);
        parts.push(content);
        parts.extend(msg.buffers.iter().cloned());

        Ok(WireMessage { parts })
    }

    /// Decode wire frames into a Jupyter message, verifying the signature if
    /// an HMAC key is supplied.
    pub fn to_jupyter(
        &self,
        channel: JupyterChannel,
        hmac_key: Option<&HmacSha256>,
    ) -> Result<JupyterMessage, DecodeFailure> {
        let delimiter = self
            .parts
            .iter()
            .position(|part| part.as_slice() == DELIMITER)
            .ok_or(DecodeFailure::MissingDelimiter)?;

        let idents = self.parts[..delimiter].to_vec();
        let body = &self.parts[delimiter + 1..];
        if body.len() < 5 {
            return Err(DecodeFailure::TooFewFrames(body.len()));
        }

        let signature = &body[0];
        let json_frames = &body[1..5];
        let buffers = body[5..].to_vec();

        if let Some(key) = hmac_key {
            let mut mac = key.clone();
            for frame in json_frames {
                mac.update(frame);
            }
            let expected = hex::decode(signature).map_err(|_| DecodeFailure::BadSignature)?;
            mac.verify_slice(&expected)
                .map_err(|_| DecodeFailure::BadSignature)?;
        }

        let header: JupyterMessageHeader =
            serde_json::from_slice(&json_frames[0]).map_err(DecodeFailure::MalformedJson)?;
        if header.msg_id.is_empty() || header.msg_type.is_empty() {
            return Err(DecodeFailure::MissingHeader);
        }

        // An empty-object parent header marks an unsolicited message
        let parent: serde_json::Value =
            serde_json::from_slice(&json_frames[1]).map_err(DecodeFailure::MalformedJson)?;
        let parent_header = match parent.as_object() {
            Some(map) if map.is_empty() => None,
            _ => Some(
                serde_json::from_value::<JupyterMessageHeader>(parent)
                    .map_err(DecodeFailure::MalformedJson)?,
            ),
        };

        let metadata: serde_json::Value =
            serde_json::from_slice(&json_frames[2]).map_err(DecodeFailure::MalformedJson)?;
        let content: serde_json::Value =
            serde_json::from_slice(&json_frames[3]).map_err(DecodeFailure::MalformedJson)?;

        Ok(JupyterMessage {
            idents,
            header,
            parent_header,
            channel,
            content,
            metadata,
            buffers,
        })
    }

    /// Convert this wire message into a ZeroMQ multipart message.
    pub fn into_zmq(self) -> Result<ZmqMessage, anyhow::Error> {
        let mut parts = self.parts.into_iter();
        let first = parts
            .next()
            .ok_or_else(|| anyhow::anyhow!("wire message has no frames"))?;
        let mut message = ZmqMessage::from(first);
        for part in parts {
            message.push_back(Bytes::from(part));
        }
        Ok(message)
    }

    /// Build a wire message from a received ZeroMQ multipart message.
    pub fn from_zmq(message: ZmqMessage) -> Self {
        WireMessage {
            parts: message.into_vec().iter().map(|b| b.to_vec()).collect(),
        }
    }
}
