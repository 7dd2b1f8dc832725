//
// socket.rs
//
// Copyright (C) 2025 ktransport contributors. All rights reserved.
//
//

use std::str::FromStr;

use ktshared::jupyter_message::{JupyterChannel, JupyterMessage};
use zeromq::{
    util::PeerIdentity, DealerSocket, Socket, SocketOptions, SocketRecv, SocketSend, SubSocket,
};

use crate::outbound::{MessageSink, SendFailure};
use crate::wire_message::{HmacSha256, WireMessage};

/// The connection lifecycle of a logical socket. Tracked for diagnostics
/// only; correctness never depends on it.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

enum SocketInner {
    Dealer(DealerSocket),
    Sub(SubSocket),
}

/// One logical Jupyter socket: a dealer (shell, stdin) or subscriber (iopub),
/// decoding inbound frames into messages and encoding outbound messages into
/// signed frames.
pub struct KernelSocket {
    /// The channel this socket carries
    pub channel: JupyterChannel,

    /// The connection state, for diagnostics
    pub state: ConnectionState,

    session_id: String,
    hmac_key: Option<HmacSha256>,
    inner: SocketInner,
}

impl KernelSocket {
    /// Create a dealer socket whose peer identity is the session ID.
    pub fn dealer(
        channel: JupyterChannel,
        session_id: &str,
        hmac_key: Option<HmacSha256>,
    ) -> Result<Self, anyhow::Error> {
        let mut opts = SocketOptions::default();
        let peer_id = PeerIdentity::from_str(session_id)
            .map_err(|e| anyhow::anyhow!("invalid peer identity {}: {:?}", session_id, e))?;
        opts.peer_identity(peer_id);

        Ok(KernelSocket {
            channel,
            state: ConnectionState::Disconnected,
            session_id: session_id.to_string(),
            hmac_key,
            inner: SocketInner::Dealer(DealerSocket::with_options(opts)),
        })
    }

    /// Create a subscriber socket.
    pub fn sub(
        channel: JupyterChannel,
        session_id: &str,
        hmac_key: Option<HmacSha256>,
    ) -> Self {
        KernelSocket {
            channel,
            state: ConnectionState::Disconnected,
            session_id: session_id.to_string(),
            hmac_key,
            inner: SocketInner::Sub(SubSocket::new()),
        }
    }

    /// Connect to the given endpoint.
    pub async fn connect(&mut self, endpoint: &str) -> Result<(), anyhow::Error> {
        self.state = ConnectionState::Connecting;
        let result = match &mut self.inner {
            SocketInner::Dealer(socket) => socket.connect(endpoint).await,
            SocketInner::Sub(socket) => socket.connect(endpoint).await,
        };
        match result {
            Ok(_) => {
                self.state = ConnectionState::Connected;
                log::trace!(
                    "[session {}] Connected {:?} socket to {}",
                    self.session_id,
                    self.channel,
                    endpoint
                );
                Ok(())
            }
            Err(e) => {
                self.state = ConnectionState::Disconnected;
                Err(anyhow::anyhow!(
                    "failed to connect {:?} socket to {}: {}",
                    self.channel,
                    endpoint,
                    e
                ))
            }
        }
    }

    /// Subscribe to all topics. Subscriber sockets only.
    pub async fn subscribe_all(&mut self) -> Result<(), anyhow::Error> {
        match &mut self.inner {
            SocketInner::Sub(socket) => {
                socket.subscribe("").await?;
                Ok(())
            }
            SocketInner::Dealer(_) => Err(anyhow::anyhow!(
                "cannot subscribe on a {:?} dealer socket",
                self.channel
            )),
        }
    }

    /// Receive and decode the next message.
    ///
    /// Returns `Ok(None)` when a frame set arrives but fails to decode;
    /// decode failures are logged and skipped, never raised, so that
    /// malformed kernel output cannot take the transport down. A socket-level
    /// receive error is returned as `Err`.
    pub async fn recv(&mut self) -> Result<Option<JupyterMessage>, anyhow::Error> {
        let zmq_message = match &mut self.inner {
            SocketInner::Dealer(socket) => socket.recv().await,
            SocketInner::Sub(socket) => socket.recv().await,
        }
        .map_err(|e| anyhow::anyhow!("{}", e))?;

        let wire = WireMessage::from_zmq(zmq_message);
        match wire.to_jupyter(self.channel, self.hmac_key.as_ref()) {
            Ok(message) => Ok(Some(message)),
            Err(failure) => {
                log::debug!(
                    "[session {}] Dropping undecodable {:?} message: {}",
                    self.session_id,
                    self.channel,
                    failure
                );
                Ok(None)
            }
        }
    }

    /// Close the socket, consuming it. Receive loops holding the socket stop
    /// when it is consumed, so this is inherently idempotent.
    pub async fn close(mut self) {
        self.state = ConnectionState::Closed;
        match self.inner {
            SocketInner::Dealer(socket) => socket.close().await,
            SocketInner::Sub(socket) => socket.close().await,
        };
    }
}

impl MessageSink for KernelSocket {
    /// Encode and write a message. Write failures are propagated, classified
    /// as transient (outgoing queue full, retry later) or fatal, so the
    /// outbound queue can decide whether to retry or synthesize an error.
    async fn send_message(&mut self, message: &JupyterMessage) -> Result<(), SendFailure> {
        let wire = WireMessage::from_jupyter(message, self.hmac_key.as_ref())
            .map_err(|e| SendFailure::Fatal(anyhow::anyhow!("failed to encode message: {}", e)))?;
        let zmq_message = wire
            .into_zmq()
            .map_err(SendFailure::Fatal)?;

        let result = match &mut self.inner {
            SocketInner::Dealer(socket) => socket.send(zmq_message).await,
            SocketInner::Sub(_) => {
                return Err(SendFailure::Fatal(anyhow::anyhow!(
                    "cannot send on the {:?} subscriber socket",
                    self.channel
                )))
            }
        };

        match result {
            Ok(_) => Ok(()),
            Err(zeromq::ZmqError::BufferFull(_)) => Err(SendFailure::Transient),
            Err(e) => Err(SendFailure::Fatal(anyhow::anyhow!("{}", e))),
        }
    }
}
