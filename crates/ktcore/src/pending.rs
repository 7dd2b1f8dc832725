//
// pending.rs
//
// Copyright (C) 2025 ktransport contributors. All rights reserved.
//
//

use std::collections::HashMap;
use std::time::{Duration, Instant};

use ktshared::jupyter_message::{JupyterMessage, JupyterMessageHeader};

/// Per-request delivery options.
#[derive(Debug, Copy, Clone, Default)]
pub struct RequestFlags {
    /// The request was marked silent; the kernel stores no history and emits
    /// no execute_input broadcast for it.
    pub silent: bool,

    /// Suppress the global busy/idle status events this request would
    /// otherwise produce. Its own result stream still receives everything.
    pub suppress_status: bool,
}

/// One in-flight request awaiting its terminal shell-channel reply.
pub struct PendingRequest {
    /// The header of the original request
    pub header: JupyterMessageHeader,

    /// The stream to which this request's messages are delivered. Dropping
    /// the sender without sending a terminal reply signals abandonment.
    pub reply_tx: async_channel::Sender<JupyterMessage>,

    /// When the request was registered, for timeout sweeps
    pub created: Instant,

    /// Delivery options
    pub flags: RequestFlags,
}

impl PendingRequest {
    /// Deliver one message to this request's result stream. Delivery to a
    /// stream whose receiver is gone is a silent no-op.
    pub fn deliver(&self, message: JupyterMessage) {
        if let Err(err) = self.reply_tx.try_send(message) {
            log::trace!(
                "Dropping message for request {}: {}",
                self.header.msg_id,
                err
            );
        }
    }
}

/// The map of requests that have been sent (or queued) but not yet resolved.
#[derive(Default)]
pub struct PendingRequests {
    requests: HashMap<String, PendingRequest>,
}

impl PendingRequests {
    pub fn new() -> Self {
        PendingRequests {
            requests: HashMap::new(),
        }
    }

    pub fn insert(
        &mut self,
        header: JupyterMessageHeader,
        reply_tx: async_channel::Sender<JupyterMessage>,
        flags: RequestFlags,
    ) {
        let msg_id = header.msg_id.clone();
        self.requests.insert(
            msg_id,
            PendingRequest {
                header,
                reply_tx,
                created: Instant::now(),
                flags,
            },
        );
    }

    pub fn get(&self, msg_id: &str) -> Option<&PendingRequest> {
        self.requests.get(msg_id)
    }

    /// Resolve a request, removing it from the map. The caller delivers the
    /// terminal reply before the returned entry (and its sender) drops.
    pub fn remove(&mut self, msg_id: &str) -> Option<PendingRequest> {
        self.requests.remove(msg_id)
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Drop every pending request without resolution. Each receiver observes
    /// its stream closing with no terminal reply.
    pub fn clear(&mut self) {
        if !self.requests.is_empty() {
            log::debug!("Abandoning {} pending requests", self.requests.len());
        }
        self.requests.clear();
    }

    /// The IDs of requests older than `ttl`, oldest first.
    pub fn expired(&self, ttl: Duration) -> Vec<String> {
        let now = Instant::now();
        let mut stale: Vec<(&String, Instant)> = self
            .requests
            .iter()
            .filter(|(_, req)| now.duration_since(req.created) >= ttl)
            .map(|(id, req)| (id, req.created))
            .collect();
        stale.sort_by_key(|(_, created)| *created);
        stale.into_iter().map(|(id, _)| id.clone()).collect()
    }
}
