//
// outbound.rs
//
// Copyright (C) 2025 ktransport contributors. All rights reserved.
//
//

use std::collections::VecDeque;

use ktshared::jupyter_message::{JupyterChannel, JupyterMessage};

/// A message send failure, classified by the socket wrapper.
#[derive(Debug)]
pub enum SendFailure {
    /// The backend's outgoing queue was busy; the message must be retried,
    /// not dropped.
    Transient,

    /// The send failed for good; the owning request must be failed so its
    /// callback still completes.
    Fatal(anyhow::Error),
}

/// The seam between the outbound queue and the wire. The real implementation
/// is [`crate::socket::KernelSocket`]; tests substitute a scripted sink.
#[allow(async_fn_in_trait)]
pub trait MessageSink {
    async fn send_message(&mut self, message: &JupyterMessage) -> Result<(), SendFailure>;
}

/// One request waiting to be written to a socket.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    /// The message to send; its header's msg_id is the request ID.
    pub message: JupyterMessage,
}

/// The result of attempting to send one queued request.
#[derive(Debug)]
pub enum SendOutcome {
    /// The request was written to the socket
    Sent(String),

    /// The send failed fatally; the request was discarded and its callback
    /// must be completed with a synthesized error
    Failed(String, anyhow::Error),
}

/// A per-channel FIFO of outbound requests with single-writer discipline.
///
/// The queue, not the socket wrapper, guarantees that no two sends are in
/// flight concurrently on one channel; concurrent writes to the same
/// outgoing socket queue is exactly the failure this layer exists to avoid.
pub struct OutboundQueue {
    /// The channel this queue feeds
    pub channel: JupyterChannel,

    pending: VecDeque<OutboundRequest>,
    busy: bool,
}

impl OutboundQueue {
    pub fn new(channel: JupyterChannel) -> Self {
        OutboundQueue {
            channel,
            pending: VecDeque::new(),
            busy: false,
        }
    }

    /// Append a request to the queue. Call [`OutboundQueue::process`] to
    /// trigger sending.
    pub fn push(&mut self, request: OutboundRequest) {
        self.pending.push_back(request);
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Drop all queued requests (restart/destroy).
    pub fn clear(&mut self) {
        if !self.pending.is_empty() {
            log::debug!(
                "Discarding {} queued outbound requests on {:?}",
                self.pending.len(),
                self.channel
            );
        }
        self.pending.clear();
    }

    /// Send queued requests in order until the queue is empty or a transient
    /// failure stops progress.
    ///
    /// Reentrant-safe no-op while a send pass is already running or when the
    /// queue is empty. A transient failure requeues the message at the head
    /// and stops the pass; the caller retries on its next trigger. A fatal
    /// failure discards the message and reports it in the returned outcomes
    /// so the owning request can be completed with a synthesized error.
    pub async fn process<S: MessageSink>(&mut self, sink: &mut S) -> Vec<SendOutcome> {
        if self.busy {
            return Vec::new();
        }
        self.busy = true;

        let mut outcomes = Vec::new();
        while let Some(request) = self.pending.pop_front() {
            let msg_id = request.message.header.msg_id.clone();
            match sink.send_message(&request.message).await {
                Ok(()) => {
                    log::trace!("Sent request {} on {:?}", msg_id, self.channel);
                    outcomes.push(SendOutcome::Sent(msg_id));
                    // Yield between sends so a long queue doesn't monopolize
                    // the executor
                    tokio::task::yield_now().await;
                }
                Err(SendFailure::Transient) => {
                    log::debug!(
                        "Socket busy sending request {} on {:?}; will retry",
                        msg_id,
                        self.channel
                    );
                    self.pending.push_front(request);
                    break;
                }
                Err(SendFailure::Fatal(err)) => {
                    log::error!(
                        "Failed to send request {} on {:?}: {}",
                        msg_id,
                        self.channel,
                        err
                    );
                    outcomes.push(SendOutcome::Failed(msg_id, err));
                }
            }
        }

        self.busy = false;
        outcomes
    }
}
