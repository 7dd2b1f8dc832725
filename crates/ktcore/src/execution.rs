//
// execution.rs
//
// Copyright (C) 2025 ktransport contributors. All rights reserved.
//
//

//! Execution serialization and reply/idle correlation.

use std::collections::{HashMap, VecDeque};

use ktshared::jupyter_message::JupyterMessage;

/// The queue of execute requests awaiting dispatch.
///
/// At most one execute request is "current" (dispatched, awaiting its
/// terminal reply) kernel-wide at any time; the rest wait here in FIFO
/// order.
#[derive(Debug, Default)]
pub struct ExecutionQueue {
    /// The message ID of the current execution, if one is in flight
    pub active: Option<String>,

    /// Requests waiting for the current execution to finish
    pub pending: VecDeque<JupyterMessage>,
}

impl ExecutionQueue {
    pub fn new() -> Self {
        ExecutionQueue {
            active: None,
            pending: VecDeque::new(),
        }
    }

    /// Clear the execution queue
    pub fn clear(&mut self) {
        self.active = None;
        if !self.pending.is_empty() {
            log::debug!(
                "Discarding {} pending execution requests",
                self.pending.len()
            );
        }
        self.pending.clear();
    }

    /// Whether the given message ID is the current execution.
    pub fn is_active(&self, msg_id: &str) -> bool {
        self.active.as_deref() == Some(msg_id)
    }

    /// Process a given request, either accepting it for immediate dispatch or
    /// queueing it behind the current execution.
    ///
    /// Returns true if the request can be dispatched immediately, or false if
    /// it was queued for later.
    pub fn process_request(&mut self, request: JupyterMessage) -> bool {
        match &self.active {
            None => {
                log::trace!(
                    "Executing request {} immediately (no requests are waiting)",
                    request.header.msg_id
                );
                self.active = Some(request.header.msg_id.clone());
                true
            }
            Some(active) => {
                log::debug!(
                    "Queueing request {} (active request is {}; there are {} pending requests)",
                    request.header.msg_id,
                    active,
                    self.pending.len()
                );
                self.pending.push_back(request);
                false
            }
        }
    }

    /// Gets the next request to execute, if any, making it current.
    pub fn next_request(&mut self) -> Option<JupyterMessage> {
        match self.pending.pop_front() {
            Some(request) => {
                log::debug!(
                    "Executing pending request {} ({} pending requests remain)",
                    request.header.msg_id,
                    self.pending.len()
                );
                self.active = Some(request.header.msg_id.clone());
                Some(request)
            }
            None => {
                self.active = None;
                None
            }
        }
    }

    /// Remove a queued (not yet dispatched) request by message ID. Returns
    /// true if a request was removed.
    pub fn remove_pending(&mut self, msg_id: &str) -> bool {
        let before = self.pending.len();
        self.pending.retain(|m| m.header.msg_id != msg_id);
        before != self.pending.len()
    }

    /// Remove and return all queued (not yet dispatched) requests, leaving
    /// the current execution in place. Used when an interrupt or shutdown
    /// abandons queued work.
    pub fn drain_pending(&mut self) -> Vec<JupyterMessage> {
        self.pending.drain(..).collect()
    }
}

/// Where one execution stands in the reply/idle race.
///
/// Jupyter kernels do not guarantee the relative order of the shell-channel
/// `execute_reply` and the iopub `status: idle` for the same request;
/// whichever arrives first is deferred until the other shows up. Transitions
/// are monotonic: a resolved request stays resolved.
#[derive(Debug)]
pub enum DeferredReply {
    /// Neither the reply nor the idle status has been seen
    Unresolved,

    /// The execute_reply arrived first and is held until idle is seen
    ReplyFirst(Box<JupyterMessage>),

    /// The idle status arrived first and is withheld until the reply is seen
    IdleFirst(Box<JupyterMessage>),

    /// Both halves were seen and delivered
    Resolved,
}

/// The outcome of feeding one half of the reply/idle pair to the correlator.
#[derive(Debug)]
pub enum Correlation {
    /// Both halves have now been seen. Deliver the reply first, then apply
    /// the idle status; the callback fires exactly once.
    Complete {
        reply: Box<JupyterMessage>,
        idle: Box<JupyterMessage>,
    },

    /// Still waiting for the other half.
    Deferred,

    /// The request was already resolved or is unknown; drop the message.
    Stale,
}

/// Resolves the reply/idle race for each in-flight execution.
#[derive(Debug, Default)]
pub struct ReplyCorrelator {
    states: HashMap<String, DeferredReply>,
}

impl ReplyCorrelator {
    pub fn new() -> Self {
        ReplyCorrelator {
            states: HashMap::new(),
        }
    }

    /// Begin tracking a request. Called when the execute request is
    /// registered, before it is sent.
    pub fn begin(&mut self, msg_id: &str) {
        self.states
            .insert(msg_id.to_string(), DeferredReply::Unresolved);
    }

    /// Feed the shell-channel execute_reply for a request.
    pub fn on_reply(&mut self, msg_id: &str, reply: JupyterMessage) -> Correlation {
        match self.states.get_mut(msg_id) {
            Some(state @ DeferredReply::Unresolved) => {
                *state = DeferredReply::ReplyFirst(Box::new(reply));
                Correlation::Deferred
            }
            Some(state @ DeferredReply::IdleFirst(_)) => {
                let prior = std::mem::replace(state, DeferredReply::Resolved);
                match prior {
                    DeferredReply::IdleFirst(idle) => Correlation::Complete {
                        reply: Box::new(reply),
                        idle,
                    },
                    _ => unreachable!("matched IdleFirst above"),
                }
            }
            _ => Correlation::Stale,
        }
    }

    /// Feed the iopub `status: idle` message for a request.
    pub fn on_idle(&mut self, msg_id: &str, idle: JupyterMessage) -> Correlation {
        match self.states.get_mut(msg_id) {
            Some(state @ DeferredReply::Unresolved) => {
                *state = DeferredReply::IdleFirst(Box::new(idle));
                Correlation::Deferred
            }
            Some(state @ DeferredReply::ReplyFirst(_)) => {
                let prior = std::mem::replace(state, DeferredReply::Resolved);
                match prior {
                    DeferredReply::ReplyFirst(reply) => Correlation::Complete {
                        reply,
                        idle: Box::new(idle),
                    },
                    _ => unreachable!("matched ReplyFirst above"),
                }
            }
            _ => Correlation::Stale,
        }
    }

    /// Stop tracking a request.
    pub fn remove(&mut self, msg_id: &str) {
        self.states.remove(msg_id);
    }

    /// Drop all tracked state (restart/destroy).
    pub fn clear(&mut self) {
        self.states.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ktshared::jupyter_message::{JupyterChannel, JupyterMessage};

    fn message(msg_type: &str) -> JupyterMessage {
        JupyterMessage::request(
            msg_type,
            JupyterChannel::Shell,
            serde_json::json!({}),
            "test-session",
            "tester",
        )
    }

    #[test]
    fn reply_then_idle_completes_once() {
        let mut correlator = ReplyCorrelator::new();
        correlator.begin("r1");

        assert!(matches!(
            correlator.on_reply("r1", message("execute_reply")),
            Correlation::Deferred
        ));
        match correlator.on_idle("r1", message("status")) {
            Correlation::Complete { reply, idle } => {
                assert_eq!(reply.header.msg_type, "execute_reply");
                assert_eq!(idle.header.msg_type, "status");
            }
            other => panic!("expected Complete, got {:?}", other),
        }

        // No resurrection of a resolved request
        assert!(matches!(
            correlator.on_idle("r1", message("status")),
            Correlation::Stale
        ));
        assert!(matches!(
            correlator.on_reply("r1", message("execute_reply")),
            Correlation::Stale
        ));
    }

    #[test]
    fn idle_then_reply_completes_once() {
        let mut correlator = ReplyCorrelator::new();
        correlator.begin("r1");

        assert!(matches!(
            correlator.on_idle("r1", message("status")),
            Correlation::Deferred
        ));
        assert!(matches!(
            correlator.on_reply("r1", message("execute_reply")),
            Correlation::Complete { .. }
        ));
        assert!(matches!(
            correlator.on_reply("r1", message("execute_reply")),
            Correlation::Stale
        ));
    }

    #[test]
    fn unknown_request_is_stale() {
        let mut correlator = ReplyCorrelator::new();
        assert!(matches!(
            correlator.on_reply("nope", message("execute_reply")),
            Correlation::Stale
        ));
    }
}
