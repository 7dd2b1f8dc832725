//
// router.rs
//
// Copyright (C) 2025 ktransport contributors. All rights reserved.
//
//

//! The message router: the socket-free core of the transport.
//!
//! The router owns every piece of per-request state (the pending request map,
//! the reply/idle correlator, the execution queue) and turns the kernel's
//! unordered wire traffic into deterministic per-request result streams. It
//! touches no sockets; the relay loop in
//! [`crate::kernel_transport::KernelTransport`] feeds it inbound messages and
//! drains its outbound channel, which is what makes it fully testable without
//! a kernel.

use ktshared::jupyter_message::{JupyterChannel, JupyterMessage, JupyterMessageHeader};
use ktshared::kernel_event::{KernelStatus, TransportEvent};

use crate::error::KTError;
use crate::execution::{Correlation, ExecutionQueue, ReplyCorrelator};
use crate::jupyter_messages::{execution_state, ExecutionState};
use crate::outbound::SendOutcome;
use crate::pending::{PendingRequests, RequestFlags};

/// Pending-request count above which the sweep logs a leak warning.
const PENDING_LEAK_THRESHOLD: usize = 128;

pub struct Router {
    session_id: String,
    username: String,

    pending: PendingRequests,
    correlator: ReplyCorrelator,
    execution: ExecutionQueue,

    /// Messages ready to be written to a socket; drained by the relay loop
    outbound_tx: async_channel::Sender<JupyterMessage>,

    /// Kernel lifecycle events for the transport's consumer
    event_tx: async_channel::Sender<TransportEvent>,

    /// The most recently emitted kernel status
    status: KernelStatus,

    /// The most recent unanswered stdin input_request from the kernel
    last_input_request: Option<JupyterMessageHeader>,

    destroyed: bool,
    restarting: bool,
}

impl Router {
    pub fn new(
        session_id: &str,
        username: &str,
        outbound_tx: async_channel::Sender<JupyterMessage>,
        event_tx: async_channel::Sender<TransportEvent>,
    ) -> Self {
        Router {
            session_id: session_id.to_string(),
            username: username.to_string(),
            pending: PendingRequests::new(),
            correlator: ReplyCorrelator::new(),
            execution: ExecutionQueue::new(),
            outbound_tx,
            event_tx,
            status: KernelStatus::Loading,
            last_input_request: None,
            destroyed: false,
            restarting: false,
        }
    }

    /// Replace the outbound channel. Each kernel boot wires the router to
    /// the relay loop it spawns, so a loop still winding down from a killed
    /// kernel cannot pick up messages meant for the new one.
    pub fn set_outbound(&mut self, outbound_tx: async_channel::Sender<JupyterMessage>) {
        self.outbound_tx = outbound_tx;
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    pub fn is_restarting(&self) -> bool {
        self.restarting
    }

    pub fn status(&self) -> KernelStatus {
        self.status
    }

    /// Register and dispatch a request, returning its result stream.
    ///
    /// The stream yields every message parented to the request and closes
    /// after the terminal shell-channel reply. Execute requests are
    /// serialized: at most one is dispatched to the kernel at a time, and the
    /// rest wait in FIFO order. All other request types dispatch immediately.
    pub fn submit(
        &mut self,
        message: JupyterMessage,
        flags: RequestFlags,
    ) -> Result<async_channel::Receiver<JupyterMessage>, KTError> {
        if self.destroyed {
            return Err(KTError::TransportDestroyed);
        }

        let (reply_tx, reply_rx) = async_channel::unbounded();
        self.pending.insert(message.header.clone(), reply_tx, flags);

        if message.header.msg_type == "execute_request" {
            self.correlator.begin(&message.header.msg_id);
            if self.execution.process_request(message.clone()) {
                self.dispatch(message);
            }
        } else {
            self.dispatch(message);
        }

        Ok(reply_rx)
    }

    /// Hand a message to the relay loop for sending.
    fn dispatch(&mut self, message: JupyterMessage) {
        let msg_id = message.header.msg_id.clone();
        if self.outbound_tx.try_send(message).is_err() {
            // The relay loop is gone; complete the request with an error so
            // its stream still terminates
            self.fail_request(&msg_id, "SendError", "the kernel connection is closed");
        }
    }

    /// Route an inbound shell-channel message.
    pub fn handle_shell(&mut self, message: JupyterMessage) {
        if self.destroyed {
            return;
        }
        let parent_id = match message.parent_id() {
            Some(id) => id.to_string(),
            None => {
                log::trace!(
                    "[session {}] Dropping unparented shell message {}",
                    self.session_id,
                    message.header.msg_type
                );
                return;
            }
        };

        let is_execute = match self.pending.get(&parent_id) {
            Some(request) => request.header.msg_type == "execute_request",
            None => {
                log::trace!(
                    "[session {}] Dropping shell message {} for unknown request {}",
                    self.session_id,
                    message.header.msg_type,
                    parent_id
                );
                return;
            }
        };

        if is_execute {
            match self.correlator.on_reply(&parent_id, message) {
                Correlation::Complete { reply, idle } => {
                    self.finish_execution(&parent_id, *reply, *idle);
                }
                Correlation::Deferred => {}
                Correlation::Stale => {
                    log::trace!(
                        "[session {}] Dropping stale execute reply for {}",
                        self.session_id,
                        parent_id
                    );
                }
            }
        } else {
            // Terminal reply for a non-execute request
            if let Some(request) = self.pending.remove(&parent_id) {
                request.deliver(message);
            }
        }
    }

    /// Route an inbound iopub-channel message.
    pub fn handle_iopub(&mut self, message: JupyterMessage) {
        if self.destroyed {
            return;
        }
        let state = execution_state(&message);

        let parent_id = match message.parent_id() {
            Some(id) => id.to_string(),
            None => {
                // The only expected unparented broadcast is the startup
                // status
                if state == Some(ExecutionState::Starting) {
                    self.set_status(KernelStatus::Starting);
                }
                return;
            }
        };

        let (is_execute, suppress) = match self.pending.get(&parent_id) {
            Some(request) => (
                request.header.msg_type == "execute_request",
                request.flags.suppress_status,
            ),
            None => {
                log::trace!(
                    "[session {}] Dropping iopub message {} for unknown request {}",
                    self.session_id,
                    message.header.msg_type,
                    parent_id
                );
                return;
            }
        };

        match state {
            Some(ExecutionState::Idle) if is_execute => {
                // The idle half of the reply/idle race; withheld until the
                // execute_reply is also in hand
                match self.correlator.on_idle(&parent_id, message) {
                    Correlation::Complete { reply, idle } => {
                        self.finish_execution(&parent_id, *reply, *idle);
                    }
                    Correlation::Deferred => {}
                    Correlation::Stale => {}
                }
            }
            Some(ExecutionState::Idle) => {
                if let Some(request) = self.pending.get(&parent_id) {
                    request.deliver(message);
                }
                if !suppress {
                    self.set_status(KernelStatus::Idle);
                }
            }
            Some(ExecutionState::Busy) => {
                if let Some(request) = self.pending.get(&parent_id) {
                    request.deliver(message);
                }
                if !suppress {
                    self.set_status(KernelStatus::Busy);
                }
            }
            _ => {
                // Output, display data, errors: deliver to the owning stream
                if let Some(request) = self.pending.get(&parent_id) {
                    request.deliver(message);
                }
            }
        }
    }

    /// Route an inbound stdin-channel message.
    pub fn handle_stdin(&mut self, message: JupyterMessage) {
        if self.destroyed {
            return;
        }
        if message.header.msg_type != "input_request" {
            log::trace!(
                "[session {}] Dropping unexpected stdin message {}",
                self.session_id,
                message.header.msg_type
            );
            return;
        }

        self.last_input_request = Some(message.header.clone());
        if let Some(parent_id) = message.parent_id().map(str::to_string) {
            if let Some(request) = self.pending.get(&parent_id) {
                request.deliver(message);
            }
        }
    }

    /// Answer the kernel's most recent stdin input_request.
    pub fn input_reply(&mut self, value: &str) -> Result<(), KTError> {
        if self.destroyed {
            return Err(KTError::TransportDestroyed);
        }
        let request = match self.last_input_request.take() {
            Some(header) => header,
            None => {
                log::warn!(
                    "[session {}] Ignoring input reply with no outstanding input request",
                    self.session_id
                );
                return Ok(());
            }
        };

        let mut message = JupyterMessage::request(
            "input_reply",
            JupyterChannel::Stdin,
            serde_json::json!({ "value": value }),
            &self.session_id,
            &self.username,
        );
        message.parent_header = Some(request);
        self.dispatch(message);
        Ok(())
    }

    /// Deliver the resolved reply/idle pair for an execution, then start the
    /// next queued execute request, if any.
    fn finish_execution(&mut self, msg_id: &str, reply: JupyterMessage, idle: JupyterMessage) {
        let mut suppress = true;
        if let Some(request) = self.pending.remove(msg_id) {
            suppress = request.flags.suppress_status;
            // The withheld idle goes to the stream ahead of the terminal
            // reply so the stream closes on the reply
            request.deliver(idle);
            request.deliver(reply);
        }
        self.correlator.remove(msg_id);
        if !suppress {
            self.set_status(KernelStatus::Idle);
        }
        self.advance_queue(msg_id);
    }

    /// If `msg_id` was the current execution, dispatch the next queued one.
    fn advance_queue(&mut self, msg_id: &str) {
        if !self.execution.is_active(msg_id) {
            return;
        }
        if let Some(next) = self.execution.next_request() {
            self.dispatch(next);
        }
    }

    /// Complete a request with a synthesized error: an iopub-shaped error
    /// followed by a terminal shell-shaped error reply, exactly as if the
    /// kernel had produced them.
    pub fn fail_request(&mut self, msg_id: &str, ename: &str, evalue: &str) {
        let request = match self.pending.remove(msg_id) {
            Some(request) => request,
            None => return,
        };
        log::debug!(
            "[session {}] Failing request {} ({}: {})",
            self.session_id,
            msg_id,
            ename,
            evalue
        );

        request.deliver(crate::jupyter_messages::synthetic_iopub_error(
            &request.header,
            ename,
            evalue,
            &self.username,
        ));
        request.deliver(crate::jupyter_messages::synthetic_error_reply(
            &request.header,
            ename,
            evalue,
            &self.username,
        ));

        if request.header.msg_type == "execute_request" {
            self.correlator.remove(msg_id);
            self.execution.remove_pending(msg_id);
            self.advance_queue(msg_id);
        }
    }

    /// Fail every pending request older than the given number of seconds.
    pub fn sweep(&mut self, ttl_secs: u64) {
        if self.pending.len() > PENDING_LEAK_THRESHOLD {
            log::warn!(
                "[session {}] {} pending requests outstanding; possible leak",
                self.session_id,
                self.pending.len()
            );
        }
        let ttl = std::time::Duration::from_secs(ttl_secs);
        for msg_id in self.pending.expired(ttl) {
            self.fail_request(
                &msg_id,
                "Timeout",
                &format!("no reply from the kernel within {} seconds", ttl_secs),
            );
        }
    }

    /// The number of unresolved requests.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Apply the result of one outbound send attempt.
    pub fn handle_send_outcome(&mut self, outcome: SendOutcome) {
        match outcome {
            SendOutcome::Sent(msg_id) => {
                log::trace!("[session {}] Sent request {}", self.session_id, msg_id);
            }
            SendOutcome::Failed(msg_id, err) => {
                self.fail_request(&msg_id, "SendError", &err.to_string());
            }
        }
    }

    /// Abandon execute requests that are queued but not yet sent. Their
    /// result streams close without a terminal reply. The in-flight
    /// execution, if any, is left to finish.
    pub fn abort_queued(&mut self) {
        for request in self.execution.drain_pending() {
            self.correlator.remove(&request.header.msg_id);
            self.pending.remove(&request.header.msg_id);
        }
    }

    /// Abandon all request state: pending streams close unresolved, the
    /// execute queue empties, and the correlator forgets everything.
    fn abandon_all(&mut self) {
        self.pending.clear();
        self.correlator.clear();
        self.execution.clear();
        self.last_input_request = None;
    }

    /// Enter the restart phase: abandon all pending requests and refuse
    /// nothing (new requests queue against the restarted kernel).
    pub fn begin_restart(&mut self) {
        self.restarting = true;
        self.abandon_all();
        self.set_status(KernelStatus::Restarting);
    }

    pub fn finish_restart(&mut self) {
        self.restarting = false;
    }

    /// Mark the transport destroyed. Idempotent: returns true only on the
    /// first call. Once destroyed, inbound frames are ignored and new
    /// requests are refused.
    pub fn destroy(&mut self) -> bool {
        if self.destroyed {
            return false;
        }
        self.destroyed = true;
        self.abandon_all();
        true
    }

    pub fn set_status(&mut self, status: KernelStatus) {
        if self.status == status {
            return;
        }
        self.status = status;
        self.emit(TransportEvent::Status(status));
    }

    pub fn emit(&self, event: TransportEvent) {
        if let Err(err) = self.event_tx.try_send(event) {
            log::trace!("[session {}] Dropping event: {}", self.session_id, err);
        }
    }
}
