//
// heartbeat.rs
//
// Copyright (C) 2025 ktransport contributors. All rights reserved.
//
//

use std::sync::Arc;

use event_listener::Event;
use ktshared::kernel_event::TransportEvent;
use tokio::time::{timeout, Duration};
use zeromq::Socket;
use zeromq::SocketRecv;
use zeromq::SocketSend;
use zeromq::ReqSocket;

const HB_PAYLOAD: &str = "ktransport-heartbeat";

/// A heartbeat monitor for a kernel.
///
/// Periodically echoes a payload off the kernel's heartbeat socket. After a
/// configured number of consecutive misses it emits
/// [`TransportEvent::HeartbeatLost`]; a later echo emits
/// [`TransportEvent::HeartbeatRestored`]. The monitor is advisory only: it
/// never restarts or kills the kernel.
pub struct HeartbeatMonitor {
    session_id: String,
    address: String,
    exit_event: Arc<Event>,
    event_tx: async_channel::Sender<TransportEvent>,

    /// Seconds between echoes
    interval_secs: u64,

    /// Seconds to wait for each echo before counting a miss
    wait_secs: u64,

    /// Consecutive misses before the kernel is reported unresponsive
    misses_allowed: u32,
}

impl HeartbeatMonitor {
    pub fn new(
        session_id: String,
        address: String,
        exit_event: Arc<Event>,
        event_tx: async_channel::Sender<TransportEvent>,
        interval_secs: u64,
        wait_secs: u64,
        misses_allowed: u32,
    ) -> Self {
        Self {
            session_id,
            address,
            exit_event,
            event_tx,
            interval_secs,
            wait_secs,
            misses_allowed,
        }
    }

    /// Monitor the kernel's heartbeat. Returns immediately and runs the
    /// monitor job in the background.
    pub fn monitor(&self) {
        let addr = self.address.clone();
        let session_id = self.session_id.clone();
        let exit_event = self.exit_event.clone();
        let event_tx = self.event_tx.clone();
        let interval = Duration::from_secs(self.interval_secs);
        let wait = Duration::from_secs(self.wait_secs);
        let misses_allowed = self.misses_allowed;

        tokio::spawn(async move {
            let mut hb_socket = match Self::connect_heartbeat_socket(&addr, &session_id).await {
                Some(socket) => socket,
                None => return,
            };

            // Whether the kernel is currently considered unresponsive
            let mut lost = false;
            let mut initial = true;

            loop {
                log::trace!("[session {}] Sending heartbeat to kernel", session_id);
                if let Err(err) = hb_socket.send(HB_PAYLOAD.into()).await {
                    log::debug!(
                        "[session {}] Stopping heartbeat monitor (send failed: {})",
                        session_id,
                        err
                    );
                    if !lost {
                        Self::emit(&event_tx, TransportEvent::HeartbeatLost);
                    }
                    hb_socket.close().await;
                    return;
                }

                // The REQ socket is now in lockstep: it must receive a reply
                // before it can send again, so each timeout counts a miss and
                // we keep waiting on the same outstanding echo
                let mut misses: u32 = 0;
                loop {
                    let exit_listener = exit_event.listen();
                    tokio::select! {
                        _ = exit_listener => {
                            log::debug!(
                                "[session {}] Stopping heartbeat monitor (exit event signaled)",
                                session_id
                            );
                            hb_socket.close().await;
                            return;
                        }
                        result = timeout(wait, hb_socket.recv()) => {
                            match result {
                                Ok(Ok(response)) => {
                                    log::trace!(
                                        "[session {}] Got heartbeat response: {:?}",
                                        session_id,
                                        response
                                    );
                                    if lost {
                                        lost = false;
                                        log::info!(
                                            "[session {}] Kernel heartbeat restored",
                                            session_id
                                        );
                                        Self::emit(&event_tx, TransportEvent::HeartbeatRestored);
                                    }
                                    if initial {
                                        initial = false;
                                        log::info!(
                                            "[session {}] Received initial heartbeat from kernel",
                                            session_id
                                        );
                                    }
                                    break;
                                }
                                Ok(Err(err)) => {
                                    log::info!(
                                        "[session {}] Error receiving heartbeat response: {:?}",
                                        session_id,
                                        err
                                    );
                                    if !lost {
                                        Self::emit(&event_tx, TransportEvent::HeartbeatLost);
                                    }
                                    hb_socket.close().await;
                                    return;
                                }
                                Err(_) => {
                                    misses += 1;
                                    log::trace!(
                                        "[session {}] Missed heartbeat ({} of {})",
                                        session_id,
                                        misses,
                                        misses_allowed
                                    );
                                    if !lost && misses >= misses_allowed {
                                        lost = true;
                                        log::error!(
                                            "[session {}] No heartbeat response after {} attempts; marking kernel unresponsive",
                                            session_id,
                                            misses
                                        );
                                        Self::emit(&event_tx, TransportEvent::HeartbeatLost);
                                    }
                                }
                            }
                        }
                    }
                }

                // Wait for the next heartbeat interval or exit if signaled
                let exit_listener = exit_event.listen();
                tokio::select! {
                    _ = exit_listener => {
                        log::debug!(
                            "[session {}] Stopping heartbeat monitor (exit event signaled)",
                            session_id
                        );
                        hb_socket.close().await;
                        return;
                    }
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        });
    }

    /// Connect to the heartbeat socket
    async fn connect_heartbeat_socket(addr: &str, session_id: &str) -> Option<ReqSocket> {
        let mut hb_socket = ReqSocket::new();
        match hb_socket.connect(addr).await {
            Err(err) => {
                log::error!(
                    "[session {}] Failed to connect to heartbeat socket: {}",
                    session_id,
                    err
                );
                None
            }
            Ok(_) => {
                log::info!(
                    "[session {}] Connected to heartbeat socket at {}",
                    session_id,
                    addr
                );
                Some(hb_socket)
            }
        }
    }

    fn emit(event_tx: &async_channel::Sender<TransportEvent>, event: TransportEvent) {
        if let Err(err) = event_tx.try_send(event) {
            log::trace!("Dropping heartbeat event: {}", err);
        }
    }
}
