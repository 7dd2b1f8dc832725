//
// kernel_transport.rs
//
// Copyright (C) 2025 ktransport contributors. All rights reserved.
//
//

//! The kernel transport façade.
//!
//! One transport owns one kernel: its process, its connection file, its four
//! sockets, and all per-request state. The relay loop spawned here is the
//! only task that touches the sockets; everything else goes through the
//! router's channels.

use std::path::PathBuf;
use std::sync::Arc;

use event_listener::Event;
use ktshared::jupyter_message::{JupyterChannel, JupyterMessage};
use ktshared::kernel_event::{KernelStatus, TransportEvent};
use rand::Rng;
use tokio::sync::RwLock;
use tokio::time::{Duration, Instant};

use crate::config::TransportConfig;
use crate::connection::KernelConnection;
use crate::connection_file::ConnectionFile;
use crate::error::KTError;
use crate::handler::{Disposition, HandlerChain, KernelHandler, Operation};
use crate::heartbeat::HeartbeatMonitor;
use crate::launch::KernelLaunchSpec;
use crate::outbound::{OutboundQueue, OutboundRequest};
use crate::pending::RequestFlags;
use crate::process::{ProcessHandle, ProcessMonitor};
use crate::registry::{KernelRecord, KernelRegistry};
use crate::router::Router;
use crate::socket::KernelSocket;

pub struct KernelTransport {
    session_id: String,
    spec: KernelLaunchSpec,
    config: TransportConfig,
    connection: KernelConnection,
    connection_file: ConnectionFile,
    connection_file_path: PathBuf,

    router: Arc<RwLock<Router>>,
    handlers: std::sync::RwLock<HandlerChain>,
    registry: Arc<KernelRegistry>,

    event_tx: async_channel::Sender<TransportEvent>,
    event_rx: async_channel::Receiver<TransportEvent>,

    process: Arc<RwLock<Option<ProcessHandle>>>,

    /// Fires once, when the transport is destroyed
    destroy_event: Arc<Event>,
}

impl KernelTransport {
    /// Launch a kernel from its spec and connect to it.
    ///
    /// Generates a connection file with fresh ports and a fresh HMAC key,
    /// spawns the kernel process, connects the four sockets, and waits for
    /// the kernel to answer a kernel_info_request before returning. A kernel
    /// that never becomes ready fails with
    /// [`KTError::ConnectionTimeout`]; the transport is returned to the
    /// caller only once it is usable.
    pub async fn launch(
        spec: KernelLaunchSpec,
        config: TransportConfig,
        registry: Arc<KernelRegistry>,
    ) -> Result<Self, KTError> {
        let session_id = hex::encode(rand::thread_rng().gen::<[u8; 8]>());
        log::info!(
            "[session {}] Launching kernel '{}'",
            session_id,
            spec.display_name
        );

        let connection_file = ConnectionFile::generate(config.ip.clone(), registry.reserved_ports())
            .map_err(KTError::ConnectionFailed)?;
        let connection_file_path =
            std::env::temp_dir().join(format!("ktransport-{}.json", session_id));
        connection_file
            .to_file(&connection_file_path)
            .map_err(KTError::ConnectionFailed)?;

        let connection = KernelConnection::new(
            session_id.clone(),
            config.username.clone(),
            connection_file.info.key.clone(),
        )
        .map_err(KTError::ConnectionFailed)?;

        // The router's outbound sender is replaced by each boot(), which
        // wires it to the relay loop it spawns
        let (outbound_tx, _outbound_rx) = async_channel::unbounded();
        let (event_tx, event_rx) = async_channel::unbounded();
        let router = Arc::new(RwLock::new(Router::new(
            &session_id,
            &config.username,
            outbound_tx,
            event_tx.clone(),
        )));

        let transport = KernelTransport {
            session_id,
            spec,
            config,
            connection,
            connection_file,
            connection_file_path,
            router,
            handlers: std::sync::RwLock::new(HandlerChain::new()),
            registry: registry.clone(),
            event_tx,
            event_rx,
            process: Arc::new(RwLock::new(None)),
            destroy_event: Arc::new(Event::new()),
        };

        transport.boot().await?;
        transport.start_sweeper();

        let pid = match transport.process.read().await.as_ref() {
            Some(handle) => handle.pid,
            None => 0,
        };
        registry.register(KernelRecord {
            session_id: transport.session_id.clone(),
            display_name: transport.spec.display_name.clone(),
            language: transport.spec.language.clone(),
            pid,
        });

        transport.replay_startup_code().await;
        Ok(transport)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn connection_file_path(&self) -> &std::path::Path {
        &self.connection_file_path
    }

    /// The stream of kernel lifecycle events: status changes, process
    /// output, heartbeat loss, and exit.
    pub fn events(&self) -> async_channel::Receiver<TransportEvent> {
        self.event_rx.clone()
    }

    pub async fn status(&self) -> KernelStatus {
        self.router.read().await.status()
    }

    /// Insert a handler ahead of the transport's own operation handling.
    pub fn add_handler(&self, handler: Box<dyn KernelHandler>) {
        self.handlers.write().unwrap().push_front(handler);
    }

    /// Spawn the kernel process, connect the sockets, start the relay loop
    /// and heartbeat monitor, and wait for the kernel to answer a
    /// kernel_info_request.
    async fn boot(&self) -> Result<(), KTError> {
        let monitor = ProcessMonitor::new(self.session_id.clone(), self.event_tx.clone());
        let argv = self
            .spec
            .command_line(&self.connection_file_path.to_string_lossy());
        let handle = monitor.spawn(&argv, self.spec.working_dir.as_deref(), &self.spec.env_pairs())?;
        *self.process.write().await = Some(handle.clone());

        let timeout_secs = self.config.connection_timeout_secs;
        let sockets = match tokio::time::timeout(
            Duration::from_secs(timeout_secs),
            self.connect_sockets(),
        )
        .await
        {
            Ok(Ok(sockets)) => sockets,
            Ok(Err(err)) => {
                self.router.write().await.set_status(KernelStatus::Error);
                let err = KTError::ConnectionFailed(err);
                err.log();
                return Err(err);
            }
            Err(_) => {
                self.router.write().await.set_status(KernelStatus::Error);
                let err = KTError::ConnectionTimeout(timeout_secs);
                err.log();
                return Err(err);
            }
        };

        // Each boot gets its own outbound channel, so a relay loop still
        // winding down from a killed kernel cannot pick up messages meant
        // for this one
        let (outbound_tx, outbound_rx) = async_channel::unbounded();
        self.router.write().await.set_outbound(outbound_tx);

        let (shell, iopub, stdin) = sockets;
        tokio::spawn(Self::relay_loop(
            self.session_id.clone(),
            shell,
            iopub,
            stdin,
            self.router.clone(),
            outbound_rx,
            handle.clone(),
        ));

        let heartbeat = HeartbeatMonitor::new(
            self.session_id.clone(),
            self.connection_file
                .endpoint(self.connection_file.info.hb_port),
            handle.exit_event.clone(),
            self.event_tx.clone(),
            self.config.heartbeat_interval_secs,
            self.config.heartbeat_wait_secs,
            self.config.heartbeat_misses,
        );
        heartbeat.monitor();

        // Readiness barrier: the kernel is usable once it answers a
        // kernel_info_request on the shell channel
        let info = self.connection.request(
            "kernel_info_request",
            JupyterChannel::Shell,
            serde_json::json!({}),
        );
        let reply_rx = self.router.write().await.submit(
            info,
            RequestFlags {
                silent: false,
                suppress_status: true,
            },
        )?;

        let deadline = Instant::now() + Duration::from_secs(timeout_secs);
        loop {
            let reply = match tokio::time::timeout_at(deadline, reply_rx.recv()).await {
                Ok(Ok(reply)) => reply,
                _ => {
                    self.router.write().await.set_status(KernelStatus::Error);
                    let err = KTError::ConnectionTimeout(timeout_secs);
                    err.log();
                    return Err(err);
                }
            };

            // Busy/idle broadcasts parented to the probe arrive on iopub
            // ahead of the shell reply; only the shell message answers it
            if reply.channel != JupyterChannel::Shell {
                continue;
            }

            // A synthesized error reply (the probe's send failed) still
            // arrives on the shell stream; it means the kernel never
            // received a message, not that it is ready
            if reply.header.msg_type != "kernel_info_reply"
                || reply.content.get("status").and_then(|s| s.as_str()) == Some("error")
            {
                self.router.write().await.set_status(KernelStatus::Error);
                let err = KTError::ConnectionFailed(anyhow::anyhow!(
                    "kernel's first reply was {}: {}",
                    reply.header.msg_type,
                    reply
                        .content
                        .get("evalue")
                        .and_then(|v| v.as_str())
                        .unwrap_or("unexpected reply type")
                ));
                err.log();
                return Err(err);
            }

            log::info!(
                "[session {}] Kernel ready ({})",
                self.session_id,
                reply
                    .content
                    .get("implementation")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown implementation")
            );
            self.router.write().await.set_status(KernelStatus::Idle);
            return Ok(());
        }
    }

    /// Create and connect the shell, iopub, and stdin sockets.
    async fn connect_sockets(
        &self,
    ) -> Result<(KernelSocket, KernelSocket, KernelSocket), anyhow::Error> {
        let info = &self.connection_file.info;
        let hmac_key = self.connection.hmac_key.clone();

        let mut shell =
            KernelSocket::dealer(JupyterChannel::Shell, &self.session_id, hmac_key.clone())?;
        shell
            .connect(&self.connection_file.endpoint(info.shell_port))
            .await?;

        let mut stdin =
            KernelSocket::dealer(JupyterChannel::Stdin, &self.session_id, hmac_key.clone())?;
        stdin
            .connect(&self.connection_file.endpoint(info.stdin_port))
            .await?;

        let mut iopub = KernelSocket::sub(JupyterChannel::IOPub, &self.session_id, hmac_key);
        iopub
            .connect(&self.connection_file.endpoint(info.iopub_port))
            .await?;
        iopub.subscribe_all().await?;

        Ok((shell, iopub, stdin))
    }

    /// The relay loop: the single task that reads and writes the sockets.
    ///
    /// Inbound messages are fed to the router; outbound messages are drained
    /// from the router's channel into per-channel queues and written with a
    /// retry tick for transient socket-busy failures. The loop ends when the
    /// kernel process exits, and closes the sockets on its way out.
    async fn relay_loop(
        session_id: String,
        mut shell: KernelSocket,
        mut iopub: KernelSocket,
        mut stdin: KernelSocket,
        router: Arc<RwLock<Router>>,
        outbound_rx: async_channel::Receiver<JupyterMessage>,
        process: ProcessHandle,
    ) {
        let mut shell_queue = OutboundQueue::new(JupyterChannel::Shell);
        let mut stdin_queue = OutboundQueue::new(JupyterChannel::Stdin);
        let mut retry = tokio::time::interval(Duration::from_millis(100));
        retry.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = process.wait_for_exit() => {
                    log::debug!(
                        "[session {}] Stopping relay loop (kernel process exited)",
                        session_id
                    );
                    break;
                }
                result = shell.recv() => match result {
                    Ok(Some(message)) => router.write().await.handle_shell(message),
                    Ok(None) => {}
                    Err(err) => {
                        log::warn!(
                            "[session {}] Shell socket receive failed: {}",
                            session_id,
                            err
                        );
                        break;
                    }
                },
                result = iopub.recv() => match result {
                    Ok(Some(message)) => router.write().await.handle_iopub(message),
                    Ok(None) => {}
                    Err(err) => {
                        log::warn!(
                            "[session {}] IOPub socket receive failed: {}",
                            session_id,
                            err
                        );
                        break;
                    }
                },
                result = stdin.recv() => match result {
                    Ok(Some(message)) => router.write().await.handle_stdin(message),
                    Ok(None) => {}
                    Err(err) => {
                        log::warn!(
                            "[session {}] Stdin socket receive failed: {}",
                            session_id,
                            err
                        );
                        break;
                    }
                },
                message = outbound_rx.recv() => match message {
                    Ok(message) => {
                        match message.channel {
                            JupyterChannel::Stdin => {
                                stdin_queue.push(OutboundRequest { message })
                            }
                            _ => shell_queue.push(OutboundRequest { message }),
                        }
                        for outcome in shell_queue.process(&mut shell).await {
                            router.write().await.handle_send_outcome(outcome);
                        }
                        for outcome in stdin_queue.process(&mut stdin).await {
                            router.write().await.handle_send_outcome(outcome);
                        }
                    }
                    Err(_) => {
                        log::debug!(
                            "[session {}] Stopping relay loop (outbound channel closed)",
                            session_id
                        );
                        break;
                    }
                },
                _ = retry.tick() => {
                    if !shell_queue.is_empty() {
                        for outcome in shell_queue.process(&mut shell).await {
                            router.write().await.handle_send_outcome(outcome);
                        }
                    }
                    if !stdin_queue.is_empty() {
                        for outcome in stdin_queue.process(&mut stdin).await {
                            router.write().await.handle_send_outcome(outcome);
                        }
                    }
                }
            }
        }

        shell.close().await;
        iopub.close().await;
        stdin.close().await;
        log::debug!("[session {}] Relay loop finished", session_id);
    }

    /// Periodically expire requests that have waited too long for a reply.
    fn start_sweeper(&self) {
        let router = self.router.clone();
        let destroy_event = self.destroy_event.clone();
        let interval = self.config.sweep_interval_secs;
        let ttl = self.config.request_timeout_secs;

        tokio::spawn(async move {
            loop {
                let destroyed = destroy_event.listen();
                tokio::select! {
                    _ = destroyed => break,
                    _ = tokio::time::sleep(Duration::from_secs(interval)) => {
                        router.write().await.sweep(ttl);
                    }
                }
            }
        });
    }

    /// Run the configured startup code, silently. Called on launch and again
    /// after each restart.
    async fn replay_startup_code(&self) {
        let code_lines = self.config.startup_code.clone();
        for code in code_lines {
            if let Err(err) = self.submit_execute(&code, true, true).await {
                log::warn!(
                    "[session {}] Failed to run startup code: {}",
                    self.session_id,
                    err
                );
            }
        }
    }

    /// Execute code in the kernel.
    ///
    /// Returns the request's result stream: every message parented to the
    /// request, terminated by the shell-channel execute_reply.
    pub async fn execute(
        &self,
        code: &str,
    ) -> Result<async_channel::Receiver<JupyterMessage>, KTError> {
        if self.dispatch_handlers(&Operation::Execute { code }) {
            return Ok(Self::closed_stream());
        }
        self.submit_execute(code, false, false).await
    }

    /// Execute code silently: no history entry, no externally visible
    /// busy/idle transitions.
    pub async fn execute_silent(
        &self,
        code: &str,
    ) -> Result<async_channel::Receiver<JupyterMessage>, KTError> {
        if self.dispatch_handlers(&Operation::Execute { code }) {
            return Ok(Self::closed_stream());
        }
        self.submit_execute(code, true, true).await
    }

    /// Execute code normally but without externally visible busy/idle
    /// transitions, for watch-style consumers that poll expressions.
    pub async fn execute_watch(
        &self,
        code: &str,
    ) -> Result<async_channel::Receiver<JupyterMessage>, KTError> {
        if self.dispatch_handlers(&Operation::Execute { code }) {
            return Ok(Self::closed_stream());
        }
        self.submit_execute(code, false, true).await
    }

    async fn submit_execute(
        &self,
        code: &str,
        silent: bool,
        suppress_status: bool,
    ) -> Result<async_channel::Receiver<JupyterMessage>, KTError> {
        let content = serde_json::json!({
            "code": code,
            "silent": silent,
            "store_history": !silent,
            "user_expressions": {},
            "allow_stdin": true,
            "stop_on_error": !silent,
        });
        let message = self
            .connection
            .request("execute_request", JupyterChannel::Shell, content);
        self.router.write().await.submit(
            message,
            RequestFlags {
                silent,
                suppress_status,
            },
        )
    }

    /// Request completions for the code at the given cursor position.
    pub async fn complete(
        &self,
        code: &str,
        cursor_pos: usize,
    ) -> Result<async_channel::Receiver<JupyterMessage>, KTError> {
        if self.dispatch_handlers(&Operation::Complete { code, cursor_pos }) {
            return Ok(Self::closed_stream());
        }
        let content = serde_json::json!({ "code": code, "cursor_pos": cursor_pos });
        self.submit_simple("complete_request", content).await
    }

    /// Request introspection of the code at the given cursor position.
    pub async fn inspect(
        &self,
        code: &str,
        cursor_pos: usize,
    ) -> Result<async_channel::Receiver<JupyterMessage>, KTError> {
        if self.dispatch_handlers(&Operation::Inspect { code, cursor_pos }) {
            return Ok(Self::closed_stream());
        }
        let content = serde_json::json!({
            "code": code,
            "cursor_pos": cursor_pos,
            "detail_level": 0,
        });
        self.submit_simple("inspect_request", content).await
    }

    /// Ask the kernel to describe itself.
    pub async fn kernel_info(
        &self,
    ) -> Result<async_channel::Receiver<JupyterMessage>, KTError> {
        self.submit_simple("kernel_info_request", serde_json::json!({}))
            .await
    }

    async fn submit_simple(
        &self,
        msg_type: &str,
        content: serde_json::Value,
    ) -> Result<async_channel::Receiver<JupyterMessage>, KTError> {
        let message = self
            .connection
            .request(msg_type, JupyterChannel::Shell, content);
        self.router.write().await.submit(
            message,
            RequestFlags {
                silent: false,
                suppress_status: true,
            },
        )
    }

    /// Answer the kernel's most recent stdin input_request.
    pub async fn input_reply(&self, value: &str) -> Result<(), KTError> {
        if self.dispatch_handlers(&Operation::InputReply { value }) {
            return Ok(());
        }
        self.router.write().await.input_reply(value)
    }

    /// Interrupt the kernel with a signal.
    pub async fn interrupt(&self) -> Result<(), KTError> {
        if self.dispatch_handlers(&Operation::Interrupt) {
            return Ok(());
        }
        if self.router.read().await.is_destroyed() {
            return Err(KTError::TransportDestroyed);
        }
        match self.process.read().await.as_ref() {
            Some(handle) => handle.interrupt(),
            None => Err(KTError::InterruptFailed(anyhow::anyhow!(
                "no kernel process to interrupt"
            ))),
        }
    }

    /// Restart the kernel: kill the old process, abandon all pending
    /// requests, relaunch with the same connection file, and replay the
    /// configured startup code. A no-op if a restart is already underway.
    pub async fn restart(&self) -> Result<(), KTError> {
        if self.dispatch_handlers(&Operation::Restart) {
            return Ok(());
        }
        {
            let mut router = self.router.write().await;
            if router.is_destroyed() {
                return Err(KTError::TransportDestroyed);
            }
            if router.is_restarting() {
                log::debug!(
                    "[session {}] Restart already in progress; ignoring",
                    self.session_id
                );
                return Ok(());
            }
            router.begin_restart();
        }

        if let Some(handle) = self.process.write().await.take() {
            handle.kill();
            handle.wait_for_exit().await;
        }

        let result = self.boot().await;
        self.router.write().await.finish_restart();
        match result {
            Ok(()) => {
                let pid = match self.process.read().await.as_ref() {
                    Some(handle) => handle.pid,
                    None => 0,
                };
                self.registry.register(KernelRecord {
                    session_id: self.session_id.clone(),
                    display_name: self.spec.display_name.clone(),
                    language: self.spec.language.clone(),
                    pid,
                });
                self.replay_startup_code().await;
                Ok(())
            }
            Err(err) => {
                let err = KTError::RestartFailed(anyhow::Error::new(err));
                err.log();
                Err(err)
            }
        }
    }

    /// Ask the kernel to shut itself down. Queued (unsent) execute requests
    /// are abandoned; the in-flight one, if any, is left to finish.
    pub async fn shutdown(
        &self,
    ) -> Result<async_channel::Receiver<JupyterMessage>, KTError> {
        if self.dispatch_handlers(&Operation::Shutdown) {
            return Ok(Self::closed_stream());
        }
        let message = self.connection.request(
            "shutdown_request",
            JupyterChannel::Shell,
            serde_json::json!({ "restart": false }),
        );
        let mut router = self.router.write().await;
        router.abort_queued();
        router.submit(
            message,
            RequestFlags {
                silent: false,
                suppress_status: true,
            },
        )
    }

    /// Shut the kernel down gracefully, escalating to a kill if it does not
    /// exit within `wait_secs`. Destroys the transport afterwards.
    pub async fn graceful_shutdown(&self, wait_secs: u64) {
        if let Err(err) = self.shutdown().await {
            log::debug!(
                "[session {}] Shutdown request not sent: {}",
                self.session_id,
                err
            );
        }

        let handle = self.process.read().await.clone();
        if let Some(handle) = handle {
            if tokio::time::timeout(Duration::from_secs(wait_secs), handle.wait_for_exit())
                .await
                .is_err()
            {
                log::warn!(
                    "[session {}] Kernel did not exit within {} seconds; killing it",
                    self.session_id,
                    wait_secs
                );
                handle.kill();
                handle.wait_for_exit().await;
            }
        }

        self.destroy().await;
    }

    /// Tear the transport down: abandon all pending requests, ignore any
    /// frames still in transit, kill the kernel process, delete the
    /// connection file, and release the kernel's ports. Idempotent; calls
    /// after the first are no-ops.
    pub async fn destroy(&self) {
        {
            let mut router = self.router.write().await;
            if !router.destroy() {
                return;
            }
            router.set_status(KernelStatus::Exited);
        }
        log::info!("[session {}] Destroying kernel transport", self.session_id);
        self.destroy_event.notify(usize::MAX);

        let handle = self.process.write().await.take();
        if let Some(handle) = handle {
            handle.kill();
            handle.wait_for_exit().await;
        }

        // Best effort; a missing file is not a problem
        if let Err(err) = std::fs::remove_file(&self.connection_file_path) {
            log::debug!(
                "[session {}] Could not remove connection file: {}",
                self.session_id,
                err
            );
        }

        self.registry
            .unregister(&self.session_id, &self.connection_file.ports());
    }

    fn dispatch_handlers(&self, operation: &Operation) -> bool {
        self.handlers.read().unwrap().dispatch(operation) == Disposition::Handled
    }

    /// An already-closed result stream, returned when a handler claims an
    /// operation before it reaches the kernel.
    fn closed_stream() -> async_channel::Receiver<JupyterMessage> {
        let (tx, rx) = async_channel::unbounded();
        drop(tx);
        rx
    }
}
