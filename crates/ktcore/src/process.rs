//
// process.rs
//
// Copyright (C) 2025 ktransport contributors. All rights reserved.
//
//

//! Child process management for kernel transports.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_channel::Sender;
use event_listener::Event;
use ktshared::kernel_event::{OutputStream, TransportEvent};
use tokio::io::{AsyncBufReadExt, AsyncRead};

use crate::error::KTError;

/// A handle to a running kernel process.
///
/// The process itself is owned by a monitor task; the handle carries what the
/// transport needs to signal, kill, and await it.
#[derive(Clone)]
pub struct ProcessHandle {
    /// The process ID of the kernel
    pub pid: u32,

    /// Fires when the process exits
    pub exit_event: Arc<Event>,

    exited: Arc<AtomicBool>,
    kill_tx: Sender<()>,
}

impl ProcessHandle {
    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    /// Ask the monitor task to kill the process. Returns immediately; await
    /// [`ProcessHandle::wait_for_exit`] to observe the exit.
    pub fn kill(&self) {
        if self.kill_tx.try_send(()).is_err() {
            log::trace!("Kill request for pid {} ignored (already exiting)", self.pid);
        }
    }

    /// Wait until the process has exited. Returns immediately if it already
    /// has.
    pub async fn wait_for_exit(&self) {
        loop {
            if self.has_exited() {
                return;
            }
            let listener = self.exit_event.listen();
            if self.has_exited() {
                return;
            }
            listener.await;
        }
    }

    /// Interrupt the kernel by sending it SIGINT.
    #[cfg(not(windows))]
    pub fn interrupt(&self) -> Result<(), KTError> {
        use sysinfo::{Pid, ProcessesToUpdate, Signal, System};

        let mut system = System::new();
        let pid = Pid::from_u32(self.pid);
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        match system.process(pid) {
            Some(process) => {
                process.kill_with(Signal::Interrupt);
                Ok(())
            }
            None => Err(KTError::InterruptFailed(anyhow::anyhow!(
                "process {} not found",
                self.pid
            ))),
        }
    }

    /// Signal-based interrupt is not available on Windows; kernels there use
    /// an interrupt event handle this transport does not carry.
    #[cfg(windows)]
    pub fn interrupt(&self) -> Result<(), KTError> {
        Err(KTError::InterruptUnsupported("windows".to_string()))
    }
}

/// Spawns and monitors a kernel child process.
pub struct ProcessMonitor {
    /// Session ID for logging
    session_id: String,

    /// Kernel lifecycle events for the transport's consumer
    event_tx: Sender<TransportEvent>,
}

impl ProcessMonitor {
    pub fn new(session_id: String, event_tx: Sender<TransportEvent>) -> Self {
        Self { session_id, event_tx }
    }

    /// Spawn the kernel process from its argv and start monitoring it.
    ///
    /// Standard output and error are captured line by line and forwarded as
    /// [`TransportEvent::Output`] events. When the process exits, the
    /// returned handle's exit event fires and a [`TransportEvent::Exited`]
    /// event is emitted.
    pub fn spawn(
        &self,
        argv: &[String],
        working_dir: Option<&str>,
        env: &[(String, String)],
    ) -> Result<ProcessHandle, KTError> {
        let program = argv
            .first()
            .ok_or_else(|| KTError::ProcessStartFailed(anyhow::anyhow!("empty kernel argv")))?;

        let mut command = tokio::process::Command::new(program);
        command
            .args(&argv[1..])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = working_dir {
            command.current_dir(dir);
        }
        for (name, value) in env {
            command.env(name, value);
        }

        let mut child = command
            .spawn()
            .map_err(|e| KTError::ProcessStartFailed(anyhow::anyhow!("{}", e)))?;
        let pid = child.id().ok_or_else(|| {
            KTError::ProcessStartFailed(anyhow::anyhow!("kernel process exited before start"))
        })?;
        log::info!(
            "[session {}] Started kernel process {} ({})",
            self.session_id,
            pid,
            program
        );

        self.capture_output_streams(&mut child);

        let exit_event = Arc::new(Event::new());
        let exited = Arc::new(AtomicBool::new(false));
        let (kill_tx, kill_rx) = async_channel::bounded::<()>(1);

        let handle = ProcessHandle {
            pid,
            exit_event: exit_event.clone(),
            exited: exited.clone(),
            kill_tx,
        };

        let session_id = self.session_id.clone();
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            let code = Self::run_child(&session_id, child, kill_rx).await;
            exited.store(true, Ordering::SeqCst);
            exit_event.notify(usize::MAX);
            if let Err(err) = event_tx.try_send(TransportEvent::Exited(code)) {
                log::trace!("[session {}] Dropping exit event: {}", session_id, err);
            }
        });

        Ok(handle)
    }

    /// Wait for the child to exit, killing it if a kill request arrives
    /// first. Returns the exit code.
    async fn run_child(
        session_id: &str,
        mut child: tokio::process::Child,
        kill_rx: async_channel::Receiver<()>,
    ) -> i32 {
        let status = tokio::select! {
            status = child.wait() => status,
            _ = kill_rx.recv() => {
                log::debug!("[session {}] Killing kernel process", session_id);
                if let Err(err) = child.kill().await {
                    log::warn!(
                        "[session {}] Failed to kill kernel process: {}",
                        session_id,
                        err
                    );
                }
                child.wait().await
            }
        };

        match status {
            Ok(status) => {
                let code = status.code().unwrap_or(-1);
                log::info!(
                    "[session {}] Kernel process exited with status: {}",
                    session_id,
                    status
                );
                code
            }
            Err(err) => {
                log::error!(
                    "[session {}] Failed to wait on kernel process: {}",
                    session_id,
                    err
                );
                -1
            }
        }
    }

    /// Capture stdout and stderr from a child process and forward them as
    /// transport events.
    fn capture_output_streams(&self, child: &mut tokio::process::Child) {
        if let Some(stdout) = child.stdout.take() {
            Self::stream_output(stdout, OutputStream::Stdout, self.event_tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            Self::stream_output(stderr, OutputStream::Stderr, self.event_tx.clone());
        }
    }

    /// Read lines from one of the child's standard streams and forward each
    /// as an output event.
    fn stream_output<T: AsyncRead + Unpin + Send + 'static>(
        stream: T,
        kind: OutputStream,
        event_tx: Sender<TransportEvent>,
    ) {
        tokio::spawn(async move {
            let mut reader = tokio::io::BufReader::new(Box::pin(stream));
            let mut buffer = String::new();
            loop {
                buffer.clear();
                match reader.read_line(&mut buffer).await {
                    Ok(0) => {
                        log::debug!("End of output stream (kind: {:?})", kind);
                        break;
                    }
                    Ok(_) => {
                        let event = TransportEvent::Output(kind, buffer.to_string());
                        if event_tx.try_send(event).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        log::error!("Failed to read from standard stream: {}", e);
                        break;
                    }
                }
            }
        });
    }
}
