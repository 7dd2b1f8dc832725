//
// kernel_event.rs
//
// Copyright (C) 2025 ktransport contributors. All rights reserved.
//
//

use std::fmt;

use serde::{Deserialize, Serialize};

/// A superset of Jupyter kernel statuses, covering the whole transport
/// lifecycle.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum KernelStatus {
    /// The transport is launching the kernel process and connecting sockets
    Loading,
    /// The kernel process is up but has not yet answered a request
    Starting,
    /// The kernel is idle
    Idle,
    /// The kernel is busy executing
    Busy,
    /// The kernel is being restarted
    Restarting,
    /// The kernel failed to connect within the allotted time
    Error,
    /// The kernel process has exited
    Exited,
}

impl fmt::Display for KernelStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            KernelStatus::Loading => "loading",
            KernelStatus::Starting => "starting",
            KernelStatus::Idle => "idle",
            KernelStatus::Busy => "busy",
            KernelStatus::Restarting => "restarting",
            KernelStatus::Error => "error",
            KernelStatus::Exited => "exited",
        };
        write!(f, "{}", name)
    }
}

/// The kind of standard stream a line of process output came from.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Events the transport emits about the kernel itself, as opposed to Jupyter
/// protocol traffic delivered to per-request result streams.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum TransportEvent {
    /// The kernel's externally visible status has changed
    Status(KernelStatus),

    /// The kernel has missed enough consecutive heartbeats to be considered
    /// unresponsive. Advisory only; the transport takes no action itself.
    HeartbeatLost,

    /// The kernel answered a heartbeat after having been considered
    /// unresponsive
    HeartbeatRestored,

    /// A line of output from the kernel process's standard streams
    Output(OutputStream, String),

    /// The kernel process exited with the given code
    Exited(i32),
}
