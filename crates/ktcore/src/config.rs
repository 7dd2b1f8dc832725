//
// config.rs
//
// Copyright (C) 2025 ktransport contributors. All rights reserved.
//
//

use serde::{Deserialize, Serialize};

/// Tunable parameters for one kernel transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// The address the kernel's sockets bind to
    pub ip: String,

    /// The username placed in outbound message headers
    pub username: String,

    /// Seconds to wait for the kernel's sockets to connect and the kernel to
    /// answer its first kernel_info_request before startup fails
    pub connection_timeout_secs: u64,

    /// Seconds a request may wait for its reply before the sweep fails it
    pub request_timeout_secs: u64,

    /// Seconds between timeout sweeps of the pending request map
    pub sweep_interval_secs: u64,

    /// Seconds between heartbeat echoes
    pub heartbeat_interval_secs: u64,

    /// Seconds to wait for a single heartbeat echo before counting a miss
    pub heartbeat_wait_secs: u64,

    /// Consecutive missed heartbeats before the kernel is reported
    /// unresponsive
    pub heartbeat_misses: u32,

    /// Code to run silently when the kernel starts, and again after each
    /// restart
    pub startup_code: Vec<String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            ip: "127.0.0.1".to_string(),
            username: "kernel".to_string(),
            connection_timeout_secs: 30,
            request_timeout_secs: 120,
            sweep_interval_secs: 10,
            heartbeat_interval_secs: 2,
            heartbeat_wait_secs: 5,
            heartbeat_misses: 3,
            startup_code: Vec::new(),
        }
    }
}
