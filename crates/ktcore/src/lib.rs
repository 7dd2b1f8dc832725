//
// lib.rs
//
// Copyright (C) 2025 ktransport contributors. All rights reserved.
//
//

//! A client-side transport for Jupyter kernels.
//!
//! The transport launches a kernel process from a kernel spec, connects the
//! four Jupyter sockets (shell, iopub, stdin, heartbeat), and multiplexes the
//! asynchronous, unordered wire traffic into deterministic per-request result
//! streams. Consumers call [`kernel_transport::KernelTransport::execute`] and
//! friends and receive a finite stream of messages per request, terminated
//! by the shell-channel reply.

pub mod config;
pub mod connection;
pub mod connection_file;
pub mod error;
pub mod execution;
pub mod handler;
pub mod heartbeat;
pub mod jupyter_messages;
pub mod kernel_transport;
pub mod launch;
pub mod outbound;
pub mod pending;
pub mod process;
pub mod registry;
pub mod router;
pub mod socket;
pub mod wire_message;

pub use config::TransportConfig;
pub use error::KTError;
pub use kernel_transport::KernelTransport;
pub use launch::KernelLaunchSpec;
pub use registry::KernelRegistry;
