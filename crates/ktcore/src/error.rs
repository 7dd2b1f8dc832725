//
// error.rs
//
// Copyright (C) 2025 ktransport contributors. All rights reserved.
//
//

use std::fmt;

use log::error;

/// Errors surfaced across the transport's public API.
///
/// Per-request failures (timeouts, send failures for a specific request) are
/// not represented here; those are resolved through the same result stream as
/// success so that callers never hang waiting on a reply.
#[derive(Debug)]
pub enum KTError {
    /// The kernel's sockets did not connect within the allotted time
    ConnectionTimeout(u64),

    /// The kernel's sockets could not be connected
    ConnectionFailed(anyhow::Error),

    /// The kernel process could not be started
    ProcessStartFailed(anyhow::Error),

    /// The kernel could not be interrupted
    InterruptFailed(anyhow::Error),

    /// Interrupting the kernel is not supported on this platform
    InterruptUnsupported(String),

    /// The kernel could not be restarted
    RestartFailed(anyhow::Error),

    /// The transport has been destroyed and can no longer be used
    TransportDestroyed,
}

impl fmt::Display for KTError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Error KT-{}: ", self.discriminant())?;
        match self {
            KTError::ConnectionTimeout(seconds) => {
                write!(f, "Kernel did not connect within {} seconds", seconds)
            }
            KTError::ConnectionFailed(err) => {
                write!(f, "Failed to connect to kernel sockets: {}", err)
            }
            KTError::ProcessStartFailed(err) => {
                write!(f, "Failed to start kernel process: {}", err)
            }
            KTError::InterruptFailed(err) => {
                write!(f, "Failed to interrupt kernel: {}", err)
            }
            KTError::InterruptUnsupported(platform) => {
                write!(
                    f,
                    "Signal-based interrupt is not supported on {}",
                    platform
                )
            }
            KTError::RestartFailed(err) => {
                write!(f, "Failed to restart kernel: {}", err)
            }
            KTError::TransportDestroyed => {
                write!(f, "The kernel transport has been destroyed")
            }
        }
    }
}

impl std::error::Error for KTError {}

impl KTError {
    #[allow(unsafe_code, trivial_casts)]
    fn discriminant(&self) -> u8 {
        unsafe { *(self as *const Self as *const u8) }
    }

    pub fn log(&self) {
        error!("{}", self.to_string());
    }
}
