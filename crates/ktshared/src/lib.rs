//
// lib.rs
//
// Copyright (C) 2025 ktransport contributors. All rights reserved.
//
//

//! Shared types for the ktransport kernel transport and its consumers.

/// Jupyter message types
pub mod jupyter_message;

/// Kernel status and transport event types
pub mod kernel_event;
