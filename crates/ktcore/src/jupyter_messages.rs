//
// jupyter_messages.rs
//
// Copyright (C) 2025 ktransport contributors. All rights reserved.
//
//

//! Helpers for interpreting and synthesizing Jupyter protocol messages.

use ktshared::jupyter_message::{JupyterChannel, JupyterMessage, JupyterMessageHeader};
use serde::{Deserialize, Serialize};

/// The execution states a kernel reports in iopub `status` broadcasts.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionState {
    Starting,
    Busy,
    Idle,
}

/// Extract the execution state from an iopub `status` message, if the message
/// is one.
pub fn execution_state(message: &JupyterMessage) -> Option<ExecutionState> {
    if message.header.msg_type != "status" {
        return None;
    }
    let state = message.content.get("execution_state")?;
    serde_json::from_value(state.clone()).ok()
}

/// Derive the reply type for a request type: `execute_request` becomes
/// `execute_reply`, and so on. Returns the input unchanged if it does not
/// follow the `_request` convention.
pub fn reply_type_for(request_type: &str) -> String {
    match request_type.strip_suffix("_request") {
        Some(base) => format!("{}_reply", base),
        None => request_type.to_string(),
    }
}

/// Build the standard Jupyter error payload.
fn error_content(ename: &str, evalue: &str) -> serde_json::Value {
    serde_json::json!({
        "ename": ename,
        "evalue": evalue,
        "traceback": [],
    })
}

/// Synthesize a shell-channel error reply for a request that cannot be
/// answered by the kernel (send failure, timeout). Shaped exactly like a
/// kernel-produced error reply so consumers need no special handling.
pub fn synthetic_error_reply(
    request: &JupyterMessageHeader,
    ename: &str,
    evalue: &str,
    username: &str,
) -> JupyterMessage {
    let mut content = error_content(ename, evalue);
    if let Some(map) = content.as_object_mut() {
        map.insert("status".to_string(), serde_json::json!("error"));
    }
    JupyterMessage {
        idents: Vec::new(),
        header: JupyterMessageHeader::new(
            &reply_type_for(&request.msg_type),
            &request.session,
            username,
        ),
        parent_header: Some(request.clone()),
        channel: JupyterChannel::Shell,
        content,
        metadata: serde_json::json!({}),
        buffers: Vec::new(),
    }
}

/// Synthesize an iopub `error` broadcast parented to the given request,
/// delivered ahead of a synthesized error reply so the result stream carries
/// a visible error before it terminates.
pub fn synthetic_iopub_error(
    request: &JupyterMessageHeader,
    ename: &str,
    evalue: &str,
    username: &str,
) -> JupyterMessage {
    JupyterMessage {
        idents: Vec::new(),
        header: JupyterMessageHeader::new("error", &request.session, username),
        parent_header: Some(request.clone()),
        channel: JupyterChannel::IOPub,
        content: error_content(ename, evalue),
        metadata: serde_json::json!({}),
        buffers: Vec::new(),
    }
}
