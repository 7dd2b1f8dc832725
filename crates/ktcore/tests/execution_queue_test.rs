//
// execution_queue_test.rs
//
// Copyright (C) 2025 ktransport contributors. All rights reserved.
//

//! Unit tests for ExecutionQueue functionality

use ktcore::execution::ExecutionQueue;
use ktshared::jupyter_message::{JupyterChannel, JupyterMessage};
use serde_json::json;
use uuid::Uuid;

/// Helper function to create a test execute request
fn create_test_message(code: &str) -> JupyterMessage {
    let mut message = JupyterMessage::request(
        "execute_request",
        JupyterChannel::Shell,
        json!({
            "code": code,
            "silent": false,
            "store_history": true,
            "user_expressions": {},
            "allow_stdin": false,
            "stop_on_error": true
        }),
        "test-session",
        "tester",
    );
    // Distinct, collision-proof IDs for assertions
    message.header.msg_id = Uuid::new_v4().to_string();
    message
}

#[test]
fn test_execution_queue_basics() {
    let mut queue = ExecutionQueue::new();

    // Empty queue
    assert!(queue.active.is_none());
    assert_eq!(queue.pending.len(), 0);

    // First request executes immediately
    let msg1 = create_test_message("print('first')");
    let msg1_id = msg1.header.msg_id.clone();
    assert!(queue.process_request(msg1));
    assert_eq!(queue.active.as_deref(), Some(msg1_id.as_str()));
    assert!(queue.is_active(&msg1_id));
    assert_eq!(queue.pending.len(), 0);

    // Second request gets queued
    let msg2 = create_test_message("print('second')");
    let msg2_id = msg2.header.msg_id.clone();
    assert!(!queue.process_request(msg2));
    assert_eq!(queue.active.as_deref(), Some(msg1_id.as_str()));
    assert_eq!(queue.pending.len(), 1);
    assert_eq!(queue.pending[0].header.msg_id, msg2_id);
}

#[test]
fn test_execution_queue_next_and_clear() {
    let mut queue = ExecutionQueue::new();

    // Add requests
    let msg1 = create_test_message("print('first')");
    let msg2 = create_test_message("print('second')");
    let msg2_id = msg2.header.msg_id.clone();

    queue.process_request(msg1);
    queue.process_request(msg2);

    // Get next request
    let next = queue.next_request();
    assert!(next.is_some());
    assert_eq!(next.unwrap().header.msg_id, msg2_id);
    assert_eq!(queue.active.as_deref(), Some(msg2_id.as_str()));

    // Draining the queue releases "current"
    assert!(queue.next_request().is_none());
    assert!(queue.active.is_none());

    // Clear queue
    queue.process_request(create_test_message("print('again')"));
    queue.process_request(create_test_message("print('queued')"));
    queue.clear();
    assert!(queue.active.is_none());
    assert_eq!(queue.pending.len(), 0);
}

#[test]
fn test_execution_queue_remove_pending() {
    let mut queue = ExecutionQueue::new();

    let msg1 = create_test_message("print('active')");
    let msg2 = create_test_message("print('doomed')");
    let msg3 = create_test_message("print('survivor')");
    let msg2_id = msg2.header.msg_id.clone();
    let msg3_id = msg3.header.msg_id.clone();

    queue.process_request(msg1);
    queue.process_request(msg2);
    queue.process_request(msg3);

    // Removing a queued request preserves the order of the rest
    assert!(queue.remove_pending(&msg2_id));
    assert!(!queue.remove_pending(&msg2_id));
    assert_eq!(queue.pending.len(), 1);
    assert_eq!(queue.pending[0].header.msg_id, msg3_id);

    // The active request is untouched
    assert!(queue.active.is_some());
}

#[test]
fn test_execution_queue_drain_pending() {
    let mut queue = ExecutionQueue::new();

    let msg1 = create_test_message("print('active')");
    let msg1_id = msg1.header.msg_id.clone();
    queue.process_request(msg1);
    queue.process_request(create_test_message("print('q1')"));
    queue.process_request(create_test_message("print('q2')"));

    let drained = queue.drain_pending();
    assert_eq!(drained.len(), 2);
    assert_eq!(queue.pending.len(), 0);

    // The in-flight execution is left in place
    assert!(queue.is_active(&msg1_id));
}
