//
// outbound_queue_test.rs
//
// Copyright (C) 2025 ktransport contributors. All rights reserved.
//

//! Tests for the per-channel outbound queue: FIFO ordering, transient retry,
//! and fatal failure outcomes.

use ktcore::outbound::{MessageSink, OutboundQueue, OutboundRequest, SendFailure, SendOutcome};
use ktshared::jupyter_message::{JupyterChannel, JupyterMessage};
use serde_json::json;

/// The behaviors a scripted sink can play back, one per send attempt.
enum Step {
    Accept,
    Busy,
    Fail,
}

/// A message sink that follows a script and records what it was asked to
/// send.
struct ScriptedSink {
    script: Vec<Step>,
    attempts: usize,
    sent: Vec<String>,
}

impl ScriptedSink {
    fn new(script: Vec<Step>) -> Self {
        ScriptedSink {
            script,
            attempts: 0,
            sent: Vec::new(),
        }
    }
}

impl MessageSink for ScriptedSink {
    async fn send_message(&mut self, message: &JupyterMessage) -> Result<(), SendFailure> {
        let step = self.script.get(self.attempts).unwrap_or(&Step::Accept);
        self.attempts += 1;
        match step {
            Step::Accept => {
                self.sent.push(message.header.msg_id.clone());
                Ok(())
            }
            Step::Busy => Err(SendFailure::Transient),
            Step::Fail => Err(SendFailure::Fatal(anyhow::anyhow!("socket closed"))),
        }
    }
}

fn request(code: &str) -> OutboundRequest {
    OutboundRequest {
        message: JupyterMessage::request(
            "execute_request",
            JupyterChannel::Shell,
            json!({ "code": code }),
            "session-1",
            "tester",
        ),
    }
}

#[tokio::test]
async fn sends_are_fifo() {
    let mut queue = OutboundQueue::new(JupyterChannel::Shell);
    let r1 = request("1");
    let r2 = request("2");
    let r3 = request("3");
    let expected: Vec<String> = [&r1, &r2, &r3]
        .iter()
        .map(|r| r.message.header.msg_id.clone())
        .collect();

    queue.push(r1);
    queue.push(r2);
    queue.push(r3);

    let mut sink = ScriptedSink::new(vec![]);
    let outcomes = queue.process(&mut sink).await;

    assert_eq!(sink.sent, expected);
    assert_eq!(outcomes.len(), 3);
    assert!(queue.is_empty());
}

#[tokio::test]
async fn transient_failure_retries_the_same_message_first() {
    let mut queue = OutboundQueue::new(JupyterChannel::Shell);
    let r1 = request("1");
    let r2 = request("2");
    let expected: Vec<String> = [&r1, &r2]
        .iter()
        .map(|r| r.message.header.msg_id.clone())
        .collect();

    queue.push(r1);
    queue.push(r2);

    // First attempt reports busy; nothing is sent and the head keeps its
    // place in line
    let mut sink = ScriptedSink::new(vec![Step::Busy]);
    let outcomes = queue.process(&mut sink).await;
    assert!(outcomes.is_empty());
    assert_eq!(queue.len(), 2);
    assert!(sink.sent.is_empty());

    // The retry pass sends both, in the original order
    let outcomes = queue.process(&mut sink).await;
    assert_eq!(sink.sent, expected);
    assert!(matches!(&outcomes[0], SendOutcome::Sent(id) if *id == expected[0]));
    assert!(matches!(&outcomes[1], SendOutcome::Sent(id) if *id == expected[1]));
    assert!(queue.is_empty());
}

#[tokio::test]
async fn fatal_failure_discards_and_reports_the_message() {
    let mut queue = OutboundQueue::new(JupyterChannel::Shell);
    let r1 = request("1");
    let r2 = request("2");
    let failed_id = r1.message.header.msg_id.clone();
    let sent_id = r2.message.header.msg_id.clone();

    queue.push(r1);
    queue.push(r2);

    // The first send fails for good; the second still goes out
    let mut sink = ScriptedSink::new(vec![Step::Fail, Step::Accept]);
    let outcomes = queue.process(&mut sink).await;

    assert_eq!(outcomes.len(), 2);
    assert!(matches!(&outcomes[0], SendOutcome::Failed(id, _) if *id == failed_id));
    assert!(matches!(&outcomes[1], SendOutcome::Sent(id) if *id == sent_id));
    assert_eq!(sink.sent, vec![sent_id]);
    assert!(queue.is_empty());
}

#[tokio::test]
async fn clear_discards_queued_requests() {
    let mut queue = OutboundQueue::new(JupyterChannel::Shell);
    queue.push(request("1"));
    queue.push(request("2"));
    assert_eq!(queue.len(), 2);

    queue.clear();
    assert!(queue.is_empty());

    let mut sink = ScriptedSink::new(vec![]);
    let outcomes = queue.process(&mut sink).await;
    assert!(outcomes.is_empty());
    assert!(sink.sent.is_empty());
}
