//
// router_test.rs
//
// Copyright (C) 2025 ktransport contributors. All rights reserved.
//

//! Tests for the message router: execution serialization, the reply/idle
//! race, timeout synthesis, restart, and destroy semantics.

use ktcore::pending::RequestFlags;
use ktcore::outbound::SendOutcome;
use ktcore::router::Router;
use ktshared::jupyter_message::{JupyterChannel, JupyterMessage, JupyterMessageHeader};
use ktshared::kernel_event::{KernelStatus, TransportEvent};
use serde_json::json;

struct Fixture {
    router: Router,
    outbound_rx: async_channel::Receiver<JupyterMessage>,
    event_rx: async_channel::Receiver<TransportEvent>,
}

fn fixture() -> Fixture {
    let (outbound_tx, outbound_rx) = async_channel::unbounded();
    let (event_tx, event_rx) = async_channel::unbounded();
    Fixture {
        router: Router::new("session-1", "tester", outbound_tx, event_tx),
        outbound_rx,
        event_rx,
    }
}

fn execute_request(code: &str) -> JupyterMessage {
    JupyterMessage::request(
        "execute_request",
        JupyterChannel::Shell,
        json!({
            "code": code,
            "silent": false,
            "store_history": true,
            "user_expressions": {},
            "allow_stdin": true,
            "stop_on_error": true,
        }),
        "session-1",
        "tester",
    )
}

/// Build a kernel-side message parented to the given request header.
fn child_of(
    parent: &JupyterMessageHeader,
    msg_type: &str,
    channel: JupyterChannel,
    content: serde_json::Value,
) -> JupyterMessage {
    let mut message = JupyterMessage::request(msg_type, channel, content, "kernel", "kernel");
    message.parent_header = Some(parent.clone());
    message
}

fn idle_for(parent: &JupyterMessageHeader) -> JupyterMessage {
    child_of(
        parent,
        "status",
        JupyterChannel::IOPub,
        json!({ "execution_state": "idle" }),
    )
}

fn busy_for(parent: &JupyterMessageHeader) -> JupyterMessage {
    child_of(
        parent,
        "status",
        JupyterChannel::IOPub,
        json!({ "execution_state": "busy" }),
    )
}

fn reply_for(parent: &JupyterMessageHeader) -> JupyterMessage {
    child_of(
        parent,
        "execute_reply",
        JupyterChannel::Shell,
        json!({ "status": "ok", "execution_count": 1 }),
    )
}

fn drain_events(rx: &async_channel::Receiver<TransportEvent>) -> Vec<TransportEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[test]
fn executes_are_serialized_one_at_a_time() {
    let mut f = fixture();

    let r1 = execute_request("1");
    let r2 = execute_request("2");
    let r3 = execute_request("3");
    let h1 = r1.header.clone();

    let _rx1 = f.router.submit(r1, RequestFlags::default()).unwrap();
    let _rx2 = f.router.submit(r2.clone(), RequestFlags::default()).unwrap();
    let _rx3 = f.router.submit(r3, RequestFlags::default()).unwrap();

    // Only the first request reaches the wire
    let sent = f.outbound_rx.try_recv().unwrap();
    assert_eq!(sent.header.msg_id, h1.msg_id);
    assert!(f.outbound_rx.try_recv().is_err());

    // Finishing the first dispatches the second, and only the second
    f.router.handle_shell(reply_for(&h1));
    f.router.handle_iopub(idle_for(&h1));

    let sent = f.outbound_rx.try_recv().unwrap();
    assert_eq!(sent.header.msg_id, r2.header.msg_id);
    assert!(f.outbound_rx.try_recv().is_err());
}

#[test]
fn reply_before_idle_delivers_reply_exactly_once() {
    let mut f = fixture();

    let request = execute_request("1 + 1");
    let header = request.header.clone();
    let rx = f.router.submit(request, RequestFlags::default()).unwrap();
    f.outbound_rx.try_recv().unwrap();

    f.router.handle_iopub(busy_for(&header));
    assert_eq!(rx.try_recv().unwrap().header.msg_type, "status");

    // The reply arrives first; it is withheld until idle is seen
    f.router.handle_shell(reply_for(&header));
    assert!(rx.try_recv().is_err());

    f.router.handle_iopub(idle_for(&header));

    // The stream carries the withheld idle, then the terminal reply, then
    // closes
    let first = rx.try_recv().unwrap();
    assert_eq!(first.header.msg_type, "status");
    let second = rx.try_recv().unwrap();
    assert_eq!(second.header.msg_type, "execute_reply");
    assert!(rx.try_recv().is_err());

    // Late duplicates change nothing
    f.router.handle_shell(reply_for(&header));
    f.router.handle_iopub(idle_for(&header));

    let events = drain_events(&f.event_rx);
    assert!(events.contains(&TransportEvent::Status(KernelStatus::Busy)));
    assert!(events.contains(&TransportEvent::Status(KernelStatus::Idle)));
}

#[test]
fn idle_before_reply_delivers_reply_exactly_once() {
    let mut f = fixture();

    let request = execute_request("1 + 1");
    let header = request.header.clone();
    let rx = f.router.submit(request, RequestFlags::default()).unwrap();
    f.outbound_rx.try_recv().unwrap();

    // Idle arrives first; it is withheld so the consumer never observes
    // "idle" ahead of the reply content
    f.router.handle_iopub(idle_for(&header));
    assert!(rx.try_recv().is_err());
    assert!(drain_events(&f.event_rx)
        .iter()
        .all(|e| *e != TransportEvent::Status(KernelStatus::Idle)));

    f.router.handle_shell(reply_for(&header));

    let first = rx.try_recv().unwrap();
    assert_eq!(first.header.msg_type, "status");
    let second = rx.try_recv().unwrap();
    assert_eq!(second.header.msg_type, "execute_reply");
    assert!(rx.try_recv().is_err());

    let events = drain_events(&f.event_rx);
    assert!(events.contains(&TransportEvent::Status(KernelStatus::Idle)));
}

#[test]
fn iopub_output_is_delivered_to_the_owning_stream() {
    let mut f = fixture();

    let request = execute_request("print('hi')");
    let header = request.header.clone();
    let rx = f.router.submit(request, RequestFlags::default()).unwrap();
    f.outbound_rx.try_recv().unwrap();

    f.router.handle_iopub(child_of(
        &header,
        "stream",
        JupyterChannel::IOPub,
        json!({ "name": "stdout", "text": "hi\n" }),
    ));

    let message = rx.try_recv().unwrap();
    assert_eq!(message.header.msg_type, "stream");
    assert_eq!(message.content["text"], "hi\n");
}

#[test]
fn suppressed_requests_emit_no_status_events() {
    let mut f = fixture();

    let request = execute_request("watch_expr");
    let header = request.header.clone();
    let flags = RequestFlags {
        silent: false,
        suppress_status: true,
    };
    let rx = f.router.submit(request, flags).unwrap();
    f.outbound_rx.try_recv().unwrap();

    f.router.handle_iopub(busy_for(&header));
    f.router.handle_shell(reply_for(&header));
    f.router.handle_iopub(idle_for(&header));

    // The stream still sees everything
    assert_eq!(rx.try_recv().unwrap().header.msg_type, "status");
    assert_eq!(rx.try_recv().unwrap().header.msg_type, "status");
    assert_eq!(rx.try_recv().unwrap().header.msg_type, "execute_reply");

    // But no busy/idle leaks to the event stream
    assert!(drain_events(&f.event_rx)
        .iter()
        .all(|e| !matches!(e, TransportEvent::Status(_))));
}

#[test]
fn non_execute_requests_dispatch_immediately() {
    let mut f = fixture();

    // An execute occupies the kernel
    let execute = execute_request("long_running()");
    let _rx = f.router.submit(execute, RequestFlags::default()).unwrap();
    f.outbound_rx.try_recv().unwrap();

    // A completion request goes straight to the wire anyway
    let complete = JupyterMessage::request(
        "complete_request",
        JupyterChannel::Shell,
        json!({ "code": "pri", "cursor_pos": 3 }),
        "session-1",
        "tester",
    );
    let header = complete.header.clone();
    let rx = f.router.submit(complete, RequestFlags::default()).unwrap();
    let sent = f.outbound_rx.try_recv().unwrap();
    assert_eq!(sent.header.msg_id, header.msg_id);

    // Its shell reply is terminal
    f.router.handle_shell(child_of(
        &header,
        "complete_reply",
        JupyterChannel::Shell,
        json!({ "matches": ["print"] }),
    ));
    assert_eq!(rx.try_recv().unwrap().header.msg_type, "complete_reply");
    assert!(rx.try_recv().is_err());
}

#[test]
fn timed_out_requests_get_synthesized_errors_once() {
    let mut f = fixture();

    let request = execute_request("hangs_forever()");
    let rx = f.router.submit(request, RequestFlags::default()).unwrap();
    f.outbound_rx.try_recv().unwrap();

    // A zero-second budget expires everything immediately
    f.router.sweep(0);

    let first = rx.try_recv().unwrap();
    assert_eq!(first.channel, JupyterChannel::IOPub);
    assert_eq!(first.header.msg_type, "error");
    assert_eq!(first.content["ename"], "Timeout");

    let second = rx.try_recv().unwrap();
    assert_eq!(second.channel, JupyterChannel::Shell);
    assert_eq!(second.header.msg_type, "execute_reply");
    assert_eq!(second.content["status"], "error");
    assert!(rx.try_recv().is_err());

    assert_eq!(f.router.pending_count(), 0);

    // It cannot be double-expired
    f.router.sweep(0);
    assert_eq!(f.router.pending_count(), 0);
}

#[test]
fn failed_send_synthesizes_errors_and_advances_the_queue() {
    let mut f = fixture();

    let r1 = execute_request("1");
    let r2 = execute_request("2");
    let h1 = r1.header.clone();
    let id2 = r2.header.msg_id.clone();

    let rx1 = f.router.submit(r1, RequestFlags::default()).unwrap();
    let _rx2 = f.router.submit(r2, RequestFlags::default()).unwrap();
    f.outbound_rx.try_recv().unwrap();

    f.router.handle_send_outcome(SendOutcome::Failed(
        h1.msg_id.clone(),
        anyhow::anyhow!("socket closed"),
    ));

    // The failed request's stream completes with the synthesized pair
    assert_eq!(rx1.try_recv().unwrap().content["ename"], "SendError");
    assert_eq!(rx1.try_recv().unwrap().content["status"], "error");
    assert!(rx1.try_recv().is_err());

    // The queued request is dispatched in its place
    let sent = f.outbound_rx.try_recv().unwrap();
    assert_eq!(sent.header.msg_id, id2);
}

#[test]
fn destroy_is_idempotent_and_silences_late_frames() {
    let mut f = fixture();

    let request = execute_request("1 + 1");
    let header = request.header.clone();
    let rx = f.router.submit(request, RequestFlags::default()).unwrap();
    f.outbound_rx.try_recv().unwrap();

    assert!(f.router.destroy());
    assert!(!f.router.destroy());

    // The stream closed without a terminal reply
    assert!(rx.try_recv().is_err());

    // Frames still in transit are ignored, with no callback and no panic
    f.router.handle_shell(reply_for(&header));
    f.router.handle_iopub(idle_for(&header));
    assert!(rx.try_recv().is_err());
    assert_eq!(f.router.pending_count(), 0);

    // New requests are refused
    assert!(f
        .router
        .submit(execute_request("2"), RequestFlags::default())
        .is_err());
}

#[test]
fn restart_abandons_pending_requests_and_clears_the_queue() {
    let mut f = fixture();

    let r1 = execute_request("1");
    let r2 = execute_request("2");
    let h1 = r1.header.clone();

    let rx1 = f.router.submit(r1, RequestFlags::default()).unwrap();
    let rx2 = f.router.submit(r2, RequestFlags::default()).unwrap();
    f.outbound_rx.try_recv().unwrap();

    f.router.begin_restart();
    assert!(f.router.is_restarting());

    // Both streams close without any terminal reply
    assert!(rx1.try_recv().is_err());
    assert!(rx2.try_recv().is_err());

    // A reply for the abandoned request is dropped
    f.router.handle_shell(reply_for(&h1));
    assert_eq!(f.router.pending_count(), 0);

    f.router.finish_restart();
    assert!(!f.router.is_restarting());

    // A fresh execute is not blocked by a stale "current" request
    let r3 = execute_request("3");
    let id3 = r3.header.msg_id.clone();
    let _rx3 = f.router.submit(r3, RequestFlags::default()).unwrap();
    let sent = f.outbound_rx.try_recv().unwrap();
    assert_eq!(sent.header.msg_id, id3);

    let events = drain_events(&f.event_rx);
    assert!(events.contains(&TransportEvent::Status(KernelStatus::Restarting)));
}

#[test]
fn input_request_and_reply_round_trip() {
    let mut f = fixture();

    let request = execute_request("input('name? ')");
    let header = request.header.clone();
    let rx = f.router.submit(request, RequestFlags::default()).unwrap();
    f.outbound_rx.try_recv().unwrap();

    // The kernel asks for input, parented to the execute request
    let input_request = child_of(
        &header,
        "input_request",
        JupyterChannel::Stdin,
        json!({ "prompt": "name? ", "password": false }),
    );
    let input_header = input_request.header.clone();
    f.router.handle_stdin(input_request);

    // The prompt is delivered on the execute request's stream
    assert_eq!(rx.try_recv().unwrap().header.msg_type, "input_request");

    // The answer goes out on the stdin channel, parented to the prompt
    f.router.input_reply("Ada").unwrap();
    let sent = f.outbound_rx.try_recv().unwrap();
    assert_eq!(sent.channel, JupyterChannel::Stdin);
    assert_eq!(sent.header.msg_type, "input_reply");
    assert_eq!(sent.content["value"], "Ada");
    assert_eq!(
        sent.parent_header.as_ref().map(|h| h.msg_id.as_str()),
        Some(input_header.msg_id.as_str())
    );
}

#[test]
fn failed_kernel_info_send_yields_an_error_reply_on_shell() {
    let mut f = fixture();

    // A readiness probe: status events suppressed, reply awaited on shell
    let probe = JupyterMessage::request(
        "kernel_info_request",
        JupyterChannel::Shell,
        json!({}),
        "session-1",
        "tester",
    );
    let id = probe.header.msg_id.clone();
    let flags = RequestFlags {
        silent: false,
        suppress_status: true,
    };
    let rx = f.router.submit(probe, flags).unwrap();
    f.outbound_rx.try_recv().unwrap();

    f.router
        .handle_send_outcome(SendOutcome::Failed(id, anyhow::anyhow!("socket closed")));

    // The first message on the stream is the iopub-shaped error, not a
    // shell reply; anyone awaiting readiness must skip it
    let first = rx.try_recv().unwrap();
    assert_eq!(first.channel, JupyterChannel::IOPub);
    assert_eq!(first.header.msg_type, "error");

    // The terminal shell message is identifiable as a failure, never as a
    // healthy kernel_info answer
    let second = rx.try_recv().unwrap();
    assert_eq!(second.channel, JupyterChannel::Shell);
    assert_eq!(second.header.msg_type, "kernel_info_reply");
    assert_eq!(second.content["status"], "error");
    assert!(rx.try_recv().is_err());
}

#[test]
fn replacing_the_outbound_channel_redirects_dispatch() {
    let mut f = fixture();

    // The first request goes out on the original channel
    let r1 = execute_request("1");
    let h1 = r1.header.clone();
    let _rx1 = f.router.submit(r1, RequestFlags::default()).unwrap();
    f.outbound_rx.try_recv().unwrap();

    // Rewire the router, as a kernel relaunch does
    let (new_tx, new_rx) = async_channel::unbounded();
    f.router.set_outbound(new_tx);

    let r2 = execute_request("2");
    let id2 = r2.header.msg_id.clone();
    let _rx2 = f.router.submit(r2, RequestFlags::default()).unwrap();

    f.router.handle_shell(reply_for(&h1));
    f.router.handle_iopub(idle_for(&h1));

    // The queued request is dispatched on the new channel only
    assert!(f.outbound_rx.try_recv().is_err());
    let sent = new_rx.try_recv().unwrap();
    assert_eq!(sent.header.msg_id, id2);
    assert!(new_rx.try_recv().is_err());
}

#[test]
fn abort_queued_leaves_the_active_execution_running() {
    let mut f = fixture();

    let r1 = execute_request("running");
    let r2 = execute_request("queued");
    let h1 = r1.header.clone();

    let rx1 = f.router.submit(r1, RequestFlags::default()).unwrap();
    let rx2 = f.router.submit(r2, RequestFlags::default()).unwrap();
    f.outbound_rx.try_recv().unwrap();

    f.router.abort_queued();

    // The queued request's stream closes unresolved; the active one lives
    assert!(rx2.try_recv().is_err());
    assert_eq!(f.router.pending_count(), 1);

    // The active execution still completes normally
    f.router.handle_shell(reply_for(&h1));
    f.router.handle_iopub(idle_for(&h1));
    assert_eq!(rx1.try_recv().unwrap().header.msg_type, "status");
    assert_eq!(rx1.try_recv().unwrap().header.msg_type, "execute_reply");

    // And nothing queued gets dispatched afterwards
    assert!(f.outbound_rx.try_recv().is_err());
}
