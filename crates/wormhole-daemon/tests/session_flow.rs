//! Session lifecycle, state machine, and permission gating, driven through
//! the registry with an in-memory driver.

mod common;

use std::sync::atomic::Ordering;

use common::{init_event, recv_frame, result_event, test_stack};
use serde_json::json;
use wormhole_daemon::driver::{DriverEvent, PermissionVerdict};
use wormhole_shared::protocol::{
    ErrorCode, PermissionDecision, ServerMessage, SessionState, SubscribeTarget,
};

#[tokio::test]
async fn events_are_sequenced_and_fanned_out() {
    let stack = test_stack(100);
    let mut client = stack.hub.register("c1", "phone-a");
    stack
        .hub
        .subscribe("c1", &SubscribeTarget::Wildcard("*".into()))
        .unwrap();

    let session = stack
        .registry
        .open(Some("demo".into()), "/tmp/wormhole-demo", Default::default())
        .await
        .unwrap();
    let handle = stack.factory.handle(0);

    handle
        .events
        .send(DriverEvent::Message(init_event("drv-1")))
        .await
        .unwrap();
    handle
        .events
        .send(DriverEvent::Message(json!({"type": "assistant", "n": 2})))
        .await
        .unwrap();

    for expected in 1..=2u64 {
        match recv_frame(&mut client.frames).await {
            ServerMessage::Event(e) => {
                assert_eq!(e.session, "demo");
                assert_eq!(e.sequence, expected);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }
    assert_eq!(session.driver_session_id().as_deref(), Some("drv-1"));
    assert_eq!(session.ring_range(), Some((1, 2)));
}

#[tokio::test]
async fn result_returns_to_idle_and_accumulates_cost() {
    let stack = test_stack(100);
    let mut client = stack.hub.register("c1", "phone-a");
    stack
        .hub
        .subscribe("c1", &SubscribeTarget::Wildcard("*".into()))
        .unwrap();

    let session = stack
        .registry
        .open(Some("demo".into()), "/tmp/wormhole-demo", Default::default())
        .await
        .unwrap();
    let handle = stack.factory.handle(0);

    session.query("do a thing").await.unwrap();
    assert_eq!(session.state(), SessionState::Working);
    assert_eq!(handle.queries.lock().unwrap().as_slice(), ["do a thing"]);

    handle
        .events
        .send(DriverEvent::Message(result_event(0.12)))
        .await
        .unwrap();
    recv_frame(&mut client.frames).await;
    assert_eq!(session.state(), SessionState::Idle);
    assert!((session.cost_usd() - 0.12).abs() < 1e-9);

    session.query("again").await.unwrap();
    handle
        .events
        .send(DriverEvent::Message(result_event(0.05)))
        .await
        .unwrap();
    recv_frame(&mut client.frames).await;
    assert!((session.cost_usd() - 0.17).abs() < 1e-9);
}

#[tokio::test]
async fn permission_allow_roundtrip() {
    let stack = test_stack(100);
    let mut client = stack.hub.register("c1", "phone-a");
    stack
        .hub
        .subscribe("c1", &SubscribeTarget::Wildcard("*".into()))
        .unwrap();

    let session = stack
        .registry
        .open(Some("demo".into()), "/tmp/wormhole-demo", Default::default())
        .await
        .unwrap();
    session.query("write the file").await.unwrap();
    let handle = stack.factory.handle(0);

    let tool_input = json!({"file_path": "a.txt", "content": "x"});
    let verdict = handle.gate.request("Write", tool_input.clone());
    assert_eq!(session.state(), SessionState::AwaitingApproval);

    let request_id = match recv_frame(&mut client.frames).await {
        ServerMessage::PermissionRequest {
            request_id,
            tool_name,
            tool_input: seen_input,
            session_name,
        } => {
            assert_eq!(tool_name, "Write");
            assert_eq!(seen_input, tool_input);
            assert_eq!(session_name, "demo");
            request_id
        }
        other => panic!("unexpected frame: {other:?}"),
    };

    stack
        .broker
        .resolve(&request_id, PermissionDecision::Allow)
        .unwrap();
    let verdict = verdict.await;
    assert_eq!(
        verdict,
        PermissionVerdict::Allow {
            updated_input: tool_input
        }
    );
    assert_eq!(session.state(), SessionState::Working);
    assert!(stack.broker.pending_for("demo").is_empty());
}

#[tokio::test]
async fn permission_deny_roundtrip() {
    let stack = test_stack(100);
    let mut client = stack.hub.register("c1", "phone-a");
    stack
        .hub
        .subscribe("c1", &SubscribeTarget::Wildcard("*".into()))
        .unwrap();

    let session = stack
        .registry
        .open(Some("demo".into()), "/tmp/wormhole-demo", Default::default())
        .await
        .unwrap();
    session.query("run the command").await.unwrap();
    let handle = stack.factory.handle(0);

    let verdict = handle.gate.request("Bash", json!({"command": "rm -rf /"}));
    let request_id = match recv_frame(&mut client.frames).await {
        ServerMessage::PermissionRequest { request_id, .. } => request_id,
        other => panic!("unexpected frame: {other:?}"),
    };

    stack
        .broker
        .resolve(&request_id, PermissionDecision::Deny)
        .unwrap();
    assert_eq!(
        verdict.await,
        PermissionVerdict::Deny {
            message: "User denied".into(),
            interrupt: false,
        }
    );
    assert_eq!(session.state(), SessionState::Working);
}

#[tokio::test]
async fn last_resolution_restores_working_only_when_no_pending_remain() {
    let stack = test_stack(100);
    let session = stack
        .registry
        .open(Some("demo".into()), "/tmp/wormhole-demo", Default::default())
        .await
        .unwrap();
    session.query("multi tool turn").await.unwrap();
    let handle = stack.factory.handle(0);

    let first = handle.gate.request("Write", json!({"file_path": "a"}));
    let second = handle.gate.request("Write", json!({"file_path": "b"}));
    let pending = stack.broker.pending_for("demo");
    assert_eq!(pending.len(), 2);

    stack
        .broker
        .resolve(&pending[0].request_id, PermissionDecision::Allow)
        .unwrap();
    first.await;
    // One pending left: still awaiting approval.
    assert_eq!(session.state(), SessionState::AwaitingApproval);

    stack
        .broker
        .resolve(&pending[1].request_id, PermissionDecision::Allow)
        .unwrap();
    second.await;
    assert_eq!(session.state(), SessionState::Working);
}

#[tokio::test]
async fn driver_failure_errors_the_session() {
    let stack = test_stack(100);
    let mut client = stack.hub.register("c1", "phone-a");
    stack
        .hub
        .subscribe("c1", &SubscribeTarget::Wildcard("*".into()))
        .unwrap();

    let session = stack
        .registry
        .open(Some("demo".into()), "/tmp/wormhole-demo", Default::default())
        .await
        .unwrap();
    session.query("work").await.unwrap();
    let handle = stack.factory.handle(0);

    // A pending permission is outstanding when the driver dies.
    let verdict = handle.gate.request("Write", json!({}));
    recv_frame(&mut client.frames).await;

    handle
        .events
        .send(DriverEvent::Fatal("process exited".into()))
        .await
        .unwrap();

    // The failure is surfaced both as a sequenced event and an error frame.
    match recv_frame(&mut client.frames).await {
        ServerMessage::Event(e) => {
            assert_eq!(e.message["type"], "error");
            assert!(e.sequence >= 1);
        }
        other => panic!("unexpected frame: {other:?}"),
    }
    match recv_frame(&mut client.frames).await {
        ServerMessage::Error {
            code, session: s, ..
        } => {
            assert_eq!(code, ErrorCode::DriverError);
            assert_eq!(s.as_deref(), Some("demo"));
        }
        other => panic!("unexpected frame: {other:?}"),
    }

    assert_eq!(session.state(), SessionState::Error);
    assert_eq!(
        verdict.await,
        PermissionVerdict::Deny {
            message: "User denied".into(),
            interrupt: false,
        }
    );

    // The session stays listed but rejects further input.
    assert!(stack.registry.get("demo").is_some());
    let err = session.query("more").await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::DriverError);
}

#[tokio::test]
async fn interrupt_in_idle_is_a_no_op() {
    let stack = test_stack(100);
    let mut client = stack.hub.register("c1", "phone-a");
    stack
        .hub
        .subscribe("c1", &SubscribeTarget::Wildcard("*".into()))
        .unwrap();

    let session = stack
        .registry
        .open(Some("demo".into()), "/tmp/wormhole-demo", Default::default())
        .await
        .unwrap();
    let handle = stack.factory.handle(0);

    assert_eq!(session.state(), SessionState::Idle);
    session.interrupt().await.unwrap();
    assert_eq!(session.state(), SessionState::Idle);
    assert_eq!(handle.interrupts.load(Ordering::SeqCst), 1);
    // The daemon itself emitted nothing.
    assert!(client.frames.try_recv().is_err());
}

#[tokio::test]
async fn close_denies_pending_and_frees_both_keys() {
    let stack = test_stack(100);
    let session = stack
        .registry
        .open(Some("demo".into()), "/tmp/wormhole-demo", Default::default())
        .await
        .unwrap();
    session.query("work").await.unwrap();
    let handle = stack.factory.handle(0);

    let verdict = handle.gate.request("Write", json!({}));
    let request_id = stack.broker.pending_for("demo")[0].request_id.clone();

    stack.registry.close("demo").await.unwrap();
    assert!(handle.closed.load(Ordering::SeqCst));
    assert_eq!(
        verdict.await,
        PermissionVerdict::Deny {
            message: "User denied".into(),
            interrupt: false,
        }
    );
    // A late response for the dead request is an error.
    assert!(stack
        .broker
        .resolve(&request_id, PermissionDecision::Allow)
        .is_err());

    // Both keys are free again.
    assert!(stack.registry.get("demo").is_none());
    stack
        .registry
        .open(Some("demo".into()), "/tmp/wormhole-demo", Default::default())
        .await
        .unwrap();
}

#[tokio::test]
async fn open_conflicts_and_failed_starts_leave_no_trace() {
    let stack = test_stack(100);
    stack
        .registry
        .open(Some("s1".into()), "/p", Default::default())
        .await
        .unwrap();

    // Same directory, different name.
    let err = stack
        .registry
        .open(Some("s2".into()), "/p", Default::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::SessionExists);
    assert_eq!(
        err.to_string(),
        "A session already exists in this directory: s1"
    );

    // Same name, different directory.
    let err = stack
        .registry
        .open(Some("s1".into()), "/q", Default::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::SessionExists);

    // A conflicting open never started a driver.
    assert_eq!(stack.factory.started(), 1);

    // A failed driver start releases the reserved slots.
    stack
        .factory
        .fail_next_start
        .store(true, Ordering::SeqCst);
    let err = stack
        .registry
        .open(Some("s3".into()), "/r", Default::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::DriverError);
    assert!(stack.registry.get("s3").is_none());
    stack
        .registry
        .open(Some("s3".into()), "/r", Default::default())
        .await
        .unwrap();
}

#[tokio::test]
async fn registry_indexes_stay_consistent() {
    let stack = test_stack(100);
    stack
        .registry
        .open(Some("a".into()), "/dir-a", Default::default())
        .await
        .unwrap();
    stack
        .registry
        .open(Some("b".into()), "/dir-b", Default::default())
        .await
        .unwrap();

    for session in stack.registry.list() {
        let by_name = stack.registry.get(&session.name).unwrap();
        assert_eq!(by_name.directory, session.directory);
    }

    stack.registry.close("a").await.unwrap();
    assert_eq!(stack.registry.count(), 1);
    assert!(stack.registry.get("a").is_none());
}
