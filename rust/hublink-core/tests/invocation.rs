//! Invocation semantics: unary calls, streaming results, cancellation, and
//! dispatch of calls arriving from the peer.

mod common;

use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::time::timeout;

use common::{LONG, SHORT, connection, connection_with, started, test_config};
use hublink_core::{ConnectionState, DispatchMap, HubError, Message};

#[tokio::test]
async fn unary_invoke_resolves_with_the_completion_result() {
    let (connection, mut peers) = connection(test_config());
    let peer = started(&connection, &mut peers).await;

    let invoke = {
        let connection = connection.clone();
        tokio::spawn(async move { connection.invoke("Foo", vec![json!("hi")]).await })
    };

    let invocation_id = match peer.recv_non_ping().await {
        Message::Invocation {
            invocation_id: Some(id),
            target,
            arguments,
            ..
        } => {
            assert_eq!(target, "Foo");
            assert_eq!(arguments, vec![json!("hi")]);
            id
        }
        other => panic!("expected invocation, got {other:?}"),
    };

    peer.send_message(&Message::Completion {
        invocation_id,
        result: Some(json!(42)),
        error: None,
    })
    .await;

    assert_eq!(invoke.await.unwrap().unwrap(), json!(42));
}

#[tokio::test]
async fn completion_error_surfaces_as_server_error() {
    let (connection, mut peers) = connection(test_config());
    let peer = started(&connection, &mut peers).await;

    let invoke = {
        let connection = connection.clone();
        tokio::spawn(async move { connection.invoke("Foo", vec![]).await })
    };
    let invocation_id = match peer.recv_non_ping().await {
        Message::Invocation {
            invocation_id: Some(id),
            ..
        } => id,
        other => panic!("expected invocation, got {other:?}"),
    };
    peer.send_message(&Message::Completion {
        invocation_id,
        result: None,
        error: Some("boom".into()),
    })
    .await;

    assert_eq!(
        invoke.await.unwrap().unwrap_err(),
        HubError::Server("boom".into())
    );
}

#[tokio::test]
async fn void_completion_resolves_to_null() {
    let (connection, mut peers) = connection(test_config());
    let peer = started(&connection, &mut peers).await;

    let invoke = {
        let connection = connection.clone();
        tokio::spawn(async move { connection.invoke("Fire", vec![]).await })
    };
    let invocation_id = match peer.recv_non_ping().await {
        Message::Invocation {
            invocation_id: Some(id),
            ..
        } => id,
        other => panic!("expected invocation, got {other:?}"),
    };
    peer.send_message(&Message::Completion {
        invocation_id,
        result: None,
        error: None,
    })
    .await;

    assert_eq!(invoke.await.unwrap().unwrap(), Value::Null);
}

#[tokio::test]
async fn send_carries_no_invocation_id() {
    let (connection, mut peers) = connection(test_config());
    let peer = started(&connection, &mut peers).await;

    connection.send("Notify", vec![json!(1)]).await.unwrap();

    match peer.recv_non_ping().await {
        Message::Invocation {
            invocation_id: None,
            target,
            ..
        } => assert_eq!(target, "Notify"),
        other => panic!("expected fire-and-forget invocation, got {other:?}"),
    }
}

#[tokio::test]
async fn stream_delivers_items_then_terminal_error() {
    let (connection, mut peers) = connection(test_config());
    let peer = started(&connection, &mut peers).await;

    let mut call = connection.stream("Counter", vec![json!(3)]).await.unwrap();

    let invocation_id = match peer.recv_non_ping().await {
        Message::StreamInvocation {
            invocation_id,
            target,
            ..
        } => {
            assert_eq!(target, "Counter");
            invocation_id
        }
        other => panic!("expected stream invocation, got {other:?}"),
    };

    for n in 0..3 {
        peer.send_message(&Message::StreamItem {
            invocation_id: invocation_id.clone(),
            item: json!(n),
        })
        .await;
    }
    peer.send_message(&Message::Completion {
        invocation_id,
        result: None,
        error: Some("boom".into()),
    })
    .await;

    // Exactly three items, then the terminal error, then nothing.
    for n in 0..3 {
        assert_eq!(call.next_item().await.unwrap().unwrap(), json!(n));
    }
    assert_eq!(
        call.next_item().await.unwrap().unwrap_err(),
        HubError::Server("boom".into())
    );
    assert!(call.next_item().await.is_none());
}

#[tokio::test]
async fn stream_ends_cleanly_on_void_completion() {
    let (connection, mut peers) = connection(test_config());
    let peer = started(&connection, &mut peers).await;

    let mut call = connection.stream("Counter", vec![]).await.unwrap();
    let invocation_id = match peer.recv_non_ping().await {
        Message::StreamInvocation { invocation_id, .. } => invocation_id,
        other => panic!("expected stream invocation, got {other:?}"),
    };

    peer.send_message(&Message::StreamItem {
        invocation_id: invocation_id.clone(),
        item: json!("only"),
    })
    .await;
    peer.send_message(&Message::Completion {
        invocation_id,
        result: None,
        error: None,
    })
    .await;

    assert_eq!(call.next_item().await.unwrap().unwrap(), json!("only"));
    assert!(call.next_item().await.is_none());
}

#[tokio::test]
async fn cancel_emits_cancel_invocation_and_suppresses_items() {
    let (connection, mut peers) = connection(test_config());
    let peer = started(&connection, &mut peers).await;

    let mut call = connection.stream("Feed", vec![]).await.unwrap();
    let invocation_id = match peer.recv_non_ping().await {
        Message::StreamInvocation { invocation_id, .. } => invocation_id,
        other => panic!("expected stream invocation, got {other:?}"),
    };

    peer.send_message(&Message::StreamItem {
        invocation_id: invocation_id.clone(),
        item: json!(1),
    })
    .await;
    assert_eq!(call.next_item().await.unwrap().unwrap(), json!(1));

    call.cancel().await.unwrap();
    match peer.recv_non_ping().await {
        Message::CancelInvocation {
            invocation_id: cancelled,
        } => assert_eq!(cancelled, invocation_id),
        other => panic!("expected cancellation, got {other:?}"),
    }

    // Items between our cancel and the remote's completion are dropped.
    peer.send_message(&Message::StreamItem {
        invocation_id: invocation_id.clone(),
        item: json!(2),
    })
    .await;
    peer.send_message(&Message::Completion {
        invocation_id,
        result: None,
        error: None,
    })
    .await;

    assert!(call.next_item().await.is_none());
}

#[tokio::test]
async fn keepalive_pings_flow_while_connected() {
    let config = hublink_core::ConnectionConfig {
        keep_alive_interval: Duration::from_millis(50),
        ..test_config()
    };
    let (connection, mut peers) = connection(config);
    let peer = started(&connection, &mut peers).await;

    match timeout(LONG, peer.recv_message()).await.unwrap() {
        Message::Ping => {}
        other => panic!("expected keepalive ping, got {other:?}"),
    }
}

#[tokio::test]
async fn incoming_invocation_is_dispatched_and_completed() {
    let dispatch = DispatchMap::new().handler("Add", |args: Vec<Value>| async move {
        let sum: i64 = args.iter().filter_map(Value::as_i64).sum();
        Ok(json!(sum))
    });
    let (connection, mut peers) = connection_with(test_config(), dispatch);
    let peer = started(&connection, &mut peers).await;

    peer.send_message(&Message::Invocation {
        invocation_id: Some("srv-1".into()),
        target: "Add".into(),
        arguments: vec![json!(2), json!(3)],
        stream_ids: vec![],
    })
    .await;

    match peer.recv_non_ping().await {
        Message::Completion {
            invocation_id,
            result: Some(result),
            error: None,
        } => {
            assert_eq!(invocation_id, "srv-1");
            assert_eq!(result, json!(5));
        }
        other => panic!("expected completion, got {other:?}"),
    }
}

#[tokio::test]
async fn incoming_invocation_for_unknown_target_errors() {
    let (connection, mut peers) = connection(test_config());
    let peer = started(&connection, &mut peers).await;

    peer.send_message(&Message::Invocation {
        invocation_id: Some("srv-2".into()),
        target: "Missing".into(),
        arguments: vec![],
        stream_ids: vec![],
    })
    .await;

    match peer.recv_non_ping().await {
        Message::Completion {
            invocation_id,
            result: None,
            error: Some(error),
        } => {
            assert_eq!(invocation_id, "srv-2");
            assert!(error.contains("unknown target"), "error was: {error}");
        }
        other => panic!("expected error completion, got {other:?}"),
    }
}

#[tokio::test]
async fn incoming_stream_invocation_streams_items_back() {
    let dispatch = DispatchMap::new().stream_handler("Counter", |args: Vec<Value>| {
        let count = args.first().and_then(Value::as_u64).unwrap_or(0);
        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(async move {
            for n in 0..count {
                if tx.send(Ok(json!(n))).await.is_err() {
                    return;
                }
            }
        });
        rx
    });
    let (connection, mut peers) = connection_with(test_config(), dispatch);
    let peer = started(&connection, &mut peers).await;

    peer.send_message(&Message::StreamInvocation {
        invocation_id: "srv-3".into(),
        target: "Counter".into(),
        arguments: vec![json!(3)],
        stream_ids: vec![],
    })
    .await;

    for n in 0..3 {
        match peer.recv_non_ping().await {
            Message::StreamItem {
                invocation_id,
                item,
            } => {
                assert_eq!(invocation_id, "srv-3");
                assert_eq!(item, json!(n));
            }
            other => panic!("expected stream item, got {other:?}"),
        }
    }
    match peer.recv_non_ping().await {
        Message::Completion {
            invocation_id,
            error: None,
            ..
        } => assert_eq!(invocation_id, "srv-3"),
        other => panic!("expected completion, got {other:?}"),
    }
}

#[tokio::test]
async fn incoming_cancel_stops_an_outbound_stream() {
    let dispatch = DispatchMap::new().stream_handler("Ticks", |_args| {
        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(async move {
            let mut n = 0u64;
            loop {
                if tx.send(Ok(json!(n))).await.is_err() {
                    return;
                }
                n += 1;
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        });
        rx
    });
    let (connection, mut peers) = connection_with(test_config(), dispatch);
    let peer = started(&connection, &mut peers).await;

    peer.send_message(&Message::StreamInvocation {
        invocation_id: "srv-4".into(),
        target: "Ticks".into(),
        arguments: vec![],
        stream_ids: vec![],
    })
    .await;

    // Let a few ticks through, then cancel.
    let first = peer.recv_non_ping().await;
    assert!(matches!(first, Message::StreamItem { .. }));
    peer.send_message(&Message::CancelInvocation {
        invocation_id: "srv-4".into(),
    })
    .await;

    // Items may still be in flight, but a completion must arrive and close
    // the stream out.
    let completion = timeout(LONG, async {
        loop {
            match peer.recv_non_ping().await {
                Message::StreamItem { .. } => continue,
                other => break other,
            }
        }
    })
    .await
    .expect("no completion after cancel");
    match completion {
        Message::Completion { invocation_id, .. } => assert_eq!(invocation_id, "srv-4"),
        other => panic!("expected completion, got {other:?}"),
    }
}

#[tokio::test]
async fn handler_panic_becomes_an_error_completion() {
    let dispatch = DispatchMap::new().handler("Explode", |_args: Vec<Value>| async move {
        panic!("kaboom");
        #[allow(unreachable_code)]
        Ok(Value::Null)
    });
    let (connection, mut peers) = connection_with(test_config(), dispatch);
    let peer = started(&connection, &mut peers).await;

    peer.send_message(&Message::Invocation {
        invocation_id: Some("srv-5".into()),
        target: "Explode".into(),
        arguments: vec![],
        stream_ids: vec![],
    })
    .await;

    match peer.recv_non_ping().await {
        Message::Completion {
            invocation_id,
            error: Some(error),
            ..
        } => {
            assert_eq!(invocation_id, "srv-5");
            assert!(error.contains("panicked"), "error was: {error}");
        }
        other => panic!("expected error completion, got {other:?}"),
    }
}

#[tokio::test]
async fn malformed_frame_tears_the_channel_down() {
    let (connection, mut peers) = connection(test_config());
    let peer = started(&connection, &mut peers).await;

    let invoke = {
        let connection = connection.clone();
        tokio::spawn(async move { connection.invoke("Foo", vec![]).await })
    };
    let _invocation = peer.recv_non_ping().await;

    peer.send_raw(b"this is not a protocol frame").await;

    let err = invoke.await.unwrap().unwrap_err();
    assert!(matches!(err, HubError::ConnectionLost { .. }));

    let mut state = connection.subscribe_state();
    timeout(LONG, state.wait_for(|s| *s == ConnectionState::Disconnected))
        .await
        .expect("protocol violation never disconnected")
        .unwrap();
}

#[tokio::test]
async fn messages_coalesced_behind_the_handshake_are_processed() {
    use hublink_core::{HandshakeResponse, RECORD_SEPARATOR, encode_handshake_response};

    let (connection, mut peers) = connection(test_config());

    let start = {
        let connection = connection.clone();
        tokio::spawn(async move { connection.start().await })
    };
    let peer = peers.recv().await.unwrap();
    let _request = peer.recv_handshake().await;

    // Response and a Close coalesced into a single frame.
    let mut frame = encode_handshake_response(&HandshakeResponse::ok()).to_vec();
    frame.extend_from_slice(br#"{"type":7,"error":"went away"}"#);
    frame.push(RECORD_SEPARATOR);
    peer.send_raw(&frame).await;

    start.await.unwrap().unwrap();

    let mut state = connection.subscribe_state();
    timeout(LONG, state.wait_for(|s| *s == ConnectionState::Disconnected))
        .await
        .expect("coalesced close never processed")
        .unwrap();
}

#[tokio::test]
async fn invocation_ids_are_unique_across_concurrent_calls() {
    let (connection, mut peers) = connection(test_config());
    let peer = started(&connection, &mut peers).await;

    let mut handles = Vec::new();
    for _ in 0..4 {
        let connection = connection.clone();
        handles.push(tokio::spawn(
            async move { connection.invoke("Foo", vec![]).await },
        ));
    }

    let mut ids = Vec::new();
    for _ in 0..4 {
        match peer.recv_non_ping().await {
            Message::Invocation {
                invocation_id: Some(id),
                ..
            } => ids.push(id),
            other => panic!("expected invocation, got {other:?}"),
        }
    }
    let mut unique = ids.clone();
    unique.sort();
    unique.dedup();
    assert_eq!(unique.len(), 4, "duplicate invocation ids: {ids:?}");

    for id in ids {
        peer.send_message(&Message::Completion {
            invocation_id: id,
            result: Some(json!("done")),
            error: None,
        })
        .await;
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap(), json!("done"));
    }
}

#[tokio::test]
async fn slow_stream_consumer_backpressures_without_reordering() {
    let config = hublink_core::ConnectionConfig {
        stream_buffer_capacity: 2,
        ..test_config()
    };
    let (connection, mut peers) = connection(config);
    let peer = started(&connection, &mut peers).await;

    let mut call = connection.stream("Burst", vec![]).await.unwrap();
    let invocation_id = match peer.recv_non_ping().await {
        Message::StreamInvocation { invocation_id, .. } => invocation_id,
        other => panic!("expected stream invocation, got {other:?}"),
    };

    // Push far more items than the buffer holds before consuming any.
    let producer = {
        let invocation_id = invocation_id.clone();
        let peer_items: Vec<Message> = (0..16)
            .map(|n| Message::StreamItem {
                invocation_id: invocation_id.clone(),
                item: json!(n),
            })
            .collect();
        async move {
            for item in &peer_items {
                peer.send_message(item).await;
            }
            peer.send_message(&Message::Completion {
                invocation_id,
                result: None,
                error: None,
            })
            .await;
            peer
        }
    };
    let producer = tokio::spawn(producer);

    tokio::time::sleep(SHORT).await;

    // Drain slowly; every item arrives, in order.
    for n in 0..16 {
        assert_eq!(call.next_item().await.unwrap().unwrap(), json!(n));
    }
    assert!(call.next_item().await.is_none());
    let _peer = producer.await.unwrap();
}
