//! End-to-end tests for the composed messaging runtime

mod support;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use shopchat_core::processor::HandlerOptions;
use shopchat_core::{BusEvent, ConnectionConfig, ConversationId};
use shopchat_runtime::send_channel::StaticConversation;
use shopchat_runtime::transport::TransportEvent;
use shopchat_runtime::{MessagingRuntime, RuntimeConfig};
use support::{next_matching, ScriptedConnector, ScriptedHttp};

#[tokio::test(start_paused = true)]
async fn test_runtime_wires_inbound_dispatch_and_reconciliation() {
    support::init_tracing();
    let (connector, mut links) = ScriptedConnector::new(0);
    let http = Arc::new(ScriptedHttp::succeeding().without_echo());

    let mut runtime = MessagingRuntime::new(
        RuntimeConfig {
            connection: ConnectionConfig {
                enable_auto_heartbeat: false,
                ..ConnectionConfig::default()
            },
            ..RuntimeConfig::default()
        },
        "wss://chat.example/ws",
        Arc::new(connector),
        http.clone(),
        Arc::new(StaticConversation(ConversationId::from("conv-1"))),
    );

    let handled = Arc::new(AtomicU32::new(0));
    {
        let handled = handled.clone();
        runtime.processor_mut().register_handler(
            "message",
            Box::new(move |_, _| {
                handled.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
            HandlerOptions::default(),
        );
    }

    let mut events = runtime.bus().subscribe();
    let handles = runtime.start();
    next_matching(&mut events, |e| matches!(e, BusEvent::Open)).await;
    let link = links.recv().await.unwrap();

    // Outbound: the POST carries the draft's temp_id
    handles.sends.send_text("hello").await.unwrap();
    next_matching(&mut events, |e| matches!(e, BusEvent::MessageSent { .. })).await;
    let temp_id = http.posts.lock().unwrap()[0].temp_id.clone();

    // No echo in the HTTP response, so the item is retained as sent
    let snapshot = handles.sends.snapshot().await.unwrap();
    assert_eq!(snapshot.sent, 1);

    // Inbound: the server echo dispatches to the handler and reconciles
    let echo = json!({
        "type": "message",
        "payload": { "temp_id": temp_id, "id": "srv-9", "content": "hello" },
    });
    link.inbound
        .send(TransportEvent::Message(echo.to_string()))
        .unwrap();

    let mut reconciled = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        if handles.sends.snapshot().await.unwrap().items.is_empty() {
            reconciled = true;
            break;
        }
    }
    assert!(reconciled, "server echo never reconciled the sent item");
    assert_eq!(handled.load(Ordering::SeqCst), 1);

    handles.shutdown().await;
}
