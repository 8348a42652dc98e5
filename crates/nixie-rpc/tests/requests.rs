//! End-to-end request/response tests over the in-memory bus
//!
//! Liveness is quiet here (default 30s ping delay); without a valid
//! snapshot every unpinned call lands on worker 0, so responders run as
//! worker 0 throughout.

use anyhow::anyhow;
use nixie_bus::MemoryBus;
use nixie_core::config::RpcConfig;
use nixie_core::envelope::Fields;
use nixie_core::identity::ServiceName;
use nixie_rpc::{CallError, CallOptions, Reply, Service};
use serde_json::json;
use std::sync::Arc;

fn name(s: &str) -> ServiceName {
    ServiceName::new(s).unwrap()
}

async fn start_service(bus: &Arc<MemoryBus>, service: &str, worker: u32) -> Service {
    let svc = Service::builder(name(service), worker, bus.clone() as Arc<dyn nixie_bus::Bus>)
        .with_config(RpcConfig::default())
        .build()
        .unwrap();
    svc.start().await.unwrap();
    svc
}

#[tokio::test]
async fn test_simple_round_trip() {
    let bus = Arc::new(MemoryBus::new());
    let caller = start_service(&bus, "router", 0).await;
    let responder = start_service(&bus, "echo", 0).await;

    responder.register_handler("echo", |req| async move {
        let payload = req.fields().get("payload").cloned().unwrap_or_default();
        req.send(payload).await?;
        Ok(())
    });

    let mut fields = Fields::new();
    fields.insert("payload".into(), json!("bonjour"));

    let reply = caller.request(&name("echo"), "echo", fields).await.unwrap();
    match reply {
        Reply::Simple(Some(content)) => assert_eq!(content, json!("bonjour")),
        other => panic!("unexpected reply {:?}", other),
    }

    assert_eq!(caller.pending_calls(), 0);
    assert_eq!(responder.success_count(), 1);

    caller.stop().await.unwrap();
    responder.stop().await.unwrap();
}

#[tokio::test]
async fn test_unregistered_request_type_ends_empty() {
    let bus = Arc::new(MemoryBus::new());
    let caller = start_service(&bus, "router", 0).await;
    let responder = start_service(&bus, "echo", 0).await;

    let reply = caller
        .request(&name("echo"), "no-such-op", Fields::new())
        .await
        .unwrap();
    assert!(matches!(reply, Reply::Simple(None)));

    // Nothing was handled; counters untouched.
    assert_eq!(responder.success_count(), 0);
    assert_eq!(responder.error_count(), 0);

    caller.stop().await.unwrap();
    responder.stop().await.unwrap();
}

#[tokio::test]
async fn test_handler_without_reply_ends_empty() {
    let bus = Arc::new(MemoryBus::new());
    let caller = start_service(&bus, "router", 0).await;
    let responder = start_service(&bus, "quiet", 0).await;

    responder.register_handler("noop", |_req| async move { Ok(()) });

    let reply = caller
        .request(&name("quiet"), "noop", Fields::new())
        .await
        .unwrap();
    assert!(matches!(reply, Reply::Simple(None)));
    assert_eq!(responder.success_count(), 1);

    caller.stop().await.unwrap();
    responder.stop().await.unwrap();
}

#[tokio::test]
async fn test_rejection_reaches_the_caller() {
    let bus = Arc::new(MemoryBus::new());
    let caller = start_service(&bus, "router", 0).await;
    let responder = start_service(&bus, "naming", 0).await;

    responder.register_handler("rename", |req| async move {
        req.reject("name-taken", vec![json!("Souris")], Fields::new())
            .await?;
        Ok(())
    });

    let result = caller.request(&name("naming"), "rename", Fields::new()).await;
    match result {
        Err(CallError::Rejected(rejection)) => {
            assert_eq!(rejection.kind, "name-taken");
            assert_eq!(rejection.args, vec![json!("Souris")]);
        }
        other => panic!("unexpected result {:?}", other.map(|_| ())),
    }

    // A rejection is a handled request, not a fault.
    assert_eq!(responder.success_count(), 1);
    assert_eq!(responder.error_count(), 0);

    caller.stop().await.unwrap();
    responder.stop().await.unwrap();
}

#[tokio::test]
async fn test_handler_error_maps_to_internal() {
    let bus = Arc::new(MemoryBus::new());
    let caller = start_service(&bus, "router", 0).await;
    let responder = start_service(&bus, "flaky", 0).await;

    responder.register_handler("boom", |_req| async move {
        Err(anyhow!("database on fire"))
    });

    let result = caller.request(&name("flaky"), "boom", Fields::new()).await;
    assert!(matches!(result, Err(CallError::Internal { .. })));
    assert_eq!(responder.error_count(), 1);
    assert_eq!(responder.success_count(), 0);

    caller.stop().await.unwrap();
    responder.stop().await.unwrap();
}

#[tokio::test]
async fn test_handler_panic_maps_to_internal() {
    let bus = Arc::new(MemoryBus::new());
    let caller = start_service(&bus, "router", 0).await;
    let responder = start_service(&bus, "flaky", 0).await;

    responder.register_handler("panic", |_req| async move {
        panic!("unexpected");
        #[allow(unreachable_code)]
        Ok(())
    });

    let result = caller.request(&name("flaky"), "panic", Fields::new()).await;
    assert!(matches!(result, Err(CallError::Internal { .. })));
    assert_eq!(responder.error_count(), 1);

    caller.stop().await.unwrap();
    responder.stop().await.unwrap();
}

#[tokio::test]
async fn test_streaming_preserves_order() {
    let bus = Arc::new(MemoryBus::new());
    let caller = start_service(&bus, "router", 0).await;
    let responder = start_service(&bus, "feed", 0).await;

    responder.register_handler("history", |req| async move {
        req.open_stream().await?;
        for i in 0..5 {
            req.send(json!(i)).await?;
        }
        req.end().await?;
        Ok(())
    });

    let reply = caller
        .request(&name("feed"), "history", Fields::new())
        .await
        .unwrap();
    let mut stream = match reply {
        Reply::Stream(stream) => stream,
        other => panic!("unexpected reply {:?}", other),
    };

    let mut received = Vec::new();
    while let Some(content) = stream.next().await.unwrap() {
        received.push(content);
    }
    assert_eq!(received, vec![json!(0), json!(1), json!(2), json!(3), json!(4)]);

    assert_eq!(caller.pending_calls(), 0);

    caller.stop().await.unwrap();
    responder.stop().await.unwrap();
}

#[tokio::test]
async fn test_mid_stream_rejection() {
    let bus = Arc::new(MemoryBus::new());
    let caller = start_service(&bus, "router", 0).await;
    let responder = start_service(&bus, "feed", 0).await;

    responder.register_handler("history", |req| async move {
        req.open_stream().await?;
        req.send(json!("first")).await?;
        req.reject("quota-exceeded", vec![], Fields::new()).await?;
        Ok(())
    });

    let reply = caller
        .request(&name("feed"), "history", Fields::new())
        .await
        .unwrap();
    let mut stream = match reply {
        Reply::Stream(stream) => stream,
        other => panic!("unexpected reply {:?}", other),
    };

    assert_eq!(stream.next().await.unwrap(), Some(json!("first")));
    match stream.next().await {
        Err(CallError::Rejected(rejection)) => assert_eq!(rejection.kind, "quota-exceeded"),
        other => panic!("unexpected result {:?}", other.map(|_| ())),
    }

    caller.stop().await.unwrap();
    responder.stop().await.unwrap();
}

#[tokio::test]
async fn test_timeout_cleans_up_the_waiter() {
    let bus = Arc::new(MemoryBus::new());
    let caller = start_service(&bus, "router", 0).await;
    let responder = start_service(&bus, "slow", 0).await;

    responder.register_handler("think", |req| async move {
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        req.send(json!("too late")).await?;
        Ok(())
    });

    let result = caller
        .request_opts(
            &name("slow"),
            "think",
            Fields::new(),
            CallOptions::new().with_timeout_ms(50),
        )
        .await;

    match result {
        Err(CallError::Timeout { timeout_ms, .. }) => assert_eq!(timeout_ms, 50),
        other => panic!("unexpected result {:?}", other.map(|_| ())),
    }
    assert_eq!(caller.pending_calls(), 0);

    // The late reply arrives into nothing and is dropped.
    tokio::time::sleep(std::time::Duration::from_millis(250)).await;
    assert_eq!(caller.pending_calls(), 0);

    caller.stop().await.unwrap();
    responder.stop().await.unwrap();
}

#[tokio::test]
async fn test_pinned_worker_bypasses_rotation() {
    let bus = Arc::new(MemoryBus::new());
    let caller = start_service(&bus, "router", 0).await;
    let _w0 = start_service(&bus, "shard", 0).await;
    let w3 = start_service(&bus, "shard", 3).await;

    w3.register_handler("whoami", |req| async move {
        req.send(json!(3)).await?;
        Ok(())
    });

    let reply = caller
        .request_opts(
            &name("shard"),
            "whoami",
            Fields::new(),
            CallOptions::new().with_worker(3),
        )
        .await
        .unwrap();
    match reply {
        Reply::Simple(Some(content)) => assert_eq!(content, json!(3)),
        other => panic!("unexpected reply {:?}", other),
    }

    caller.stop().await.unwrap();
    w3.stop().await.unwrap();
}

#[tokio::test]
async fn test_plain_message_callback() {
    let bus = Arc::new(MemoryBus::new());
    let sender = start_service(&bus, "router", 0).await;
    let receiver = start_service(&bus, "cache", 0).await;

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    receiver.on_message(move |plain| {
        let _ = tx.send((plain.kind.clone(), plain.fields.clone()));
    });

    let mut fields = Fields::new();
    fields.insert("player".into(), json!("Tig"));
    sender
        .send(&name("cache"), None, "invalidate", &fields)
        .await
        .unwrap();

    let (kind, fields) = rx.recv().await.unwrap();
    assert_eq!(kind, "invalidate");
    assert_eq!(fields["player"], json!("Tig"));

    sender.stop().await.unwrap();
    receiver.stop().await.unwrap();
}
