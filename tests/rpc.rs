// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod common;

use common::{app, eventually};
use rabbitmq_services::{
    errors::{ProcessingError, RpcError},
    memory::MemoryBroker,
    message::Headers,
    processor::{Param, Processor, Reply},
    scheme::Scheme,
};
use serde_json::json;
use std::time::Duration;
use tokio::sync::oneshot;

const SETTINGS: &str = r#"{
    "connections": { "default": { "url": "amqp://localhost" } },
    "rpc_services": {
        "echo": {
            "worker": { "exchange": "rpc", "routing_key": "echo", "queue": "echo-requests", "prefetch_count": 4 },
            "request_publisher": { "exchange": "rpc", "routing_key": "echo" },
            "timeout": 2
        }
    }
}"#;

fn echo() -> Processor {
    Processor::builder()
        .param(Param::value("a"))
        .handle(|args| async move {
            let a: i64 = args.get("a")?;
            // later requests answer first
            tokio::time::sleep(Duration::from_millis(30_u64.saturating_sub(a as u64 * 10))).await;
            Reply::json(&a)
        })
        .unwrap()
}

#[tokio::test]
async fn calls_round_trip_between_applications() {
    let broker = MemoryBroker::new();
    let mut server = app("server", SETTINGS, &broker);
    let mut scheme = Scheme::new("server");
    scheme.rpc_service("echo", echo()).unwrap();
    server.setup(scheme).unwrap();

    let mut client = app("client", SETTINGS, &broker);
    let mut scheme = Scheme::new("client");
    scheme.rpc_client("echo").unwrap();
    client.setup(scheme).unwrap();

    let (stop, stopped) = oneshot::channel::<()>();
    let serving = server.run_until(async {
        stopped.await.ok();
    });
    let calling = client.run_until(async {
        eventually(|| broker.consumer_count("echo-requests") == 1).await;
        let echo = client.rpc_client("echo").unwrap();

        assert_eq!(echo.call(&json!({"a": 1}), Headers::new()).await, Ok(json!(1)));

        let (req_one, req_two) = (json!({"a": 1}), json!({"a": 2}));
        let (one, two) = tokio::join!(
            echo.call_as::<_, i64>(&req_one, Headers::new()),
            echo.call_as::<_, i64>(&req_two, Headers::new()),
        );
        assert_eq!((one, two), (Ok(1), Ok(2)));
        assert!(echo.pending().is_empty());

        stop.send(()).ok();
    });

    let (served, called) = tokio::join!(serving, calling);
    served.unwrap();
    called.unwrap();
    assert!(broker.open_connections().is_empty());
}

#[tokio::test]
async fn handler_failures_leave_the_call_to_time_out() {
    let broker = MemoryBroker::new();
    let failing = Processor::builder()
        .param(Param::value("a"))
        .handle(|_| async { Err::<Reply, _>(ProcessingError::nack("refused", false)) })
        .unwrap();
    let mut server = app("server", SETTINGS, &broker);
    let mut scheme = Scheme::new("server");
    scheme.rpc_service("echo", failing).unwrap();
    server.setup(scheme).unwrap();

    let mut client = app("client", SETTINGS, &broker);
    let mut scheme = Scheme::new("client");
    scheme.rpc_client("echo").unwrap();
    client.setup(scheme).unwrap();

    let (stop, stopped) = oneshot::channel::<()>();
    let serving = server.run_until(async {
        stopped.await.ok();
    });
    let calling = client.run_until(async {
        eventually(|| broker.consumer_count("echo-requests") == 1).await;
        let echo = client.rpc_client("echo").unwrap();

        let err = echo.call(&json!({"a": 1}), Headers::new()).await.unwrap_err();

        assert_eq!(err, RpcError::Timeout(Duration::from_secs(2)));
        assert_eq!(broker.queue_len("echo-requests"), 0);
        stop.send(()).ok();
    });

    let (served, called) = tokio::join!(serving, calling);
    served.unwrap();
    called.unwrap();
}
