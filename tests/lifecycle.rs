// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod common;

use common::{app, eventually};
use rabbitmq_services::{
    app::App,
    errors::{ConfigError, ProcessingError},
    memory::MemoryBroker,
    processor::{Param, Processor, Reply},
    scheme::Scheme,
    settings::RawSettings,
};
use std::{sync::Arc, time::Duration};

const SETTINGS: &str = r#"{
    "connections": {
        "default": { "url": "amqp://localhost" },
        "audit": { "host": "audit.local", "username": "auditor", "password": "secret" }
    },
    "consumers": {
        "orders": { "exchange": "orders", "routing_key": "order", "queue": "orders" },
        "ledger": { "connection": "audit", "exchange": "orders", "routing_key": "order", "queue": "ledger" }
    },
    "publishers": {
        "confirmations": { "exchange": "confirmations", "routing_key": "confirmed" }
    }
}"#;

fn noop() -> Processor {
    Processor::builder()
        .param(Param::message("message"))
        .handle(|_| async { Ok::<_, ProcessingError>(Reply::Empty) })
        .unwrap()
}

#[test]
fn conflicting_exchange_types_fail_before_connecting() {
    let broker = MemoryBroker::new();
    let raw = RawSettings::from_json(
        r#"{
            "connections": { "default": { "url": "amqp://localhost" } },
            "consumers": {
                "orders": { "exchange": "orders", "exchange_type": "topic", "routing_key": "order.#", "queue": "orders" }
            },
            "publishers": {
                "checkout": { "exchange": "orders", "exchange_type": "fanout", "routing_key": "" }
            }
        }"#,
    )
    .unwrap();

    let err = App::new("shop", &raw, Arc::new(broker.clone())).err().unwrap();

    assert!(matches!(err, ConfigError::ExchangeTypeConflict { .. }));
    assert_eq!(broker.connect_attempts(), 0);
}

#[tokio::test]
async fn connections_are_shared_per_name_and_direction() {
    let broker = MemoryBroker::new();
    let mut app = app("shop", SETTINGS, &broker);
    let mut scheme = Scheme::new("shop");
    scheme.publisher("confirmations").unwrap();
    scheme.consumer("orders", noop()).unwrap();
    scheme.consumer("ledger", noop()).unwrap();
    app.setup(scheme).unwrap();

    app.run_until(async {
        assert_eq!(
            broker.open_connections(),
            vec![
                "shop_audit_read".to_owned(),
                "shop_default_read".to_owned(),
                "shop_default_write".to_owned(),
            ]
        );
        assert_eq!(broker.consumer_count("orders"), 1);
        assert_eq!(broker.consumer_count("ledger"), 1);
    })
    .await
    .unwrap();

    assert!(broker.open_connections().is_empty());
    assert_eq!(broker.consumer_count("orders"), 0);
}

#[tokio::test]
async fn unreachable_broker_is_retried_until_it_accepts() {
    let broker = MemoryBroker::new();
    broker.refuse_connections(3);
    let mut app = app("shop", SETTINGS, &broker);
    let mut scheme = Scheme::new("shop");
    scheme.consumer("orders", noop()).unwrap();
    app.setup(scheme).unwrap();

    app.run_until(async {
        assert_eq!(broker.consumer_count("orders"), 1);
    })
    .await
    .unwrap();

    assert_eq!(broker.connect_attempts(), 4);
}

#[tokio::test]
async fn dropping_the_run_future_releases_resources() {
    let broker = MemoryBroker::new();
    let mut app = app("shop", SETTINGS, &broker);
    let mut scheme = Scheme::new("shop");
    scheme.consumer("orders", noop()).unwrap();
    app.setup(scheme).unwrap();

    let run = tokio::time::timeout(
        Duration::from_millis(50),
        app.run_until(std::future::pending()),
    )
    .await;

    assert!(run.is_err());
    eventually(|| broker.open_connections().is_empty()).await;
}
