// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use rabbitmq_services::{app::App, memory::MemoryBroker, settings::RawSettings};
use std::{sync::Arc, time::Duration};

pub fn app(name: &str, settings: &str, broker: &MemoryBroker) -> App {
    let raw = RawSettings::from_json(settings).expect("valid settings");
    App::new(name, &raw, Arc::new(broker.clone()))
        .expect("resolvable settings")
        .with_retry_backoff(Duration::from_millis(10))
}

/// Waits until `condition` holds, failing the test after a few seconds.
pub async fn eventually(condition: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition was never met");
}
