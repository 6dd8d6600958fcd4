// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Tasks that feed notifications into the controller's queue.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use realm_orchestrator::{Notification, RealmSource};

/// Forwards every notification of `stream` into `queue`.
///
/// Returns once the stream ends or the queue is closed.
pub async fn forward(
    mut stream: BoxStream<'static, Notification>,
    queue: mpsc::Sender<Notification>,
) {
    while let Some(notification) = stream.next().await {
        debug!(realm_id = %notification.realm_id, kind = ?notification.kind, "received notification");
        if queue.send(notification).await.is_err() {
            return;
        }
    }
}

/// Periodically enqueues a reconcile of every declared realm, so that drift
/// in the backend is corrected even when no event announces it.
pub async fn resync(
    source: Arc<dyn RealmSource>,
    queue: mpsc::Sender<Notification>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately and startup recovery already
    // enqueued every realm.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let realms = match source.list().await {
            Ok(realms) => realms,
            Err(e) => {
                warn!("failed to list realms for resync: {e:#}");
                continue;
            }
        };
        for realm in realms {
            if queue
                .send(Notification::reconcile(realm.realm_id))
                .await
                .is_err()
            {
                return;
            }
        }
    }
}
