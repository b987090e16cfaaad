// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Event Bus - in-process fan-out of failover events
//
// Backed by a tokio broadcast channel. Publishing never blocks and never
// fails: with no subscribers the event is dropped, and slow subscribers see
// `Lagged` instead of holding up the failover path.

use crate::domain::events::{EventPublisher, FailoverEvent};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<FailoverEvent>>,
}

impl EventBus {
    /// `capacity` events are buffered per subscriber before the oldest are
    /// dropped.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(256)
    }

    pub fn publish(&self, event: FailoverEvent) {
        debug!("Publishing event: {:?}", event);
        if self.sender.send(event).is_err() {
            debug!("No subscribers listening to event");
        }
    }

    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
        }
    }

    /// Subscribe to the events of a single projection.
    pub fn subscribe_projection(&self, projection_id: u32) -> ProjectionEventReceiver {
        ProjectionEventReceiver {
            receiver: self.sender.subscribe(),
            projection_id,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

impl EventPublisher for EventBus {
    fn publish_failover_event(&self, event: FailoverEvent) {
        self.publish(event);
    }
}

pub struct EventReceiver {
    receiver: broadcast::Receiver<FailoverEvent>,
}

impl EventReceiver {
    pub async fn recv(&mut self) -> Result<FailoverEvent, EventBusError> {
        self.receiver.recv().await.map_err(recv_error)
    }

    pub fn try_recv(&mut self) -> Result<FailoverEvent, EventBusError> {
        self.receiver.try_recv().map_err(|e| match e {
            broadcast::error::TryRecvError::Empty => EventBusError::Empty,
            broadcast::error::TryRecvError::Closed => EventBusError::Closed,
            broadcast::error::TryRecvError::Lagged(n) => {
                warn!("Event receiver lagged by {} events", n);
                EventBusError::Lagged(n)
            }
        })
    }

    /// Everything currently buffered, without waiting.
    pub fn drain(&mut self) -> Vec<FailoverEvent> {
        let mut events = Vec::new();
        loop {
            match self.try_recv() {
                Ok(event) => events.push(event),
                Err(EventBusError::Lagged(_)) => continue,
                Err(_) => return events,
            }
        }
    }
}

/// Receiver filtered to one projection. Group-wide events are skipped.
pub struct ProjectionEventReceiver {
    receiver: broadcast::Receiver<FailoverEvent>,
    projection_id: u32,
}

impl ProjectionEventReceiver {
    pub async fn recv(&mut self) -> Result<FailoverEvent, EventBusError> {
        loop {
            let event = self.receiver.recv().await.map_err(recv_error)?;
            if event.projection_id() == Some(self.projection_id) {
                return Ok(event);
            }
        }
    }
}

fn recv_error(e: broadcast::error::RecvError) -> EventBusError {
    match e {
        broadcast::error::RecvError::Closed => EventBusError::Closed,
        broadcast::error::RecvError::Lagged(n) => {
            warn!("Event receiver lagged by {} events", n);
            EventBusError::Lagged(n)
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("Event bus is closed")]
    Closed,

    #[error("No events available")]
    Empty,

    #[error("Receiver lagged by {0} events (events were dropped)")]
    Lagged(u64),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::projection::OfflineReason;
    use chrono::Utc;

    fn offline(projection_id: u32) -> FailoverEvent {
        FailoverEvent::ProjectionOffline {
            projection_id,
            reason: OfflineReason::HostDown,
            failed_requests: 0,
            offline_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = EventBus::new(8);
        let mut receiver = bus.subscribe();

        bus.publish_failover_event(FailoverEvent::RankEvicted {
            group: "ionss".to_string(),
            rank: 0,
            primary_rank: Some(1),
            evicted_at: Utc::now(),
        });

        match receiver.recv().await.unwrap() {
            FailoverEvent::RankEvicted { rank, primary_rank, .. } => {
                assert_eq!(rank, 0);
                assert_eq!(primary_rank, Some(1));
            }
            other => panic!("Wrong event received: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_projection_filter() {
        let bus = EventBus::new(8);
        let mut receiver = bus.subscribe_projection(2);

        bus.publish(offline(1));
        bus.publish(offline(2));

        assert_eq!(receiver.recv().await.unwrap().projection_id(), Some(2));
    }

    #[tokio::test]
    async fn test_lagging_receiver_reports_drops() {
        let bus = EventBus::new(2);
        let mut receiver = bus.subscribe();
        for id in 0..5 {
            bus.publish(offline(id));
        }

        assert!(matches!(receiver.recv().await, Err(EventBusError::Lagged(3))));
        assert_eq!(receiver.recv().await.unwrap().projection_id(), Some(3));
    }

    #[test]
    fn test_publish_without_subscribers_is_silent() {
        let bus = EventBus::default();
        bus.publish(offline(1));
        assert_eq!(bus.subscriber_count(), 0);
    }
}
