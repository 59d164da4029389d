use std::sync::Arc;

use async_trait::async_trait;
use rpa_core_types::RpaError;
use tokio::sync::{broadcast, mpsc};

use crate::{ProgressEvent, ProgressReporter};

/// Publish/subscribe sink for live consumers such as dashboards.
///
/// Publishing with no subscriber attached is not an error; the event is
/// simply not observed by anyone.
pub struct BroadcastProgressReporter {
    sender: broadcast::Sender<ProgressEvent>,
}

impl BroadcastProgressReporter {
    pub fn new(capacity: usize) -> Arc<Self> {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Arc::new(Self { sender })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[async_trait]
impl ProgressReporter for BroadcastProgressReporter {
    async fn report(&self, event: ProgressEvent) -> Result<(), RpaError> {
        let _ = self.sender.send(event);
        Ok(())
    }
}

/// Helper to materialise an mpsc receiver from the bus subscription
/// so callers can await events without handling broadcast lag directly.
pub fn to_mpsc(bus: Arc<BroadcastProgressReporter>, capacity: usize) -> mpsc::Receiver<ProgressEvent> {
    let mut rx = bus.subscribe();
    let (tx, out_rx) = mpsc::channel(capacity.max(1));
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if tx.send(event).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "progress subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
    out_rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EventKind;
    use rpa_core_types::{TaskId, TaskStatus};

    #[tokio::test]
    async fn subscribers_receive_events_in_order() {
        let bus = BroadcastProgressReporter::new(8);
        let mut rx = to_mpsc(bus.clone(), 8);
        tokio::task::yield_now().await;
        let task = TaskId::from("live");
        for seq in 1..=3 {
            bus.report(ProgressEvent::new(
                task.clone(),
                seq,
                EventKind::Progress,
                TaskStatus::Running,
                (seq * 10) as u8,
            ))
            .await
            .unwrap();
        }
        for expected in 1..=3 {
            let event = rx.recv().await.expect("event");
            assert_eq!(event.seq, expected);
        }
    }

    #[tokio::test]
    async fn publishing_without_subscribers_is_ok() {
        let bus = BroadcastProgressReporter::new(1);
        assert_eq!(bus.subscriber_count(), 0);
        bus.report(ProgressEvent::new(
            TaskId::new(),
            1,
            EventKind::Log,
            TaskStatus::Running,
            0,
        ))
        .await
        .unwrap();
    }
}
