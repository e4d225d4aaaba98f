//! Event pump: drains the events queue into the node registry.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};

use pitch_queue::{DurableQueue, NodeEvent, EVENTS_QUEUE};

use crate::registry::NodeRegistry;

const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Consume node events until shutdown, acking each applied event and
/// requeuing the ones the registry could not apply.
pub async fn run_event_pump(
    queue: DurableQueue,
    registry: &NodeRegistry,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("event pump started");
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!("event pump stopping");
                return;
            }
            _ = tokio::time::sleep(POLL_INTERVAL) => {
                drain(&queue, registry);
            }
        }
    }
}

fn drain(queue: &DurableQueue, registry: &NodeRegistry) {
    loop {
        let delivery = match queue.consume::<NodeEvent>(EVENTS_QUEUE) {
            Ok(Some(delivery)) => delivery,
            Ok(None) => return,
            Err(e) => {
                error!(error = %e, "event consume failed");
                return;
            }
        };
        let event = delivery.message.clone();
        match registry.handle_event(&event, unix_now()) {
            Ok(()) => {
                if let Err(e) = delivery.ack() {
                    error!(error = %e, "event ack failed");
                    return;
                }
            }
            Err(e) => {
                warn!(error = %e, ?event, "event not applied, requeued");
                if let Err(e) = delivery.nack() {
                    error!(error = %e, "event requeue failed");
                }
                return;
            }
        }
    }
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pitch_queue::JobStarted;
    use pitch_state::{Match, MatchStatus, StateStore};

    #[test]
    fn drain_applies_and_acks_events() {
        let state = StateStore::open_in_memory().unwrap();
        let queue = DurableQueue::open_in_memory().unwrap();
        let registry = NodeRegistry::new(state.clone(), queue.clone(), "k".to_string());

        state
            .put_match(&Match {
                id: 3,
                tournament_id: 1,
                left_team_id: 1,
                right_team_id: 2,
                status: MatchStatus::InQueue,
                node_id: None,
                left_score: None,
                right_score: None,
                left_penalty: None,
                right_penalty: None,
            })
            .unwrap();

        queue
            .publish(
                EVENTS_QUEUE,
                &NodeEvent::Register {
                    node_id: "node-1".to_string(),
                    address: "a:1".to_string(),
                    capacity: 2,
                },
            )
            .unwrap();
        queue
            .publish(
                EVENTS_QUEUE,
                &NodeEvent::Started(JobStarted {
                    job_id: 3,
                    node_id: "node-1".to_string(),
                    success: true,
                    assigned_port: Some(6000),
                    error: None,
                }),
            )
            .unwrap();

        drain(&queue, &registry);
        assert_eq!(queue.pending(EVENTS_QUEUE).unwrap(), 0);
        assert_eq!(queue.in_flight(EVENTS_QUEUE).unwrap(), 0);
        assert_eq!(
            state.find_match(3).unwrap().unwrap().status,
            MatchStatus::InProgress
        );
        assert_eq!(state.list_nodes().unwrap().len(), 1);
    }
}
