//! Typed event stream for hive observers.
//!
//! Events are fanned out over a `tokio::sync::broadcast` channel. Publishing
//! never blocks and never fails; slow subscribers see `Lagged` instead of
//! stalling the hive.

use crate::consensus::ProposalStatus;
use crate::fault::FaultKind;
use crate::types::{NodeId, ProposalId, Signature, TaskId, WorkerId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Everything the hive announces.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HiveEvent {
    SovereigntyEstablished {
        at: DateTime<Utc>,
    },
    Abdicated {
        successor: Option<WorkerId>,
        at: DateTime<Utc>,
    },
    WorkerRegistered {
        worker_id: WorkerId,
    },
    WorkerDeregistered {
        worker_id: WorkerId,
    },
    TaskCompleted {
        task_id: TaskId,
        worker_id: WorkerId,
        success: bool,
        duration_ms: u64,
    },
    NodeQuarantined {
        node_id: NodeId,
        reputation: f64,
        reason: Option<FaultKind>,
    },
    ProposalResolved {
        proposal_id: ProposalId,
        status: ProposalStatus,
        rounds_used: u32,
        affirmative: f64,
    },
    PatternValidated {
        pattern_id: String,
        signature: Signature,
        confidence: f64,
        contributors: usize,
    },
    PatternRejected {
        signature: Signature,
        status: ProposalStatus,
    },
    HealthChecked {
        coherence_score: f64,
        swarm_efficiency: f64,
        threat_level: String,
    },
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EventBusError {
    #[error("Event bus closed")]
    Closed,
    #[error("Receiver lagged by {0} events")]
    Lagged(u64),
    #[error("No event available")]
    Empty,
}

/// Broadcast bus for [`HiveEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<HiveEvent>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn publish(&self, event: HiveEvent) {
        debug!(?event, "Publishing hive event");
        if self.sender.send(event).is_err() {
            debug!("No subscribers listening to hive events");
        }
    }

    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// Subscription handle returned by [`EventBus::subscribe`].
pub struct EventReceiver {
    receiver: broadcast::Receiver<HiveEvent>,
}

impl EventReceiver {
    pub async fn recv(&mut self) -> Result<HiveEvent, EventBusError> {
        self.receiver.recv().await.map_err(|e| match e {
            broadcast::error::RecvError::Closed => EventBusError::Closed,
            broadcast::error::RecvError::Lagged(n) => {
                warn!("Hive event receiver lagged by {} events", n);
                EventBusError::Lagged(n)
            }
        })
    }

    pub fn try_recv(&mut self) -> Result<HiveEvent, EventBusError> {
        self.receiver.try_recv().map_err(|e| match e {
            broadcast::error::TryRecvError::Empty => EventBusError::Empty,
            broadcast::error::TryRecvError::Closed => EventBusError::Closed,
            broadcast::error::TryRecvError::Lagged(n) => EventBusError::Lagged(n),
        })
    }

    /// Drain whatever is currently buffered.
    pub fn drain(&mut self) -> Vec<HiveEvent> {
        let mut events = Vec::new();
        loop {
            match self.try_recv() {
                Ok(event) => events.push(event),
                Err(EventBusError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
        events
    }
}
