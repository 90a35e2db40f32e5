//! Engine-wide event distribution.
//!
//! Every lifecycle transition, network/volume mutation and readiness attempt
//! is published here in addition to being logged, so callers can observe
//! individual steps whose outcome is otherwise folded into a single result.

use crate::domain::{ContainerId, ContainerState};
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio::sync::broadcast;

/// Outcome of a single readiness check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Passed,
    Failed(String),
}

impl ProbeOutcome {
    pub fn passed(&self) -> bool {
        matches!(self, ProbeOutcome::Passed)
    }
}

/// One readiness attempt as observed by the prober.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeAttempt {
    pub container: ContainerId,
    /// 1-based attempt number.
    pub attempt: u32,
    pub max_attempts: u32,
    /// Time since probing began.
    pub elapsed: Duration,
    pub outcome: ProbeOutcome,
}

#[derive(Debug, Clone)]
pub enum EngineEvent {
    ContainerCreated {
        id: ContainerId,
        name: String,
    },
    ContainerStateChanged {
        id: ContainerId,
        state: ContainerState,
        exit_code: Option<i32>,
    },
    ContainerRestarting {
        id: ContainerId,
        restart_count: u32,
    },
    NetworkCreated {
        name: String,
    },
    NetworkDeleted {
        name: String,
    },
    ContainerAttached {
        id: ContainerId,
        network: String,
        address: Option<Ipv4Addr>,
    },
    ContainerDetached {
        id: ContainerId,
        network: String,
    },
    VolumeCreated {
        name: String,
    },
    VolumeDeleted {
        name: String,
    },
    Probe(ProbeAttempt),
}

#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self { sender }
    }

    pub fn publish(&self, event: EngineEvent) {
        // No subscribers is fine.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
