//! Coordinator events with per-subscriber filtering.

use crate::primitives::address::Network;
use crate::types::BranchKind;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Emitted after the coordinator snapshot has absorbed the change it describes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CoordinatorEvent {
    BranchInitialized {
        branch: BranchKind,
        epoch: u64,
    },
    BranchFetched {
        branch: BranchKind,
        epoch: u64,
        outputs: usize,
    },
    BranchFailed {
        branch: BranchKind,
        epoch: u64,
        error: String,
    },
    LedgerContextChanged {
        network: Network,
        epoch: u64,
    },
}

impl CoordinatorEvent {
    pub fn branch(&self) -> Option<BranchKind> {
        match self {
            CoordinatorEvent::BranchInitialized { branch, .. }
            | CoordinatorEvent::BranchFetched { branch, .. }
            | CoordinatorEvent::BranchFailed { branch, .. } => Some(*branch),
            CoordinatorEvent::LedgerContextChanged { .. } => None,
        }
    }

    pub fn epoch(&self) -> u64 {
        match self {
            CoordinatorEvent::BranchInitialized { epoch, .. }
            | CoordinatorEvent::BranchFetched { epoch, .. }
            | CoordinatorEvent::BranchFailed { epoch, .. }
            | CoordinatorEvent::LedgerContextChanged { epoch, .. } => *epoch,
        }
    }
}

/// Selects which events a subscription receives.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Only events from these branches; `None` admits all of them
    pub branches: Option<Vec<BranchKind>>,
    pub failures_only: bool,
    pub skip_context_changes: bool,
}

impl EventFilter {
    pub fn branch(branch: BranchKind) -> Self {
        Self {
            branches: Some(vec![branch]),
            ..Self::default()
        }
    }

    pub fn should_include(&self, event: &CoordinatorEvent) -> bool {
        match event.branch() {
            None => !self.skip_context_changes && !self.failures_only,
            Some(branch) => {
                let branch_ok = self.branches.as_ref().map_or(true, |b| b.contains(&branch));
                let kind_ok = !self.failures_only || matches!(event, CoordinatorEvent::BranchFailed { .. });
                branch_ok && kind_ok
            }
        }
    }
}

/// Filtered view over the coordinator's event channel.
pub struct EventSubscription {
    receiver: broadcast::Receiver<CoordinatorEvent>,
    filter: EventFilter,
}

impl EventSubscription {
    pub(crate) fn new(receiver: broadcast::Receiver<CoordinatorEvent>, filter: EventFilter) -> Self {
        Self { receiver, filter }
    }

    /// Next matching event, or `None` once the coordinator is gone.
    ///
    /// Lagging subscribers skip what they missed.
    pub async fn recv(&mut self) -> Option<CoordinatorEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if self.filter.should_include(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!("Event subscriber lagged, {} events dropped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<CoordinatorEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) if self.filter.should_include(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}
