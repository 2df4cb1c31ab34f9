use nimbus_protocol::NodeId;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::trace;

/// Capacity of the event channel owned by each pipeline.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Upload,
    Download,
}

/// Lifecycle notifications for individual transfers.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    Started {
        node: NodeId,
        direction: Direction,
    },
    Progress {
        node: NodeId,
        direction: Direction,
        completed: u64,
        total: u64,
    },
    Completed {
        node: NodeId,
        direction: Direction,
    },
    Failed {
        node: NodeId,
        direction: Direction,
        error: String,
    },
    Cancelled {
        node: NodeId,
        direction: Direction,
    },
}

impl TransferEvent {
    pub fn node(&self) -> &NodeId {
        match self {
            Self::Started { node, .. }
            | Self::Progress { node, .. }
            | Self::Completed { node, .. }
            | Self::Failed { node, .. }
            | Self::Cancelled { node, .. } => node,
        }
    }
}

/// Non-blocking sender side of the event channel.
///
/// Events are dropped when nobody drains the channel; transfers never wait
/// on observers.
#[derive(Debug, Clone)]
pub(crate) struct EventSink {
    tx: mpsc::Sender<TransferEvent>,
}

impl EventSink {
    pub(crate) fn channel() -> (Self, mpsc::Receiver<TransferEvent>) {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        (Self { tx }, rx)
    }

    pub(crate) fn emit(&self, event: TransferEvent) {
        match self.tx.try_send(event) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(event)) => {
                trace!(node = %event.node(), "event channel full, dropping event");
            }
        }
    }
}
