//! Proposal lifecycle notifications
//!
//! Events are handed to a `Notifier` after the state change they describe
//! has been committed. Delivery (push, email) is outside the engine.

use serde::Serialize;
use tokio::sync::broadcast;

/// Maximum number of events to buffer per subscriber
const BROADCAST_CAPACITY: usize = 100;

/// Lifecycle events of a proposal
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(tag = "type", content = "data")]
pub enum ProposalEvent {
    /// Published by its creator; peers can now act on it
    NewTxProposal {
        wallet_id: String,
        proposal_id: String,
        creator_id: String,
        amount: u64,
    },
    TxProposalAcceptedBy {
        wallet_id: String,
        proposal_id: String,
        copayer_id: String,
    },
    TxProposalRejectedBy {
        wallet_id: String,
        proposal_id: String,
        copayer_id: String,
    },
    TxProposalFinallyAccepted {
        wallet_id: String,
        proposal_id: String,
    },
    TxProposalFinallyRejected {
        wallet_id: String,
        proposal_id: String,
    },
    TxProposalRemoved {
        wallet_id: String,
        proposal_id: String,
        copayer_id: String,
    },
    NewOutgoingTx {
        wallet_id: String,
        proposal_id: String,
        txid: String,
    },
    /// The transaction reached the network through someone else
    NewOutgoingTxByThirdParty {
        wallet_id: String,
        proposal_id: String,
        txid: String,
    },
}

impl ProposalEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ProposalEvent::NewTxProposal { .. } => "NewTxProposal",
            ProposalEvent::TxProposalAcceptedBy { .. } => "TxProposalAcceptedBy",
            ProposalEvent::TxProposalRejectedBy { .. } => "TxProposalRejectedBy",
            ProposalEvent::TxProposalFinallyAccepted { .. } => "TxProposalFinallyAccepted",
            ProposalEvent::TxProposalFinallyRejected { .. } => "TxProposalFinallyRejected",
            ProposalEvent::TxProposalRemoved { .. } => "TxProposalRemoved",
            ProposalEvent::NewOutgoingTx { .. } => "NewOutgoingTx",
            ProposalEvent::NewOutgoingTxByThirdParty { .. } => "NewOutgoingTxByThirdParty",
        }
    }
}

/// Receives committed lifecycle events
pub trait Notifier: Send + Sync {
    fn notify(&self, event: ProposalEvent);
}

/// Writes every event to the log
#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, event: ProposalEvent) {
        match serde_json::to_string(&event) {
            Ok(json) => log::info!("{}", json),
            Err(_) => log::info!("{}", event.name()),
        }
    }
}

/// Fans events out to any number of subscribers
#[derive(Debug)]
pub struct EventBroadcaster {
    sender: broadcast::Sender<ProposalEvent>,
}

impl EventBroadcaster {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProposalEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier for EventBroadcaster {
    fn notify(&self, event: ProposalEvent) {
        // Ignore send errors (no subscribers)
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn removed() -> ProposalEvent {
        ProposalEvent::TxProposalRemoved {
            wallet_id: "w1".into(),
            proposal_id: "p1".into(),
            copayer_id: "c1".into(),
        }
    }

    #[tokio::test]
    async fn test_broadcaster_fans_out() {
        let broadcaster = EventBroadcaster::new();
        let mut first = broadcaster.subscribe();
        let mut second = broadcaster.subscribe();
        assert_eq!(broadcaster.subscriber_count(), 2);

        broadcaster.notify(removed());
        assert_eq!(first.recv().await.unwrap(), removed());
        assert_eq!(second.recv().await.unwrap().name(), "TxProposalRemoved");
    }

    #[test]
    fn test_event_json_is_tagged() {
        let json = serde_json::to_value(removed()).unwrap();
        assert_eq!(json["type"], "TxProposalRemoved");
        assert_eq!(json["data"]["proposal_id"], "p1");
    }
}
