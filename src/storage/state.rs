//! Datastore state and its atomic operations
//!
//! Every method here runs under the owning store's mutex, which is what
//! makes the conditional writes atomic.

use super::{AppendOutcome, LeaseGrant, StatusPatch};
use crate::core::{
    ProposalAction, ProposalStatus, TransactionProposal, WalletAddress, WalletPolicy,
};
use crate::crypto::multisig_address;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletRecord {
    pub policy: WalletPolicy,
    #[serde(default)]
    pub addresses: Vec<WalletAddress>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredProposal {
    /// Insertion order, breaks ties between equal creation times
    seq: u64,
    proposal: TransactionProposal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Everything a store holds
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreState {
    wallets: HashMap<String, WalletRecord>,
    proposals: HashMap<String, StoredProposal>,
    leases: HashMap<String, Lease>,
    next_seq: u64,
}

fn proposal_key(wallet_id: &str, proposal_id: &str) -> String {
    format!("{}/{}", wallet_id, proposal_id)
}

impl StoreState {
    pub fn insert_wallet(&mut self, policy: WalletPolicy, addresses: Vec<WalletAddress>) {
        self.wallets
            .insert(policy.id.clone(), WalletRecord { policy, addresses });
    }

    pub fn wallet(&self, wallet_id: &str) -> Option<&WalletRecord> {
        self.wallets.get(wallet_id)
    }

    /// Derive and record the next change address of a wallet
    pub fn create_change_address(&mut self, wallet_id: &str) -> Option<WalletAddress> {
        let record = self.wallets.get_mut(wallet_id)?;
        let index = record.addresses.iter().filter(|a| a.is_change).count();
        let path = format!("m/1/{}", index);
        let address = WalletAddress {
            address: multisig_address(
                record.policy.m,
                &record.policy.signing_keys(),
                &path,
                record.policy.network,
            ),
            path,
            is_change: true,
        };
        record.addresses.push(address.clone());
        Some(address)
    }

    pub fn proposal(&self, wallet_id: &str, proposal_id: &str) -> Option<&TransactionProposal> {
        self.proposals
            .get(&proposal_key(wallet_id, proposal_id))
            .map(|stored| &stored.proposal)
    }

    /// Proposals of a wallet matching `filter`, newest first
    pub fn proposals_where(
        &self,
        wallet_id: &str,
        filter: impl Fn(&TransactionProposal) -> bool,
    ) -> Vec<TransactionProposal> {
        let mut matching: Vec<&StoredProposal> = self
            .proposals
            .values()
            .filter(|s| s.proposal.wallet_id == wallet_id && filter(&s.proposal))
            .collect();
        matching.sort_by(|a, b| {
            b.proposal
                .created_on
                .cmp(&a.proposal.created_on)
                .then(b.seq.cmp(&a.seq))
        });
        matching.into_iter().map(|s| s.proposal.clone()).collect()
    }

    pub fn locked_inputs(&self, wallet_id: &str) -> HashSet<String> {
        self.proposals
            .values()
            .map(|s| &s.proposal)
            .filter(|p| p.wallet_id == wallet_id && p.status.locks_inputs())
            .flat_map(|p| p.outpoints())
            .collect()
    }

    /// Insert unless a proposal with the same id exists in the wallet
    pub fn create_proposal(&mut self, proposal: TransactionProposal) -> bool {
        let key = proposal_key(&proposal.wallet_id, &proposal.id);
        if self.proposals.contains_key(&key) {
            return false;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.proposals.insert(key, StoredProposal { seq, proposal });
        true
    }

    pub fn append_action(
        &mut self,
        wallet_id: &str,
        proposal_id: &str,
        action: ProposalAction,
    ) -> AppendOutcome {
        let Some(stored) = self.proposals.get_mut(&proposal_key(wallet_id, proposal_id)) else {
            return AppendOutcome::NotFound;
        };
        let proposal = &mut stored.proposal;
        if proposal.action_by(&action.copayer_id).is_some() {
            return AppendOutcome::AlreadyVoted;
        }
        if proposal.status != ProposalStatus::Pending {
            return AppendOutcome::NotPending;
        }
        proposal.actions.push(action);
        AppendOutcome::Appended(proposal.clone())
    }

    /// Compare-and-set on status, patching only status-owned fields
    pub fn transition_status(
        &mut self,
        wallet_id: &str,
        proposal_id: &str,
        from: ProposalStatus,
        to: ProposalStatus,
        patch: StatusPatch,
    ) -> Option<TransactionProposal> {
        let stored = self.proposals.get_mut(&proposal_key(wallet_id, proposal_id))?;
        let proposal = &mut stored.proposal;
        if proposal.status != from {
            return None;
        }
        proposal.status = to;
        if let Some(signature) = patch.proposal_signature {
            proposal.proposal_signature = Some(signature);
        }
        if let Some(raw_tx) = patch.raw_tx {
            proposal.raw_tx = Some(raw_tx);
        }
        if let Some(txid) = patch.txid {
            proposal.txid = Some(txid);
        }
        if let Some(broadcasted_on) = patch.broadcasted_on {
            proposal.broadcasted_on = Some(broadcasted_on);
        }
        Some(proposal.clone())
    }

    /// Remove while the status is one of `allowed` and no action arrived
    /// since the caller last looked
    pub fn remove_proposal(
        &mut self,
        wallet_id: &str,
        proposal_id: &str,
        allowed: &[ProposalStatus],
        expected_actions: usize,
    ) -> bool {
        let key = proposal_key(wallet_id, proposal_id);
        let removable = self
            .proposals
            .get(&key)
            .map(|s| {
                allowed.contains(&s.proposal.status)
                    && s.proposal.actions.len() == expected_actions
            })
            .unwrap_or(false);
        if removable {
            self.proposals.remove(&key);
        }
        removable
    }

    pub fn try_acquire_lease(
        &mut self,
        key: &str,
        token: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> LeaseGrant {
        let grant = match self.leases.get(key) {
            None => LeaseGrant::Acquired,
            Some(lease) if lease.token == token => LeaseGrant::Acquired,
            Some(lease) if lease.expires_at <= now => LeaseGrant::Reclaimed {
                previous_token: lease.token.clone(),
            },
            Some(lease) => {
                return LeaseGrant::Held {
                    expires_at: lease.expires_at,
                }
            }
        };
        self.leases.insert(
            key.to_string(),
            Lease {
                token: token.to_string(),
                expires_at: now + ttl,
            },
        );
        grant
    }

    /// Push the expiry of a lease still held by `token`
    pub fn renew_lease(
        &mut self,
        key: &str,
        token: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> bool {
        match self.leases.get_mut(key) {
            Some(lease) if lease.token == token => {
                lease.expires_at = now + ttl;
                true
            }
            _ => false,
        }
    }

    pub fn release_lease(&mut self, key: &str, token: &str) -> bool {
        match self.leases.get(key) {
            Some(lease) if lease.token == token => {
                self.leases.remove(key);
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Coin, Copayer, Network, ProposalInput, ProposalOutput};

    fn policy() -> WalletPolicy {
        let copayers = ["a", "b", "c"]
            .iter()
            .map(|id| Copayer {
                id: id.to_string(),
                name: id.to_string(),
                request_pub_key: String::new(),
                signing_pub_key: format!("key-{}", id),
            })
            .collect();
        WalletPolicy::new("w1", 2, 3, Coin::Btc, Network::Livenet, copayers).unwrap()
    }

    fn proposal(id: &str, status: ProposalStatus, outpoint_txid: &str) -> TransactionProposal {
        let mut txp = TransactionProposal::new(
            id.to_string(),
            &policy(),
            "a",
            vec![ProposalOutput {
                to_address: "dest".into(),
                amount: 1,
                message: None,
            }],
            Utc::now(),
        );
        txp.status = status;
        txp.inputs = vec![ProposalInput {
            txid: outpoint_txid.to_string(),
            vout: 0,
            address: "src".into(),
            satoshis: 10,
            path: "m/0/0".into(),
            confirmations: 1,
        }];
        txp
    }

    #[test]
    fn test_insert_if_absent() {
        let mut state = StoreState::default();
        assert!(state.create_proposal(proposal("p1", ProposalStatus::Temporary, "aa")));
        assert!(!state.create_proposal(proposal("p1", ProposalStatus::Pending, "bb")));
        assert_eq!(
            state.proposal("w1", "p1").unwrap().status,
            ProposalStatus::Temporary
        );
        assert!(state.proposal("w2", "p1").is_none());
    }

    #[test]
    fn test_locked_inputs_follow_status() {
        let mut state = StoreState::default();
        state.create_proposal(proposal("t", ProposalStatus::Temporary, "aa"));
        state.create_proposal(proposal("p", ProposalStatus::Pending, "bb"));
        state.create_proposal(proposal("r", ProposalStatus::Rejected, "cc"));
        state.create_proposal(proposal("b", ProposalStatus::Broadcasted, "dd"));

        let locked = state.locked_inputs("w1");
        assert_eq!(locked.len(), 2);
        assert!(locked.contains("bb:0"));
        assert!(locked.contains("dd:0"));
    }

    #[test]
    fn test_append_is_conditional() {
        let mut state = StoreState::default();
        state.create_proposal(proposal("p", ProposalStatus::Pending, "aa"));
        state.create_proposal(proposal("t", ProposalStatus::Temporary, "bb"));
        let now = Utc::now();

        assert!(matches!(
            state.append_action("w1", "p", ProposalAction::reject("b", None, now)),
            AppendOutcome::Appended(_)
        ));
        assert!(matches!(
            state.append_action("w1", "p", ProposalAction::accept("b", vec![], now)),
            AppendOutcome::AlreadyVoted
        ));
        assert!(matches!(
            state.append_action("w1", "t", ProposalAction::accept("b", vec![], now)),
            AppendOutcome::NotPending
        ));
        assert!(matches!(
            state.append_action("w1", "zz", ProposalAction::accept("b", vec![], now)),
            AppendOutcome::NotFound
        ));
    }

    #[test]
    fn test_transition_is_compare_and_set() {
        let mut state = StoreState::default();
        state.create_proposal(proposal("p", ProposalStatus::Pending, "aa"));
        state.append_action(
            "w1",
            "p",
            ProposalAction::accept("b", vec![], Utc::now()),
        );

        let patch = StatusPatch {
            raw_tx: Some("00".into()),
            ..Default::default()
        };
        let accepted = state
            .transition_status(
                "w1",
                "p",
                ProposalStatus::Pending,
                ProposalStatus::Accepted,
                patch.clone(),
            )
            .unwrap();
        assert_eq!(accepted.raw_tx.as_deref(), Some("00"));
        // actions appended earlier survive the transition
        assert_eq!(accepted.actions.len(), 1);

        assert!(state
            .transition_status(
                "w1",
                "p",
                ProposalStatus::Pending,
                ProposalStatus::Rejected,
                StatusPatch::default()
            )
            .is_none());
    }

    #[test]
    fn test_remove_checks_status_and_actions() {
        let mut state = StoreState::default();
        state.create_proposal(proposal("p", ProposalStatus::Pending, "aa"));
        let open = [ProposalStatus::Pending, ProposalStatus::Accepted];

        assert!(!state.remove_proposal("w1", "p", &open, 1));
        assert!(!state.remove_proposal("w1", "p", &[ProposalStatus::Accepted], 0));
        assert!(state.remove_proposal("w1", "p", &open, 0));
        assert!(state.proposal("w1", "p").is_none());
    }

    #[test]
    fn test_lease_lifecycle() {
        let mut state = StoreState::default();
        let now = Utc::now();
        let ttl = Duration::seconds(40);

        assert_eq!(
            state.try_acquire_lease("w1", "t1", now, ttl),
            LeaseGrant::Acquired
        );
        assert!(matches!(
            state.try_acquire_lease("w1", "t2", now, ttl),
            LeaseGrant::Held { .. }
        ));
        assert!(!state.release_lease("w1", "t2"));

        let later = now + Duration::seconds(41);
        assert_eq!(
            state.try_acquire_lease("w1", "t2", later, ttl),
            LeaseGrant::Reclaimed {
                previous_token: "t1".into()
            }
        );
        // the reclaimed holder can no longer release
        assert!(!state.release_lease("w1", "t1"));
        assert!(state.release_lease("w1", "t2"));
    }

    #[test]
    fn test_renewal_requires_current_token() {
        let mut state = StoreState::default();
        let now = Utc::now();
        let ttl = Duration::seconds(40);

        state.try_acquire_lease("w1", "t1", now, ttl);
        assert!(state.renew_lease("w1", "t1", now + Duration::seconds(30), ttl));
        // renewed expiry is now + 70s
        assert!(matches!(
            state.try_acquire_lease("w1", "t2", now + Duration::seconds(60), ttl),
            LeaseGrant::Held { .. }
        ));

        state.try_acquire_lease("w1", "t2", now + Duration::seconds(71), ttl);
        assert!(!state.renew_lease("w1", "t1", now + Duration::seconds(72), ttl));
        assert!(!state.renew_lease("w2", "t1", now, ttl));
    }

    #[test]
    fn test_change_addresses_are_sequential() {
        let mut state = StoreState::default();
        state.insert_wallet(policy(), vec![]);
        let first = state.create_change_address("w1").unwrap();
        let second = state.create_change_address("w1").unwrap();
        assert_eq!(first.path, "m/1/0");
        assert_eq!(second.path, "m/1/1");
        assert_ne!(first.address, second.address);
        assert!(state.create_change_address("nope").is_none());
    }
}
