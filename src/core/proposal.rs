//! Transaction proposals
//!
//! A proposal is the unit of multi-party agreement: its content is built by
//! the server, its acceptance or rejection is derived by counting the
//! append-only action log against the wallet's quorum thresholds.

use crate::chain::TemplateOutput;
use crate::core::utxo::{outpoint, Utxo};
use crate::core::{Coin, Network, WalletPolicy};
use crate::crypto::sha256;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Status of a proposal. Transitions only move forward:
/// `temporary -> pending -> accepted -> broadcasted`, `pending -> rejected`.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ProposalStatus {
    /// Built by the server, not yet published by its creator
    Temporary,
    /// Published, collecting actions
    Pending,
    /// Quorum of signatures reached, raw transaction assembled
    Accepted,
    /// Quorum can no longer be reached
    Rejected,
    /// Sent to the network
    Broadcasted,
}

impl ProposalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProposalStatus::Temporary => "temporary",
            ProposalStatus::Pending => "pending",
            ProposalStatus::Accepted => "accepted",
            ProposalStatus::Rejected => "rejected",
            ProposalStatus::Broadcasted => "broadcasted",
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(self, ProposalStatus::Rejected | ProposalStatus::Broadcasted)
    }

    /// Published and not yet terminal
    pub fn is_open(&self) -> bool {
        matches!(self, ProposalStatus::Pending | ProposalStatus::Accepted)
    }

    /// Inputs of proposals in this status are reserved
    pub fn locks_inputs(&self) -> bool {
        matches!(
            self,
            ProposalStatus::Pending | ProposalStatus::Accepted | ProposalStatus::Broadcasted
        )
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ActionType {
    Accept,
    Reject,
}

/// One copayer's vote on a proposal
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ProposalAction {
    pub copayer_id: String,
    pub action_type: ActionType,
    /// Per-input signatures (hex) for accept actions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signatures: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    pub created_on: DateTime<Utc>,
}

impl ProposalAction {
    pub fn accept(copayer_id: &str, signatures: Vec<String>, now: DateTime<Utc>) -> Self {
        Self {
            copayer_id: copayer_id.to_string(),
            action_type: ActionType::Accept,
            signatures: Some(signatures),
            comment: None,
            created_on: now,
        }
    }

    pub fn reject(copayer_id: &str, comment: Option<String>, now: DateTime<Utc>) -> Self {
        Self {
            copayer_id: copayer_id.to_string(),
            action_type: ActionType::Reject,
            signatures: None,
            comment,
            created_on: now,
        }
    }
}

/// A requested payment
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProposalOutput {
    pub to_address: String,
    pub amount: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// A selected input
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProposalInput {
    pub txid: String,
    pub vout: u32,
    pub address: String,
    pub satoshis: u64,
    pub path: String,
    #[serde(default)]
    pub confirmations: u32,
}

impl ProposalInput {
    pub fn outpoint(&self) -> String {
        outpoint(&self.txid, self.vout)
    }
}

impl From<&Utxo> for ProposalInput {
    fn from(utxo: &Utxo) -> Self {
        Self {
            txid: utxo.txid.clone(),
            vout: utxo.vout,
            address: utxo.address.clone(),
            satoshis: utxo.satoshis,
            path: utxo.path.clone(),
            confirmations: utxo.confirmations,
        }
    }
}

/// A transaction proposal
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TransactionProposal {
    pub id: String,
    pub wallet_id: String,
    pub creator_id: String,
    pub created_on: DateTime<Utc>,
    pub coin: Coin,
    pub network: Network,
    pub status: ProposalStatus,

    pub outputs: Vec<ProposalOutput>,
    /// Permutation over `outputs` plus the change output (index `outputs.len()`)
    pub output_order: Vec<usize>,
    pub inputs: Vec<ProposalInput>,
    /// Sending address for account-based coins
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fee_level: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fee_per_kb: Option<u64>,
    pub fee: u64,
    /// `None` for single-address wallets (change returns to the first input
    /// address) and for proposals without change
    #[serde(default)]
    pub change_address: Option<String>,
    #[serde(default)]
    pub change_amount: u64,
    #[serde(default)]
    pub send_max: bool,
    #[serde(default)]
    pub exclude_unconfirmed_utxos: bool,

    pub required_signatures: u8,
    pub required_rejections: u8,
    #[serde(default)]
    pub actions: Vec<ProposalAction>,

    /// Creator's signature over the server-built content, set at publish
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proposal_signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_tx: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub txid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broadcasted_on: Option<DateTime<Utc>>,
    /// Seconds until anyone may remove the proposal; filled on listing
    #[serde(default)]
    pub delete_lock_time: u64,
}

/// The part of a proposal the creator signs at publish time
#[derive(Serialize)]
struct SignedContent<'a> {
    id: &'a str,
    wallet_id: &'a str,
    creator_id: &'a str,
    coin: Coin,
    network: Network,
    outputs: &'a [ProposalOutput],
    output_order: &'a [usize],
    inputs: Vec<(String, u64)>,
    from_address: &'a Option<String>,
    message: &'a Option<String>,
    fee: u64,
    change_address: &'a Option<String>,
    change_amount: u64,
}

impl TransactionProposal {
    /// Create an empty temporary proposal for a wallet
    pub fn new(
        id: String,
        policy: &WalletPolicy,
        creator_id: &str,
        outputs: Vec<ProposalOutput>,
        created_on: DateTime<Utc>,
    ) -> Self {
        let output_order = (0..outputs.len()).collect();
        Self {
            id,
            wallet_id: policy.id.clone(),
            creator_id: creator_id.to_string(),
            created_on,
            coin: policy.coin,
            network: policy.network,
            status: ProposalStatus::Temporary,
            outputs,
            output_order,
            inputs: Vec::new(),
            from_address: None,
            message: None,
            fee_level: None,
            fee_per_kb: None,
            fee: 0,
            change_address: None,
            change_amount: 0,
            send_max: false,
            exclude_unconfirmed_utxos: false,
            required_signatures: policy.required_signatures(),
            required_rejections: policy.required_rejections(),
            actions: Vec::new(),
            proposal_signature: None,
            raw_tx: None,
            txid: None,
            broadcasted_on: None,
            delete_lock_time: 0,
        }
    }

    /// Server-generated id: time-ordered prefix plus random suffix
    pub fn generate_id(wallet_id: &str, creator_id: &str, now: DateTime<Utc>) -> String {
        let nonce: [u8; 8] = rand::random();
        let id_data = format!(
            "{}{}{}{}",
            wallet_id,
            creator_id,
            now.timestamp_nanos_opt().unwrap_or(0),
            hex::encode(nonce)
        );
        format!(
            "{:013}-{}",
            now.timestamp_millis(),
            hex::encode(&sha256(id_data.as_bytes())[..12])
        )
    }

    /// Sum of requested output amounts
    pub fn amount(&self) -> u64 {
        self.outputs.iter().map(|o| o.amount).sum()
    }

    pub fn input_total(&self) -> u64 {
        self.inputs.iter().map(|i| i.satoshis).sum()
    }

    /// `sum(outputs) + fee == sum(inputs) - change` (input-less proposals of
    /// account-based coins are trivially balanced)
    pub fn is_balanced(&self) -> bool {
        self.inputs.is_empty()
            || self.amount() + self.fee + self.change_amount == self.input_total()
    }

    pub fn outpoints(&self) -> Vec<String> {
        self.inputs.iter().map(|i| i.outpoint()).collect()
    }

    /// Outputs in transaction order, change included
    pub fn ordered_outputs(&self) -> Vec<TemplateOutput> {
        self.output_order
            .iter()
            .filter_map(|&i| {
                if let Some(output) = self.outputs.get(i) {
                    Some(TemplateOutput {
                        address: output.to_address.clone(),
                        amount: output.amount,
                    })
                } else if i == self.outputs.len() && self.change_amount > 0 {
                    let address = self
                        .change_address
                        .clone()
                        .or_else(|| self.inputs.first().map(|input| input.address.clone()))?;
                    Some(TemplateOutput {
                        address,
                        amount: self.change_amount,
                    })
                } else {
                    None
                }
            })
            .collect()
    }

    /// Hash of the server-built content the creator signs when publishing
    pub fn signing_hash(&self) -> Vec<u8> {
        let content = SignedContent {
            id: &self.id,
            wallet_id: &self.wallet_id,
            creator_id: &self.creator_id,
            coin: self.coin,
            network: self.network,
            outputs: &self.outputs,
            output_order: &self.output_order,
            inputs: self
                .inputs
                .iter()
                .map(|i| (i.outpoint(), i.satoshis))
                .collect(),
            from_address: &self.from_address,
            message: &self.message,
            fee: self.fee,
            change_address: &self.change_address,
            change_amount: self.change_amount,
        };
        // Serializing plain structs of strings and integers cannot fail
        let bytes = serde_json::to_vec(&content).unwrap_or_default();
        sha256(&bytes)
    }

    // =========================================================================
    // Quorum
    // =========================================================================

    pub fn action_by(&self, copayer_id: &str) -> Option<&ProposalAction> {
        self.actions.iter().find(|a| a.copayer_id == copayer_id)
    }

    pub fn accept_actions(&self) -> impl Iterator<Item = &ProposalAction> {
        self.actions
            .iter()
            .filter(|a| a.action_type == ActionType::Accept)
    }

    pub fn accept_count(&self) -> usize {
        self.accept_actions().count()
    }

    pub fn reject_count(&self) -> usize {
        self.actions
            .iter()
            .filter(|a| a.action_type == ActionType::Reject)
            .count()
    }

    pub fn is_accepted(&self) -> bool {
        self.accept_count() >= self.required_signatures as usize
    }

    pub fn is_rejected(&self) -> bool {
        self.reject_count() >= self.required_rejections as usize
    }

    /// Time of the most recent action, if any
    pub fn last_action_on(&self) -> Option<DateTime<Utc>> {
        self.actions.iter().map(|a| a.created_on).max()
    }

    // =========================================================================
    // Removal
    // =========================================================================

    /// Most recent action by a copayer other than the creator
    fn last_foreign_action_on(&self) -> Option<DateTime<Utc>> {
        self.actions
            .iter()
            .filter(|a| a.copayer_id != self.creator_id)
            .map(|a| a.created_on)
            .max()
    }

    /// Seconds left before anyone may remove this proposal
    pub fn remaining_delete_lock_secs(&self, now: DateTime<Utc>, delete_lock: Duration) -> u64 {
        match self.last_foreign_action_on() {
            Some(acted_on) => {
                let unlock = acted_on + delete_lock;
                (unlock - now).num_seconds().max(0) as u64
            }
            None => 0,
        }
    }

    /// Creator may remove until another copayer acts; after that, anyone may
    /// once the delete lock since that action has elapsed
    pub fn can_be_removed_by(
        &self,
        copayer_id: &str,
        now: DateTime<Utc>,
        delete_lock: Duration,
    ) -> bool {
        match self.last_foreign_action_on() {
            None => copayer_id == self.creator_id,
            Some(acted_on) => now >= acted_on + delete_lock,
        }
    }
}
