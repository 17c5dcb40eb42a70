//! Creation throttling after repeated rejections

use crate::core::config::BackoffConfig;
use crate::core::{ProposalStatus, Result, TransactionProposal, TxpError};
use chrono::{DateTime, Duration, Utc};

/// Refuses new proposals on a wallet whose latest published proposals were
/// all rejected, until a cooldown since the last rejection has passed
#[derive(Debug, Clone)]
pub struct BackoffGovernor {
    offset: u32,
    cooldown: Duration,
}

impl BackoffGovernor {
    pub fn new(config: &BackoffConfig) -> Self {
        Self {
            offset: config.offset,
            cooldown: Duration::seconds(config.cooldown_secs as i64),
        }
    }

    /// How many recent proposals `check` needs to see
    pub fn lookback(&self) -> usize {
        self.offset as usize + 1
    }

    /// `recent` holds the wallet's latest published proposals, newest first.
    ///
    /// # Errors
    /// `TxCannotCreate` while the rejected streak exceeds the offset and the
    /// cooldown has not elapsed
    pub fn check(&self, recent: &[TransactionProposal], now: DateTime<Utc>) -> Result<()> {
        let streak: Vec<&TransactionProposal> = recent
            .iter()
            .take_while(|p| p.status == ProposalStatus::Rejected)
            .collect();
        if streak.len() <= self.offset as usize {
            return Ok(());
        }

        let last_rejection = streak
            .iter()
            .map(|p| p.last_action_on().unwrap_or(p.created_on))
            .max()
            .unwrap_or(now);
        let elapsed = now - last_rejection;
        if elapsed >= self.cooldown {
            return Ok(());
        }

        let remaining_secs = (self.cooldown - elapsed).num_seconds().max(1) as u64;
        log::info!(
            "Wallet {} is backing off after {} rejected proposals ({}s left)",
            streak[0].wallet_id,
            streak.len(),
            remaining_secs
        );
        Err(TxpError::TxCannotCreate { remaining_secs })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Coin, Copayer, Network, ProposalAction, WalletPolicy};

    fn proposal(status: ProposalStatus, rejected_on: DateTime<Utc>) -> TransactionProposal {
        let policy = WalletPolicy::new(
            "w1",
            2,
            2,
            Coin::Btc,
            Network::Livenet,
            vec![
                Copayer {
                    id: "a".into(),
                    name: "a".into(),
                    request_pub_key: String::new(),
                    signing_pub_key: String::new(),
                },
                Copayer {
                    id: "b".into(),
                    name: "b".into(),
                    request_pub_key: String::new(),
                    signing_pub_key: String::new(),
                },
            ],
        )
        .unwrap();
        let mut txp =
            TransactionProposal::new("p".into(), &policy, "a", vec![], rejected_on);
        txp.status = status;
        txp.actions
            .push(ProposalAction::reject("b", None, rejected_on));
        txp
    }

    fn governor() -> BackoffGovernor {
        BackoffGovernor::new(&BackoffConfig {
            offset: 3,
            cooldown_secs: 600,
        })
    }

    #[test]
    fn test_streak_within_offset_is_allowed() {
        let now = Utc::now();
        let recent: Vec<_> = (0..3)
            .map(|_| proposal(ProposalStatus::Rejected, now))
            .collect();
        assert!(governor().check(&recent, now).is_ok());
    }

    #[test]
    fn test_streak_beyond_offset_backs_off_until_cooldown() {
        let now = Utc::now();
        let recent: Vec<_> = (0..4)
            .map(|_| proposal(ProposalStatus::Rejected, now))
            .collect();

        match governor().check(&recent, now + Duration::seconds(100)) {
            Err(TxpError::TxCannotCreate { remaining_secs }) => assert_eq!(remaining_secs, 500),
            other => panic!("unexpected {:?}", other),
        }
        assert!(governor()
            .check(&recent, now + Duration::seconds(601))
            .is_ok());
    }

    #[test]
    fn test_accepted_proposal_breaks_streak() {
        let now = Utc::now();
        let mut recent = vec![proposal(ProposalStatus::Broadcasted, now)];
        recent.extend((0..5).map(|_| proposal(ProposalStatus::Rejected, now)));
        assert!(governor().check(&recent, now).is_ok());
    }
}
