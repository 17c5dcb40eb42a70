//! Per-wallet locking
//!
//! Proposal creation and publishing are read-then-write sequences over a
//! wallet's fund pool. They are serialized by a lease (token + TTL) held in
//! the shared datastore, so the exclusion holds across engine replicas and a
//! crashed holder only stalls a wallet until its lease expires.
//!
//! A holder renews its lease while it works. If a renewal finds the lease
//! reclaimed, the work is abandoned before it can commit.
//!
//! Which inputs are reserved is never cached: it is derived from proposal
//! status in the datastore on every read.

use crate::core::config::LockConfig;
use crate::core::{Clock, Result, TxpError};
use crate::storage::{LeaseGrant, Storage};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use tokio::time::Instant;

/// Releases a lease whose holder never got to release it (panic or
/// cancellation), on a task of the current runtime
struct LeaseGuard {
    storage: Arc<dyn Storage>,
    key: String,
    token: String,
    armed: bool,
}

impl LeaseGuard {
    fn new(storage: Arc<dyn Storage>, lease: &WalletLease) -> Self {
        Self {
            storage,
            key: lease.key.clone(),
            token: lease.token.clone(),
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let storage = self.storage.clone();
        let key = std::mem::take(&mut self.key);
        let token = std::mem::take(&mut self.token);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                log::warn!("Lease {} abandoned by its holder, releasing", key);
                handle.spawn(async move {
                    if let Err(e) = storage.release_lease(&key, &token).await {
                        log::error!("Failed to release abandoned lease {}: {}", key, e);
                    }
                });
            }
            Err(_) => log::warn!("Lease {} abandoned, it expires after its TTL", key),
        }
    }
}

/// A held wallet lease
#[derive(Debug)]
pub struct WalletLease {
    wallet_id: String,
    key: String,
    token: String,
}

impl WalletLease {
    pub fn wallet_id(&self) -> &str {
        &self.wallet_id
    }
}

pub struct LockCoordinator {
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
    config: LockConfig,
}

impl LockCoordinator {
    pub fn new(storage: Arc<dyn Storage>, clock: Arc<dyn Clock>, config: LockConfig) -> Self {
        Self {
            storage,
            clock,
            config,
        }
    }

    fn lease_key(wallet_id: &str) -> String {
        format!("txp-lock:{}", wallet_id)
    }

    /// Acquire the wallet lease, waiting at most the configured time.
    ///
    /// # Errors
    /// `LockTimeout` if another holder keeps the lease for the whole wait
    pub async fn acquire(&self, wallet_id: &str) -> Result<WalletLease> {
        let key = Self::lease_key(wallet_id);
        let token = hex::encode(rand::random::<[u8; 16]>());
        let ttl = chrono::Duration::seconds(self.config.ttl_secs as i64);
        let deadline = Instant::now() + self.config.wait();

        loop {
            let grant = self
                .storage
                .try_acquire_lease(&key, &token, self.clock.now(), ttl)
                .await?;

            match grant {
                LeaseGrant::Acquired => {
                    log::debug!("Acquired lease for wallet {}", wallet_id);
                }
                LeaseGrant::Reclaimed { previous_token } => {
                    log::warn!(
                        "Reclaimed expired lease {} for wallet {}",
                        previous_token,
                        wallet_id
                    );
                }
                LeaseGrant::Held { expires_at } => {
                    if Instant::now() >= deadline {
                        log::warn!(
                            "Timed out waiting for wallet {} lease (held until {})",
                            wallet_id,
                            expires_at
                        );
                        return Err(TxpError::LockTimeout(wallet_id.to_string()));
                    }
                    tokio::time::sleep(self.config.retry_interval()).await;
                    continue;
                }
            }

            return Ok(WalletLease {
                wallet_id: wallet_id.to_string(),
                key,
                token,
            });
        }
    }

    /// Release a lease. A lease that expired and was reclaimed meanwhile is
    /// left to its new holder.
    pub async fn release(&self, lease: WalletLease) -> Result<()> {
        let released = self.storage.release_lease(&lease.key, &lease.token).await?;
        if released {
            log::debug!("Released lease for wallet {}", lease.wallet_id);
        } else {
            log::warn!(
                "Lease for wallet {} expired before release",
                lease.wallet_id
            );
        }
        Ok(())
    }

    /// Run `f` while holding the wallet lease, renewing it as long as `f`
    /// runs. The lease is released whether `f` succeeds, fails, panics or
    /// is dropped.
    ///
    /// # Errors
    /// `LockTimeout` if the lease could not be acquired, or was lost to
    /// another holder while `f` ran (`f` is then dropped unfinished)
    pub async fn with_lock<T, F, Fut>(&self, wallet_id: &str, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let lease = self.acquire(wallet_id).await?;
        let mut guard = LeaseGuard::new(self.storage.clone(), &lease);

        let result = tokio::select! {
            result = f() => result,
            lost = self.keep_alive(&lease) => Err(lost),
        };

        guard.disarm();
        if let Err(e) = self.release(lease).await {
            log::error!("Failed to release lease for wallet {}: {}", wallet_id, e);
        }
        result
    }

    /// Renew `lease` until it is found reclaimed; only returns then
    async fn keep_alive(&self, lease: &WalletLease) -> TxpError {
        let ttl = chrono::Duration::seconds(self.config.ttl_secs as i64);
        loop {
            tokio::time::sleep(self.config.renew_interval()).await;
            match self
                .storage
                .renew_lease(&lease.key, &lease.token, self.clock.now(), ttl)
                .await
            {
                Ok(true) => log::debug!("Renewed lease for wallet {}", lease.wallet_id),
                Ok(false) => {
                    log::warn!(
                        "Lease for wallet {} was reclaimed, abandoning work",
                        lease.wallet_id
                    );
                    return TxpError::LockTimeout(lease.wallet_id.clone());
                }
                Err(e) => log::warn!(
                    "Failed to renew lease for wallet {}: {}",
                    lease.wallet_id,
                    e
                ),
            }
        }
    }

    /// Outpoints currently reserved by proposals of the wallet
    pub async fn locked_inputs(&self, wallet_id: &str) -> Result<HashSet<String>> {
        Ok(self.storage.fetch_locked_inputs(wallet_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ManualClock;
    use crate::storage::MemoryStorage;

    fn coordinator(wait_secs: u64) -> (LockCoordinator, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let config = LockConfig {
            wait_secs,
            ttl_secs: 40,
            retry_interval_ms: 5,
        };
        let coordinator =
            LockCoordinator::new(Arc::new(MemoryStorage::new()), clock.clone(), config);
        (coordinator, clock)
    }

    /// Two coordinators sharing a store, as two replicas would, with a
    /// short TTL so renewals happen every second
    fn replicas() -> (LockCoordinator, LockCoordinator, Arc<ManualClock>) {
        let storage = Arc::new(MemoryStorage::new());
        let clock = Arc::new(ManualClock::default());
        let config = LockConfig {
            wait_secs: 0,
            ttl_secs: 3,
            retry_interval_ms: 5,
        };
        let a = LockCoordinator::new(storage.clone(), clock.clone(), config.clone());
        let b = LockCoordinator::new(storage, clock.clone(), config);
        (a, b, clock)
    }

    #[tokio::test]
    async fn test_exclusive_until_released() {
        let (locks, _clock) = coordinator(0);

        let lease = locks.acquire("w1").await.unwrap();
        assert_eq!(lease.wallet_id(), "w1");
        assert!(matches!(
            locks.acquire("w1").await,
            Err(TxpError::LockTimeout(_))
        ));
        // other wallets are independent
        let other = locks.acquire("w2").await.unwrap();

        locks.release(lease).await.unwrap();
        locks.release(other).await.unwrap();
        assert!(locks.acquire("w1").await.is_ok());
    }

    #[tokio::test]
    async fn test_expired_lease_is_reclaimed() {
        let (locks, clock) = coordinator(0);

        let stale = locks.acquire("w1").await.unwrap();
        clock.advance_secs(41);
        let fresh = locks.acquire("w1").await.unwrap();

        // the stale holder's release must not free the new lease
        locks.release(stale).await.unwrap();
        assert!(locks.acquire("w1").await.is_err());
        locks.release(fresh).await.unwrap();
    }

    #[tokio::test]
    async fn test_with_lock_releases_on_error() {
        let (locks, _clock) = coordinator(0);

        let result: Result<()> = locks
            .with_lock("w1", || async { Err(TxpError::InsufficientFunds) })
            .await;
        assert!(matches!(result, Err(TxpError::InsufficientFunds)));

        let value = locks.with_lock("w1", || async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_waiter_gets_lease_after_release() {
        let (locks, _clock) = coordinator(2);
        let locks = Arc::new(locks);

        let lease = locks.acquire("w1").await.unwrap();
        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move { locks.acquire("w1").await.map(|l| l.wallet_id().to_string()) })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        locks.release(lease).await.unwrap();

        assert_eq!(waiter.await.unwrap().unwrap(), "w1");
    }

    #[tokio::test]
    async fn test_panicking_holder_releases_lease() {
        let (locks, _clock) = coordinator(2);
        let locks = Arc::new(locks);

        let holder = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let result: Result<()> = locks
                    .with_lock("w1", || async {
                        let failed = true;
                        if failed {
                            panic!("holder failed");
                        }
                        Ok(())
                    })
                    .await;
                result
            })
        };
        assert!(holder.await.is_err());

        let lease = locks.acquire("w1").await.unwrap();
        locks.release(lease).await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_holder_releases_lease() {
        let (locks, _clock) = coordinator(2);

        let slow = locks.with_lock("w1", || async {
            tokio::time::sleep(std::time::Duration::from_secs(30)).await;
            Ok(())
        });
        let timed_out =
            tokio::time::timeout(std::time::Duration::from_millis(20), slow).await;
        assert!(timed_out.is_err());

        let lease = locks.acquire("w1").await.unwrap();
        locks.release(lease).await.unwrap();
    }

    #[tokio::test]
    async fn test_lease_is_renewed_while_held() {
        let (locks, rival, clock) = replicas();

        let value = locks
            .with_lock("w1", || async {
                clock.advance_secs(2);
                tokio::time::sleep(std::time::Duration::from_millis(1_500)).await;
                // past the first expiry, but renewed meanwhile
                clock.advance_secs(2);
                assert!(matches!(
                    rival.acquire("w1").await,
                    Err(TxpError::LockTimeout(_))
                ));
                Ok(7)
            })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_lost_lease_abandons_work() {
        let (locks, rival, clock) = replicas();

        let result: Result<()> = locks
            .with_lock("w1", || async {
                clock.advance_secs(10);
                let _reclaimed = rival.acquire("w1").await.unwrap();
                tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(TxpError::LockTimeout(_))));

        // the new holder keeps its lease
        assert!(matches!(
            locks.acquire("w1").await,
            Err(TxpError::LockTimeout(_))
        ));
    }
}
