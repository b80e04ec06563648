use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use opflow_core::Clock;
use tracing::{debug, warn};

/// An exclusive, expiring hold on one claim key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub holder: String,
    /// Increases with every grant; a release or renewal carrying an older
    /// token is ignored.
    pub token: u64,
    pub expires_at: DateTime<Utc>,
    /// Set when the lease expired and a claimant asked for the key. The
    /// holder may no longer renew; the key is handed over once the holder
    /// releases it or the grace period runs out as well.
    pub revoked: bool,
}

/// Leased claims keyed by task claim key.
///
/// A holder that stops renewing loses its lease in two steps. The first
/// claimant to find the lease expired revokes it, which fails the holder's
/// next heartbeat and starts a grace period of one more lease timeout. The
/// key is granted again when the holder releases it, or when the grace period
/// also expires without a release. A stale holder's later release is a no-op.
pub struct ClaimTable {
    leases: Mutex<HashMap<String, Lease>>,
    clock: Arc<dyn Clock>,
    lease_timeout: Duration,
    next_token: AtomicU64,
}

impl std::fmt::Debug for ClaimTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClaimTable")
            .field("lease_timeout", &self.lease_timeout)
            .finish_non_exhaustive()
    }
}

impl ClaimTable {
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>, lease_timeout: Duration) -> Self {
        Self {
            leases: Mutex::new(HashMap::new()),
            clock,
            lease_timeout,
            next_token: AtomicU64::new(1),
        }
    }

    #[must_use]
    pub fn lease_timeout(&self) -> Duration {
        self.lease_timeout
    }

    /// Claim `key` for `holder` unless a live lease exists.
    pub fn try_claim(self: &Arc<Self>, key: &str, holder: &str) -> Option<ClaimGuard> {
        let now = self.clock.now();
        let mut leases = self.leases.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = leases.get_mut(key) {
            if existing.expires_at > now {
                return None;
            }
            if !existing.revoked {
                warn!(
                    key,
                    holder = %existing.holder,
                    token = existing.token,
                    "lease expired, revoking"
                );
                existing.revoked = true;
                existing.expires_at = self.expiry_from(now);
                return None;
            }
            warn!(
                key,
                stale_holder = %existing.holder,
                token = existing.token,
                "reclaiming lease from unresponsive holder"
            );
        }
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        leases.insert(
            key.to_string(),
            Lease {
                holder: holder.to_string(),
                token,
                expires_at: self.expiry_from(now),
                revoked: false,
            },
        );
        debug!(key, holder, token, "claim granted");
        Some(ClaimGuard {
            table: Arc::clone(self),
            key: key.to_string(),
            token,
        })
    }

    /// Extend the lease if `token` still holds it and it is neither expired
    /// nor revoked.
    pub fn renew(&self, key: &str, token: u64) -> bool {
        let now = self.clock.now();
        let mut leases = self.leases.lock().unwrap_or_else(PoisonError::into_inner);
        match leases.get_mut(key) {
            Some(lease) if lease.token == token && !lease.revoked && lease.expires_at > now => {
                lease.expires_at = self.expiry_from(now);
                true
            }
            _ => false,
        }
    }

    /// Drop the lease if `token` still holds it.
    pub fn release(&self, key: &str, token: u64) -> bool {
        let mut leases = self.leases.lock().unwrap_or_else(PoisonError::into_inner);
        if leases.get(key).is_some_and(|lease| lease.token == token) {
            leases.remove(key);
            debug!(key, token, "claim released");
            true
        } else {
            false
        }
    }

    #[must_use]
    pub fn lease(&self, key: &str) -> Option<Lease> {
        self.leases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Revoke expired leases and drop those whose grace period has also run
    /// out, returning how many were dropped.
    pub fn reap_expired(&self) -> usize {
        let now = self.clock.now();
        let grace = self.expiry_from(now);
        let mut leases = self.leases.lock().unwrap_or_else(PoisonError::into_inner);
        let before = leases.len();
        leases.retain(|_, lease| {
            if lease.expires_at > now {
                return true;
            }
            if lease.revoked {
                return false;
            }
            lease.revoked = true;
            lease.expires_at = grace;
            true
        });
        before - leases.len()
    }

    fn expiry_from(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.lease_timeout)
            .ok()
            .and_then(|timeout| now.checked_add_signed(timeout))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

/// Releases its lease when dropped.
#[derive(Debug)]
pub struct ClaimGuard {
    table: Arc<ClaimTable>,
    key: String,
    token: u64,
}

impl ClaimGuard {
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    #[must_use]
    pub fn token(&self) -> u64 {
        self.token
    }

    /// Heartbeat. `false` means the lease expired or passed to another
    /// holder; the caller must stop working on the key.
    pub fn renew(&self) -> bool {
        self.table.renew(&self.key, self.token)
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        self.table.release(&self.key, self.token);
    }
}

#[cfg(test)]
mod tests {
    use opflow_core::ManualClock;

    use super::*;

    fn table() -> (Arc<ClaimTable>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::fixed());
        let table = Arc::new(ClaimTable::new(clock.clone(), Duration::from_secs(30)));
        (table, clock)
    }

    #[test]
    fn live_claim_is_exclusive() {
        let (table, _) = table();

        let guard = table.try_claim("saga:1", "worker-0");

        assert!(guard.is_some());
        assert!(table.try_claim("saga:1", "worker-1").is_none());
        assert!(table.try_claim("saga:2", "worker-1").is_some());
    }

    #[test]
    fn dropping_guard_releases_claim() {
        let (table, _) = table();

        drop(table.try_claim("saga:1", "worker-0"));

        assert!(table.lease("saga:1").is_none());
        assert!(table.try_claim("saga:1", "worker-1").is_some());
    }

    #[test]
    fn unresponsive_holder_is_replaced_after_grace_period() -> anyhow::Result<()> {
        let (table, clock) = table();
        let stale = table
            .try_claim("saga:1", "worker-0")
            .ok_or_else(|| anyhow::anyhow!("first claim refused"))?;

        clock.advance(Duration::from_secs(31));
        assert!(table.try_claim("saga:1", "worker-1").is_none());
        assert!(table.lease("saga:1").is_some_and(|lease| lease.revoked));

        clock.advance(Duration::from_secs(31));
        let fresh = table
            .try_claim("saga:1", "worker-1")
            .ok_or_else(|| anyhow::anyhow!("revoked lease not reclaimable"))?;

        assert!(fresh.token() > stale.token());
        assert!(!stale.renew());
        drop(stale);
        let lease = table.lease("saga:1").expect("fresh lease survives stale release");
        assert_eq!(lease.holder, "worker-1");
        assert!(!lease.revoked);
        Ok(())
    }

    #[test]
    fn renewal_keeps_lease_alive() {
        let (table, clock) = table();
        let guard = table.try_claim("op:k", "worker-0");

        clock.advance(Duration::from_secs(20));
        assert!(guard.as_ref().is_some_and(ClaimGuard::renew));
        clock.advance(Duration::from_secs(20));

        assert!(table.try_claim("op:k", "worker-1").is_none());
    }

    #[test]
    fn revoked_holder_hands_over_on_release() -> anyhow::Result<()> {
        let (table, clock) = table();
        let holder = table
            .try_claim("saga:1", "worker-0")
            .ok_or_else(|| anyhow::anyhow!("claim refused"))?;

        clock.advance(Duration::from_secs(31));
        assert!(table.try_claim("saga:1", "worker-1").is_none());

        assert!(!holder.renew());
        assert!(table.try_claim("saga:1", "worker-1").is_none());
        drop(holder);
        assert!(table.try_claim("saga:1", "worker-1").is_some());
        Ok(())
    }

    #[test]
    fn expired_lease_cannot_be_renewed() -> anyhow::Result<()> {
        let (table, clock) = table();
        let guard = table
            .try_claim("op:k", "worker-0")
            .ok_or_else(|| anyhow::anyhow!("claim refused"))?;

        clock.advance(Duration::from_secs(31));

        assert!(!guard.renew());
        Ok(())
    }

    #[test]
    fn reap_revokes_then_drops_expired_leases() {
        let (table, clock) = table();
        let old = table.try_claim("a", "worker-0");
        clock.advance(Duration::from_secs(31));
        let young = table.try_claim("b", "worker-0");

        assert_eq!(table.reap_expired(), 0);
        assert!(table.lease("a").is_some_and(|lease| lease.revoked));
        assert!(table.lease("b").is_some_and(|lease| !lease.revoked));

        clock.advance(Duration::from_secs(31));

        assert_eq!(table.reap_expired(), 1);
        assert!(table.lease("a").is_none());
        assert!(table.lease("b").is_some_and(|lease| lease.revoked));
        drop((old, young));
    }
}
