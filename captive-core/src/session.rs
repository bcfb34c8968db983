//! Concurrent, TTL-indexed registry of admitted clients.
//!
//! Expiry is enforced on every read: a grant whose `expires_at` has passed is
//! never reported as admitted, whether or not the reaper has removed it yet.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Network-layer address used as the admission key.
pub type ClientId = Ipv4Addr;

/// Source of wall-clock time for the store.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now = expiry(*now, by);
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock() = at;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// `now + ttl`, saturating at the latest representable instant.
fn expiry(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// One admitted session.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Grant {
    pub client: ClientId,
    pub granted_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub ttl: Duration,
}

impl Grant {
    fn new(client: ClientId, now: DateTime<Utc>, ttl: Duration) -> Self {
        Grant {
            client,
            granted_at: now,
            expires_at: expiry(now, ttl),
            ttl,
        }
    }

    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }

    /// Time left before expiry, zero once expired.
    pub fn remaining_at(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Owns every live grant. Writers are serialized by the lock; readers get a
/// consistent view and never wait on I/O.
pub struct SessionStore {
    grants: RwLock<HashMap<ClientId, Grant>>,
    clock: Arc<dyn Clock>,
    sliding_ttl: bool,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock), false)
    }

    pub fn with_clock(clock: Arc<dyn Clock>, sliding_ttl: bool) -> Self {
        SessionStore {
            grants: RwLock::new(HashMap::new()),
            clock,
            sliding_ttl,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Inserts or replaces the grant for `client`.
    pub fn admit(&self, client: ClientId, ttl: Duration) -> Grant {
        let grant = Grant::new(client, self.clock.now(), ttl);
        let previous = self.grants.write().insert(client, grant.clone());
        if previous.is_some() {
            info!("Refreshed grant for {} until {}", client, grant.expires_at);
        } else {
            info!("Admitted {} until {}", client, grant.expires_at);
        }
        grant
    }

    pub fn is_admitted(&self, client: ClientId) -> bool {
        let now = self.clock.now();
        self.grants
            .read()
            .get(&client)
            .map_or(false, |grant| grant.is_live_at(now))
    }

    /// Classification read. Slides the grant forward by its own TTL when the
    /// store was built with sliding expiry.
    pub fn touch(&self, client: ClientId) -> bool {
        if !self.sliding_ttl {
            return self.is_admitted(client);
        }
        let now = self.clock.now();
        let mut grants = self.grants.write();
        match grants.get_mut(&client) {
            Some(grant) if grant.is_live_at(now) => {
                grant.expires_at = expiry(now, grant.ttl);
                true
            }
            _ => false,
        }
    }

    /// Removes the grant for `client`, reporting whether one existed.
    pub fn revoke(&self, client: ClientId) -> bool {
        let removed = self.grants.write().remove(&client).is_some();
        if removed {
            info!("Revoked grant for {}", client);
        }
        removed
    }

    /// Moves the expiry of a live grant to `now + ttl`.
    pub fn extend(&self, client: ClientId, ttl: Duration) -> Option<Grant> {
        let now = self.clock.now();
        let mut grants = self.grants.write();
        let grant = grants.get_mut(&client).filter(|g| g.is_live_at(now))?;
        grant.ttl = ttl;
        grant.expires_at = expiry(now, ttl);
        info!("Extended grant for {} until {}", client, grant.expires_at);
        Some(grant.clone())
    }

    pub fn get(&self, client: ClientId) -> Option<Grant> {
        let now = self.clock.now();
        self.grants
            .read()
            .get(&client)
            .filter(|g| g.is_live_at(now))
            .cloned()
    }

    /// The currently admitted set.
    pub fn snapshot(&self) -> BTreeSet<ClientId> {
        let now = self.clock.now();
        self.grants
            .read()
            .values()
            .filter(|g| g.is_live_at(now))
            .map(|g| g.client)
            .collect()
    }

    /// Live grants ordered by client address.
    pub fn grants(&self) -> Vec<Grant> {
        let now = self.clock.now();
        let mut live: Vec<Grant> = self
            .grants
            .read()
            .values()
            .filter(|g| g.is_live_at(now))
            .cloned()
            .collect();
        live.sort_by_key(|g| g.client);
        live
    }

    /// Physically removes expired grants and returns them.
    pub fn reap_expired(&self) -> Vec<Grant> {
        let now = self.clock.now();
        let mut grants = self.grants.write();
        let expired: Vec<ClientId> = grants
            .values()
            .filter(|g| !g.is_live_at(now))
            .map(|g| g.client)
            .collect();
        let mut removed = Vec::with_capacity(expired.len());
        for client in expired {
            if let Some(grant) = grants.remove(&client) {
                debug!("Reaping expired grant for {}", client);
                removed.push(grant);
            }
        }
        removed
    }

    /// Number of stored grants, including expired ones not yet reaped.
    pub fn len(&self) -> usize {
        self.grants.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.grants.read().is_empty()
    }
}
