use captive_core::SessionStore;
use captive_net::RuleSynchronizer;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// Removes every expired grant and retracts its rule. Returns how many grants
/// were reaped.
pub async fn reap_once(store: &SessionStore, sync: &RuleSynchronizer) -> usize {
    let expired = store.reap_expired();
    for grant in &expired {
        info!("Grant for {} expired at {}", grant.client, grant.expires_at);
        if let Err(e) = sync.retract(grant.client).await {
            // The next reconcile removes it from a fresh snapshot.
            error!("Failed to retract rule for {}: {}", grant.client, e);
        }
    }
    expired.len()
}

pub async fn reaper_loop(store: Arc<SessionStore>, sync: Arc<RuleSynchronizer>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let reaped = reap_once(&store, &sync).await;
        if reaped > 0 {
            debug!("Reaped {} grants", reaped);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use captive_core::{ManualClock, RedirectPolicy, Rule};
    use captive_net::{MemoryBackend, StaticLinkProbe};
    use chrono::Utc;
    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn test_reaper_retracts_expired_grants() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = Arc::new(SessionStore::with_clock(clock.clone(), false));
        let backend = Arc::new(MemoryBackend::new());
        let sync = RuleSynchronizer::new(
            Arc::new(RedirectPolicy::default()),
            store.clone(),
            backend.clone(),
            Arc::new(StaticLinkProbe::new(true)),
        );

        let short = Ipv4Addr::new(10, 0, 0, 10);
        let long = Ipv4Addr::new(10, 0, 0, 11);
        store.admit(short, Duration::from_secs(300));
        store.admit(long, Duration::from_secs(900));
        sync.reconcile().await.unwrap();
        assert!(backend.rules().contains(&Rule::AllowClient(short)));

        clock.advance(Duration::from_secs(299));
        assert_eq!(reap_once(&store, &sync).await, 0);

        clock.advance(Duration::from_secs(1));
        assert_eq!(reap_once(&store, &sync).await, 1);
        assert!(!store.is_admitted(short));
        assert!(!backend.rules().contains(&Rule::AllowClient(short)));
        assert!(backend.rules().contains(&Rule::AllowClient(long)));
        assert_eq!(store.len(), 1);
    }
}
