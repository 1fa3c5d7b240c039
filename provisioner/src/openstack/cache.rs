use super::{ClientKey, Openstack, OpenstackError, OpenstackFactory};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::OnceCell;

struct Slot {
    client: OnceCell<Arc<dyn Openstack>>,
    /// Milliseconds since the owning cache's epoch.
    last_access: AtomicU64,
}

/// Process-wide store of OpenStack sessions, keyed by [`ClientKey`].
///
/// Repeated lookups of the same key return the very same handle until the
/// entry expires (after `ttl` without access) or [`ClientCache::invalidate_all`]
/// is called. Concurrent misses on one key share a single construction; a
/// failed construction is reported to every waiter and is not remembered.
pub struct ClientCache {
    factory: Arc<dyn OpenstackFactory>,
    slots: DashMap<ClientKey, Arc<Slot>>,
    ttl: Option<Duration>,
    epoch: Instant,
}

impl ClientCache {
    pub fn new(factory: Arc<dyn OpenstackFactory>, ttl: Option<Duration>) -> Self {
        Self {
            factory,
            slots: DashMap::new(),
            ttl,
            epoch: Instant::now(),
        }
    }

    fn now_ms(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    fn slot(&self, key: &ClientKey) -> Arc<Slot> {
        let now = self.now_ms();
        let fresh = || {
            Arc::new(Slot {
                client: OnceCell::new(),
                last_access: AtomicU64::new(now),
            })
        };

        let mut entry = self.slots.entry(key.clone()).or_insert_with(fresh);
        let idle = now.saturating_sub(entry.last_access.load(Ordering::Relaxed));
        let expired = self
            .ttl
            .is_some_and(|ttl| u128::from(idle) > ttl.as_millis());
        if expired {
            tracing::debug!(?key, "OpenStack session expired, dropping it");
            *entry = fresh();
        } else {
            entry.last_access.store(now, Ordering::Relaxed);
        }
        Arc::clone(entry.value())
    }

    /// Return the cached session for `key`, building one if there is none.
    pub async fn get_openstack(
        &self,
        key: &ClientKey,
    ) -> Result<Arc<dyn Openstack>, OpenstackError> {
        let slot = self.slot(key);
        let built = slot
            .client
            .get_or_try_init(|| async {
                tracing::info!(endpoint = %key.endpoint, region = ?key.region, "Building OpenStack session");
                self.factory.connect(key).await.inspect_err(|e| {
                    tracing::warn!(endpoint = %key.endpoint, "Failed to build OpenStack session: {e}")
                })
            })
            .await;
        match built {
            Ok(client) => Ok(Arc::clone(client)),
            Err(e) => {
                // Only our own slot, and only while nobody has filled it since.
                self.slots.remove_if(key, |_, current| {
                    Arc::ptr_eq(current, &slot) && !current.client.initialized()
                });
                Err(e)
            }
        }
    }

    /// Build a session that bypasses (and does not populate) the cache.
    pub async fn connect_uncached(
        &self,
        key: &ClientKey,
    ) -> Result<Arc<dyn Openstack>, OpenstackError> {
        self.factory.connect(key).await
    }

    /// Forget every cached session; the next lookup of any key builds anew.
    pub fn invalidate_all(&self) {
        tracing::info!("Invalidating {} cached OpenStack sessions", self.slots.len());
        self.slots.clear();
    }

    /// Number of keys with a live session.
    pub fn len(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.client.initialized())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
