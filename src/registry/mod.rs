//! Mountpoint registry
//!
//! The name → source directory. All admission goes through [`reserve`],
//! which is what makes "one source per mount" hold under concurrent
//! claims. Lookup with fallback walks the statically configured fallback
//! chain; [`move_clients`] migrates listeners between mounts with a fixed
//! lock order so two opposite migrations can't deadlock.
//!
//! [`reserve`]: MountRegistry::reserve
//! [`move_clients`]: MountRegistry::move_clients

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, Notify, RwLock};
use tracing::{info, warn};

use crate::config::MountConfig;
use crate::error::{Error, Result};
use crate::source::{Listener, Source};
use crate::stats::StreamEvents;

/// Longest fallback chain walked before giving up (cycle guard)
pub const MAX_FALLBACK_DEPTH: usize = 10;

/// Name → source directory with fallback resolution
pub struct MountRegistry {
    sources: RwLock<HashMap<String, Arc<Source>>>,
    /// Taken before any pair of source locks during a migration. One
    /// global lock plus the fixed dest-then-src order below gives moves a
    /// total order.
    move_lock: Mutex<()>,
    config: Arc<dyn MountConfig>,
    events: Arc<dyn StreamEvents>,
    /// Pinged when listeners land on an idle on-demand mount
    relay_wake: Notify,
}

impl MountRegistry {
    /// Registry backed by the given mount configuration
    pub fn new(config: Arc<dyn MountConfig>, events: Arc<dyn StreamEvents>) -> Self {
        Self {
            sources: RwLock::new(HashMap::new()),
            move_lock: Mutex::new(()),
            config,
            events,
            relay_wake: Notify::new(),
        }
    }

    /// The mount configuration collaborator
    pub fn config(&self) -> &Arc<dyn MountConfig> {
        &self.config
    }

    /// Notified when an idle on-demand mount gains listeners
    pub fn relay_wake(&self) -> &Notify {
        &self.relay_wake
    }

    /// The events sink state changes are reported to
    pub(crate) fn events(&self) -> &Arc<dyn StreamEvents> {
        &self.events
    }

    /// Claim a mountpoint
    ///
    /// The sole admission path for local producers and relays alike.
    /// Fails with [`Error::MountInUse`] when the name is already claimed;
    /// the caller treats that as fatal to its own connection attempt, not
    /// to the process.
    pub async fn reserve(&self, mount: &str) -> Result<Arc<Source>> {
        let mut sources = self.sources.write().await;
        if sources.contains_key(mount) {
            return Err(Error::MountInUse(mount.to_string()));
        }
        let limits = self.config.limits_for(mount).sanitized(mount);
        let fallback = self.config.fallback_for(mount);
        let source = Arc::new(Source::new(
            mount,
            limits,
            fallback,
            Arc::clone(&self.events),
        ));
        sources.insert(mount.to_string(), Arc::clone(&source));
        info!(mount = %mount, "Mountpoint reserved");
        Ok(source)
    }

    /// Exact lookup, ignoring fallbacks and running state
    pub async fn find(&self, mount: &str) -> Option<Arc<Source>> {
        self.sources.read().await.get(mount).map(Arc::clone)
    }

    /// Lookup walking the fallback chain
    ///
    /// Returns the first source along the chain that is running or
    /// on-demand. Bounded by `max_depth`; a cyclic chain resolves to
    /// nothing rather than spinning.
    pub async fn find_with_fallback(&self, mount: &str, max_depth: usize) -> Option<Arc<Source>> {
        let mut current = mount.to_string();
        for _ in 0..=max_depth {
            if let Some(source) = self.find(&current).await {
                if source.is_running() || source.is_on_demand() {
                    return Some(source);
                }
            }
            match self.config.fallback_for(&current) {
                Some(next) => current = next,
                None => return None,
            }
        }
        None
    }

    /// [`find_with_fallback`](Self::find_with_fallback) with the default depth bound
    pub async fn resolve(&self, mount: &str) -> Option<Arc<Source>> {
        self.find_with_fallback(mount, MAX_FALLBACK_DEPTH).await
    }

    /// Attach a listener to a mountpoint, resolving through fallbacks
    ///
    /// Returns the source the listener actually landed on. When nothing
    /// along the chain is live the listener is rejected with
    /// [`Error::MountUnavailable`]; the caller decides what to tell the
    /// client before closing it.
    pub async fn attach(&self, mount: &str, listener: Listener) -> Result<Arc<Source>> {
        match self.resolve(mount).await {
            Some(source) => {
                source.admit(listener).await;
                if source.is_on_demand() && !source.is_running() {
                    self.relay_wake.notify_waiters();
                }
                Ok(source)
            }
            None => Err(Error::MountUnavailable(mount.to_string())),
        }
    }

    /// Drop a mount from the directory
    ///
    /// Listener eviction and queue cleanup are the source's own shutdown
    /// business; this only forgets the name.
    pub async fn remove(&self, mount: &str) -> Option<Arc<Source>> {
        let removed = self.sources.write().await.remove(mount);
        if removed.is_some() {
            info!(mount = %mount, "Mountpoint released");
        }
        removed
    }

    /// All currently registered mount names
    pub async fn mounts(&self) -> Vec<String> {
        self.sources.read().await.keys().cloned().collect()
    }

    /// Migrate every listener from `src` to `dest`
    ///
    /// Lock order is always move-lock, then dest, then src; never vary
    /// it. Refuses when `dest` is neither running nor on-demand. Cursors
    /// into the old queue are dropped (they mean nothing on the
    /// destination); an unsent protocol preamble always carries over, so
    /// a listener mid-send of its response headers finishes them on the
    /// new mount.
    pub async fn move_clients(&self, src: &Arc<Source>, dest: &Arc<Source>) -> Result<u32> {
        if Arc::ptr_eq(src, dest) {
            return Ok(0);
        }
        let _move_guard = self.move_lock.lock().await;

        if !dest.is_running() && !dest.is_on_demand() {
            warn!(dest = %dest.mount(), "Destination mount not running, unable to move clients");
            return Err(Error::SourceNotRunning(dest.mount().to_string()));
        }

        let (moved, dest_count) = {
            let mut dest_state = dest.state.lock().await;
            let mut src_state = src.state.lock().await;

            let mut moved = 0u32;
            src_state.first_normal = 0;
            for mut listener in src_state.active.drain(..) {
                listener.clear_cursor();
                dest_state.pending.push(listener);
                moved += 1;
            }
            for listener in src_state.pending.drain(..) {
                // pending listeners never held a cursor worth keeping
                dest_state.pending.push(listener);
                moved += 1;
            }
            (moved, dest_state.listener_total())
        };

        src.publish_listener_count(0);
        dest.publish_listener_count(dest_count);
        info!(src = %src.mount(), dest = %dest.mount(), moved = moved, "Moved listeners");

        // listeners landing on an idle on-demand mount should start it
        if moved > 0 && dest.is_on_demand() && !dest.is_running() {
            dest.request_on_demand();
            self.relay_wake.notify_waiters();
        }
        Ok(moved)
    }
}

impl std::fmt::Debug for MountRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MountRegistry").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StaticMountConfig;
    use crate::stats::NullEvents;
    use crate::transport::SinkTransport;

    fn registry_with(config: StaticMountConfig) -> Arc<MountRegistry> {
        Arc::new(MountRegistry::new(Arc::new(config), Arc::new(NullEvents)))
    }

    fn registry() -> Arc<MountRegistry> {
        registry_with(StaticMountConfig::new())
    }

    async fn admit_n(source: &Arc<Source>, n: usize) {
        for _ in 0..n {
            source
                .admit(Listener::new(Box::new(SinkTransport::new())))
                .await;
        }
    }

    #[tokio::test]
    async fn test_reserve_conflict() {
        let registry = registry();
        registry.reserve("/live").await.unwrap();
        assert!(matches!(
            registry.reserve("/live").await,
            Err(Error::MountInUse(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_reserve_exactly_one_wins() {
        let registry = registry();
        let a = {
            let r = Arc::clone(&registry);
            tokio::spawn(async move { r.reserve("/live").await.is_ok() })
        };
        let b = {
            let r = Arc::clone(&registry);
            tokio::spawn(async move { r.reserve("/live").await.is_ok() })
        };
        let (a, b) = (a.await.unwrap(), b.await.unwrap());
        assert!(a ^ b, "exactly one claim succeeds");
    }

    #[tokio::test]
    async fn test_fallback_chain_resolution() {
        let registry = registry_with(
            StaticMountConfig::new()
                .fallback("/live", "/standby")
                .fallback("/standby", "/silence"),
        );
        let silence = registry.reserve("/silence").await.unwrap();
        silence.force_running();

        // /live and /standby both dead; chain lands on /silence
        registry.reserve("/live").await.unwrap();
        let resolved = registry.resolve("/live").await.unwrap();
        assert_eq!(resolved.mount(), "/silence");
    }

    #[tokio::test]
    async fn test_attach_rejects_dead_mount() {
        let registry = registry();
        registry.reserve("/live").await.unwrap();

        let result = registry
            .attach("/live", Listener::new(Box::new(SinkTransport::new())))
            .await;
        assert!(matches!(result, Err(Error::MountUnavailable(_))));
    }

    #[tokio::test]
    async fn test_attach_resolves_through_fallback() {
        let registry = registry_with(StaticMountConfig::new().fallback("/live", "/standby"));
        let standby = registry.reserve("/standby").await.unwrap();
        standby.force_running();
        registry.reserve("/live").await.unwrap();

        let landed = registry
            .attach("/live", Listener::new(Box::new(SinkTransport::new())))
            .await
            .unwrap();
        assert_eq!(landed.mount(), "/standby");
        assert_eq!(standby.listener_count(), 1);
    }

    #[tokio::test]
    async fn test_fallback_cycle_bounded() {
        let registry = registry_with(
            StaticMountConfig::new()
                .fallback("/a", "/b")
                .fallback("/b", "/a"),
        );
        assert!(registry.find_with_fallback("/a", 10).await.is_none());
    }

    #[tokio::test]
    async fn test_move_refused_when_dest_dead() {
        let registry = registry();
        let src = registry.reserve("/src").await.unwrap();
        let dest = registry.reserve("/dest").await.unwrap();
        admit_n(&src, 3).await;

        assert!(registry.move_clients(&src, &dest).await.is_err());
        assert_eq!(src.listener_count(), 3, "nobody moved");
    }

    #[tokio::test]
    async fn test_move_then_move_back_restores_count() {
        let registry = registry();
        let a = registry.reserve("/a").await.unwrap();
        let b = registry.reserve("/b").await.unwrap();
        a.force_running();
        b.force_running();

        admit_n(&a, 10).await;
        a.service_tick().await;

        registry.move_clients(&a, &b).await.unwrap();
        assert_eq!(a.listener_count(), 0);
        assert_eq!(b.listener_count(), 10);

        registry.move_clients(&b, &a).await.unwrap();
        assert_eq!(a.listener_count(), 10);
        assert_eq!(b.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_migrates_to_fallback() {
        let registry = registry_with(StaticMountConfig::new().fallback("/live", "/standby"));
        let live = registry.reserve("/live").await.unwrap();
        let standby = registry.reserve("/standby").await.unwrap();
        live.force_running();
        standby.force_running();

        admit_n(&live, 10).await;
        live.service_tick().await;
        assert_eq!(live.listener_count(), 10);

        live.shutdown(&registry).await;
        assert_eq!(standby.listener_count(), 10);
        assert_eq!(live.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_move_to_idle_on_demand_requests_start() {
        let registry = registry();
        let src = registry.reserve("/src").await.unwrap();
        let dest = registry.reserve("/ondemand").await.unwrap();
        dest.set_on_demand(true);
        src.force_running();
        admit_n(&src, 1).await;

        registry.move_clients(&src, &dest).await.unwrap();
        assert!(dest.take_on_demand_request());
    }
}
