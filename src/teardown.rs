use async_trait::async_trait;
use futures::future::join_all;
use futures::StreamExt;
use signal_hook::consts::signal::{SIGINT, SIGQUIT, SIGTERM};
use signal_hook_tokio::Signals;
use std::collections::BTreeMap;
use std::os::raw::c_int;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Something that must be cleaned up before the host process exits.
#[async_trait]
pub trait Teardown: Send + Sync {
    fn describe(&self) -> String;

    /// Must not fail; problems are logged by the implementor.
    async fn teardown(&self);
}

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

/// Identity used as the registry key for a controller instance.
pub fn next_instance_id() -> u64 {
    NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed)
}

/// Process-wide set of teardown hooks keyed by instance id.
///
/// Hooks are held weakly: a hook whose owner is gone has already cleaned up
/// through its own `Drop` and is skipped.
#[derive(Default)]
pub struct TeardownRegistry {
    hooks: Mutex<BTreeMap<u64, Weak<dyn Teardown>>>,
}

impl TeardownRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn global() -> &'static TeardownRegistry {
        static GLOBAL: OnceLock<TeardownRegistry> = OnceLock::new();
        GLOBAL.get_or_init(TeardownRegistry::new)
    }

    pub fn register<T: Teardown + 'static>(&self, id: u64, hook: &Arc<T>) {
        info!(instance = id, hook = %hook.describe(), "Registered teardown hook");
        let weak: Weak<dyn Teardown> = Arc::<T>::downgrade(hook);
        self.hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, weak);
    }

    pub fn deregister(&self, id: u64) -> bool {
        self.hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .is_some()
    }

    pub fn is_registered(&self, id: u64) -> bool {
        self.hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.hooks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /*
        @@@
        @run_all();
        . Takes every registered hook out of the registry, so each one runs at most once.
        . Hooks whose owner was already dropped are skipped.
        . Runs the rest concurrently and waits for all; returns how many ran.
    */
    pub async fn run_all(&self) -> usize {
        let hooks = std::mem::take(&mut *self.hooks.lock().unwrap_or_else(PoisonError::into_inner));
        let live: Vec<Arc<dyn Teardown>> = hooks.into_values().filter_map(|h| h.upgrade()).collect();
        if live.is_empty() {
            return 0;
        }
        info!(count = live.len(), "Running teardown hooks");
        join_all(live.iter().map(|hook| hook.teardown())).await;
        live.len()
    }
}

/// Runs the global registry on SIGINT, SIGTERM or SIGQUIT.
///
/// The task resolves with the signal number once teardown has finished.
pub fn spawn_signal_listener() -> std::io::Result<JoinHandle<c_int>> {
    listen_for(TeardownRegistry::global(), &[SIGINT, SIGTERM, SIGQUIT])
}

/*
    @@@
    @listen_for();
    . Installs signal-hook handlers for `signals` and waits for the first one on a tokio task.
    . On delivery runs every hook in `registry`, then stops listening.
*/
pub fn listen_for(
    registry: &'static TeardownRegistry,
    signals: &[c_int],
) -> std::io::Result<JoinHandle<c_int>> {
    let mut stream = Signals::new(signals)?;
    let handle = stream.handle();
    Ok(tokio::spawn(async move {
        let received = stream.next().await.unwrap_or_default();
        warn!(signal = received, "Termination signal received, tearing down embedded services");
        registry.run_all().await;
        handle.close();
        received
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::{timeout, Duration};

    struct Counting {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Teardown for Counting {
        fn describe(&self) -> String {
            "counting".into()
        }

        async fn teardown(&self) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn counting() -> Arc<Counting> {
        Arc::new(Counting { calls: AtomicUsize::new(0) })
    }

    #[tokio::test]
    async fn runs_each_registered_hook_once() {
        let registry = TeardownRegistry::new();
        let (a, b, c) = (counting(), counting(), counting());
        registry.register(1, &a);
        registry.register(2, &b);
        registry.register(3, &c);
        assert!(registry.deregister(3));
        assert!(!registry.deregister(3));

        assert_eq!(registry.run_all().await, 2);
        assert_eq!(registry.run_all().await, 0);
        assert!(registry.is_empty());

        assert_eq!(a.calls.load(Ordering::SeqCst), 1);
        assert_eq!(b.calls.load(Ordering::SeqCst), 1);
        assert_eq!(c.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn re_registering_an_id_replaces_the_hook() {
        let registry = TeardownRegistry::new();
        let (old, new) = (counting(), counting());
        registry.register(7, &old);
        registry.register(7, &new);
        assert_eq!(registry.len(), 1);
        registry.run_all().await;
        assert_eq!(old.calls.load(Ordering::SeqCst), 0);
        assert_eq!(new.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dropped_hooks_are_skipped() {
        let registry = TeardownRegistry::new();
        let (kept, dropped) = (counting(), counting());
        registry.register(1, &kept);
        registry.register(2, &dropped);
        drop(dropped);

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.run_all().await, 1);
        assert_eq!(kept.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn instance_ids_are_unique() {
        let a = next_instance_id();
        let b = next_instance_id();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn signal_runs_registry() {
        static REGISTRY: OnceLock<TeardownRegistry> = OnceLock::new();
        let registry = REGISTRY.get_or_init(TeardownRegistry::new);
        let hook = counting();
        registry.register(1, &hook);

        let listener = listen_for(registry, &[signal_hook::consts::signal::SIGUSR2]).unwrap();
        nix::sys::signal::raise(nix::sys::signal::Signal::SIGUSR2).unwrap();

        let received = timeout(Duration::from_secs(5), listener).await.unwrap().unwrap();
        assert_eq!(received, signal_hook::consts::signal::SIGUSR2);
        assert_eq!(hook.calls.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty());
    }
}
