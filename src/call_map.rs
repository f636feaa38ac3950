//! Registry of live call controllers, signal-driven lifecycle, and the
//! periodic GC sweep.
//!
//! Grounded directly on the Go B2BUA's `callMap`: a dedicated `cc_id`
//! counter (not the map's length), a signal-handling task that reacts to
//! `SIGHUP`/`SIGUSR2`/`SIGPROF`, and a GC task that logs every tick and,
//! once a safe-restart is armed and the map has drained, re-execs the
//! process image.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::time::Duration;
use tracing::{debug, info, Instrument};

use crate::cc::{Cc, CcInner};
use crate::sip::transaction::TransactionManager;

pub struct CallMap {
    ccmap: DashMap<u64, Cc>,
    cc_id: AtomicU64,
    cc_id_lock: Mutex<()>,
    pub debug_mode: Arc<AtomicBool>,
    pub safe_restart: Arc<AtomicBool>,
    gc_interval: Mutex<Duration>,
    fast_gc_interval: Duration,
    transaction_manager: Arc<dyn TransactionManager>,
}

impl CallMap {
    pub fn new(
        gc_interval: Duration,
        fast_gc_interval: Duration,
        transaction_manager: Arc<dyn TransactionManager>,
    ) -> Arc<Self> {
        let map = Arc::new(Self {
            ccmap: DashMap::new(),
            cc_id: AtomicU64::new(0),
            cc_id_lock: Mutex::new(()),
            debug_mode: Arc::new(AtomicBool::new(false)),
            safe_restart: Arc::new(AtomicBool::new(false)),
            gc_interval: Mutex::new(gc_interval),
            fast_gc_interval,
            transaction_manager,
        });
        map.clone().spawn_signal_task();
        map.clone().spawn_gc_task();
        map
    }

    /// Allocates the next `cc_id`. A dedicated counter, independent of
    /// the map's own length, so ids stay monotonic even across GC
    /// removals.
    pub async fn next_cc_id(&self) -> u64 {
        let _guard = self.cc_id_lock.lock().await;
        self.cc_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn insert(&self, cc: Cc) {
        self.ccmap.insert(cc.id, cc);
    }

    pub fn get(&self, id: u64) -> Option<Cc> {
        self.ccmap.get(&id).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.ccmap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ccmap.is_empty()
    }

    /// Admission gate: once safe-restart is armed, no new dialogs are
    /// accepted beyond those already in flight.
    pub fn accepting_new_dialogs(&self) -> bool {
        !self.safe_restart.load(Ordering::SeqCst)
    }

    pub async fn disconnect_all(self: &Arc<Self>) {
        info!("disconnecting all calls in map ({} entries)", self.ccmap.len());
        let ccs: Vec<Cc> = self.ccmap.iter().map(|e| e.value().clone()).collect();
        for cc in ccs {
            cc.disconnect(None).await;
        }
    }

    fn toggle_debug(&self) {
        let now_on = !self.debug_mode.load(Ordering::SeqCst);
        self.debug_mode.store(now_on, Ordering::SeqCst);
        if now_on {
            info!("toggling extra debug output on");
        } else {
            info!("toggling extra debug output off");
        }
    }

    fn arm_safe_restart(&self) {
        info!("scheduling safe restart");
        self.safe_restart.store(true, Ordering::SeqCst);
    }

    fn spawn_signal_task(self: Arc<Self>) {
        tokio::spawn(async move {
            #[cfg(unix)]
            {
                use tokio::signal::unix::{signal, SignalKind};
                let mut sighup = match signal(SignalKind::hangup()) {
                    Ok(s) => s,
                    Err(e) => {
                        tracing::error!("failed to install SIGHUP handler: {}", e);
                        return;
                    }
                };
                let mut sigusr2 = match signal(SignalKind::user_defined2()) {
                    Ok(s) => s,
                    Err(e) => {
                        tracing::error!("failed to install SIGUSR2 handler: {}", e);
                        return;
                    }
                };
                let mut sigprof = match signal(SignalKind::from_raw(27)) {
                    Ok(s) => s,
                    Err(e) => {
                        tracing::error!("failed to install SIGPROF handler: {}", e);
                        return;
                    }
                };
                loop {
                    tokio::select! {
                        _ = sighup.recv() => {
                            info!("SIGHUP received, disconnecting all calls");
                            self.disconnect_all().await;
                        }
                        _ = sigusr2.recv() => self.toggle_debug(),
                        _ = sigprof.recv() => self.arm_safe_restart(),
                    }
                }
            }
        });
    }

    fn spawn_gc_task(self: Arc<Self>) {
        tokio::spawn(async move {
            loop {
                let interval = *self.gc_interval.lock().await;
                tokio::time::sleep(interval).await;
                self.gc_sweep().await;
            }
        });
    }

    /// Runs once per GC tick: unconditional count log, debug-mode per-CC
    /// state dump, and the safe-restart drain/re-exec sequence.
    async fn gc_sweep(self: &Arc<Self>) {
        self.reap().await;

        info!("gc tick: {} calls in map", self.ccmap.len());

        if self.debug_mode.load(Ordering::SeqCst) {
            for entry in self.ccmap.iter() {
                let cc = entry.value();
                let span = crate::utils::dialog_span(cc.id, &cc.call_id);
                let summary = cc.leg_state_summary().instrument(span).await;
                debug!("{}: {}", entry.key(), summary);
            }
        }

        if self.safe_restart.load(Ordering::SeqCst) {
            if self.ccmap.is_empty() {
                self.safe_restart_reexec();
                return;
            }
            *self.gc_interval.lock().await = self.fast_gc_interval;
        }
    }

    /// Re-executes the current process image with its original argv and
    /// environment, so a restart doesn't drop calls already in flight. Does not
    /// return on success.
    fn safe_restart_reexec(&self) -> ! {
        info!("map drained, re-executing for safe restart");
        let exe = std::env::current_exe().unwrap_or_else(|_| std::path::PathBuf::from(
            std::env::args().next().unwrap_or_default(),
        ));
        let args: Vec<String> = std::env::args().skip(1).collect();

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            let err = std::process::Command::new(&exe).args(&args).exec();
            tracing::error!("re-exec failed: {}", err);
            std::process::exit(1);
        }
        #[cfg(not(unix))]
        {
            match std::process::Command::new(&exe).args(&args).spawn() {
                Ok(_) => std::process::exit(0),
                Err(e) => {
                    tracing::error!("re-exec failed: {}", e);
                    std::process::exit(1);
                }
            }
        }
    }
}

impl CallMap {
    /// Removes every CC whose both legs are terminal. Separate from
    /// `gc_sweep`'s synchronous retain pass because determining
    /// terminality requires awaiting the per-CC session lock.
    pub async fn reap(&self) {
        let mut dead = Vec::new();
        for entry in self.ccmap.iter() {
            if entry.value().is_terminal().await {
                dead.push(*entry.key());
            }
        }
        for id in dead {
            self.ccmap.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aaa::{AaaEngine, StaticAaaEngine};
    use crate::cc::UaTimers;
    use crate::config::AaaConfig;
    use crate::sip::transaction::memory::InMemoryTransactionManager;

    fn transaction_manager() -> Arc<dyn TransactionManager> {
        Arc::new(InMemoryTransactionManager::default())
    }

    fn aaa_engine() -> Arc<dyn AaaEngine> {
        Arc::new(StaticAaaEngine::new(AaaConfig {
            require_auth: false,
            digest_auth_only: false,
            realm: "b2bua.local".to_string(),
            credentials: Default::default(),
        }))
    }

    fn default_timers() -> UaTimers {
        UaTimers {
            expire_timeout: Duration::from_secs(32),
            no_progress_timeout: Duration::from_secs(8),
            credit_time: None,
            reinvite_interval: None,
        }
    }

    #[tokio::test]
    async fn cc_id_allocation_is_monotonic_and_independent_of_map_size() {
        let map = CallMap::new(
            Duration::from_secs(60),
            Duration::from_secs(1),
            transaction_manager(),
        );
        let first = map.next_cc_id().await;
        let second = map.next_cc_id().await;
        assert_eq!(second, first + 1);
        assert_eq!(map.len(), 0);
    }

    #[tokio::test]
    async fn reap_removes_fully_terminal_calls() {
        let map = CallMap::new(
            Duration::from_secs(60),
            Duration::from_secs(1),
            transaction_manager(),
        );
        let id = map.next_cc_id().await;
        let cc = CcInner::new(
            id,
            "call-x".to_string(),
            false,
            vec![],
            transaction_manager(),
            aaa_engine(),
            default_timers(),
        );
        cc.disconnect(None).await;
        map.insert(cc);
        assert_eq!(map.len(), 1);
        map.reap().await;
        assert_eq!(map.len(), 0);
    }

    #[tokio::test]
    async fn safe_restart_blocks_new_dialog_admission() {
        let map = CallMap::new(
            Duration::from_secs(60),
            Duration::from_secs(1),
            transaction_manager(),
        );
        assert!(map.accepting_new_dialogs());
        map.safe_restart.store(true, Ordering::SeqCst);
        assert!(!map.accepting_new_dialogs());
    }
}
