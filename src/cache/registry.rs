use std::ops::ControlFlow;
use std::sync::Weak;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{info, warn};

use super::backend::{Backend, CacheBackend};
use crate::task::PeriodicTask;

pub const PRIMARY: &str = "primary";
pub const BACKUP: &str = "backup";

#[derive(Debug)]
pub struct BackendSlot {
    role: &'static str,
    backend: Backend,
    available: AtomicBool,
}

impl BackendSlot {
    fn new(role: &'static str, backend: Backend) -> Self {
        Self {
            role,
            backend,
            available: AtomicBool::new(true),
        }
    }

    pub fn role(&self) -> &'static str {
        self.role
    }

    pub fn kind(&self) -> &'static str {
        self.backend.kind()
    }

    pub fn backend(&self) -> &dyn CacheBackend {
        &self.backend
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Relaxed)
    }

    fn set_available(&self, available: bool) {
        let previous = self.available.swap(available, Ordering::Relaxed);
        crate::metrics::set_backend_available(self.role, available);
        if previous != available {
            if available {
                info!(role = self.role, backend = self.kind(), "cache backend available");
            } else {
                warn!(role = self.role, backend = self.kind(), "cache backend unavailable");
            }
        }
    }
}

/// Primary backend plus an optional backup, each with an availability flag
/// that request handling reads and health checks refresh.
#[derive(Debug)]
pub struct BackendRegistry {
    primary: BackendSlot,
    backup: Option<BackendSlot>,
}

impl BackendRegistry {
    pub fn new(primary: Backend) -> Self {
        Self {
            primary: BackendSlot::new(PRIMARY, primary),
            backup: None,
        }
    }

    pub fn with_backup(mut self, backup: Backend) -> Self {
        self.backup = Some(BackendSlot::new(BACKUP, backup));
        self
    }

    /// The backend requests should use: primary when available, otherwise
    /// an available backup. `None` means requests pass straight through.
    pub fn active(&self) -> Option<&BackendSlot> {
        if self.primary.is_available() {
            return Some(&self.primary);
        }
        self.backup.as_ref().filter(|slot| slot.is_available())
    }

    pub fn mark_unavailable(&self, slot: &BackendSlot) {
        slot.set_available(false);
    }

    pub fn slots(&self) -> impl Iterator<Item = &BackendSlot> {
        std::iter::once(&self.primary).chain(self.backup.as_ref())
    }

    /// Probes every backend and records the result.
    pub async fn refresh_health(&self) {
        for slot in self.slots() {
            let healthy = slot.backend.check_health(true).await;
            slot.set_available(healthy);
        }
    }
}

/// Refreshes backend availability every `interval` while the registry lives.
pub fn spawn_health_monitor(registry: Weak<BackendRegistry>, interval: Duration) -> PeriodicTask {
    PeriodicTask::spawn("cache-health", interval, move || {
        let registry = registry.clone();
        async move {
            let Some(registry) = registry.upgrade() else {
                return ControlFlow::Break(());
            };
            registry.refresh_health().await;
            ControlFlow::Continue(())
        }
    })
}
