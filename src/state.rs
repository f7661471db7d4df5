use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use once_cell::sync::Lazy;
use sqlx::{Pool, Postgres};
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::warn;

use crate::config::AppConfig;
use crate::ledger::HoldLedger;

/// Service-wide counters exposed at `GET /stats`. All outcome paths bump
/// exactly one counter so the totals reconcile against `*_received`.
pub(crate) struct PerfCounters {
    pub(crate) reserve_received: AtomicU64,
    pub(crate) reserve_committed: AtomicU64,
    pub(crate) reserve_refreshed: AtomicU64,
    pub(crate) reserve_insufficient: AtomicU64,
    pub(crate) reserve_conflicts: AtomicU64,
    pub(crate) reserve_version_races: AtomicU64,
    pub(crate) counter_seeds: AtomicU64,
    pub(crate) confirm_received: AtomicU64,
    pub(crate) confirm_settled: AtomicU64,
    pub(crate) confirm_expired: AtomicU64,
    pub(crate) confirm_noop: AtomicU64,
    pub(crate) cancel_received: AtomicU64,
    pub(crate) cancel_restored: AtomicU64,
    pub(crate) cancel_missing: AtomicU64,
    pub(crate) holds_reclaimed: AtomicU64,
    pub(crate) units_reclaimed: AtomicU64,
}

impl PerfCounters {
    pub(crate) fn new() -> Self {
        Self {
            reserve_received: AtomicU64::new(0),
            reserve_committed: AtomicU64::new(0),
            reserve_refreshed: AtomicU64::new(0),
            reserve_insufficient: AtomicU64::new(0),
            reserve_conflicts: AtomicU64::new(0),
            reserve_version_races: AtomicU64::new(0),
            counter_seeds: AtomicU64::new(0),
            confirm_received: AtomicU64::new(0),
            confirm_settled: AtomicU64::new(0),
            confirm_expired: AtomicU64::new(0),
            confirm_noop: AtomicU64::new(0),
            cancel_received: AtomicU64::new(0),
            cancel_restored: AtomicU64::new(0),
            cancel_missing: AtomicU64::new(0),
            holds_reclaimed: AtomicU64::new(0),
            units_reclaimed: AtomicU64::new(0),
        }
    }

    pub(crate) fn note_reclaim(&self, holds: u64, units: i64) {
        if holds == 0 {
            return;
        }
        self.holds_reclaimed.fetch_add(holds, Ordering::Relaxed);
        self.units_reclaimed
            .fetch_add(units.max(0) as u64, Ordering::Relaxed);
    }

    pub(crate) fn snapshot_json(&self) -> serde_json::Value {
        serde_json::json!({
            "reserve": {
                "received": self.reserve_received.load(Ordering::Relaxed),
                "committed": self.reserve_committed.load(Ordering::Relaxed),
                "refreshed": self.reserve_refreshed.load(Ordering::Relaxed),
                "insufficient": self.reserve_insufficient.load(Ordering::Relaxed),
                "conflicts": self.reserve_conflicts.load(Ordering::Relaxed),
                "version_races": self.reserve_version_races.load(Ordering::Relaxed),
                "counter_seeds": self.counter_seeds.load(Ordering::Relaxed),
            },
            "confirm": {
                "received": self.confirm_received.load(Ordering::Relaxed),
                "settled": self.confirm_settled.load(Ordering::Relaxed),
                "expired": self.confirm_expired.load(Ordering::Relaxed),
                "already_settled": self.confirm_noop.load(Ordering::Relaxed),
            },
            "cancel": {
                "received": self.cancel_received.load(Ordering::Relaxed),
                "restored": self.cancel_restored.load(Ordering::Relaxed),
                "missing": self.cancel_missing.load(Ordering::Relaxed),
            },
            "reclaim": {
                "holds": self.holds_reclaimed.load(Ordering::Relaxed),
                "units": self.units_reclaimed.load(Ordering::Relaxed),
            }
        })
    }
}

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) cfg: Arc<AppConfig>,
    pub(crate) db: Pool<Postgres>,
    pub(crate) ledger: HoldLedger,
    pub(crate) perf: Arc<PerfCounters>,
}

const SLOT_LOCK_WARN_MS: u128 = 250;
const SLOT_LOG_COOLDOWN_MS: i64 = 1000;
static SLOW_LOCK_LAST_MS: Lazy<DashMap<&'static str, i64>> = Lazy::new(DashMap::new);

fn now_epoch_ms_i64() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_millis() as i64,
        Err(_) => 0,
    }
}

fn should_emit_slow_lock(label: &'static str) -> bool {
    let now = now_epoch_ms_i64();
    if let Some(mut last) = SLOW_LOCK_LAST_MS.get_mut(label) {
        if now - *last < SLOT_LOG_COOLDOWN_MS {
            return false;
        }
        *last = now;
        true
    } else {
        SLOW_LOCK_LAST_MS.insert(label, now);
        true
    }
}

pub(crate) async fn slot_read<'a, T>(
    lock: &'a RwLock<T>,
    label: &'static str,
) -> RwLockReadGuard<'a, T> {
    let wait_started = Instant::now();
    let guard = lock.read().await;
    let wait_ms = wait_started.elapsed().as_millis();
    if wait_ms >= SLOT_LOCK_WARN_MS && should_emit_slow_lock(label) {
        warn!(label, wait_ms = wait_ms as u64, "slow ledger slot read acquire");
    }
    guard
}

pub(crate) async fn slot_write<'a, T>(
    lock: &'a RwLock<T>,
    label: &'static str,
) -> RwLockWriteGuard<'a, T> {
    let wait_started = Instant::now();
    let guard = lock.write().await;
    let wait_ms = wait_started.elapsed().as_millis();
    if wait_ms >= SLOT_LOCK_WARN_MS && should_emit_slow_lock(label) {
        warn!(label, wait_ms = wait_ms as u64, "slow ledger slot write acquire");
    }
    guard
}
