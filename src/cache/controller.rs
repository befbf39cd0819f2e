//! The cache controller: the single mutex-protected state machine exposing
//! `open_and_lock`, `unlock_and_close`, expiry, and reconfiguration.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;

use crate::error::CacheError;
use crate::settings::CacheSettings;

use super::handle::Handle;
use super::hooks::{CloseHook, UnlockHook};
use super::slot::{Slot, SlotStatus, SlotWaiters};
use super::state::CacheState;

/// Flags for [`Cache::unlock_and_close`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CloseFlags {
    pub immediately: bool,
    pub for_deletion: bool,
}

impl CloseFlags {
    pub const NONE: CloseFlags = CloseFlags { immediately: false, for_deletion: false };
    pub const IMMEDIATELY: CloseFlags = CloseFlags { immediately: true, for_deletion: false };
    pub const FOR_DELETION: CloseFlags = CloseFlags { immediately: false, for_deletion: true };
}

/// Snapshot returned by [`Cache::count`].
#[derive(Debug, Clone, Copy)]
pub struct CacheCounts {
    pub max: u32,
    pub soft_max: u32,
    pub cold: usize,
    pub hot: usize,
    pub used: usize,
}

/// The shared-database handle cache.
///
/// Wrap in an `Arc` to share across worker threads; every public method
/// takes `&self` and does its own locking.
pub struct Cache {
    state: Mutex<CacheState>,
    waiters: Vec<SlotWaiters>,
    settings: ArcSwap<CacheSettings>,
    created_at: Instant,
}

impl Cache {
    /// Builds a cache with `bases_max_hard` slots (from `settings`), all
    /// initially `FREE`.
    pub fn init(settings: CacheSettings) -> Cache {
        let created_at = Instant::now();
        let bases_max_hard = settings.bases_max_hard;
        let bases_max_soft = settings.resolved_soft_max();

        let waiters = (0..bases_max_hard).map(|_| SlotWaiters::default()).collect();
        let state = CacheState::new(bases_max_hard, bases_max_soft, 0);

        Cache {
            state: Mutex::new(state),
            waiters,
            settings: ArcSwap::from_pointee(settings),
            created_at,
        }
    }

    fn now_secs(&self, instant: Instant) -> i64 {
        instant.saturating_duration_since(self.created_at).as_secs() as i64
    }

    /// Current settings snapshot.
    pub fn settings(&self) -> Arc<CacheSettings> {
        self.settings.load_full()
    }

    /// Replaces the settings snapshot and re-applies the soft limit.
    pub fn set_settings(&self, settings: CacheSettings) {
        self.settings.store(Arc::new(settings));
        self.reconfigure();
    }

    /// Re-reads the soft limit from the current settings snapshot.
    pub fn reconfigure(&self) {
        let settings = self.settings.load_full();
        self.state.lock().unwrap().bases_max_soft = settings.resolved_soft_max();
    }

    pub fn set_running(&self, running: bool) {
        self.state.lock().unwrap().is_running = running;
    }

    pub fn set_unlock_hook(&self, hook: UnlockHook) {
        self.state.lock().unwrap().unlock_hook = Some(hook);
    }

    pub fn set_close_hook(&self, hook: CloseHook) {
        self.state.lock().unwrap().close_hook = Some(hook);
    }

    pub fn set_last_memory_usage(&self, bytes: i64) {
        self.state.lock().unwrap().last_memory_usage = bytes;
    }

    pub fn get_handle(&self, index: usize) -> Option<Handle> {
        self.state.lock().unwrap().slots.get(index).and_then(|s| s.handle)
    }

    pub fn set_handle(&self, index: usize, handle: Handle) {
        let mut guard = self.state.lock().unwrap();
        if let Some(slot) = guard.slots.get_mut(index) {
            slot.handle = Some(handle);
        }
    }

    pub fn count(&self) -> CacheCounts {
        let guard = self.state.lock().unwrap();
        CacheCounts {
            max: guard.bases_max_hard,
            soft_max: guard.bases_max_soft,
            cold: guard.count_in(SlotStatus::Idle),
            hot: guard.count_in(SlotStatus::IdleHot),
            used: guard.count_in(SlotStatus::Used),
        }
    }

    /// Acquires a slot for `name`, opening it if necessary.
    ///
    /// `deadline` is an optional absolute deadline; it is always clamped
    /// to `now + timeout_open`. Returns the slot index on success.
    pub fn open_and_lock(
        &self,
        name: &str,
        urgent: bool,
        deadline: Option<Instant>,
    ) -> Result<usize, CacheError> {
        let settings = self.settings.load_full();
        let me = std::thread::current().id();
        let start = Instant::now();
        let local_deadline = start + settings.timeout_open();
        let deadline = deadline.map(|d| d.min(local_deadline)).unwrap_or(local_deadline);
        let remaining0 = deadline.saturating_duration_since(start);
        let deadline_margin = (remaining0 / 2).min(settings.cond_wait_period() * 2);

        let mut attempts: u32 = 0;
        let mut guard = self.state.lock().unwrap();

        enum Exit {
            Ok(usize, bool),
            Err(CacheError, Option<usize>),
        }

        let exit = loop {
            attempts += 1;

            if !guard.is_running {
                break Exit::Err(CacheError::Busy("service exiting".into()), None);
            }

            let existing = guard.lookup(name);

            if existing.is_none() && deadline <= Instant::now() {
                break Exit::Err(
                    CacheError::Busy("DB busy (deadline reached): no attempt to open".into()),
                    None,
                );
            }

            let Some(index) = existing else {
                match guard.reserve(name) {
                    Ok(Some(index)) => break Exit::Ok(index, true),
                    Ok(None) => {
                        // Forced: a reservation miss at capacity must recycle the
                        // coolest idle victim regardless of grace delay.
                        let (g, evicted) = self.expire_first_idle(guard, None);
                        guard = g;
                        if evicted {
                            continue;
                        }
                        break Exit::Err(
                            CacheError::Unavailable("No idle base in cache".into()),
                            None,
                        );
                    }
                    Err(()) => {
                        break Exit::Err(CacheError::Busy("Max bases reached".into()), None);
                    }
                }
            };

            let now = Instant::now();
            let remaining_time = deadline.saturating_duration_since(now);
            let wait_time_so_far = now.saturating_duration_since(start);

            if deadline <= now {
                let owner = guard.slots[index].owner;
                let status = guard.slots[index].status;
                if status == SlotStatus::Used && owner == Some(me) {
                    break Exit::Err(CacheError::Timeout("Deadline reached".into()), Some(index));
                }
                if attempts < 2 {
                    break Exit::Err(
                        CacheError::Busy("DB busy (deadline reached): no attempt to open".into()),
                        Some(index),
                    );
                }
                let now_secs = self.now_secs(now);
                let accessibility_window = wait_time_so_far.as_secs().clamp(1, 60) as i64;
                let accessible = is_accessible(
                    &guard.slots[index],
                    now_secs,
                    accessibility_window,
                    settings.min_load_on_heavy_load,
                );
                if settings.fail_on_heavy_load && accessible {
                    let avg = recent_average_wait(&guard.slots[index], now_secs, 10, settings.min_load_on_heavy_load)
                        .unwrap_or(Duration::ZERO);
                    break Exit::Err(
                        CacheError::ExcessiveLoad { avg_wait: avg, deadline_reached: true },
                        Some(index),
                    );
                }
                break Exit::Err(
                    CacheError::Busy("DB busy (deadline reached)".into()),
                    Some(index),
                );
            }

            match guard.slots[index].status {
                SlotStatus::Free => {
                    debug_assert!(false, "free slot referenced from name index");
                    break Exit::Err(
                        CacheError::Internal("free slot referenced from name index".into()),
                        Some(index),
                    );
                }

                SlotStatus::Idle | SlotStatus::IdleHot => {
                    guard.move_to_list(index, SlotStatus::Used);
                    guard.slots[index].count_open = 1;
                    guard.slots[index].owner = Some(me);
                    break Exit::Ok(index, true);
                }

                SlotStatus::Used => {
                    let owner = guard.slots[index].owner;
                    if owner == Some(me) {
                        guard.slots[index].count_open += 1;
                        break Exit::Ok(index, false);
                    }

                    if !urgent {
                        let margin = if !settings.fail_on_heavy_load && settings.alert_on_heavy_load {
                            deadline_margin
                        } else {
                            Duration::ZERO
                        };
                        let now_secs = self.now_secs(now);
                        let budget = remaining_time.saturating_sub(margin);
                        if let Some(avg) =
                            recent_average_wait(&guard.slots[index], now_secs, 10, settings.min_load_on_heavy_load)
                        {
                            if avg > budget {
                                if settings.fail_on_heavy_load {
                                    break Exit::Err(
                                        CacheError::ExcessiveLoad { avg_wait: avg, deadline_reached: false },
                                        Some(index),
                                    );
                                }
                                if settings.alert_on_heavy_load {
                                    tracing::warn!(
                                        name,
                                        waiting_requests = guard.slots[index].count_waiting,
                                        avg_waiting_time = ?avg,
                                        remaining_time = ?remaining_time,
                                        "load too high"
                                    );
                                }
                            }
                        }
                    }

                    guard.slots[index].count_waiting += 1;
                    guard.slots[index].heat = 1;
                    let wait_cond = if urgent { &self.waiters[index].cond_prio } else { &self.waiters[index].cond };
                    let (g, _timed_out) = wait_cond
                        .wait_timeout(guard, settings.cond_wait_period())
                        .unwrap();
                    guard = g;
                    guard.slots[index].count_waiting -= 1;
                }

                SlotStatus::Closing => {
                    let wait_cond = if urgent { &self.waiters[index].cond_prio } else { &self.waiters[index].cond };
                    let (g, _timed_out) = wait_cond
                        .wait_timeout(guard, settings.cond_wait_period())
                        .unwrap();
                    guard = g;
                }

                SlotStatus::ClosingForDeletion => {
                    break Exit::Err(
                        CacheError::ContainerNotFound(format!("Base [{name}] being deleted")),
                        Some(index),
                    );
                }
            }
        };

        let result = match exit {
            Exit::Ok(index, opened) => {
                let now = Instant::now();
                let wait_time = now.saturating_duration_since(start);
                if opened {
                    let now_secs = self.now_secs(now);
                    guard.slots[index].open_attempts.add(now_secs, 1);
                    guard.slots[index]
                        .open_wait_time
                        .add(now_secs, wait_time.as_micros() as u64);
                    if attempts == 1 && wait_time < Duration::from_millis(1) && guard.slots[index].count_waiting < 2 {
                        guard.slots[index].heat = 0;
                    }
                    crate::metrics::record_open(wait_time);
                }
                self.waiters[index].signal();
                Ok(index)
            }
            Exit::Err(e, touched) => {
                if let Some(index) = touched {
                    self.waiters[index].signal();
                }
                crate::metrics::record_error(error_kind(&e));
                Err(e)
            }
        };

        drop(guard);
        result
    }

    /// Releases one open count on `slot`, closing it when the count drops
    /// to zero (unless it remains USED) per `flags`.
    pub fn unlock_and_close(&self, index: usize, flags: CloseFlags) -> Result<(), CacheError> {
        if index >= self.waiters.len() {
            return Err(CacheError::Internal(format!("invalid slot id={index}")));
        }

        let settings = self.settings.load_full();
        let me = std::thread::current().id();
        let mut guard = self.state.lock().unwrap();

        let status = guard.slots[index].status;
        let precondition_err = match status {
            SlotStatus::Free => Some(CacheError::Internal("base not used".into())),
            SlotStatus::Idle | SlotStatus::IdleHot => Some(CacheError::Internal("base already closed".into())),
            SlotStatus::Closing | SlotStatus::ClosingForDeletion => {
                Some(CacheError::Internal("base being closed".into()))
            }
            SlotStatus::Used => {
                let owner = guard.slots[index].owner;
                let count_open = guard.slots[index].count_open;
                if owner != Some(me) || count_open < 1 {
                    Some(CacheError::Internal("base not owned by caller".into()))
                } else {
                    None
                }
            }
        };

        if let Some(e) = precondition_err {
            self.waiters[index].signal();
            drop(guard);
            crate::metrics::record_error(error_kind(&e));
            return Err(e);
        }

        let lock_time = guard.slots[index].last_update.elapsed();
        guard.slots[index].count_open -= 1;

        if guard.slots[index].count_open > 0 {
            // Still held by the caller (reentrant open); nothing else to do.
        } else if flags.immediately || flags.for_deletion {
            guard = self.expire_base(guard, index, flags.for_deletion);
        } else {
            if let Some(hook) = guard.unlock_hook.clone() {
                if let Some(h) = guard.slots[index].handle {
                    hook(h);
                }
            }
            guard.slots[index].owner = None;
            let heat = guard.slots[index].heat;
            let next_status = if heat >= settings.heat_threshold {
                SlotStatus::IdleHot
            } else {
                SlotStatus::Idle
            };
            guard.move_to_list(index, next_status);

            if guard.ram_exhausted(settings.max_rss) && guard.has_idle() {
                let (g, _evicted) = self.expire_first_idle(guard, None);
                guard = g;
            }
        }

        if lock_time > settings.timeout_open() * 3 / 4 {
            tracing::warn!(slot = index, ?lock_time, "lock held close to timeout_open");
        }

        self.waiters[index].signal();
        drop(guard);
        Ok(())
    }

    /// Evicts up to `max` idle slots (0 = unbounded), stopping once
    /// `duration` has elapsed or nothing more is evictable.
    pub fn expire(&self, max: u32, duration: Duration) -> u32 {
        let deadline = Instant::now() + duration;
        let mut guard = self.state.lock().unwrap();
        let mut evicted = 0u32;
        loop {
            if max != 0 && evicted >= max {
                break;
            }
            let now = Instant::now();
            if now > deadline {
                break;
            }
            let (g, done) = self.expire_first_idle(guard, Some(now));
            guard = g;
            if !done {
                break;
            }
            evicted += 1;
        }
        evicted
    }

    /// Evicts every idle slot, ignoring grace delays.
    pub fn expire_all(&self) -> u32 {
        let mut guard = self.state.lock().unwrap();
        let mut evicted = 0u32;
        loop {
            let (g, done) = self.expire_first_idle(guard, None);
            guard = g;
            if !done {
                break;
            }
            evicted += 1;
        }
        evicted
    }

    /// Picks the coolest eligible idle victim (IDLE tail first, then
    /// IDLE_HOT tail) and evicts it. `now = None` forces eviction
    /// regardless of grace delay.
    fn expire_first_idle<'a>(
        &'a self,
        guard: MutexGuard<'a, CacheState>,
        now: Option<Instant>,
    ) -> (MutexGuard<'a, CacheState>, bool) {
        let settings = self.settings.load_full();
        let (guard, done) = self.try_expire_one(guard, SlotStatus::Idle, now, settings.grace_delay_cool());
        if done {
            return (guard, true);
        }
        self.try_expire_one(guard, SlotStatus::IdleHot, now, settings.grace_delay_hot())
    }

    fn try_expire_one<'a>(
        &'a self,
        mut guard: MutexGuard<'a, CacheState>,
        status: SlotStatus,
        now: Option<Instant>,
        grace_delay: Duration,
    ) -> (MutexGuard<'a, CacheState>, bool) {
        let tail = match status {
            SlotStatus::Idle => guard.beacon_idle.last,
            SlotStatus::IdleHot => guard.beacon_idle_hot.last,
            _ => unreachable!("try_expire_one only operates on IDLE/IDLE_HOT"),
        };
        if tail < 0 {
            return (guard, false);
        }
        let index = tail as usize;

        let eligible = match now {
            None => true,
            Some(now) => {
                grace_delay.is_zero()
                    || guard.slots[index].last_update <= now.checked_sub(grace_delay).unwrap_or(now)
            }
        };
        if !eligible {
            return (guard, false);
        }

        guard.slots[index].owner = Some(std::thread::current().id());
        guard.move_to_list(index, SlotStatus::Used);
        let guard = self.expire_base(guard, index, false);
        // A thread that parked on this slot's CLOSING state for exactly the
        // grace delay must be woken again now that it's back in FREE.
        self.waiters[index].signal();
        (guard, true)
    }

    /// PRE: slot is USED, owned by the current thread, `count_open == 0`.
    /// POST: slot is back in FREE. Runs the close hook with the global
    /// lock released with the caller's own thread pinned as owner.
    fn expire_base<'a>(
        &'a self,
        mut guard: MutexGuard<'a, CacheState>,
        index: usize,
        deleted: bool,
    ) -> MutexGuard<'a, CacheState> {
        debug_assert!(guard.slots[index].owner.is_some());
        debug_assert_eq!(guard.slots[index].count_open, 0);
        debug_assert_eq!(guard.slots[index].status, SlotStatus::Used);

        let target = if deleted { SlotStatus::ClosingForDeletion } else { SlotStatus::Closing };
        guard.move_to_list(index, target);

        let handle = guard.slots[index].handle;
        let close_hook = guard.close_hook.clone();
        self.waiters[index].signal();

        drop(guard);
        if let (Some(hook), Some(h)) = (close_hook, handle) {
            hook(h);
        }
        let mut guard = self.state.lock().unwrap();

        let name = guard.slots[index].name.take();
        guard.slots[index].handle = None;
        guard.slots[index].heat = 0;
        guard.slots[index].owner = None;
        guard.slots[index].count_open = 0;
        guard.move_to_list(index, SlotStatus::Free);
        if let Some(n) = name {
            guard.name_index.remove(&n);
        }
        crate::metrics::record_eviction();
        crate::metrics::set_slots_used(guard.bases_used as usize);

        guard
    }
}

/// Whether the slot was accessed often enough over `period_secs` to say
/// anything meaningful about its recent load.
fn is_accessible(slot: &Slot, now_secs: i64, period_secs: i64, min_load: u64) -> bool {
    let period = period_secs.clamp(1, 60);
    slot.open_attempts.get_delta(now_secs, period) >= (period as u64).saturating_mul(min_load)
}

/// Average wait time (as a `Duration`) over the last `window_secs`
/// seconds, or `None` if too few opens landed in that window to say
/// anything ("unloaded").
fn recent_average_wait(slot: &Slot, now_secs: i64, window_secs: i64, min_load: u64) -> Option<Duration> {
    let dx = slot.open_attempts.get_delta(now_secs, window_secs);
    let dt = slot.open_wait_time.get_delta(now_secs, window_secs);
    if dx > 0 && dx >= (window_secs as u64).saturating_mul(min_load) {
        Some(Duration::from_micros(dt / dx))
    } else {
        None
    }
}

fn error_kind(e: &CacheError) -> &'static str {
    match e {
        CacheError::Busy(_) => "busy",
        CacheError::Unavailable(_) => "unavailable",
        CacheError::Timeout(_) => "timeout",
        CacheError::ExcessiveLoad { .. } => "excessive_load",
        CacheError::ContainerNotFound(_) => "container_not_found",
        CacheError::Internal(_) => "internal",
    }
}
