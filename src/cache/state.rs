//! The mutex-guarded cache state: slot table, beacons, and name index.
//!
//! Every mutation of this struct happens with [`super::controller::Cache`]'s
//! single [`std::sync::Mutex`] held; nothing here takes its own lock.

use std::collections::BTreeMap;

use super::beacon::{self, Beacon};
use super::hooks::{CloseHook, UnlockHook};
use super::slot::{Slot, SlotStatus};

pub struct CacheState {
    pub slots: Vec<Slot>,
    pub beacon_free: Beacon,
    pub beacon_idle: Beacon,
    pub beacon_idle_hot: Beacon,
    pub beacon_used: Beacon,
    pub name_index: BTreeMap<String, usize>,
    pub bases_max_hard: u32,
    pub bases_max_soft: u32,
    pub bases_used: u32,
    pub is_running: bool,
    pub last_memory_usage: i64,
    pub unlock_hook: Option<UnlockHook>,
    pub close_hook: Option<CloseHook>,
}

impl CacheState {
    pub fn new(bases_max_hard: u32, bases_max_soft: u32, now_secs: i64) -> Self {
        let mut slots: Vec<Slot> = (0..bases_max_hard as usize)
            .map(|i| Slot::new(i, now_secs))
            .collect();

        let mut beacon_free = Beacon::default();
        // Pushed in reverse index order so low indices are preferred on
        // allocation.
        for i in (0..slots.len()).rev() {
            beacon::unshift(&mut slots, &mut beacon_free, i, SlotStatus::Free);
        }

        Self {
            slots,
            beacon_free,
            beacon_idle: Beacon::default(),
            beacon_idle_hot: Beacon::default(),
            beacon_used: Beacon::default(),
            name_index: BTreeMap::new(),
            bases_max_hard,
            bases_max_soft,
            bases_used: 0,
            is_running: true,
            last_memory_usage: 0,
            unlock_hook: None,
            close_hook: None,
        }
    }

    pub fn has_idle(&self) -> bool {
        !self.beacon_idle.is_empty() || !self.beacon_idle_hot.is_empty()
    }

    pub fn ram_exhausted(&self, max_rss: i64) -> bool {
        max_rss > 0 && self.last_memory_usage > max_rss
    }

    fn beacon_for(&self, status: SlotStatus) -> Option<&Beacon> {
        match status {
            SlotStatus::Free => Some(&self.beacon_free),
            SlotStatus::Idle => Some(&self.beacon_idle),
            SlotStatus::IdleHot => Some(&self.beacon_idle_hot),
            SlotStatus::Used => Some(&self.beacon_used),
            SlotStatus::Closing | SlotStatus::ClosingForDeletion => None,
        }
    }

    fn beacon_for_mut(&mut self, status: SlotStatus) -> Option<&mut Beacon> {
        match status {
            SlotStatus::Free => Some(&mut self.beacon_free),
            SlotStatus::Idle => Some(&mut self.beacon_idle),
            SlotStatus::IdleHot => Some(&mut self.beacon_idle_hot),
            SlotStatus::Used => Some(&mut self.beacon_used),
            SlotStatus::Closing | SlotStatus::ClosingForDeletion => None,
        }
    }

    /// Moves `index` from its current list to the list matching `status`,
    /// creating the slot in `status` with no-op if already there. A
    /// transition into/out of `CLOSING`/`CLOSING_FOR_DELETION` just sets
    /// `status` directly since those slots belong to no list.
    pub fn move_to_list(&mut self, index: usize, status: SlotStatus) {
        let current = self.slots[index].status;
        if current == status {
            return;
        }

        if let Some(mut beacon) = self.beacon_for(current).copied() {
            beacon::remove(&mut self.slots, &mut beacon, index);
            if let Some(slot) = self.beacon_for_mut(current) {
                *slot = beacon;
            }
        }

        match status {
            SlotStatus::Free => {
                debug_assert!(self.bases_used > 0);
                self.bases_used -= 1;
                let mut beacon = self.beacon_free;
                beacon::unshift(&mut self.slots, &mut beacon, index, status);
                self.beacon_free = beacon;
            }
            SlotStatus::Idle => {
                let mut beacon = self.beacon_idle;
                beacon::unshift(&mut self.slots, &mut beacon, index, status);
                self.beacon_idle = beacon;
            }
            SlotStatus::IdleHot => {
                let mut beacon = self.beacon_idle_hot;
                beacon::unshift(&mut self.slots, &mut beacon, index, status);
                self.beacon_idle_hot = beacon;
            }
            SlotStatus::Used => {
                let mut beacon = self.beacon_used;
                beacon::unshift(&mut self.slots, &mut beacon, index, status);
                self.beacon_used = beacon;
            }
            SlotStatus::Closing | SlotStatus::ClosingForDeletion => {
                self.slots[index].status = status;
            }
        }
    }

    pub fn lookup(&self, name: &str) -> Option<usize> {
        self.name_index.get(name).copied()
    }

    /// Attempts to reserve a free slot for `name`. Returns:
    /// - `Ok(Some(index))` on success,
    /// - `Ok(None)` when at/over the soft limit but an idle slot exists
    ///   (the caller must evict and retry — there is no free slot to hand
    ///   back, and this is not itself an error),
    /// - `Err(())` when at/over the soft limit with nothing idle either.
    pub fn reserve(&mut self, name: &str) -> Result<Option<usize>, ()> {
        if self.bases_used >= self.bases_max_soft {
            return if self.has_idle() { Ok(None) } else { Err(()) };
        }

        let index = match self.beacon_free.first {
            n if n >= 0 => n as usize,
            _ => return Ok(None),
        };

        self.bases_used += 1;
        debug_assert_eq!(self.slots[index].count_open, 0);

        self.slots[index].name = Some(name.to_string());
        self.slots[index].count_open = 1;
        self.slots[index].handle = None;
        self.slots[index].owner = Some(std::thread::current().id());
        self.move_to_list(index, SlotStatus::Used);
        self.name_index.insert(name.to_string(), index);

        Ok(Some(index))
    }

    pub fn count_in(&self, status: SlotStatus) -> usize {
        let mut count = 0;
        let mut cursor = match self.beacon_for(status) {
            Some(b) => b.first,
            None => return 0,
        };
        while cursor >= 0 {
            count += 1;
            cursor = self.slots[cursor as usize].link.next;
        }
        count
    }
}
