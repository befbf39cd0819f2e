//! Intrusive doubly-linked lists over the slot table.
//!
//! A beacon is just a `{first, last}` index pair; the actual links live in
//! each [`Slot`]'s `link.prev`/`link.next`. Insertion is always at the
//! head, so the tail is always the coolest (longest-idle) entry — which is
//! exactly what the eviction policy wants to read off without a scan.

use super::slot::{Slot, SlotStatus, NONE};

#[derive(Debug, Clone, Copy)]
pub struct Beacon {
    pub first: isize,
    pub last: isize,
}

impl Default for Beacon {
    fn default() -> Self {
        Beacon { first: NONE, last: NONE }
    }
}

impl Beacon {
    pub fn is_empty(&self) -> bool {
        self.first == NONE
    }
}

fn get(slots: &[Slot], idx: isize) -> Option<usize> {
    if idx < 0 {
        None
    } else {
        Some(idx as usize)
    }
}

/// Removes `index` from `beacon`, patching neighbor links and the beacon's
/// own endpoints. The slot's own link is reset to unlinked and its status
/// is left to the caller to update.
pub fn remove(slots: &mut [Slot], beacon: &mut Beacon, index: usize) {
    let (prev, next) = {
        let s = &slots[index];
        (s.link.prev, s.link.next)
    };

    if beacon.first == index as isize {
        beacon.first = next;
    }
    if beacon.last == index as isize {
        beacon.last = prev;
    }

    if let Some(p) = get(slots, prev) {
        slots[p].link.next = next;
    }
    if let Some(n) = get(slots, next) {
        slots[n].link.prev = prev;
    }

    let s = &mut slots[index];
    s.link.prev = NONE;
    s.link.next = NONE;
}

/// Pushes `index` onto the head of `beacon`, setting the slot's status and
/// refreshing `last_update`. The slot must already be unlinked (both link
/// ends `NONE`).
pub fn unshift(slots: &mut [Slot], beacon: &mut Beacon, index: usize, status: SlotStatus) {
    debug_assert_eq!(slots[index].link.prev, NONE);
    debug_assert_eq!(slots[index].link.next, NONE);

    let old_first = beacon.first;
    slots[index].link.next = old_first;
    if let Some(f) = get(slots, old_first) {
        slots[f].link.prev = index as isize;
    }
    beacon.first = index as isize;
    if beacon.last == NONE {
        beacon.last = index as isize;
    }

    let s = &mut slots[index];
    s.status = status;
    s.last_update = std::time::Instant::now();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_slots(n: usize) -> Vec<Slot> {
        (0..n).map(|i| Slot::new(i, 0)).collect()
    }

    #[test]
    fn unshift_then_remove_empties_beacon() {
        let mut slots = make_slots(3);
        let mut beacon = Beacon::default();
        unshift(&mut slots, &mut beacon, 0, SlotStatus::Idle);
        unshift(&mut slots, &mut beacon, 1, SlotStatus::Idle);
        unshift(&mut slots, &mut beacon, 2, SlotStatus::Idle);
        // Head is the most recently pushed; tail is the first pushed (coolest).
        assert_eq!(beacon.first, 2);
        assert_eq!(beacon.last, 0);

        remove(&mut slots, &mut beacon, 1);
        assert_eq!(beacon.first, 2);
        assert_eq!(beacon.last, 0);
        assert_eq!(slots[2].link.next, 0);
        assert_eq!(slots[0].link.prev, 2);

        remove(&mut slots, &mut beacon, 2);
        remove(&mut slots, &mut beacon, 0);
        assert!(beacon.is_empty());
        assert_eq!(beacon.last, NONE);
    }
}
