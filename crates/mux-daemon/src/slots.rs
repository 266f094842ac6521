//! Smallest-unused-id registry.
//!
//! Vacant slots hold a forward pointer to the next live id (0 when there is
//! none), so iteration skips holes and allocation finds the lowest free id
//! without scanning live entries twice.

/// How far past the current table a hint may point. Hints come from
/// viewers, so anything further out is treated as no hint.
const HINT_SLACK: usize = 64;

/// Values stored in a [`SlotTable`] know the id they were entered under.
pub trait Slotted {
    fn slot_id(&self) -> u32;
}

enum Slot<T> {
    Live(T),
    Vacant { next: u32 },
}

pub struct SlotTable<T> {
    slots: Vec<Slot<T>>,
    live: usize,
}

impl<T: Slotted> Default for SlotTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Slotted> SlotTable<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            live: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn valid(&self, id: u32) -> bool {
        matches!(self.slots.get(id as usize), Some(Slot::Live(_)))
    }

    pub fn get(&self, id: u32) -> Option<&T> {
        match self.slots.get(id as usize) {
            Some(Slot::Live(v)) => Some(v),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut T> {
        match self.slots.get_mut(id as usize) {
            Some(Slot::Live(v)) => Some(v),
            _ => None,
        }
    }

    /// Pick an id and store the value built for it.
    ///
    /// `hint` is taken when it is free here, not `reserved` by a sibling
    /// table and no more than [`HINT_SLACK`] past the table's end; otherwise
    /// the lowest id free in both senses is used.
    pub fn enter_with(
        &mut self,
        hint: Option<u32>,
        reserved: impl Fn(u32) -> bool,
        build: impl FnOnce(u32) -> T,
    ) -> u32 {
        let id = match hint {
            Some(h) if h > 0 && self.within_reach(h) && !self.valid(h) && !reserved(h) => h,
            _ => {
                let mut s = 1;
                while self.valid(s) || reserved(s) {
                    s += 1;
                }
                s
            }
        };

        let index = id as usize;
        while self.slots.len() <= index {
            let new_size = std::cmp::max(20, 3 * self.slots.len() / 2);
            self.slots
                .resize_with(new_size, || Slot::Vacant { next: 0 });
        }

        let old_next = match self.slots[index] {
            Slot::Vacant { next } => next,
            Slot::Live(_) => unreachable!("slot {id} chosen while live"),
        };
        let value = build(id);
        debug_assert_eq!(value.slot_id(), id);
        self.slots[index] = Slot::Live(value);
        self.live += 1;

        for i in (0..index).rev() {
            match &mut self.slots[i] {
                Slot::Vacant { next } if *next == old_next => *next = id,
                _ => break,
            }
        }
        id
    }

    fn within_reach(&self, id: u32) -> bool {
        (id as usize) <= self.slots.len() + HINT_SLACK
    }

    pub fn remove(&mut self, id: u32) -> Option<T> {
        debug_assert!(self.valid(id), "removing id {id} which is not live");
        if !self.valid(id) {
            return None;
        }
        let index = id as usize;
        let next_live = self.next_after(id).unwrap_or(0);
        let old = std::mem::replace(&mut self.slots[index], Slot::Vacant { next: next_live });
        self.live -= 1;

        for i in (0..index).rev() {
            match &mut self.slots[i] {
                Slot::Vacant { next } if *next == id => *next = next_live,
                _ => break,
            }
        }
        match old {
            Slot::Live(v) => Some(v),
            Slot::Vacant { .. } => None,
        }
    }

    pub fn first(&self) -> Option<u32> {
        self.next_after(0)
    }

    pub fn next(&self, id: u32) -> Option<u32> {
        self.next_after(id)
    }

    fn next_after(&self, id: u32) -> Option<u32> {
        match self.slots.get(id as usize + 1)? {
            Slot::Live(_) => Some(id + 1),
            Slot::Vacant { next: 0 } => None,
            Slot::Vacant { next } => Some(*next),
        }
    }

    /// Live ids in ascending order.
    pub fn ids(&self) -> Vec<u32> {
        let mut out = Vec::with_capacity(self.live);
        let mut cur = self.first();
        while let Some(id) = cur {
            out.push(id);
            cur = self.next(id);
        }
        out
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        let mut cur = self.first();
        std::iter::from_fn(move || {
            let id = cur?;
            cur = self.next(id);
            self.get(id)
        })
    }
}
