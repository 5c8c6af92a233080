//! Unification cells.
//!
//! Placeholders are handles into a union-find arena. A root cell is either
//! unresolved (with a FIFO wait-list of suspensions) or resolved exactly once.
//! Unified cells forward to a common root; lookups compress paths and unions
//! go by size, so chains stay logarithmic and every walk is a loop.

use crate::ids::PlaceholderId;
use crate::suspension::Suspension;
use crate::values::Value;
use std::collections::VecDeque;

#[derive(Clone)]
pub(crate) enum CellState {
    Unresolved {
        waiters: VecDeque<Suspension>,
        size: u32,
    },
    Forward(PlaceholderId),
    Resolved(Value),
}

pub(crate) struct SavedCell {
    root: PlaceholderId,
    state: CellState,
}

#[derive(Default)]
pub struct Cells {
    cells: Vec<CellState>,
}

impl Cells {
    pub fn alloc(&mut self) -> PlaceholderId {
        self.cells.push(CellState::Unresolved {
            waiters: VecDeque::new(),
            size: 1,
        });
        PlaceholderId::from_index(self.cells.len() - 1)
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Root of `id`'s equivalence class.
    pub fn find(&mut self, id: PlaceholderId) -> PlaceholderId {
        let mut root = id;
        while let CellState::Forward(next) = &self.cells[root.index()] {
            root = *next;
        }
        let mut cur = id;
        while cur != root {
            let next = match &self.cells[cur.index()] {
                CellState::Forward(next) => *next,
                _ => break,
            };
            self.cells[cur.index()] = CellState::Forward(root);
            cur = next;
        }
        root
    }

    /// The value `id` resolved to, if any.
    pub fn resolved(&mut self, id: PlaceholderId) -> Option<Value> {
        let root = self.find(id);
        match &self.cells[root.index()] {
            CellState::Resolved(v) => Some(v.clone()),
            _ => None,
        }
    }

    /// Merges two unresolved classes. The surviving wait-list holds `a`'s
    /// waiters followed by `b`'s.
    pub fn unify(&mut self, a: PlaceholderId, b: PlaceholderId) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return;
        }
        let take = |cell: &mut CellState| match cell {
            CellState::Unresolved { waiters, size } => Some((std::mem::take(waiters), *size)),
            _ => None,
        };
        let Some((mut waiters, size_a)) = take(&mut self.cells[ra.index()]) else {
            return;
        };
        let Some((waiters_b, size_b)) = take(&mut self.cells[rb.index()]) else {
            // `b` is resolved: hand the waiters back untouched.
            if let CellState::Unresolved { waiters: w, .. } = &mut self.cells[ra.index()] {
                *w = waiters;
            }
            return;
        };
        waiters.extend(waiters_b);
        let (root, child) = if size_a >= size_b { (ra, rb) } else { (rb, ra) };
        self.cells[root.index()] = CellState::Unresolved {
            waiters,
            size: size_a + size_b,
        };
        self.cells[child.index()] = CellState::Forward(root);
    }

    /// Resolves `id`'s class to `value` and returns its waiters in enqueue
    /// order. A class that is already resolved keeps its value.
    pub fn resolve(&mut self, id: PlaceholderId, value: Value) -> VecDeque<Suspension> {
        let root = self.find(id);
        let slot = &mut self.cells[root.index()];
        if matches!(slot, CellState::Resolved(_)) {
            return VecDeque::new();
        }
        match std::mem::replace(slot, CellState::Resolved(value)) {
            CellState::Unresolved { waiters, .. } => waiters,
            _ => VecDeque::new(),
        }
    }

    /// Queues `suspension` on `id`. Hands it back if the class is already
    /// resolved, so the caller can run it right away.
    pub fn enqueue(&mut self, id: PlaceholderId, suspension: Suspension) -> Option<Suspension> {
        let root = self.find(id);
        match &mut self.cells[root.index()] {
            CellState::Unresolved { waiters, .. } => {
                waiters.push_back(suspension);
                None
            }
            _ => Some(suspension),
        }
    }

    /// Copy of the root cell of `id`'s class, for `restore`.
    pub(crate) fn save(&mut self, id: PlaceholderId) -> SavedCell {
        let root = self.find(id);
        SavedCell {
            root,
            state: self.cells[root.index()].clone(),
        }
    }

    /// Puts a saved root cell back, wait-list included.
    pub(crate) fn restore(&mut self, saved: SavedCell) {
        if let Some(cell) = self.cells.get_mut(saved.root.index()) {
            *cell = saved.state;
        }
    }

    pub fn waiter_count(&mut self, id: PlaceholderId) -> usize {
        let root = self.find(id);
        match &self.cells[root.index()] {
            CellState::Unresolved { waiters, .. } => waiters.len(),
            _ => 0,
        }
    }
}
