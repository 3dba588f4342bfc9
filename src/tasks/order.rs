//! Priority/order index — dense, explicit ordering of task ids.
//!
//! The index never mutates itself speculatively: callers ask for a
//! `MovePlan`, persist the affected positions, and only then apply it.

use std::collections::HashSet;

use uuid::Uuid;

/// A task whose position changes, with its new position.
pub type PositionChange = (Uuid, usize);

/// Result of planning a move: the range of positions it touches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MovePlan {
    pub from: usize,
    pub to: usize,
    /// Every task in `min(from, to)..=max(from, to)`, with its new position.
    pub changes: Vec<PositionChange>,
}

impl MovePlan {
    pub fn is_noop(&self) -> bool {
        self.from == self.to
    }
}

/// Total order over the task ids of one queue.
#[derive(Debug, Clone, Default)]
pub struct OrderIndex {
    ids: Vec<Uuid>,
}

impl OrderIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from ids already in queue order.
    pub fn from_ids(ids: Vec<Uuid>) -> Self {
        Self { ids }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn ids(&self) -> &[Uuid] {
        &self.ids
    }

    pub fn position(&self, id: Uuid) -> Option<usize> {
        self.ids.iter().position(|x| *x == id)
    }

    /// Position the next pushed id will receive.
    pub fn tail(&self) -> usize {
        self.ids.len()
    }

    /// Append at the tail and return the assigned position.
    pub fn push(&mut self, id: Uuid) -> usize {
        self.ids.push(id);
        self.ids.len() - 1
    }

    /// Plan moving `id` to `target`. Targets past the end clamp to the tail.
    pub fn plan_move(&self, id: Uuid, target: usize) -> Option<MovePlan> {
        let from = self.position(id)?;
        let to = target.min(self.ids.len() - 1);
        if from == to {
            return Some(MovePlan {
                from,
                to,
                changes: Vec::new(),
            });
        }

        let (lo, hi) = (from.min(to), from.max(to));
        let mut window: Vec<Uuid> = self.ids[lo..=hi].to_vec();
        if from < to {
            window.rotate_left(1);
        } else {
            window.rotate_right(1);
        }
        let changes = window
            .into_iter()
            .enumerate()
            .map(|(offset, id)| (id, lo + offset))
            .collect();

        Some(MovePlan { from, to, changes })
    }

    /// Apply a plan produced by `plan_move` against this same index.
    pub fn apply(&mut self, plan: &MovePlan) {
        if plan.is_noop() {
            return;
        }
        let id = self.ids.remove(plan.from);
        self.ids.insert(plan.to, id);
    }

    /// Plan removing `ids`: returns the positions surviving tasks shift to.
    pub fn plan_remove(&self, ids: &HashSet<Uuid>) -> Vec<PositionChange> {
        self.ids
            .iter()
            .filter(|id| !ids.contains(id))
            .enumerate()
            .filter_map(|(new_pos, id)| {
                let old_pos = self.position(*id)?;
                (old_pos != new_pos).then_some((*id, new_pos))
            })
            .collect()
    }

    pub fn remove(&mut self, ids: &HashSet<Uuid>) {
        self.ids.retain(|id| !ids.contains(id));
    }
}
