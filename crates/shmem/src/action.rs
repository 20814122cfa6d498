// SPDX-License-Identifier: Apache-2.0

//! Deferred side effects of table operations.
//!
//! Table operations never invoke callbacks while the segment mutex is
//! held. Instead they emit a list of actions; the caller executes them
//! after unlocking: items addressed to itself through local callbacks,
//! items addressed to other processes through best-effort delivery.
//! Delivery is idempotent: a target re-derives the truth from the
//! tables on its next call, so a lost or duplicated item is harmless.

use crate::cpuset::CpuSet;
use crate::ProcessId;
use smallvec::SmallVec;

/// A single deferred side effect addressed to one process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// The target should start running on the CPU.
    Enable {
        /// Target process.
        pid: ProcessId,
        /// CPU to start using.
        cpuid: usize,
    },
    /// The target should stop running on the CPU.
    Disable {
        /// Target process.
        pid: ProcessId,
        /// CPU to vacate.
        cpuid: usize,
    },
    /// The target's registered mask changed.
    SetMask {
        /// Target process.
        pid: ProcessId,
        /// The new registered mask.
        mask: CpuSet,
    },
}

impl Action {
    /// The process this action is addressed to.
    #[must_use]
    pub fn target(&self) -> ProcessId {
        match self {
            Action::Enable { pid, .. } | Action::Disable { pid, .. } | Action::SetMask { pid, .. } => *pid,
        }
    }
}

/// Ordered list of actions emitted by one table operation.
///
/// Most operations touch one or two CPUs, so the list is inline up to a
/// handful of items.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ActionList {
    items: SmallVec<[Action; 4]>,
}

impl ActionList {
    /// An empty list.
    #[must_use]
    pub fn new() -> Self {
        ActionList::default()
    }

    /// Records an enable for `pid` on `cpuid`.
    pub fn enable(&mut self, pid: ProcessId, cpuid: usize) {
        self.push(Action::Enable { pid, cpuid });
    }

    /// Records a disable for `pid` on `cpuid`. Duplicates are coalesced:
    /// a victim holding a pending disable for a CPU never sees a second
    /// one from the same operation.
    pub fn disable(&mut self, pid: ProcessId, cpuid: usize) {
        self.push(Action::Disable { pid, cpuid });
    }

    /// Records a mask change notification for `pid`.
    pub fn set_mask(&mut self, pid: ProcessId, mask: CpuSet) {
        self.push(Action::SetMask { pid, mask });
    }

    fn push(&mut self, action: Action) {
        if !self.items.contains(&action) {
            self.items.push(action);
        }
    }

    /// Appends all items of `other`, preserving order and coalescing.
    pub fn append(&mut self, other: ActionList) {
        for action in other.items {
            self.push(action);
        }
    }

    /// Number of actions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the list is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Iterates the actions in emission order.
    pub fn iter(&self) -> impl Iterator<Item = &Action> + '_ {
        self.items.iter()
    }
}

impl IntoIterator for ActionList {
    type Item = Action;
    type IntoIter = smallvec::IntoIter<[Action; 4]>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

impl<'a> IntoIterator for &'a ActionList {
    type Item = &'a Action;
    type IntoIter = std::slice::Iter<'a, Action>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_emission_order() {
        let mut actions = ActionList::new();
        actions.disable(222, 1);
        actions.enable(111, 1);
        let items: Vec<_> = actions.into_iter().collect();
        assert_eq!(
            items,
            vec![
                Action::Disable { pid: 222, cpuid: 1 },
                Action::Enable { pid: 111, cpuid: 1 },
            ]
        );
    }

    #[test]
    fn coalesces_duplicate_disables() {
        let mut actions = ActionList::new();
        actions.disable(222, 1);
        actions.enable(111, 1);
        actions.disable(222, 1);
        assert_eq!(actions.len(), 2);
    }

    #[test]
    fn append_preserves_coalescing() {
        let mut first = ActionList::new();
        first.disable(222, 1);
        let mut second = ActionList::new();
        second.disable(222, 1);
        second.enable(111, 2);
        first.append(second);
        assert_eq!(first.len(), 2);
    }

    #[test]
    fn target_extraction() {
        let action = Action::SetMask {
            pid: 7,
            mask: CpuSet::single(0),
        };
        assert_eq!(action.target(), 7);
    }
}
