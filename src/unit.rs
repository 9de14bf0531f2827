//! Compilation units and the lists that sequence them
//!
//! ```text
//! Forming -> Queued -> Executing -> Failed
//!              ^           |          ^
//!              |           v          | load failed
//!              |       Succeeded -> Loaded
//!              |           |          |
//!              +-----------+----------+
//!               global speculation changed
//! ```

use crate::arena::{ItemId, Pool, UnitId};
use crate::loader::LoadedModule;
use crate::spec_state::SpecState;
use std::fmt;
use std::path::PathBuf;
use std::time::Instant;

/// Lifecycle status of a compilation unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnitStatus {
    /// Accepting items; not yet queued
    Forming,
    /// Waiting for a worker
    Queued,
    /// A worker is generating, compiling and loading it
    Executing,
    /// Compilation or load failed; members stay interpreted
    Failed,
    /// Artifact built, not yet loaded
    Succeeded,
    /// Entry points published
    Loaded,
}

impl UnitStatus {
    /// Whether `self -> next` is an edge of the lifecycle graph
    pub fn can_transition_to(self, next: UnitStatus) -> bool {
        use UnitStatus::*;
        matches!(
            (self, next),
            (Forming, Queued)
                | (Queued, Executing)
                | (Executing, Failed)
                | (Executing, Succeeded)
                | (Succeeded, Loaded)
                | (Succeeded, Failed)
                | (Succeeded, Queued)
                | (Loaded, Queued)
        )
    }

    /// Whether a client waiting on the unit can stop waiting
    pub fn is_terminal(self) -> bool {
        matches!(self, UnitStatus::Loaded | UnitStatus::Failed)
    }
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UnitStatus::Forming => "forming",
            UnitStatus::Queued => "queued",
            UnitStatus::Executing => "executing",
            UnitStatus::Failed => "failed",
            UnitStatus::Succeeded => "succeeded",
            UnitStatus::Loaded => "loaded",
        };
        f.write_str(name)
    }
}

/// A batch of work items compiled into one artifact
pub struct CompilationUnit {
    pub num: u32,
    status: UnitStatus,
    pub(crate) first: Option<ItemId>,
    pub(crate) last: Option<ItemId>,
    /// Aggregate size of member items
    pub size: usize,
    /// Attached items
    pub active: usize,
    /// Generated source, defined while executing
    pub source_path: Option<PathBuf>,
    /// Built artifact, defined while executing or succeeded
    pub artifact_path: Option<PathBuf>,
    /// Worker processing the unit, defined while executing
    pub worker: Option<usize>,
    pub module: Option<Box<dyn LoadedModule>>,
    /// Conditions the generated code was allowed to assume away
    pub snapshot: SpecState,
    pub started_at: Option<Instant>,
    pub(crate) prev: Option<UnitId>,
    pub(crate) next: Option<UnitId>,
}

impl CompilationUnit {
    pub fn new(num: u32) -> Self {
        Self {
            num,
            status: UnitStatus::Forming,
            first: None,
            last: None,
            size: 0,
            active: 0,
            source_path: None,
            artifact_path: None,
            worker: None,
            module: None,
            snapshot: SpecState::conservative(),
            started_at: None,
            prev: None,
            next: None,
        }
    }

    pub fn status(&self) -> UnitStatus {
        self.status
    }

    /// Move along the lifecycle graph
    pub fn set_status(&mut self, next: UnitStatus) {
        debug_assert!(
            self.status.can_transition_to(next),
            "unit {}: illegal transition {} -> {}",
            self.num,
            self.status,
            next
        );
        self.status = next;
    }

    pub fn first_item(&self) -> Option<ItemId> {
        self.first
    }

    pub fn is_empty(&self) -> bool {
        self.active == 0
    }
}

impl fmt::Debug for CompilationUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompilationUnit")
            .field("num", &self.num)
            .field("status", &self.status)
            .field("size", &self.size)
            .field("active", &self.active)
            .field("snapshot", &self.snapshot)
            .field("loaded", &self.module.is_some())
            .finish()
    }
}

/// Doubly linked list of units threaded through the unit pool
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct UnitList {
    head: Option<UnitId>,
    tail: Option<UnitId>,
    len: usize,
}

impl UnitList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn head(&self) -> Option<UnitId> {
        self.head
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Append `id`, which must not be on any list
    pub fn push_back(&mut self, id: UnitId, units: &mut Pool<UnitId, CompilationUnit>) {
        units[id].next = None;
        units[id].prev = self.tail;
        match self.tail {
            Some(tail) => units[tail].next = Some(id),
            None => self.head = Some(id),
        }
        self.tail = Some(id);
        self.len += 1;
    }

    /// Detach and return the head
    pub fn pop_front(&mut self, units: &mut Pool<UnitId, CompilationUnit>) -> Option<UnitId> {
        let head = self.head?;
        self.remove(head, units);
        Some(head)
    }

    /// Unlink `id`, which must be on this list
    pub fn remove(&mut self, id: UnitId, units: &mut Pool<UnitId, CompilationUnit>) {
        let (prev, next) = (units[id].prev, units[id].next);
        match prev {
            Some(prev) => units[prev].next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => units[next].prev = prev,
            None => self.tail = prev,
        }
        units[id].prev = None;
        units[id].next = None;
        self.len -= 1;
    }

    /// Whether `id` is linked into this list
    pub fn contains(&self, id: UnitId, units: &Pool<UnitId, CompilationUnit>) -> bool {
        self.iter(units).any(|u| u == id)
    }

    /// Units from head to tail
    pub fn iter<'a>(&self, units: &'a Pool<UnitId, CompilationUnit>) -> UnitListIter<'a> {
        UnitListIter { next: self.head, units }
    }
}

pub struct UnitListIter<'a> {
    next: Option<UnitId>,
    units: &'a Pool<UnitId, CompilationUnit>,
}

impl Iterator for UnitListIter<'_> {
    type Item = UnitId;

    fn next(&mut self) -> Option<UnitId> {
        let id = self.next?;
        self.next = self.units.get(id).and_then(|u| u.next);
        Some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_with(n: u32) -> (Pool<UnitId, CompilationUnit>, Vec<UnitId>) {
        let mut pool = Pool::new();
        let ids = (0..n).map(|i| pool.insert(CompilationUnit::new(i))).collect();
        (pool, ids)
    }

    #[test]
    fn test_transition_graph() {
        use UnitStatus::*;
        assert!(Forming.can_transition_to(Queued));
        assert!(Queued.can_transition_to(Executing));
        assert!(Executing.can_transition_to(Succeeded));
        assert!(Succeeded.can_transition_to(Loaded));
        assert!(Loaded.can_transition_to(Queued));
        assert!(Succeeded.can_transition_to(Queued));
        assert!(!Failed.can_transition_to(Queued));
        assert!(!Forming.can_transition_to(Executing));
        assert!(!Loaded.can_transition_to(Executing));
        assert!(!Queued.can_transition_to(Loaded));
    }

    #[test]
    fn test_fifo_order() {
        let (mut pool, ids) = pool_with(3);
        let mut list = UnitList::new();
        for &id in &ids {
            list.push_back(id, &mut pool);
        }
        assert_eq!(list.iter(&pool).collect::<Vec<_>>(), ids);
        assert_eq!(list.pop_front(&mut pool), Some(ids[0]));
        assert_eq!(list.len(), 2);
        assert_eq!(list.head(), Some(ids[1]));
    }

    #[test]
    fn test_remove_middle_and_ends() {
        let (mut pool, ids) = pool_with(4);
        let mut list = UnitList::new();
        for &id in &ids {
            list.push_back(id, &mut pool);
        }
        list.remove(ids[1], &mut pool);
        list.remove(ids[3], &mut pool);
        assert_eq!(list.iter(&pool).collect::<Vec<_>>(), vec![ids[0], ids[2]]);
        list.remove(ids[0], &mut pool);
        list.remove(ids[2], &mut pool);
        assert!(list.is_empty());
        assert_eq!(list.pop_front(&mut pool), None);
        assert!(!list.contains(ids[0], &pool));
    }

    #[test]
    fn test_new_unit_is_forming_and_conservative() {
        let unit = CompilationUnit::new(5);
        assert_eq!(unit.status(), UnitStatus::Forming);
        assert_eq!(unit.snapshot, SpecState::conservative());
        assert!(unit.is_empty());
    }
}
