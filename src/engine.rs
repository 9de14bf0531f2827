//! Shared engine state
//!
//! All queue and list mutation, status transitions and speculation checks
//! that must agree with a transition happen on [`EngineState`] while the
//! engine mutex is held. The methods here are plain state transitions; the
//! callers in `scheduler` and `worker` own locking and wakeups.

use crate::arena::{ItemId, Pool, UnitId};
use crate::config::{BatchingPolicy, JitOptions};
use crate::entry::{EntryPoint, EntryState, SpeculationFailure};
use crate::host::{CompilableSequence, Host};
use crate::item::{IvarSpec, MutationRecord, WorkItem};
use crate::loader::{DynamicLoader, LoadedModule};
use crate::scratch::Scratch;
use crate::spec_state::SpecState;
use crate::stats::{EngineCounters, ItemStats, JitStatistics};
use crate::toolchain::Toolchain;
use crate::translate::{CodeGenerator, TranslationJob, UnitPreamble};
use crate::unit::{CompilationUnit, UnitList, UnitStatus};
use rustc_hash::FxHashMap as HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

/// Progress of the precompiled header task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderStatus {
    Pending,
    Ready,
    Failed,
}

/// A unit taken off the queue by a worker
pub(crate) struct UnitBatch {
    pub unit: UnitId,
    pub num: u32,
    pub preamble: UnitPreamble,
    pub jobs: Vec<TranslationJob>,
    pub source: PathBuf,
    pub artifact: PathBuf,
}

/// Where a compiled unit goes once its toolchain run succeeded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CompiledDisposition {
    /// Snapshot still valid; load the artifact
    Load,
    /// Speculation changed while compiling; the unit went back on the queue
    Requeued,
}

/// Everything guarded by the engine mutex
pub struct EngineState {
    pub(crate) items: Pool<ItemId, WorkItem>,
    pub(crate) units: Pool<UnitId, CompilationUnit>,
    pub(crate) queue: UnitList,
    pub(crate) done: UnitList,
    pub(crate) forming: Option<UnitId>,
    pub(crate) header: HeaderStatus,
    pub(crate) shutdown: bool,
    pub(crate) counters: EngineCounters,
    /// Modules of reclaimed units; native code is never unloaded
    retired_modules: Vec<Box<dyn LoadedModule>>,
    next_item_num: u32,
    next_unit_num: u32,
    /// Numbers every toolchain run so a recompiled unit never reuses the
    /// path of an artifact that is still mapped
    next_compile_num: u32,
    policy: BatchingPolicy,
    max_mutations: u32,
}

impl EngineState {
    pub fn new(policy: BatchingPolicy, max_mutations: u32) -> Self {
        Self {
            items: Pool::new(),
            units: Pool::new(),
            queue: UnitList::new(),
            done: UnitList::new(),
            forming: None,
            header: HeaderStatus::Pending,
            shutdown: false,
            counters: EngineCounters::default(),
            retired_modules: Vec::new(),
            next_item_num: 0,
            next_unit_num: 0,
            next_compile_num: 0,
            policy,
            max_mutations,
        }
    }

    // ==================== Items ====================

    /// Register a sequence and return its item
    pub fn create_item(&mut self, sequence: Arc<dyn CompilableSequence>) -> ItemId {
        let num = self.next_item_num;
        self.next_item_num += 1;
        self.counters.items_created += 1;
        self.items.insert(WorkItem::new(num, sequence, self.max_mutations))
    }

    pub fn item(&self, id: ItemId) -> Option<&WorkItem> {
        self.items.get(id)
    }

    pub fn unit(&self, id: UnitId) -> Option<&CompilationUnit> {
        self.units.get(id)
    }

    /// Status of the unit owning `item`
    pub fn item_unit_status(&self, item: ItemId) -> Option<UnitStatus> {
        let unit = self.items.get(item)?.unit?;
        self.units.get(unit).map(|u| u.status())
    }

    fn set_entry(&self, item: ItemId, state: EntryState) {
        if let Some(seq) = self.items.get(item).and_then(|i| i.sequence.as_ref()) {
            seq.entry_slot().store(state);
        }
    }

    /// Members of `unit` from first to last
    pub fn unit_items(&self, unit: UnitId) -> Vec<ItemId> {
        let mut out = Vec::new();
        let mut next = self.units.get(unit).and_then(|u| u.first);
        while let Some(id) = next {
            out.push(id);
            next = self.items[id].next;
        }
        out
    }

    /// Put `item` at the front of `unit`
    fn attach(&mut self, unit: UnitId, item: ItemId) {
        let first = self.units[unit].first;
        {
            let it = &mut self.items[item];
            debug_assert!(it.unit.is_none(), "item {} already attached", it.num);
            it.unit = Some(unit);
            it.prev = None;
            it.next = first;
        }
        match first {
            Some(first) => self.items[first].prev = Some(item),
            None => self.units[unit].last = Some(item),
        }
        let size = self.items[item].size;
        let u = &mut self.units[unit];
        u.first = Some(item);
        u.size += size;
        u.active += 1;
        tracing::trace!(
            target: "hotcc::scheduler",
            item = self.items[item].num,
            unit = u.num,
            size = u.size,
            "Item added to unit"
        );
    }

    /// Unlink `item` from its unit; returns the former unit
    fn detach(&mut self, item: ItemId) -> Option<UnitId> {
        let (unit, prev, next, size) = {
            let it = &mut self.items[item];
            let unit = it.unit.take()?;
            let links = (it.prev.take(), it.next.take());
            (unit, links.0, links.1, it.size)
        };
        match prev {
            Some(prev) => self.items[prev].next = next,
            None => self.units[unit].first = next,
        }
        match next {
            Some(next) => self.items[next].prev = prev,
            None => self.units[unit].last = prev,
        }
        let u = &mut self.units[unit];
        u.size -= size;
        u.active -= 1;
        Some(unit)
    }

    fn move_item(&mut self, item: ItemId, to: UnitId) {
        self.detach(item);
        self.attach(to, item);
    }

    // ==================== Units ====================

    fn create_unit(&mut self) -> UnitId {
        let num = self.next_unit_num;
        self.next_unit_num += 1;
        self.counters.units_created += 1;
        self.units.insert(CompilationUnit::new(num))
    }

    /// Queue the forming unit, if any; returns whether one was queued
    pub fn close_forming(&mut self) -> bool {
        let Some(unit) = self.forming.take() else {
            return false;
        };
        self.queue.push_back(unit, &mut self.units);
        let u = &mut self.units[unit];
        u.set_status(UnitStatus::Queued);
        tracing::debug!(target: "hotcc::scheduler", unit = u.num, size = u.size, "Finished forming unit");
        true
    }

    /// Free `unit` if no item is attached and no worker holds it
    pub fn reclaim_if_empty(&mut self, unit: UnitId) -> bool {
        let Some(u) = self.units.get(unit) else {
            return false;
        };
        // A worker still compiling or loading it reclaims it when done
        if !u.is_empty() || u.worker.is_some() || u.status() == UnitStatus::Executing {
            return false;
        }
        match u.status() {
            UnitStatus::Forming => {
                if self.forming == Some(unit) {
                    self.forming = None;
                }
            }
            UnitStatus::Queued => self.queue.remove(unit, &mut self.units),
            UnitStatus::Failed | UnitStatus::Succeeded | UnitStatus::Loaded => {
                if self.done.contains(unit, &self.units) {
                    self.done.remove(unit, &mut self.units);
                }
            }
            UnitStatus::Executing => unreachable!(),
        }
        if let Some(mut u) = self.units.remove(unit) {
            tracing::debug!(target: "hotcc::scheduler", unit = u.num, status = %u.status(), "Unit reclaimed");
            if let Some(module) = u.module.take() {
                self.retired_modules.push(module);
            }
            self.counters.units_reclaimed += 1;
        }
        true
    }

    // ==================== Client operations ====================

    /// Attach `item` to the forming unit; returns whether a unit was queued
    pub fn submit(&mut self, item: ItemId) -> bool {
        if !self.items.contains(item) || self.items[item].unit.is_some() {
            return false;
        }
        let unit = match self.forming {
            Some(unit) => unit,
            None => {
                let unit = self.create_unit();
                self.forming = Some(unit);
                unit
            }
        };
        self.attach(unit, item);
        self.set_entry(item, EntryState::NotReady);
        if self.policy.should_close(self.units[unit].size) {
            self.close_forming()
        } else {
            false
        }
    }

    /// Move `item` into the unit at the head of the queue
    ///
    /// The item is exchanged for the head unit's last item so both units
    /// keep their amount of work. A unit left empty by the exchange is
    /// reclaimed. A forming unit with nothing ahead of it is simply queued.
    pub fn raise_priority(&mut self, item: ItemId) {
        let Some(unit) = self.items.get(item).and_then(|i| i.unit) else {
            return;
        };
        let status = self.units[unit].status();
        let move_to_head = if self.forming == Some(unit) {
            if self.queue.is_empty() {
                self.close_forming();
                false
            } else {
                true
            }
        } else {
            status == UnitStatus::Queued && self.queue.head() != Some(unit)
        };
        if !move_to_head {
            return;
        }
        let Some(head) = self.queue.head() else {
            return;
        };
        tracing::debug!(
            target: "hotcc::scheduler",
            item = self.items[item].num,
            from = self.units[unit].num,
            to = self.units[head].num,
            "Raising item priority"
        );
        let last = self.units[head].last;
        self.move_item(item, head);
        if let Some(last) = last {
            self.move_item(last, unit);
        }
        self.reclaim_if_empty(unit);
    }

    /// Detach `item`, count a mutation and submit it again
    pub fn invalidate(&mut self, item: ItemId, record: Option<MutationRecord>) -> bool {
        if !self.items.contains(item) {
            return false;
        }
        let counted = self.items[item].mutations.push(record);
        if counted {
            self.counters.mutations += 1;
        }
        if let Some(unit) = self.detach(item) {
            tracing::info!(
                target: "hotcc::speculation",
                item = self.items[item].num,
                mutations = self.items[item].mutations.count(),
                unit = self.units[unit].num,
                "Item cancelled"
            );
            self.reclaim_if_empty(unit);
        }
        self.set_entry(item, EntryState::NotReady);
        self.submit(item)
    }

    /// Record a runtime speculation failure of `item` and recompile it
    ///
    /// Ignored unless the item currently runs speculative native code.
    pub fn speculation_failed(&mut self, item: ItemId, failure: SpeculationFailure) -> bool {
        let Some(it) = self.items.get_mut(item) else {
            return false;
        };
        let Some(seq) = it.sequence.clone() else {
            return false;
        };
        if it.is_safe() || seq.entry_slot().entry().is_none() {
            return false;
        }
        let record = match failure {
            SpeculationFailure::Instruction { pc } => seq.opcode_at(pc).map(|opcode| MutationRecord { pc, opcode }),
            SpeculationFailure::IvarLayout => {
                it.ivar_spec = IvarSpec::Off;
                None
            }
            SpeculationFailure::FramePointer => {
                it.frame_unequal = true;
                None
            }
        };
        tracing::debug!(target: "hotcc::speculation", item = it.num, ?failure, "Speculation failed");
        self.invalidate(item, record);
        true
    }

    /// Re-queue every finished unit whose snapshot no longer dominates
    /// `current`; returns how many were re-queued
    pub fn requeue_stale(&mut self, current: SpecState) -> usize {
        let stale: Vec<UnitId> = self
            .done
            .iter(&self.units)
            .filter(|&u| {
                let unit = &self.units[u];
                matches!(unit.status(), UnitStatus::Loaded | UnitStatus::Succeeded)
                    && !unit.snapshot.dominates(current)
            })
            .collect();
        for &unit in &stale {
            self.done.remove(unit, &mut self.units);
            self.queue.push_back(unit, &mut self.units);
            self.units[unit].set_status(UnitStatus::Queued);
            self.counters.units_requeued += 1;
            for item in self.unit_items(unit) {
                self.set_entry(item, EntryState::NotReady);
            }
            tracing::info!(
                target: "hotcc::speculation",
                unit = self.units[unit].num,
                "Global speculation changed -- recompiling unit"
            );
        }
        stale.len()
    }

    /// Clear the back-reference of a collected sequence
    pub fn release_sequence(&mut self, item: ItemId) {
        if let Some(it) = self.items.get_mut(item) {
            it.release_sequence();
        }
    }

    // ==================== Worker operations ====================

    /// Dequeue the head unit for `worker` and capture what translation needs
    pub(crate) fn take_next_unit(
        &mut self,
        worker: usize,
        current: SpecState,
        scratch: &Scratch,
        profile: bool,
    ) -> Option<UnitBatch> {
        let unit = self.queue.pop_front(&mut self.units)?;
        let members = self.unit_items(unit);
        let frame_unequal = members.iter().any(|&i| self.items[i].frame_unequal);
        let jobs = members
            .iter()
            .filter_map(|&i| TranslationJob::capture(&self.items[i], frame_unequal))
            .collect();

        let u = &mut self.units[unit];
        u.set_status(UnitStatus::Executing);
        u.snapshot = current;
        u.worker = Some(worker);
        u.started_at = Some(Instant::now());
        let compile = self.next_compile_num;
        self.next_compile_num += 1;
        let source = scratch.unit_source(u.num, compile);
        let artifact = scratch.unit_artifact(u.num, compile);
        u.source_path = Some(source.clone());
        u.artifact_path = Some(artifact.clone());
        tracing::info!(target: "hotcc::worker", worker, unit = u.num, items = members.len(), "Starting unit");

        Some(UnitBatch {
            unit,
            num: u.num,
            preamble: UnitPreamble { snapshot: current, frame_unequal, profile },
            jobs,
            source,
            artifact,
        })
    }

    fn finish_execution(&mut self, unit: UnitId) {
        let u = &mut self.units[unit];
        u.worker = None;
        u.source_path = None;
        u.artifact_path = None;
        if let Some(started) = u.started_at.take() {
            tracing::debug!(target: "hotcc::worker", unit = u.num, elapsed = ?started.elapsed(), "Unit processed");
        }
    }

    /// Mark an executing or succeeded unit failed; members fall back to
    /// interpretation for good
    pub(crate) fn fail_unit(&mut self, unit: UnitId) {
        self.finish_execution(unit);
        self.units[unit].set_status(UnitStatus::Failed);
        self.done.push_back(unit, &mut self.units);
        self.counters.units_failed += 1;
        for item in self.unit_items(unit) {
            self.set_entry(item, EntryState::Unavailable);
        }
        self.reclaim_if_empty(unit);
    }

    /// Record a successful toolchain run and decide whether to load
    pub(crate) fn unit_compiled(&mut self, unit: UnitId, current: SpecState) -> CompiledDisposition {
        self.counters.units_compiled += 1;
        self.units[unit].set_status(UnitStatus::Succeeded);
        if self.requeue_if_stale(unit, current) {
            CompiledDisposition::Requeued
        } else {
            CompiledDisposition::Load
        }
    }

    /// Put a succeeded unit back on the queue when its snapshot no longer
    /// dominates `current`
    fn requeue_if_stale(&mut self, unit: UnitId, current: SpecState) -> bool {
        let u = &self.units[unit];
        if u.snapshot.dominates(current) {
            return false;
        }
        tracing::info!(
            target: "hotcc::speculation",
            unit = u.num,
            "Global speculation changed -- put unit back into the queue"
        );
        self.finish_execution(unit);
        // Every member may have been invalidated while compiling
        if !self.reclaim_if_empty(unit) {
            self.units[unit].set_status(UnitStatus::Queued);
            self.queue.push_back(unit, &mut self.units);
            self.counters.units_requeued += 1;
        }
        true
    }

    /// Publish resolved entry points and mark the unit loaded; returns
    /// false when speculation changed during the load and the unit was
    /// re-queued instead
    ///
    /// Only items still attached get an entry; an item resolved to `None`
    /// becomes unavailable without failing the rest of the unit.
    pub(crate) fn unit_loaded(
        &mut self,
        unit: UnitId,
        module: Box<dyn LoadedModule>,
        resolved: &HashMap<u32, Option<EntryPoint>>,
        current: SpecState,
    ) -> bool {
        if self.requeue_if_stale(unit, current) {
            self.retired_modules.push(module);
            return false;
        }
        self.finish_execution(unit);
        for item in self.unit_items(unit) {
            let num = self.items[item].num;
            match resolved.get(&num) {
                Some(Some(entry)) => self.set_entry(item, EntryState::Ready(*entry)),
                Some(None) => {
                    self.counters.missing_symbols += 1;
                    self.set_entry(item, EntryState::Unavailable);
                }
                // Released before translation; nothing to publish
                None => {}
            }
        }
        let u = &mut self.units[unit];
        u.module = Some(module);
        u.set_status(UnitStatus::Loaded);
        self.done.push_back(unit, &mut self.units);
        self.counters.units_loaded += 1;
        self.reclaim_if_empty(unit);
        true
    }

    // ==================== Reporting & teardown ====================

    pub fn statistics(&self) -> JitStatistics {
        let rows = self
            .items
            .iter()
            .map(|(_, item)| ItemStats {
                label: item.label.clone(),
                unit: item.unit.and_then(|u| self.units.get(u)).map(|u| u.num),
                item: item.num,
                size: item.size,
                counts: item.call_counts(),
                mutations: item.mutations.records().to_vec(),
            })
            .collect();
        JitStatistics::new(self.counters, rows)
    }

    /// Units on the queue from head to tail
    pub fn queue_order(&self) -> Vec<UnitId> {
        self.queue.iter(&self.units).collect()
    }

    /// Free every unit and item; loaded modules stay mapped
    pub(crate) fn teardown(&mut self) {
        for unit in self.units.drain() {
            if let Some(module) = unit.module {
                self.retired_modules.push(module);
            }
        }
        self.items.drain();
        self.queue = UnitList::new();
        self.done = UnitList::new();
        self.forming = None;
        for module in self.retired_modules.drain(..) {
            std::mem::forget(module);
        }
    }
}

/// State and collaborators shared by the client, the header task and the
/// workers
pub(crate) struct Shared {
    state: Mutex<EngineState>,
    /// Header task finished (either way)
    pub header_ready: Condvar,
    /// Some unit status changed; wakes clients in `fetch_entry_point`
    pub status_changed: Condvar,
    /// Work was queued or shutdown requested; wakes workers
    pub work_available: Condvar,
    enabled: AtomicBool,
    pub options: JitOptions,
    pub scratch: Scratch,
    pub host: Arc<dyn Host>,
    pub generator: Arc<dyn CodeGenerator>,
    pub toolchain: Arc<dyn Toolchain>,
    pub loader: Arc<dyn DynamicLoader>,
}

impl Shared {
    pub fn new(
        options: JitOptions,
        scratch: Scratch,
        host: Arc<dyn Host>,
        generator: Arc<dyn CodeGenerator>,
        toolchain: Arc<dyn Toolchain>,
        loader: Arc<dyn DynamicLoader>,
    ) -> Self {
        Self {
            state: Mutex::new(EngineState::new(options.batching.clone(), options.max_mutations)),
            header_ready: Condvar::new(),
            status_changed: Condvar::new(),
            work_available: Condvar::new(),
            enabled: AtomicBool::new(true),
            options,
            scratch,
            host,
            generator,
            toolchain,
            loader,
        }
    }

    /// Lock the engine state; a panicked worker does not wedge the engine
    pub fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn wait<'a>(&self, cv: &Condvar, guard: MutexGuard<'a, EngineState>) -> MutexGuard<'a, EngineState> {
        cv.wait(guard).unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Release);
    }
}
