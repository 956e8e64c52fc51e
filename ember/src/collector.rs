//! Collector facade: backend selection, timing statistics and the weak
//! reference list.
//!
//! The actual marking and sweeping live behind [`CollectionRoutine`].

use std::time::Instant;

use log::{debug, info, warn};

use crate::RealAddr;

/// Help text for the options [`GarbageCollector::process_option`] accepts.
pub const VM_OPTIONS_HELP: &str = "\
VM options:
    -nativegc      use the native collector if one is built in
    -interpgc      use the interpreted collector
    -usecgctimer   time collections in microseconds";

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BackendKind {
    Interpreted,
    Native,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TimerResolution {
    Millis,
    Micros,
}

/// Memory counters the facade samples around a collection.
pub trait ManagedMemory {
    fn free_memory(&self) -> u64;
    fn total_allocated(&self) -> u64;
}

pub trait Clock {
    fn millis(&self) -> u64;
    fn micros(&self) -> u64;

    fn now(&self, resolution: TimerResolution) -> u64 {
        match resolution {
            TimerResolution::Millis => self.millis(),
            TimerResolution::Micros => self.micros(),
        }
    }
}

#[derive(Debug)]
pub struct SystemClock {
    origin: Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Clock for SystemClock {
    fn millis(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    fn micros(&self) -> u64 {
        self.origin.elapsed().as_micros() as u64
    }
}

pub struct CollectionRequest<'a> {
    pub allocation_top: RealAddr,
    pub force_full: bool,
    pub weak_refs: &'a mut WeakReferenceList,
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct CollectionOutcome {
    pub full: bool,
    pub bytes_scanned: u64,
}

/// One collection algorithm. The facade owns an interpreted variant and
/// optionally a native one; exactly one runs per collection.
pub trait CollectionRoutine<M: ManagedMemory> {
    fn name(&self) -> &'static str;
    fn collect(&mut self, memory: &mut M, request: CollectionRequest<'_>) -> CollectionOutcome;
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct WeakRefId(usize);

#[derive(Debug)]
struct WeakRecord {
    referent: Option<RealAddr>,
    next: Option<WeakRefId>,
}

/// Weak reference records in an arena, linked from a single head.
///
/// Ids stay valid after a record is unlinked; its referent just reads
/// as cleared.
#[derive(Debug, Default)]
pub struct WeakReferenceList {
    records: Vec<WeakRecord>,
    head: Option<WeakRefId>,
    linked: usize,
}

impl WeakReferenceList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a record for `referent` onto the head of the list.
    pub fn add(&mut self, referent: RealAddr) -> WeakRefId {
        let id = WeakRefId(self.records.len());
        self.records.push(WeakRecord {
            referent: (!referent.is_null()).then_some(referent),
            next: self.head,
        });
        self.head = Some(id);
        self.linked += 1;
        id
    }

    pub fn head(&self) -> Option<WeakRefId> {
        self.head
    }

    pub fn len(&self) -> usize {
        self.linked
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub fn referent(&self, id: WeakRefId) -> Option<RealAddr> {
        self.records.get(id.0).and_then(|r| r.referent)
    }

    pub fn next(&self, id: WeakRefId) -> Option<WeakRefId> {
        self.records.get(id.0).and_then(|r| r.next)
    }

    /// Null out the referent of `id`. The list structure is untouched.
    pub fn clear_referent(&mut self, id: WeakRefId) {
        if let Some(record) = self.records.get_mut(id.0) {
            record.referent = None;
        }
    }

    /// Update the referent of `id` after its target moved.
    pub fn set_referent(&mut self, id: WeakRefId, referent: RealAddr) {
        if let Some(record) = self.records.get_mut(id.0) {
            record.referent = (!referent.is_null()).then_some(referent);
        }
    }

    /// Linked records, newest first.
    pub fn iter(&self) -> impl Iterator<Item = WeakRefId> + '_ {
        std::iter::successors(self.head, |&id| self.next(id))
    }

    /// Drop cleared records from the chain. Returns how many were unlinked.
    pub fn unlink_cleared(&mut self) -> usize {
        let mut removed = 0;
        let mut prev: Option<WeakRefId> = None;
        let mut cursor = self.head;
        while let Some(id) = cursor {
            let record = &self.records[id.0];
            cursor = record.next;
            if record.referent.is_some() {
                prev = Some(id);
                continue;
            }
            match prev {
                Some(p) => self.records[p.0].next = cursor,
                None => self.head = cursor,
            }
            self.records[id.0].next = None;
            removed += 1;
        }
        self.linked -= removed;
        removed
    }
}

/// Timing and byte counters. Times are in the timer resolution active
/// when they were taken.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectorStats {
    pub last_collection_time: u64,
    pub total_full_time: u64,
    pub max_full_time: u64,
    pub total_partial_time: u64,
    pub max_partial_time: u64,
    pub full_collections: u64,
    pub partial_collections: u64,
    pub last_bytes_freed: u64,
    pub total_bytes_freed: u64,
    pub last_bytes_scanned: u64,
    pub total_bytes_scanned: u64,
    pub allocated_checkpoint: u64,
}

impl CollectorStats {
    pub fn total_gc_time(&self) -> u64 {
        self.total_full_time + self.total_partial_time
    }

    pub fn collections(&self) -> u64 {
        self.full_collections + self.partial_collections
    }

    fn record_time(&mut self, elapsed: u64, full: bool) {
        self.last_collection_time = elapsed;
        if full {
            self.full_collections += 1;
            self.total_full_time += elapsed;
            self.max_full_time = self.max_full_time.max(elapsed);
        } else {
            self.partial_collections += 1;
            self.total_partial_time += elapsed;
            self.max_partial_time = self.max_partial_time.max(elapsed);
        }
    }
}

#[derive(Debug, Default)]
pub struct GcCreateInfo {
    pub backend: Option<BackendKind>,
    pub timer: Option<TimerResolution>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct GcSettings {
    pub backend: BackendKind,
    pub timer: TimerResolution,
}

impl Default for GcSettings {
    fn default() -> Self {
        Self {
            backend: BackendKind::Interpreted,
            timer: TimerResolution::Millis,
        }
    }
}

impl GcSettings {
    pub fn from_info(info: &GcCreateInfo) -> Self {
        let mut settings = Self::default();
        info.backend.inspect(|&val| settings.backend = val);
        info.timer.inspect(|&val| settings.timer = val);
        settings
    }
}

/// Entry point for collections over memory `M`.
///
/// A collection borrows the facade mutably, so a routine can never
/// start another one while it runs.
pub struct GarbageCollector<M: ManagedMemory> {
    interpreted: Box<dyn CollectionRoutine<M>>,
    native: Option<Box<dyn CollectionRoutine<M>>>,
    settings: GcSettings,
    clock: Box<dyn Clock>,
    stats: CollectorStats,
    weak_refs: WeakReferenceList,
}

impl<M: ManagedMemory> GarbageCollector<M> {
    pub fn new(
        info: GcCreateInfo,
        interpreted: Box<dyn CollectionRoutine<M>>,
        native: Option<Box<dyn CollectionRoutine<M>>>,
    ) -> Self {
        let mut gc = Self {
            interpreted,
            native,
            settings: GcSettings::default(),
            clock: Box::new(SystemClock::default()),
            stats: CollectorStats::default(),
            weak_refs: WeakReferenceList::new(),
        };
        let settings = GcSettings::from_info(&info);
        gc.settings.timer = settings.timer;
        gc.select_backend(settings.backend);
        gc
    }

    pub fn with_clock(mut self, clock: Box<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn settings(&self) -> GcSettings {
        self.settings
    }

    pub fn backend(&self) -> BackendKind {
        self.settings.backend
    }

    pub fn has_native_backend(&self) -> bool {
        self.native.is_some()
    }

    /// Switch backends. Asking for an absent native backend only warns.
    pub fn select_backend(&mut self, backend: BackendKind) {
        if backend == BackendKind::Native && self.native.is_none() {
            warn!(
                target: "ember::gc",
                "native collector not available, keeping {:?}",
                self.settings.backend
            );
            return;
        }
        self.settings.backend = backend;
    }

    /// Handle one VM command line option. Returns whether it was recognised.
    pub fn process_option(&mut self, arg: &str) -> bool {
        match arg {
            "-nativegc" => self.select_backend(BackendKind::Native),
            "-interpgc" => self.select_backend(BackendKind::Interpreted),
            "-usecgctimer" => self.settings.timer = TimerResolution::Micros,
            _ => return false,
        }
        true
    }

    /// Run one collection. Returns whether it was a full collection.
    pub fn collect(&mut self, memory: &mut M, allocation_top: RealAddr, force_full: bool) -> bool {
        let free_before = memory.free_memory();
        self.stats.allocated_checkpoint = memory.total_allocated();
        let resolution = self.settings.timer;
        let start = self.clock.now(resolution);

        let routine = match self.settings.backend {
            BackendKind::Native => self.native.as_mut().unwrap_or(&mut self.interpreted),
            BackendKind::Interpreted => &mut self.interpreted,
        };
        let name = routine.name();
        debug!(
            target: "ember::gc",
            "collecting with {name} (top {allocation_top}, force_full {force_full})"
        );
        let outcome = routine.collect(
            memory,
            CollectionRequest {
                allocation_top,
                force_full,
                weak_refs: &mut self.weak_refs,
            },
        );

        let elapsed = self.clock.now(resolution).saturating_sub(start);
        let freed = memory.free_memory().saturating_sub(free_before);
        self.stats.record_time(elapsed, outcome.full);
        self.stats.last_bytes_freed = freed;
        self.stats.total_bytes_freed += freed;
        self.stats.last_bytes_scanned = outcome.bytes_scanned;
        self.stats.total_bytes_scanned += outcome.bytes_scanned;

        info!(
            target: "ember::gc",
            "{} collection by {name}: {elapsed} {resolution:?}, {freed} bytes freed, {} bytes free",
            if outcome.full { "full" } else { "partial" },
            memory.free_memory()
        );
        outcome.full
    }

    pub fn stats(&self) -> &CollectorStats {
        &self.stats
    }

    pub fn total_gc_time(&self) -> u64 {
        self.stats.total_gc_time()
    }

    pub fn max_full_gc_time(&self) -> u64 {
        self.stats.max_full_time
    }

    pub fn max_partial_gc_time(&self) -> u64 {
        self.stats.max_partial_time
    }

    pub fn last_gc_time(&self) -> u64 {
        self.stats.last_collection_time
    }

    pub fn add_weak_reference(&mut self, referent: RealAddr) -> WeakRefId {
        self.weak_refs.add(referent)
    }

    pub fn weak_references(&self) -> &WeakReferenceList {
        &self.weak_refs
    }
}
