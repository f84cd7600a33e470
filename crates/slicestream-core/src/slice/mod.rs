//! # Slice Store
//!
//! Bounded, reclaimable partial-aggregate state.
//!
//! A [`Slice`] holds per-key partial states for one time range. Slices live
//! in an arena owned by the [`SliceStore`]; callers hold [`SliceId`] handles
//! (slot index plus generation), never owning pointers, so a handle kept
//! past reclamation is a detectable [`StoreError::StaleHandle`] rather than
//! a dangling reference.
//!
//! ## Locking
//!
//! The store's structural mutex covers arena slots, the range index, and
//! the per-source sequence log only. It is never held while `combine` or
//! `lower` runs. Per-key state is sharded; two updates to different keys of
//! the same slice usually touch different shards and do not contend.

use crate::aggregate::{AggregateError, AggregationFunction};
use crate::time::OriginId;
use crate::trigger::FiringState;
use crate::window::SliceRange;
use fxhash::FxHashMap;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

/// Number of per-key state shards per slice.
const STATE_SHARDS: usize = 16;

/// Stable handle to a slice in the store's arena.
///
/// Packs a slot index and a generation counter; a handle to a reclaimed
/// slot never resolves to the slot's next occupant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SliceId(u64);

impl SliceId {
    fn new(slot: u32, generation: u32) -> Self {
        Self((u64::from(generation) << 32) | u64::from(slot))
    }

    fn slot(self) -> usize {
        (self.0 & 0xFFFF_FFFF) as usize
    }

    fn generation(self) -> u32 {
        #[allow(clippy::cast_possible_truncation)]
        let generation = (self.0 >> 32) as u32;
        generation
    }

    /// Returns the raw handle value, for logging.
    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// Errors from slice store operations.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StoreError {
    /// The range index and arena disagree. Invariant violation, fatal to
    /// the operator instance.
    #[error("duplicate slice for range [{}, {})", range.start, range.end)]
    DuplicateSlice {
        /// Range the index points at inconsistently
        range: SliceRange,
    },

    /// A source re-sent a sequence number it already delivered. Fatal:
    /// sequence numbers identify slices exactly once.
    #[error("duplicate slice creation: source {} sequence {sequence}", origin.0)]
    DuplicateSequence {
        /// Sending source
        origin: OriginId,
        /// Re-sent sequence number
        sequence: u64,
    },

    /// The handle's slice has been reclaimed.
    #[error("stale slice handle {}", .0.as_u64())]
    StaleHandle(SliceId),

    /// A partial slice arrived from a source the store does not expect.
    #[error("unknown source {}", .0 .0)]
    UnknownSource(OriginId),
}

/// Partial-aggregate state for one time range.
///
/// Keys are sharded across [`STATE_SHARDS`] maps, each behind its own lock.
/// The firing state machine and counters are atomics, readable without any
/// lock.
#[derive(Debug)]
pub struct Slice<S> {
    range: SliceRange,
    sequence_number: u64,
    shards: Vec<Mutex<FxHashMap<i64, S>>>,
    record_count: AtomicU64,
    overflowed: AtomicBool,
    closed: AtomicBool,
    firing: FiringState,
    last_intermediate_fire: AtomicI64,
}

impl<S: Clone + Send + Sync + 'static> Slice<S> {
    fn new(range: SliceRange, sequence_number: u64) -> Self {
        Self {
            range,
            sequence_number,
            shards: (0..STATE_SHARDS).map(|_| Mutex::new(FxHashMap::default())).collect(),
            record_count: AtomicU64::new(0),
            overflowed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            firing: FiringState::new(),
            last_intermediate_fire: AtomicI64::new(i64::MIN),
        }
    }

    /// Returns the slice's time range.
    #[must_use]
    pub fn range(&self) -> SliceRange {
        self.range
    }

    /// Returns the slice's per-store sequence number.
    #[must_use]
    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    /// Returns the number of records merged so far.
    #[must_use]
    pub fn record_count(&self) -> u64 {
        self.record_count.load(Ordering::Acquire)
    }

    /// Returns true if any combine overflowed while merging into this slice.
    #[must_use]
    pub fn overflowed(&self) -> bool {
        self.overflowed.load(Ordering::Acquire)
    }

    /// Returns true once the slice has been merged away and drained. A
    /// closed slice refuses further merges; callers re-resolve through the
    /// store.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Returns the firing state machine.
    #[must_use]
    pub fn firing(&self) -> &FiringState {
        &self.firing
    }

    /// Processing time of the last intermediate firing, `i64::MIN` if none.
    #[must_use]
    pub fn last_intermediate_fire(&self) -> i64 {
        self.last_intermediate_fire.load(Ordering::Acquire)
    }

    /// Records an intermediate firing at `now`.
    pub fn set_last_intermediate_fire(&self, now: i64) {
        self.last_intermediate_fire.store(now, Ordering::Release);
    }

    /// Adds to the record count (separate from state merging so partial
    /// slices can carry their own counts).
    pub fn add_records(&self, n: u64) {
        self.record_count.fetch_add(n, Ordering::AcqRel);
    }

    fn shard_for(key: i64) -> usize {
        #[allow(clippy::cast_possible_truncation)]
        let h = fxhash::hash64(&key) as usize;
        h % STATE_SHARDS
    }

    /// Merges a partial state into the key's entry.
    ///
    /// Always a pure merge through `combine`, never an overwrite. On
    /// overflow the previous state is kept, the slice is flagged, and the
    /// error is returned for the caller to count.
    ///
    /// Returns `Ok(Some(incoming))` without merging when the slice is
    /// closed. The closed flag is checked under the shard lock and closing
    /// happens before the drain, so an update that sees the flag unset is
    /// guaranteed to be included in the drain.
    ///
    /// # Errors
    ///
    /// Returns [`AggregateError`] when `combine` fails.
    pub fn merge_key<F>(
        &self,
        function: &F,
        key: i64,
        incoming: S,
    ) -> Result<Option<S>, AggregateError>
    where
        F: AggregationFunction<State = S>,
    {
        let mut shard = self.shards[Self::shard_for(key)].lock();
        if self.closed.load(Ordering::Acquire) {
            return Ok(Some(incoming));
        }
        let merged = match shard.remove(&key) {
            Some(prev) => match function.combine(prev.clone(), incoming) {
                Ok(m) => m,
                Err(e) => {
                    shard.insert(key, prev);
                    self.overflowed.store(true, Ordering::Release);
                    return Err(e);
                }
            },
            None => incoming,
        };
        shard.insert(key, merged);
        Ok(None)
    }

    /// Clones out all `(key, state)` entries, for intermediate snapshots.
    #[must_use]
    pub fn snapshot_entries(&self) -> Vec<(i64, S)> {
        let mut entries = Vec::new();
        for shard in &self.shards {
            let shard = shard.lock();
            entries.extend(shard.iter().map(|(k, v)| (*k, v.clone())));
        }
        entries
    }

    /// Takes all `(key, state)` entries, leaving the slice empty. Used for
    /// final lowering and for shipping local pre-aggregates.
    #[must_use]
    pub fn take_entries(&self) -> Vec<(i64, S)> {
        let mut entries = Vec::new();
        for shard in &self.shards {
            let mut shard = shard.lock();
            entries.extend(std::mem::take(&mut *shard));
        }
        entries
    }
}

#[derive(Debug)]
struct Slot<S> {
    slice: Option<Arc<Slice<S>>>,
    generation: u32,
}

/// Contiguous-prefix sequence log for one partial-slice source.
#[derive(Debug, Default)]
struct SourceLog {
    next_expected: u64,
    pending: BTreeSet<u64>,
}

impl SourceLog {
    fn record(&mut self, sequence: u64) -> bool {
        if sequence < self.next_expected || !self.pending.insert(sequence) {
            return false;
        }
        while self.pending.remove(&self.next_expected) {
            self.next_expected += 1;
        }
        true
    }
}

#[derive(Debug)]
struct StoreInner<S> {
    slots: Vec<Slot<S>>,
    free: Vec<u32>,
    by_range: BTreeMap<SliceRange, SliceId>,
    next_sequence: u64,
    sources: FxHashMap<OriginId, SourceLog>,
}

impl<S> StoreInner<S> {
    fn resolve(&self, id: SliceId) -> Option<&Arc<Slice<S>>> {
        let slot = self.slots.get(id.slot())?;
        if slot.generation != id.generation() {
            return None;
        }
        slot.slice.as_ref()
    }

    fn watermark_index(&self) -> u64 {
        self.sources
            .values()
            .map(|log| log.next_expected)
            .min()
            .unwrap_or(0)
    }
}

/// One-shot drain of slices ready for final firing, in start order.
///
/// Yielded slices have already been removed from the store; dropping the
/// drain drops their state.
#[derive(Debug)]
pub struct SliceDrain<S> {
    slices: std::vec::IntoIter<Arc<Slice<S>>>,
}

impl<S> Iterator for SliceDrain<S> {
    type Item = Arc<Slice<S>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.slices.next()
    }
}

/// The per-operator-instance slice arena.
///
/// Generic over the aggregation function; the store owns slice lifetime
/// from creation through drain.
pub struct SliceStore<F: AggregationFunction> {
    function: Arc<F>,
    inner: Mutex<StoreInner<F::State>>,
    allowed_lateness_ms: i64,
}

impl<F: AggregationFunction> std::fmt::Debug for SliceStore<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SliceStore")
            .field("function", &self.function.name())
            .field("slices", &self.len())
            .field("allowed_lateness_ms", &self.allowed_lateness_ms)
            .finish()
    }
}

impl<F: AggregationFunction> SliceStore<F> {
    /// Creates an empty store.
    #[must_use]
    pub fn new(function: Arc<F>, allowed_lateness_ms: i64) -> Self {
        Self {
            function,
            inner: Mutex::new(StoreInner {
                slots: Vec::new(),
                free: Vec::new(),
                by_range: BTreeMap::new(),
                next_sequence: 0,
                sources: FxHashMap::default(),
            }),
            allowed_lateness_ms,
        }
    }

    /// Returns the aggregation function.
    #[must_use]
    pub fn function(&self) -> &Arc<F> {
        &self.function
    }

    /// Registers a source whose partial slices this store expects.
    ///
    /// The merging watermark index is the minimum contiguous sequence
    /// prefix over all registered sources, so registration must happen
    /// before the first [`SliceStore::append_partial_slice`].
    pub fn register_source(&self, source: OriginId) {
        let mut inner = self.inner.lock();
        inner.sources.entry(source).or_default();
    }

    /// Returns the number of live slices.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().by_range.len()
    }

    /// Returns true if the store holds no slices.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Looks up the slice for an exact range, creating it if absent.
    ///
    /// Single-writer-wins under the structural lock: concurrent callers
    /// for the same range get the same handle.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DuplicateSlice`] if the range index and arena
    /// disagree, which is an unrecoverable invariant violation.
    pub fn get_or_create(&self, range: SliceRange) -> Result<SliceId, StoreError> {
        let mut inner = self.inner.lock();
        if let Some(&id) = inner.by_range.get(&range) {
            let existing = inner
                .resolve(id)
                .ok_or(StoreError::DuplicateSlice { range })?;
            if existing.range() != range {
                return Err(StoreError::DuplicateSlice { range });
            }
            return Ok(id);
        }
        Ok(Self::insert_locked(&mut inner, range))
    }

    fn insert_locked(inner: &mut StoreInner<F::State>, range: SliceRange) -> SliceId {
        let sequence = inner.next_sequence;
        inner.next_sequence += 1;
        let slice = Arc::new(Slice::new(range, sequence));
        let id = if let Some(slot_idx) = inner.free.pop() {
            let slot = &mut inner.slots[slot_idx as usize];
            slot.slice = Some(slice);
            SliceId::new(slot_idx, slot.generation)
        } else {
            #[allow(clippy::cast_possible_truncation)]
            let slot_idx = inner.slots.len() as u32;
            inner.slots.push(Slot {
                slice: Some(slice),
                generation: 0,
            });
            SliceId::new(slot_idx, 0)
        };
        inner.by_range.insert(range, id);
        id
    }

    fn remove_locked(inner: &mut StoreInner<F::State>, id: SliceId) -> Option<Arc<Slice<F::State>>> {
        let slot = inner.slots.get_mut(id.slot())?;
        if slot.generation != id.generation() {
            return None;
        }
        let slice = slot.slice.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        #[allow(clippy::cast_possible_truncation)]
        inner.free.push(id.slot() as u32);
        inner.by_range.remove(&slice.range());
        Some(slice)
    }

    /// Resolves a handle to its slice.
    #[must_use]
    pub fn get(&self, id: SliceId) -> Option<Arc<Slice<F::State>>> {
        self.inner.lock().resolve(id).cloned()
    }

    /// Lifts a record value and merges it into the key's state.
    ///
    /// The structural lock is only held to resolve the handle; the combine
    /// happens against the slice's own shard lock.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::StaleHandle`] for a reclaimed or closed
    /// handle (the caller re-resolves and retries), or the aggregate
    /// overflow error (the slice is flagged and its previous state kept).
    pub fn update(&self, id: SliceId, key: i64, value: i64) -> Result<(), crate::Error> {
        let slice = self.get(id).ok_or(StoreError::StaleHandle(id))?;
        if slice
            .merge_key(self.function.as_ref(), key, self.function.lift(value))?
            .is_some()
        {
            return Err(StoreError::StaleHandle(id).into());
        }
        slice.add_records(1);
        Ok(())
    }

    /// Appends a partial slice shipped by a creation-role source.
    ///
    /// Returns `(previous, new)` merging watermark indexes: the minimum
    /// contiguous sequence prefix over all registered sources before and
    /// after this append. Sequence numbers `< new` are complete across all
    /// sources.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnknownSource`] for an unregistered source and
    /// [`StoreError::DuplicateSequence`] (fatal) for a re-sent sequence.
    pub fn append_partial_slice(
        &self,
        source: OriginId,
        sequence: u64,
        range: SliceRange,
        entries: Vec<(i64, F::State)>,
        record_count: u64,
    ) -> Result<(u64, u64), crate::Error> {
        let (prev_index, new_index, slice) = {
            let mut inner = self.inner.lock();
            if !inner.sources.contains_key(&source) {
                return Err(StoreError::UnknownSource(source).into());
            }
            let prev_index = inner.watermark_index();
            let log = inner.sources.entry(source).or_default();
            if !log.record(sequence) {
                return Err(StoreError::DuplicateSequence {
                    origin: source,
                    sequence,
                }
                .into());
            }
            let new_index = inner.watermark_index();
            let id = match inner.by_range.get(&range) {
                Some(&id) => id,
                None => Self::insert_locked(&mut inner, range),
            };
            let slice = inner
                .resolve(id)
                .ok_or(StoreError::DuplicateSlice { range })?
                .clone();
            (prev_index, new_index, slice)
        };
        // Combines happen outside the structural lock. A target closed by
        // a concurrent overlap merge hands the state back; re-resolve and
        // merge into the live slice for the range.
        for (key, state) in entries {
            let mut target = Arc::clone(&slice);
            let mut pending = state;
            loop {
                match target.merge_key(self.function.as_ref(), key, pending)? {
                    None => break,
                    Some(returned) => {
                        pending = returned;
                        let id = self.get_or_create(range)?;
                        target = self.get(id).ok_or(StoreError::DuplicateSlice { range })?;
                    }
                }
            }
        }
        slice.add_records(record_count);
        Ok((prev_index, new_index))
    }

    /// Marks `sequence` delivered for every registered source that has not
    /// shipped it, so the contiguous prefix advances past a sequence that
    /// fired without all sources. Returns the new merging watermark index.
    #[must_use]
    pub fn skip_sequence(&self, sequence: u64) -> u64 {
        let mut inner = self.inner.lock();
        for log in inner.sources.values_mut() {
            log.record(sequence);
        }
        inner.watermark_index()
    }

    /// Removes and returns all slices whose retention has expired at `ts`
    /// (`end + allowed_lateness <= ts`), in start order.
    #[must_use]
    pub fn slices_ready_before(&self, ts: i64) -> SliceDrain<F::State> {
        let mut inner = self.inner.lock();
        let due: Vec<SliceId> = inner
            .by_range
            .iter()
            .filter(|(range, _)| range.end.saturating_add(self.allowed_lateness_ms) <= ts)
            .map(|(_, &id)| id)
            .collect();
        let slices = due
            .into_iter()
            .filter_map(|id| Self::remove_locked(&mut inner, id))
            .collect::<Vec<_>>();
        SliceDrain {
            slices: slices.into_iter(),
        }
    }

    /// Removes and returns every slice, in start order. Shutdown path.
    #[must_use]
    pub fn drain_all(&self) -> SliceDrain<F::State> {
        self.slices_ready_before(i64::MAX)
    }

    /// Snapshots the live slices in start order, for trigger polling.
    #[must_use]
    pub fn open_slices(&self) -> Vec<(SliceId, Arc<Slice<F::State>>)> {
        let inner = self.inner.lock();
        inner
            .by_range
            .values()
            .filter_map(|&id| inner.resolve(id).map(|s| (id, s.clone())))
            .collect()
    }

    /// Returns the exact-range handle, if the slice is live.
    #[must_use]
    pub fn find_range(&self, range: SliceRange) -> Option<SliceId> {
        self.inner.lock().by_range.get(&range).copied()
    }

    /// Removes and returns the slice for an exact range.
    #[must_use]
    pub fn take_range(&self, range: SliceRange) -> Option<Arc<Slice<F::State>>> {
        let mut inner = self.inner.lock();
        let id = inner.by_range.get(&range).copied()?;
        Self::remove_locked(&mut inner, id)
    }

    /// Transitively merges overlapping slices (session windows).
    ///
    /// Runs of overlapping provisional ranges are replaced by one slice
    /// covering their union; per-key states merge through `combine`, so
    /// order does not matter. Structural surgery happens under the lock;
    /// the combines do not.
    ///
    /// # Errors
    ///
    /// Propagates aggregate overflow from the combines.
    pub fn merge_overlapping(&self) -> Result<(), crate::Error> {
        let groups = {
            let mut inner = self.inner.lock();
            let ranges: Vec<SliceRange> = inner.by_range.keys().copied().collect();
            let mut groups: Vec<(Arc<Slice<F::State>>, Vec<Arc<Slice<F::State>>>)> = Vec::new();

            let mut i = 0;
            while i < ranges.len() {
                let mut union = ranges[i];
                let mut members = vec![ranges[i]];
                let mut j = i + 1;
                while j < ranges.len() && ranges[j].start < union.end {
                    union = union.union(&ranges[j]);
                    members.push(ranges[j]);
                    j += 1;
                }
                if members.len() > 1 {
                    let old: Vec<Arc<Slice<F::State>>> = members
                        .iter()
                        .filter_map(|r| {
                            let id = inner.by_range.get(r).copied()?;
                            Self::remove_locked(&mut inner, id)
                        })
                        .collect();
                    let new_id = Self::insert_locked(&mut inner, union);
                    let new_slice = inner
                        .resolve(new_id)
                        .ok_or(StoreError::DuplicateSlice { range: union })?
                        .clone();
                    groups.push((new_slice, old));
                }
                i = j;
            }
            groups
        };

        for (target, old) in groups {
            for slice in old {
                // Close before draining: an in-flight update either lands
                // before the drain or is refused and re-resolves.
                slice.close();
                for (key, state) in slice.take_entries() {
                    let mut dest = Arc::clone(&target);
                    let mut pending = state;
                    loop {
                        match dest.merge_key(self.function.as_ref(), key, pending)? {
                            None => break,
                            Some(returned) => {
                                // The target was itself merged away by a
                                // concurrent call; follow to the live slice.
                                pending = returned;
                                let range = dest.range();
                                let id = self.get_or_create(range)?;
                                dest = self.get(id).ok_or(StoreError::DuplicateSlice { range })?;
                            }
                        }
                    }
                }
                target.add_records(slice.record_count());
                if slice.overflowed() {
                    target.overflowed.store(true, Ordering::Release);
                }
            }
        }
        Ok(())
    }
}
