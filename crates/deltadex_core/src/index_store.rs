//! The served segments.
//!
//! Each registered entity has a core slot and a delta slot. A slot is an
//! `RwLock<SegmentSlot>`; replacing a segment takes the write lock only long
//! enough to swap the `Arc`, so queries keep reading the previous segment
//! until the swap. With a directory attached, the new segment is persisted
//! before the swap.

use crate::dir::IndexDir;
use crate::error::{CoreError, CoreResult};
use crate::segment::{Segment, SegmentKind};
use crate::types::Generation;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, warn};

/// State of one segment slot.
#[derive(Debug, Clone, Default)]
pub enum SegmentSlot {
    /// Never built.
    #[default]
    Empty,
    /// Serving a segment.
    Ready(Arc<Segment>),
    /// The segment exists but cannot be served.
    Unavailable(String),
}

impl SegmentSlot {
    /// Returns the segment if the slot is ready.
    #[must_use]
    pub fn segment(&self) -> Option<&Arc<Segment>> {
        match self {
            Self::Ready(segment) => Some(segment),
            _ => None,
        }
    }

    /// Short state name for status output.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::Ready(_) => "ready",
            Self::Unavailable(_) => "unavailable",
        }
    }
}

#[derive(Debug, Default)]
struct Slot {
    state: RwLock<SegmentSlot>,
    build: Arc<Mutex<()>>,
    last_generation: Mutex<Generation>,
    stamp: Mutex<Option<SystemTime>>,
}

#[derive(Debug, Default)]
struct EntitySlots {
    core: Slot,
    delta: Slot,
}

impl EntitySlots {
    fn slot(&self, kind: SegmentKind) -> &Slot {
        match kind {
            SegmentKind::Core => &self.core,
            SegmentKind::Delta => &self.delta,
        }
    }
}

/// Core and delta segments for every registered entity.
#[derive(Debug, Default)]
pub struct IndexStore {
    dir: Option<IndexDir>,
    entities: RwLock<HashMap<String, Arc<EntitySlots>>>,
}

impl IndexStore {
    /// Creates a store that keeps segments in memory only.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Creates a store that persists segments in a directory.
    #[must_use]
    pub fn persistent(dir: IndexDir) -> Self {
        Self {
            dir: Some(dir),
            entities: RwLock::new(HashMap::new()),
        }
    }

    /// Registers an entity, loading its segments from disk if present.
    ///
    /// A segment file that fails to load leaves the slot
    /// [`SegmentSlot::Unavailable`]; it is not an error.
    pub fn register(&self, entity: &str) -> CoreResult<()> {
        let slots = Arc::new(EntitySlots::default());
        if self.dir.is_some() {
            for kind in [SegmentKind::Core, SegmentKind::Delta] {
                self.load(entity, kind, slots.slot(kind))?;
            }
        }
        self.entities.write().insert(entity.to_string(), slots);
        Ok(())
    }

    fn load(&self, entity: &str, kind: SegmentKind, slot: &Slot) -> CoreResult<()> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        let stamp = dir.segment_modified(entity, kind)?;
        let state = match dir.read_segment(entity, kind)? {
            None => SegmentSlot::Empty,
            Some(bytes) => match Segment::decode(&bytes) {
                Ok(segment) if segment.entity() == entity && segment.kind() == kind => {
                    let mut last = slot.last_generation.lock();
                    if segment.generation() > *last {
                        *last = segment.generation();
                    }
                    debug!(entity, %kind, generation = %segment.generation(), "segment loaded");
                    SegmentSlot::Ready(Arc::new(segment))
                }
                Ok(segment) => SegmentSlot::Unavailable(format!(
                    "segment file holds {} {} segment",
                    segment.entity(),
                    segment.kind()
                )),
                Err(e) => {
                    warn!(entity, %kind, error = %e, "segment failed to load");
                    SegmentSlot::Unavailable(e.to_string())
                }
            },
        };
        *slot.state.write() = state;
        *slot.stamp.lock() = stamp;
        Ok(())
    }

    /// Reloads segment files written by other processes.
    ///
    /// Returns the number of slots reloaded.
    pub fn refresh(&self) -> CoreResult<usize> {
        let Some(dir) = &self.dir else {
            return Ok(0);
        };
        let entities: Vec<(String, Arc<EntitySlots>)> = self
            .entities
            .read()
            .iter()
            .map(|(name, slots)| (name.clone(), Arc::clone(slots)))
            .collect();

        let mut reloaded = 0;
        for (entity, slots) in entities {
            for kind in [SegmentKind::Core, SegmentKind::Delta] {
                let slot = slots.slot(kind);
                // Skip slots being rebuilt here; the builder swaps them itself.
                let Some(_build) = slot.build.try_lock() else {
                    continue;
                };
                let on_disk = dir.segment_modified(&entity, kind)?;
                if on_disk != *slot.stamp.lock() {
                    self.load(&entity, kind, slot)?;
                    reloaded += 1;
                }
            }
        }
        Ok(reloaded)
    }

    fn slots(&self, entity: &str) -> CoreResult<Arc<EntitySlots>> {
        self.entities
            .read()
            .get(entity)
            .cloned()
            .ok_or_else(|| CoreError::unknown_entity(entity))
    }

    /// Returns a copy of a slot's state.
    pub fn slot(&self, entity: &str, kind: SegmentKind) -> CoreResult<SegmentSlot> {
        Ok(self.slots(entity)?.slot(kind).state.read().clone())
    }

    /// Returns the served segment, if any.
    pub fn segment(&self, entity: &str, kind: SegmentKind) -> CoreResult<Option<Arc<Segment>>> {
        Ok(self.slot(entity, kind)?.segment().cloned())
    }

    /// Returns the mutex that serializes builds of one slot.
    pub fn build_lock(&self, entity: &str, kind: SegmentKind) -> CoreResult<Arc<Mutex<()>>> {
        Ok(Arc::clone(&self.slots(entity)?.slot(kind).build))
    }

    /// Returns the generation for the next build of a slot.
    pub fn next_generation(&self, entity: &str, kind: SegmentKind) -> CoreResult<Generation> {
        let slots = self.slots(entity)?;
        let last = *slots.slot(kind).last_generation.lock();
        Ok(last.next())
    }

    /// Persists and then serves a new segment.
    ///
    /// If persisting fails the slot keeps its previous segment.
    pub fn replace(&self, segment: Segment) -> CoreResult<Arc<Segment>> {
        let entity = segment.entity().to_string();
        let kind = segment.kind();
        let slots = self.slots(&entity)?;
        let slot = slots.slot(kind);

        if let Some(dir) = &self.dir {
            dir.write_segment(&entity, kind, &segment.encode()?)?;
            *slot.stamp.lock() = dir.segment_modified(&entity, kind)?;
        }

        {
            let mut last = slot.last_generation.lock();
            if segment.generation() > *last {
                *last = segment.generation();
            }
        }
        let segment = Arc::new(segment);
        *slot.state.write() = SegmentSlot::Ready(Arc::clone(&segment));
        debug!(entity = %entity, %kind, generation = %segment.generation(), "segment swapped in");
        Ok(segment)
    }
}
