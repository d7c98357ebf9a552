//! Pooled working buffers for repeated fusion runs.
//!
//! Every borrower (typically a worker thread) owns one slot of full-size
//! buffers. Slots are handed out through RAII leases and recycled when the
//! borrower lets go of them.

use std::any::{type_name, Any};
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ndarray::Array3;
use parking_lot::Mutex;

use super::postprocess::ComponentScratch;
use super::run::CollisionRegistry;
use super::volume::{Coord, LabelValue};
use crate::error::FusionError;

static NEXT_BORROWER: AtomicU64 = AtomicU64::new(1);

/// Identity of a pool client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BorrowerId(pub u64);

impl BorrowerId {
    /// A process-unique id, stable for the lifetime of the calling thread.
    pub fn current_thread() -> Self {
        thread_local! {
            static ID: u64 = NEXT_BORROWER.fetch_add(1, Ordering::Relaxed);
        }
        ID.with(|id| Self(*id))
    }
}

/// Buffers of one pool slot.
#[derive(Debug, Clone)]
pub struct SlotBuffers<L> {
    pub candidate: Array3<f64>,
    pub output: Array3<L>,
    pub components: ComponentScratch,
    pub registry: CollisionRegistry<L>,
    pub pending: Vec<usize>,
    pub hidden: Vec<(usize, L)>,
}

impl<L: LabelValue> SlotBuffers<L> {
    pub fn new(shape: Coord) -> Self {
        Self {
            candidate: Array3::zeros(shape),
            output: Array3::zeros(shape),
            components: ComponentScratch::new(shape),
            registry: CollisionRegistry::default(),
            pending: Vec::new(),
            hidden: Vec::new(),
        }
    }

    /// Placeholder that owns no heap memory.
    fn vacant() -> Self {
        Self::new([0, 0, 0])
    }
}

#[derive(Debug)]
struct SlotTable<L> {
    owners: Vec<Option<BorrowerId>>,
    buffers: Vec<Option<SlotBuffers<L>>>,
    by_borrower: HashMap<BorrowerId, usize>,
}

impl<L: LabelValue> SlotTable<L> {
    fn register(&mut self, borrower: BorrowerId, shape: Coord) -> usize {
        if let Some(&slot) = self.by_borrower.get(&borrower) {
            return slot;
        }
        let slot = match self.owners.iter().position(Option::is_none) {
            Some(free) => free,
            None => {
                self.owners.push(None);
                self.buffers.push(Some(SlotBuffers::new(shape)));
                self.owners.len() - 1
            }
        };
        self.owners[slot] = Some(borrower);
        self.by_borrower.insert(borrower, slot);
        log::debug!("memory slot {slot} registered to borrower {}", borrower.0);
        slot
    }

    fn unregister(&mut self, borrower: BorrowerId) -> Option<usize> {
        let slot = self.by_borrower.remove(&borrower)?;
        self.owners[slot] = None;
        log::debug!("memory slot {slot} released by borrower {}", borrower.0);
        Some(slot)
    }
}

/// Pool of full-size working buffers for one image shape and voxel type.
#[derive(Debug)]
pub struct ReusableMemory<L> {
    shape: Coord,
    table: Mutex<SlotTable<L>>,
}

impl<L: LabelValue> ReusableMemory<L> {
    pub fn new(shape: Coord) -> Self {
        Self {
            shape,
            table: Mutex::new(SlotTable {
                owners: Vec::new(),
                buffers: Vec::new(),
                by_borrower: HashMap::new(),
            }),
        }
    }

    pub const fn shape(&self) -> Coord {
        self.shape
    }

    /// Number of slots allocated so far.
    pub fn slot_count(&self) -> usize {
        self.table.lock().owners.len()
    }

    /// Binds `borrower` to a slot and returns its index.
    ///
    /// Idempotent: a registered borrower gets its current slot again. Freed
    /// slots are reused before new ones are allocated.
    pub fn register(&self, borrower: BorrowerId) -> usize {
        self.table.lock().register(borrower, self.shape)
    }

    /// Releases the slot of `borrower`; unknown borrowers are ignored.
    ///
    /// A slot whose buffers are out on a lease stays bound until the lease is
    /// dropped, so no other borrower can be handed the same slot.
    pub fn unregister(&self, borrower: BorrowerId) -> Option<usize> {
        let mut table = self.table.lock();
        let slot = *table.by_borrower.get(&borrower)?;
        if table.buffers[slot].is_none() {
            log::debug!(
                "memory slot {slot} is leased; borrower {} stays registered",
                borrower.0
            );
            return None;
        }
        table.unregister(borrower)
    }

    /// Slot currently bound to `borrower`.
    pub fn slot_of(&self, borrower: BorrowerId) -> Option<usize> {
        self.table.lock().by_borrower.get(&borrower).copied()
    }

    /// # Errors
    ///
    /// Returns `ShapeMismatch` when the pool was built for another shape.
    pub fn check_shape(&self, shape: Coord) -> Result<(), FusionError> {
        if shape == self.shape {
            Ok(())
        } else {
            Err(FusionError::ShapeMismatch {
                expected: self.shape,
                actual: shape,
            })
        }
    }

    /// Takes exclusive use of the borrower's slot until the lease is dropped.
    ///
    /// Dropping the lease returns the buffers and unregisters the borrower.
    ///
    /// # Errors
    ///
    /// Returns `SlotInUse` if the borrower already holds a lease.
    pub fn acquire(self: &Arc<Self>, borrower: BorrowerId) -> Result<PoolLease<L>, FusionError> {
        let mut table = self.table.lock();
        let slot = table.register(borrower, self.shape);
        let buffers = table.buffers[slot]
            .take()
            .ok_or(FusionError::SlotInUse {
                borrower: borrower.0,
            })?;
        Ok(PoolLease {
            pool: Arc::clone(self),
            borrower,
            slot,
            buffers,
        })
    }

    /// [`ReusableMemory::acquire`] after checking the requested shape.
    ///
    /// # Errors
    ///
    /// Returns `ShapeMismatch` or `SlotInUse`.
    pub fn acquire_for(
        self: &Arc<Self>,
        borrower: BorrowerId,
        shape: Coord,
    ) -> Result<PoolLease<L>, FusionError> {
        self.check_shape(shape)?;
        self.acquire(borrower)
    }
}

/// Exclusive access to one slot of a [`ReusableMemory`].
#[derive(Debug)]
pub struct PoolLease<L: LabelValue> {
    pool: Arc<ReusableMemory<L>>,
    borrower: BorrowerId,
    slot: usize,
    buffers: SlotBuffers<L>,
}

impl<L: LabelValue> PoolLease<L> {
    pub const fn slot(&self) -> usize {
        self.slot
    }

    pub const fn borrower(&self) -> BorrowerId {
        self.borrower
    }
}

impl<L: LabelValue> Deref for PoolLease<L> {
    type Target = SlotBuffers<L>;

    fn deref(&self) -> &Self::Target {
        &self.buffers
    }
}

impl<L: LabelValue> DerefMut for PoolLease<L> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buffers
    }
}

impl<L: LabelValue> Drop for PoolLease<L> {
    fn drop(&mut self) {
        let buffers = std::mem::replace(&mut self.buffers, SlotBuffers::vacant());
        let mut table = self.pool.table.lock();
        table.buffers[self.slot] = Some(buffers);
        table.unregister(self.borrower);
    }
}

type SharedPool = (&'static str, Arc<dyn Any + Send + Sync>);

/// Registry of pools keyed by image shape.
///
/// The first request for a shape fixes the voxel type of its pool.
#[derive(Default)]
pub struct MemoryPools {
    pools: Mutex<HashMap<Coord, SharedPool>>,
}

impl MemoryPools {
    pub fn new() -> Self {
        Self::default()
    }

    /// The pool for `shape`, created for voxel type `L` on first request.
    ///
    /// # Errors
    ///
    /// Returns `TypeMismatch` if the pool of `shape` holds another voxel type.
    pub fn pool_for<L: LabelValue>(&self, shape: Coord) -> Result<Arc<ReusableMemory<L>>, FusionError> {
        let mut pools = self.pools.lock();
        let (held, pool) = pools.entry(shape).or_insert_with(|| {
            log::debug!(
                "creating memory pool for {} voxels of shape {shape:?}",
                type_name::<L>()
            );
            let pool: Arc<dyn Any + Send + Sync> = Arc::new(ReusableMemory::<L>::new(shape));
            (type_name::<L>(), pool)
        });
        let held = *held;
        Arc::clone(pool)
            .downcast::<ReusableMemory<L>>()
            .map_err(|_| FusionError::TypeMismatch {
                expected: held,
                actual: type_name::<L>(),
            })
    }

    /// Number of distinct pools created.
    pub fn len(&self) -> usize {
        self.pools.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.lock().is_empty()
    }
}

impl std::fmt::Debug for MemoryPools {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryPools")
            .field("pools", &self.len())
            .finish()
    }
}
