//! Tensor blocks and their residency records.
//!
//! A [`TensorBlock`] knows which devices hold a copy of its data. Each copy is described by a
//! [`Residency`] record; a record may carry a pending effect tying it to an unresolved
//! operation, which is applied once that operation reaches a terminal state.

use std::sync::Arc;

use itertools::Itertools;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{
    ErrorKind, MAX_DEV_PRESENT, MAX_TENSOR_RANK,
    bounded::{Bounded, CapacityError},
    device::{DeviceId, Location},
    memory::Block,
    num::DataKind,
    ops::PlanError,
    task::{TaskCell, TaskStatus},
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TensorError {
    #[error("tensor block is empty")]
    Empty,
    #[error("tensor block has no copy on device {0}")]
    NotPresent(DeviceId),
    #[error("copy on device {0} is being written or read by an unfinished operation")]
    InProgress(DeviceId),
    #[error("tensor block has unfinished operations")]
    Busy,
    #[error("no available source copy")]
    NoSource,
    #[error("tensor byte size overflows")]
    Overflow,
    #[error("rank {0} exceeds the maximum of {MAX_TENSOR_RANK}")]
    Rank(usize),
    #[error("invalid shape: zero extent in dimension {0}")]
    Extent(usize),
    #[error("tensor block already resides on {0} devices")]
    TooManyCopies(usize),
    #[error("data kind {0} mismatches {1}")]
    KindMismatch(DataKind, DataKind),
    #[error("invalid external address {0:#x}")]
    Address(usize),
    #[error("discard is not a placement mode")]
    InvalidCopy,
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error("last write to the tensor block failed with code {0}")]
    WriteFailed(i32),
}

impl TensorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TensorError::Empty | TensorError::NotPresent(_) | TensorError::NoSource => {
                ErrorKind::ObjectIsEmpty
            }
            TensorError::InProgress(_) | TensorError::Busy => ErrorKind::InProgress,
            TensorError::Overflow => ErrorKind::IntegerOverflow,
            TensorError::TooManyCopies(_) => ErrorKind::LimitExceeded,
            TensorError::Rank(_)
            | TensorError::Extent(_)
            | TensorError::KindMismatch(..)
            | TensorError::Address(_)
            | TensorError::InvalidCopy
            | TensorError::Plan(_) => ErrorKind::InvalidArgs,
            TensorError::WriteFailed(_) => ErrorKind::Failure,
        }
    }
}

impl From<CapacityError> for TensorError {
    fn from(value: CapacityError) -> Self {
        Self::TooManyCopies(value.0)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TensorId;

/// Extents of a tensor block. Rank 0 is a scalar.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Shape {
    rank: usize,
    extents: [usize; MAX_TENSOR_RANK],
}

impl Default for Shape {
    fn default() -> Self {
        Self::scalar()
    }
}

impl std::fmt::Display for Shape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({})", self.extents().iter().format(", "))
    }
}

impl Shape {
    pub const fn scalar() -> Self {
        Self {
            rank: 0,
            extents: [1; MAX_TENSOR_RANK],
        }
    }

    pub fn new(extents: impl AsRef<[usize]>) -> Result<Self, TensorError> {
        let extents = extents.as_ref();
        if extents.len() > MAX_TENSOR_RANK {
            return Err(TensorError::Rank(extents.len()));
        }
        if let Some(dim) = extents.iter().position(|&x| x == 0) {
            return Err(TensorError::Extent(dim));
        }
        let mut shape = Self::scalar();
        shape.rank = extents.len();
        shape.extents[..extents.len()].copy_from_slice(extents);
        Ok(shape)
    }

    #[inline]
    pub fn rank(&self) -> usize {
        self.rank
    }

    #[inline]
    pub fn extents(&self) -> &[usize] {
        &self.extents[..self.rank]
    }

    /// Number of elements.
    pub fn volume(&self) -> Result<usize, TensorError> {
        self.extents()
            .iter()
            .try_fold(1usize, |acc, &x| acc.checked_mul(x))
            .ok_or(TensorError::Overflow)
    }
}

/// Memory behind one copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backing {
    /// A block of the device's argument buffer, released with the copy.
    Buffer(Block),
    /// Caller-owned memory, never freed by this crate.
    External(usize),
}

impl Backing {
    #[inline]
    pub fn addr(&self) -> usize {
        match *self {
            Backing::Buffer(block) => block.addr,
            Backing::External(addr) => addr,
        }
    }
}

/// What the copy becomes once its pending operation is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Effect {
    /// A new copy being filled. Dropped if the operation fails; the failure is reported on
    /// the block only if `records_failure` is set.
    Produce { records_failure: bool },
    /// The copy is read by the operation. `retire` drops it on success.
    Read { retire: bool },
    /// The copy is overwritten in place.
    Write,
    /// The copy is outdated by the operation and dropped on success.
    Stale,
}

impl Effect {
    /// Reads share a copy with other reads; every other effect claims it alone.
    #[inline]
    fn is_shared(self) -> bool {
        matches!(self, Effect::Read { .. })
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Pending {
    pub cell: Arc<TaskCell>,
    pub effect: Effect,
}

/// One copy of a tensor block's data on one device.
#[derive(Debug)]
pub struct Residency {
    device: DeviceId,
    kind: DataKind,
    available: bool,
    backing: Backing,
    /// Logical time of the last completed write.
    touched: u64,
    /// Any number of reads and at most one exclusive effect.
    pending: Vec<Pending>,
    /// Dropped as soon as nothing is pending on it.
    retired: bool,
}

impl Residency {
    pub(crate) fn new(device: DeviceId, kind: DataKind, backing: Backing, touched: u64) -> Self {
        Self {
            device,
            kind,
            available: true,
            backing,
            touched,
            pending: vec![],
            retired: false,
        }
    }

    /// A copy that is filled by `cell`.
    pub(crate) fn produced(
        device: DeviceId,
        kind: DataKind,
        block: Block,
        cell: Arc<TaskCell>,
        records_failure: bool,
    ) -> Self {
        let effect = Effect::Produce { records_failure };
        Self {
            device,
            kind,
            available: false,
            backing: Backing::Buffer(block),
            touched: 0,
            pending: vec![Pending { cell, effect }],
            retired: false,
        }
    }

    #[inline]
    pub fn device(&self) -> DeviceId {
        self.device
    }

    #[inline]
    pub fn kind(&self) -> DataKind {
        self.kind
    }

    /// The copy holds valid data and no unfinished operation writes it.
    #[inline]
    pub fn is_available(&self) -> bool {
        self.available
    }

    #[inline]
    pub fn backing(&self) -> Backing {
        self.backing
    }

    #[inline]
    pub fn touched(&self) -> u64 {
        self.touched
    }

    /// Any unfinished operation involves the copy.
    #[inline]
    pub fn is_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// An unfinished operation fills, writes or outdates the copy.
    pub fn is_exclusive(&self) -> bool {
        self.pending.iter().any(|x| !x.effect.is_shared())
    }

    /// Number of unfinished operations reading the copy.
    pub fn readers(&self) -> usize {
        self.pending.iter().filter(|x| x.effect.is_shared()).count()
    }

    #[inline]
    pub fn location(&self) -> Location {
        Location {
            device: self.device,
            addr: self.backing.addr(),
        }
    }

    /// Ties the copy to an unfinished operation.
    pub(crate) fn set_pending(&mut self, cell: Arc<TaskCell>, effect: Effect) {
        debug_assert!(!self.is_exclusive());
        if matches!(effect, Effect::Write) {
            self.available = false;
        }
        self.pending.push(Pending { cell, effect });
    }

    fn retire(&mut self) {
        self.retired = true;
        self.available = false;
    }

    /// Applies the outcome of one terminal operation. Returns the error code to report on
    /// the block, if any.
    fn resolve(
        &mut self,
        effect: Effect,
        status: TaskStatus,
        code: Option<i32>,
        stamp: u64,
    ) -> Option<i32> {
        match (effect, status) {
            (Effect::Produce { .. } | Effect::Write, TaskStatus::Completed) => {
                self.available = true;
                self.touched = stamp;
                None
            }
            (Effect::Read { retire: true } | Effect::Stale, TaskStatus::Completed) => {
                self.retire();
                None
            }
            (Effect::Read { retire: false }, TaskStatus::Completed) => None,
            (Effect::Produce { records_failure }, _) => {
                self.retire();
                code.filter(|_| records_failure)
            }
            (Effect::Write, _) => {
                log::warn!("write to copy on {} failed; contents are undefined", self.device);
                self.available = true;
                code
            }
            (Effect::Read { .. } | Effect::Stale, _) => None,
        }
    }
}

/// Result of applying the terminal effects of a tensor block's operations.
#[derive(Debug, Default)]
pub(crate) struct Settled {
    /// Memory of copies that no longer exist.
    pub released: Vec<Backing>,
}

/// A tensor block: shape, numeric kind and the devices holding a copy of its data.
///
/// A block without residency records is empty. Not cloneable: the block owns the buffer
/// memory of its copies.
#[derive(Debug)]
pub struct TensorBlock {
    id: uid::Id<TensorId>,
    shape: Shape,
    kind: DataKind,
    records: Bounded<Residency, MAX_DEV_PRESENT>,
    /// Error code of the last write that failed, until observed.
    failure: Option<i32>,
}

impl Default for TensorBlock {
    fn default() -> Self {
        Self::empty()
    }
}

impl TensorBlock {
    pub fn empty() -> Self {
        Self {
            id: uid::Id::new(),
            shape: Shape::scalar(),
            kind: DataKind::R8,
            records: Bounded::new(),
            failure: None,
        }
    }

    pub(crate) fn new(shape: Shape, kind: DataKind, record: Residency) -> Self {
        let mut records = Bounded::new();
        // capacity is never zero
        _ = records.push(record);
        Self {
            id: uid::Id::new(),
            shape,
            kind,
            records,
            failure: None,
        }
    }

    #[inline]
    pub fn id(&self) -> uid::Id<TensorId> {
        self.id
    }

    #[inline]
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    #[inline]
    pub fn kind(&self) -> DataKind {
        self.kind
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Number of devices holding a copy.
    #[inline]
    pub fn ndev(&self) -> usize {
        self.records.len()
    }

    pub fn volume(&self) -> Result<usize, TensorError> {
        self.shape.volume()
    }

    pub fn size_bytes(&self) -> Result<usize, TensorError> {
        self.volume()?
            .checked_mul(self.kind.size())
            .ok_or(TensorError::Overflow)
    }

    pub fn records(&self) -> impl Iterator<Item = &Residency> {
        self.records.iter()
    }

    pub fn devices(&self) -> impl Iterator<Item = DeviceId> + '_ {
        self.records.iter().map(|x| x.device)
    }

    pub fn record(&self, device: DeviceId) -> Option<&Residency> {
        self.records.iter().find(|x| x.device == device)
    }

    pub fn is_available(&self, device: DeviceId) -> bool {
        self.record(device).is_some_and(Residency::is_available)
    }

    /// Any copy is tied to an unfinished operation.
    pub fn has_pending(&self) -> bool {
        self.records.iter().any(Residency::is_pending)
    }

    #[inline]
    pub fn last_failure(&self) -> Option<i32> {
        self.failure
    }

    pub(crate) fn take_failure(&mut self) -> Option<i32> {
        self.failure.take()
    }

    pub(crate) fn position(&self, device: DeviceId) -> Option<usize> {
        self.records.iter().position(|x| x.device == device)
    }

    pub(crate) fn is_full(&self) -> bool {
        self.records.is_full()
    }

    pub(crate) fn get(&self, index: usize) -> Option<&Residency> {
        self.records.get(index)
    }

    pub(crate) fn get_mut(&mut self, index: usize) -> Option<&mut Residency> {
        self.records.get_mut(index)
    }

    pub(crate) fn records_mut(&mut self) -> impl Iterator<Item = &mut Residency> {
        self.records.iter_mut()
    }

    /// Adds a copy on a device that holds none.
    pub(crate) fn push(&mut self, record: Residency) -> Result<(), TensorError> {
        debug_assert!(self.position(record.device).is_none());
        self.records.push(record)?;
        Ok(())
    }

    pub(crate) fn remove(&mut self, index: usize) -> Option<Residency> {
        self.records.remove(index)
    }

    /// Removes every copy except the one on `device`.
    pub(crate) fn drop_except(&mut self, device: DeviceId) -> Vec<Residency> {
        self.records.extract_if(|x| x.device != device)
    }

    /// Removes every copy, returning the block to the empty state.
    pub(crate) fn clear(&mut self) -> Vec<Residency> {
        self.failure = None;
        self.records.clear()
    }

    /// Polls the operations of every pending copy once, and applies the effects of those that
    /// became terminal. `stamp` marks copies whose write completed.
    pub(crate) fn settle(&mut self, stamp: u64) -> Settled {
        let mut failure = None;
        for record in self.records.iter_mut() {
            for pending in std::mem::take(&mut record.pending) {
                let status = pending.cell.poll();
                if !status.is_terminal() {
                    record.pending.push(pending);
                    continue;
                }
                let code = pending.cell.error();
                failure = failure.or(record.resolve(pending.effect, status, code, stamp));
            }
        }
        if failure.is_some() {
            self.failure = failure;
        }
        let removed = self
            .records
            .extract_if(|record| record.retired && record.pending.is_empty());
        let released = removed.into_iter().map(|x| x.backing).collect();
        Settled { released }
    }
}
