//! The coordination context.
//!
//! A [`Context`] owns everything that lives between `initialize` and `shutdown`: the device
//! identity map, one argument buffer pool per device, pinned host memory, the active-task
//! slab and the constant caches of the GPUs. Contexts are independent of each other.

use std::{
    cmp::Reverse,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
};

use bytemuck::{Pod, Zeroable};
use derive_more::Display;
use itertools::Itertools;
use parking_lot::{Mutex, RwLock};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{
    BUFFER_GRANULE, CONST_CACHE_ENTRIES, Error, ErrorKind, MAX_ACTIVE_TASKS, MAX_DEV_PRESENT,
    MAX_TENSOR_OPERANDS, Result,
    bounded::Bounded,
    device::{
        Backend, Command, DeviceId, DeviceKind, DeviceMap, DeviceMapError, Location, Ticket,
        Transfer,
    },
    memory::{
        Arena, Block, BlockHandle, CacheKey, ConstCache, PinState, PinnedMemory, Pool, PoolStats,
        Slab, SlabEntry, cache::Lookup,
    },
    num::DataKind,
    ops::{
        Access, Contraction, CopyControl, CopyMode, IndexCount, Launch, MultiIndex, Plan, Planner,
        Role, Staging,
    },
    platform,
    task::{Binding, Task, TaskCell, TaskError, TaskOperand},
    tensor::{Backing, Effect, Residency, Shape, TensorBlock, TensorError},
};

/// Host argument buffer requested when none is configured.
pub const DEFAULT_HOST_BUFFER: usize = 1 << 26;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContextError {
    #[error("context is not initialized")]
    NotInitialized,
    #[error("context is already initialized")]
    AlreadyInitialized,
    #[error("{expected} runtime expected, found a {found} runtime")]
    Runtime {
        expected: DeviceKind,
        found: DeviceKind,
    },
    #[error("no {0} device is configured")]
    NoDevice(DeviceKind),
}

impl ContextError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ContextError::NotInitialized => ErrorKind::NotInitialized,
            ContextError::AlreadyInitialized => ErrorKind::AlreadyInitialized,
            ContextError::Runtime { .. } => ErrorKind::InvalidArgs,
            ContextError::NoDevice(_) => ErrorKind::NotAvailable,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Limits {
    /// Tasks that may be bound at once across all devices.
    pub max_active_tasks: usize,
    /// Constant-argument slots per GPU.
    pub const_cache_entries: usize,
    /// Allocation granule of the argument buffers, in bytes.
    pub granule: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_active_tasks: MAX_ACTIVE_TASKS,
            const_cache_entries: CONST_CACHE_ENTRIES,
            granule: BUFFER_GRANULE,
        }
    }
}

/// How a source copy is chosen when several devices hold an available one.
#[derive(Debug, Display, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum SourcePolicy {
    /// The cheapest transfer: same device, then to or from the host, then between devices of
    /// one kind. Ties go to the lower flat id.
    #[default]
    Cheapest,
    /// The copy written last. Ties go to the lower flat id.
    MostRecent,
}

#[derive(Debug, Clone)]
struct Group {
    backend: Arc<dyn Backend>,
    devices: Vec<u32>,
    buffer: usize,
}

#[derive(Debug, Clone)]
pub struct Config {
    host: Arc<dyn Backend>,
    host_buffer: usize,
    gpus: Option<Group>,
    accelerators: Option<Group>,
    planner: Arc<dyn Planner>,
    policy: SourcePolicy,
    limits: Limits,
}

impl Config {
    pub fn new<B: Backend + 'static>(host: Arc<B>) -> Self {
        Self {
            host,
            host_buffer: DEFAULT_HOST_BUFFER,
            gpus: None,
            accelerators: None,
            planner: Arc::new(IndexCount),
            policy: SourcePolicy::default(),
            limits: Limits::default(),
        }
    }

    /// Requested size of the host argument buffer. Zero leaves the host without one, so host
    /// copies can only live in caller-owned memory.
    pub fn host_buffer(mut self, bytes: usize) -> Self {
        self.host_buffer = bytes;
        self
    }

    /// GPUs served by `backend`, by kind-local index, each with an argument buffer of
    /// at most `bytes` bytes.
    pub fn gpus<B: Backend + 'static>(
        mut self,
        backend: Arc<B>,
        devices: impl IntoIterator<Item = u32>,
        bytes: usize,
    ) -> Self {
        let devices = devices.into_iter().collect();
        let buffer = bytes;
        self.gpus = Some(Group {
            backend,
            devices,
            buffer,
        });
        self
    }

    pub fn accelerators<B: Backend + 'static>(
        mut self,
        backend: Arc<B>,
        devices: impl IntoIterator<Item = u32>,
        bytes: usize,
    ) -> Self {
        let devices = devices.into_iter().collect();
        let buffer = bytes;
        self.accelerators = Some(Group {
            backend,
            devices,
            buffer,
        });
        self
    }

    pub fn planner(mut self, planner: impl Planner + 'static) -> Self {
        self.planner = Arc::new(planner);
        self
    }

    pub fn source_policy(mut self, policy: SourcePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    fn check(&self) -> Result<(), ContextError> {
        let groups = [
            (DeviceKind::Host, Some(&self.host)),
            (DeviceKind::Gpu, self.gpus.as_ref().map(|x| &x.backend)),
            (DeviceKind::Accelerator, self.accelerators.as_ref().map(|x| &x.backend)),
        ];
        for (expected, backend) in groups {
            match backend.map(|x| x.kind()) {
                Some(found) if found != expected => {
                    return Err(ContextError::Runtime { expected, found });
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// Argument buffer sizes actually reserved, which may be smaller than requested.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct BufferSizes {
    pub host: usize,
    /// Largest number of arguments the host buffer holds at once.
    pub host_arg_max: usize,
    /// Every other device, by flat id.
    pub devices: Vec<(DeviceId, usize)>,
}

/// Record kept in the active-task slab for each bound task.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct TaskRecord {
    pub ticket: u64,
    pub device: u32,
    pub operands: u32,
}

/// How a tensor block is populated on construction.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Init {
    /// Backed by a block of the device's argument buffer.
    #[default]
    Buffer,
    /// Backed by caller-owned memory at the given device address.
    External(usize),
}

/// Outcome of [`Context::place`] and [`Context::refresh`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// The copy was already there; nothing was issued.
    Resident,
    /// A transfer was issued; the copy becomes available when it completes.
    InFlight(Ticket),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DeviceState {
    pub id: DeviceId,
    pub kind: DeviceKind,
    pub local: u32,
    /// Argument buffer size.
    pub arena: usize,
    /// Argument buffer bytes left.
    pub free: usize,
    pub active_tasks: usize,
}

/// Occupancy of the index-record slab.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct IndexStats {
    pub capacity: usize,
    pub outstanding: usize,
    pub pinned: PinState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CacheStats {
    pub capacity: usize,
    pub resident: usize,
    pub referenced: usize,
}

/// Statistics of one device, printable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceStats {
    pub state: DeviceState,
    pub pool: PoolStats,
    /// Free blocks the pool could hand out, per power-of-two size.
    pub tiers: Vec<(usize, usize)>,
    pub free_list: String,
    /// Page-locking of the host argument buffer.
    pub pinned: Option<PinState>,
    /// Index records of scheduled tasks, listed with the host.
    pub indices: Option<IndexStats>,
    pub cache: Option<CacheStats>,
    pub tasks: Vec<TaskRecord>,
}

impl std::fmt::Display for DeviceStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let DeviceState {
            id,
            kind,
            local,
            active_tasks,
            ..
        } = self.state;
        writeln!(f, "{kind} device {local} ({id}), {active_tasks} active tasks")?;
        writeln!(f, "  buffer: {}", self.pool)?;
        if let Some(pinned) = self.pinned {
            writeln!(f, "  host buffer: {pinned}")?;
        }
        if let Some(IndexStats {
            capacity,
            outstanding,
            pinned,
        }) = self.indices
        {
            writeln!(f, "  index records: {outstanding}/{capacity} ({pinned})")?;
        }
        let tiers = self
            .tiers
            .iter()
            .filter(|(_, count)| *count > 0)
            .map(|(size, count)| format!("{size}×{count}"))
            .join(" ");
        writeln!(f, "  free tiers: {tiers}")?;
        writeln!(f, "  free list: {}", self.free_list)?;
        if let Some(CacheStats {
            capacity,
            resident,
            referenced,
        }) = self.cache
        {
            writeln!(f, "  constants: {resident}/{capacity} resident, {referenced} referenced")?;
        }
        for TaskRecord {
            ticket, operands, ..
        } in &self.tasks
        {
            writeln!(f, "  ticket {ticket}: {operands} operands")?;
        }
        Ok(())
    }
}

#[derive(Debug)]
pub(crate) struct Device {
    id: DeviceId,
    kind: DeviceKind,
    local: u32,
    backend: Arc<dyn Backend>,
    arena: Arena,
    pool: Mutex<Pool>,
    /// Free bytes of the pool, readable without its lock.
    free: AtomicUsize,
    active: AtomicUsize,
    cache: Option<Mutex<ConstCache>>,
}

impl Device {
    fn acquire(&self, size: usize) -> Result<Block> {
        let mut pool = self.pool.lock();
        let block = pool.get_block(size)?;
        self.free.store(pool.free_left(), Ordering::Relaxed);
        Ok(block)
    }

    fn release(&self, handle: BlockHandle) -> Result<()> {
        let mut pool = self.pool.lock();
        pool.release_block(handle)?;
        self.free.store(pool.free_left(), Ordering::Relaxed);
        Ok(())
    }

    fn state(&self) -> DeviceState {
        DeviceState {
            id: self.id,
            kind: self.kind,
            local: self.local,
            arena: self.arena.size,
            free: self.free.load(Ordering::Relaxed),
            active_tasks: self.active.load(Ordering::Relaxed),
        }
    }
}

/// How one operand of a contraction reaches the execution device.
#[derive(Debug, Clone, Copy)]
struct Prepared {
    role: Role,
    mode: CopyMode,
    bytes: usize,
    /// Index of the copy already on the execution device.
    resident: Option<usize>,
    /// Index of the copy the operand is staged from.
    source: Option<usize>,
    /// Block on the execution device the operand is staged into.
    block: Option<Block>,
    target: Location,
}

#[derive(Debug)]
pub(crate) struct Runtime {
    epoch: u64,
    live: AtomicBool,
    map: DeviceMap,
    devices: Vec<Device>,
    pinned: Mutex<PinnedMemory>,
    tasks: Mutex<Slab>,
    /// [`MultiIndex`] records of scheduled tasks, one per operand.
    indices: Mutex<Slab>,
    planner: Arc<dyn Planner>,
    policy: SourcePolicy,
    /// Logical time stamping completed writes.
    clock: AtomicU64,
}

impl Runtime {
    #[inline]
    pub(crate) fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    fn device(&self, id: DeviceId) -> Result<&Device, DeviceMapError> {
        self.devices
            .get(id.index())
            .ok_or(DeviceMapError::InvalidFlatId(id))
    }

    fn stamp(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn release_block(&self, block: &Block) {
        if !self.is_live() {
            return;
        }
        let result = self
            .device(block.handle.device)
            .map_err(Error::from)
            .and_then(|device| device.release(block.handle));
        if let Err(err) = result {
            log::error!("failed to release block {}: {err}", block.handle);
        }
    }

    fn release_backing(&self, backing: Backing) {
        if let Backing::Buffer(block) = backing {
            self.release_block(&block);
        }
    }

    /// Applies the effects of finished operations on the tensor block.
    fn settle(&self, tensor: &mut TensorBlock) {
        let settled = tensor.settle(self.stamp());
        for backing in settled.released {
            self.release_backing(backing);
        }
    }

    fn cost(&self, from: DeviceId, to: DeviceId) -> u8 {
        let kind = |id: DeviceId| self.devices.get(id.index()).map(|x| x.kind);
        match (kind(from), kind(to)) {
            _ if from == to => 0,
            (Some(DeviceKind::Host), _) | (_, Some(DeviceKind::Host)) => 1,
            (from, to) if from == to => 2,
            _ => 3,
        }
    }

    /// Picks the copy to transfer to `target` from.
    fn select_source(&self, tensor: &TensorBlock, target: DeviceId) -> Result<usize, TensorError> {
        let candidates = tensor
            .records()
            .enumerate()
            .filter(|(_, x)| x.device() != target && x.is_available() && !x.is_exclusive());
        let best = match self.policy {
            SourcePolicy::Cheapest => {
                candidates.min_by_key(|(_, x)| (self.cost(x.device(), target), x.device()))
            }
            SourcePolicy::MostRecent => {
                candidates.min_by_key(|(_, x)| (Reverse(x.touched()), x.device()))
            }
        };
        match best {
            Some((index, _)) => Ok(index),
            None if tensor.has_pending() => Err(TensorError::Busy),
            None => Err(TensorError::NoSource),
        }
    }

    /// The device whose runtime drives a transfer: the destination, unless that is the host.
    fn mover<'a>(&'a self, src: &'a Device, dst: &'a Device) -> &'a Device {
        match dst.kind {
            DeviceKind::Host => src,
            _ => dst,
        }
    }

    /// Issues a copy of the tensor block from the copy at `source` to `dst`.
    fn transfer(
        &self,
        tensor: &TensorBlock,
        source: usize,
        dst: Location,
    ) -> Result<(Arc<TaskCell>, Ticket)> {
        let src = tensor
            .get(source)
            .map(Residency::location)
            .ok_or(TensorError::NoSource)?;
        let bytes = tensor.size_bytes()?;
        let mover = self.mover(self.device(src.device)?, self.device(dst.device)?);
        let transfer = Transfer { src, dst, bytes };
        let ticket = mover.backend.submit(mover.local, Command::Transfer(transfer))?;
        log::debug!("{src} → {dst}: {bytes} bytes ({ticket})");

        let cell = TaskCell::new(mover.backend.clone(), mover.id, ticket);
        Ok((Arc::new(cell), ticket))
    }

    fn prepare(
        &self,
        exec: &Device,
        tensor: &TensorBlock,
        role: Role,
        mode: CopyMode,
    ) -> Result<Prepared> {
        let bytes = tensor.size_bytes()?;
        let mut prepared = Prepared {
            role,
            mode,
            bytes,
            resident: None,
            source: None,
            block: None,
            target: Location {
                device: exec.id,
                addr: 0,
            },
        };

        if let Some(index) = tensor.position(exec.id) {
            let record = tensor.get(index).ok_or(TensorError::NotPresent(exec.id))?;
            // reads share the copy with other readers
            if record.is_exclusive() || !record.is_available() {
                return Err(TensorError::InProgress(exec.id).into());
            }
            prepared.resident = Some(index);
            prepared.target = record.location();
            return Ok(prepared);
        }

        if mode != CopyMode::Discard && tensor.is_full() {
            return Err(TensorError::TooManyCopies(MAX_DEV_PRESENT).into());
        }
        let source = self.select_source(tensor, exec.id)?;
        let block = exec.acquire(bytes)?;
        prepared.source = Some(source);
        prepared.block = Some(block);
        prepared.target.addr = block.addr;
        Ok(prepared)
    }

    /// Writes the index record of every operand into the index slab.
    fn acquire_indices(&self, plan: &Plan) -> Result<Bounded<SlabEntry, MAX_TENSOR_OPERANDS>> {
        let mut slab = self.indices.lock();
        let mut entries = Bounded::new();
        let result = Role::ALL.into_iter().try_for_each(|role| {
            let entry = slab.acquire()?;
            _ = entries.push(entry);
            slab.write(entry, &plan.multi_index(role))
        });
        match result {
            Ok(()) => Ok(entries),
            Err(err) => {
                drop(slab);
                self.release_indices(entries.clear());
                Err(err.into())
            }
        }
    }

    fn release_indices(&self, entries: Vec<SlabEntry>) {
        let mut slab = self.indices.lock();
        for entry in entries {
            if let Err(err) = slab.release(entry) {
                log::error!("index record: {err}");
            }
        }
    }

    /// References the contraction pattern in the device's constant cache, uploading it on a miss.
    fn load_constant(
        &self,
        exec: &Device,
        cache: &Mutex<ConstCache>,
        key: CacheKey,
        pattern: &str,
    ) -> Result<usize> {
        let mut cache = cache.lock();
        match cache.get_entry(key)? {
            Lookup::Hit(slot) => Ok(slot),
            Lookup::Miss { slot, evicted } => {
                if let Some(ticket) = evicted.and_then(|x| x.upload) {
                    exec.backend.retire(ticket);
                }
                let contents = pattern.as_bytes();
                match exec.backend.submit(exec.local, Command::Upload { slot, contents }) {
                    Ok(ticket) => {
                        cache.set_upload(key, ticket)?;
                        Ok(slot)
                    }
                    Err(err) => {
                        cache.forget(key);
                        Err(err.into())
                    }
                }
            }
        }
    }

    /// Returns what a contraction acquired before it could be submitted.
    fn abandon(
        &self,
        exec: &Device,
        prepared: &[Prepared],
        constant: Option<CacheKey>,
        record: Option<SlabEntry>,
    ) {
        for block in prepared.iter().filter_map(|x| x.block) {
            self.release_block(&block);
        }
        if let (Some(key), Some(cache)) = (constant, &exec.cache) {
            if let Err(err) = cache.lock().release_entry(key) {
                log::error!("{err}");
            }
        }
        if let Some(record) = record {
            if let Err(err) = self.tasks.lock().release(record) {
                log::error!("{err}");
            }
        }
    }

    /// Ties the copies of one operand to a submitted contraction. Returns the block the task
    /// owns as a temporary, if any.
    fn commit(
        exec: DeviceId,
        tensor: &mut TensorBlock,
        prepared: &Prepared,
        cell: &Arc<TaskCell>,
    ) -> Option<Block> {
        let Prepared {
            role,
            mode,
            resident,
            source,
            block,
            ..
        } = *prepared;

        let access = role.access();
        match access {
            Access::ReadOnly => {
                let retire = resident.is_none() && mode == CopyMode::Move;
                if let Some(record) = resident.or(source).and_then(|x| tensor.get_mut(x)) {
                    record.set_pending(cell.clone(), Effect::Read { retire });
                }
            }
            Access::ReadWrite | Access::WriteOnly => {
                let written = match (resident, source) {
                    (Some(index), _) => Some(index),
                    (_, Some(index)) if mode != CopyMode::Move => Some(index),
                    _ => None,
                };
                // every copy not written by the contraction is outdated by it
                for (index, record) in tensor.records_mut().enumerate() {
                    let effect = match written == Some(index) {
                        true => Effect::Write,
                        false => Effect::Stale,
                    };
                    record.set_pending(cell.clone(), effect);
                }
            }
        }

        match (mode, block) {
            (CopyMode::Discard, block) => block,
            (_, Some(block)) => {
                // a failed staging of an input leaves the input itself intact
                let records_failure = access != Access::ReadOnly;
                let kind = tensor.kind();
                let record = Residency::produced(exec, kind, block, cell.clone(), records_failure);
                match tensor.push(record) {
                    Ok(()) => None,
                    Err(err) => {
                        log::error!("{err}: staged copy on {exec} becomes a temporary");
                        Some(block)
                    }
                }
            }
            (_, None) => None,
        }
    }

    /// Returns the resources of a destructed task.
    pub(crate) fn release_task(
        &self,
        device: DeviceId,
        operands: Vec<TaskOperand>,
        indices: Vec<SlabEntry>,
        record: SlabEntry,
        constant: Option<CacheKey>,
    ) {
        if !self.is_live() {
            log::debug!("task on {device} released after shutdown");
            return;
        }
        for block in operands.iter().filter_map(|x| x.temporary) {
            self.release_block(&block);
        }
        self.release_indices(indices);
        if let Ok(exec) = self.device(device) {
            if let (Some(key), Some(cache)) = (constant, &exec.cache) {
                if let Err(err) = cache.lock().release_entry(key) {
                    log::error!("{err}");
                }
            }
            exec.active.fetch_sub(1, Ordering::Relaxed);
        }
        if let Err(err) = self.tasks.lock().release(record) {
            log::error!("active task record: {err}");
        }
    }

    /// Releases pinned memory and every device's argument buffer.
    fn teardown(&self) {
        self.live.store(false, Ordering::Release);

        let tasks = self.tasks.lock().outstanding();
        if tasks > 0 {
            log::warn!("{tasks} tasks still bound at shutdown");
        }
        let pinned = self.pinned.lock().clear();
        log::debug!("released {pinned} pinned host allocations");

        for device in self.devices.iter().filter(|x| x.arena.size > 0) {
            let pool = device.pool.lock();
            if !pool.is_clean() {
                log::warn!(
                    "{} device {}: {} blocks still live at shutdown",
                    device.kind,
                    device.local,
                    pool.stats().live_blocks
                );
            }
            if let Err(err) = device.backend.release(device.local, pool.arena()) {
                log::warn!("{} device {}: {err}", device.kind, device.local);
            }
        }
    }
}

fn release_arenas(devices: &[Device]) {
    for device in devices.iter().filter(|x| x.arena.size > 0) {
        if let Err(err) = device.backend.release(device.local, device.arena) {
            log::warn!("{} device {}: {err}", device.kind, device.local);
        }
    }
}

/// Process-wide coordination state with an explicit `initialize`/`shutdown` lifecycle.
#[derive(Debug, Default)]
pub struct Context {
    runtime: RwLock<Option<Arc<Runtime>>>,
    epoch: AtomicU64,
}

impl Drop for Context {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.get_mut().take() {
            runtime.teardown();
        }
    }
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_initialized(&self) -> bool {
        self.runtime.read().is_some()
    }

    fn runtime(&self) -> Result<Arc<Runtime>, ContextError> {
        self.runtime
            .read()
            .clone()
            .ok_or(ContextError::NotInitialized)
    }

    /// Builds the device map and reserves the argument buffer of every device. Returns the
    /// buffer sizes actually reserved.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub fn initialize(&self, config: Config) -> Result<BufferSizes> {
        let mut slot = self.runtime.write();
        if slot.is_some() {
            return Err(ContextError::AlreadyInitialized.into());
        }
        config.check()?;

        let Config {
            host,
            host_buffer,
            gpus,
            accelerators,
            planner,
            policy,
            limits,
        } = config;
        let list = |group: &Option<Group>| group.as_ref().map_or(vec![], |x| x.devices.clone());
        let map = DeviceMap::new(&list(&gpus), &list(&accelerators))?;
        let tasks = Slab::new(
            size_of::<TaskRecord>(),
            limits.max_active_tasks,
            align_of::<TaskRecord>(),
        )?;
        let indices = Slab::new(
            size_of::<MultiIndex>(),
            limits.max_active_tasks.saturating_mul(MAX_TENSOR_OPERANDS),
            align_of::<MultiIndex>(),
        )?;
        let epoch = self.epoch.fetch_add(1, Ordering::Relaxed) + 1;

        let mut devices: Vec<Device> = Vec::with_capacity(map.len());
        for id in map.ids() {
            let (kind, local) = map.kind_id(id)?;
            let group = match kind {
                DeviceKind::Gpu => gpus.as_ref(),
                DeviceKind::Accelerator => accelerators.as_ref(),
                _ => None,
            };
            let (backend, bytes) = match (kind, group) {
                (DeviceKind::Host, _) => (host.clone(), host_buffer),
                (_, Some(group)) => (group.backend.clone(), group.buffer),
                (kind, None) => {
                    release_arenas(&devices);
                    return Err(DeviceMapError::InvalidKind(kind).into());
                }
            };
            let arena = match bytes {
                0 => Arena { base: 0, size: 0 },
                bytes => match backend.reserve(local, bytes) {
                    Ok(arena) => arena,
                    Err(err) => {
                        release_arenas(&devices);
                        return Err(err.into());
                    }
                },
            };
            log::info!("{kind} device {local} ({id}): {} bytes of argument buffer", arena.size);

            let cache = (kind == DeviceKind::Gpu)
                .then(|| Mutex::new(ConstCache::new(limits.const_cache_entries)));
            devices.push(Device {
                id,
                kind,
                local,
                backend,
                arena,
                pool: Mutex::new(Pool::new(id, epoch, arena, limits.granule)),
                free: AtomicUsize::new(arena.size),
                active: AtomicUsize::new(0),
                cache,
            });
        }

        // page-locking belongs to the GPU runtime
        let mut pinned = PinnedMemory::new(gpus.as_ref().map(|x| x.backend.clone()));
        let host_arena = devices.first().map(|x| x.arena);
        match host_arena {
            Some(arena) if arena.size == 0 => {}
            Some(arena) if pinned.can_pin() => {
                if let Err(err) = pinned.register(arena.base, arena.size) {
                    log::warn!("host argument buffer stays pageable: {err}");
                }
            }
            _ if devices.len() > 1 => {
                log::warn!("no GPU runtime to page-lock the host argument buffer");
            }
            _ => {}
        }
        if pinned.can_pin() {
            if let Err(err) = pinned.register(indices.base(), indices.span()) {
                log::warn!("index records stay pageable: {err}");
            }
        }

        let sizes = BufferSizes {
            host: host_arena.map_or(0, |x| x.size),
            host_arg_max: devices.first().map_or(0, |x| x.pool.lock().max_blocks()),
            devices: devices.iter().skip(1).map(|x| (x.id, x.arena.size)).collect(),
        };
        *slot = Some(Arc::new(Runtime {
            epoch,
            live: AtomicBool::new(true),
            map,
            devices,
            pinned: Mutex::new(pinned),
            tasks: Mutex::new(tasks),
            indices: Mutex::new(indices),
            planner,
            policy,
            clock: AtomicU64::new(0),
        }));
        Ok(sizes)
    }

    /// Releases all buffers and invalidates every outstanding handle.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub fn shutdown(&self) -> Result<()> {
        let runtime = self
            .runtime
            .write()
            .take()
            .ok_or(ContextError::NotInitialized)?;
        runtime.teardown();
        log::info!("context epoch {} shut down", runtime.epoch);
        Ok(())
    }

    pub fn flat_id(&self, kind: DeviceKind, local: u32) -> Result<DeviceId> {
        Ok(self.runtime()?.map.flat_id(kind, local)?)
    }

    pub fn kind_id(&self, id: DeviceId) -> Result<(DeviceKind, u32)> {
        Ok(self.runtime()?.map.kind_id(id)?)
    }

    /// Flat ids of all devices of `kind`.
    pub fn devices(&self, kind: DeviceKind) -> Result<Vec<DeviceId>> {
        Ok(self.runtime()?.map.ids_of(kind).collect())
    }

    /// Takes a block of at least `size` bytes from the device's argument buffer.
    pub fn get_block(&self, device: DeviceId, size: usize) -> Result<Block> {
        self.runtime()?.device(device)?.acquire(size)
    }

    pub fn release_block(&self, handle: BlockHandle) -> Result<()> {
        self.runtime()?.device(handle.device)?.release(handle)
    }

    /// Allocates page-locked host memory. Returns its address.
    pub fn alloc_pinned(&self, size: usize) -> Result<usize> {
        Ok(self.runtime()?.pinned.lock().alloc_pinned(size)?)
    }

    pub fn free_pinned(&self, addr: usize) -> Result<()> {
        Ok(self.runtime()?.pinned.lock().free_pinned(addr)?)
    }

    /// Page-locks caller-owned host memory.
    pub fn register_host(&self, addr: usize, size: usize) -> Result<()> {
        Ok(self.runtime()?.pinned.lock().register(addr, size)?)
    }

    pub fn unregister_host(&self, addr: usize) -> Result<()> {
        Ok(self.runtime()?.pinned.lock().unregister(addr)?)
    }

    pub fn pin_state(&self, addr: usize) -> Result<PinState> {
        Ok(self.runtime()?.pinned.lock().state(addr))
    }

    /// Creates a tensor block with one available copy on `device`.
    pub fn construct(
        &self,
        shape: Shape,
        kind: DataKind,
        device: DeviceId,
        init: Init,
    ) -> Result<TensorBlock> {
        let runtime = self.runtime()?;
        let device_ = runtime.device(device)?;
        let bytes = shape
            .volume()?
            .checked_mul(kind.size())
            .ok_or(TensorError::Overflow)?;
        let backing = match init {
            Init::Buffer => Backing::Buffer(device_.acquire(bytes)?),
            Init::External(0) => return Err(TensorError::Address(0).into()),
            Init::External(addr) => Backing::External(addr),
        };
        let record = Residency::new(device, kind, backing, runtime.stamp());
        Ok(TensorBlock::new(shape, kind, record))
    }

    /// Releases every copy of the tensor block, leaving it empty.
    pub fn destruct(&self, tensor: &mut TensorBlock) -> Result<()> {
        let runtime = self.runtime()?;
        runtime.settle(tensor);
        if tensor.has_pending() {
            return Err(TensorError::Busy.into());
        }
        for record in tensor.clear() {
            runtime.release_backing(record.backing());
        }
        Ok(())
    }

    /// Applies the outcome of finished operations to the tensor block's copies.
    pub fn reconcile(&self, tensor: &mut TensorBlock) -> Result<()> {
        self.runtime()?.settle(tensor);
        Ok(())
    }

    /// Spins until no operation on the tensor block is unfinished.
    pub fn wait_idle(&self, tensor: &mut TensorBlock) -> Result<()> {
        let runtime = self.runtime()?;
        let mut iteration = 0u32;
        loop {
            runtime.settle(tensor);
            if !tensor.has_pending() {
                return Ok(());
            }
            platform::relax(iteration);
            iteration = iteration.saturating_add(1);
        }
    }

    /// Makes the tensor block's data available on `device`, issuing a transfer from the best
    /// source copy if it is not there yet. With [`CopyMode::Move`] every other copy is released
    /// once the data is on `device`.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all, fields(%device, %mode)))]
    pub fn place(
        &self,
        tensor: &mut TensorBlock,
        device: DeviceId,
        mode: CopyMode,
    ) -> Result<Placement> {
        let runtime = self.runtime()?;
        let target = runtime.device(device)?;
        runtime.settle(tensor);
        if tensor.is_empty() {
            return Err(TensorError::Empty.into());
        }
        if mode == CopyMode::Discard {
            return Err(TensorError::InvalidCopy.into());
        }

        if let Some(record) = tensor.record(device) {
            if record.is_exclusive() || !record.is_available() {
                return Err(TensorError::InProgress(device).into());
            }
            if mode == CopyMode::Move {
                if tensor.has_pending() {
                    return Err(TensorError::Busy.into());
                }
                for record in tensor.drop_except(device) {
                    runtime.release_backing(record.backing());
                }
            }
            return Ok(Placement::Resident);
        }

        if tensor.is_full() {
            return Err(TensorError::TooManyCopies(MAX_DEV_PRESENT).into());
        }
        let source = runtime.select_source(tensor, device)?;
        // every other copy is outdated by the move, so none may be claimed already
        if mode == CopyMode::Move && tensor.records().any(Residency::is_exclusive) {
            return Err(TensorError::Busy.into());
        }
        let block = target.acquire(tensor.size_bytes()?)?;
        let dst = Location {
            device,
            addr: block.addr,
        };
        let (cell, ticket) = match runtime.transfer(tensor, source, dst) {
            Ok(issued) => issued,
            Err(err) => {
                runtime.release_block(&block);
                return Err(err);
            }
        };

        let retire = mode == CopyMode::Move;
        for (index, record) in tensor.records_mut().enumerate() {
            match index == source {
                true => record.set_pending(cell.clone(), Effect::Read { retire }),
                false if retire => record.set_pending(cell.clone(), Effect::Stale),
                false => {}
            }
        }
        let kind = tensor.kind();
        tensor.push(Residency::produced(device, kind, block, cell, true))?;
        Ok(Placement::InFlight(ticket))
    }

    /// Copies the data into the existing copy on `device` again from another available copy.
    pub fn refresh(&self, tensor: &mut TensorBlock, device: DeviceId) -> Result<Placement> {
        let runtime = self.runtime()?;
        runtime.settle(tensor);
        let index = tensor
            .position(device)
            .ok_or(TensorError::NotPresent(device))?;
        let dst = match tensor.get(index) {
            Some(record) if record.is_pending() => {
                return Err(TensorError::InProgress(device).into());
            }
            Some(record) => record.location(),
            None => return Err(TensorError::NotPresent(device).into()),
        };
        let source = match runtime.select_source(tensor, device) {
            Ok(source) => source,
            // the only copy is already the freshest
            Err(TensorError::NoSource) => return Ok(Placement::Resident),
            Err(err) => return Err(err.into()),
        };

        let (cell, ticket) = runtime.transfer(tensor, source, dst)?;
        if let Some(record) = tensor.get_mut(source) {
            record.set_pending(cell.clone(), Effect::Read { retire: false });
        }
        if let Some(record) = tensor.get_mut(index) {
            record.set_pending(cell, Effect::Write);
        }
        Ok(Placement::InFlight(ticket))
    }

    /// Removes the copy on `device` and releases its memory.
    pub fn discard(&self, tensor: &mut TensorBlock, device: DeviceId) -> Result<()> {
        let runtime = self.runtime()?;
        runtime.settle(tensor);
        let index = tensor
            .position(device)
            .ok_or(TensorError::NotPresent(device))?;
        if tensor.get(index).is_some_and(Residency::is_pending) {
            return Err(TensorError::InProgress(device).into());
        }
        if let Some(record) = tensor.remove(index) {
            runtime.release_backing(record.backing());
        }
        Ok(())
    }

    /// Location of the copy on `device`. Copies being written are refused.
    pub fn data(&self, tensor: &mut TensorBlock, device: DeviceId) -> Result<Location> {
        let runtime = self.runtime()?;
        runtime.settle(tensor);
        match tensor.record(device) {
            Some(record) if record.is_available() => Ok(record.location()),
            Some(_) => Err(TensorError::InProgress(device).into()),
            None => Err(TensorError::NotPresent(device).into()),
        }
    }

    /// Waits for unfinished work on the tensor block, places it on `device` and waits for
    /// the transfer. Fails if a write to the block failed.
    pub fn sync(&self, tensor: &mut TensorBlock, device: DeviceId) -> Result<Location> {
        self.wait_idle(tensor)?;
        if let Some(code) = tensor.take_failure() {
            return Err(TensorError::WriteFailed(code).into());
        }
        self.place(tensor, device, CopyMode::Keep)?;
        self.wait_idle(tensor)?;
        if let Some(code) = tensor.take_failure() {
            return Err(TensorError::WriteFailed(code).into());
        }
        self.data(tensor, device)
    }

    /// Schedules `destination += factor * left * right` on `device`, binding `task` to it.
    ///
    /// Operands missing on `device` are staged into its argument buffer. What happens to the
    /// staged copies and their sources once the task completes is chosen per operand by
    /// `control`. Nothing is left acquired if scheduling fails.
    #[allow(clippy::too_many_arguments)]
    #[cfg_attr(
        feature = "trace",
        tracing::instrument(skip_all, fields(pattern = %contraction.pattern, %device, %control))
    )]
    pub fn contract(
        &self,
        task: &mut Task,
        contraction: &Contraction,
        destination: &mut TensorBlock,
        left: &mut TensorBlock,
        right: &mut TensorBlock,
        device: DeviceId,
        control: CopyControl,
    ) -> Result<()> {
        if !task.is_empty() {
            return Err(TaskError::NotEmpty.into());
        }
        let runtime = self.runtime()?;
        let exec = runtime.device(device)?;

        let mut operands = [destination, left, right];
        for tensor in operands.iter_mut() {
            runtime.settle(tensor);
        }
        if operands.iter().any(|x| x.is_empty()) {
            return Err(TensorError::Empty.into());
        }
        let kind = operands[0].kind();
        if let Some(tensor) = operands.iter().find(|x| x.kind() != kind) {
            return Err(TensorError::KindMismatch(tensor.kind(), kind).into());
        }
        if operands[0].has_pending() {
            return Err(TensorError::Busy.into());
        }
        let ranks = operands.each_ref().map(|x| x.shape().rank());
        let plan = runtime
            .planner
            .plan(&contraction.pattern, ranks)
            .map_err(TensorError::from)?;

        let mut prepared: Vec<Prepared> = Vec::with_capacity(operands.len());
        for (tensor, role) in operands.iter().zip(Role::ALL) {
            match runtime.prepare(exec, tensor, role, control.get(role)) {
                Ok(x) => prepared.push(x),
                Err(err) => {
                    runtime.abandon(exec, &prepared, None, None);
                    return Err(err);
                }
            }
        }

        let key = CacheKey::of(&*contraction.pattern);
        let constant = match &exec.cache {
            Some(cache) => match runtime.load_constant(exec, cache, key, &contraction.pattern) {
                Ok(slot) => Some(slot),
                Err(err) => {
                    runtime.abandon(exec, &prepared, None, None);
                    return Err(err);
                }
            },
            None => None,
        };
        let key = constant.map(|_| key);

        let record = match runtime.tasks.lock().acquire() {
            Ok(record) => record,
            Err(err) => {
                runtime.abandon(exec, &prepared, key, None);
                return Err(err.into());
            }
        };
        let mut indices = match runtime.acquire_indices(&plan) {
            Ok(indices) => indices,
            Err(err) => {
                runtime.abandon(exec, &prepared, key, Some(record));
                return Err(err);
            }
        };

        let mut stagings = Bounded::new();
        let staged = prepared.iter().zip(operands.iter()).zip(indices.iter());
        for ((prepared, tensor), &index) in staged {
            let source = prepared
                .source
                .and_then(|index| tensor.get(index))
                .map(Residency::location);
            let staging = Staging {
                role: prepared.role,
                shape: tensor.shape().clone(),
                bytes: prepared.bytes,
                target: prepared.target,
                source,
                index,
            };
            _ = stagings.push(staging);
        }
        let writeback = match (prepared[0].mode, stagings.get(0).and_then(|x| x.source)) {
            (CopyMode::Move, _) | (_, None) => None,
            (_, Some(src)) => Some(Transfer {
                src: prepared[0].target,
                dst: src,
                bytes: prepared[0].bytes,
            }),
        };
        let launch = Launch {
            contraction: contraction.clone(),
            kind,
            plan,
            operands: stagings,
            writeback,
            constant,
        };

        let ticket = match exec.backend.submit(exec.local, Command::Contract(&launch)) {
            Ok(ticket) => ticket,
            Err(err) => {
                runtime.release_indices(indices.clear());
                runtime.abandon(exec, &prepared, key, Some(record));
                return Err(err.into());
            }
        };
        let task_record = TaskRecord {
            ticket: ticket.0,
            device: device.0,
            operands: prepared.len() as u32,
        };
        if let Err(err) = runtime.tasks.lock().write(record, &task_record) {
            log::error!("active task record: {err}");
        }
        exec.active.fetch_add(1, Ordering::Relaxed);

        let cell = Arc::new(TaskCell::new(exec.backend.clone(), device, ticket));
        let mut bound = Bounded::new();
        for (prepared, tensor) in prepared.iter().zip(operands.iter_mut()) {
            let temporary = Runtime::commit(device, tensor, prepared, &cell);
            let operand = TaskOperand {
                role: prepared.role,
                tensor: tensor.id(),
                device,
                temporary,
            };
            _ = bound.push(operand);
        }

        task.bind(Binding {
            cell,
            runtime: runtime.clone(),
            operands: bound,
            indices,
            record,
            constant: key,
        })?;
        Ok(())
    }

    /// Free argument buffer bytes on `device`.
    pub fn free_left(&self, device: DeviceId) -> Result<usize> {
        Ok(self.runtime()?.device(device)?.free.load(Ordering::Relaxed))
    }

    pub fn device_state(&self, device: DeviceId) -> Result<DeviceState> {
        Ok(self.runtime()?.device(device)?.state())
    }

    /// The device of `kind` with the fewest active tasks, then the most free buffer.
    pub fn least_busy(&self, kind: DeviceKind) -> Result<DeviceId> {
        let runtime = self.runtime()?;
        runtime
            .map
            .ids_of(kind)
            .filter_map(|id| runtime.device(id).ok())
            .map(Device::state)
            .min_by_key(|x| (x.active_tasks, Reverse(x.free), x.id))
            .map(|x| x.id)
            .ok_or(ContextError::NoDevice(kind).into())
    }

    pub fn stats(&self, device: DeviceId) -> Result<DeviceStats> {
        let runtime = self.runtime()?;
        let device_ = runtime.device(device)?;
        let (pool, tiers, free_list) = {
            let pool = device_.pool.lock();
            (pool.stats(), pool.size_tiers(), pool.print_pretty())
        };
        let pinned = match device_.kind {
            DeviceKind::Host => Some(runtime.pinned.lock().state(device_.arena.base)),
            _ => None,
        };
        let cache = device_.cache.as_ref().map(|cache| {
            let cache = cache.lock();
            CacheStats {
                capacity: cache.capacity(),
                resident: cache.resident(),
                referenced: cache.referenced(),
            }
        });
        let indices = (device_.kind == DeviceKind::Host).then(|| {
            let slab = runtime.indices.lock();
            IndexStats {
                capacity: slab.max_entries(),
                outstanding: slab.outstanding(),
                pinned: runtime.pinned.lock().state(slab.base()),
            }
        });
        let tasks = {
            let slab = runtime.tasks.lock();
            slab.outstanding_entries()
                .filter_map(|entry| slab.read::<TaskRecord>(entry).ok())
                .filter(|x| x.device == device.0 && x.ticket != 0)
                .collect()
        };
        Ok(DeviceStats {
            state: device_.state(),
            pool,
            tiers,
            free_list,
            pinned,
            indices,
            cache,
            tasks,
        })
    }

    /// Logs the statistics of `device`.
    pub fn print_stats(&self, device: DeviceId) -> Result<()> {
        let stats = self.stats(device)?;
        log::info!("{stats}");
        Ok(())
    }
}
