//! Task state machine.
//!
//! A [`Task`] tracks one scheduled contraction on one device. Its state only moves forward:
//! `Empty → Scheduled → Started → (InputReady) → (OutputReady) → Completed | Error`.
//! Nothing drives a task but the caller: [`Task::poll`] queries the device runtime once,
//! [`Task::wait`] spins on it.

use std::{sync::Arc, time::Duration};

use derive_more::Display;
use instant::Instant;
use parking_lot::Mutex;
use thiserror::Error;

use super::{
    ErrorKind, MAX_TENSOR_OPERANDS,
    bounded::Bounded,
    context::Runtime,
    device::{Backend, DeviceId, Ticket},
    memory::{Block, CacheKey, SlabEntry},
    ops::Role,
    platform,
    tensor::TensorId,
};

#[derive(Debug, Display, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    /// Clean; the only state in which a task may be scheduled.
    #[default]
    Empty,
    Scheduled,
    Started,
    /// Operands have reached the execution device.
    InputReady,
    /// The result is computed but not yet written back.
    OutputReady,
    Completed,
    Error,
}

impl TaskStatus {
    /// Position in the forward order. `Completed` and `Error` share the last rank.
    #[inline]
    pub const fn rank(self) -> u8 {
        match self {
            TaskStatus::Empty => 0,
            TaskStatus::Scheduled => 1,
            TaskStatus::Started => 2,
            TaskStatus::InputReady => 3,
            TaskStatus::OutputReady => 4,
            TaskStatus::Completed | TaskStatus::Error => 5,
        }
    }

    #[inline]
    pub const fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Error)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    #[error("task is empty")]
    Empty,
    #[error("task is not empty")]
    NotEmpty,
    #[error("task in state {0} is not terminal")]
    NotTerminal(TaskStatus),
    #[error("task was already destructed")]
    Destructed,
    #[error("the context of the task was shut down")]
    Detached,
}

impl TaskError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TaskError::Empty => ErrorKind::ObjectIsEmpty,
            TaskError::NotEmpty => ErrorKind::ObjectNotEmpty,
            TaskError::NotTerminal(_) | TaskError::Destructed => ErrorKind::NotAllowed,
            TaskError::Detached => ErrorKind::NotInitialized,
        }
    }

    /// State machine violations.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TaskError::NotTerminal(_) | TaskError::Destructed | TaskError::Detached
        )
    }
}

/// Host-observed instants of a task's transitions. A marker the runtime skipped is stamped
/// together with the later state that was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    pub scheduled: Instant,
    pub started: Option<Instant>,
    pub input_ready: Option<Instant>,
    pub output_ready: Option<Instant>,
    pub finished: Option<Instant>,
}

impl Timing {
    fn new(scheduled: Instant) -> Self {
        Self {
            scheduled,
            started: None,
            input_ready: None,
            output_ready: None,
            finished: None,
        }
    }

    /// Stamps every marker up to `status` that is not stamped yet.
    fn reach(&mut self, status: TaskStatus, now: Instant) {
        let markers = [
            (TaskStatus::Started, &mut self.started),
            (TaskStatus::InputReady, &mut self.input_ready),
            (TaskStatus::OutputReady, &mut self.output_ready),
            (TaskStatus::Completed, &mut self.finished),
        ];
        for (marker, instant) in markers {
            if status.rank() >= marker.rank() {
                instant.get_or_insert(now);
            }
        }
    }

    /// Time from scheduling to the terminal state, once reached.
    pub fn total(&self) -> Option<Duration> {
        self.finished.map(|x| x.duration_since(self.scheduled))
    }

    /// Time spent bringing the operands to the execution device.
    pub fn input(&self) -> Option<Duration> {
        Some(self.input_ready?.duration_since(self.started?))
    }

    /// Time spent computing.
    pub fn compute(&self) -> Option<Duration> {
        Some(self.output_ready?.duration_since(self.input_ready?))
    }

    /// Time spent writing the result back.
    pub fn output(&self) -> Option<Duration> {
        Some(self.finished?.duration_since(self.output_ready?))
    }
}

#[derive(Debug)]
struct Progress {
    status: TaskStatus,
    error: Option<i32>,
    timing: Timing,
}

/// Shared view of one submitted command. Owned jointly by the task and the residency
/// records the command affects; the ticket is retired once the last owner is gone.
#[derive(Debug)]
pub struct TaskCell {
    backend: Arc<dyn Backend>,
    device: DeviceId,
    ticket: Ticket,
    progress: Mutex<Progress>,
}

impl TaskCell {
    pub(crate) fn new(backend: Arc<dyn Backend>, device: DeviceId, ticket: Ticket) -> Self {
        let progress = Progress {
            status: TaskStatus::Scheduled,
            error: None,
            timing: Timing::new(Instant::now()),
        };
        Self {
            backend,
            device,
            ticket,
            progress: Mutex::new(progress),
        }
    }

    #[inline]
    pub fn device(&self) -> DeviceId {
        self.device
    }

    #[inline]
    pub fn ticket(&self) -> Ticket {
        self.ticket
    }

    /// Last observed status, without querying the runtime.
    pub fn status(&self) -> TaskStatus {
        self.progress.lock().status
    }

    pub fn error(&self) -> Option<i32> {
        self.progress.lock().error
    }

    pub fn timing(&self) -> Timing {
        self.progress.lock().timing
    }

    /// Queries the runtime once unless the status is terminal. Reports that would move the
    /// status backwards are ignored.
    pub fn poll(&self) -> TaskStatus {
        let mut progress = self.progress.lock();
        if progress.status.is_terminal() {
            return progress.status;
        }

        let report = self.backend.query(self.ticket);
        if report.status.rank() <= progress.status.rank() {
            return progress.status;
        }

        progress.timing.reach(report.status, Instant::now());
        if report.status.is_terminal() {
            progress.error = report.error;
        }
        log::trace!(
            "{} on {}: {} → {}",
            self.ticket,
            self.device,
            progress.status,
            report.status
        );
        progress.status = report.status;
        progress.status
    }
}

impl Drop for TaskCell {
    fn drop(&mut self) {
        self.backend.retire(self.ticket);
    }
}

/// An operand as bound to a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskOperand {
    pub role: Role,
    pub tensor: uid::Id<TensorId>,
    /// Execution device.
    pub device: DeviceId,
    /// Copy owned by the task itself, released on destruct.
    pub temporary: Option<Block>,
}

pub(crate) struct Binding {
    pub cell: Arc<TaskCell>,
    pub runtime: Arc<Runtime>,
    pub operands: Bounded<TaskOperand, MAX_TENSOR_OPERANDS>,
    /// Index records of the operands.
    pub indices: Bounded<SlabEntry, MAX_TENSOR_OPERANDS>,
    pub record: SlabEntry,
    pub constant: Option<CacheKey>,
}

impl std::fmt::Debug for Binding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Binding")
            .field("cell", &self.cell)
            .field("operands", &self.operands)
            .field("indices", &self.indices)
            .field("record", &self.record)
            .field("constant", &self.constant)
            .finish_non_exhaustive()
    }
}

impl Binding {
    fn release(mut self) {
        let operands = self.operands.clear();
        let indices = self.indices.clear();
        self.runtime.release_task(
            self.cell.device(),
            operands,
            indices,
            self.record,
            self.constant,
        );
    }
}

/// Caller-visible handle of one scheduled operation.
#[derive(Debug, Default)]
pub struct Task {
    binding: Option<Binding>,
    destructed: bool,
}

impl Task {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.binding.is_none()
    }

    /// Last observed status. Call [`Task::poll`] to refresh it.
    pub fn status(&self) -> TaskStatus {
        self.binding
            .as_ref()
            .map_or(TaskStatus::Empty, |x| x.cell.status())
    }

    /// Runtime error code once the task ended in [`TaskStatus::Error`].
    pub fn error(&self) -> Option<i32> {
        self.binding.as_ref().and_then(|x| x.cell.error())
    }

    pub fn ticket(&self) -> Option<Ticket> {
        self.binding.as_ref().map(|x| x.cell.ticket())
    }

    /// Execution device.
    pub fn device(&self) -> Option<DeviceId> {
        self.binding.as_ref().map(|x| x.cell.device())
    }

    pub fn operands(&self) -> impl Iterator<Item = &TaskOperand> {
        self.binding.iter().flat_map(|x| x.operands.iter())
    }

    pub fn timing(&self) -> Option<Timing> {
        self.binding.as_ref().map(|x| x.cell.timing())
    }

    /// Time from scheduling to completion; `None` until the task is terminal.
    pub fn time(&self) -> Option<Duration> {
        self.timing().and_then(|x| x.total())
    }

    pub(crate) fn bind(&mut self, binding: Binding) -> Result<(), TaskError> {
        if self.binding.is_some() {
            return Err(TaskError::NotEmpty);
        }
        log::debug!("{} scheduled on {}", binding.cell.ticket(), binding.cell.device());
        self.binding = Some(binding);
        self.destructed = false;
        Ok(())
    }

    fn binding(&self) -> Result<&Binding, TaskError> {
        match &self.binding {
            Some(binding) if !binding.runtime.is_live() => Err(TaskError::Detached),
            Some(binding) => Ok(binding),
            None => Err(TaskError::Empty),
        }
    }

    /// Queries the device runtime once. Returns whether the task is terminal.
    pub fn poll(&self) -> Result<bool, TaskError> {
        let binding = self.binding()?;
        Ok(binding.cell.poll().is_terminal())
    }

    /// Spins until the task is terminal.
    pub fn wait(&self) -> Result<TaskStatus, TaskError> {
        let mut iteration = 0u32;
        while !self.poll()? {
            platform::relax(iteration);
            iteration = iteration.saturating_add(1);
        }
        Ok(self.status())
    }

    /// Polls until the task is terminal, yielding to the executor between polls.
    pub async fn wait_async(&self) -> Result<TaskStatus, TaskError> {
        while !self.poll()? {
            platform::yield_now().await;
        }
        Ok(self.status())
    }

    /// Releases the task's temporaries and resets it to empty. Only valid on a terminal task;
    /// otherwise the task is left untouched.
    ///
    /// A task whose context was shut down is reset to empty as well, but reports
    /// [`TaskError::Detached`]: its resources went away with the context.
    pub fn destruct(&mut self) -> Result<TaskStatus, TaskError> {
        let Some(binding) = &self.binding else {
            let err = match self.destructed {
                true => TaskError::Destructed,
                false => TaskError::Empty,
            };
            log::error!("task destruct: {err}");
            return Err(err);
        };
        if !binding.runtime.is_live() {
            if let Some(binding) = self.binding.take() {
                binding.release();
            }
            self.destructed = true;
            return Err(TaskError::Detached);
        }

        let status = binding.cell.poll();
        if !status.is_terminal() {
            let err = TaskError::NotTerminal(status);
            log::error!("{}: {err}", binding.cell.ticket());
            return Err(err);
        }

        if let Some(binding) = self.binding.take() {
            binding.release();
        }
        self.destructed = true;
        Ok(status)
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        let Some(binding) = self.binding.take() else {
            return;
        };
        match binding.cell.status() {
            status if status.is_terminal() => binding.release(),
            status => log::error!(
                "{} dropped in state {status}; its resources stay reserved",
                binding.cell.ticket()
            ),
        }
    }
}

/// Spins until every task is terminal, in whatever order they finish. Returns their statuses.
pub fn wait_all(tasks: &[Task]) -> Result<Vec<TaskStatus>, TaskError> {
    let mut done = vec![false; tasks.len()];
    let mut iteration = 0u32;
    loop {
        for (task, done) in tasks.iter().zip(done.iter_mut()) {
            if !*done {
                *done = task.poll()?;
            }
        }
        if done.iter().all(|&x| x) {
            break;
        }
        platform::relax(iteration);
        iteration = iteration.saturating_add(1);
    }
    Ok(tasks.iter().map(Task::status).collect())
}

pub async fn wait_all_async(tasks: &[Task]) -> Result<Vec<TaskStatus>, TaskError> {
    futures::future::join_all(tasks.iter().map(Task::wait_async))
        .await
        .into_iter()
        .collect()
}
