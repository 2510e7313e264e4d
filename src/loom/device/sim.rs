//! A simulated asynchronous accelerator runtime.
//!
//! Device memory is a synthetic address range and nothing is computed. Tickets either advance
//! by one state on every query ([`Sim::new`]) or only when told so through a [`SimHandle`]
//! ([`Sim::manual`]), which makes completion order fully controllable.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use rustc_hash::FxHashMap as HashMap;

use super::{Backend, BackendError, Command, DeviceKind, Report, Ticket, cpu::UNKNOWN_TICKET};
use crate::loom::{memory::Arena, task::TaskStatus};

const CONTRACT_STAGES: &[TaskStatus] = &[
    TaskStatus::Scheduled,
    TaskStatus::Started,
    TaskStatus::InputReady,
    TaskStatus::OutputReady,
    TaskStatus::Completed,
];
const COPY_STAGES: &[TaskStatus] = &[
    TaskStatus::Scheduled,
    TaskStatus::Started,
    TaskStatus::Completed,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimCommand {
    /// Moves the ticket to its next state.
    Advance(Ticket),
    Complete(Ticket),
    Fail(Ticket, i32),
    /// Makes the next submitted command end in an error.
    FailNext(i32),
    /// Makes the next submission be rejected outright.
    RejectNext(i32),
}

#[derive(Debug, Clone, Copy)]
struct Job {
    stages: &'static [TaskStatus],
    stage: usize,
    fail: Option<i32>,
    report: Report,
}

impl Job {
    fn new(stages: &'static [TaskStatus], fail: Option<i32>) -> Self {
        let report = Report {
            status: stages[0],
            error: None,
        };
        Self {
            stages,
            stage: 0,
            fail,
            report,
        }
    }

    fn advance(&mut self) {
        if self.report.status.is_terminal() {
            return;
        }
        self.stage = (self.stage + 1).min(self.stages.len() - 1);
        let status = self.stages[self.stage];
        self.report = match (status, self.fail) {
            (TaskStatus::Completed, Some(code)) => Report::failed(code),
            (status, _) => Report {
                status,
                error: None,
            },
        };
    }

    fn finish(&mut self, report: Report) {
        if !self.report.status.is_terminal() {
            self.stage = self.stages.len() - 1;
            self.report = report;
        }
    }
}

#[derive(Debug, Default)]
struct State {
    jobs: HashMap<Ticket, Job>,
    arenas: HashMap<u32, Arena>,
    pinned: HashMap<usize, usize>,
    fail_next: Option<i32>,
    reject_next: Option<i32>,
    /// Tickets in submission order.
    submitted: Vec<Ticket>,
}

#[derive(Debug)]
pub struct Sim {
    kind: DeviceKind,
    manual: bool,
    /// Upper bound on the arena a device can reserve.
    memory: usize,
    state: Mutex<State>,
    receiver: flume::Receiver<SimCommand>,
    next: AtomicU64,
}

/// Remote control of a [`Sim`]. Cheap to clone and usable from any thread.
#[derive(Debug, Clone)]
pub struct SimHandle {
    sender: flume::Sender<SimCommand>,
}

impl SimHandle {
    #[inline]
    fn send(&self, command: SimCommand) {
        _ = self.sender.send(command)
    }

    pub fn advance(&self, ticket: Ticket) {
        self.send(SimCommand::Advance(ticket))
    }

    pub fn complete(&self, ticket: Ticket) {
        self.send(SimCommand::Complete(ticket))
    }

    pub fn fail(&self, ticket: Ticket, code: i32) {
        self.send(SimCommand::Fail(ticket, code))
    }

    pub fn fail_next(&self, code: i32) {
        self.send(SimCommand::FailNext(code))
    }

    pub fn reject_next(&self, code: i32) {
        self.send(SimCommand::RejectNext(code))
    }
}

impl Sim {
    /// A runtime whose tickets advance one state per query.
    pub fn new(kind: DeviceKind) -> (Self, SimHandle) {
        Self::build(kind, false)
    }

    /// A runtime whose tickets advance only through the [`SimHandle`].
    pub fn manual(kind: DeviceKind) -> (Self, SimHandle) {
        Self::build(kind, true)
    }

    fn build(kind: DeviceKind, manual: bool) -> (Self, SimHandle) {
        let (sender, receiver) = flume::unbounded();
        let sim = Self {
            kind,
            manual,
            memory: usize::MAX,
            state: Default::default(),
            receiver,
            next: AtomicU64::new(1),
        };
        (sim, SimHandle { sender })
    }

    /// Caps the memory of each simulated device.
    pub fn with_memory(mut self, bytes: usize) -> Self {
        self.memory = bytes;
        self
    }

    /// Tickets in submission order, including retired ones.
    pub fn submitted(&self) -> Vec<Ticket> {
        self.state.lock().submitted.clone()
    }

    pub fn is_pinned(&self, addr: usize) -> bool {
        self.state.lock().pinned.contains_key(&addr)
    }

    /// Applies pending commands from the handles.
    fn drain(&self, state: &mut State) {
        while let Ok(command) = self.receiver.try_recv() {
            match command {
                SimCommand::Advance(ticket) => {
                    if let Some(job) = state.jobs.get_mut(&ticket) {
                        job.advance()
                    }
                }
                SimCommand::Complete(ticket) => {
                    if let Some(job) = state.jobs.get_mut(&ticket) {
                        job.finish(Report::COMPLETED)
                    }
                }
                SimCommand::Fail(ticket, code) => {
                    if let Some(job) = state.jobs.get_mut(&ticket) {
                        job.finish(Report::failed(code))
                    }
                }
                SimCommand::FailNext(code) => state.fail_next = Some(code),
                SimCommand::RejectNext(code) => state.reject_next = Some(code),
            }
        }
    }
}

impl Backend for Sim {
    #[inline]
    fn kind(&self) -> DeviceKind {
        self.kind
    }

    fn reserve(&self, local: u32, bytes: usize) -> Result<Arena, BackendError> {
        let size = bytes.min(self.memory);
        if size == 0 {
            return Err(BackendError::Reserve(bytes));
        }
        // disjoint synthetic ranges per kind and device
        let base = ((self.kind as usize) << 44) | ((local as usize + 1) << 36);
        let arena = Arena { base, size };
        self.state.lock().arenas.insert(local, arena);
        Ok(arena)
    }

    fn release(&self, local: u32, arena: Arena) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        match state.arenas.get(&local) {
            Some(&x) if x == arena => {
                state.arenas.remove(&local);
                Ok(())
            }
            _ => Err(BackendError::UnknownDevice(local)),
        }
    }

    fn pin(&self, addr: usize, size: usize) -> Result<(), BackendError> {
        self.state.lock().pinned.insert(addr, size);
        Ok(())
    }

    fn unpin(&self, addr: usize) -> Result<(), BackendError> {
        match self.state.lock().pinned.remove(&addr) {
            Some(_) => Ok(()),
            None => Err(BackendError::Rejected(UNKNOWN_TICKET)),
        }
    }

    fn submit(&self, local: u32, command: Command<'_>) -> Result<Ticket, BackendError> {
        let mut state = self.state.lock();
        self.drain(&mut state);
        if !state.arenas.contains_key(&local) {
            return Err(BackendError::UnknownDevice(local));
        }
        if let Some(code) = state.reject_next.take() {
            return Err(BackendError::Rejected(code));
        }
        let stages = match command {
            Command::Contract(_) => CONTRACT_STAGES,
            Command::Transfer(_) | Command::Upload { .. } => COPY_STAGES,
        };
        let fail = state.fail_next.take();
        let ticket = Ticket(self.next.fetch_add(1, Ordering::Relaxed));
        state.jobs.insert(ticket, Job::new(stages, fail));
        state.submitted.push(ticket);
        log::trace!("{} device {local}: {ticket} submitted", self.kind);
        Ok(ticket)
    }

    fn query(&self, ticket: Ticket) -> Report {
        let mut state = self.state.lock();
        self.drain(&mut state);
        match state.jobs.get_mut(&ticket) {
            Some(job) => {
                let report = job.report;
                if !self.manual {
                    job.advance();
                }
                report
            }
            None => Report::failed(UNKNOWN_TICKET),
        }
    }

    fn retire(&self, ticket: Ticket) {
        self.state.lock().jobs.remove(&ticket);
    }
}

#[cfg(test)]
mod tests {
    use super::Sim;
    use crate::loom::{
        device::{Backend, Command, DeviceId, DeviceKind, Location, Transfer},
        task::TaskStatus,
    };

    fn transfer() -> Transfer {
        let location = Location {
            device: DeviceId(1),
            addr: 0,
        };
        Transfer {
            src: location,
            dst: location,
            bytes: 1,
        }
    }

    #[test]
    fn test_auto_advance() {
        let (sim, _handle) = Sim::new(DeviceKind::Gpu);
        sim.reserve(0, 1024).unwrap();
        let ticket = sim.submit(0, Command::Transfer(transfer())).unwrap();
        let states: Vec<_> = (0..4).map(|_| sim.query(ticket).status).collect();
        assert_eq!(
            states,
            vec![
                TaskStatus::Scheduled,
                TaskStatus::Started,
                TaskStatus::Completed,
                TaskStatus::Completed
            ]
        );
    }

    #[test]
    fn test_manual_control() {
        let (sim, handle) = Sim::manual(DeviceKind::Accelerator);
        sim.reserve(2, 1024).unwrap();
        let x = sim.submit(2, Command::Transfer(transfer())).unwrap();
        handle.fail_next(7);
        let y = sim.submit(2, Command::Transfer(transfer())).unwrap();
        assert_eq!(sim.query(x).status, TaskStatus::Scheduled);
        assert_eq!(sim.query(x).status, TaskStatus::Scheduled);

        handle.advance(x);
        assert_eq!(sim.query(x).status, TaskStatus::Started);
        handle.complete(x);
        handle.advance(y);
        handle.advance(y);
        assert_eq!(sim.query(x).status, TaskStatus::Completed);
        let report = sim.query(y);
        assert_eq!(report.status, TaskStatus::Error);
        assert_eq!(report.error, Some(7));

        // terminal states never regress
        handle.fail(x, 1);
        assert_eq!(sim.query(x).status, TaskStatus::Completed);
        assert_eq!(sim.submitted(), vec![x, y]);
    }

    #[test]
    fn test_reject_and_unknown_device() {
        let (sim, handle) = Sim::new(DeviceKind::Gpu);
        assert!(sim.submit(0, Command::Transfer(transfer())).is_err());
        sim.reserve(0, 1024).unwrap();
        handle.reject_next(3);
        assert!(sim.submit(0, Command::Transfer(transfer())).is_err());
        assert!(sim.submit(0, Command::Transfer(transfer())).is_ok());
    }

    #[test]
    fn test_memory_cap() {
        let (sim, _handle) = Sim::new(DeviceKind::Gpu);
        let sim = sim.with_memory(4096);
        let arena = sim.reserve(0, 1 << 20).unwrap();
        assert_eq!(arena.size, 4096);
        sim.release(0, arena).unwrap();
    }
}
