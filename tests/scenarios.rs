use std::{sync::Arc, thread, time::Duration};

use itertools::Itertools;
use tensile::loom::{
    ErrorKind, MAX_DEV_PRESENT,
    context::{Config, Context, Init, Limits, Placement},
    device::{CpuBuilder, DeviceId, DeviceKind, Sim, SimHandle, Ticket},
    num::DataKind,
    ops::{Contraction, CopyControl, CopyMode, Launch, Role},
    task::{Task, TaskError, TaskStatus, wait_all, wait_all_async},
    tensor::{Shape, TensorBlock},
};

const HOST: DeviceId = DeviceId::HOST;
const GPU: DeviceId = DeviceId(1);
const BUFFER: usize = 1 << 20;

/// Fails launches whose destination has no location or index record, so wiring mistakes
/// surface as errors.
fn kernel(launch: &Launch) -> Result<(), i32> {
    match launch.operand(Role::Destination) {
        Some(staging) if staging.target.addr != 0 && staging.index.0 != 0 => Ok(()),
        _ => Err(1),
    }
}

fn setup(manual: bool, limits: Limits) -> (Context, SimHandle) {
    let (sim, handle) = match manual {
        true => Sim::manual(DeviceKind::Gpu),
        false => Sim::new(DeviceKind::Gpu),
    };
    let host = CpuBuilder::new().kernel(kernel).build();
    let config = Config::new(Arc::new(host))
        .host_buffer(BUFFER)
        .gpus(Arc::new(sim), [0], BUFFER)
        .limits(limits);
    let context = Context::new();
    let sizes = context.initialize(config).unwrap();
    assert_eq!(sizes.host, BUFFER);
    assert_eq!(sizes.devices, vec![(GPU, BUFFER)]);
    (context, handle)
}

fn matmul() -> Contraction {
    Contraction::new("D(a,b)+=L(a,c)*R(c,b)", 1.0)
}

fn block(context: &Context, device: DeviceId) -> TensorBlock {
    let shape = Shape::new([8, 8]).unwrap();
    context
        .construct(shape, DataKind::R8, device, Init::Buffer)
        .unwrap()
}

fn operands(context: &Context, device: DeviceId) -> [TensorBlock; 3] {
    std::array::from_fn(|_| block(context, device))
}

#[test]
fn place_copy_then_discard_source() {
    let (context, handle) = setup(true, Limits::default());
    let shape = Shape::new([16, 16]).unwrap();
    let mut tensor = context
        .construct(shape, DataKind::R8, HOST, Init::Buffer)
        .unwrap();

    let Placement::InFlight(ticket) = context.place(&mut tensor, GPU, CopyMode::Keep).unwrap()
    else {
        panic!("expected a transfer");
    };
    // a second placement while the first is in flight does not add a record
    assert_eq!(
        context
            .place(&mut tensor, GPU, CopyMode::Keep)
            .unwrap_err()
            .kind(),
        ErrorKind::InProgress
    );
    assert_eq!(tensor.ndev(), 2);

    handle.complete(ticket);
    context.wait_idle(&mut tensor).unwrap();
    context.discard(&mut tensor, HOST).unwrap();

    assert_eq!(tensor.ndev(), 1);
    assert!(tensor.is_available(GPU));
    assert_eq!(context.data(&mut tensor, GPU).unwrap().device, GPU);
    assert_eq!(
        context.discard(&mut tensor, HOST).unwrap_err().kind(),
        ErrorKind::ObjectIsEmpty
    );
    assert_eq!(context.free_left(HOST).unwrap(), BUFFER);
}

#[test]
fn oversized_block_keeps_free_list() {
    let (context, _handle) = setup(true, Limits::default());
    let free = context.free_left(GPU).unwrap();

    let err = context.get_block(GPU, free + 1).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InsufficientBuffer);
    assert_eq!(context.free_left(GPU).unwrap(), free);

    let block = context.get_block(GPU, 1000).unwrap();
    assert!(block.size >= 1000);
    context.release_block(block.handle).unwrap();
    assert_eq!(context.free_left(GPU).unwrap(), free);
    assert_eq!(
        context.release_block(block.handle).unwrap_err().kind(),
        ErrorKind::InvalidHandle
    );
}

#[test]
fn destruct_before_terminal_is_refused() {
    let (context, handle) = setup(true, Limits::default());
    let [mut d, mut l, mut r] = operands(&context, GPU);
    let mut task = Task::new();
    context
        .contract(
            &mut task,
            &matmul(),
            &mut d,
            &mut l,
            &mut r,
            GPU,
            CopyControl::KEEP_ALL,
        )
        .unwrap();
    assert_eq!(task.status(), TaskStatus::Scheduled);
    assert_eq!(task.device(), Some(GPU));

    let err = task.destruct().unwrap_err();
    assert_eq!(err, TaskError::NotTerminal(TaskStatus::Scheduled));
    assert!(err.is_fatal());
    assert_eq!(tensile::Error::from(err).kind(), ErrorKind::NotAllowed);
    assert_eq!(task.status(), TaskStatus::Scheduled);
    assert!(!task.is_empty());

    // a bound task cannot be scheduled again
    let err = context
        .contract(
            &mut task,
            &matmul(),
            &mut d,
            &mut l,
            &mut r,
            GPU,
            CopyControl::KEEP_ALL,
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ObjectNotEmpty);

    let ticket = task.ticket().unwrap();
    handle.advance(ticket);
    assert!(!task.poll().unwrap());
    assert_eq!(task.status(), TaskStatus::Started);
    handle.complete(ticket);
    assert_eq!(task.wait().unwrap(), TaskStatus::Completed);
    assert!(task.time().is_some());

    assert_eq!(task.destruct().unwrap(), TaskStatus::Completed);
    assert_eq!(task.status(), TaskStatus::Empty);
    assert_eq!(task.destruct(), Err(TaskError::Destructed));

    // the written destination is the only copy and available again
    assert_eq!(context.data(&mut d, GPU).unwrap().device, GPU);
}

#[test]
fn wait_all_in_reverse_completion_order() {
    let (context, handle) = setup(true, Limits::default());
    let mut tensors: Vec<[TensorBlock; 3]> = (0..3).map(|_| operands(&context, GPU)).collect();
    let mut tasks: Vec<Task> = (0..3).map(|_| Task::new()).collect();
    for (task, [d, l, r]) in tasks.iter_mut().zip(tensors.iter_mut()) {
        context
            .contract(
                task,
                &matmul(),
                d,
                l,
                r,
                GPU,
                CopyControl::KEEP_ALL,
            )
            .unwrap();
    }
    let tickets: Vec<_> = tasks.iter().map(|x| x.ticket().unwrap()).collect();
    assert_eq!(context.device_state(GPU).unwrap().active_tasks, 3);

    let statuses = thread::scope(|scope| {
        scope.spawn(|| {
            for (index, &ticket) in tickets.iter().enumerate().rev() {
                thread::sleep(Duration::from_millis(5));
                match index {
                    1 => handle.fail(ticket, 7),
                    _ => handle.complete(ticket),
                }
            }
        });
        wait_all(&tasks).unwrap()
    });
    assert_eq!(
        statuses,
        vec![TaskStatus::Completed, TaskStatus::Error, TaskStatus::Completed]
    );
    assert_eq!(tasks[1].error(), Some(7));
    assert_eq!(tasks[0].error(), None);

    for task in &mut tasks {
        assert!(task.destruct().unwrap().is_terminal());
    }
    assert_eq!(context.device_state(GPU).unwrap().active_tasks, 0);

    // the failed write is reported once by the destination
    let err = context.sync(&mut tensors[1][0], GPU).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Failure);
    context.sync(&mut tensors[1][0], GPU).unwrap();
}

#[test]
fn move_all_to_gpu() {
    let (context, handle) = setup(true, Limits::default());
    let [mut d, mut l, mut r] = operands(&context, HOST);
    let mut task = Task::new();
    context
        .contract(
            &mut task,
            &matmul(),
            &mut d,
            &mut l,
            &mut r,
            GPU,
            CopyControl::MOVE_ALL,
        )
        .unwrap();
    assert_eq!(task.operands().filter(|x| x.temporary.is_some()).count(), 0);
    // staged copies are not readable before the task is done
    assert_eq!(
        context.data(&mut l, GPU).unwrap_err().kind(),
        ErrorKind::InProgress
    );

    handle.complete(task.ticket().unwrap());
    task.wait().unwrap();
    for tensor in [&mut d, &mut l, &mut r] {
        context.reconcile(tensor).unwrap();
        assert_eq!(tensor.devices().collect::<Vec<_>>(), vec![GPU]);
        assert!(tensor.is_available(GPU));
    }
    task.destruct().unwrap();
    assert_eq!(context.free_left(HOST).unwrap(), BUFFER);
}

#[test]
fn discard_all_on_host_writes_back() {
    let (context, _handle) = setup(false, Limits::default());
    let [mut l, mut r] = [(); 2].map(|_| {
        let shape = Shape::new([4, 4]).unwrap();
        context
            .construct(shape, DataKind::R4, HOST, Init::Buffer)
            .unwrap()
    });
    let mut d = context
        .construct(Shape::new([4, 4]).unwrap(), DataKind::R4, GPU, Init::Buffer)
        .unwrap();
    let host_free = context.free_left(HOST).unwrap();

    let mut task = Task::new();
    context
        .contract(
            &mut task,
            &matmul(),
            &mut d,
            &mut l,
            &mut r,
            HOST,
            CopyControl::DISCARD_ALL,
        )
        .unwrap();
    // the host runtime runs the contraction on submission
    assert!(task.poll().unwrap());
    assert_eq!(task.status(), TaskStatus::Completed);
    let temporaries: Vec<_> = task.operands().filter_map(|x| x.temporary).collect();
    assert_eq!(temporaries.len(), 1);
    assert!(context.free_left(HOST).unwrap() < host_free);

    task.destruct().unwrap();
    assert_eq!(context.free_left(HOST).unwrap(), host_free);
    context.wait_idle(&mut d).unwrap();
    assert_eq!(d.devices().collect::<Vec<_>>(), vec![GPU]);
    assert!(d.is_available(GPU));
}

#[test]
fn failed_scheduling_releases_everything() {
    let limits = Limits {
        max_active_tasks: 1,
        ..Default::default()
    };
    let (context, _handle) = setup(true, limits);
    let [mut d, mut l, mut r] = operands(&context, HOST);
    let free = context.free_left(GPU).unwrap();

    // rank mismatch
    let mut task = Task::new();
    let err = context
        .contract(
            &mut task,
            &Contraction::new("D(a)+=L(a,c)*R(c,b)", 1.0),
            &mut d,
            &mut l,
            &mut r,
            GPU,
            CopyControl::KEEP_ALL,
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgs);
    assert!(task.is_empty());

    // the active-task slab holds a single record
    let [mut d2, mut l2, mut r2] = operands(&context, HOST);
    context
        .contract(
            &mut task,
            &matmul(),
            &mut d,
            &mut l,
            &mut r,
            GPU,
            CopyControl::KEEP_ALL,
        )
        .unwrap();
    let used = context.free_left(GPU).unwrap();
    assert!(used < free);
    let mut other = Task::new();
    let err = context
        .contract(
            &mut other,
            &matmul(),
            &mut d2,
            &mut l2,
            &mut r2,
            GPU,
            CopyControl::KEEP_ALL,
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LimitExceeded);
    assert_eq!(context.free_left(GPU).unwrap(), used);
    assert!(other.is_empty());

    let stats = context.stats(GPU).unwrap();
    assert_eq!(stats.tasks.len(), 1);
    assert_eq!(stats.cache.unwrap().referenced, 1);
    let indices = context.stats(HOST).unwrap().indices.unwrap();
    assert_eq!(indices.outstanding, 3);
    assert_eq!(indices.capacity, 3);
}

#[test]
fn kind_mismatch_is_invalid() {
    let (context, _handle) = setup(true, Limits::default());
    let [mut d, mut l, _] = operands(&context, GPU);
    let mut r = context
        .construct(Shape::new([8, 8]).unwrap(), DataKind::C4, GPU, Init::Buffer)
        .unwrap();
    let mut task = Task::new();
    let err = context
        .contract(
            &mut task,
            &matmul(),
            &mut d,
            &mut l,
            &mut r,
            GPU,
            CopyControl::KEEP_ALL,
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgs);
}

#[tokio::test]
async fn wait_all_async_completes() {
    let (context, _handle) = setup(false, Limits::default());
    let mut tensors: Vec<[TensorBlock; 3]> = (0..3).map(|_| operands(&context, GPU)).collect();
    let mut tasks: Vec<Task> = (0..3).map(|_| Task::new()).collect();
    for (task, [d, l, r]) in tasks.iter_mut().zip(tensors.iter_mut()) {
        context
            .contract(
                task,
                &matmul(),
                d,
                l,
                r,
                GPU,
                CopyControl::KEEP_ALL,
            )
            .unwrap();
    }
    let statuses = wait_all_async(&tasks).await.unwrap();
    assert!(statuses.iter().all(|&x| x == TaskStatus::Completed));
    assert_eq!(tasks[0].wait_async().await.unwrap(), TaskStatus::Completed);
}

#[test]
fn use_after_shutdown() {
    let (context, handle) = setup(true, Limits::default());
    let [mut d, mut l, mut r] = operands(&context, GPU);
    let mut task = Task::new();
    context
        .contract(
            &mut task,
            &matmul(),
            &mut d,
            &mut l,
            &mut r,
            GPU,
            CopyControl::KEEP_ALL,
        )
        .unwrap();
    context.shutdown().unwrap();

    let err = task.poll().unwrap_err();
    assert_eq!(err, TaskError::Detached);
    assert_eq!(
        context.place(&mut d, HOST, CopyMode::Keep).unwrap_err().kind(),
        ErrorKind::NotInitialized
    );
    handle.complete(task.ticket().unwrap());

    // the binding went away with the context
    assert_eq!(task.destruct(), Err(TaskError::Detached));
    assert!(task.is_empty());
    assert_eq!(task.destruct(), Err(TaskError::Destructed));
}

#[test]
fn failed_staging_leaves_inputs_intact() {
    let (context, handle) = setup(true, Limits::default());
    let free = context.free_left(GPU).unwrap();
    let [mut d, mut l, mut r] = operands(&context, HOST);
    let mut task = Task::new();
    context
        .contract(
            &mut task,
            &matmul(),
            &mut d,
            &mut l,
            &mut r,
            GPU,
            CopyControl::KEEP_ALL,
        )
        .unwrap();
    handle.fail(task.ticket().unwrap(), 9);
    assert_eq!(task.wait().unwrap(), TaskStatus::Error);
    task.destruct().unwrap();
    let indices = context.stats(HOST).unwrap().indices.unwrap();
    assert_eq!(indices.outstanding, 0);

    // only the destination was written
    for input in [&mut l, &mut r] {
        assert_eq!(context.sync(input, HOST).unwrap().device, HOST);
        assert_eq!(input.devices().collect::<Vec<_>>(), vec![HOST]);
    }
    let err = context.sync(&mut d, HOST).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Failure);
    assert_eq!(context.free_left(GPU).unwrap(), free);
}

#[test]
fn inputs_are_shared_between_readers() {
    let (context, handle) = setup(true, Limits::default());
    let mut l = block(&context, GPU);
    let [mut d1, mut r1, mut d2, mut r2] = std::array::from_fn(|_| block(&context, GPU));
    let mut tasks = [Task::new(), Task::new()];
    let [first, second] = &mut tasks;
    context
        .contract(
            first,
            &matmul(),
            &mut d1,
            &mut l,
            &mut r1,
            GPU,
            CopyControl::KEEP_ALL,
        )
        .unwrap();
    context
        .contract(
            second,
            &matmul(),
            &mut d2,
            &mut l,
            &mut r2,
            GPU,
            CopyControl::KEEP_ALL,
        )
        .unwrap();
    assert_eq!(l.record(GPU).unwrap().readers(), 2);
    assert!(l.is_available(GPU));

    // a third reader copies it out while the contractions run
    let Placement::InFlight(ticket) = context.place(&mut l, HOST, CopyMode::Keep).unwrap() else {
        panic!("expected a transfer");
    };
    assert_eq!(l.record(GPU).unwrap().readers(), 3);
    assert_eq!(
        context.discard(&mut l, GPU).unwrap_err().kind(),
        ErrorKind::InProgress
    );
    assert_eq!(
        context.destruct(&mut l).unwrap_err().kind(),
        ErrorKind::InProgress
    );

    // the destination of a running contraction is not shared
    let mut third = Task::new();
    let err = context
        .contract(
            &mut third,
            &matmul(),
            &mut d1,
            &mut l,
            &mut r2,
            GPU,
            CopyControl::KEEP_ALL,
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InProgress);

    for ticket in tasks.iter().filter_map(Task::ticket).chain([ticket]) {
        handle.complete(ticket);
    }
    assert!(wait_all(&tasks).unwrap().iter().all(|x| *x == TaskStatus::Completed));
    for task in &mut tasks {
        task.destruct().unwrap();
    }
    context.wait_idle(&mut l).unwrap();
    assert_eq!(l.record(GPU).unwrap().readers(), 0);
    assert_eq!(l.ndev(), 2);
    context.discard(&mut l, GPU).unwrap();
    assert!(l.is_available(HOST));
}

#[test]
fn constant_cache_evicts_through_contract() {
    let limits = Limits {
        const_cache_entries: 1,
        ..Default::default()
    };
    let (context, handle) = setup(true, limits);
    let [mut d, mut l, mut r] = operands(&context, GPU);
    let transpose = Contraction::new("D(i,j)+=L(k,i)*R(j,k)", 1.0);

    let mut task = Task::new();
    context
        .contract(
            &mut task,
            &matmul(),
            &mut d,
            &mut l,
            &mut r,
            GPU,
            CopyControl::KEEP_ALL,
        )
        .unwrap();
    handle.complete(task.ticket().unwrap());
    task.wait().unwrap();

    // the only slot is referenced by a bound task
    let [mut d2, mut l2, mut r2] = operands(&context, GPU);
    let mut other = Task::new();
    let err = context
        .contract(
            &mut other,
            &transpose,
            &mut d2,
            &mut l2,
            &mut r2,
            GPU,
            CopyControl::KEEP_ALL,
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LimitExceeded);
    assert!(other.is_empty());
    assert!(!l2.has_pending());

    // once unreferenced, the least recently used pattern is evicted
    task.destruct().unwrap();
    let cache = context.stats(GPU).unwrap().cache.unwrap();
    assert_eq!((cache.resident, cache.referenced), (1, 0));
    context
        .contract(
            &mut other,
            &transpose,
            &mut d2,
            &mut l2,
            &mut r2,
            GPU,
            CopyControl::KEEP_ALL,
        )
        .unwrap();
    let cache = context.stats(GPU).unwrap().cache.unwrap();
    assert_eq!((cache.resident, cache.referenced), (1, 1));

    // the evicted pattern is uploaded again
    let [mut d3, mut l3, mut r3] = operands(&context, GPU);
    let err = context
        .contract(
            &mut task,
            &matmul(),
            &mut d3,
            &mut l3,
            &mut r3,
            GPU,
            CopyControl::KEEP_ALL,
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LimitExceeded);
    handle.complete(other.ticket().unwrap());
    other.wait().unwrap();
    other.destruct().unwrap();
}

#[test]
fn wait_async_without_tokio() {
    let (context, _handle) = setup(false, Limits::default());
    let [mut d, mut l, mut r] = operands(&context, GPU);
    let mut task = Task::new();
    context
        .contract(
            &mut task,
            &matmul(),
            &mut d,
            &mut l,
            &mut r,
            GPU,
            CopyControl::KEEP_ALL,
        )
        .unwrap();
    let status = futures::executor::block_on(task.wait_async()).unwrap();
    assert_eq!(status, TaskStatus::Completed);
    task.destruct().unwrap();
}

#[test]
fn residency_holds_under_random_interleaving() {
    let (sim, handle) = Sim::manual(DeviceKind::Gpu);
    let config = Config::new(Arc::new(CpuBuilder::new().build()))
        .host_buffer(BUFFER)
        .gpus(Arc::new(sim), [0, 1, 2], BUFFER);
    let context = Context::new();
    context.initialize(config).unwrap();
    let devices: Vec<DeviceId> = (0..4).map(DeviceId).collect();
    let free: Vec<usize> = devices
        .iter()
        .map(|&x| context.free_left(x).unwrap())
        .collect();

    let mut rng = fastrand::Rng::with_seed(0x7e45);
    let mut tensor = block(&context, HOST);
    let mut inflight: Vec<Ticket> = vec![];
    for _ in 0..2000 {
        let device = devices[rng.usize(..devices.len())];
        match rng.u8(..4) {
            0 => {
                let mode = match rng.bool() {
                    true => CopyMode::Keep,
                    false => CopyMode::Move,
                };
                match context.place(&mut tensor, device, mode) {
                    Ok(Placement::InFlight(ticket)) => inflight.push(ticket),
                    Ok(Placement::Resident) => assert!(tensor.record(device).is_some()),
                    Err(err) => assert!(matches!(
                        err.kind(),
                        ErrorKind::InProgress | ErrorKind::ObjectIsEmpty
                    )),
                }
            }
            // the last copy is kept so the block never empties
            1 if tensor.ndev() > 1 => match context.discard(&mut tensor, device) {
                Ok(()) => assert!(tensor.record(device).is_none()),
                Err(err) => assert!(matches!(
                    err.kind(),
                    ErrorKind::InProgress | ErrorKind::ObjectIsEmpty
                )),
            },
            2 if !inflight.is_empty() => {
                let ticket = inflight.swap_remove(rng.usize(..inflight.len()));
                match rng.u8(..8) {
                    0 => handle.fail(ticket, 3),
                    _ => handle.complete(ticket),
                }
            }
            _ => context.reconcile(&mut tensor).unwrap(),
        }

        assert!(tensor.devices().all_unique());
        assert!((1..=MAX_DEV_PRESENT).contains(&tensor.ndev()) || tensor.has_pending());
        for record in tensor.records().filter(|x| x.is_available()) {
            assert!(devices.contains(&record.device()));
        }
    }

    for ticket in inflight {
        handle.complete(ticket);
    }
    context.wait_idle(&mut tensor).unwrap();
    assert!(tensor.records().all(|x| x.is_available()));
    context.destruct(&mut tensor).unwrap();
    for (device, free) in devices.into_iter().zip(free) {
        assert_eq!(context.free_left(device).unwrap(), free);
    }
}
