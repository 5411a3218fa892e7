//! Connects several threads to the same pool and container, runs some I/O through each thread's
//! event queue and shuts everything down in order.
//!
//! Runs against the in-memory storage backend and the loopback event backend, with a helper
//! thread standing in for the storage servers that complete submitted operations.
//!
//! Set `RUST_LOG=debug` to watch handles being opened, shared and closed.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use event_queue::{LoopbackBackend, ResultCode};
use storage_client::{
    ClientContext, ClientOptions, ContainerFlags, IoAttachment, IoKind, MemoryStorage,
    PoolOptions, ResourceKind,
};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

const THREAD_COUNT: usize = 4;
const WRITES_PER_THREAD: u64 = 16;

const POOL: Uuid = Uuid::from_u128(0x5eed_0000_0000_0000_0000_0000_0000_0001);
const CONTAINER: Uuid = Uuid::from_u128(0x5eed_0000_0000_0000_0000_0000_0000_0002);

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_thread_ids(true)
        .init();

    let storage = Arc::new(MemoryStorage::new());
    let events = Arc::new(LoopbackBackend::new());

    let context = Arc::new(
        ClientContext::builder()
            .storage(storage.clone())
            .events(events.clone())
            .build()
            .expect("both backends are provided"),
    );

    let servers_running = Arc::new(AtomicBool::new(true));
    let servers = thread::spawn({
        let events = Arc::clone(&events);
        let servers_running = Arc::clone(&servers_running);
        move || run_servers(&events, &servers_running)
    });

    let workers = (0..THREAD_COUNT)
        .map(|index| {
            let context = Arc::clone(&context);
            thread::spawn(move || write_some(&context, index))
        })
        .collect::<Vec<_>>();

    for worker in workers {
        worker.join().unwrap();
    }

    servers_running.store(false, Ordering::Relaxed);
    servers.join().unwrap();

    tracing::info!(
        pools_opened = storage.opens(ResourceKind::Pool),
        containers_opened = storage.opens(ResourceKind::Container),
        mounts_opened = storage.opens(ResourceKind::Mount),
        "all workers finished"
    );

    context.shutdown();

    tracing::info!(finalized = storage.is_finalized(), "client context shut down");
}

fn write_some(context: &ClientContext, index: usize) {
    let pool = context
        .connect_pool(POOL, &PoolOptions::default())
        .expect("the in-memory backend accepts any pool");
    let container = context
        .open_container(&pool, CONTAINER, ContainerFlags::ReadWrite)
        .expect("the pool is held open by this thread");
    let _client = context
        .mount(&pool, Some(&container), &ClientOptions::default())
        .expect("pool and container are held open by this thread");

    let base = u64::try_from(index).expect("thread index fits in u64") * 1_000_000;
    let mut completed = Vec::new();

    for n in 0..WRITES_PER_THREAD {
        let write = IoAttachment::write(base + n * 4096, vec![0xAB; 4096]);

        context
            .submit_io(write, Duration::from_secs(5), &mut completed)
            .expect("the servers keep completing operations");
    }

    let expected = usize::try_from(WRITES_PER_THREAD).expect("write count fits in usize");

    while completed.len() < expected {
        context
            .wait_io(IoKind::Write, Duration::from_secs(5), &mut completed)
            .expect("the servers keep completing operations");
    }

    let succeeded = completed.iter().filter(|op| op.succeeded()).count();

    tracing::info!(
        thread = index,
        succeeded,
        pool_references = pool.ref_count(),
        "writes completed"
    );
}

/// Completes whatever has been submitted to any queue until told to stop.
fn run_servers(events: &LoopbackBackend, running: &AtomicBool) {
    while running.load(Ordering::Relaxed) {
        for queue in events.queues() {
            events.complete_all(queue, ResultCode::SUCCESS);
        }

        thread::sleep(Duration::from_millis(1));
    }
}
