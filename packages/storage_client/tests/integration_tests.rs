//! End-to-end scenarios for `storage_client` running on the in-memory storage backend and the
//! loopback event backend.

#![allow(
    clippy::indexing_slicing,
    reason = "we do not need to worry about these things when writing test code"
)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use event_queue::{Attachment, EventQueueConfig, LoopbackBackend, ResultCode};
use storage_client::{
    ClientContext, ClientOptions, ContainerFlags, IoAttachment, IoKind, MemoryStorage,
    PoolOptions, ResourceKind,
};
use uuid::Uuid;

const POOL: Uuid = Uuid::from_u128(0x10);
const CONTAINER: Uuid = Uuid::from_u128(0x20);

fn setup_with_capacity(
    capacity: u16,
) -> (Arc<ClientContext>, Arc<MemoryStorage>, Arc<LoopbackBackend>) {
    let storage = Arc::new(MemoryStorage::new());
    let events = Arc::new(LoopbackBackend::new());

    let context = ClientContext::builder()
        .storage(storage.clone())
        .events(events.clone())
        .event_queue(EventQueueConfig::builder().capacity(capacity).build())
        .build()
        .unwrap();

    (Arc::new(context), storage, events)
}

fn setup() -> (Arc<ClientContext>, Arc<MemoryStorage>, Arc<LoopbackBackend>) {
    setup_with_capacity(8)
}

#[test]
fn threads_share_handles_and_each_get_their_own_queue() {
    testing::with_watchdog(|| {
        const THREADS: usize = 4;

        let (context, storage, events) = setup();
        let handles = Arc::new(Mutex::new(Vec::new()));

        testing::on_threads(THREADS, {
            let context = Arc::clone(&context);
            let events = Arc::clone(&events);
            let handles = Arc::clone(&handles);

            move |index| {
                let pool = context.connect_pool(POOL, &PoolOptions::default()).unwrap();
                let container = context
                    .open_container(&pool, CONTAINER, ContainerFlags::ReadWrite)
                    .unwrap();
                let client = context
                    .mount(&pool, Some(&container), &ClientOptions::default())
                    .unwrap();

                let offset = u64::try_from(index).unwrap() * 4096;
                let write = IoAttachment::write(offset, vec![7; 64]);
                let mut completed = Vec::new();

                let event = context
                    .submit_io(write.clone(), Duration::from_secs(5), &mut completed)
                    .unwrap();
                let queue = context.event_queue().unwrap().borrow().backend_queue();
                assert!(events.complete(queue, event, ResultCode::SUCCESS));

                context
                    .wait_io(IoKind::Write, Duration::from_secs(5), &mut completed)
                    .unwrap();
                assert!(write.succeeded());

                handles.lock().unwrap().push((client, container, pool));
            }
        });

        assert_eq!(storage.opens(ResourceKind::Pool), 1);
        assert_eq!(storage.opens(ResourceKind::Container), 1);
        assert_eq!(storage.opens(ResourceKind::Mount), 1);
        assert_eq!(context.pools().ref_count(&POOL), THREADS);
        // Each thread's queue went away with its thread.
        assert_eq!(events.queue_count(), 0);

        // Release children before parents, the way well-behaved owners do.
        for (client, container, pool) in std::mem::take(&mut *handles.lock().unwrap()) {
            client.close().unwrap();
            container.close().unwrap();
            pool.close().unwrap();
        }

        assert_eq!(storage.open_now(ResourceKind::Pool), 0);
        assert!(context.pools().is_empty());

        assert!(context.shutdown());
        assert!(storage.is_finalized());
    });
}

#[test]
fn completions_of_other_kinds_wait_their_turn() {
    let (context, _storage, events) = setup();

    let read = IoAttachment::read(0, 32);
    let update = IoAttachment::update("dkey", "akey", b"value".to_vec());
    let mut completed = Vec::new();

    let read_event = context
        .submit_io(read.clone(), Duration::from_secs(1), &mut completed)
        .unwrap();
    let update_event = context
        .submit_io(update.clone(), Duration::from_secs(1), &mut completed)
        .unwrap();

    let queue = context.event_queue().unwrap().borrow().backend_queue();
    events.complete(queue, update_event, ResultCode::SUCCESS);
    events.complete(queue, read_event, ResultCode::new(-5));

    context
        .wait_io(IoKind::Read, Duration::from_secs(1), &mut completed)
        .unwrap();
    assert_eq!(completed.len(), 1);
    assert!(completed[0].same_operation(&read));
    assert_eq!(read.result(), Some(ResultCode::new(-5)));

    // The update completed first but nobody asked for it until now.
    assert_eq!(
        context
            .event_queue()
            .unwrap()
            .borrow()
            .detained_len(IoKind::Update),
        1
    );

    completed.clear();
    context
        .wait_io(IoKind::Update, Duration::from_secs(1), &mut completed)
        .unwrap();
    assert!(completed[0].same_operation(&update));
    assert!(update.succeeded());
}

#[test]
fn aborted_operation_is_released_not_delivered() {
    let (context, _storage, _events) = setup();

    let fetch = IoAttachment::fetch("dkey", "akey", 128);
    let event = context
        .submit_io(fetch.clone(), Duration::from_secs(1), &mut Vec::new())
        .unwrap();

    let queue = context.event_queue().unwrap();
    assert!(queue.borrow_mut().abort_event(event).unwrap());

    let mut completed = Vec::new();
    let polled = queue
        .borrow_mut()
        .poll_completed(
            &mut completed,
            IoKind::Fetch,
            None,
            1,
            Duration::from_millis(100),
        )
        .unwrap();

    assert_eq!(polled, 0);
    assert!(completed.is_empty());
    assert!(fetch.is_released());
    assert_eq!(fetch.result(), None);
    assert_eq!(queue.borrow().acquired(), 0);
}

#[test]
fn reusable_operation_stays_on_its_event() {
    // A single event, so every acquisition lands on the slot the operation is bound to.
    let (context, _storage, events) = setup_with_capacity(1);

    let update = IoAttachment::update("dkey", "akey", vec![1; 8]).reusable();
    let event = context
        .submit_io(update.clone(), Duration::from_secs(1), &mut Vec::new())
        .unwrap();

    let queue = context.event_queue().unwrap();
    let backend_queue = queue.borrow().backend_queue();
    let mut completed = Vec::new();

    for round in 0..3 {
        if round > 0 {
            let mut queue = queue.borrow_mut();
            assert_eq!(queue.acquire_event().unwrap(), Some(event));
            queue.reuse_attachment(event).unwrap();
            queue.submit(event, &update.descriptor()).unwrap();
        }

        events.complete(backend_queue, event, ResultCode::SUCCESS);
        queue
            .borrow_mut()
            .wait_for_completion(Duration::from_secs(1), IoKind::Update, &mut completed)
            .unwrap();

        assert!(update.succeeded());
        assert!(!update.is_released());
    }

    assert_eq!(completed.len(), 3);
    assert!(completed.iter().all(|op| op.kind() == IoKind::Update));
}

#[test]
fn private_mount_is_separate_from_shared_one() {
    let (context, storage, _events) = setup();

    let pool = context.connect_pool(POOL, &PoolOptions::default()).unwrap();
    let shared = context
        .mount(&pool, None, &ClientOptions::default())
        .unwrap();
    let private = context
        .mount(
            &pool,
            None,
            &ClientOptions::builder().shared(false).read_only(true).build(),
        )
        .unwrap();

    assert!(private.native().read_only());
    assert!(!private.is_shared());
    assert_eq!(context.clients().len(), 1);

    private.close().unwrap();
    drop(shared);
    drop(pool);

    assert_eq!(storage.opens(ResourceKind::Mount), 2);
    assert_eq!(storage.closes(ResourceKind::Mount), 2);
    assert_eq!(storage.open_now(ResourceKind::Pool), 0);
}
