use std::time::Duration;

use bytes::Bytes;
use nix::errno::Errno;
use xnbd_proto::{CommandKind, SUBMIT_BLOCK_SIZE};

use crate::transport::loopback::LoopbackTransport;
use crate::transport::store::{DirStore, MemoryStore};
use crate::transport::TransportError;
use crate::{
    metrics, BlockRequest, ConnectionState, ControlPolicy, Error, Payload, Session, SessionConfig,
    SessionRegistry, SessionState, SetupStage, SubmitError, Topology,
};

const PORTAL: &str = "rdma://192.168.1.10:1234";
const DISK: &str = "/exports/disk0.img";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn config(nr_connections: usize, queue_depth: u32) -> SessionConfig {
    SessionConfig {
        nr_connections,
        queue_depth,
        pin_threads: false,
        control_policy: ControlPolicy::Fixed(0),
    }
}

fn topology() -> Topology {
    Topology::new(0..4, [0, 1])
}

fn loopback_with_disk(size: usize) -> (LoopbackTransport, MemoryStore) {
    let store = MemoryStore::new();
    store.insert(DISK, vec![0; size]);
    (LoopbackTransport::new(store.clone()), store)
}

async fn session(transport: &LoopbackTransport, nr_connections: usize, queue_depth: u32) -> Session {
    init_tracing();
    Session::create_with_topology(transport, PORTAL, config(nr_connections, queue_depth), topology())
        .await
        .unwrap()
}

async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {what}");
}

#[tokio::test]
async fn open_registers_device_with_capacity_in_sectors() {
    let (transport, store) = loopback_with_disk(4096);
    let mut session = session(&transport, 4, 64).await;
    assert_eq!(session.state(), SessionState::Active);
    assert_eq!(session.connections().len(), 4);
    assert!(session
        .connections()
        .iter()
        .all(|c| c.state() == ConnectionState::Open));

    let device = session.open_device(DISK).await.unwrap();
    assert_eq!(device.capacity_sectors(), 8);
    assert_eq!(device.stat().size, 4096);
    assert_eq!(device.queues().len(), 4);
    assert_eq!(device.queue_depth(), 64);
    assert_eq!(device.name(), format!("xnbd{}", device.index()));
    assert_eq!(store.queue_depth_of(device.fd()), Some(64));
    assert_eq!(session.devices().len(), 1);
    assert!(session.device(device.index()).is_some());
    assert_eq!(device.session_state(), Some(SessionState::Active));
    for (i, queue) in device.queues().iter().enumerate() {
        assert_eq!(queue.index(), i);
        assert_eq!(queue.connection().index(), i);
        assert_eq!(Some(queue.node()), device.assignment().node_of(i));
    }

    session.shutdown().await;
    assert!(matches!(
        device.session_state(),
        None | Some(SessionState::Closed)
    ));
}

#[tokio::test]
async fn write_is_routed_on_the_connection_of_its_queue() {
    let (transport, store) = loopback_with_disk(64 * 1024);
    let mut session = session(&transport, 4, 64).await;
    let device = session.open_device(DISK).await.unwrap();

    let data = Bytes::from(vec![0xab; SUBMIT_BLOCK_SIZE]);
    let (request, done) = BlockRequest::with_channel(16384, Some(Payload::write(data.clone())));
    device.submit(2, request).unwrap();
    let completion = done.await.unwrap();
    assert_eq!(completion.result.unwrap(), SUBMIT_BLOCK_SIZE);

    assert_eq!(transport.submits_on(PORTAL, 2), 1);
    for other in [0, 1, 3] {
        assert_eq!(transport.submits_on(PORTAL, other), 0);
    }
    let contents = store.contents(DISK).unwrap();
    assert!(contents[16384..32768].iter().all(|b| *b == 0xab));
    assert!(contents[..16384].iter().all(|b| *b == 0));

    let (request, done) = BlockRequest::with_channel(16384, Some(Payload::read(4096)));
    device.submit(1, request).unwrap();
    let completion = done.await.unwrap();
    assert_eq!(completion.result.unwrap(), 4096);
    let buf = completion.payload.and_then(Payload::into_read).unwrap();
    assert_eq!(&buf[..], &data[..4096]);

    session.shutdown().await;
}

#[tokio::test]
async fn failed_stat_aborts_registration() {
    let (transport, _store) = loopback_with_disk(4096);
    let mut session = session(&transport, 2, 64).await;

    transport.fail_command(CommandKind::Fstat, Some(Errno::ENOENT));
    let err = session.open_device(DISK).await.unwrap_err();
    match &err {
        Error::Setup { stage, source } => {
            assert_eq!(*stage, SetupStage::Stat);
            assert!(matches!(
                **source,
                Error::RemoteControl {
                    kind: CommandKind::Fstat,
                    ..
                }
            ));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(err.remote_errno(), Some(Errno::ENOENT as i32));
    assert!(session.devices().is_empty());

    // the session itself is unharmed
    transport.fail_command(CommandKind::Fstat, None);
    session.open_device(DISK).await.unwrap();
    assert_eq!(session.devices().len(), 1);

    session.shutdown().await;
}

#[tokio::test]
async fn missing_remote_file_fails_the_open_stage() {
    let (transport, _store) = loopback_with_disk(4096);
    let mut session = session(&transport, 1, 8).await;
    let err = session.open_device("/exports/nope.img").await.unwrap_err();
    assert!(matches!(
        err,
        Error::Setup {
            stage: SetupStage::Open,
            ..
        }
    ));
    assert_eq!(err.remote_errno(), Some(Errno::ENOENT as i32));
    session.shutdown().await;
}

#[tokio::test]
async fn session_teardown_wakes_every_blocked_control_waiter() {
    let (transport, _store) = loopback_with_disk(4096);
    let session = session(&transport, 4, 64).await;
    transport.hold_control_answers(true);

    let calls = futures::future::join_all([1, 2, 3].map(|i| {
        let connection = session.connection(i).unwrap().clone();
        async move { connection.stat(3).await }
    }));
    let teardown = async {
        eventually("three held answers", || transport.held_answers(PORTAL) == 3).await;
        assert!(transport.raise_session_teardown(PORTAL));
    };
    let (results, ()) = tokio::join!(calls, teardown);
    for result in results {
        assert!(
            matches!(result, Err(Error::ConnectionClosed { .. })),
            "{result:?}"
        );
    }

    eventually("session closed", || session.state() == SessionState::Closed).await;
    assert_eq!(transport.is_session_destroyed(PORTAL), Some(true));
    assert!(session
        .connections()
        .iter()
        .all(|c| c.state() == ConnectionState::Destroyed));
    session.shutdown().await;
}

#[tokio::test]
async fn failed_connection_unwinds_the_ones_before_it_in_reverse() {
    init_tracing();
    let (transport, _store) = loopback_with_disk(4096);
    transport.refuse_connect_on(2);
    let err = Session::create_with_topology(&transport, PORTAL, config(4, 64), topology())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Transport(TransportError::ConnectRefused { index: 2, .. })
    ));
    assert_eq!(transport.destroyed_connections(PORTAL), vec![3, 1, 0]);
    assert_eq!(transport.live_connections(PORTAL), 0);
    assert_eq!(transport.is_session_destroyed(PORTAL), Some(true));
}

#[tokio::test]
async fn abandoned_create_stops_every_started_connection() {
    init_tracing();
    let (transport, _store) = loopback_with_disk(4096);
    transport.delay_connects(Some(Duration::from_millis(200)));
    let created = tokio::time::timeout(
        Duration::from_millis(50),
        Session::create_with_topology(&transport, PORTAL, config(3, 8), topology()),
    )
    .await;
    assert!(created.is_err(), "connections are still being established");

    eventually("abandoned session closed", || {
        transport.is_session_destroyed(PORTAL) == Some(true)
    })
    .await;
    assert_eq!(transport.live_connections(PORTAL), 0);
    let mut destroyed = transport.destroyed_connections(PORTAL);
    destroyed.sort_unstable();
    assert_eq!(destroyed, vec![0, 1, 2]);
}

#[tokio::test]
async fn refused_session_reports_transport_failure() {
    init_tracing();
    let (transport, _store) = loopback_with_disk(4096);
    transport.refuse_sessions(true);
    let err = Session::create_with_topology(&transport, PORTAL, config(2, 64), topology())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Transport(TransportError::SessionRefused { .. })
    ));
    assert_eq!(transport.is_session_destroyed(PORTAL), None);
}

#[tokio::test]
async fn invalid_config_is_rejected_before_connecting() {
    let (transport, _store) = loopback_with_disk(4096);
    for config in [config(0, 64), config(2, 0)] {
        let err = Session::create_with_topology(&transport, PORTAL, config, topology())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }
    assert_eq!(transport.is_session_destroyed(PORTAL), None);
}

#[tokio::test]
async fn interrupted_control_wait_poisons_until_reset() {
    let (transport, _store) = loopback_with_disk(4096);
    let session = session(&transport, 2, 64).await;
    let connection = session.connection(1).unwrap().clone();
    let fd = connection.open(DISK, xnbd_proto::OPEN_FLAGS_RDWR).await.unwrap();

    transport.hold_control_answers(true);
    let waited = tokio::time::timeout(Duration::from_millis(50), connection.stat(fd)).await;
    assert!(waited.is_err(), "answer was held back");
    assert!(connection.is_control_poisoned().await);
    assert!(matches!(
        connection.stat(fd).await,
        Err(Error::ControlPoisoned { index: 1 })
    ));
    // the other connection is not affected
    assert!(!session.connection(0).unwrap().is_control_poisoned().await);

    connection.reset_control().await.unwrap();
    assert!(!connection.is_control_poisoned().await);
    // releases the stale FSTAT answer; the next caller must not see it
    transport.hold_control_answers(false);
    let second = connection.open(DISK, xnbd_proto::OPEN_FLAGS_RDWR).await.unwrap();
    assert_ne!(second, fd);
    assert_eq!(connection.stat(second).await.unwrap().size, 4096);

    session.shutdown().await;
}

#[tokio::test]
async fn serial_control_rpcs_see_their_own_answers() {
    init_tracing();
    let store = MemoryStore::new();
    for i in 0..8 {
        store.insert(format!("/f{i}"), vec![0; 512 * (i + 1)]);
    }
    let transport = LoopbackTransport::new(store);
    let session = Session::create_with_topology(&transport, PORTAL, config(1, 4), topology())
        .await
        .unwrap();
    let connection = session.connection(0).unwrap();
    for round in 0..3 {
        for i in 0..8 {
            let fd = connection
                .open(&format!("/f{i}"), xnbd_proto::OPEN_FLAGS_RDWR)
                .await
                .unwrap();
            let stat = connection.stat(fd).await.unwrap();
            assert_eq!(stat.size, 512 * (i as u64 + 1), "round {round}");
            connection.setup(fd, 4).await.unwrap();
        }
    }
    session.shutdown().await;
}

#[tokio::test]
async fn submit_answer_without_back_reference_is_counted_not_fatal() {
    let (transport, _store) = loopback_with_disk(64 * 1024);
    let mut session = session(&transport, 2, 64).await;
    let device = session.open_device(DISK).await.unwrap();
    let orphans_before = metrics::global().orphan_completions;

    transport.strip_io_contexts(1);
    let (request, done) = BlockRequest::with_channel(0, Some(Payload::write(vec![1u8; 4096])));
    device.submit(0, request).unwrap();
    let completion = done.await.unwrap();
    assert!(matches!(completion.result, Err(Error::Discarded)));
    eventually("orphan counted", || {
        metrics::global().orphan_completions > orphans_before
    })
    .await;

    let (request, done) = BlockRequest::with_channel(0, Some(Payload::write(vec![2u8; 4096])));
    device.submit(0, request).unwrap();
    assert_eq!(done.await.unwrap().result.unwrap(), 4096);
    assert_eq!(session.connection(0).unwrap().state(), ConnectionState::Open);

    session.shutdown().await;
}

#[tokio::test]
async fn empty_requests_complete_without_a_command() {
    let (transport, _store) = loopback_with_disk(4096);
    let mut session = session(&transport, 1, 8).await;
    let device = session.open_device(DISK).await.unwrap();

    for payload in [None, Some(Payload::write(Bytes::new())), Some(Payload::read(0))] {
        let (request, mut done) = BlockRequest::with_channel(0, payload);
        device.submit(0, request).unwrap();
        let completion = done.try_recv().expect("completed inline");
        assert_eq!(completion.result.unwrap(), 0);
    }
    assert_eq!(transport.submits_on(PORTAL, 0), 0);

    session.shutdown().await;
}

#[tokio::test]
async fn oversize_transfer_is_unsupported() {
    let (transport, _store) = loopback_with_disk(64 * 1024);
    let mut session = session(&transport, 1, 8).await;
    let device = session.open_device(DISK).await.unwrap();

    let (request, mut done) =
        BlockRequest::with_channel(0, Some(Payload::read(SUBMIT_BLOCK_SIZE + 512)));
    device.submit(0, request).unwrap();
    let completion = done.try_recv().expect("completed inline");
    assert!(matches!(
        completion.result,
        Err(Error::Unsupported { len, max }) if len == SUBMIT_BLOCK_SIZE + 512 && max == SUBMIT_BLOCK_SIZE
    ));
    assert!(completion.payload.is_some(), "buffer is handed back");
    assert_eq!(transport.submits_on(PORTAL, 0), 0);

    session.shutdown().await;
}

#[tokio::test]
async fn full_queue_depth_hands_the_request_back() {
    let (transport, store) = loopback_with_disk(64 * 1024);
    let mut session = session(&transport, 2, 1).await;
    let device = session.open_device(DISK).await.unwrap();
    assert_eq!(store.queue_depth_of(device.fd()), Some(1));

    transport.hold_io_answers(true);
    let (first, first_done) = BlockRequest::with_channel(0, Some(Payload::read(512)));
    device.submit(0, first).unwrap();
    assert_eq!(device.queue(0).unwrap().connection().in_flight(), 1);

    let (second, mut second_done) = BlockRequest::with_channel(512, Some(Payload::read(512)));
    let second = match device.submit(0, second) {
        Err(SubmitError::Busy { index: 0, request }) => request,
        other => panic!("expected busy, got {other:?}"),
    };
    assert_eq!(second.offset, 512);
    assert!(second_done.try_recv().is_err(), "no completion for a refused request");

    // other queues have their own depth
    let (other, other_done) = BlockRequest::with_channel(0, Some(Payload::read(512)));
    device.submit(1, other).unwrap();

    eventually("both submits held", || transport.held_answers(PORTAL) == 2).await;
    transport.hold_io_answers(false);
    assert_eq!(first_done.await.unwrap().result.unwrap(), 512);
    assert_eq!(other_done.await.unwrap().result.unwrap(), 512);

    device.submit(0, second).unwrap();
    assert_eq!(second_done.await.unwrap().result.unwrap(), 512);

    session.shutdown().await;
}

#[tokio::test]
async fn answers_in_reverse_order_reach_their_own_requests() {
    let (transport, store) = loopback_with_disk(64 * 1024);
    let mut contents = vec![0u8; 64 * 1024];
    for (block, chunk) in contents.chunks_mut(4096).enumerate() {
        chunk.fill(block as u8 + 1);
    }
    store.insert(DISK, contents);
    let mut session = session(&transport, 2, 16).await;
    let device = session.open_device(DISK).await.unwrap();

    transport.hold_io_answers(true);
    transport.release_held_in_reverse(true);
    let mut pending = Vec::new();
    for block in 0..8u64 {
        let (request, done) = BlockRequest::with_channel(block * 4096, Some(Payload::read(4096)));
        device.submit(0, request).unwrap();
        pending.push((block, done));
    }
    eventually("all reads held", || transport.held_answers(PORTAL) == 8).await;
    transport.hold_io_answers(false);

    for (block, done) in pending {
        let completion = done.await.expect("one completion per request");
        assert_eq!(completion.result.unwrap(), 4096);
        let buf = completion.payload.and_then(Payload::into_read).unwrap();
        assert!(
            buf.iter().all(|b| *b == block as u8 + 1),
            "block {block} got another request's data"
        );
    }
    assert_eq!(session.connection(0).unwrap().in_flight(), 0);

    session.shutdown().await;
}

#[tokio::test]
async fn remote_io_error_is_surfaced_verbatim() {
    let (transport, _store) = loopback_with_disk(64 * 1024);
    let mut session = session(&transport, 2, 8).await;
    let device = session.open_device(DISK).await.unwrap();

    transport.fail_command(CommandKind::IoSubmit, Some(Errno::EIO));
    let (request, done) = BlockRequest::with_channel(0, Some(Payload::write(vec![0u8; 512])));
    device.submit(1, request).unwrap();
    let completion = done.await.unwrap();
    let err = completion.result.unwrap_err();
    assert!(matches!(err, Error::RemoteIo { ret: -1, .. }), "{err:?}");
    assert_eq!(err.remote_errno(), Some(Errno::EIO as i32));

    session.shutdown().await;
}

#[tokio::test]
async fn teardown_completes_every_in_flight_request_once() {
    let (transport, _store) = loopback_with_disk(64 * 1024);
    let mut session = session(&transport, 4, 8).await;
    let device = session.open_device(DISK).await.unwrap();

    transport.hold_io_answers(true);
    let mut pending = Vec::new();
    for i in 0..8u64 {
        let (request, done) =
            BlockRequest::with_channel(i * 4096, Some(Payload::write(vec![i as u8; 4096])));
        device.submit(i as usize % 4, request).unwrap();
        pending.push(done);
    }
    eventually("all submits held", || transport.held_answers(PORTAL) == 8).await;
    assert!(transport.raise_session_teardown(PORTAL));

    for done in pending {
        let completion = done.await.expect("exactly one completion");
        assert!(matches!(completion.result, Err(Error::Discarded)));
    }
    eventually("session closed", || session.state() == SessionState::Closed).await;

    let (request, _done) = BlockRequest::with_channel(0, Some(Payload::read(512)));
    assert!(matches!(
        device.submit(0, request),
        Err(SubmitError::Closed { index: 0, .. })
    ));
    assert!(matches!(
        session.open_device(DISK).await,
        Err(Error::SessionTornDown)
    ));

    session.shutdown().await;
}

#[tokio::test]
async fn connection_teardown_only_affects_that_connection() {
    let (transport, _store) = loopback_with_disk(64 * 1024);
    let mut session = session(&transport, 4, 8).await;
    let device = session.open_device(DISK).await.unwrap();

    assert!(transport.raise_connection_teardown(PORTAL, 1));
    eventually("connection 1 destroyed", || {
        session.connection(1).unwrap().state() == ConnectionState::Destroyed
    })
    .await;
    assert_eq!(transport.destroyed_connections(PORTAL), vec![1]);
    assert_eq!(session.state(), SessionState::Active);

    let (request, _done) = BlockRequest::with_channel(0, Some(Payload::read(512)));
    assert!(matches!(
        device.submit(1, request),
        Err(SubmitError::Closed { index: 1, .. })
    ));
    let (request, done) = BlockRequest::with_channel(0, Some(Payload::read(512)));
    device.submit(0, request).unwrap();
    assert_eq!(done.await.unwrap().result.unwrap(), 512);

    session.shutdown().await;
    let mut destroyed = transport.destroyed_connections(PORTAL);
    destroyed.sort_unstable();
    assert_eq!(destroyed, vec![0, 1, 2, 3]);
}

#[tokio::test]
async fn disconnect_is_recorded_and_otherwise_ignored() {
    let (transport, _store) = loopback_with_disk(4096);
    let session = session(&transport, 3, 8).await;
    assert!(transport.raise_disconnect(PORTAL, 2));
    eventually("connection 2 disconnected", || {
        session.connection(2).unwrap().state() == ConnectionState::Disconnected
    })
    .await;
    assert_eq!(session.state(), SessionState::Active);
    assert_eq!(session.connection(0).unwrap().state(), ConnectionState::Open);
    session.shutdown().await;
}

#[tokio::test]
async fn shutdown_destroys_every_connection_and_the_session_once() {
    let (transport, _store) = loopback_with_disk(4096);
    let before = metrics::global();
    let session = session(&transport, 4, 8).await;
    session.shutdown().await;

    let mut destroyed = transport.destroyed_connections(PORTAL);
    destroyed.sort_unstable();
    assert_eq!(destroyed, vec![0, 1, 2, 3]);
    assert_eq!(transport.is_session_destroyed(PORTAL), Some(true));
    let after = metrics::global();
    assert!(after.sessions_created > before.sessions_created);
    assert!(after.sessions_destroyed > before.sessions_destroyed);
}

#[tokio::test]
async fn dropping_a_session_tears_it_down_in_the_background() {
    let (transport, _store) = loopback_with_disk(4096);
    let session = session(&transport, 2, 8).await;
    drop(session);
    eventually("transport session destroyed", || {
        transport.is_session_destroyed(PORTAL) == Some(true)
    })
    .await;
    assert_eq!(transport.live_connections(PORTAL), 0);
}

#[tokio::test]
async fn caller_cpu_policy_serves_device_open() {
    init_tracing();
    let (transport, _store) = loopback_with_disk(8192);
    let mut config = config(4, 16);
    config.control_policy = ControlPolicy::CallerCpu;
    let mut session = Session::create_with_topology(&transport, PORTAL, config, topology())
        .await
        .unwrap();
    assert!(session.control_connection().index() < 4);
    let device = session.open_device(DISK).await.unwrap();
    assert_eq!(device.capacity_sectors(), 16);
    session.shutdown().await;
}

#[tokio::test]
async fn dir_store_backs_a_device_end_to_end() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("exports")).unwrap();
    std::fs::write(dir.path().join("exports/disk0.img"), vec![0u8; 32 * 1024]).unwrap();
    let transport = LoopbackTransport::new(DirStore::new(dir.path()));
    let mut session = Session::create_with_topology(&transport, PORTAL, config(2, 8), topology())
        .await
        .unwrap();
    let device = session.open_device(DISK).await.unwrap();
    assert_eq!(device.capacity_sectors(), 64);

    let (request, done) = BlockRequest::with_channel(4096, Some(Payload::write(&b"xnbd"[..])));
    device.submit(1, request).unwrap();
    assert_eq!(done.await.unwrap().result.unwrap(), 4);

    let on_disk = std::fs::read(dir.path().join("exports/disk0.img")).unwrap();
    assert_eq!(&on_disk[4096..4100], b"xnbd");
    session.shutdown().await;
}

#[tokio::test]
async fn registry_keeps_one_session_per_portal() {
    init_tracing();
    let (transport, _store) = loopback_with_disk(4096);
    let mut registry = SessionRegistry::new();
    registry
        .create_session_with_topology(&transport, PORTAL, config(2, 8), topology())
        .await
        .unwrap()
        .open_device(DISK)
        .await
        .unwrap();
    assert!(matches!(
        registry
            .create_session_with_topology(&transport, PORTAL, config(2, 8), topology())
            .await,
        Err(Error::DuplicatePortal(p)) if p == PORTAL
    ));
    for bad in ["".to_owned(), "x".repeat(257), "has space".to_owned()] {
        assert!(matches!(
            registry
                .create_session_with_topology(&transport, &bad, config(1, 8), topology())
                .await,
            Err(Error::InvalidPortal(_))
        ));
    }
    let second = "rdma://192.168.1.11:1234";
    registry
        .create_session_with_topology(&transport, second, config(1, 8), topology())
        .await
        .unwrap();
    assert_eq!(registry.len(), 2);
    assert_eq!(registry.portals().collect::<Vec<_>>(), vec![PORTAL, second]);
    assert_eq!(registry.session(PORTAL).unwrap().devices().len(), 1);

    assert!(registry.remove_session(PORTAL).await);
    assert!(!registry.remove_session(PORTAL).await);
    assert_eq!(transport.is_session_destroyed(PORTAL), Some(true));

    // the portal can be reused once unregistered
    registry
        .create_session_with_topology(&transport, PORTAL, config(1, 8), topology())
        .await
        .unwrap();
    registry.shutdown_all().await;
    assert!(registry.is_empty());
    assert_eq!(transport.is_session_destroyed(second), Some(true));
}

#[tokio::test]
async fn registry_prunes_sessions_torn_down_remotely() {
    init_tracing();
    let (transport, _store) = loopback_with_disk(4096);
    let mut registry = SessionRegistry::new();
    registry
        .create_session_with_topology(&transport, PORTAL, config(2, 8), topology())
        .await
        .unwrap();
    assert!(registry.prune_closed().await.is_empty());

    assert!(transport.raise_session_teardown(PORTAL));
    eventually("session closed", || {
        registry.session(PORTAL).unwrap().state() == SessionState::Closed
    })
    .await;
    assert_eq!(registry.prune_closed().await, vec![PORTAL.to_owned()]);
    assert!(registry.is_empty());
}
