mod support;

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sockloop::{
    CancelKind, CompletionEvent, ManagerConfig, RecvTarget, SendSource, SockKind, SocketManager,
    Status, SystemAllocator,
};

use support::{test_task, InlineScheduler};

fn any_local() -> SocketAddr {
    SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 0)
}

#[test]
fn cancel_delivers_cancelled_status_to_a_queued_recv() {
    let scheduler = InlineScheduler::new();
    let allocator = Arc::new(SystemAllocator::new());
    let manager = SocketManager::create(scheduler, allocator, ManagerConfig::default()).unwrap();

    let socket = manager.create_socket(SockKind::Datagram);
    assert_eq!(socket.bind(any_local()), Status::Success);

    let target: sockloop::SharedRecvTarget =
        Arc::new(Mutex::new(RecvTarget::Region(vec![0u8; 16].into_boxed_slice())));
    let (tx, rx) = mpsc::channel();
    // No datagram will ever arrive, so this request sits in the queue until
    // cancelled.
    socket.recv(target, 0, false, test_task(), Arc::new(move |ev| tx.send(ev).unwrap()));

    socket.cancel(None, CancelKind::Recv);

    match rx.recv_timeout(Duration::from_secs(2)).expect("cancelled completion") {
        CompletionEvent::RecvDone { status, .. } => assert_eq!(status, Status::Cancelled),
        other => panic!("unexpected event: {other:?}"),
    }

    drop(socket);
    manager.destroy();
}

#[test]
fn cancel_only_affects_the_named_task_other_queued_recvs_complete_later() {
    let scheduler = InlineScheduler::new();
    let allocator = Arc::new(SystemAllocator::new());
    let manager = SocketManager::create(scheduler, allocator, ManagerConfig::default()).unwrap();

    let a = manager.create_socket(SockKind::Datagram);
    let b = manager.create_socket(SockKind::Datagram);
    assert_eq!(a.bind(any_local()), Status::Success);
    assert_eq!(b.bind(any_local()), Status::Success);
    let a_addr = a.get_sock_name().unwrap();

    let t1 = test_task();
    let t2 = test_task();

    let target1: sockloop::SharedRecvTarget =
        Arc::new(Mutex::new(RecvTarget::Region(vec![0u8; 16].into_boxed_slice())));
    let (tx1, rx1) = mpsc::channel();
    a.recv(target1, 0, false, Arc::clone(&t1), Arc::new(move |ev| tx1.send(ev).unwrap()));

    let target2: sockloop::SharedRecvTarget =
        Arc::new(Mutex::new(RecvTarget::Region(vec![0u8; 16].into_boxed_slice())));
    let (tx2, rx2) = mpsc::channel();
    a.recv(target2, 0, false, Arc::clone(&t2), Arc::new(move |ev| tx2.send(ev).unwrap()));

    // Cancel only t1's recv; t2's stays queued.
    a.cancel(Some(t1), CancelKind::Recv);
    match rx1.recv_timeout(Duration::from_secs(2)).expect("t1 cancelled") {
        CompletionEvent::RecvDone { status, .. } => assert_eq!(status, Status::Cancelled),
        other => panic!("unexpected event: {other:?}"),
    }
    assert!(rx2.try_recv().is_err(), "t2's recv must still be queued");

    let payload: Arc<[u8]> = Arc::from(&b"hi"[..]);
    let (send_tx, send_rx) = mpsc::channel();
    b.send(
        SendSource::Region(payload),
        Some(a_addr),
        None,
        test_task(),
        Arc::new(move |ev| send_tx.send(ev).unwrap()),
    );
    send_rx.recv_timeout(Duration::from_secs(2)).expect("send completion");

    match rx2.recv_timeout(Duration::from_secs(2)).expect("t2 recv completes normally") {
        CompletionEvent::RecvDone { status, bytes, .. } => {
            assert_eq!(status, Status::Success);
            assert_eq!(bytes, 2);
        }
        other => panic!("unexpected event: {other:?}"),
    }

    drop(a);
    drop(b);
    manager.destroy();
}

#[test]
fn connect_to_a_closed_port_is_refused() {
    let scheduler = InlineScheduler::new();
    let scheduler_handle = Arc::clone(&scheduler);
    let allocator = Arc::new(SystemAllocator::new());
    let manager = SocketManager::create(scheduler, allocator, ManagerConfig::default()).unwrap();

    // Bind a socket to reserve a free port, then drop it without listening
    // so nothing is accepting connections there.
    let probe = manager.create_socket(SockKind::Stream);
    assert_eq!(probe.bind(any_local()), Status::Success);
    let dead_addr = probe.get_sock_name().unwrap();
    drop(probe);

    let client = manager.create_socket(SockKind::Stream);
    let (tx, rx) = mpsc::channel();
    client.connect(dead_addr, test_task(), Arc::new(move |ev| tx.send(ev).unwrap()));

    match rx.recv_timeout(Duration::from_secs(2)).expect("connect completion") {
        CompletionEvent::Connect { status } => assert_eq!(status, Status::ConnRefused),
        other => panic!("unexpected event: {other:?}"),
    }

    // The inline hard-error completion path must attach before its
    // send_and_detach releases, or this goes negative.
    assert_eq!(scheduler_handle.attached_count(), 0);

    drop(client);
    manager.destroy();
}

#[test]
fn manager_destroy_waits_for_every_socket_to_be_dropped() {
    let scheduler = InlineScheduler::new();
    let allocator = Arc::new(SystemAllocator::new());
    let manager = SocketManager::create(scheduler, allocator, ManagerConfig::default()).unwrap();

    let socket = manager.create_socket(SockKind::Datagram);
    assert_eq!(socket.bind(any_local()), Status::Success);

    let manager_clone = Arc::clone(&manager);
    let handle = std::thread::spawn(move || {
        manager_clone.destroy();
    });

    // destroy() must block until the socket is dropped, not return early.
    std::thread::sleep(Duration::from_millis(200));
    assert!(!handle.is_finished());

    drop(socket);
    handle.join().unwrap();
}
