mod support;

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sockloop::{
    CompletionEvent, ManagerConfig, RecvTarget, SendSource, SockKind, SocketManager, Status,
    SystemAllocator,
};

use support::{test_task, InlineScheduler};

fn any_local() -> SocketAddr {
    SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 0)
}

#[test]
fn stream_accept_connect_and_data_transfer() {
    let scheduler = InlineScheduler::new();
    let scheduler_handle = Arc::clone(&scheduler);
    let allocator = Arc::new(SystemAllocator::new());
    let manager = SocketManager::create(scheduler, allocator, ManagerConfig::default()).unwrap();

    let listener = manager.create_socket(SockKind::Stream);
    assert_eq!(listener.bind(any_local()), Status::Success);
    assert_eq!(listener.listen(8), Status::Success);
    let listen_addr = listener.get_sock_name().unwrap();

    let (accept_tx, accept_rx) = mpsc::channel();
    listener.accept(test_task(), Arc::new(move |ev| accept_tx.send(ev).unwrap()));

    let client = manager.create_socket(SockKind::Stream);
    let (connect_tx, connect_rx) = mpsc::channel();
    client.connect(listen_addr, test_task(), Arc::new(move |ev| connect_tx.send(ev).unwrap()));

    match connect_rx.recv_timeout(Duration::from_secs(2)).expect("connect completion") {
        CompletionEvent::Connect { status } => assert_eq!(status, Status::Success),
        other => panic!("unexpected event: {other:?}"),
    }

    let server_peer = match accept_rx.recv_timeout(Duration::from_secs(2)).expect("accept completion") {
        CompletionEvent::NewConn { status, socket, .. } => {
            assert_eq!(status, Status::Success);
            socket.expect("accepted socket")
        }
        other => panic!("unexpected event: {other:?}"),
    };

    let target: sockloop::SharedRecvTarget =
        Arc::new(Mutex::new(RecvTarget::Region(vec![0u8; 32].into_boxed_slice())));
    let target_for_assert = Arc::clone(&target);
    let (recv_tx, recv_rx) = mpsc::channel();
    server_peer.recv(target, 4, false, test_task(), Arc::new(move |ev| recv_tx.send(ev).unwrap()));

    let payload: Arc<[u8]> = Arc::from(&b"ping"[..]);
    let (send_tx, send_rx) = mpsc::channel();
    client.send(
        SendSource::Region(payload),
        None,
        None,
        test_task(),
        Arc::new(move |ev| send_tx.send(ev).unwrap()),
    );

    match send_rx.recv_timeout(Duration::from_secs(2)).expect("send completion") {
        CompletionEvent::SendDone { status, bytes } => {
            assert_eq!(status, Status::Success);
            assert_eq!(bytes, 4);
        }
        other => panic!("unexpected event: {other:?}"),
    }

    match recv_rx.recv_timeout(Duration::from_secs(2)).expect("recv completion") {
        CompletionEvent::RecvDone { status, bytes, .. } => {
            assert_eq!(status, Status::Success);
            assert_eq!(bytes, 4);
        }
        other => panic!("unexpected event: {other:?}"),
    }
    match &*target_for_assert.lock().unwrap() {
        RecvTarget::Region(buf) => assert_eq!(&buf[..4], b"ping"),
        _ => panic!("expected region target"),
    }

    // Every attach above (connect, accept, send, recv) must have been
    // matched by send_and_detach's release by the time all completions
    // have been delivered.
    assert_eq!(scheduler_handle.attached_count(), 0);

    drop(client);
    drop(server_peer);
    drop(listener);
    manager.destroy();
}

#[test]
fn stream_peer_shutdown_delivers_eof_to_queued_and_future_recv() {
    let scheduler = InlineScheduler::new();
    let allocator = Arc::new(SystemAllocator::new());
    let manager = SocketManager::create(scheduler, allocator, ManagerConfig::default()).unwrap();

    let listener = manager.create_socket(SockKind::Stream);
    assert_eq!(listener.bind(any_local()), Status::Success);
    assert_eq!(listener.listen(8), Status::Success);
    let listen_addr = listener.get_sock_name().unwrap();

    let (accept_tx, accept_rx) = mpsc::channel();
    listener.accept(test_task(), Arc::new(move |ev| accept_tx.send(ev).unwrap()));

    let client = manager.create_socket(SockKind::Stream);
    let (connect_tx, connect_rx) = mpsc::channel();
    client.connect(listen_addr, test_task(), Arc::new(move |ev| connect_tx.send(ev).unwrap()));
    connect_rx.recv_timeout(Duration::from_secs(2)).unwrap();

    let server_peer = match accept_rx.recv_timeout(Duration::from_secs(2)).unwrap() {
        CompletionEvent::NewConn { socket, .. } => socket.unwrap(),
        other => panic!("unexpected event: {other:?}"),
    };

    // Client goes away before the server ever reads.
    drop(client);

    let target: sockloop::SharedRecvTarget =
        Arc::new(Mutex::new(RecvTarget::Region(vec![0u8; 16].into_boxed_slice())));
    let (recv_tx, recv_rx) = mpsc::channel();
    server_peer.recv(target, 1, false, test_task(), Arc::new(move |ev| recv_tx.send(ev).unwrap()));

    match recv_rx.recv_timeout(Duration::from_secs(2)).expect("eof completion") {
        CompletionEvent::RecvDone { status, bytes, .. } => {
            assert_eq!(status, Status::Eof);
            assert_eq!(bytes, 0);
        }
        other => panic!("unexpected event: {other:?}"),
    }

    // The sticky recv_result replays Eof to a second recv without another
    // syscall attempt.
    let target2: sockloop::SharedRecvTarget =
        Arc::new(Mutex::new(RecvTarget::Region(vec![0u8; 16].into_boxed_slice())));
    let (recv_tx2, recv_rx2) = mpsc::channel();
    server_peer.recv(target2, 1, false, test_task(), Arc::new(move |ev| recv_tx2.send(ev).unwrap()));
    match recv_rx2.recv_timeout(Duration::from_secs(2)).expect("sticky eof completion") {
        CompletionEvent::RecvDone { status, .. } => assert_eq!(status, Status::Eof),
        other => panic!("unexpected event: {other:?}"),
    }

    drop(server_peer);
    drop(listener);
    manager.destroy();
}
