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
fn datagram_round_trip_delivers_payload_and_source_address() {
    let scheduler = InlineScheduler::new();
    let allocator = Arc::new(SystemAllocator::new());
    let manager = SocketManager::create(scheduler, allocator, ManagerConfig::default()).unwrap();

    let a = manager.create_socket(SockKind::Datagram);
    let b = manager.create_socket(SockKind::Datagram);
    assert_eq!(a.bind(any_local()), Status::Success);
    assert_eq!(b.bind(any_local()), Status::Success);

    let a_addr = a.get_sock_name().unwrap();
    let b_addr = b.get_sock_name().unwrap();

    let target: sockloop::SharedRecvTarget =
        Arc::new(Mutex::new(RecvTarget::Region(vec![0u8; 64].into_boxed_slice())));
    let target_for_assert = Arc::clone(&target);

    let (recv_tx, recv_rx) = mpsc::channel();
    b.recv(target, 0, false, test_task(), Arc::new(move |ev| recv_tx.send(ev).unwrap()));

    let payload: Arc<[u8]> = Arc::from(&b"hello, loopback"[..]);
    let (send_tx, send_rx) = mpsc::channel();
    a.send(
        SendSource::Region(payload),
        Some(b_addr),
        None,
        test_task(),
        Arc::new(move |ev| send_tx.send(ev).unwrap()),
    );

    match send_rx.recv_timeout(Duration::from_secs(2)).expect("send completion") {
        CompletionEvent::SendDone { status, bytes } => {
            assert_eq!(status, Status::Success);
            assert_eq!(bytes, 15);
        }
        other => panic!("unexpected event: {other:?}"),
    }

    match recv_rx.recv_timeout(Duration::from_secs(2)).expect("recv completion") {
        CompletionEvent::RecvDone { status, bytes, from, .. } => {
            assert_eq!(status, Status::Success);
            assert_eq!(bytes, 15);
            assert_eq!(from, Some(a_addr));
        }
        other => panic!("unexpected event: {other:?}"),
    }

    let guard = target_for_assert.lock().unwrap();
    match &*guard {
        RecvTarget::Region(buf) => assert_eq!(&buf[..15], b"hello, loopback"),
        _ => panic!("expected region target"),
    }
    drop(guard);

    drop(a);
    drop(b);
    manager.destroy();
}
