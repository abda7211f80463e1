use std::{
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use crossbeam_channel::bounded;
use tether::{EventLoop, Flags, IpVersion, RpcEnvironment, WireWriter};

#[test]
fn disconnect_is_idempotent_and_notifies_each_side_once() {
    let server_disconnects = Arc::new(AtomicU32::new(0));
    let mut server_lp = EventLoop::new().unwrap();
    let server_host = server_lp.create_host();
    let server_env = Arc::new(RpcEnvironment::new());
    server_host.set_rpc_environment(server_env);
    let counter = server_disconnects.clone();
    server_host.set_on_disconnect(move |_peer| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let listening = server_host.listen_on_port("127.0.0.1", 24861, IpVersion::V4);
    server_lp.run_async();
    assert_eq!(listening.wait(), Some(true));

    let mut client_lp = EventLoop::new().unwrap();
    let client_host = client_lp.create_host();
    let client_env = Arc::new(RpcEnvironment::new());
    client_host.set_rpc_environment(client_env);
    client_lp.run_async();
    let peer = client_host
        .connect("127.0.0.1", 24861)
        .wait_timeout(Duration::from_secs(5))
        .unwrap()
        .unwrap();

    let (gone_tx, gone_rx) = bounded::<()>(4);
    peer.set_on_disconnect(move |_peer| {
        let _ = gone_tx.send(());
    });

    peer.disconnect();
    peer.disconnect();
    assert!(peer.is_disconnecting());

    gone_rx.recv_timeout(Duration::from_secs(5)).expect("local on_disconnect never fired");
    assert!(
        gone_rx.recv_timeout(Duration::from_millis(200)).is_err(),
        "double disconnect produced a second on_disconnect"
    );
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while !peer.is_closed() {
        assert!(std::time::Instant::now() < deadline, "peer never reached CLOSED");
        std::thread::sleep(Duration::from_millis(1));
    }

    // The remote side notices the close and notifies exactly once too.
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while server_disconnects.load(Ordering::SeqCst) == 0 {
        assert!(std::time::Instant::now() < deadline, "server never saw the close");
        std::thread::sleep(Duration::from_millis(1));
    }
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(server_disconnects.load(Ordering::SeqCst), 1);
    assert_eq!(server_host.peer_count(), 0);

    client_lp.wait_stop_running();
    server_lp.wait_stop_running();
}

#[test]
fn sends_on_a_disconnecting_peer_are_counted_drops() {
    let mut server_lp = EventLoop::new().unwrap();
    let server_host = server_lp.create_host();
    let server_env = Arc::new(RpcEnvironment::new());
    server_host.set_rpc_environment(server_env);
    let listening = server_host.listen_on_port("127.0.0.1", 24862, IpVersion::V4);
    server_lp.run_async();
    assert_eq!(listening.wait(), Some(true));

    let mut client_lp = EventLoop::new().unwrap();
    let client_host = client_lp.create_host();
    let client_env = Arc::new(RpcEnvironment::new());
    client_host.set_rpc_environment(client_env.clone());
    client_lp.run_async();
    let peer = client_host
        .connect("127.0.0.1", 24862)
        .wait_timeout(Duration::from_secs(5))
        .unwrap()
        .unwrap();

    peer.disconnect();
    let mut w = WireWriter::new(16);
    w.write_u32(7);
    let frame = w.finish(Flags::RELIABLE).unwrap();
    peer.send(frame.clone());
    peer.send(frame);
    assert_eq!(peer.dropped_sends(), 2);

    client_lp.wait_stop_running();
    server_lp.wait_stop_running();
}

#[test]
fn connect_failure_resolves_error_without_disconnect_callback() {
    let disconnects = Arc::new(AtomicU32::new(0));
    let mut client_lp = EventLoop::new().unwrap();
    let client_host = client_lp.create_host();
    let client_env = Arc::new(RpcEnvironment::new());
    client_host.set_rpc_environment(client_env);
    let counter = disconnects.clone();
    client_host.set_on_disconnect(move |_peer| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    client_lp.run_async();

    // Nothing listens on this port.
    let result = client_host
        .connect("127.0.0.1", 24863)
        .wait_timeout(Duration::from_secs(5))
        .expect("connect never resolved");
    assert!(result.is_err(), "connecting to a dead port must fail");

    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(
        disconnects.load(Ordering::SeqCst),
        0,
        "on_disconnect must not fire for a connection that never opened"
    );
    assert_eq!(client_host.peer_count(), 0);

    client_lp.wait_stop_running();
}
