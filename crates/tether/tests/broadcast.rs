use std::{
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use crossbeam_channel::bounded;
use tether::{Caller, EventLoop, Flags, HostHandle, IpVersion, Peer, RpcEnvironment};

/// Relay fan-out: the host forwards an incoming message to every peer
/// except its sender.
#[test]
fn broadcast_reaches_everyone_but_the_sender() {
    let mut server_lp = EventLoop::new().unwrap();
    let server_host = server_lp.create_host();
    let server_env = Arc::new(RpcEnvironment::new());
    let env_weak = Arc::downgrade(&server_env);
    server_env.register(
        "Broadcast",
        move |caller: Caller, host: HostHandle, message: String| {
            let Some(env) = env_weak.upgrade() else { return };
            host.0.for_each_peer(|peer| {
                if *peer != caller.0 {
                    env.send(peer, Flags::RELIABLE, "Broadcasted", &("anon", message.clone()));
                }
            });
        },
    );
    server_host.set_rpc_environment(server_env.clone());
    let listening = server_host.listen_on_port("127.0.0.1", 24851, IpVersion::V4);
    server_lp.run_async();
    assert_eq!(listening.wait(), Some(true));

    let connect = |received: Arc<AtomicU32>,
                   tx: Option<crossbeam_channel::Sender<(String, String)>>|
     -> (EventLoop, Peer) {
        let mut lp = EventLoop::new().unwrap();
        let host = lp.create_host();
        let env = Arc::new(RpcEnvironment::new());
        env.register("Broadcasted", move |from: String, message: String| {
            received.fetch_add(1, Ordering::SeqCst);
            if let Some(tx) = &tx {
                let _ = tx.send((from, message));
            }
        });
        host.set_rpc_environment(env);
        lp.run_async();
        let peer = host
            .connect("127.0.0.1", 24851)
            .wait_timeout(Duration::from_secs(5))
            .unwrap()
            .unwrap();
        (lp, peer)
    };

    let a_received = Arc::new(AtomicU32::new(0));
    let b_received = Arc::new(AtomicU32::new(0));
    let (b_tx, b_rx) = bounded(4);

    let (mut a_lp, a_peer) = connect(a_received.clone(), None);
    let (mut b_lp, _b_peer) = connect(b_received.clone(), Some(b_tx));

    // Wait until the server sees both connections before fanning out.
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while server_host.peer_count() < 2 {
        assert!(std::time::Instant::now() < deadline, "peers never both arrived");
        std::thread::sleep(Duration::from_millis(1));
    }

    // A speaks; only B hears.
    let a_env = a_peer.host().rpc_environment().unwrap();
    a_env.send(&a_peer, Flags::RELIABLE, "Broadcast", &("hi",));

    assert_eq!(
        b_rx.recv_timeout(Duration::from_secs(5)),
        Ok(("anon".to_string(), "hi".to_string()))
    );
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(a_received.load(Ordering::SeqCst), 0, "the sender must not hear itself");
    assert_eq!(b_received.load(Ordering::SeqCst), 1);

    a_lp.wait_stop_running();
    b_lp.wait_stop_running();
    server_lp.wait_stop_running();
}
