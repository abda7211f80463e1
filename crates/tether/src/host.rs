use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use crossbeam_channel::{Receiver, Sender, bounded};
use mio::{Token, net::TcpListener};
use thiserror::Error;
use tracing::warn;

use crate::{
    command::{Command, CommandQueue},
    event_loop::LoopShared,
    peer::{Peer, PeerCallback, PeerIo},
    rpc::RpcEnvironment,
};

/// Address family selector for [`Host::listen_on_port`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IpVersion {
    V4,
    V6,
}

/// Why an outbound connection never became usable.
#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("couldn't parse address `{0}`")]
    BadAddress(String),
    #[error("connect failed: {0}")]
    Io(#[from] std::io::Error),
}

/// One-shot result of an asynchronous host operation, resolved by the loop
/// thread. Dropping it without waiting is fine.
pub struct Completion<T> {
    rx: Receiver<T>,
}

impl<T> Completion<T> {
    pub(crate) fn pair() -> (Sender<T>, Self) {
        let (tx, rx) = bounded(1);
        (tx, Self { rx })
    }

    /// Blocks until the loop resolves the operation. `None` when the loop
    /// shut down first.
    pub fn wait(self) -> Option<T> {
        self.rx.recv().ok()
    }

    pub fn wait_timeout(self, timeout: Duration) -> Option<T> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// Non-blocking probe.
    pub fn try_take(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

pub(crate) type ControlCallback = Arc<dyn Fn(&Peer, &[u8]) + Send + Sync>;
pub(crate) type OnConnected = Box<dyn FnOnce(Result<Peer, ConnectError>) + Send>;

pub(crate) struct HostShared {
    pub(crate) id: usize,
    pub(crate) lp: Arc<LoopShared>,
    /// Registry of live peers by loop token, for iteration off the IO path.
    pub(crate) peers: Mutex<HashMap<usize, Peer>>,
    pub(crate) on_connect: Mutex<Option<PeerCallback>>,
    pub(crate) on_disconnect: Mutex<Option<PeerCallback>>,
    pub(crate) on_control: Mutex<Option<ControlCallback>>,
    pub(crate) rpc: Mutex<Option<Arc<RpcEnvironment>>>,
    pub(crate) socket_buf_size: AtomicUsize,
    user_data: AtomicU64,
}

/// A local endpoint owning any number of peers. May listen and connect at
/// the same time.
///
/// All mutating operations enqueue a command for the owning loop; the loop
/// thread does the real work. Handles are cheap clones.
#[derive(Clone)]
pub struct Host {
    pub(crate) shared: Arc<HostShared>,
}

impl Host {
    pub(crate) fn new(id: usize, lp: Arc<LoopShared>) -> Self {
        Self {
            shared: Arc::new(HostShared {
                id,
                lp,
                peers: Mutex::new(HashMap::new()),
                on_connect: Mutex::new(None),
                on_disconnect: Mutex::new(None),
                on_control: Mutex::new(None),
                rpc: Mutex::new(None),
                socket_buf_size: AtomicUsize::new(0),
                user_data: AtomicU64::new(0),
            }),
        }
    }

    pub(crate) fn from_shared(shared: Arc<HostShared>) -> Self {
        Self { shared }
    }

    pub(crate) fn enqueue_on_loop(
        &self,
        f: impl FnOnce(&mut crate::event_loop::LoopCore) + Send + 'static,
    ) {
        self.shared.lp.enqueue(Command::on_loop(f));
    }

    /// Starts listening on `address:port`. The completion resolves with
    /// whether the bind succeeded; failures are logged with detail.
    pub fn listen_on_port(&self, address: &str, port: u16, ip: IpVersion) -> Completion<bool> {
        let (tx, done) = Completion::pair();
        let host_id = self.shared.id;
        let address = address.to_string();
        self.enqueue_on_loop(move |core| {
            let ok = match parse_addr(&address, port, Some(ip)) {
                Ok(addr) => core.host_listen(host_id, addr),
                Err(err) => {
                    warn!(%err, "listen address rejected");
                    false
                }
            };
            let _ = tx.send(ok);
        });
        done
    }

    /// Opens an outbound connection. The completion resolves with the ready
    /// peer, or the connect error; `on_disconnect` is never invoked for a
    /// connection that never opened.
    pub fn connect(&self, address: &str, port: u16) -> Completion<Result<Peer, ConnectError>> {
        let (tx, done) = Completion::pair();
        self.connect_with(
            address,
            port,
            move |result| {
                let _ = tx.send(result);
            },
            None,
        );
        done
    }

    /// Callback flavour of [`connect`]; `queue` moves the callback onto an
    /// execution queue instead of running it on the loop thread.
    ///
    /// [`connect`]: Host::connect
    pub fn connect_with(
        &self,
        address: &str,
        port: u16,
        on_connected: impl FnOnce(Result<Peer, ConnectError>) + Send + 'static,
        queue: Option<&CommandQueue>,
    ) {
        let host_id = self.shared.id;
        let address = address.to_string();
        let notify: OnConnected = match queue {
            Some(q) => {
                let q = q.clone();
                Box::new(move |result| {
                    q.enqueue_call(move || on_connected(result));
                })
            }
            None => Box::new(on_connected),
        };
        self.enqueue_on_loop(move |core| {
            match parse_addr(&address, port, None) {
                Ok(addr) => core.host_connect(host_id, addr, notify),
                Err(err) => notify(Err(err)),
            };
        });
    }

    /// Closes all listening sockets. Established peers are untouched.
    pub fn stop_listening(&self) {
        let host_id = self.shared.id;
        self.enqueue_on_loop(move |core| core.host_stop_listening(host_id));
    }

    /// Marks every current peer disconnecting (sends start dropping
    /// immediately) and posts their teardown to the loop.
    pub fn disconnect_all(&self) {
        for peer in self.peers_snapshot() {
            peer.disconnect();
        }
    }

    /// Wholesale teardown as a single loop command.
    pub fn disconnect_all_async(&self) {
        let host_id = self.shared.id;
        self.enqueue_on_loop(move |core| core.host_disconnect_all(host_id));
    }

    pub fn set_on_connect(&self, callback: impl Fn(&Peer) + Send + Sync + 'static) {
        *self.shared.on_connect.lock().expect("host callback lock poisoned") =
            Some(Arc::new(callback));
    }

    pub fn set_on_disconnect(&self, callback: impl Fn(&Peer) + Send + Sync + 'static) {
        *self.shared.on_disconnect.lock().expect("host callback lock poisoned") =
            Some(Arc::new(callback));
    }

    /// Handler for protocol-control frames with opcodes >= 0x80, the range
    /// reserved for transport backends. Receives the control body.
    pub fn set_on_control(&self, callback: impl Fn(&Peer, &[u8]) + Send + Sync + 'static) {
        *self.shared.on_control.lock().expect("host callback lock poisoned") =
            Some(Arc::new(callback));
    }

    /// Binds the RPC environment routing this host's frames. An environment
    /// serves at most one host; binding it to a second is a programming
    /// error.
    pub fn set_rpc_environment(&self, env: Arc<RpcEnvironment>) {
        env.bind_to_host(self.shared.id);
        *self.shared.rpc.lock().expect("host rpc lock poisoned") = Some(env);
    }

    pub fn rpc_environment(&self) -> Option<Arc<RpcEnvironment>> {
        self.shared.rpc.lock().expect("host rpc lock poisoned").clone()
    }

    /// Visits a snapshot of the current peer set.
    pub fn for_each_peer(&self, mut f: impl FnMut(&Peer)) {
        for peer in self.peers_snapshot() {
            f(&peer);
        }
    }

    pub fn peer_count(&self) -> usize {
        self.shared.peers.lock().expect("host peers lock poisoned").len()
    }

    /// Kernel SO_SNDBUF/SO_RCVBUF applied to every socket this host opens
    /// or accepts from now on. Zero keeps the OS default.
    pub fn set_socket_buf_size(&self, bytes: usize) {
        self.shared.socket_buf_size.store(bytes, Ordering::Relaxed);
    }

    pub fn user_data(&self) -> u64 {
        self.shared.user_data.load(Ordering::Relaxed)
    }

    pub fn set_user_data(&self, value: u64) {
        self.shared.user_data.store(value, Ordering::Relaxed);
    }

    fn peers_snapshot(&self) -> Vec<Peer> {
        self.shared.peers.lock().expect("host peers lock poisoned").values().cloned().collect()
    }
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("id", &self.shared.id)
            .field("peers", &self.peer_count())
            .finish()
    }
}

fn parse_addr(address: &str, port: u16, want: Option<IpVersion>) -> Result<SocketAddr, ConnectError> {
    let ip: IpAddr =
        address.parse().map_err(|_| ConnectError::BadAddress(address.to_string()))?;
    match (want, ip) {
        (Some(IpVersion::V4), IpAddr::V6(_)) | (Some(IpVersion::V6), IpAddr::V4(_)) => {
            Err(ConnectError::BadAddress(address.to_string()))
        }
        _ => Ok(SocketAddr::new(ip, port)),
    }
}

/// Loop-owned half of a host: its listeners and the IO state of its peers.
pub(crate) struct HostIo {
    pub shared: Arc<HostShared>,
    pub listeners: Vec<(Token, TcpListener)>,
    pub peers: HashMap<Token, PeerIo>,
}

impl HostIo {
    pub fn new(shared: Arc<HostShared>) -> Self {
        Self { shared, listeners: Vec::new(), peers: HashMap::new() }
    }

    pub fn listener_mut(&mut self, token: Token) -> Option<&mut TcpListener> {
        self.listeners.iter_mut().find(|(t, _)| *t == token).map(|(_, l)| l)
    }
}

/// Set kernel SO_SNDBUF and SO_RCVBUF on a mio TcpStream.
pub(crate) fn set_socket_buf_size(stream: &mio::net::TcpStream, size: usize) {
    use std::os::fd::AsRawFd;
    let fd = stream.as_raw_fd();
    let size = size as libc::c_int;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_SNDBUF,
            &size as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_RCVBUF,
            &size as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn address_parsing_checks_family() {
        assert!(parse_addr("127.0.0.1", 80, Some(IpVersion::V4)).is_ok());
        assert!(parse_addr("::1", 80, Some(IpVersion::V6)).is_ok());
        assert!(parse_addr("127.0.0.1", 80, Some(IpVersion::V6)).is_err());
        assert!(parse_addr("::1", 80, Some(IpVersion::V4)).is_err());
        assert!(parse_addr("localhost", 80, None).is_err());
        assert!(parse_addr("10.0.0.1", 80, None).is_ok());
    }
}
