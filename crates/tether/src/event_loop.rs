use std::{
    collections::HashMap,
    io,
    sync::{
        Arc,
        atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering},
    },
    thread::JoinHandle,
    time::Duration,
};

use mio::{Events, Interest, Poll, Registry, Token, Waker, event::Event};
use tether_proto::{ByteBuffer, Flags, framing};
use tether_utils::{fatal, spawn_named};
use tracing::{debug, error, info, warn};

use crate::{
    command::{Command, CommandQueue},
    host::{ConnectError, Host, HostIo, OnConnected, set_socket_buf_size},
    peer::{
        BIT_CLOSED, BIT_CONNECT_ERROR, BIT_DISCONNECTING, NO_TOKEN, Peer, PeerIo, PumpOutcome,
    },
    rpc::RpcEnvironment,
};

const WAKER_TOKEN: Token = Token(usize::MAX);

/// Commands drained per loop iteration.
const COMMANDS_PER_ITERATION: usize = 1024;
/// Return-table entries inspected per housekeeping pass.
const RPC_SWEEP_PER_PASS: u32 = 16;
/// Default poll timeout between iterations.
const DEFAULT_SLEEP_MICROS: u64 = 1000;

const RUNNING: u32 = 1;
const QUEUE_STOP: u32 = 2;

#[derive(Default)]
struct LoopStatCounters {
    iterations: AtomicU64,
    commands: AtomicU64,
}

/// Snapshot of loop activity counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoopStats {
    pub iterations: u64,
    pub commands_executed: u64,
}

/// The thread-safe face of a loop, shared by hosts, peers and handles.
pub(crate) struct LoopShared {
    pub(crate) queue: CommandQueue,
    waker: Waker,
    flags: AtomicU32,
    sleep_micros: AtomicU64,
    next_host_id: AtomicUsize,
    stats: LoopStatCounters,
}

impl LoopShared {
    pub(crate) fn enqueue(&self, command: Command) {
        self.queue.enqueue(command);
        self.wake();
    }

    pub(crate) fn wake(&self) {
        if let Err(err) = self.waker.wake() {
            warn!(?err, "couldn't wake event loop");
        }
    }
}

#[derive(Clone, Copy)]
pub(crate) enum Route {
    Listener { host: usize },
    Stream { host: usize },
}

/// Everything the loop thread owns: host IO states, the token routing table
/// and the poll registry. Loop commands receive `&mut LoopCore`.
pub struct LoopCore {
    pub(crate) shared: Arc<LoopShared>,
    pub(crate) registry: Registry,
    pub(crate) hosts: Vec<Option<HostIo>>,
    pub(crate) routes: HashMap<Token, Route>,
    next_token: usize,
}

struct LoopDriver {
    poll: Poll,
    events: Events,
    core: LoopCore,
}

/// Single-threaded cooperative driver.
///
/// Each iteration drains queued commands, gives every owned host one
/// housekeeping pass (peer send flushing, RPC timeout sweeping) and then
/// blocks in the OS poller until an event or the iteration timer fires.
/// `wake_up` unblocks the poll from any thread.
///
/// All host and peer mutation happens on the loop thread; the public
/// surface hands work over through the command queue.
pub struct EventLoop {
    shared: Arc<LoopShared>,
    driver: Option<LoopDriver>,
    join: Option<JoinHandle<()>>,
}

impl EventLoop {
    pub fn new() -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        let registry = poll.registry().try_clone()?;
        let shared = Arc::new(LoopShared {
            queue: CommandQueue::new(),
            waker,
            flags: AtomicU32::new(0),
            sleep_micros: AtomicU64::new(DEFAULT_SLEEP_MICROS),
            next_host_id: AtomicUsize::new(0),
            stats: LoopStatCounters::default(),
        });
        let core = LoopCore {
            shared: shared.clone(),
            registry,
            hosts: Vec::new(),
            routes: HashMap::new(),
            next_token: 0,
        };
        Ok(Self {
            shared,
            driver: Some(LoopDriver { poll, events: Events::with_capacity(1024), core }),
            join: None,
        })
    }

    /// Creates a host owned by this loop. Works before or after the loop
    /// starts; the installation rides the command queue either way.
    pub fn create_host(&self) -> Host {
        let id = self.shared.next_host_id.fetch_add(1, Ordering::Relaxed);
        let host = Host::new(id, self.shared.clone());
        let shared = host.shared.clone();
        self.shared.enqueue(Command::on_loop(move |core| core.install_host(shared)));
        host
    }

    /// Spawns the driver thread.
    pub fn run_async(&mut self) {
        let Some(driver) = self.driver.take() else {
            fatal!("event loop is already running");
            return;
        };
        self.join = Some(spawn_named("tether-loop", move || drive(driver)));
    }

    /// Drives the loop on the current thread until stop is requested.
    pub fn run(&mut self) {
        let Some(driver) = self.driver.take() else {
            fatal!("event loop is already running");
            return;
        };
        drive(driver);
    }

    pub fn enqueue(&self, command: Command) {
        self.shared.enqueue(command);
    }

    pub fn enqueue_call(&self, f: impl FnOnce() + Send + 'static) {
        self.shared.enqueue(Command::call(f));
    }

    /// Parks a continuation on the loop's queue, pinning `holder` until it
    /// runs there.
    pub fn schedule(
        &self,
        holder: Option<Arc<dyn std::any::Any + Send + Sync>>,
        resume: impl FnOnce() + Send + 'static,
    ) {
        self.shared.queue.schedule(holder, resume);
        self.shared.wake();
    }

    /// Unblocks the poll phase from any thread.
    pub fn wake_up(&self) {
        self.shared.wake();
    }

    pub fn queue_stop_running(&self) {
        self.shared.flags.fetch_or(QUEUE_STOP, Ordering::AcqRel);
        self.shared.wake();
    }

    /// Requests a stop and joins the driver thread. The loop drains its
    /// command queue on the way out, so pending disconnects and their
    /// callbacks still fire.
    pub fn wait_stop_running(&mut self) {
        self.queue_stop_running();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.flags.load(Ordering::Acquire) & RUNNING != 0
    }

    pub fn is_queued_stop(&self) -> bool {
        self.shared.flags.load(Ordering::Acquire) & QUEUE_STOP != 0
    }

    /// Poll timeout used when the loop has nothing to do.
    pub fn set_sleep_between_iterations(&self, sleep: Duration) {
        self.shared.sleep_micros.store(sleep.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn stats(&self) -> LoopStats {
        LoopStats {
            iterations: self.shared.stats.iterations.load(Ordering::Relaxed),
            commands_executed: self.shared.stats.commands.load(Ordering::Relaxed),
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.wait_stop_running();
    }
}

fn drive(mut d: LoopDriver) {
    let shared = d.core.shared.clone();
    shared.flags.fetch_or(RUNNING, Ordering::AcqRel);

    while shared.flags.load(Ordering::Acquire) & QUEUE_STOP == 0 {
        shared.stats.iterations.fetch_add(1, Ordering::Relaxed);
        let n = shared.queue.execute_on_loop(&mut d.core, COMMANDS_PER_ITERATION);
        shared.stats.commands.fetch_add(n as u64, Ordering::Relaxed);

        d.core.housekeeping();

        let timeout = Duration::from_micros(shared.sleep_micros.load(Ordering::Relaxed));
        if let Err(err) = d.poll.poll(&mut d.events, Some(timeout)) {
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            fatal!("event loop poll failed: {err}");
            break;
        }

        let LoopDriver { events, core, .. } = &mut d;
        for ev in events.iter() {
            if ev.token() == WAKER_TOKEN {
                continue;
            }
            core.handle_event(ev);
        }
    }

    // Drain the queue before exiting so outstanding disconnects and close
    // callbacks still run.
    loop {
        let n = shared.queue.execute_on_loop(&mut d.core, COMMANDS_PER_ITERATION);
        shared.stats.commands.fetch_add(n as u64, Ordering::Relaxed);
        if n == 0 && !shared.queue.has_any() {
            break;
        }
    }

    shared.flags.fetch_and(!RUNNING, Ordering::AcqRel);
}

/// Applies a flush outcome to the peer's WRITABLE registration. Returns
/// true when the peer must be closed.
fn apply_arming(registry: &Registry, io: &mut PeerIo, token: Token, outcome: PumpOutcome) -> bool {
    let want_writable = match outcome {
        PumpOutcome::Closed => return true,
        PumpOutcome::Pending => true,
        PumpOutcome::Drained => false,
    };
    if want_writable == io.writable_armed {
        return false;
    }
    let interest = if want_writable {
        Interest::READABLE | Interest::WRITABLE
    } else {
        Interest::READABLE
    };
    if let Err(err) = registry.reregister(&mut io.stream, token, interest) {
        debug!(?err, "peer reregister");
        return true;
    }
    io.writable_armed = want_writable;
    false
}

/// Routes a completed frame: protocol-control frames are handled beside the
/// peer, everything else goes to the host's RPC environment.
fn dispatch_frame(peer: &Peer, frame: ByteBuffer, header_size: u32) {
    peer.count_received_frame();
    if frame.size() <= header_size as usize {
        // Unreachable by construction; the framing cannot express it.
        error!("protocol does not allow zero-sized packets");
        return;
    }
    let flags = framing::packet_flags(frame.as_slice(), Flags::RELIABLE);
    if flags.kind() == Flags::PROTOCOL_CONTROL {
        handle_control_frame(peer, &frame, header_size);
        return;
    }
    match peer.host().rpc_environment() {
        Some(env) => env.on_receive(peer, frame, header_size, Flags::RELIABLE, true),
        None => warn!("frame received but no rpc environment is bound to the host"),
    }
}

fn handle_control_frame(peer: &Peer, frame: &ByteBuffer, header_size: u32) {
    let body = &frame.as_slice()[header_size as usize..];
    let opcode = body[0];
    if opcode <= 0x7F {
        warn!(opcode, "received packet with undefined control sequence");
        return;
    }
    let backend = peer
        .host()
        .shared
        .on_control
        .lock()
        .expect("host callback lock poisoned")
        .clone();
    match backend {
        Some(backend) => backend(peer, body),
        None => warn!(opcode, "control sequence unhandled by backend"),
    }
}

impl LoopCore {
    fn alloc_token(&mut self) -> Token {
        let t = Token(self.next_token);
        self.next_token += 1;
        t
    }

    fn host_io(&mut self, host_idx: usize) -> Option<&mut HostIo> {
        self.hosts.get_mut(host_idx).and_then(Option::as_mut)
    }

    pub(crate) fn install_host(&mut self, shared: Arc<crate::host::HostShared>) {
        let id = shared.id;
        if self.hosts.len() <= id {
            self.hosts.resize_with(id + 1, || None);
        }
        self.hosts[id] = Some(HostIo::new(shared));
    }

    /// One pass per iteration: flush peers with queued or buffered sends,
    /// then advance each host's RPC timeout sweep.
    pub(crate) fn housekeeping(&mut self) {
        let mut to_close: Vec<(usize, Token)> = Vec::new();
        let mut envs: Vec<Arc<RpcEnvironment>> = Vec::new();
        {
            let registry = &self.registry;
            for (idx, slot) in self.hosts.iter_mut().enumerate() {
                let Some(host) = slot.as_mut() else { continue };
                for (token, io) in &mut host.peers {
                    if io.is_connecting || !io.has_pending() {
                        continue;
                    }
                    let outcome = io.flush();
                    if apply_arming(registry, io, *token, outcome) {
                        to_close.push((idx, *token));
                    }
                }
                if let Some(env) = host.shared.rpc.lock().expect("host rpc lock poisoned").clone()
                {
                    envs.push(env);
                }
            }
        }
        for (idx, token) in to_close {
            self.close_peer(idx, token);
        }
        // Timeout handlers run here, outside any loop state borrow.
        for env in envs {
            env.check_timeouts(RPC_SWEEP_PER_PASS);
        }
    }

    pub(crate) fn handle_event(&mut self, ev: &Event) {
        let token = ev.token();
        let Some(route) = self.routes.get(&token).copied() else {
            debug!(?token, "event for unknown token");
            return;
        };
        match route {
            Route::Listener { host } => self.accept_loop(host, token),
            Route::Stream { host } => {
                let connecting = self
                    .hosts
                    .get(host)
                    .and_then(Option::as_ref)
                    .and_then(|h| h.peers.get(&token))
                    .is_some_and(|io| io.is_connecting);
                if connecting {
                    self.finish_connect(host, token);
                    let still_connecting = self
                        .hosts
                        .get(host)
                        .and_then(Option::as_ref)
                        .and_then(|h| h.peers.get(&token))
                        .is_none_or(|io| io.is_connecting);
                    // Data that raced the handshake is in this same event;
                    // edge-triggered polling won't announce it again.
                    if still_connecting {
                        return;
                    }
                }
                if ev.is_readable() || ev.is_read_closed() {
                    self.peer_readable(host, token);
                }
                if ev.is_writable() {
                    self.peer_writable(host, token);
                }
            }
        }
    }

    fn accept_loop(&mut self, host_idx: usize, listener_token: Token) {
        loop {
            let accepted = {
                let Some(host) = self.host_io(host_idx) else { return };
                let Some(listener) = host.listener_mut(listener_token) else { return };
                match listener.accept() {
                    Ok(pair) => pair,
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                    Err(err) => {
                        warn!(?err, "accept failed");
                        return;
                    }
                }
            };
            self.install_accepted(host_idx, accepted.0, accepted.1);
        }
    }

    fn install_accepted(
        &mut self,
        host_idx: usize,
        mut stream: mio::net::TcpStream,
        addr: std::net::SocketAddr,
    ) {
        let Some(shared) = self.host_io(host_idx).map(|h| h.shared.clone()) else { return };
        info!(?addr, "client connected");
        let _ = stream.set_nodelay(true);
        let buf_size = shared.socket_buf_size.load(Ordering::Relaxed);
        if buf_size > 0 {
            set_socket_buf_size(&stream, buf_size);
        }

        let token = self.alloc_token();
        if let Err(err) = self.registry.register(&mut stream, token, Interest::READABLE) {
            error!(?err, "couldn't register accepted client");
            let _ = stream.shutdown(std::net::Shutdown::Both);
            return;
        }

        let peer = Peer::new(Host::from_shared(shared.clone()), false, addr);
        peer.shared.token.store(token.0, Ordering::Release);
        if let Some(host) = self.host_io(host_idx) {
            host.peers.insert(token, PeerIo::new(stream, peer.clone()));
        }
        self.routes.insert(token, Route::Stream { host: host_idx });
        shared.peers.lock().expect("host peers lock poisoned").insert(token.0, peer.clone());

        let on_connect = shared.on_connect.lock().expect("host callback lock poisoned").clone();
        if let Some(cb) = on_connect {
            cb(&peer);
        }
        peer.set_ready();
    }

    fn peer_readable(&mut self, host_idx: usize, token: Token) {
        let mut frames: Vec<(ByteBuffer, u32)> = Vec::new();
        let (closed, peer) = {
            let Some(host) = self.host_io(host_idx) else { return };
            let Some(io) = host.peers.get_mut(&token) else { return };
            (io.read_into(&mut frames), io.peer.clone())
        };

        for (frame, header_size) in frames {
            dispatch_frame(&peer, frame, header_size);
        }

        if closed {
            self.close_peer(host_idx, token);
        } else if peer.has_pending_sends() {
            // Replies produced by inline dispatch leave right away instead
            // of waiting for the next housekeeping pass.
            self.peer_writable(host_idx, token);
        }
    }

    fn peer_writable(&mut self, host_idx: usize, token: Token) {
        let close = {
            let registry = &self.registry;
            let Some(host) = self.hosts.get_mut(host_idx).and_then(Option::as_mut) else {
                return;
            };
            let Some(io) = host.peers.get_mut(&token) else { return };
            if io.is_connecting {
                return;
            }
            let outcome = io.flush();
            apply_arming(registry, io, token, outcome)
        };
        if close {
            self.close_peer(host_idx, token);
        }
    }

    fn finish_connect(&mut self, host_idx: usize, token: Token) {
        enum Probe {
            Pending,
            Open,
            Fail(io::Error),
        }

        let probe = {
            let Some(host) = self.host_io(host_idx) else { return };
            let Some(io) = host.peers.get_mut(&token) else { return };
            match io.stream.take_error() {
                Ok(Some(err)) => Probe::Fail(err),
                Ok(None) => match io.stream.peer_addr() {
                    Ok(_) => Probe::Open,
                    Err(ref e)
                        if e.kind() == io::ErrorKind::NotConnected
                            || e.raw_os_error() == Some(libc::EINPROGRESS) =>
                    {
                        Probe::Pending
                    }
                    Err(err) => Probe::Fail(err),
                },
                Err(err) => Probe::Fail(err),
            }
        };

        match probe {
            Probe::Pending => {}
            Probe::Open => {
                let (peer, notify) = {
                    let registry = &self.registry;
                    let Some(host) = self.hosts.get_mut(host_idx).and_then(Option::as_mut)
                    else {
                        return;
                    };
                    let Some(io) = host.peers.get_mut(&token) else { return };
                    io.is_connecting = false;
                    if let Err(err) = registry.reregister(&mut io.stream, token, Interest::READABLE)
                    {
                        debug!(?err, "connected peer reregister");
                    }
                    (io.peer.clone(), io.connecting.take())
                };
                let shared = peer.host().shared;
                shared
                    .peers
                    .lock()
                    .expect("host peers lock poisoned")
                    .insert(token.0, peer.clone());
                debug!(addr = ?peer.remote_addr(), "connected");

                let on_connect =
                    shared.on_connect.lock().expect("host callback lock poisoned").clone();
                if let Some(cb) = on_connect {
                    cb(&peer);
                }
                peer.set_ready();
                if let Some(notify) = notify {
                    notify(Ok(peer));
                }
            }
            Probe::Fail(err) => {
                let Some(host) = self.host_io(host_idx) else { return };
                let Some(mut io) = host.peers.remove(&token) else { return };
                self.routes.remove(&token);
                let _ = self.registry.deregister(&mut io.stream);
                let _ = io.stream.shutdown(std::net::Shutdown::Both);

                let peer = io.peer.clone();
                peer.mark(BIT_CONNECT_ERROR | BIT_DISCONNECTING | BIT_CLOSED);
                peer.shared.token.store(NO_TOKEN, Ordering::Release);
                warn!(addr = ?peer.remote_addr(), ?err, "connect failed");
                // No on_disconnect here: on_connect never fired for it.
                if let Some(notify) = io.connecting.take() {
                    notify(Err(ConnectError::Io(err)));
                }
            }
        }
    }

    /// Tears one peer down: closes the socket, fires `on_disconnect` (the
    /// peer-specific one, else the host-wide one) and forgets the peer.
    /// Safe to call repeatedly; only the first call does anything.
    pub(crate) fn close_peer(&mut self, host_idx: usize, token: Token) {
        let (mut io, host_shared) = {
            let Some(host) = self.host_io(host_idx) else { return };
            let Some(io) = host.peers.remove(&token) else { return };
            (io, host.shared.clone())
        };
        self.routes.remove(&token);
        let _ = self.registry.deregister(&mut io.stream);
        let _ = io.stream.shutdown(std::net::Shutdown::Both);
        host_shared.peers.lock().expect("host peers lock poisoned").remove(&token.0);

        let peer = io.peer.clone();
        peer.mark(BIT_DISCONNECTING);
        if peer.is_ready_to_use() {
            let cb = peer
                .shared
                .on_disconnect
                .lock()
                .expect("peer callback lock poisoned")
                .clone()
                .or_else(|| {
                    host_shared
                        .on_disconnect
                        .lock()
                        .expect("host callback lock poisoned")
                        .clone()
                });
            if let Some(cb) = cb {
                cb(&peer);
            }
        }
        peer.mark(BIT_CLOSED);
        peer.shared.token.store(NO_TOKEN, Ordering::Release);
    }

    pub(crate) fn disconnect_peer(&mut self, peer: &Peer) {
        let token = peer.shared.token.load(Ordering::Acquire);
        if token == NO_TOKEN {
            return;
        }
        let host_idx = peer.shared.host.shared.id;
        self.close_peer(host_idx, Token(token));
    }

    pub(crate) fn host_listen(&mut self, host_idx: usize, addr: std::net::SocketAddr) -> bool {
        let mut listener = match mio::net::TcpListener::bind(addr) {
            Ok(l) => l,
            Err(err) => {
                warn!(?addr, ?err, "couldn't start listening");
                return false;
            }
        };
        let token = self.alloc_token();
        if let Err(err) = self.registry.register(&mut listener, token, Interest::READABLE) {
            warn!(?addr, ?err, "couldn't register listener");
            return false;
        }
        let Some(host) = self.host_io(host_idx) else { return false };
        host.listeners.push((token, listener));
        self.routes.insert(token, Route::Listener { host: host_idx });
        info!(?addr, "listening");
        true
    }

    pub(crate) fn host_connect(
        &mut self,
        host_idx: usize,
        addr: std::net::SocketAddr,
        notify: OnConnected,
    ) {
        let Some(shared) = self.host_io(host_idx).map(|h| h.shared.clone()) else {
            notify(Err(ConnectError::Io(io::Error::other("host is gone"))));
            return;
        };
        let mut stream = match mio::net::TcpStream::connect(addr) {
            Ok(s) => s,
            Err(err) => {
                warn!(?addr, ?err, "connect failed to start");
                notify(Err(err.into()));
                return;
            }
        };
        let _ = stream.set_nodelay(true);
        let buf_size = shared.socket_buf_size.load(Ordering::Relaxed);
        if buf_size > 0 {
            set_socket_buf_size(&stream, buf_size);
        }

        let token = self.alloc_token();
        if let Err(err) =
            self.registry.register(&mut stream, token, Interest::READABLE | Interest::WRITABLE)
        {
            error!(?addr, ?err, "couldn't register outbound stream");
            notify(Err(err.into()));
            return;
        }

        let peer = Peer::new(Host::from_shared(shared), true, addr);
        peer.shared.token.store(token.0, Ordering::Release);
        if let Some(host) = self.host_io(host_idx) {
            host.peers.insert(token, PeerIo::new_connecting(stream, peer, notify));
        }
        self.routes.insert(token, Route::Stream { host: host_idx });
    }

    pub(crate) fn host_stop_listening(&mut self, host_idx: usize) {
        let listeners = {
            let Some(host) = self.host_io(host_idx) else { return };
            std::mem::take(&mut host.listeners)
        };
        for (token, mut listener) in listeners {
            let _ = self.registry.deregister(&mut listener);
            self.routes.remove(&token);
        }
    }

    pub(crate) fn host_disconnect_all(&mut self, host_idx: usize) {
        let tokens: Vec<Token> = match self.host_io(host_idx) {
            Some(host) => host.peers.keys().copied().collect(),
            None => return,
        };
        for token in tokens {
            self.close_peer(host_idx, token);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn queued_commands_execute_and_stop_joins() {
        let mut lp = EventLoop::new().unwrap();
        lp.run_async();
        let (tx, rx) = std::sync::mpsc::channel();
        lp.enqueue_call(move || {
            let _ = tx.send(42);
        });
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok(42));
        assert!(lp.is_running());
        lp.wait_stop_running();
        assert!(!lp.is_running());
        assert!(lp.stats().iterations >= 1);
        assert!(lp.stats().commands_executed >= 1);
    }

    #[test]
    fn shutdown_drains_pending_commands() {
        let mut lp = EventLoop::new().unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        lp.enqueue_call(move || {
            ran2.fetch_add(1, Ordering::SeqCst);
        });
        lp.queue_stop_running();
        // Commands posted before the stop still run on the way out.
        lp.run();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn scheduled_continuation_releases_its_holder() {
        let mut lp = EventLoop::new().unwrap();
        lp.run_async();
        let holder: Arc<dyn std::any::Any + Send + Sync> = Arc::new("pinned");
        let weak = Arc::downgrade(&holder);
        let (tx, rx) = std::sync::mpsc::channel();
        lp.schedule(Some(holder), move || {
            let _ = tx.send(());
        });
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok(()));
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while weak.upgrade().is_some() {
            assert!(std::time::Instant::now() < deadline, "holder never released");
            std::thread::sleep(Duration::from_millis(1));
        }
        lp.wait_stop_running();
    }
}
