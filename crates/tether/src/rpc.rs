use std::{
    collections::{BTreeMap, HashMap},
    marker::PhantomData,
    ops::Bound,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Instant,
};

use tether_proto::{
    ByteBuffer, Decode, Encode, EncodeArgs, Flags, WireError, WireReader, WireWriter, framing,
};
use tether_utils::fatal;
use tracing::warn;

use crate::{
    command::{Command, CommandQueue},
    host::Host,
    peer::Peer,
    return_cb::ReturnCallback,
};

const DEFAULT_MSG_CAPACITY: u32 = 108;

/// Everything a registered procedure sees about the call being dispatched.
pub struct CallCtx {
    peer: Peer,
    flags: Flags,
    return_id: u32,
    reader: WireReader,
    /// True when dispatch runs inline on the loop thread, letting replies
    /// take the local send path.
    on_loop: bool,
}

impl CallCtx {
    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    pub fn flags(&self) -> Flags {
        self.flags
    }

    /// Zero when the caller asked for no feedback.
    pub fn return_id(&self) -> u32 {
        self.return_id
    }

    pub fn reader_mut(&mut self) -> &mut WireReader {
        &mut self.reader
    }

    fn send_frame(&self, frame: ByteBuffer) {
        if self.on_loop {
            self.peer.send_local(frame);
        } else {
            self.peer.send(frame);
        }
    }
}

/// A handler parameter: either decoded from the frame body or injected from
/// the call context.
pub trait FromCall: Sized {
    fn from_call(ctx: &mut CallCtx) -> Result<Self, WireError>;
}

/// Injects the peer the call arrived on.
pub struct Caller(pub Peer);

/// Injects the packet flags as re-derived on this side.
pub struct CallFlags(pub Flags);

/// Injects the host that owns the receiving peer.
pub struct HostHandle(pub Host);

/// Injects whatever body bytes the preceding parameters left unread.
pub struct Remaining(pub Vec<u8>);

impl FromCall for Caller {
    fn from_call(ctx: &mut CallCtx) -> Result<Self, WireError> {
        Ok(Caller(ctx.peer.clone()))
    }
}

impl FromCall for CallFlags {
    fn from_call(ctx: &mut CallCtx) -> Result<Self, WireError> {
        Ok(CallFlags(ctx.flags))
    }
}

impl FromCall for HostHandle {
    fn from_call(ctx: &mut CallCtx) -> Result<Self, WireError> {
        Ok(HostHandle(ctx.peer.host()))
    }
}

impl FromCall for Remaining {
    fn from_call(ctx: &mut CallCtx) -> Result<Self, WireError> {
        Ok(Remaining(ctx.reader.read_remaining()))
    }
}

macro_rules! impl_from_call_via_decode {
    ($($t:ty)*) => {$(
        impl FromCall for $t {
            fn from_call(ctx: &mut CallCtx) -> Result<Self, WireError> {
                <$t as Decode>::decode(ctx.reader_mut())
            }
        }
    )*};
}

impl_from_call_via_decode!(u8 u16 u32 u64 i8 i16 i32 i64 f32 f64 bool String);

impl<T: Decode> FromCall for Vec<T> {
    fn from_call(ctx: &mut CallCtx) -> Result<Self, WireError> {
        Vec::<T>::decode(ctx.reader_mut())
    }
}

/// A handler's return value. `()` replies with a bare acknowledgement when
/// feedback was requested; encodable values travel back as the return
/// payload.
pub trait Reply {
    fn write(self, w: &mut WireWriter);
}

impl Reply for () {
    fn write(self, _w: &mut WireWriter) {}
}

macro_rules! impl_reply_via_encode {
    ($($t:ty)*) => {$(
        impl Reply for $t {
            fn write(self, w: &mut WireWriter) {
                self.encode(w);
            }
        }
    )*};
}

impl_reply_via_encode!(u8 u16 u32 u64 i8 i16 i32 i64 f32 f64 bool String);

impl<T: Encode> Reply for Vec<T> {
    fn write(self, w: &mut WireWriter) {
        self.encode(w);
    }
}

/// Implemented for closures of up to eight [`FromCall`] parameters; `Args`
/// is the parameter tuple.
pub trait RpcHandler<Args>: Send + Sync + 'static {
    fn invoke(&self, ctx: &mut CallCtx) -> Result<(), WireError>;
}

fn send_reply<R: Reply>(ctx: &CallCtx, ret: R) {
    if ctx.return_id == 0 {
        return;
    }
    let mut w = WireWriter::new(DEFAULT_MSG_CAPACITY);
    w.write_u32(ctx.return_id);
    ret.write(&mut w);
    match w.finish(ctx.flags.with_kind(Flags::RETURN_FEEDBACK)) {
        Ok(frame) => ctx.send_frame(frame),
        Err(err) => fatal!("couldn't frame rpc reply: {err}"),
    }
}

macro_rules! impl_rpc_handler {
    ($($ty:ident),*) => {
        #[allow(non_snake_case)]
        impl<Func, Ret, $($ty,)*> RpcHandler<($($ty,)*)> for Func
        where
            Func: Fn($($ty),*) -> Ret + Send + Sync + 'static,
            Ret: Reply,
            $($ty: FromCall,)*
        {
            fn invoke(&self, ctx: &mut CallCtx) -> Result<(), WireError> {
                $(let $ty = <$ty as FromCall>::from_call(ctx)?;)*
                let ret = (self)($($ty),*);
                send_reply(ctx, ret);
                Ok(())
            }
        }
    };
}

impl_rpc_handler!();
impl_rpc_handler!(A0);
impl_rpc_handler!(A0, A1);
impl_rpc_handler!(A0, A1, A2);
impl_rpc_handler!(A0, A1, A2, A3);
impl_rpc_handler!(A0, A1, A2, A3, A4);
impl_rpc_handler!(A0, A1, A2, A3, A4, A5);
impl_rpc_handler!(A0, A1, A2, A3, A4, A5, A6);
impl_rpc_handler!(A0, A1, A2, A3, A4, A5, A6, A7);

/// Per-call override of the execution queue a converter normally uses.
pub type QueuePicker = fn(&Peer, Flags) -> Option<CommandQueue>;

/// A registered procedure: decodes its arguments, runs, and encodes the
/// reply when one was requested.
trait Converter: Send + Sync {
    fn invoke(&self, ctx: &mut CallCtx);
    fn pick_queue(&self, peer: &Peer, flags: Flags) -> Option<CommandQueue>;
}

struct HandlerConverter<H, Args> {
    handler: H,
    queue: Option<CommandQueue>,
    picker: Option<QueuePicker>,
    _args: PhantomData<fn(Args)>,
}

impl<H, Args> Converter for HandlerConverter<H, Args>
where
    H: RpcHandler<Args>,
    Args: 'static,
{
    fn invoke(&self, ctx: &mut CallCtx) {
        if let Err(err) = self.handler.invoke(ctx) {
            warn!(?err, "couldn't decode rpc arguments, dropping frame");
        }
    }

    fn pick_queue(&self, peer: &Peer, flags: Flags) -> Option<CommandQueue> {
        match self.picker {
            Some(picker) => picker(peer, flags),
            None => self.queue.clone(),
        }
    }
}

#[derive(Default)]
struct ReturnTable {
    entries: BTreeMap<u32, HashMap<usize, ReturnCallback>>,
    last_checked_id: u32,
}

/// Named-procedure RPC over a host's peers.
///
/// Registration and the return table are internally synchronised, so the
/// environment is shared freely across threads; dispatch itself happens
/// wherever the owning loop (or a converter's execution queue) runs it.
/// One environment serves at most one host.
pub struct RpcEnvironment {
    registered: Mutex<HashMap<String, Arc<dyn Converter>>>,
    returning: Mutex<ReturnTable>,
    /// Zero when unbound, else the owning host id + 1.
    bound_host: AtomicUsize,
}

impl Default for RpcEnvironment {
    fn default() -> Self {
        Self::new()
    }
}

impl RpcEnvironment {
    pub fn new() -> Self {
        Self {
            registered: Mutex::new(HashMap::new()),
            returning: Mutex::new(ReturnTable::default()),
            bound_host: AtomicUsize::new(0),
        }
    }

    pub(crate) fn bind_to_host(&self, host_id: usize) {
        let want = host_id + 1;
        match self.bound_host.compare_exchange(0, want, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => {}
            Err(current) if current == want => {}
            Err(_) => fatal!("RpcEnvironment is already bound to a different host"),
        }
    }

    /// Registers `handler` under `name`, dispatching inline on the loop
    /// thread. Registering the same name again replaces the previous
    /// handler.
    pub fn register<Args: 'static, H: RpcHandler<Args>>(
        &self,
        name: impl Into<String>,
        handler: H,
    ) {
        self.register_with(name, handler, None, None);
    }

    /// Registers `handler` to execute on `queue` instead of the loop
    /// thread.
    pub fn register_on<Args: 'static, H: RpcHandler<Args>>(
        &self,
        name: impl Into<String>,
        queue: &CommandQueue,
        handler: H,
    ) {
        self.register_with(name, handler, Some(queue), None);
    }

    /// Full-control registration: a default queue plus an optional per-call
    /// picker that overrides it.
    pub fn register_with<Args: 'static, H: RpcHandler<Args>>(
        &self,
        name: impl Into<String>,
        handler: H,
        queue: Option<&CommandQueue>,
        picker: Option<QueuePicker>,
    ) {
        let converter: Arc<dyn Converter> = Arc::new(HandlerConverter {
            handler,
            queue: queue.cloned(),
            picker,
            _args: PhantomData,
        });
        self.registered
            .lock()
            .expect("rpc registration lock poisoned")
            .insert(name.into(), converter);
    }

    /// Unregisters `name`. Calls already dispatched keep their converter
    /// alive until they finish.
    pub fn remove_registered(&self, name: &str) {
        self.registered.lock().expect("rpc registration lock poisoned").remove(name);
    }

    pub fn registered_count(&self) -> usize {
        self.registered.lock().expect("rpc registration lock poisoned").len()
    }

    /// Fire-and-forget invocation of a remote procedure.
    pub fn send<A: EncodeArgs>(&self, peer: &Peer, flags: Flags, name: &str, args: &A) {
        let mut w = WireWriter::new(DEFAULT_MSG_CAPACITY);
        w.write_str(name);
        args.encode_all(&mut w);
        match w.finish(flags.with_kind(Flags::CALL_NO_FEEDBACK)) {
            Ok(frame) => peer.send(frame),
            Err(err) => fatal!("couldn't frame rpc message `{name}`: {err}"),
        }
    }

    /// Invokes a remote procedure expecting a reply. The callback is parked
    /// under a fresh non-zero return id unique for `(id, peer)` and fires
    /// exactly once: on the return frame, or on deadline expiry.
    pub fn call<A: EncodeArgs>(
        &self,
        peer: &Peer,
        flags: Flags,
        callback: ReturnCallback,
        name: &str,
        args: &A,
    ) {
        let id = self.park(peer, callback);
        let mut w = WireWriter::new(DEFAULT_MSG_CAPACITY);
        w.write_u32(id);
        w.write_str(name);
        args.encode_all(&mut w);
        match w.finish(flags.with_kind(Flags::CALL)) {
            Ok(frame) => peer.send(frame),
            Err(err) => {
                fatal!("couldn't frame rpc call `{name}`: {err}");
                // Don't leave the orphaned entry to the sweeper.
                let _ = self.take_callback(id, peer.key());
            }
        }
    }

    fn park(&self, peer: &Peer, mut callback: ReturnCallback) -> u32 {
        callback.attach_peer(peer.clone());
        let key = peer.key();
        let mut table = self.returning.lock().expect("rpc return table poisoned");
        let id = loop {
            let id = peer.shared.return_id_gen.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if id == 0 {
                continue;
            }
            let slot = table.entries.entry(id).or_default();
            if !slot.contains_key(&key) {
                break id;
            }
        };
        table.entries.get_mut(&id).expect("slot just touched").insert(key, callback);
        id
    }

    fn take_callback(&self, id: u32, key: usize) -> Option<ReturnCallback> {
        let mut table = self.returning.lock().expect("rpc return table poisoned");
        let entry = table.entries.get_mut(&id)?;
        let callback = entry.remove(&key);
        if entry.is_empty() {
            table.entries.remove(&id);
        }
        callback
    }

    /// Entry point for a completed frame. `base_flags` carries the
    /// runtime-side bits (reliability); the wire bits are re-derived from
    /// the header. `on_loop` lets inline replies use the local send path.
    pub fn on_receive(
        &self,
        peer: &Peer,
        frame: ByteBuffer,
        header_size: u32,
        base_flags: Flags,
        on_loop: bool,
    ) {
        let flags = framing::packet_flags(frame.as_slice(), base_flags);
        let reader = WireReader::new(frame, header_size as usize);
        self.dispatch(peer, reader, flags, on_loop);
    }

    pub(crate) fn dispatch(&self, peer: &Peer, reader: WireReader, flags: Flags, on_loop: bool) {
        match flags.kind() {
            k if k == Flags::CALL || k == Flags::CALL_NO_FEEDBACK => {
                self.on_call(peer, reader, flags, on_loop);
            }
            k if k == Flags::RETURN_FEEDBACK => self.on_return(peer, reader, flags),
            _ => warn!("packet with the protocol-control bits reached rpc dispatch"),
        }
    }

    fn on_call(&self, peer: &Peer, mut reader: WireReader, flags: Flags, on_loop: bool) {
        let return_id = if flags.kind() == Flags::CALL {
            match reader.read_u32() {
                Ok(id) => id,
                Err(err) => {
                    warn!(?err, "call frame too short for its return id, dropping");
                    return;
                }
            }
        } else {
            0
        };
        let name = match reader.read_str() {
            Ok(name) => name,
            Err(err) => {
                warn!(?err, "call frame carries no readable name, dropping");
                return;
            }
        };
        let converter = {
            let registered = self.registered.lock().expect("rpc registration lock poisoned");
            registered.get(&name).cloned()
        };
        let Some(converter) = converter else {
            warn!(name, "function not found");
            return;
        };

        match converter.pick_queue(peer, flags) {
            Some(queue) => {
                let peer = peer.clone();
                queue.enqueue(Command::call(move || {
                    let mut ctx = CallCtx { peer, flags, return_id, reader, on_loop: false };
                    converter.invoke(&mut ctx);
                }));
            }
            None => {
                let mut ctx = CallCtx { peer: peer.clone(), flags, return_id, reader, on_loop };
                converter.invoke(&mut ctx);
            }
        }
    }

    fn on_return(&self, peer: &Peer, mut reader: WireReader, flags: Flags) {
        let id = match reader.read_u32() {
            Ok(id) => id,
            Err(err) => {
                warn!(?err, "return frame too short for its id, dropping");
                return;
            }
        };
        match self.take_callback(id, peer.key()) {
            Some(callback) => callback.complete(flags, reader),
            None => {
                warn!(return_id = id, "returned value arrived after its callback expired, dropping");
            }
        }
    }

    /// Advances the deadline sweep over up to `max_checks` return-table
    /// ids, round-robin from where the previous pass stopped. Expired
    /// entries are removed first; their timeout handlers run with no lock
    /// held.
    pub fn check_timeouts(&self, max_checks: u32) {
        let now = Instant::now();
        let mut expired: Vec<ReturnCallback> = Vec::new();
        {
            let mut table = self.returning.lock().expect("rpc return table poisoned");
            if table.entries.is_empty() {
                return;
            }
            let start = table.last_checked_id;
            let mut ids: Vec<u32> = table
                .entries
                .range((Bound::Excluded(start), Bound::Unbounded))
                .map(|(id, _)| *id)
                .take(max_checks as usize)
                .collect();
            if ids.len() < max_checks as usize {
                let missing = max_checks as usize - ids.len();
                ids.extend(table.entries.range(..=start).map(|(id, _)| *id).take(missing));
            }
            for id in ids {
                let Some(entry) = table.entries.get_mut(&id) else { continue };
                let dead: Vec<usize> = entry
                    .iter()
                    .filter(|(_, cb)| cb.is_expired(now))
                    .map(|(key, _)| *key)
                    .collect();
                for key in dead {
                    if let Some(cb) = entry.remove(&key) {
                        expired.push(cb);
                    }
                }
                if entry.is_empty() {
                    table.entries.remove(&id);
                }
                table.last_checked_id = id;
            }
        }
        for callback in expired {
            callback.complete_timeout();
        }
    }

    /// Calls currently awaiting a return frame or the sweeper.
    pub fn pending_calls(&self) -> usize {
        let table = self.returning.lock().expect("rpc return table poisoned");
        table.entries.values().map(HashMap::len).sum()
    }
}
