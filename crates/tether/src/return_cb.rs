use std::{
    any::Any,
    marker::PhantomData,
    sync::Arc,
    time::{Duration, Instant},
};

use tether_proto::{Decode, Flags, WireReader};
use tracing::warn;

use crate::{
    command::{Command, CommandQueue},
    peer::Peer,
};

/// Type-erased pair of completion handlers. Exactly one of the two runs.
pub(crate) trait ReturnThunk: Send {
    fn on_return(self: Box<Self>, peer: Peer, flags: Flags, reader: WireReader);
    fn on_timeout(self: Box<Self>, peer: Peer);
}

struct TypedThunk<T, F, G> {
    on_return: F,
    on_timeout: G,
    _value: PhantomData<fn() -> T>,
}

impl<T, F, G> ReturnThunk for TypedThunk<T, F, G>
where
    T: Decode + Send + 'static,
    F: FnOnce(&Peer, Flags, T) + Send + 'static,
    G: FnOnce(&Peer) + Send + 'static,
{
    fn on_return(self: Box<Self>, peer: Peer, flags: Flags, mut reader: WireReader) {
        match T::decode(&mut reader) {
            Ok(value) => (self.on_return)(&peer, flags, value),
            Err(err) => warn!(?err, "couldn't decode returned value, dropping frame"),
        }
    }

    fn on_timeout(self: Box<Self>, peer: Peer) {
        (self.on_timeout)(&peer);
    }
}

struct VoidThunk<F, G> {
    on_return: F,
    on_timeout: G,
}

impl<F, G> ReturnThunk for VoidThunk<F, G>
where
    F: FnOnce(&Peer, Flags) + Send + 'static,
    G: FnOnce(&Peer) + Send + 'static,
{
    fn on_return(self: Box<Self>, peer: Peer, flags: Flags, _reader: WireReader) {
        (self.on_return)(&peer, flags);
    }

    fn on_timeout(self: Box<Self>, peer: Peer) {
        (self.on_timeout)(&peer);
    }
}

/// Pending completion of one remote call.
///
/// Parked in the environment's return table under `(return_id, peer)` until
/// the matching return frame lands or the deadline sweeper retires it.
/// Holds a strong reference to the calling peer (and optionally a user
/// object) until one of the handlers has run.
pub struct ReturnCallback {
    pub(crate) deadline: Instant,
    queue: Option<CommandQueue>,
    holder: Option<Arc<dyn Any + Send + Sync>>,
    pub(crate) peer: Option<Peer>,
    thunk: Box<dyn ReturnThunk>,
}

impl ReturnCallback {
    /// Success handler receiving the decoded value of type `T`.
    pub fn new<T, F, G>(on_return: F, on_timeout: G, timeout: Duration) -> Self
    where
        T: Decode + Send + 'static,
        F: FnOnce(&Peer, Flags, T) + Send + 'static,
        G: FnOnce(&Peer) + Send + 'static,
    {
        Self {
            deadline: Instant::now() + timeout,
            queue: None,
            holder: None,
            peer: None,
            thunk: Box::new(TypedThunk { on_return, on_timeout, _value: PhantomData }),
        }
    }

    /// For calls whose remote procedure returns nothing; the return frame is
    /// a bare acknowledgement.
    pub fn new_void<F, G>(on_return: F, on_timeout: G, timeout: Duration) -> Self
    where
        F: FnOnce(&Peer, Flags) + Send + 'static,
        G: FnOnce(&Peer) + Send + 'static,
    {
        Self {
            deadline: Instant::now() + timeout,
            queue: None,
            holder: None,
            peer: None,
            thunk: Box::new(VoidThunk { on_return, on_timeout }),
        }
    }

    /// Runs whichever handler fires on `queue` instead of the loop thread.
    pub fn on_queue(mut self, queue: &CommandQueue) -> Self {
        self.queue = Some(queue.clone());
        self
    }

    /// Pins an extra object until completion or timeout.
    pub fn keeping(mut self, holder: Arc<dyn Any + Send + Sync>) -> Self {
        self.holder = Some(holder);
        self
    }

    pub(crate) fn attach_peer(&mut self, peer: Peer) {
        self.peer = Some(peer);
    }

    #[inline]
    pub(crate) fn is_expired(&self, now: Instant) -> bool {
        self.deadline <= now
    }

    /// The matching return frame arrived; decode and run the success
    /// handler, inline or on the configured queue.
    pub(crate) fn complete(self, flags: Flags, reader: WireReader) {
        let Some(peer) = self.peer else { return };
        let thunk = self.thunk;
        let holder = self.holder;
        match self.queue {
            Some(queue) => queue.enqueue(Command::call(move || {
                thunk.on_return(peer, flags, reader);
                drop(holder);
            })),
            None => {
                thunk.on_return(peer, flags, reader);
                drop(holder);
            }
        }
    }

    /// The deadline sweeper retired this entry; run only the timeout
    /// handler.
    pub(crate) fn complete_timeout(self) {
        let Some(peer) = self.peer else { return };
        let thunk = self.thunk;
        let holder = self.holder;
        match self.queue {
            Some(queue) => queue.enqueue(Command::call(move || {
                thunk.on_timeout(peer);
                drop(holder);
            })),
            None => {
                thunk.on_timeout(peer);
                drop(holder);
            }
        }
    }
}
