//! Typed RPC runtime for latency-sensitive server and game workloads.
//!
//! A process hosts one or more [`EventLoop`]s; each loop owns [`Host`]s that
//! accept and originate framed TCP connections. Application code registers
//! named procedures on an [`RpcEnvironment`], sends one-way messages, and
//! issues remote calls that receive a typed response or time out.
//!
//! ```no_run
//! use std::time::Duration;
//! use tether::{EventLoop, Flags, IpVersion, ReturnCallback, RpcEnvironment};
//!
//! let mut lp = EventLoop::new()?;
//! let host = lp.create_host();
//! let env = std::sync::Arc::new(RpcEnvironment::new());
//! env.register("mul", |a: i32, b: i32| a * b);
//! host.set_rpc_environment(env.clone());
//! let listening = host.listen_on_port("127.0.0.1", 7312, IpVersion::V4);
//! lp.run_async();
//! assert_eq!(listening.wait(), Some(true));
//! # Ok::<(), std::io::Error>(())
//! ```

mod command;
mod event_loop;
mod host;
mod peer;
mod rpc;
mod return_cb;

pub use command::{Command, CommandQueue, Continuation};
pub use event_loop::{EventLoop, LoopCore, LoopStats};
pub use host::{Completion, ConnectError, Host, IpVersion};
pub use peer::{Peer, PeerStats};
pub use return_cb::ReturnCallback;
pub use rpc::{
    CallCtx, CallFlags, Caller, FromCall, HostHandle, QueuePicker, Remaining, Reply,
    RpcEnvironment, RpcHandler,
};

pub use tether_pool as pool;
pub use tether_proto as proto;
pub use tether_proto::{ByteBuffer, Decode, Encode, EncodeArgs, Flags, WireReader, WireWriter};

/// One-shot process-level setup: forces creation of the shared memory pool.
/// Pair with [`deinitialize`] at shutdown.
pub fn initialize() {
    tether_pool::warm();
    tracing::debug!("tether initialized");
}

/// Releases pooled memory back to the system and logs the pool counters.
pub fn deinitialize() {
    tether_pool::trim();
}
