pub mod config;
pub mod error;
pub mod hash;
pub mod vnode;

pub mod rpc;
pub mod transport;

pub mod dht;

pub use config::{Config, LogLevel, TransportConfig};
pub use dht::{DelegateHook, EventCtx, Ring, RingEventType};
pub use hash::{hash_key, Id};
pub use transport::{LocalTransport, MemoryNetwork, NetworkTransport, Transport};
pub use vnode::Vnode;
