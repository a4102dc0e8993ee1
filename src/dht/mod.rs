pub mod event;
mod handler;
pub mod ring;
pub mod vnode;

pub use event::{DelegateHook, EventCtx, RingEventType};
pub use ring::Ring;
pub use vnode::{LocalVnode, VnodeSnapshot};
