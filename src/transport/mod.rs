//! Everything a vnode says to another vnode goes through a [`Transport`].
//!
//! [`LocalTransport`] short-circuits calls to vnodes living in this process and
//! hands the rest to a remote transport: [`NetworkTransport`] in production,
//! [`MemoryNetwork`] when several rings share one process.

pub mod local;
pub mod memory;
pub mod network;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::Result;
use crate::hash::Id;
use crate::rpc::ChordMsg;
use crate::vnode::Vnode;

pub use local::LocalTransport;
pub use memory::MemoryNetwork;
pub use network::NetworkTransport;

/// Upper bound on forward hops followed for a single `find_successors` call.
pub const MAX_FORWARD_HOPS: usize = 64;

/// Answer of a vnode to a successor query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Successors {
    /// The queried vnode knows the successors of the key.
    Found(Vec<Vnode>),
    /// Ask this vnode instead; it is closer to the key.
    Forward(Vnode),
}

/// Operations executed in the context of one local vnode. Transports dispatch
/// inbound requests to the handler registered for the destination vnode.
#[async_trait]
pub trait VnodeHandler: Send + Sync {
    async fn find_successors(&self, key: &Id, limit: usize) -> Result<Successors>;

    /// Current replica set of the vnode.
    async fn find_remote_successors(&self, limit: usize) -> Result<Vec<Vnode>>;

    async fn get_predecessor(&self) -> Result<Option<Vnode>>;

    /// `vnode` believes it may be our predecessor. Returns our successor list.
    async fn notify(&self, vnode: &Vnode) -> Result<Vec<Vnode>>;
}

/// Decoder for message types the base transport does not know. Hooks are tried
/// in registration order; a hook that does not know a frame's type returns
/// [`crate::error::Error::HookUnknownType`].
pub trait TransportHook: Send + Sync {
    fn decode(&self, raw: &[u8]) -> Result<ChordMsg>;
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Lists the vnodes hosted by the process at `host`.
    async fn list_vnodes(&self, host: &str) -> Result<Vec<Vnode>>;

    async fn ping(&self, vnode: &Vnode) -> Result<bool>;

    async fn get_predecessor(&self, vnode: &Vnode) -> Result<Option<Vnode>>;

    /// Tells `dest` about `vnode` and returns the successor list of `dest`.
    async fn notify(&self, dest: &Vnode, vnode: &Vnode) -> Result<Vec<Vnode>>;

    /// Asks `vnode` for up to `limit` successors of `key`, following forwards.
    async fn find_successors(&self, vnode: &Vnode, limit: usize, key: &Id) -> Result<Vec<Vnode>>;

    /// Handler of `vnode` if it is registered with this transport.
    fn get_vnode_handler(&self, vnode: &Vnode) -> Option<Arc<dyn VnodeHandler>>;

    fn register(&self, vnode: &Vnode, handler: Arc<dyn VnodeHandler>);

    fn deregister(&self, vnode: &Vnode);

    fn register_hook(&self, _hook: Arc<dyn TransportHook>) {}
}

/// Registration table of local vnode handlers, keyed by vnode id.
#[derive(Default)]
pub(crate) struct HandlerTable {
    handlers: RwLock<HashMap<Id, (Vnode, Arc<dyn VnodeHandler>)>>,
}

impl HandlerTable {
    pub(crate) fn get(&self, id: &Id) -> Option<Arc<dyn VnodeHandler>> {
        self.handlers
            .read()
            .get(id)
            .map(|(_, handler)| Arc::clone(handler))
    }

    pub(crate) fn contains(&self, id: &Id) -> bool {
        self.handlers.read().contains_key(id)
    }

    pub(crate) fn insert(&self, vnode: &Vnode, handler: Arc<dyn VnodeHandler>) {
        self.handlers
            .write()
            .insert(vnode.id, (vnode.clone(), handler));
    }

    pub(crate) fn remove(&self, id: &Id) {
        self.handlers.write().remove(id);
    }

    /// Registered vnodes sorted by id, optionally restricted to one host.
    pub(crate) fn vnodes(&self, host: Option<&str>) -> Vec<Vnode> {
        let mut vnodes: Vec<Vnode> = self
            .handlers
            .read()
            .values()
            .map(|(vnode, _)| vnode)
            .filter(|vnode| host.map_or(true, |host| vnode.host == host))
            .cloned()
            .collect();
        vnodes.sort_by(|a, b| a.id.cmp(&b.id));
        vnodes
    }
}
