use std::sync::Arc;

use async_trait::async_trait;

use super::{HandlerTable, Successors, Transport, VnodeHandler, MAX_FORWARD_HOPS};
use crate::error::{Error, Result};
use crate::hash::Id;
use crate::vnode::Vnode;

/// An in-process stand-in for the network. Every ring created on top of the
/// same `MemoryNetwork` can reach every other one; a host disappears once its
/// vnodes are deregistered.
#[derive(Default)]
pub struct MemoryNetwork {
    table: HandlerTable,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(MemoryNetwork::default())
    }

    fn handler(&self, vnode: &Vnode) -> Result<Arc<dyn VnodeHandler>> {
        self.check_host(&vnode.host)?;
        self.table.get(&vnode.id).ok_or(Error::HandlerNotFound)
    }

    fn check_host(&self, host: &str) -> Result<()> {
        if self.table.vnodes(Some(host)).is_empty() {
            return Err(Error::Remote(format!("host {} unreachable", host)));
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for MemoryNetwork {
    async fn list_vnodes(&self, host: &str) -> Result<Vec<Vnode>> {
        self.check_host(host)?;
        Ok(self.table.vnodes(Some(host)))
    }

    async fn ping(&self, vnode: &Vnode) -> Result<bool> {
        self.check_host(&vnode.host)?;
        Ok(true)
    }

    async fn get_predecessor(&self, vnode: &Vnode) -> Result<Option<Vnode>> {
        self.handler(vnode)?.get_predecessor().await
    }

    async fn notify(&self, dest: &Vnode, vnode: &Vnode) -> Result<Vec<Vnode>> {
        self.handler(dest)?.notify(vnode).await
    }

    async fn find_successors(&self, vnode: &Vnode, limit: usize, key: &Id) -> Result<Vec<Vnode>> {
        let mut target = vnode.clone();
        for _ in 0..MAX_FORWARD_HOPS {
            match self.handler(&target)?.find_successors(key, limit).await? {
                Successors::Found(successors) => return Ok(successors),
                Successors::Forward(next) => target = next,
            }
        }
        Err(Error::ForwardLoop(key.to_string()))
    }

    fn get_vnode_handler(&self, vnode: &Vnode) -> Option<Arc<dyn VnodeHandler>> {
        self.table.get(&vnode.id)
    }

    fn register(&self, vnode: &Vnode, handler: Arc<dyn VnodeHandler>) {
        self.table.insert(vnode, handler);
    }

    fn deregister(&self, vnode: &Vnode) {
        self.table.remove(&vnode.id);
    }
}
