use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{HandlerTable, Successors, Transport, TransportHook, VnodeHandler, MAX_FORWARD_HOPS};
use crate::error::{Error, Result};
use crate::hash::Id;
use crate::vnode::Vnode;

/// Serves calls addressed to vnodes of this process in-process and passes
/// everything else to the wrapped remote transport.
pub struct LocalTransport {
    host: RwLock<Option<String>>,
    remote: Arc<dyn Transport>,
    table: HandlerTable,
}

impl LocalTransport {
    pub fn new(remote: Arc<dyn Transport>) -> Self {
        LocalTransport {
            host: RwLock::new(None),
            remote,
            table: HandlerTable::default(),
        }
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn list_vnodes(&self, host: &str) -> Result<Vec<Vnode>> {
        let is_local = self.host.read().as_deref() == Some(host);
        if is_local {
            return Ok(self.table.vnodes(None));
        }
        self.remote.list_vnodes(host).await
    }

    async fn ping(&self, vnode: &Vnode) -> Result<bool> {
        if self.table.contains(&vnode.id) {
            return Ok(true);
        }
        self.remote.ping(vnode).await
    }

    async fn get_predecessor(&self, vnode: &Vnode) -> Result<Option<Vnode>> {
        match self.table.get(&vnode.id) {
            Some(handler) => handler.get_predecessor().await,
            None => self.remote.get_predecessor(vnode).await,
        }
    }

    async fn notify(&self, dest: &Vnode, vnode: &Vnode) -> Result<Vec<Vnode>> {
        match self.table.get(&dest.id) {
            Some(handler) => handler.notify(vnode).await,
            None => self.remote.notify(dest, vnode).await,
        }
    }

    async fn find_successors(&self, vnode: &Vnode, limit: usize, key: &Id) -> Result<Vec<Vnode>> {
        let mut target = vnode.clone();
        for _ in 0..MAX_FORWARD_HOPS {
            let handler = match self.table.get(&target.id) {
                Some(handler) => handler,
                None => return self.remote.find_successors(&target, limit, key).await,
            };
            match handler.find_successors(key, limit).await? {
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
        *self.host.write() = Some(vnode.host.clone());
        self.table.insert(vnode, Arc::clone(&handler));
        self.remote.register(vnode, handler);
    }

    fn deregister(&self, vnode: &Vnode) {
        self.table.remove(&vnode.id);
        self.remote.deregister(vnode);
    }

    fn register_hook(&self, hook: Arc<dyn TransportHook>) {
        self.remote.register_hook(hook);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::hash_key;
    use crate::transport::MemoryNetwork;

    /// Always forwards to the same vnode.
    struct Loop {
        next: Vnode,
    }

    #[async_trait]
    impl VnodeHandler for Loop {
        async fn find_successors(&self, _key: &Id, _limit: usize) -> Result<Successors> {
            Ok(Successors::Forward(self.next.clone()))
        }

        async fn find_remote_successors(&self, _limit: usize) -> Result<Vec<Vnode>> {
            Ok(vec![])
        }

        async fn get_predecessor(&self) -> Result<Option<Vnode>> {
            Ok(Some(self.next.clone()))
        }

        async fn notify(&self, _vnode: &Vnode) -> Result<Vec<Vnode>> {
            Ok(vec![])
        }
    }

    #[tokio::test]
    async fn forward_hops_are_bounded() {
        let network = MemoryNetwork::new();
        let local = LocalTransport::new(network);
        let vnode = Vnode::new(hash_key(b"a"), "a:1");
        local.register(
            &vnode,
            Arc::new(Loop {
                next: vnode.clone(),
            }),
        );

        let res = local.find_successors(&vnode, 1, &hash_key(b"key")).await;
        assert!(matches!(res, Err(Error::ForwardLoop(_))));
    }

    #[tokio::test]
    async fn local_calls_skip_the_remote() {
        let network = MemoryNetwork::new();
        let local = LocalTransport::new(network.clone());
        let a = Vnode::new(hash_key(b"a"), "a:1");
        let b = Vnode::new(hash_key(b"b"), "a:1");
        local.register(&a, Arc::new(Loop { next: b.clone() }));
        local.register(&b, Arc::new(Loop { next: a.clone() }));

        let mut expected = vec![a.clone(), b.clone()];
        expected.sort_by(|x, y| x.id.cmp(&y.id));
        assert_eq!(local.list_vnodes("a:1").await.unwrap(), expected);
        assert_eq!(local.get_predecessor(&a).await.unwrap(), Some(b.clone()));
        assert!(local.ping(&a).await.unwrap());

        // registrations reach the remote side as well
        assert!(network.get_vnode_handler(&a).is_some());
        assert!(local.list_vnodes("b:1").await.is_err());

        local.deregister(&a);
        assert!(local.get_vnode_handler(&a).is_none());
        assert!(network.get_vnode_handler(&a).is_none());
    }
}
