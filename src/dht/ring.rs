use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;

use super::event::{DelegateHook, EventCtx};
use super::vnode::{LocalVnode, VnodeSnapshot};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::hash::{nearest_vnode_to_key, vnode_id, Id};
use crate::transport::{LocalTransport, Transport, VnodeHandler};
use crate::vnode::Vnode;

/// What every local vnode of a ring shares.
pub(crate) struct RingContext {
    pub(crate) config: Config,
    /// Local transport wrapping the one the ring was built with.
    pub(crate) transport: Arc<dyn Transport>,
    hooks: RwLock<Vec<Arc<dyn DelegateHook>>>,
    pub(crate) stabilizations: AtomicUsize,
}

impl RingContext {
    pub(crate) fn new(config: Config, transport: Arc<dyn Transport>) -> Self {
        RingContext {
            config,
            transport,
            hooks: RwLock::new(Vec::new()),
            stabilizations: AtomicUsize::new(0),
        }
    }

    /// Hands `ctx` to every registered hook on its own task.
    pub(crate) fn emit(&self, ctx: EventCtx) {
        let hooks = self.hooks.read().clone();
        for hook in hooks {
            let ctx = ctx.clone();
            tokio::spawn(async move { hook.emit_event(ctx).await });
        }
    }
}

/// The local view of the ring: the vnodes this process hosts and the
/// transport they talk through.
pub struct Ring {
    ctx: Arc<RingContext>,
    /// Sorted by id.
    vnodes: Vec<Arc<LocalVnode>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Ring {
    fn init(config: Config, transport: Arc<dyn Transport>) -> Result<Ring> {
        if config.num_vnodes == 0 || config.num_vnodes > usize::from(u16::MAX) + 1 {
            return Err(Error::Internal(format!(
                "number of vnodes must be within 1..=65536, got {}",
                config.num_vnodes
            )));
        }
        if config.num_successors == 0 {
            return Err(Error::Internal("number of successors must be at least 1".into()));
        }

        let hostname = config.hostname.clone();
        let num_vnodes = config.num_vnodes;
        let ctx = Arc::new(RingContext::new(
            config,
            Arc::new(LocalTransport::new(transport)),
        ));

        let mut vnodes: Vec<Arc<LocalVnode>> = (0..num_vnodes)
            .map(|idx| {
                let vnode = Vnode::new(vnode_id(&hostname, idx as u16), hostname.clone());
                Arc::new(LocalVnode::new(vnode, Arc::clone(&ctx)))
            })
            .collect();
        vnodes.sort_by(|a, b| a.vnode.id.cmp(&b.vnode.id));

        for vnode in &vnodes {
            let handler: Arc<dyn VnodeHandler> = vnode.clone();
            ctx.transport.register(&vnode.vnode, handler);
        }

        Ok(Ring {
            ctx,
            vnodes,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Starts a new ring made only of this process's vnodes.
    pub async fn create(config: Config, transport: Arc<dyn Transport>) -> Result<Ring> {
        let ring = Ring::init(config, transport)?;
        info!(
            "creating ring on {} with {} vnodes",
            ring.ctx.config.hostname,
            ring.vnodes.len()
        );
        ring.set_local_successors().await;
        ring.schedule();
        Ok(ring)
    }

    /// Joins the ring `existing` is part of. Every local vnode asks the remote
    /// vnodes, in order, for its successors until one of them answers.
    pub async fn join(config: Config, transport: Arc<dyn Transport>, existing: &str) -> Result<Ring> {
        let remote = transport.list_vnodes(existing).await?;
        if remote.is_empty() {
            return Err(Error::Join(format!("{} has no vnodes registered yet", existing)));
        }

        let ring = Ring::init(config, Arc::clone(&transport))?;
        info!(
            "joining ring through {} with {} vnodes",
            existing,
            ring.vnodes.len()
        );

        let num_successors = ring.ctx.config.num_successors;
        for vnode in &ring.vnodes {
            let mut last_error = String::from("no remote vnode answered");
            let mut resolved = false;
            for remote_vnode in &remote {
                match transport
                    .find_successors(remote_vnode, num_successors, &vnode.vnode.id)
                    .await
                {
                    Ok(successors) => {
                        let successors: Vec<Vnode> = successors
                            .into_iter()
                            .filter(|succ| succ.id != vnode.vnode.id)
                            .collect();
                        if successors.is_empty() {
                            last_error = format!("{} returned no successors", remote_vnode);
                            continue;
                        }
                        vnode.set_successors(successors).await;
                        resolved = true;
                        break;
                    }
                    Err(e) => {
                        warn!("failed to resolve successors through {}: {}", remote_vnode, e);
                        last_error = e.to_string();
                    }
                }
            }
            if !resolved {
                return Err(Error::Join(last_error));
            }
        }

        // lets the remote side see us before the first stabilization
        if let Err(e) = transport.ping(&Vnode::new(Id::default(), existing)).await {
            debug!("warm-up ping of {} failed: {}", existing, e);
        }

        ring.stabilize_now().await?;
        ring.schedule();
        Ok(ring)
    }

    /// Each local vnode takes the next local vnodes as its successors.
    async fn set_local_successors(&self) {
        let num_vnodes = self.vnodes.len();
        let count = self.ctx.config.num_successors.min(num_vnodes - 1);
        for (idx, vnode) in self.vnodes.iter().enumerate() {
            let successors = if count == 0 {
                vec![vnode.vnode.clone()]
            } else {
                (1..=count)
                    .map(|offset| self.vnodes[(idx + offset) % num_vnodes].vnode.clone())
                    .collect()
            };
            vnode.set_successors(successors).await;
        }
    }

    fn schedule(&self) {
        let mut tasks = self.tasks.lock();
        for vnode in &self.vnodes {
            tasks.push(vnode.schedule());
        }
    }

    /// Runs one stabilization pass on every local vnode, in id order.
    pub async fn stabilize_now(&self) -> Result<()> {
        for vnode in &self.vnodes {
            vnode.stabilize().await?;
        }
        Ok(())
    }

    /// Finds the first `n` successors of `key`, the first one owning it.
    pub async fn lookup(&self, n: usize, key: &Id) -> Result<Vec<Vnode>> {
        let max = self.ctx.config.num_successors;
        if n == 0 || n > max {
            return Err(Error::LookupLimit { requested: n, max });
        }

        let vnodes = self.my_vnodes();
        let nearest = nearest_vnode_to_key(&vnodes, key)
            .ok_or_else(|| Error::Internal("ring has no vnodes".into()))?;
        let mut successors = self.ctx.transport.find_successors(nearest, n, key).await?;
        successors.truncate(n);
        debug!("lookup of {} resolved to {:?}", key, successors);
        Ok(successors)
    }

    /// Local vnodes sorted by id.
    pub fn my_vnodes(&self) -> Vec<Vnode> {
        self.vnodes.iter().map(|vnode| vnode.vnode.clone()).collect()
    }

    pub fn register_delegate_hook(&self, hook: Arc<dyn DelegateHook>) {
        self.ctx.hooks.write().push(hook);
    }

    /// Size of each vnode's cross-host replica set.
    pub fn replicas(&self) -> usize {
        self.ctx.config.replicas
    }

    /// Longest wait between two stabilization passes of a vnode.
    pub fn max_stabilize(&self) -> Duration {
        self.ctx.config.stabilize_max
    }

    pub fn config(&self) -> &Config {
        &self.ctx.config
    }

    /// Transport the ring's vnodes are reachable through.
    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::clone(&self.ctx.transport)
    }

    /// Number of completed stabilization passes over all local vnodes.
    pub fn stabilizations(&self) -> usize {
        self.ctx.stabilizations.load(Ordering::SeqCst)
    }

    pub async fn snapshot(&self) -> Vec<VnodeSnapshot> {
        let mut snapshots = Vec::with_capacity(self.vnodes.len());
        for vnode in &self.vnodes {
            snapshots.push(vnode.snapshot().await);
        }
        snapshots
    }

    /// Current replica set of one of our vnodes.
    pub async fn replicas_of(&self, vnode: &Vnode) -> Result<Vec<Vnode>> {
        let handler = self
            .ctx
            .transport
            .get_vnode_handler(vnode)
            .ok_or(Error::HandlerNotFound)?;
        handler.find_remote_successors(self.replicas()).await
    }

    /// Stops stabilizing and withdraws our vnodes from the transport. The rest
    /// of the ring routes around them once their absence is noticed.
    pub fn shutdown(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        for vnode in &self.vnodes {
            self.ctx.transport.deregister(&vnode.vnode);
        }
    }
}

impl Drop for Ring {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dht::event::RingEventType;
    use crate::hash::hash_key;
    use crate::transport::MemoryNetwork;
    use async_trait::async_trait;

    fn config(host: &str, num_vnodes: usize) -> Config {
        let hour = Duration::from_secs(3600);
        Config::new(host)
            .with_num_vnodes(num_vnodes)
            .with_stabilize(hour, hour)
    }

    /// First vnode clockwise from `key`.
    fn owner(vnodes: &[Vnode], key: &Id) -> Vnode {
        vnodes
            .iter()
            .find(|vnode| vnode.id >= *key)
            .unwrap_or(&vnodes[0])
            .clone()
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<EventCtx>>,
    }

    #[async_trait]
    impl DelegateHook for Recorder {
        async fn emit_event(&self, ctx: EventCtx) {
            self.events.lock().push(ctx);
        }
    }

    /// Refuses pings addressed to a host rather than to one of its vnodes.
    struct NoHostPing(Arc<MemoryNetwork>);

    #[async_trait]
    impl Transport for NoHostPing {
        async fn list_vnodes(&self, host: &str) -> Result<Vec<Vnode>> {
            self.0.list_vnodes(host).await
        }

        async fn ping(&self, vnode: &Vnode) -> Result<bool> {
            if vnode.id == Id::default() {
                return Err(Error::Timeout("ping"));
            }
            self.0.ping(vnode).await
        }

        async fn get_predecessor(&self, vnode: &Vnode) -> Result<Option<Vnode>> {
            self.0.get_predecessor(vnode).await
        }

        async fn notify(&self, dest: &Vnode, vnode: &Vnode) -> Result<Vec<Vnode>> {
            self.0.notify(dest, vnode).await
        }

        async fn find_successors(&self, vnode: &Vnode, limit: usize, key: &Id) -> Result<Vec<Vnode>> {
            self.0.find_successors(vnode, limit, key).await
        }

        fn get_vnode_handler(&self, vnode: &Vnode) -> Option<Arc<dyn VnodeHandler>> {
            self.0.get_vnode_handler(vnode)
        }

        fn register(&self, vnode: &Vnode, handler: Arc<dyn VnodeHandler>) {
            self.0.register(vnode, handler)
        }

        fn deregister(&self, vnode: &Vnode) {
            self.0.deregister(vnode)
        }
    }

    #[tokio::test]
    async fn join_survives_failed_warm_up_ping() {
        let network = MemoryNetwork::new();
        let a = Ring::create(config("a:1", 1), network.clone())
            .await
            .unwrap();
        let b = Ring::join(config("b:1", 1), Arc::new(NoHostPing(network.clone())), "a:1")
            .await
            .unwrap();

        assert_eq!(b.snapshot().await[0].successors, a.my_vnodes());
        assert_eq!(
            a.snapshot().await[0].predecessor.as_ref(),
            Some(&b.my_vnodes()[0])
        );
    }

    #[tokio::test]
    async fn single_vnode_ring_owns_every_key() {
        let ring = Ring::create(config("a:1", 1), MemoryNetwork::new())
            .await
            .unwrap();
        let me = ring.my_vnodes()[0].clone();

        for key in ["x", "y", "z"] {
            let found = ring.lookup(1, &hash_key(key.as_bytes())).await.unwrap();
            assert_eq!(found, vec![me.clone()]);
        }
        // owning everything, the ring does not report itself twice
        assert_eq!(ring.lookup(3, &hash_key(b"x")).await.unwrap(), vec![me.clone()]);

        ring.stabilize_now().await.unwrap();
        let snapshot = ring.snapshot().await;
        assert_eq!(snapshot[0].successors, vec![me]);
        assert!(snapshot[0].predecessor.is_none());
        assert!(snapshot[0].fingers.is_empty());
    }

    #[tokio::test]
    async fn lookup_limit() {
        let ring = Ring::create(config("a:1", 2), MemoryNetwork::new())
            .await
            .unwrap();
        let key = hash_key(b"key");

        assert!(matches!(
            ring.lookup(0, &key).await,
            Err(Error::LookupLimit { requested: 0, max: 8 })
        ));
        assert!(matches!(
            ring.lookup(9, &key).await,
            Err(Error::LookupLimit { requested: 9, max: 8 })
        ));
        assert_eq!(ring.lookup(8, &key).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn local_vnodes_are_sorted_and_chained() {
        let ring = Ring::create(config("a:1", 5).with_num_successors(3), MemoryNetwork::new())
            .await
            .unwrap();
        let vnodes = ring.my_vnodes();
        assert_eq!(vnodes.len(), 5);
        assert!(vnodes.windows(2).all(|pair| pair[0].id < pair[1].id));

        for (idx, snapshot) in ring.snapshot().await.iter().enumerate() {
            let expected: Vec<Vnode> = (1..=3).map(|i| vnodes[(idx + i) % 5].clone()).collect();
            assert_eq!(snapshot.successors, expected);
        }

        for i in 0..20u8 {
            let key = hash_key(&[i]);
            let found = ring.lookup(2, &key).await.unwrap();
            assert_eq!(found[0], owner(&vnodes, &key));
            assert_eq!(found.len(), 2);
        }
    }

    #[tokio::test]
    async fn stabilization_links_local_vnodes() {
        let ring = Ring::create(config("a:1", 4), MemoryNetwork::new())
            .await
            .unwrap();
        ring.stabilize_now().await.unwrap();
        ring.stabilize_now().await.unwrap();
        assert_eq!(ring.stabilizations(), 8);

        let vnodes = ring.my_vnodes();
        for (idx, snapshot) in ring.snapshot().await.iter().enumerate() {
            assert_eq!(snapshot.successors[0], vnodes[(idx + 1) % 4]);
            assert_eq!(snapshot.predecessor.as_ref(), Some(&vnodes[(idx + 3) % 4]));
            assert!(!snapshot.fingers.is_empty());
            assert!(snapshot.stabilized.is_some());
            // every vnode lives on the same host
            assert!(snapshot.remote_successors.is_empty());
        }
    }

    #[tokio::test]
    async fn notify_is_idempotent() {
        let ring = Ring::create(config("a:1", 3), MemoryNetwork::new())
            .await
            .unwrap();
        let recorder = Arc::new(Recorder::default());
        ring.register_delegate_hook(recorder.clone());

        let vnodes = ring.my_vnodes();
        let handler = ring.transport().get_vnode_handler(&vnodes[1]).unwrap();

        // a vnode never becomes its own predecessor
        handler.notify(&vnodes[1]).await.unwrap();
        assert!(handler.get_predecessor().await.unwrap().is_none());

        let successors = handler.notify(&vnodes[0]).await.unwrap();
        assert_eq!(successors[0], vnodes[2]);
        handler.notify(&vnodes[0]).await.unwrap();
        assert_eq!(handler.get_predecessor().await.unwrap(), Some(vnodes[0].clone()));

        tokio::time::sleep(Duration::from_millis(50)).await;
        let events = recorder.events.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].ev_type, RingEventType::PredecessorJoined);
        assert_eq!(events[0].target, vnodes[1]);
        assert_eq!(events[0].primary_item, Some(vnodes[0].clone()));
    }

    #[tokio::test]
    async fn closer_predecessor_replaces_current_one() {
        let ring = Ring::create(config("a:1", 3), MemoryNetwork::new())
            .await
            .unwrap();
        let vnodes = ring.my_vnodes();
        let handler = ring.transport().get_vnode_handler(&vnodes[0]).unwrap();

        // vnodes[1] sits right after us, so it is the farthest predecessor
        handler.notify(&vnodes[1]).await.unwrap();
        handler.notify(&vnodes[2]).await.unwrap();
        assert_eq!(handler.get_predecessor().await.unwrap(), Some(vnodes[2].clone()));

        handler.notify(&vnodes[1]).await.unwrap();
        assert_eq!(handler.get_predecessor().await.unwrap(), Some(vnodes[2].clone()));
    }

    #[tokio::test]
    async fn shutdown_deregisters_vnodes() {
        let network = MemoryNetwork::new();
        let ring = Ring::create(config("a:1", 2), network.clone())
            .await
            .unwrap();
        let vnodes = ring.my_vnodes();
        assert_eq!(network.list_vnodes("a:1").await.unwrap(), vnodes);

        ring.shutdown();
        assert!(network.get_vnode_handler(&vnodes[0]).is_none());
        assert!(network.list_vnodes("a:1").await.is_err());
        assert!(matches!(
            ring.replicas_of(&vnodes[0]).await,
            Err(Error::HandlerNotFound)
        ));
    }

    #[tokio::test]
    async fn rejects_invalid_config() {
        assert!(Ring::create(config("a:1", 0), MemoryNetwork::new()).await.is_err());
        assert!(
            Ring::create(config("a:1", 1).with_num_successors(0), MemoryNetwork::new())
                .await
                .is_err()
        );
    }
}
