//! State and stabilization protocol of a vnode hosted by this process.

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use log::{debug, error, info};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

use super::event::{EventCtx, RingEventType};
use super::ring::RingContext;
use crate::error::{Error, Result};
use crate::hash::{between, distance, power_offset, rand_stabilize, Id, ID_BITS};
use crate::vnode::Vnode;

#[derive(Debug, Default)]
pub(crate) struct VnodeState {
    /// Closest vnodes clockwise, nearest first. Never contains duplicates, and
    /// only contains ourselves when we are alone on the ring.
    pub(crate) successors: Vec<Vnode>,
    pub(crate) finger: Vec<Option<Vnode>>,
    pub(crate) last_finger: usize,
    /// (offset exponent, finger slot) an interrupted refresh resumes from.
    finger_cursor: (usize, usize),
    pub(crate) predecessor: Option<Vnode>,
    pub(crate) old_predecessor: Option<Vnode>,
    pub(crate) remote_successors: Vec<Vnode>,
    pub(crate) stabilized: Option<Instant>,
}

impl VnodeState {
    /// Clears every finger pointing at a vnode found dead.
    fn forget_finger(&mut self, id: &Id) {
        for slot in self.finger.iter_mut() {
            if slot.as_ref().map_or(false, |finger| finger.id == *id) {
                *slot = None;
            }
        }
    }
}

/// Point-in-time view of a local vnode's routing state.
#[derive(Debug, Clone)]
pub struct VnodeSnapshot {
    pub vnode: Vnode,
    pub predecessor: Option<Vnode>,
    pub successors: Vec<Vnode>,
    /// Populated finger entries, in finger order.
    pub fingers: Vec<Vnode>,
    pub remote_successors: Vec<Vnode>,
    pub stabilized: Option<Instant>,
}

pub struct LocalVnode {
    pub(crate) vnode: Vnode,
    ctx: Arc<RingContext>,
    pub(crate) state: RwLock<VnodeState>,
    /// Held for a whole stabilization pass.
    stabilize_lock: Mutex<()>,
}

impl LocalVnode {
    pub(crate) fn new(vnode: Vnode, ctx: Arc<RingContext>) -> Self {
        LocalVnode {
            vnode,
            ctx,
            state: RwLock::new(VnodeState {
                finger: vec![None; ID_BITS],
                ..Default::default()
            }),
            stabilize_lock: Mutex::new(()),
        }
    }

    pub fn vnode(&self) -> &Vnode {
        &self.vnode
    }

    fn id(&self) -> &Id {
        &self.vnode.id
    }

    pub(crate) async fn set_successors(&self, successors: Vec<Vnode>) {
        let successors = self.compact(successors);
        self.state.write().await.successors = successors;
    }

    pub(crate) async fn snapshot(&self) -> VnodeSnapshot {
        let state = self.state.read().await;
        VnodeSnapshot {
            vnode: self.vnode.clone(),
            predecessor: state.predecessor.clone(),
            successors: state.successors.clone(),
            fingers: state.finger.iter().flatten().cloned().collect(),
            remote_successors: state.remote_successors.clone(),
            stabilized: state.stabilized,
        }
    }

    /// Spawns the periodic stabilization task of this vnode.
    pub(crate) fn schedule(self: &Arc<Self>) -> JoinHandle<()> {
        let vnode = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(rand_stabilize(&vnode.ctx.config)).await;
                if let Err(e) = vnode.stabilize().await {
                    error!("vnode {} stopped stabilizing: {}", vnode.vnode, e);
                    break;
                }
            }
        })
    }

    /// Runs one stabilization pass. Only losing every successor is fatal;
    /// other failures are logged and retried on the next pass.
    pub async fn stabilize(&self) -> Result<()> {
        let _pass = self.stabilize_lock.lock().await;
        let start = Instant::now();

        if let Err(e) = self.check_new_successor().await {
            if let Error::NoSuccessors(_) = e {
                return Err(e);
            }
            debug!("[{}] error checking for new successor: {}", self.vnode, e);
        }

        if let Err(e) = self.notify_successor().await {
            debug!("[{}] error notifying successor: {}", self.vnode, e);
        }

        if let Err(e) = self.fix_finger_table().await {
            let last_finger = self.state.read().await.last_finger;
            debug!(
                "[{}] error fixing finger table, last finger {}: {}",
                self.vnode, last_finger, e
            );
        }

        if let Err(e) = self.check_predecessor().await {
            info!("[{}] error checking predecessor: {}", self.vnode, e);
        }

        self.state.write().await.stabilized = Some(Instant::now());
        self.ctx.stabilizations.fetch_add(1, Ordering::SeqCst);
        debug!("[{}] stabilized in {:?}", self.vnode, start.elapsed());
        Ok(())
    }

    /// Drops self references and duplicates and caps the list length. A list
    /// holding only ourselves is kept as is.
    fn compact(&self, successors: Vec<Vnode>) -> Vec<Vnode> {
        let mut seen = HashSet::new();
        let alone = successors.iter().any(|succ| succ.id == *self.id());
        let compacted: Vec<Vnode> = successors
            .into_iter()
            .filter(|succ| succ.id != *self.id())
            .filter(|succ| seen.insert(succ.id))
            .take(self.ctx.config.num_successors)
            .collect();
        if compacted.is_empty() && alone {
            return vec![self.vnode.clone()];
        }
        compacted
    }

    /// Whether `candidate` should replace `succ` as our first successor. A
    /// vnode that is its own successor takes any other vnode.
    fn closer_successor(&self, succ: &Vnode, candidate: &Vnode) -> bool {
        if candidate.id == *self.id() {
            return false;
        }
        if succ.id == *self.id() {
            return true;
        }
        between(self.id(), &succ.id, &candidate.id, false)
    }

    fn first_successor(&self, state: &VnodeState) -> Result<Vnode> {
        state
            .successors
            .first()
            .cloned()
            .ok_or_else(|| Error::NoSuccessors(self.vnode.to_string()))
    }

    /// Asks our successor for its predecessor and adopts it when it sits
    /// between us. Unreachable successors are dropped on the way.
    pub(crate) async fn check_new_successor(&self) -> Result<()> {
        let mut update_remotes = false;
        loop {
            let succ = self.first_successor(&*self.state.read().await)?;
            match self.ctx.transport.get_predecessor(&succ).await {
                Err(e) => {
                    info!("[{}] successor {} unreachable, dropping it: {}", self.vnode, succ, e);
                    let mut state = self.state.write().await;
                    if state.successors.first() == Some(&succ) {
                        state.successors.remove(0);
                    }
                    state.forget_finger(&succ.id);
                    update_remotes = true;
                }
                Ok(Some(candidate)) if self.closer_successor(&succ, &candidate) => {
                    if let Ok(true) = self.ctx.transport.ping(&candidate).await {
                        let mut state = self.state.write().await;
                        let mut successors = Vec::with_capacity(state.successors.len() + 1);
                        successors.push(candidate.clone());
                        successors.append(&mut state.successors);
                        state.successors = self.compact(successors);
                        update_remotes = true;
                        info!("[{}] new successor set: {}", self.vnode, candidate);
                    }
                    break;
                }
                Ok(_) => break,
            }
        }

        self.fix_live_successors().await;
        if update_remotes {
            self.update_remote_successors().await;
        }
        Ok(())
    }

    /// Pings every successor and removes the ones that do not answer.
    /// Returns whether the list changed.
    pub(crate) async fn fix_live_successors(&self) -> bool {
        let successors = self.state.read().await.successors.clone();
        let mut dead = HashSet::new();
        for succ in successors.iter().filter(|succ| succ.id != *self.id()) {
            match self.ctx.transport.ping(succ).await {
                Ok(true) => {}
                res => {
                    debug!("[{}] successor {} is dead: {:?}", self.vnode, succ, res.err());
                    dead.insert(succ.id);
                }
            }
        }
        if dead.is_empty() {
            return false;
        }

        let mut state = self.state.write().await;
        state.successors.retain(|succ| !dead.contains(&succ.id));
        for id in &dead {
            state.forget_finger(id);
        }
        true
    }

    /// Tells our successor about us and takes its successor list as the tail
    /// of ours. A short replica set is recomputed even if the list held.
    pub(crate) async fn notify_successor(&self) -> Result<()> {
        let (succ, before) = {
            let state = self.state.read().await;
            (self.first_successor(&state)?, state.successors.clone())
        };

        let theirs = self.ctx.transport.notify(&succ, &self.vnode).await?;
        {
            let mut state = self.state.write().await;
            if state.successors.first() == Some(&succ) {
                let mut merged = vec![succ.clone()];
                merged.extend(theirs.into_iter().take_while(|s| s.id != *self.id()));
                state.successors = self.compact(merged);
            }
        }

        self.fix_live_successors().await;
        let stale = {
            let state = self.state.read().await;
            state.successors != before
                || state.remote_successors.len() < self.ctx.config.replicas
        };
        if stale {
            self.update_remote_successors().await;
        }
        Ok(())
    }

    /// Walks the offsets `id + 2^i` and records the distinct vnodes owning
    /// them. An error leaves the cursor where it failed.
    pub(crate) async fn fix_finger_table(&self) -> Result<()> {
        let (mut exp, mut idx) = self.state.read().await.finger_cursor;

        while exp < ID_BITS {
            let offset = power_offset(self.id(), exp, ID_BITS);
            let found = match self
                .ctx
                .transport
                .find_successors(&self.vnode, 1, &offset)
                .await
            {
                Ok(successors) => successors.into_iter().next(),
                Err(e) => {
                    self.state.write().await.finger_cursor = (exp, idx);
                    return Err(e);
                }
            };
            let found = match found {
                Some(found) => found,
                None => {
                    self.state.write().await.finger_cursor = (exp, idx);
                    return Err(Error::Internal(format!("no successor for offset {}", offset)));
                }
            };

            // the ring wrapped around to us, every larger offset would too
            if found.id == *self.id() {
                break;
            }

            let mut state = self.state.write().await;
            exp += 1;
            if idx > 0 && state.finger[idx - 1].as_ref() == Some(&found) {
                continue;
            }
            state.finger[idx] = Some(found);
            state.last_finger = idx;
            idx += 1;
        }

        let mut state = self.state.write().await;
        for slot in state.finger.iter_mut().skip(idx) {
            *slot = None;
        }
        state.last_finger = idx.saturating_sub(1);
        state.finger_cursor = (0, 0);
        Ok(())
    }

    /// Forgets the predecessor if it stopped answering pings.
    pub(crate) async fn check_predecessor(&self) -> Result<()> {
        let pred = match self.state.read().await.predecessor.clone() {
            Some(pred) => pred,
            None => return Ok(()),
        };

        let res = self.ctx.transport.ping(&pred).await;
        if let Ok(true) = res {
            return Ok(());
        }

        let mut state = self.state.write().await;
        if state.predecessor.as_ref() == Some(&pred) {
            info!("[{}] predecessor {} failed", self.vnode, pred);
            state.old_predecessor = state.predecessor.take();
            state.forget_finger(&pred.id);
        }
        res.map(|_| ())
    }

    /// Finger or successor closest to `key` that still precedes it, or
    /// ourselves when nothing we know of does.
    pub(crate) fn closest_preceding_finger(&self, state: &VnodeState, key: &Id) -> Vnode {
        let me = self.id();
        let last = state.last_finger.min(ID_BITS - 1);
        let finger = state.finger[..=last]
            .iter()
            .rev()
            .flatten()
            .find(|finger| between(me, key, &finger.id, false));
        let succ = state
            .successors
            .iter()
            .rev()
            .find(|succ| between(me, key, &succ.id, false));

        match (finger, succ) {
            (Some(finger), Some(succ)) => {
                if distance(me, &finger.id) <= distance(me, &succ.id) {
                    succ.clone()
                } else {
                    finger.clone()
                }
            }
            (Some(finger), None) => finger.clone(),
            (None, Some(succ)) => succ.clone(),
            (None, None) => self.vnode.clone(),
        }
    }

    /// Collects up to `limit` live successors on hosts other than ours, one per
    /// host, walking successor lists beyond our own when needed.
    pub(crate) async fn collect_remote_successors(&self, limit: usize) -> Vec<Vnode> {
        let mut found: Vec<Vnode> = Vec::with_capacity(limit);
        if limit == 0 {
            return found;
        }

        let mut seen_vnodes = HashSet::from([self.vnode.id]);
        let mut seen_hosts = HashSet::from([self.vnode.host.clone()]);
        let mut pivot = None;
        let mut batch = self.state.read().await.successors.clone();

        loop {
            if batch.is_empty() {
                return found;
            }
            for succ in batch {
                if found.len() == limit {
                    return found;
                }
                // walked all the way around the ring
                if !seen_vnodes.insert(succ.id) {
                    return found;
                }
                pivot = Some(succ.clone());
                if seen_hosts.contains(&succ.host) {
                    continue;
                }
                let alive = matches!(self.ctx.transport.ping(&succ).await, Ok(true));
                if alive {
                    seen_hosts.insert(succ.host.clone());
                    found.push(succ);
                }
            }
            if found.len() == limit {
                return found;
            }

            let next = match &pivot {
                Some(next) => next.clone(),
                None => return found,
            };
            // asked for its own id, the pivot answers with itself first
            batch = match self
                .ctx
                .transport
                .find_successors(&next, self.ctx.config.num_successors + 1, &next.id)
                .await
            {
                Ok(mut batch) => {
                    if batch.first() == Some(&next) {
                        batch.remove(0);
                    }
                    batch
                }
                Err(e) => {
                    debug!("[{}] failed to walk successors of {}: {}", self.vnode, next, e);
                    return found;
                }
            };
        }
    }

    /// Recomputes the replica set and emits `ReplicasChanged` when it moved.
    pub(crate) async fn update_remote_successors(&self) {
        let fresh = self
            .collect_remote_successors(self.ctx.config.replicas)
            .await;
        let old = self.state.read().await.remote_successors.clone();
        if fresh == old {
            return;
        }

        let mut confirmed = Vec::with_capacity(fresh.len());
        for replica in fresh {
            if old.contains(&replica) {
                confirmed.push(replica);
                continue;
            }
            let alive = matches!(self.ctx.transport.ping(&replica).await, Ok(true));
            if alive {
                confirmed.push(replica);
            }
        }

        {
            let mut state = self.state.write().await;
            if state.remote_successors == confirmed {
                return;
            }
            state.remote_successors = confirmed.clone();
        }

        debug!("[{}] replicas changed: {:?}", self.vnode, confirmed);
        self.ctx.emit(EventCtx {
            ev_type: RingEventType::ReplicasChanged,
            target: self.vnode.clone(),
            primary_item: None,
            secondary_item: None,
            item_list: confirmed,
        });
    }

    /// Whether `candidate` may replace our current predecessor.
    pub(crate) fn accepts_predecessor(&self, state: &VnodeState, candidate: &Vnode) -> bool {
        if candidate.id == *self.id() {
            return false;
        }
        match &state.predecessor {
            None => true,
            Some(pred) => between(&pred.id, self.id(), &candidate.id, false),
        }
    }

    /// Adopts `candidate` as predecessor and reports whether it joined inside
    /// our interval or replaced a predecessor that left.
    pub(crate) async fn set_predecessor(&self, candidate: &Vnode) {
        let event = {
            let mut state = self.state.write().await;
            // re-check, the state may have moved while replicas were updated
            if !self.accepts_predecessor(&state, candidate) {
                return;
            }

            let reference = state
                .predecessor
                .clone()
                .or_else(|| state.old_predecessor.clone());
            let ev_type = match &reference {
                Some(prev) if !between(&prev.id, self.id(), &candidate.id, false) => {
                    RingEventType::PredecessorLeft
                }
                _ => RingEventType::PredecessorJoined,
            };

            info!("[{}] new predecessor: {}", self.vnode, candidate);
            if state.predecessor.is_some() {
                state.old_predecessor = state.predecessor.take();
            }
            state.predecessor = Some(candidate.clone());

            EventCtx {
                ev_type,
                target: self.vnode.clone(),
                primary_item: Some(candidate.clone()),
                secondary_item: state.old_predecessor.clone(),
                item_list: vec![],
            }
        };
        self.ctx.emit(event);
    }
}

#[cfg(test)]
mod tests {
    use std::iter;

    use async_trait::async_trait;
    use num_bigint::BigUint;

    use super::*;
    use crate::config::Config;
    use crate::transport::{Transport, VnodeHandler};

    fn vnode_at(n: u64, host: &str) -> Vnode {
        Vnode::new(Id::from(BigUint::from(n)), host)
    }

    /// Answers successor queries from a fixed ring, failing the `fail_at`-th.
    struct FlakyRing {
        ring: Vec<Vnode>,
        fail_at: usize,
        queried: parking_lot::Mutex<Vec<Id>>,
    }

    #[async_trait]
    impl Transport for FlakyRing {
        async fn list_vnodes(&self, _host: &str) -> Result<Vec<Vnode>> {
            Ok(self.ring.clone())
        }

        async fn ping(&self, _vnode: &Vnode) -> Result<bool> {
            Ok(true)
        }

        async fn get_predecessor(&self, _vnode: &Vnode) -> Result<Option<Vnode>> {
            Ok(None)
        }

        async fn notify(&self, _dest: &Vnode, _vnode: &Vnode) -> Result<Vec<Vnode>> {
            Ok(vec![])
        }

        async fn find_successors(&self, _vnode: &Vnode, _limit: usize, key: &Id) -> Result<Vec<Vnode>> {
            let mut queried = self.queried.lock();
            queried.push(*key);
            if queried.len() == self.fail_at {
                return Err(Error::Timeout("find_successors"));
            }
            let owner = self
                .ring
                .iter()
                .find(|vnode| vnode.id >= *key)
                .unwrap_or(&self.ring[0]);
            Ok(vec![owner.clone()])
        }

        fn get_vnode_handler(&self, _vnode: &Vnode) -> Option<Arc<dyn VnodeHandler>> {
            None
        }

        fn register(&self, _vnode: &Vnode, _handler: Arc<dyn VnodeHandler>) {}

        fn deregister(&self, _vnode: &Vnode) {}
    }

    #[tokio::test]
    async fn finger_refresh_resumes_where_it_failed() {
        let me = vnode_at(0, "a:1");
        let others = [vnode_at(5, "b:1"), vnode_at(40, "c:1"), vnode_at(300, "d:1")];
        let transport = Arc::new(FlakyRing {
            ring: iter::once(me.clone()).chain(others.clone()).collect(),
            fail_at: 5,
            queried: Default::default(),
        });
        let ctx = Arc::new(RingContext::new(Config::new("a:1"), transport.clone()));
        let local = LocalVnode::new(me.clone(), ctx);

        // offsets 1, 2, 4 and 8 resolve, 16 fails
        assert!(local.fix_finger_table().await.is_err());
        {
            let state = local.state.read().await;
            assert_eq!(
                state.finger[..3],
                [Some(others[0].clone()), Some(others[1].clone()), None]
            );
            assert_eq!(state.last_finger, 1);
            assert_eq!(state.finger_cursor, (4, 2));
        }

        local.fix_finger_table().await.unwrap();
        let queried = transport.queried.lock().clone();
        assert_eq!(queried[5], power_offset(&me.id, 4, ID_BITS));
        // 16 through 512, where the ring wraps back to us
        assert_eq!(queried.len(), 11);

        let state = local.state.read().await;
        let fingers: Vec<Vnode> = state.finger.iter().flatten().cloned().collect();
        assert_eq!(fingers, others.to_vec());
        assert_eq!(state.last_finger, 2);
        assert_eq!(state.finger_cursor, (0, 0));
    }
}
