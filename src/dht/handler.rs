use std::iter;

use async_trait::async_trait;

use super::vnode::{LocalVnode, VnodeState};
use crate::error::{Error, Result};
use crate::hash::{between, Id};
use crate::transport::{Successors, VnodeHandler};
use crate::vnode::Vnode;

impl LocalVnode {
    /// Ourselves followed by our successors.
    fn self_and_successors(&self, state: &VnodeState, limit: usize) -> Vec<Vnode> {
        iter::once(self.vnode.clone())
            .chain(
                state
                    .successors
                    .iter()
                    .filter(|succ| succ.id != self.vnode.id)
                    .cloned(),
            )
            .take(limit)
            .collect()
    }
}

#[async_trait]
impl VnodeHandler for LocalVnode {
    /// A key equal to our own id is ours, so the answer starts with us.
    async fn find_successors(&self, key: &Id, limit: usize) -> Result<Successors> {
        let state = self.state.read().await;
        let succ = state
            .successors
            .first()
            .ok_or_else(|| Error::NoSuccessors(self.vnode.to_string()))?;

        // alone on the ring, we own everything
        if succ.id == self.vnode.id {
            return Ok(Successors::Found(self.self_and_successors(&state, limit)));
        }

        if between(&self.vnode.id, &succ.id, key, true) {
            return Ok(Successors::Found(
                state.successors.iter().take(limit).cloned().collect(),
            ));
        }

        let next = self.closest_preceding_finger(&state, key);
        if next.id == self.vnode.id {
            return Ok(Successors::Found(self.self_and_successors(&state, limit)));
        }
        Ok(Successors::Forward(next))
    }

    async fn find_remote_successors(&self, limit: usize) -> Result<Vec<Vnode>> {
        let state = self.state.read().await;
        Ok(state.remote_successors.iter().take(limit).cloned().collect())
    }

    async fn get_predecessor(&self) -> Result<Option<Vnode>> {
        Ok(self.state.read().await.predecessor.clone())
    }

    async fn notify(&self, vnode: &Vnode) -> Result<Vec<Vnode>> {
        let accepted = {
            let state = self.state.read().await;
            self.accepts_predecessor(&state, vnode)
        };

        if accepted {
            self.update_remote_successors().await;
            self.set_predecessor(vnode).await;
        }

        Ok(self.state.read().await.successors.clone())
    }
}
