use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info, warn};
use parking_lot::RwLock;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use super::pool::{RequestHandler, WorkerPool};
use super::{read_frame, write_frame};
use crate::error::{Error, Result};
use crate::hash::Id;
use crate::rpc::chord::{
    PbAck, PbFindSuccessors, PbForward, PbGetPredecessor, PbListVnodesResp, PbNotify, PbPing,
    PbVnode,
};
use crate::rpc::{self, error_msg, ChordMsg, MsgType};
use crate::transport::{HandlerTable, Successors, TransportHook, VnodeHandler};
use crate::vnode::Vnode;

pub(crate) const PROTOCOL_VERSION: i64 = 1;

/// Decodes inbound frames and routes them to the registered vnode handlers.
#[derive(Default)]
pub(crate) struct Dispatcher {
    pub(crate) table: HandlerTable,
    hooks: RwLock<Vec<Arc<dyn TransportHook>>>,
}

impl Dispatcher {
    pub(crate) fn add_hook(&self, hook: Arc<dyn TransportHook>) {
        self.hooks.write().push(hook);
    }

    /// Decodes a frame, falling back to the hooks for unknown types.
    pub(crate) fn decode(&self, raw: &[u8]) -> Result<ChordMsg> {
        match rpc::decode(raw) {
            Err(Error::UnknownType(ty)) => {
                let hooks = self.hooks.read().clone();
                for hook in hooks {
                    match hook.decode(raw) {
                        Err(Error::HookUnknownType(_)) => continue,
                        decoded => return decoded,
                    }
                }
                Err(Error::UnknownType(ty))
            }
            decoded => decoded,
        }
    }

    fn handler(&self, dest: Option<&PbVnode>) -> Result<Arc<dyn VnodeHandler>> {
        let dest = dest.ok_or_else(|| Error::Parse("request without destination".into()))?;
        let dest = Vnode::from_protobuf(dest)?;
        self.table.get(&dest.id).ok_or(Error::HandlerNotFound)
    }

    async fn find_successors(&self, req: &PbFindSuccessors) -> Result<Vec<u8>> {
        let handler = self.handler(req.dest.as_ref())?;
        let key = Id::try_from(req.key.as_slice())?;
        let limit = req.limit.max(0) as usize;
        let reply = match handler.find_successors(&key, limit).await? {
            Successors::Found(vnodes) => vnodes_resp(&vnodes),
            Successors::Forward(next) => rpc::encode(
                MsgType::Forward,
                &PbForward {
                    vnode: Some(next.to_protobuf()),
                },
            ),
        };
        Ok(reply)
    }

    async fn get_predecessor(&self, req: &PbGetPredecessor) -> Result<Vec<u8>> {
        let handler = self.handler(req.dest.as_ref())?;
        // no predecessor travels as an empty vnode
        let pred = handler
            .get_predecessor()
            .await?
            .map(|pred| pred.to_protobuf())
            .unwrap_or_default();
        Ok(rpc::encode(MsgType::Vnode, &pred))
    }

    async fn notify(&self, req: &PbNotify) -> Result<Vec<u8>> {
        let handler = self.handler(req.dest.as_ref())?;
        let vnode = req
            .vnode
            .as_ref()
            .ok_or_else(|| Error::Parse("notify without vnode".into()))?;
        let successors = handler.notify(&Vnode::from_protobuf(vnode)?).await?;
        Ok(vnodes_resp(&successors))
    }

    async fn dispatch(&self, msg: ChordMsg) -> Vec<u8> {
        match msg {
            ChordMsg::Ping(_) => rpc::encode(
                MsgType::Ping,
                &PbPing {
                    version: PROTOCOL_VERSION,
                },
            ),
            ChordMsg::Leave(_) => rpc::encode(
                MsgType::Ack,
                &PbAck {
                    version: PROTOCOL_VERSION,
                    ok: true,
                },
            ),
            ChordMsg::ListVnodes(_) => vnodes_resp(&self.table.vnodes(None)),
            ChordMsg::FindSuccessors(req) => self
                .find_successors(&req)
                .await
                .unwrap_or_else(|e| error_msg(format!("FindSuccessorsHandler - {}", e))),
            ChordMsg::GetPredecessor(req) => self
                .get_predecessor(&req)
                .await
                .unwrap_or_else(|e| error_msg(format!("GetPredecessorHandler - {}", e))),
            ChordMsg::Notify(req) => self
                .notify(&req)
                .await
                .unwrap_or_else(|e| error_msg(format!("NotifyHandler - {}", e))),
            ChordMsg::Hooked(msg) => match &msg.handler {
                Some(handler) => handler
                    .handle(&msg)
                    .await
                    .unwrap_or_else(|e| error_msg(e.to_string())),
                None => error_msg("invalid request, unknown handler"),
            },
            _ => error_msg("invalid request, unknown handler"),
        }
    }
}

#[async_trait]
impl RequestHandler for Dispatcher {
    async fn handle(&self, frame: Vec<u8>) -> Vec<u8> {
        let msg = match self.decode(&frame) {
            Ok(msg) => msg,
            Err(e) => return error_msg(format!("failed to decode request - {}", e)),
        };
        if !msg.is_request() {
            return error_msg("invalid request, unknown handler");
        }
        self.dispatch(msg).await
    }
}

fn vnodes_resp(vnodes: &[Vnode]) -> Vec<u8> {
    rpc::encode(
        MsgType::ListVnodesResp,
        &PbListVnodesResp {
            vnodes: vnodes.iter().map(Vnode::to_protobuf).collect(),
        },
    )
}

/// Accepts connections until `stop` flips and feeds their frames to the pool.
pub(crate) async fn serve(
    listener: TcpListener,
    pool: Arc<WorkerPool>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("accepted connection from {}", peer);
                    tokio::spawn(connection(stream, Arc::clone(&pool)));
                }
                Err(e) => warn!("failed to accept connection: {}", e),
            },
            _ = stop.changed() => break,
        }
    }
    info!("listener stopped");
}

async fn connection(mut stream: TcpStream, pool: Arc<WorkerPool>) {
    loop {
        let frame = match read_frame(&mut stream).await {
            Ok(Some(frame)) => frame,
            Ok(None) => return,
            Err(e) => {
                warn!("dropping connection: {}", e);
                return;
            }
        };

        let reply = match pool.submit(frame).await {
            Ok(reply) => reply,
            Err(e) => error_msg(e.to_string()),
        };

        if let Err(e) = write_frame(&mut stream, &reply).await {
            warn!("failed to send reply: {}", e);
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::hash_key;
    use crate::rpc::chord::PbListVnodes;

    struct Fixed {
        succ: Vnode,
    }

    #[async_trait]
    impl VnodeHandler for Fixed {
        async fn find_successors(&self, _key: &Id, _limit: usize) -> Result<Successors> {
            Ok(Successors::Forward(self.succ.clone()))
        }

        async fn find_remote_successors(&self, _limit: usize) -> Result<Vec<Vnode>> {
            Ok(vec![])
        }

        async fn get_predecessor(&self) -> Result<Option<Vnode>> {
            Ok(None)
        }

        async fn notify(&self, _vnode: &Vnode) -> Result<Vec<Vnode>> {
            Ok(vec![self.succ.clone()])
        }
    }

    fn dispatcher() -> (Dispatcher, Vnode) {
        let dispatcher = Dispatcher::default();
        let vnode = Vnode::new(hash_key(b"b"), "127.0.0.1:2");
        let succ = Vnode::new(hash_key(b"c"), "127.0.0.1:3");
        dispatcher.table.insert(&vnode, Arc::new(Fixed { succ }));
        (dispatcher, vnode)
    }

    fn error_of(reply: &[u8]) -> String {
        match rpc::decode(reply).unwrap() {
            ChordMsg::Err(err) => err.error,
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn rejects_undecodable_and_response_frames() {
        let (dispatcher, _) = dispatcher();

        let reply = dispatcher.handle(vec![0x42]).await;
        assert!(error_of(&reply).starts_with("failed to decode request"));

        let reply = dispatcher
            .handle(rpc::encode(MsgType::Ack, &PbAck::default()))
            .await;
        assert_eq!(error_of(&reply), "invalid request, unknown handler");
    }

    #[tokio::test]
    async fn unknown_destination() {
        let (dispatcher, _) = dispatcher();
        let stranger = Vnode::new(hash_key(b"z"), "127.0.0.1:9");
        let req = PbGetPredecessor {
            dest: Some(stranger.to_protobuf()),
        };

        let reply = dispatcher
            .handle(rpc::encode(MsgType::GetPredecessor, &req))
            .await;
        assert!(error_of(&reply).ends_with("local vnode handler not found"));
    }

    #[tokio::test]
    async fn answers_base_requests() {
        let (dispatcher, vnode) = dispatcher();

        let reply = dispatcher
            .handle(rpc::encode(MsgType::ListVnodes, &PbListVnodes {}))
            .await;
        match rpc::decode(&reply).unwrap() {
            ChordMsg::ListVnodesResp(resp) => assert_eq!(resp.vnodes, vec![vnode.to_protobuf()]),
            other => panic!("unexpected {:?}", other),
        }

        let req = PbGetPredecessor {
            dest: Some(vnode.to_protobuf()),
        };
        match rpc::decode(&dispatcher.handle(rpc::encode(MsgType::GetPredecessor, &req)).await)
            .unwrap()
        {
            ChordMsg::Vnode(pred) => assert!(pred.id.is_empty()),
            other => panic!("unexpected {:?}", other),
        }

        let req = PbFindSuccessors {
            key: hash_key(b"key").to_vec(),
            dest: Some(vnode.to_protobuf()),
            limit: 2,
        };
        match rpc::decode(&dispatcher.handle(rpc::encode(MsgType::FindSuccessors, &req)).await)
            .unwrap()
        {
            ChordMsg::Forward(fwd) => {
                assert_eq!(fwd.vnode.unwrap().id, hash_key(b"c").to_vec())
            }
            other => panic!("unexpected {:?}", other),
        }

        let reply = dispatcher
            .handle(rpc::encode(MsgType::Leave, &rpc::chord::PbLeave::default()))
            .await;
        assert!(matches!(rpc::decode(&reply).unwrap(), ChordMsg::Ack(ack) if ack.ok));
    }
}
