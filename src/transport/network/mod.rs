//! TCP transport. Each call opens a connection to the destination host, sends
//! one length-prefixed frame and waits for the reply frame. Inbound frames are
//! answered by the [`pool::WorkerPool`].

pub mod pool;
mod server;

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use log::info;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;

use self::pool::WorkerPool;
use self::server::{Dispatcher, PROTOCOL_VERSION};
use super::{Successors, Transport, TransportHook, VnodeHandler, MAX_FORWARD_HOPS};
use crate::config::TransportConfig;
use crate::error::{Error, Result};
use crate::hash::Id;
use crate::rpc::chord::{
    PbFindSuccessors, PbGetPredecessor, PbListVnodes, PbListVnodesResp, PbNotify, PbPing,
};
use crate::rpc::{self, ChordMsg, MsgType};
use crate::vnode::Vnode;

const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

pub(crate) async fn write_frame(stream: &mut TcpStream, frame: &[u8]) -> Result<()> {
    stream.write_all(&(frame.len() as u32).to_be_bytes()).await?;
    stream.write_all(frame).await?;
    stream.flush().await?;
    Ok(())
}

/// Reads one frame. A connection closed before a new frame starts yields `None`.
pub(crate) async fn read_frame(stream: &mut TcpStream) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(Error::Parse(format!(
            "frame too large: {} bytes (max {})",
            len, MAX_FRAME_SIZE
        )));
    }

    let mut frame = vec![0u8; len];
    stream.read_exact(&mut frame).await?;
    Ok(Some(frame))
}

pub struct NetworkTransport {
    config: TransportConfig,
    local_addr: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    pool: Arc<WorkerPool>,
    stop: watch::Sender<bool>,
}

impl NetworkTransport {
    /// Binds the listener and starts the worker pool.
    pub async fn bind(config: TransportConfig) -> Result<Arc<Self>> {
        let listener = TcpListener::bind(config.listen_addr()?).await?;
        let local_addr = listener.local_addr()?;

        let dispatcher = Arc::new(Dispatcher::default());
        let pool = Arc::new(WorkerPool::start(&config, dispatcher.clone()));
        let (stop, stop_rx) = watch::channel(false);
        tokio::spawn(server::serve(listener, Arc::clone(&pool), stop_rx));

        info!("network transport listening on {}", local_addr);
        Ok(Arc::new(NetworkTransport {
            config,
            local_addr,
            dispatcher,
            pool,
            stop,
        }))
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn workers(&self) -> usize {
        self.pool.workers()
    }

    /// Stops accepting connections and tears the worker pool down.
    pub fn shutdown(&self) {
        let _ = self.stop.send(true);
        self.pool.shutdown();
        info!("network transport on {} shut down", self.local_addr);
    }

    /// Sends an arbitrary frame to `host` and decodes the reply, consulting the
    /// registered hooks for message types the base transport does not know.
    pub async fn send_raw(&self, host: &str, frame: Vec<u8>) -> Result<ChordMsg> {
        self.request(host, "send_raw", frame).await
    }

    async fn request(&self, host: &str, op: &'static str, frame: Vec<u8>) -> Result<ChordMsg> {
        match timeout(self.config.client_timeout, self.exchange(host, op, &frame))
            .await
            .map_err(|_| Error::Timeout(op))??
        {
            ChordMsg::Err(err) => Err(Error::Remote(err.error)),
            msg => Ok(msg),
        }
    }

    async fn exchange(&self, host: &str, op: &'static str, frame: &[u8]) -> Result<ChordMsg> {
        let socket_timeout = self.config.socket_timeout;
        let mut stream = timeout(socket_timeout, TcpStream::connect(host))
            .await
            .map_err(|_| Error::Timeout(op))??;
        timeout(socket_timeout, write_frame(&mut stream, frame))
            .await
            .map_err(|_| Error::Timeout(op))??;
        let reply = timeout(socket_timeout, read_frame(&mut stream))
            .await
            .map_err(|_| Error::Timeout(op))??
            .ok_or_else(|| Error::Remote(format!("{} - connection closed by {}", op, host)))?;
        self.dispatcher.decode(&reply)
    }
}

fn vnodes_from(resp: &PbListVnodesResp) -> Result<Vec<Vnode>> {
    resp.vnodes.iter().map(Vnode::from_protobuf).collect()
}

#[async_trait]
impl Transport for NetworkTransport {
    async fn list_vnodes(&self, host: &str) -> Result<Vec<Vnode>> {
        let frame = rpc::encode(MsgType::ListVnodes, &PbListVnodes {});
        match self.request(host, "list_vnodes", frame).await? {
            ChordMsg::ListVnodesResp(resp) => vnodes_from(&resp),
            _ => Err(Error::UnexpectedResponse("list_vnodes")),
        }
    }

    async fn ping(&self, vnode: &Vnode) -> Result<bool> {
        let frame = rpc::encode(
            MsgType::Ping,
            &PbPing {
                version: PROTOCOL_VERSION,
            },
        );
        match self.request(&vnode.host, "ping", frame).await? {
            ChordMsg::Ping(_) => Ok(true),
            _ => Err(Error::UnexpectedResponse("ping")),
        }
    }

    async fn get_predecessor(&self, vnode: &Vnode) -> Result<Option<Vnode>> {
        let frame = rpc::encode(
            MsgType::GetPredecessor,
            &PbGetPredecessor {
                dest: Some(vnode.to_protobuf()),
            },
        );
        match self.request(&vnode.host, "get_predecessor", frame).await? {
            ChordMsg::Vnode(pred) if pred.id.is_empty() => Ok(None),
            ChordMsg::Vnode(pred) => Ok(Some(Vnode::from_protobuf(&pred)?)),
            _ => Err(Error::UnexpectedResponse("get_predecessor")),
        }
    }

    async fn notify(&self, dest: &Vnode, vnode: &Vnode) -> Result<Vec<Vnode>> {
        let frame = rpc::encode(
            MsgType::Notify,
            &PbNotify {
                dest: Some(dest.to_protobuf()),
                vnode: Some(vnode.to_protobuf()),
            },
        );
        match self.request(&dest.host, "notify", frame).await? {
            ChordMsg::ListVnodesResp(resp) => vnodes_from(&resp),
            _ => Err(Error::UnexpectedResponse("notify")),
        }
    }

    async fn find_successors(&self, vnode: &Vnode, limit: usize, key: &Id) -> Result<Vec<Vnode>> {
        let mut target = vnode.clone();
        for _ in 0..MAX_FORWARD_HOPS {
            // forwards to our own vnodes are answered in place
            if let Some(handler) = self.dispatcher.table.get(&target.id) {
                match handler.find_successors(key, limit).await? {
                    Successors::Found(successors) => return Ok(successors),
                    Successors::Forward(next) => {
                        target = next;
                        continue;
                    }
                }
            }

            let frame = rpc::encode(
                MsgType::FindSuccessors,
                &PbFindSuccessors {
                    key: key.to_vec(),
                    dest: Some(target.to_protobuf()),
                    limit: limit as i32,
                },
            );
            match self.request(&target.host, "find_successors", frame).await? {
                ChordMsg::ListVnodesResp(resp) => return vnodes_from(&resp),
                ChordMsg::Forward(fwd) => {
                    let next = fwd
                        .vnode
                        .ok_or(Error::UnexpectedResponse("find_successors"))?;
                    target = Vnode::from_protobuf(&next)?;
                }
                _ => return Err(Error::UnexpectedResponse("find_successors")),
            }
        }
        Err(Error::ForwardLoop(key.to_string()))
    }

    fn get_vnode_handler(&self, vnode: &Vnode) -> Option<Arc<dyn VnodeHandler>> {
        self.dispatcher.table.get(&vnode.id)
    }

    fn register(&self, vnode: &Vnode, handler: Arc<dyn VnodeHandler>) {
        self.dispatcher.table.insert(vnode, handler);
    }

    fn deregister(&self, vnode: &Vnode) {
        self.dispatcher.table.remove(&vnode.id);
    }

    fn register_hook(&self, hook: Arc<dyn TransportHook>) {
        self.dispatcher.add_hook(hook);
    }
}
