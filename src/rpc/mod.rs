//! Wire format of the network transport. Every frame is one message-type byte
//! followed by a protobuf payload.

pub mod chord {
    include!(concat!(env!("OUT_DIR"), "/chord.rs"));
}

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use prost::Message;

use crate::error::{Error, Result};
use chord::{
    PbAck, PbErr, PbFindSuccessors, PbForward, PbGetPredecessor, PbLeave, PbListVnodes,
    PbListVnodesResp, PbNotify, PbPing, PbVnode,
};

/// Message types known to the base transport. Tag 4 is reserved for join.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgType {
    Ping = 0,
    Ack = 1,
    Err = 2,
    Forward = 3,
    Leave = 5,
    ListVnodes = 6,
    ListVnodesResp = 7,
    FindSuccessors = 8,
    GetPredecessor = 9,
    Vnode = 10,
    Notify = 11,
}

impl TryFrom<u8> for MsgType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        let ty = match value {
            0 => MsgType::Ping,
            1 => MsgType::Ack,
            2 => MsgType::Err,
            3 => MsgType::Forward,
            5 => MsgType::Leave,
            6 => MsgType::ListVnodes,
            7 => MsgType::ListVnodesResp,
            8 => MsgType::FindSuccessors,
            9 => MsgType::GetPredecessor,
            10 => MsgType::Vnode,
            11 => MsgType::Notify,
            other => return Err(Error::UnknownType(other)),
        };
        Ok(ty)
    }
}

/// Handles a message decoded by a third-party [`crate::transport::TransportHook`]
/// and produces the encoded reply frame.
#[async_trait]
pub trait HookHandler: Send + Sync {
    async fn handle(&self, msg: &HookMessage) -> Result<Vec<u8>>;
}

/// A message decoded by a transport hook rather than the base transport.
#[derive(Clone)]
pub struct HookMessage {
    pub msg_type: u8,
    pub data: Vec<u8>,
    /// Set for request messages; replies carry no handler.
    pub handler: Option<Arc<dyn HookHandler>>,
}

impl fmt::Debug for HookMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookMessage")
            .field("msg_type", &self.msg_type)
            .field("len", &self.data.len())
            .field("handler", &self.handler.is_some())
            .finish()
    }
}

/// A decoded frame.
#[derive(Debug, Clone)]
pub enum ChordMsg {
    Ping(PbPing),
    Ack(PbAck),
    Err(PbErr),
    Forward(PbForward),
    Leave(PbLeave),
    ListVnodes(PbListVnodes),
    ListVnodesResp(PbListVnodesResp),
    FindSuccessors(PbFindSuccessors),
    GetPredecessor(PbGetPredecessor),
    Vnode(PbVnode),
    Notify(PbNotify),
    Hooked(HookMessage),
}

impl ChordMsg {
    /// Whether the message is a request the base transport knows how to serve.
    pub fn is_request(&self) -> bool {
        match self {
            ChordMsg::Ping(_)
            | ChordMsg::Leave(_)
            | ChordMsg::ListVnodes(_)
            | ChordMsg::FindSuccessors(_)
            | ChordMsg::GetPredecessor(_)
            | ChordMsg::Notify(_) => true,
            ChordMsg::Hooked(msg) => msg.handler.is_some(),
            _ => false,
        }
    }
}

pub fn encode(msg_type: MsgType, payload: &impl Message) -> Vec<u8> {
    encode_raw(msg_type as u8, payload)
}

/// Encodes a frame with an arbitrary type byte, for hook-defined messages.
pub fn encode_raw(msg_type: u8, payload: &impl Message) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + payload.encoded_len());
    buf.push(msg_type);
    buf.extend_from_slice(&payload.encode_to_vec());
    buf
}

pub fn error_msg(error: impl Into<String>) -> Vec<u8> {
    encode(
        MsgType::Err,
        &PbErr {
            error: error.into(),
        },
    )
}

/// Decodes a frame of one of the base message types. Unknown types come back
/// as [`Error::UnknownType`] so the caller can consult its hooks.
pub fn decode(raw: &[u8]) -> Result<ChordMsg> {
    let (&ty, data) = raw
        .split_first()
        .ok_or_else(|| Error::Parse(format!("data too short: {}", raw.len())))?;

    let msg = match MsgType::try_from(ty)? {
        MsgType::Ping => ChordMsg::Ping(PbPing::decode(data)?),
        MsgType::Ack => ChordMsg::Ack(PbAck::decode(data)?),
        MsgType::Err => ChordMsg::Err(PbErr::decode(data)?),
        MsgType::Forward => ChordMsg::Forward(PbForward::decode(data)?),
        MsgType::Leave => ChordMsg::Leave(PbLeave::decode(data)?),
        MsgType::ListVnodes => ChordMsg::ListVnodes(PbListVnodes::decode(data)?),
        MsgType::ListVnodesResp => ChordMsg::ListVnodesResp(PbListVnodesResp::decode(data)?),
        MsgType::FindSuccessors => ChordMsg::FindSuccessors(PbFindSuccessors::decode(data)?),
        MsgType::GetPredecessor => ChordMsg::GetPredecessor(PbGetPredecessor::decode(data)?),
        MsgType::Vnode => ChordMsg::Vnode(PbVnode::decode(data)?),
        MsgType::Notify => ChordMsg::Notify(PbNotify::decode(data)?),
    };
    Ok(msg)
}
