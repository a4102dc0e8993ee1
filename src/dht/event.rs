use async_trait::async_trait;

use crate::vnode::Vnode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingEventType {
    /// A new vnode took over part of our predecessor interval.
    PredecessorJoined,
    /// Our predecessor went away and the interval widened.
    PredecessorLeft,
    /// The cross-host replica set of a vnode changed.
    ReplicasChanged,
}

/// Describes a ring topology change observed by one local vnode.
#[derive(Debug, Clone)]
pub struct EventCtx {
    pub ev_type: RingEventType,
    /// The local vnode the event happened on.
    pub target: Vnode,
    /// New predecessor for predecessor events.
    pub primary_item: Option<Vnode>,
    /// Previous predecessor for predecessor events.
    pub secondary_item: Option<Vnode>,
    /// New replica set for `ReplicasChanged`.
    pub item_list: Vec<Vnode>,
}

/// Subscriber to ring events. Every hook gets its own task per event, so a
/// slow hook does not hold up stabilization.
#[async_trait]
pub trait DelegateHook: Send + Sync {
    async fn emit_event(&self, ctx: EventCtx);
}
