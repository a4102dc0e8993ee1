use std::fmt;
use std::hash::{Hash, Hasher};

use crate::error::Result;
use crate::hash::Id;
use crate::rpc::chord::PbVnode;

/// A virtual node: one position on the ring, owned by the process at `host`.
#[derive(Debug, Clone)]
pub struct Vnode {
    pub id: Id,
    /// `ip:port` of the owning process.
    pub host: String,
}

impl Vnode {
    pub fn new(id: Id, host: impl Into<String>) -> Self {
        Vnode {
            id,
            host: host.into(),
        }
    }

    pub fn to_protobuf(&self) -> PbVnode {
        PbVnode {
            id: self.id.to_vec(),
            host: self.host.clone(),
        }
    }

    pub fn from_protobuf(pb: &PbVnode) -> Result<Self> {
        Ok(Vnode {
            id: Id::try_from(pb.id.as_slice())?,
            host: pb.host.clone(),
        })
    }
}

// vnodes are identified by id alone
impl PartialEq for Vnode {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Vnode {}

impl Hash for Vnode {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for Vnode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::hash_key;

    #[test]
    fn equality_ignores_host() {
        let id = hash_key(b"vnode");
        assert_eq!(Vnode::new(id, "a:1"), Vnode::new(id, "b:2"));
        assert_ne!(Vnode::new(id, "a:1"), Vnode::new(hash_key(b"other"), "a:1"));
    }

    #[test]
    fn protobuf_rejects_short_ids() {
        let pb = PbVnode {
            id: vec![1, 2, 3],
            host: "a:1".to_owned(),
        };
        assert!(Vnode::from_protobuf(&pb).is_err());

        let vnode = Vnode::new(hash_key(b"vnode"), "a:1");
        let back = Vnode::from_protobuf(&vnode.to_protobuf()).unwrap();
        assert_eq!(back.host, "a:1");
        assert_eq!(back, vnode);
    }
}
