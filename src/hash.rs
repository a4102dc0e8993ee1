//! Identifier space of the ring: 160-bit SHA1 ids and the modular arithmetic
//! used to order, route and build finger tables over them.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use num_bigint::BigUint;
use rand::Rng;
use sha1::{Digest, Sha1};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::vnode::Vnode;

/// Width of the identifier space in bits.
pub const ID_BITS: usize = 160;
/// Width of an identifier in bytes.
pub const ID_LEN: usize = ID_BITS / 8;

/// A point on the ring, stored big-endian so byte order equals ring order.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Id([u8; ID_LEN]);

impl Id {
    pub const fn from_bytes(bytes: [u8; ID_LEN]) -> Self {
        Id(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }
}

impl TryFrom<&[u8]> for Id {
    type Error = Error;

    fn try_from(bytes: &[u8]) -> Result<Self> {
        let array: [u8; ID_LEN] = bytes.try_into().map_err(|_| {
            Error::InvalidId(format!("expected {} bytes, got {}", ID_LEN, bytes.len()))
        })?;
        Ok(Id(array))
    }
}

impl From<BigUint> for Id {
    fn from(value: BigUint) -> Self {
        let value = value % ring_size();
        let digits = value.to_bytes_be();
        let mut bytes = [0u8; ID_LEN];
        bytes[ID_LEN - digits.len()..].copy_from_slice(&digits);
        Id(bytes)
    }
}

impl From<&Id> for BigUint {
    fn from(id: &Id) -> Self {
        BigUint::from_bytes_be(&id.0)
    }
}

impl FromStr for Id {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|e| Error::InvalidId(e.to_string()))?;
        Id::try_from(bytes.as_slice())
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", self)
    }
}

fn ring_size() -> BigUint {
    BigUint::from(1u8) << ID_BITS
}

/// SHA1 of an arbitrary key. External code hashes its keys with this so that
/// lookups land in the same id space as the ring's vnodes.
pub fn hash_key(key: &[u8]) -> Id {
    let mut hasher = Sha1::new();
    hasher.update(key);
    digest_to_id(hasher)
}

/// Id of the `index`-th vnode hosted on `hostname`.
pub fn vnode_id(hostname: &str, index: u16) -> Id {
    let mut hasher = Sha1::new();
    hasher.update(hostname.as_bytes());
    hasher.update(index.to_be_bytes());
    digest_to_id(hasher)
}

fn digest_to_id(hasher: Sha1) -> Id {
    let mut bytes = [0u8; ID_LEN];
    bytes.copy_from_slice(&hasher.finalize());
    Id(bytes)
}

/// Reports whether `key` lies in `(a, b)` walking clockwise, or in `(a, b]`
/// when `right_inclusive` is set. Equal endpoints describe an empty interval.
pub fn between(a: &Id, b: &Id, key: &Id, right_inclusive: bool) -> bool {
    if a > b {
        // interval wraps past zero
        if right_inclusive {
            return a < key || b >= key;
        }
        return a < key || b > key;
    }

    if right_inclusive {
        a < key && b >= key
    } else {
        a < key && b > key
    }
}

/// Clockwise distance from `a` to `b`.
pub fn distance(a: &Id, b: &Id) -> BigUint {
    let a_int = BigUint::from(a);
    let b_int = BigUint::from(b);
    match a.cmp(b) {
        std::cmp::Ordering::Equal => BigUint::default(),
        std::cmp::Ordering::Less => b_int - a_int,
        std::cmp::Ordering::Greater => ring_size() - a_int + b_int,
    }
}

/// Computes `(id + 2^exp) mod 2^bits`.
pub fn power_offset(id: &Id, exp: usize, bits: usize) -> Id {
    let sum = BigUint::from(id) + (BigUint::from(1u8) << exp);
    Id::from(sum % (BigUint::from(1u8) << bits))
}

/// Returns the last vnode of a sorted list whose id is below `key`, wrapping
/// to the last vnode when the key precedes every id.
pub fn nearest_vnode_to_key<'a>(vnodes: &'a [Vnode], key: &Id) -> Option<&'a Vnode> {
    vnodes
        .iter()
        .rev()
        .find(|vnode| vnode.id < *key)
        .or_else(|| vnodes.last())
}

/// Random delay before the next stabilization pass.
pub fn rand_stabilize(config: &Config) -> Duration {
    if config.stabilize_max <= config.stabilize_min {
        return config.stabilize_min;
    }
    rand::thread_rng().gen_range(config.stabilize_min..=config.stabilize_max)
}

#[cfg(test)]
fn id_from_u64(value: u64) -> Id {
    Id::from(BigUint::from(value))
}

#[test]
fn test_hash_key() {
    let hash = hash_key(b"key");
    let hash_retry = hash_key(b"key");

    assert_eq!(hash, hash_retry);
    assert_ne!(hash, hash_key(b"other key"));
    assert_eq!(
        hash_key(b"").to_string(),
        "da39a3ee5e6b4b0d3255bfef95601890afd80709"
    );
}

#[test]
fn test_vnode_id() {
    assert_eq!(vnode_id("host:1", 0), vnode_id("host:1", 0));
    assert_ne!(vnode_id("host:1", 0), vnode_id("host:1", 1));
    assert_ne!(vnode_id("host:1", 0), vnode_id("host:2", 0));
}

#[test]
fn test_id_parse() -> Result<()> {
    let id = hash_key(b"parse me");
    let parsed: Id = id.to_string().parse()?;
    assert_eq!(id, parsed);

    assert!("abc".parse::<Id>().is_err());
    assert!("zz".repeat(ID_LEN).parse::<Id>().is_err());
    assert!(Id::try_from(&[1u8, 2, 3][..]).is_err());
    Ok(())
}

#[test]
fn test_between() {
    let (one, five, nine) = (id_from_u64(1), id_from_u64(5), id_from_u64(9));

    assert!(between(&one, &nine, &five, false));
    assert!(!between(&one, &nine, &nine, false));
    assert!(between(&one, &nine, &nine, true));
    assert!(!between(&one, &nine, &one, true));
    assert!(!between(&five, &nine, &one, true));

    // wrapped interval (9, 1)
    assert!(between(&nine, &one, &id_from_u64(0), false));
    assert!(between(&nine, &one, &Id::from_bytes([0xff; ID_LEN]), false));
    assert!(!between(&nine, &one, &five, false));
    assert!(!between(&nine, &one, &one, false));
    assert!(between(&nine, &one, &one, true));

    // identical ids describe an empty interval
    assert!(!between(&five, &five, &five, false));
    assert!(!between(&five, &five, &one, false));
    assert!(!between(&five, &five, &nine, true));
}

#[test]
fn test_distance() {
    let (two, seven) = (id_from_u64(2), id_from_u64(7));

    assert_eq!(distance(&two, &two), BigUint::default());
    assert_eq!(distance(&two, &seven), BigUint::from(5u8));
    assert_eq!(distance(&seven, &two), ring_size() - BigUint::from(5u8));
}

#[test]
fn test_power_offset() {
    let zero = Id::default();
    assert_eq!(power_offset(&zero, 0, ID_BITS), id_from_u64(1));
    assert_eq!(power_offset(&zero, 10, ID_BITS), id_from_u64(1024));

    // wraps modulo 2^160 and stays 20 bytes wide
    let max = Id::from_bytes([0xff; ID_LEN]);
    assert_eq!(power_offset(&max, 0, ID_BITS), zero);
    assert_eq!(power_offset(&max, 1, ID_BITS), id_from_u64(1));
    assert_eq!(power_offset(&max, 1, ID_BITS).as_bytes().len(), ID_LEN);
}

#[test]
fn test_nearest_vnode_to_key() {
    let vnodes: Vec<Vnode> = [10u64, 20, 30]
        .iter()
        .map(|id| Vnode::new(id_from_u64(*id), "host:1"))
        .collect();

    let nearest = |key: u64| nearest_vnode_to_key(&vnodes, &id_from_u64(key)).map(|v| v.id);

    assert_eq!(nearest(15), Some(id_from_u64(10)));
    assert_eq!(nearest(20), Some(id_from_u64(10)));
    assert_eq!(nearest(21), Some(id_from_u64(20)));
    assert_eq!(nearest(99), Some(id_from_u64(30)));
    // below every id wraps to the last vnode
    assert_eq!(nearest(5), Some(id_from_u64(30)));
    assert_eq!(nearest(10), Some(id_from_u64(30)));
    assert_eq!(nearest_vnode_to_key(&[], &id_from_u64(1)), None);
}

#[test]
fn test_rand_stabilize() {
    let mut config = Config::new("host:1");
    config.stabilize_min = Duration::from_millis(100);
    config.stabilize_max = Duration::from_millis(200);
    for _ in 0..50 {
        let delay = rand_stabilize(&config);
        assert!(delay >= config.stabilize_min && delay <= config.stabilize_max);
    }

    config.stabilize_max = config.stabilize_min;
    assert_eq!(rand_stabilize(&config), config.stabilize_min);
}
