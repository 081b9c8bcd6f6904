//! Key codec for the command log's backing store.
//!
//! Two keyspaces share a single ordered byte space: internal properties
//! (prefix `0x00`) and log entries (prefix `0x01` followed by the index
//! as a big-endian u64, so byte order matches numeric order). The
//! prefixes keep the ranges disjoint: a scan over the log prefix yields
//! exactly the log, in index order.

use std::ops::Range;

use byteorder::{BigEndian, ByteOrder, ReadBytesExt};

const PROP_PREFIX: u8 = 0x00;
const LOG_PREFIX: u8 = 0x01;

/// Reserved property: index of the last appended entry.
pub const LAST_LOG_INDEX: &str = "last_log_index";
/// Reserved property: index of the latest `Configure` entry (a cache of
/// the chain head; verified against the chain on open).
pub const CLUSTER_CONFIG_INDEX: &str = "cluster_config_index";

/// A decoded key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Key {
    Property(String),
    Log(u64),
}

/// Encode an internal-property key.
pub fn prop_key(name: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + name.len());
    key.push(PROP_PREFIX);
    key.extend_from_slice(name.as_bytes());
    key
}

/// Encode a log-entry key.
pub fn log_key(index: u64) -> [u8; 9] {
    let mut key = [0u8; 9];
    key[0] = LOG_PREFIX;
    BigEndian::write_u64(&mut key[1..], index);
    key
}

/// Byte range covering every log key and nothing else.
pub fn log_range() -> Range<Vec<u8>> {
    vec![LOG_PREFIX]..vec![LOG_PREFIX + 1]
}

/// Byte range covering log keys with `start <= index < end`.
pub fn log_span(start: u64, end: u64) -> Range<Vec<u8>> {
    log_key(start).to_vec()..log_key(end).to_vec()
}

/// Decode a key produced by this codec.
pub fn decode(key: &[u8]) -> Option<Key> {
    match key.split_first() {
        Some((&PROP_PREFIX, name)) => {
            Some(Key::Property(String::from_utf8(name.to_vec()).ok()?))
        }
        Some((&LOG_PREFIX, mut index)) if index.len() == 8 => {
            Some(Key::Log(index.read_u64::<BigEndian>().ok()?))
        }
        _ => None,
    }
}
