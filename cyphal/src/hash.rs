//! Cyphal compact data-type hash.
//!
//! Maps a dotted data-type name `root[.subroot].tail.major[.minor]` to a
//! 64-bit value with group-sortable semantics: names sharing a root sort
//! together, names additionally sharing a subroot sort together within
//! that group.

use alloc::string::String;
use alloc::vec::Vec;

use crate::crc::crc32c;
use crate::types::DatatypeHash;

/// Computes the data-type hash for a dotted name such as
/// `"uavcan.node.Heartbeat.1.0"`. Returns `0` if the name has fewer than
/// three meaningful components (root, tail, major at minimum).
pub fn datatype_hash(name: &str) -> DatatypeHash {
    let parts: Vec<&str> = name.split('.').collect();
    if parts.is_empty() {
        return 0;
    }

    // Drop the trailing minor-version component.
    let rem = &parts[..parts.len() - 1];
    if rem.len() < 3 {
        return 0;
    }

    let major: u8 = rem[rem.len() - 1].parse().unwrap_or(0);
    let rem2 = &rem[..rem.len() - 1];

    let (root, subroot, tail): (&str, &str, String) = if rem2.len() >= 3 {
        (rem2[0], rem2[1], rem2[2..].join("."))
    } else {
        (rem2[0], "", String::from(rem2[1]))
    };

    let mut root_buf = Vec::with_capacity(root.len() + 4);
    root_buf.extend_from_slice(root.as_bytes());
    root_buf.extend_from_slice(b"cvo0");
    let root_hash = crc32c(&root_buf);

    let sub_hash = crc32c(subroot.as_bytes()) & 0xFFF;
    let tail_hash = crc32c(tail.as_bytes()) & 0xFFF;

    ((root_hash as u64) << 32) | ((sub_hash as u64) << 20) | ((tail_hash as u64) << 8) | major as u64
}
