//! Deterministic link-local addresses derived from public keys.
//!
//! Every peer gets a stable IPv6 link-local address inside `fe80::/64` and
//! an IPv4 link-local address inside `169.254.0.0/16`, both computed from
//! its public key. Peers can therefore address each other before any
//! configuration has been exchanged.

use std::hash::Hasher;
use std::net::{Ipv4Addr, Ipv6Addr};

use siphasher::sip::SipHasher24;

use crate::key::Key;

/// Domain-separation key for the address hash. Changing it would renumber
/// every mesh, so it is fixed for the lifetime of the protocol.
const ADDR_HASH_KEY: [u8; 16] = [
    0x67, 0x67, 0x2c, 0x05, 0xd1, 0x3e, 0x11, 0x94, 0xbb, 0x38, 0x91, 0xff, 0x4f, 0x80, 0xb3,
    0x97,
];

/// Prefix length of [`Key::ipv6_address`].
pub const IPV6_PREFIX_LEN: u8 = 64;

/// Prefix length of [`Key::ipv4_address`].
pub const IPV4_PREFIX_LEN: u8 = 16;

impl Key {
    fn addr_hash(&self) -> [u8; 8] {
        let mut hash = SipHasher24::new_with_key(&ADDR_HASH_KEY);
        hash.write(self.as_bytes());

        hash.finish().to_be_bytes()
    }

    /// Deterministic IPv6 link-local address (`fe80::/64`) of this key.
    pub fn ipv6_address(&self) -> Ipv6Addr {
        let h = self.addr_hash();

        Ipv6Addr::new(
            0xfe80,
            0,
            0,
            0,
            u16::from_be_bytes([h[0], h[1]]),
            u16::from_be_bytes([h[2], h[3]]),
            u16::from_be_bytes([h[4], h[5]]),
            u16::from_be_bytes([h[6], h[7]]),
        )
    }

    /// Deterministic IPv4 link-local address (`169.254.0.0/16`) of this key.
    ///
    /// The third octet avoids the reserved values 0 and 255 so the result
    /// never falls into 169.254.0.0/24 or 169.254.255.0/24 (RFC 3927 §2.1).
    pub fn ipv4_address(&self) -> Ipv4Addr {
        let h = self.addr_hash();

        let x = match h[0] {
            0 => 1,
            255 => 254,
            b => b,
        };

        Ipv4Addr::new(169, 254, x, h[1])
    }
}
