//! BEP-42: DHT security extension.
//!
//! Node IDs are bound to the node's external IP address: the first 21 bits
//! must equal a CRC32C over the masked address mixed with a 3-bit nonce,
//! and the last byte carries the nonce. This limits how many valid IDs an
//! attacker controls per address.
//!
//! [BEP-42]: http://bittorrent.org/beps/bep_0042.html

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use rand::Rng as _;

use super::node::NodeId;

/// IPv4 mask applied before hashing.
pub const IPV4_MASK: u32 = 0x030f_3fff;

/// IPv6 mask applied to the high 64 bits before hashing.
pub const IPV6_MASK: u64 = 0x0103_070f_1f3f_7fff;

/// Derives a compliant node ID for `ip` with fresh randomness.
pub fn generate_node_id(ip: IpAddr) -> NodeId {
    generate_node_id_with(ip, rand::rng().random())
}

/// Derives a compliant node ID for `ip` using the nonce byte `rand`.
///
/// Only the low 3 bits of `rand` enter the hash; the full byte ends up as
/// the last byte of the ID. Local-network addresses are exempt and get a
/// random ID.
pub fn generate_node_id_with(ip: IpAddr, rand: u8) -> NodeId {
    if is_local_network(&ip) {
        return NodeId::generate();
    }

    let crc = ip_crc(ip, rand & 0x07);

    let mut id = [0u8; 20];
    rand::rng().fill(&mut id);

    // first 21 bits from the hash, the rest stays random
    id[0] = (crc >> 24) as u8;
    id[1] = (crc >> 16) as u8;
    id[2] = (id[2] & 0x07) | ((crc >> 8) as u8 & 0xf8);
    id[19] = rand;

    NodeId(id)
}

/// Checks whether `id` is a valid derivation for `ip`.
///
/// Local-network addresses always pass.
pub fn verify_node_id(id: &NodeId, ip: IpAddr) -> bool {
    if is_local_network(&ip) {
        return true;
    }

    let nonce = id.0[19] & 0x07;
    let crc = ip_crc(ip, nonce);

    id.0[0] == (crc >> 24) as u8
        && id.0[1] == (crc >> 16) as u8
        && (id.0[2] & 0xf8) == ((crc >> 8) as u8 & 0xf8)
}

fn ip_crc(ip: IpAddr, nonce: u8) -> u32 {
    match ip {
        IpAddr::V4(v4) => {
            let masked = (u32::from(v4) & IPV4_MASK) | (u32::from(nonce) << 29);
            crc32c::crc32c(&masked.to_be_bytes())
        }
        IpAddr::V6(v6) => {
            let octets = v6.octets();
            let mut high = [0u8; 8];
            high.copy_from_slice(&octets[..8]);
            let masked = (u64::from_be_bytes(high) & IPV6_MASK) | (u64::from(nonce) << 61);
            crc32c::crc32c(&masked.to_be_bytes())
        }
    }
}

/// Local and private ranges are exempt from ID enforcement.
pub fn is_local_network(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_local_v4(v4),
        IpAddr::V6(v6) => is_local_v6(v6),
    }
}

fn is_local_v4(ip: &Ipv4Addr) -> bool {
    ip.is_private() || ip.is_loopback() || ip.is_link_local() || ip.is_unspecified()
}

fn is_local_v6(ip: &Ipv6Addr) -> bool {
    if ip.is_loopback() || ip.is_unspecified() {
        return true;
    }

    let segments = ip.segments();
    // link-local fe80::/10
    if segments[0] & 0xffc0 == 0xfe80 {
        return true;
    }
    // unique local fc00::/7
    segments[0] & 0xfe00 == 0xfc00
}

#[cfg(test)]
mod tests {
    use super::*;

    // vectors from the BEP-42 reference table
    #[test]
    fn test_derivation_vector_1() {
        let ip = IpAddr::V4(Ipv4Addr::new(124, 31, 75, 21));
        let id = generate_node_id_with(ip, 1);

        assert_eq!(id.0[0], 0x5f);
        assert_eq!(id.0[1], 0xbf);
        assert_eq!(id.0[2] & 0xf8, 0xb8);
        assert_eq!(id.0[19], 0x01);
        assert!(verify_node_id(&id, ip));
    }

    #[test]
    fn test_derivation_vector_2() {
        let ip = IpAddr::V4(Ipv4Addr::new(21, 75, 31, 124));
        let id = generate_node_id_with(ip, 86);

        assert_eq!(id.0[0], 0x5a);
        assert_eq!(id.0[1], 0x3c);
        assert_eq!(id.0[2] & 0xf8, 0xe8);
        assert_eq!(id.0[19], 0x56);
        assert!(verify_node_id(&id, ip));
    }

    #[test]
    fn test_rejects_foreign_ip() {
        let ip = IpAddr::V4(Ipv4Addr::new(124, 31, 75, 21));
        let id = generate_node_id_with(ip, 1);

        assert!(!verify_node_id(&id, IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8))));
    }

    #[test]
    fn test_rejects_tampered_prefix() {
        let ip = IpAddr::V4(Ipv4Addr::new(124, 31, 75, 21));
        let mut id = generate_node_id_with(ip, 1);
        id.0[0] = 0x18;

        assert!(!verify_node_id(&id, ip));
    }

    #[test]
    fn test_local_network_exempt() {
        let local = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1));
        assert!(verify_node_id(&NodeId::generate(), local));

        assert!(is_local_network(&IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))));
        assert!(is_local_network(&IpAddr::V4(Ipv4Addr::new(172, 16, 0, 1))));
        assert!(is_local_network(&IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))));
        assert!(is_local_network(&IpAddr::V6(Ipv6Addr::LOCALHOST)));
        assert!(is_local_network(&IpAddr::V6(Ipv6Addr::new(
            0xfe80, 0, 0, 0, 0, 0, 0, 1
        ))));
        assert!(!is_local_network(&IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8))));
    }

    #[test]
    fn test_v6_derivation() {
        let ip: IpAddr = "2001:b829:2123:be84:e16c:d6ae:5290:49f1".parse().unwrap();
        let id = generate_node_id_with(ip, 1);
        assert!(verify_node_id(&id, ip));
        assert!(!verify_node_id(
            &id,
            "2001:db8::1".parse::<IpAddr>().unwrap()
        ));
    }
}
