//! Minimal IPv4 header inspection used by the duplicate detector and the
//! GRE bearer.
//!
//! This deliberately does not attempt to be a general-purpose packet
//! library (that's `etherparse`, which we build on): it only exposes the
//! handful of header fields the dataplane needs to derive duplicate ids and
//! to validate GRE encapsulation.

use etherparse::Ipv4HeaderSlice;
use std::net::Ipv4Addr;

pub const IP_PROTO_ICMP: u8 = 1;
const GRE_IP_PROTOCOL: u8 = 47;
const GRE_HEADER_LEN: usize = 4;
const GRE_PROTO_IPV4: u16 = 0x0800;

#[derive(Debug, thiserror::Error)]
pub enum Ipv4Error {
    #[error("buffer too short to contain an IPv4 header")]
    TooShort,
    #[error("not an IPv4 packet (version nibble != 4)")]
    NotIpv4,
    #[error("malformed IPv4 header: {0}")]
    Malformed(String),
}

/// The header fields needed to compute a duplicate-detection id and to route
/// a packet to the per-flow dedup bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4HeaderFields {
    pub ihl: usize,
    pub protocol: u8,
    pub total_length: u16,
    pub identification: u16,
    /// The raw 16-bit "flags + fragment offset" field, unpacked from the
    /// wire representation (not etherparse's decoded `dont_fragment` /
    /// `more_fragments` / `fragments_offset` triple), because the duplicate
    /// id formula operates on the packed field as transmitted.
    pub flags_fragment_offset: u16,
    pub header_checksum: u16,
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
}

/// Parses the IPv4 header fields out of `bytes`, which must start at the
/// first byte of the IP header (no link-layer framing).
pub fn parse_ipv4_header(bytes: &[u8]) -> Result<Ipv4HeaderFields, Ipv4Error> {
    if bytes.is_empty() {
        return Err(Ipv4Error::TooShort);
    }
    if bytes[0] >> 4 != 4 {
        return Err(Ipv4Error::NotIpv4);
    }

    // `Ipv4HeaderSlice::from_slice` validates that the buffer is at least as
    // long as the IHL it declares and that the version nibble is 4; we then
    // read every field straight from the validated byte slice rather than
    // through etherparse's decoded getters, since the duplicate-id formula
    // needs the raw packed "flags + fragment offset" field as transmitted.
    let slice =
        Ipv4HeaderSlice::from_slice(bytes).map_err(|e| Ipv4Error::Malformed(e.to_string()))?;
    let header_bytes = slice.slice();

    let ihl = ((header_bytes[0] & 0x0f) as usize) * 4;
    let total_length = u16::from_be_bytes([header_bytes[2], header_bytes[3]]);
    let identification = u16::from_be_bytes([header_bytes[4], header_bytes[5]]);
    let flags_fragment_offset = u16::from_be_bytes([header_bytes[6], header_bytes[7]]);
    let protocol = header_bytes[9];
    let header_checksum = u16::from_be_bytes([header_bytes[10], header_bytes[11]]);
    let source = Ipv4Addr::new(
        header_bytes[12],
        header_bytes[13],
        header_bytes[14],
        header_bytes[15],
    );
    let destination = Ipv4Addr::new(
        header_bytes[16],
        header_bytes[17],
        header_bytes[18],
        header_bytes[19],
    );

    Ok(Ipv4HeaderFields {
        ihl,
        protocol,
        total_length,
        identification,
        flags_fragment_offset,
        header_checksum,
        source,
        destination,
    })
}

/// The 64-bit duplicate id derived from IPv4 header fields, per the
/// GRE/ICMP dedup path: `(ident<<16 | fragment) << 32 | (length<<16 |
/// checksum)`.
pub fn dup_id(h: &Ipv4HeaderFields) -> u64 {
    let high = (u32::from(h.identification) << 16) | u32::from(h.flags_fragment_offset);
    let low = (u32::from(h.total_length) << 16) | u32::from(h.header_checksum);

    (u64::from(high) << 32) | u64::from(low)
}

/// The per-flow key used by the bounded dedup history: `(src << 32) | dst`.
pub fn flow_key(src: Ipv4Addr, dst: Ipv4Addr) -> u64 {
    (u64::from(u32::from(src)) << 32) | u64::from(u32::from(dst))
}

#[derive(Debug, thiserror::Error)]
pub enum GreError {
    #[error("IP header length {0} outside [20, 60]")]
    InvalidIhl(usize),
    #[error("datagram too short to contain an IP + GRE header")]
    TooShort,
    #[error("non-zero GRE flags {0:#06x}")]
    NonZeroFlags(u16),
    #[error("unsupported GRE protocol type {0:#06x}, expected 0x0800")]
    UnsupportedProtocol(u16),
    #[error(transparent)]
    Ip(#[from] Ipv4Error),
}

/// A GRE-encapsulated IPv4 datagram as handed back by a raw socket: the
/// outer IPv4 header, the GRE header (validated), and the payload slice.
#[derive(Debug)]
pub struct GreDatagram<'a> {
    pub outer_header: Ipv4HeaderFields,
    pub payload: &'a [u8],
}

/// Parses a raw IPv4 datagram that is expected to carry a GRE header with
/// IPv4 payload (flags=0, type=0x0800), validating IHL, GRE flags, and GRE
/// protocol type as described for the GRE bearer's receive path.
pub fn parse_gre_datagram(raw: &[u8]) -> Result<GreDatagram<'_>, GreError> {
    let outer_header = parse_ipv4_header(raw)?;

    let ihl = outer_header.ihl;
    if !(20..=60).contains(&ihl) {
        return Err(GreError::InvalidIhl(ihl));
    }

    if raw.len() < ihl + GRE_HEADER_LEN {
        return Err(GreError::TooShort);
    }

    let gre_flags = u16::from_be_bytes([raw[ihl], raw[ihl + 1]]);
    if gre_flags != 0 {
        return Err(GreError::NonZeroFlags(gre_flags));
    }

    let gre_proto = u16::from_be_bytes([raw[ihl + 2], raw[ihl + 3]]);
    if gre_proto != GRE_PROTO_IPV4 {
        return Err(GreError::UnsupportedProtocol(gre_proto));
    }

    Ok(GreDatagram {
        outer_header,
        payload: &raw[ihl + GRE_HEADER_LEN..],
    })
}

/// Builds the 4-byte GRE header (flags=0, protocol type=IPv4) prepended to
/// every packet sent over a GRE bearer.
pub fn gre_header() -> [u8; GRE_HEADER_LEN] {
    let mut header = [0u8; GRE_HEADER_LEN];
    header[2..4].copy_from_slice(&GRE_PROTO_IPV4.to_be_bytes());
    header
}

/// IP protocol number used for GRE encapsulation on raw sockets (47).
pub const fn gre_ip_protocol() -> u8 {
    GRE_IP_PROTOCOL
}

pub fn is_icmp(h: &Ipv4HeaderFields) -> bool {
    h.protocol == IP_PROTO_ICMP
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_ipv4(protocol: u8, ident: u16, frag: u16, total_len: u16, checksum: u16) -> Vec<u8> {
        let mut buf = vec![0u8; 20];
        buf[0] = 0x45; // version 4, IHL 5 (20 bytes)
        buf[2..4].copy_from_slice(&total_len.to_be_bytes());
        buf[4..6].copy_from_slice(&ident.to_be_bytes());
        buf[6..8].copy_from_slice(&frag.to_be_bytes());
        buf[8] = 64; // ttl
        buf[9] = protocol;
        buf[10..12].copy_from_slice(&checksum.to_be_bytes());
        buf[12..16].copy_from_slice(&[10, 0, 0, 1]);
        buf[16..20].copy_from_slice(&[10, 0, 0, 2]);
        buf
    }

    #[test]
    fn parses_header_fields() {
        let buf = sample_ipv4(IP_PROTO_ICMP, 0x1234, 0x4000, 84, 0xabcd);
        let h = parse_ipv4_header(&buf).unwrap();

        assert_eq!(h.ihl, 20);
        assert_eq!(h.protocol, IP_PROTO_ICMP);
        assert_eq!(h.identification, 0x1234);
        assert_eq!(h.flags_fragment_offset, 0x4000);
        assert_eq!(h.total_length, 84);
        assert_eq!(h.header_checksum, 0xabcd);
        assert_eq!(h.source, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(h.destination, Ipv4Addr::new(10, 0, 0, 2));
    }

    #[test]
    fn dup_id_is_stable_for_identical_headers() {
        let a = sample_ipv4(IP_PROTO_ICMP, 1, 2, 84, 3);
        let b = sample_ipv4(IP_PROTO_ICMP, 1, 2, 84, 3);

        let ha = parse_ipv4_header(&a).unwrap();
        let hb = parse_ipv4_header(&b).unwrap();

        assert_eq!(dup_id(&ha), dup_id(&hb));
    }

    #[test]
    fn dup_id_differs_when_identification_differs() {
        let a = sample_ipv4(IP_PROTO_ICMP, 1, 2, 84, 3);
        let b = sample_ipv4(IP_PROTO_ICMP, 9, 2, 84, 3);

        let ha = parse_ipv4_header(&a).unwrap();
        let hb = parse_ipv4_header(&b).unwrap();

        assert_ne!(dup_id(&ha), dup_id(&hb));
    }

    #[test]
    fn rejects_non_ipv4() {
        let mut buf = sample_ipv4(IP_PROTO_ICMP, 1, 0, 20, 0);
        buf[0] = 0x60; // IPv6 version nibble
        assert!(matches!(parse_ipv4_header(&buf), Err(Ipv4Error::NotIpv4)));
    }

    #[test]
    fn gre_datagram_round_trips() {
        let mut ip = sample_ipv4(GRE_IP_PROTOCOL, 1, 0, 20 + 4 + 8, 0);
        ip.extend_from_slice(&gre_header());
        ip.extend_from_slice(b"hello123");

        let gre = parse_gre_datagram(&ip).unwrap();
        assert_eq!(gre.payload, b"hello123");
    }

    #[test]
    fn gre_datagram_rejects_non_zero_flags() {
        let mut ip = sample_ipv4(GRE_IP_PROTOCOL, 1, 0, 20 + 4, 0);
        ip.extend_from_slice(&[0x80, 0x00, 0x08, 0x00]); // non-zero flags

        assert!(matches!(
            parse_gre_datagram(&ip),
            Err(GreError::NonZeroFlags(_))
        ));
    }

    #[test]
    fn gre_datagram_rejects_wrong_protocol_type() {
        let mut ip = sample_ipv4(GRE_IP_PROTOCOL, 1, 0, 20 + 4, 0);
        ip.extend_from_slice(&[0x00, 0x00, 0x86, 0xdd]); // IPv6 ethertype

        assert!(matches!(
            parse_gre_datagram(&ip),
            Err(GreError::UnsupportedProtocol(_))
        ));
    }

    #[test]
    fn gre_datagram_rejects_bad_ihl() {
        let mut ip = sample_ipv4(GRE_IP_PROTOCOL, 1, 0, 20, 0);
        ip[0] = 0x4f; // IHL=15 -> 60 bytes, but buffer only has 20
        ip.extend_from_slice(&gre_header());

        assert!(parse_gre_datagram(&ip).is_err());
    }

    #[test]
    fn flow_key_combines_src_and_dst() {
        let src = Ipv4Addr::new(10, 0, 0, 1);
        let dst = Ipv4Addr::new(10, 0, 0, 2);

        let key = flow_key(src, dst);

        assert_eq!(key >> 32, u32::from(src) as u64);
        assert_eq!(key & 0xffff_ffff, u32::from(dst) as u64);
    }
}
