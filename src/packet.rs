use std::net::Ipv4Addr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bincode::Options;
use serde::{Deserialize, Serialize};

use crate::checksum;
use crate::error::PacketError;

pub const ECHO_REQUEST: u8 = 8;
pub const ECHO_REPLY: u8 = 0;
pub const TIME_EXCEEDED: u8 = 11;

pub const HEADER_LEN: usize = 8;
pub const TIMESTAMP_LEN: usize = 8;
pub const PAYLOAD_LEN: usize = 56;
/// Size of every echo request we put on the wire.
pub const PACKET_LEN: usize = HEADER_LEN + TIMESTAMP_LEN + PAYLOAD_LEN;

/// IPv4 header without options.
pub const MIN_IP_HEADER_LEN: usize = 20;

const CHECKSUM_OFFSET: usize = 2;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
struct ICMPEchoHeader {
    message_type: u8,
    message_code: u8,
    checksum: u16,
    identifier: u16,
    sequence_num: u16,
}

/// Send time carried in the echo payload, seconds and microseconds since the
/// Unix epoch.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Timestamp {
    pub secs: u32,
    pub micros: u32,
}

impl Timestamp {
    pub fn now() -> Self {
        Self::from_system_time(SystemTime::now())
    }

    pub fn from_system_time(time: SystemTime) -> Self {
        let since_epoch = time.duration_since(UNIX_EPOCH).unwrap_or_default();
        Timestamp {
            // Wraps in 2106, `elapsed_since` works modulo 2^32 seconds
            secs: since_epoch.as_secs() as u32,
            micros: since_epoch.subsec_micros(),
        }
    }

    /// Time elapsed from `earlier` to `self`, zero if the clock went backwards.
    ///
    /// Seconds are compared as serial numbers, so a pair straddling the
    /// 32 bit wrap still gives the short forward distance.
    pub fn elapsed_since(self, earlier: Timestamp) -> Duration {
        let secs = self.secs.wrapping_sub(earlier.secs) as i32 as i64;
        let micros = secs * 1_000_000 + self.micros as i64 - earlier.micros as i64;
        if micros <= 0 {
            Duration::from_secs(0)
        } else {
            Duration::from_micros(micros as u64)
        }
    }
}

/// ICMP fields use network byte order and fixed width integers.
fn codec() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_big_endian()
        .allow_trailing_bytes()
}

fn filler() -> impl Iterator<Item = u8> {
    (0..PAYLOAD_LEN).map(|i| (TIMESTAMP_LEN + i) as u8)
}

/// Builds a ready to send echo request of exactly `PACKET_LEN` bytes.
pub fn encode(identifier: u16, sequence: u16, sent_at: Timestamp) -> Result<Vec<u8>, PacketError> {
    let header = ICMPEchoHeader {
        message_type: ECHO_REQUEST,
        message_code: 0,
        checksum: 0,
        identifier,
        sequence_num: sequence,
    };

    let mut packet = Vec::with_capacity(PACKET_LEN);
    codec().serialize_into(&mut packet, &header)?;
    codec().serialize_into(&mut packet, &sent_at)?;
    packet.extend(filler());

    checksum::set_checksum(&mut packet, CHECKSUM_OFFSET);
    Ok(packet)
}

/// An echo message read back from the raw socket, with the bits of the
/// enclosing IPv4 header we care about.
#[derive(Debug, Clone, PartialEq)]
pub struct EchoReply {
    pub source: Ipv4Addr,
    pub ttl: u8,
    pub message_type: u8,
    pub message_code: u8,
    pub identifier: u16,
    pub sequence: u16,
    pub sent_at: Timestamp,
    /// Length of the ICMP message, IP header excluded.
    pub size: usize,
}

impl EchoReply {
    pub fn is_echo_reply(&self) -> bool {
        self.message_type == ECHO_REPLY && self.message_code == 0
    }

    /// Whether this is the reply from `target` to the probe tagged
    /// `identifier`/`sequence`.
    pub fn answers(&self, target: Ipv4Addr, identifier: u16, sequence: u16) -> bool {
        self.is_echo_reply()
            && self.source == target
            && self.identifier == identifier
            && self.sequence == sequence
    }

    pub fn rtt(&self, received_at: Timestamp) -> Duration {
        received_at.elapsed_since(self.sent_at)
    }
}

/// A router dropped one of our requests because its TTL ran out. The
/// request's header comes back quoted in the payload.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeExceeded {
    /// The router that gave up on the request.
    pub source: Ipv4Addr,
    pub code: u8,
    /// Destination of the quoted request.
    pub original_destination: Ipv4Addr,
    pub original_type: u8,
    pub identifier: u16,
    pub sequence: u16,
}

impl TimeExceeded {
    /// Whether the dropped request is our probe to `target` tagged
    /// `identifier`/`sequence`.
    pub fn concerns(&self, target: Ipv4Addr, identifier: u16, sequence: u16) -> bool {
        self.original_type == ECHO_REQUEST
            && self.original_destination == target
            && self.identifier == identifier
            && self.sequence == sequence
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum IcmpMessage {
    Echo(EchoReply),
    TimeExceeded(TimeExceeded),
}

/// Length of an IPv4 header from its first byte.
fn ip_header_len(first: u8) -> Result<usize, PacketError> {
    let version = first >> 4;
    if version != 4 {
        return Err(PacketError::NotIpv4(version));
    }

    // Header length is stored in 32 bit words
    let header_len = 4 * (first & 0x0F) as usize;
    if header_len < MIN_IP_HEADER_LEN {
        return Err(PacketError::BadHeaderLength(header_len));
    }
    Ok(header_len)
}

/// Parses a raw IPv4 datagram holding an ICMP message.
///
/// Every field is read at a checked offset; the ICMP checksum is verified
/// before anything past the IP header is trusted. Time exceeded errors are
/// decoded as such, every other type is read with the echo layout.
pub fn decode(datagram: &[u8]) -> Result<IcmpMessage, PacketError> {
    if datagram.len() < MIN_IP_HEADER_LEN {
        return Err(PacketError::Truncated {
            len: datagram.len(),
            needed: MIN_IP_HEADER_LEN + PACKET_LEN,
        });
    }

    let header_len = ip_header_len(datagram[0])?;
    let icmp = datagram.get(header_len..).unwrap_or_default();

    let icmp_len = match icmp.first() {
        Some(&TIME_EXCEEDED) => HEADER_LEN + MIN_IP_HEADER_LEN + HEADER_LEN,
        _ => PACKET_LEN,
    };
    let needed = header_len + icmp_len;
    if datagram.len() < needed {
        return Err(PacketError::Truncated {
            len: datagram.len(),
            needed,
        });
    }

    let ttl = datagram[8];
    let source = Ipv4Addr::new(datagram[12], datagram[13], datagram[14], datagram[15]);

    if !checksum::verify(icmp) {
        return Err(PacketError::BadChecksum);
    }

    if icmp[0] == TIME_EXCEEDED {
        return decode_time_exceeded(source, icmp).map(IcmpMessage::TimeExceeded);
    }

    let header: ICMPEchoHeader = codec().deserialize(&icmp[..HEADER_LEN])?;
    let sent_at: Timestamp = codec().deserialize(&icmp[HEADER_LEN..HEADER_LEN + TIMESTAMP_LEN])?;

    Ok(IcmpMessage::Echo(EchoReply {
        source,
        ttl,
        message_type: header.message_type,
        message_code: header.message_code,
        identifier: header.identifier,
        sequence: header.sequence_num,
        sent_at,
        size: icmp.len(),
    }))
}

/// `icmp` is at least an ICMP header plus a 20 byte quoted IP header plus
/// 8 quoted bytes, and its checksum has been verified.
fn decode_time_exceeded(source: Ipv4Addr, icmp: &[u8]) -> Result<TimeExceeded, PacketError> {
    let quoted_ip = &icmp[HEADER_LEN..];
    let quoted_header_len = ip_header_len(quoted_ip[0])?;

    let needed = HEADER_LEN + quoted_header_len + HEADER_LEN;
    if icmp.len() < needed {
        return Err(PacketError::Truncated {
            len: icmp.len(),
            needed,
        });
    }

    let original_destination = Ipv4Addr::new(quoted_ip[16], quoted_ip[17], quoted_ip[18], quoted_ip[19]);
    let quoted: ICMPEchoHeader =
        codec().deserialize(&quoted_ip[quoted_header_len..quoted_header_len + HEADER_LEN])?;

    Ok(TimeExceeded {
        source,
        code: icmp[1],
        original_destination,
        original_type: quoted.message_type,
        identifier: quoted.identifier,
        sequence: quoted.sequence_num,
    })
}
