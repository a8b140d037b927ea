use std::io;

use thiserror::Error;

/// Reasons a datagram could not be turned into an echo reply.
#[derive(Error, Debug)]
pub enum PacketError {
    #[error("datagram too short: {len} bytes, need at least {needed}")]
    Truncated { len: usize, needed: usize },

    #[error("not an IPv4 datagram (version {0})")]
    NotIpv4(u8),

    #[error("invalid IPv4 header length: {0} bytes")]
    BadHeaderLength(usize),

    #[error("ICMP checksum mismatch")]
    BadChecksum,

    #[error("ICMP codec error: {0}")]
    Codec(#[from] bincode::Error),
}

#[derive(Error, Debug)]
pub enum PingError {
    #[error("cannot resolve {host}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: io::Error,
    },

    #[error("{0} has no IPv4 address")]
    NoIpv4Address(String),

    #[error("cannot open raw ICMP socket (are you root?): {0}")]
    Open(#[source] io::Error),

    #[error("error sending ping: {0}")]
    Transmit(#[source] io::Error),

    #[error("error receiving pong: {0}")]
    Receive(#[source] io::Error),

    #[error("error encoding echo request: {0}")]
    Encode(#[from] PacketError),
}
