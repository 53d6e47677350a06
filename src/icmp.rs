//! ICMP echo probing for ping and traceroute.
//!
//! Each probe carries a fixed identifier and packs the hop index and the
//! attempt counter into the echo sequence number (see [`ProbeId`]), so a
//! reply or a quoted request inside an ICMP error tells exactly which
//! outstanding probe it answers. Probes go out with TTL `hop + 1`.
//!
//! Replies are classified as:
//!
//! - echo reply with our identifier, sequence and body: the destination
//!   answered ([`ProbeOutcome::Reply`])
//! - time exceeded quoting our request: a router at this distance
//!   ([`ProbeOutcome::TtlExceeded`])
//! - destination unreachable quoting our request
//!   ([`ProbeOutcome::Unreachable`])
//!
//! Anything else is skipped until the probe times out
//! ([`ProbeOutcome::Lost`]). A time-exceeded message quoting one of our
//! requests with a different sequence usually means a routing loop; it is
//! ignored like any other stranger.

use crate::{Error, Result};
use log::{debug, trace};
use pnet::packet::icmp::echo_reply::EchoReplyPacket;
use pnet::packet::icmp::echo_request::MutableEchoRequestPacket;
use pnet::packet::icmp::{checksum, IcmpCode, IcmpPacket, IcmpType, IcmpTypes};
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::Packet;
use rand::Rng;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io;
use std::mem::MaybeUninit;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

const ICMP_HEADER_SIZE: usize = 8;
const IPV6_HEADER_SIZE: usize = 40;
const BODY_SIZE: usize = 16;
const RECV_BUFFER_SIZE: usize = 1500;

const ICMPV6_DEST_UNREACHABLE: u8 = 1;
const ICMPV6_TIME_EXCEEDED: u8 = 3;
const ICMPV6_ECHO_REQUEST: u8 = 128;
const ICMPV6_ECHO_REPLY: u8 = 129;

/// Hop index and attempt counter packed into a 16-bit echo sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProbeId {
    pub hop: u8,
    pub seq: u8,
}

impl ProbeId {
    pub fn new(hop: u8, seq: u8) -> Self {
        Self { hop, seq }
    }

    /// `hop << 8 | seq`
    pub fn to_sequence(&self) -> u16 {
        ((self.hop as u16) << 8) | (self.seq as u16)
    }

    pub fn from_sequence(sequence: u16) -> Self {
        Self {
            hop: (sequence >> 8) as u8,
            seq: (sequence & 0xFF) as u8,
        }
    }
}

/// Result of one probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Echo reply from the probed address
    Reply { rtt: Duration, peer: IpAddr },
    /// A router on the path dropped the probe
    TtlExceeded { rtt: Duration, peer: IpAddr },
    Unreachable { rtt: Duration, peer: IpAddr },
    /// Nothing matching arrived before the timeout
    Lost,
}

impl ProbeOutcome {
    pub fn is_ttl_exceeded(&self) -> bool {
        matches!(self, ProbeOutcome::TtlExceeded { .. })
    }

    pub fn is_lost(&self) -> bool {
        matches!(self, ProbeOutcome::Lost)
    }

    pub fn peer(&self) -> Option<IpAddr> {
        match self {
            ProbeOutcome::Reply { peer, .. }
            | ProbeOutcome::TtlExceeded { peer, .. }
            | ProbeOutcome::Unreachable { peer, .. } => Some(*peer),
            ProbeOutcome::Lost => None,
        }
    }

    pub fn rtt(&self) -> Option<Duration> {
        match self {
            ProbeOutcome::Reply { rtt, .. }
            | ProbeOutcome::TtlExceeded { rtt, .. }
            | ProbeOutcome::Unreachable { rtt, .. } => Some(*rtt),
            ProbeOutcome::Lost => None,
        }
    }
}

/// Sends one probe and waits for its answer. Blocking; async callers go
/// through `spawn_blocking`.
pub trait Prober: Send + Sync {
    /// Probes `dest` with TTL `hop + 1`.
    ///
    /// # Errors
    ///
    /// [`Error::PermissionDenied`] when raw sockets are not allowed, which
    /// ends the whole test. Losses are not errors.
    fn probe(&self, dest: IpAddr, timeout: Duration, hop: u8, seq: u8) -> Result<ProbeOutcome>;
}

/// Raw-socket ICMP/ICMPv6 prober.
#[derive(Debug, Clone)]
pub struct IcmpProber {
    identifier: u16,
    body: [u8; BODY_SIZE],
    tos: u8,
}

impl IcmpProber {
    pub fn new() -> Self {
        let mut body = [0u8; BODY_SIZE];
        rand::thread_rng().fill(&mut body[..]);
        Self {
            identifier: std::process::id() as u16,
            body,
            tos: 0,
        }
    }

    pub fn with_tos(mut self, tos: u8) -> Self {
        self.tos = tos;
        self
    }

    pub fn identifier(&self) -> u16 {
        self.identifier
    }

    fn open_socket(&self, ipv6: bool, hop: u8) -> Result<Socket> {
        let (domain, protocol) = if ipv6 {
            (Domain::IPV6, Protocol::ICMPV6)
        } else {
            (Domain::IPV4, Protocol::ICMPV4)
        };
        let socket = Socket::new(domain, Type::RAW, Some(protocol)).map_err(|e| {
            if e.kind() == io::ErrorKind::PermissionDenied {
                Error::PermissionDenied(format!(
                    "raw ICMP sockets need root or CAP_NET_RAW ({})",
                    e
                ))
            } else {
                Error::Io(e)
            }
        })?;

        let ttl = hop as u32 + 1;
        if ipv6 {
            socket.set_unicast_hops_v6(ttl)?;
        } else {
            socket.set_ttl(ttl)?;
            if self.tos != 0 {
                socket.set_tos(self.tos as u32)?;
            }
        }
        Ok(socket)
    }
}

impl Default for IcmpProber {
    fn default() -> Self {
        Self::new()
    }
}

impl Prober for IcmpProber {
    fn probe(&self, dest: IpAddr, timeout: Duration, hop: u8, seq: u8) -> Result<ProbeOutcome> {
        let ipv6 = dest.is_ipv6();
        let socket = self.open_socket(ipv6, hop)?;
        let sequence = ProbeId::new(hop, seq).to_sequence();
        let packet = build_echo_request(self.identifier, sequence, &self.body, ipv6)?;

        let start = Instant::now();
        let deadline = start + timeout;
        socket.send_to(&packet, &SockAddr::from(SocketAddr::new(dest, 0)))?;

        let mut buffer = [0u8; RECV_BUFFER_SIZE];
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(ProbeOutcome::Lost);
            }
            socket.set_read_timeout(Some(remaining))?;

            let (len, from) = match recv_from(&socket, &mut buffer) {
                Ok(received) => received,
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    return Ok(ProbeOutcome::Lost)
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            let Some(from) = from else { continue };

            let expected = Expected {
                identifier: self.identifier,
                sequence,
                body: &self.body,
            };
            if let Some(kind) = classify(&buffer[..len], ipv6, &expected) {
                let rtt = start.elapsed();
                trace!("Probe {} hop {} answered by {} ({:?})", dest, hop, from, kind);
                return Ok(match kind {
                    ResponseKind::EchoReply => ProbeOutcome::Reply { rtt, peer: from },
                    ResponseKind::TimeExceeded => ProbeOutcome::TtlExceeded { rtt, peer: from },
                    ResponseKind::Unreachable => ProbeOutcome::Unreachable { rtt, peer: from },
                });
            }
        }
    }
}

fn recv_from(socket: &Socket, buffer: &mut [u8]) -> io::Result<(usize, Option<IpAddr>)> {
    // SAFETY: `u8` and `MaybeUninit<u8>` share layout, the buffer is already
    // initialized and recv only ever writes initialized bytes into it.
    let uninit = unsafe { &mut *(buffer as *mut [u8] as *mut [MaybeUninit<u8>]) };
    let (len, addr) = socket.recv_from(uninit)?;
    Ok((len, addr.as_socket().map(|a| a.ip())))
}

/// Builds an echo request carrying `body`. ICMPv6 checksums are left to
/// the kernel.
pub fn build_echo_request(
    identifier: u16,
    sequence: u16,
    body: &[u8],
    ipv6: bool,
) -> Result<Vec<u8>> {
    let mut buffer = vec![0u8; ICMP_HEADER_SIZE + body.len()];
    {
        let mut packet = MutableEchoRequestPacket::new(&mut buffer)
            .ok_or_else(|| Error::Protocol("Echo request buffer too small".to_string()))?;
        if ipv6 {
            packet.set_icmp_type(IcmpType::new(ICMPV6_ECHO_REQUEST));
        } else {
            packet.set_icmp_type(IcmpTypes::EchoRequest);
        }
        packet.set_icmp_code(IcmpCode::new(0));
        packet.set_identifier(identifier);
        packet.set_sequence_number(sequence);
        packet.set_payload(body);
    }
    if !ipv6 {
        let cksum = IcmpPacket::new(&buffer).map(|p| checksum(&p)).unwrap_or(0);
        buffer[2..4].copy_from_slice(&cksum.to_be_bytes());
    }
    Ok(buffer)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResponseKind {
    EchoReply,
    TimeExceeded,
    Unreachable,
}

struct Expected<'a> {
    identifier: u16,
    sequence: u16,
    body: &'a [u8],
}

/// Matches a received datagram against the outstanding probe.
///
/// IPv4 raw sockets deliver the IP header; IPv6 ones do not.
fn classify(data: &[u8], ipv6: bool, expected: &Expected<'_>) -> Option<ResponseKind> {
    if ipv6 {
        classify_v6(data, expected)
    } else {
        classify_v4(data, expected)
    }
}

fn classify_v4(data: &[u8], expected: &Expected<'_>) -> Option<ResponseKind> {
    let ip = Ipv4Packet::new(data)?;
    let header_len = ip.get_header_length() as usize * 4;
    let icmp_data = data.get(header_len..)?;
    let icmp = IcmpPacket::new(icmp_data)?;

    match icmp.get_icmp_type() {
        IcmpTypes::EchoReply => {
            let reply = EchoReplyPacket::new(icmp_data)?;
            let matches = reply.get_identifier() == expected.identifier
                && reply.get_sequence_number() == expected.sequence
                && reply.payload().starts_with(expected.body);
            matches.then_some(ResponseKind::EchoReply)
        }
        IcmpTypes::TimeExceeded => {
            quoted_v4_matches(icmp_data, expected).then_some(ResponseKind::TimeExceeded)
        }
        IcmpTypes::DestinationUnreachable => {
            quoted_v4_matches(icmp_data, expected).then_some(ResponseKind::Unreachable)
        }
        _ => None,
    }
}

/// Whether an ICMPv4 error quotes our outstanding request.
fn quoted_v4_matches(icmp_data: &[u8], expected: &Expected<'_>) -> bool {
    let Some(quoted) = icmp_data.get(ICMP_HEADER_SIZE..) else {
        return false;
    };
    let Some(inner_ip) = Ipv4Packet::new(quoted) else {
        return false;
    };
    let inner_len = inner_ip.get_header_length() as usize * 4;
    match quoted.get(inner_len..inner_len + ICMP_HEADER_SIZE) {
        Some(inner) => quoted_request_matches(inner, IcmpTypes::EchoRequest.0, expected),
        None => false,
    }
}

fn classify_v6(icmp_data: &[u8], expected: &Expected<'_>) -> Option<ResponseKind> {
    if icmp_data.len() < ICMP_HEADER_SIZE {
        return None;
    }
    match icmp_data[0] {
        ICMPV6_ECHO_REPLY => {
            let matches = echo_fields(icmp_data) == (expected.identifier, expected.sequence)
                && icmp_data[ICMP_HEADER_SIZE..].starts_with(expected.body);
            matches.then_some(ResponseKind::EchoReply)
        }
        ICMPV6_TIME_EXCEEDED => {
            quoted_v6_matches(icmp_data, expected).then_some(ResponseKind::TimeExceeded)
        }
        ICMPV6_DEST_UNREACHABLE => {
            quoted_v6_matches(icmp_data, expected).then_some(ResponseKind::Unreachable)
        }
        _ => None,
    }
}

fn quoted_v6_matches(icmp_data: &[u8], expected: &Expected<'_>) -> bool {
    let start = ICMP_HEADER_SIZE + IPV6_HEADER_SIZE;
    match icmp_data.get(start..start + ICMP_HEADER_SIZE) {
        Some(inner) => quoted_request_matches(inner, ICMPV6_ECHO_REQUEST, expected),
        None => false,
    }
}

fn quoted_request_matches(inner: &[u8], request_type: u8, expected: &Expected<'_>) -> bool {
    if inner[0] != request_type {
        return false;
    }
    let (identifier, sequence) = echo_fields(inner);
    if identifier != expected.identifier {
        return false;
    }
    if sequence != expected.sequence {
        let stray = ProbeId::from_sequence(sequence);
        debug!(
            "Ignoring error for hop {} seq {} while waiting for {:?}",
            stray.hop,
            stray.seq,
            ProbeId::from_sequence(expected.sequence)
        );
        return false;
    }
    true
}

/// Identifier and sequence of an echo header.
fn echo_fields(header: &[u8]) -> (u16, u16) {
    (
        u16::from_be_bytes([header[4], header[5]]),
        u16::from_be_bytes([header[6], header[7]]),
    )
}
