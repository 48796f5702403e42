//! Ping probe implementation with native ICMP and command fallback.
//!
//! Uses blocking sockets in spawn_blocking for precise timing.

use std::io::ErrorKind;
use std::mem::MaybeUninit;
use std::net::{IpAddr, SocketAddr};
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use regex::Regex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::process::Command;

use super::{ProbeError, ProbeOutcome, Prober};

const ICMP_ECHO_REQUEST: u8 = 8;
const ICMP_ECHO_REPLY: u8 = 0;
const ICMPV6_ECHO_REQUEST: u8 = 128;
const ICMPV6_ECHO_REPLY: u8 = 129;

/// Extra time granted to the ping process beyond its own reply timeout,
/// covering name resolution and process startup. Stays below the
/// reconciler's hard probe limit.
const COMMAND_GRACE: Duration = Duration::from_secs(1);

/// ICMP capability state
#[derive(Debug, Clone, Copy, PartialEq)]
enum IcmpCapability {
    /// Native ICMP sockets are available
    Native,
    /// Only command fallback is available
    CommandOnly,
}

/// Detect ICMP capability by attempting to create a socket.
fn detect_icmp_capability() -> IcmpCapability {
    // Try RAW socket first (requires CAP_NET_RAW or root)
    if Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("Ping probe: using native ICMP (RAW socket, privileged)");
        return IcmpCapability::Native;
    }

    // DGRAM is unprivileged on Linux with ping_group_range set, and on macOS
    if Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("Ping probe: using native ICMP (DGRAM socket, unprivileged)");
        return IcmpCapability::Native;
    }

    tracing::info!("Ping probe: native ICMP unavailable, using command fallback");
    IcmpCapability::CommandOnly
}

/// ICMP echo prober. Sends exactly one echo request per probe.
#[derive(Debug, Clone)]
pub struct PingProber {
    capability: IcmpCapability,
}

impl PingProber {
    /// Create a prober using native ICMP when the process may open ICMP sockets.
    pub fn detect() -> Self {
        Self {
            capability: detect_icmp_capability(),
        }
    }

    /// Create a prober that always shells out to the system `ping`.
    pub fn command_only() -> Self {
        Self {
            capability: IcmpCapability::CommandOnly,
        }
    }

    /// Ping the address once. Returns the round-trip time in milliseconds
    /// when the mechanism reported one.
    async fn ping(&self, address: &str, timeout: Duration) -> Result<Option<f64>, ProbeError> {
        if self.capability == IcmpCapability::Native {
            // Resolve address before spawn_blocking (DNS is async)
            let ip = resolve_address(address).await?;

            let result = tokio::task::spawn_blocking(move || run_blocking_ping(ip, timeout))
                .await
                .map_err(|e| ProbeError::Mechanism(format!("spawn_blocking failed: {}", e)))?;

            return match result {
                Ok(latency) => Ok(Some(latency)),
                Err(ProbeError::PermissionDenied(reason)) => {
                    tracing::warn!(
                        address,
                        error = %reason,
                        "Native ping not permitted, falling back to command"
                    );
                    run_ping_command(address, timeout).await
                }
                Err(e) => Err(e),
            };
        }

        run_ping_command(address, timeout).await
    }
}

#[async_trait]
impl Prober for PingProber {
    async fn probe(&self, address: &str, timeout: Duration) -> ProbeOutcome {
        match self.ping(address, timeout).await {
            Ok(latency) => ProbeOutcome::reachable(latency),
            Err(e) => {
                tracing::debug!(address, error = %e, fault = e.is_fault(), "Ping failed");
                e.into()
            }
        }
    }
}

/// Resolve hostname to IP address.
async fn resolve_address(address: &str) -> Result<IpAddr, ProbeError> {
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Ok(ip);
    }

    if address.trim().is_empty() {
        return Err(ProbeError::Unreachable("empty address".to_string()));
    }

    let addrs: Vec<_> = tokio::net::lookup_host(format!("{}:0", address))
        .await
        .map_err(|e| ProbeError::Unreachable(format!("DNS resolution failed: {}", e)))?
        .collect();

    preferred_address(addrs.into_iter().map(|sa| sa.ip()))
        .ok_or_else(|| ProbeError::Unreachable(format!("No addresses found for {}", address)))
}

/// Pick the address to ping from a resolver answer, preferring IPv4.
fn preferred_address(addrs: impl IntoIterator<Item = IpAddr>) -> Option<IpAddr> {
    let mut fallback = None;
    for ip in addrs {
        if ip.is_ipv4() {
            return Some(ip);
        }
        fallback.get_or_insert(ip);
    }
    fallback
}

/// Open an ICMP socket, RAW first (privileged) then DGRAM (unprivileged).
/// Returns the socket and whether it is RAW.
fn open_icmp_socket(domain: Domain, protocol: Protocol) -> Result<(Socket, bool), ProbeError> {
    if let Ok(socket) = Socket::new(domain, Type::RAW, Some(protocol)) {
        return Ok((socket, true));
    }
    Socket::new(domain, Type::DGRAM, Some(protocol))
        .map(|socket| (socket, false))
        .map_err(|e| {
            if e.kind() == ErrorKind::PermissionDenied {
                ProbeError::PermissionDenied(format!("Failed to create ICMP socket: {}", e))
            } else {
                ProbeError::Mechanism(format!("Failed to create ICMP socket: {}", e))
            }
        })
}

/// Run one blocking ICMP echo exchange. Returns latency in milliseconds.
/// This runs in a dedicated thread via spawn_blocking.
fn run_blocking_ping(ip: IpAddr, timeout: Duration) -> Result<f64, ProbeError> {
    let (domain, protocol, request_type, reply_type) = match ip {
        IpAddr::V4(_) => (Domain::IPV4, Protocol::ICMPV4, ICMP_ECHO_REQUEST, ICMP_ECHO_REPLY),
        IpAddr::V6(_) => (Domain::IPV6, Protocol::ICMPV6, ICMPV6_ECHO_REQUEST, ICMPV6_ECHO_REPLY),
    };
    let (socket, raw) = open_icmp_socket(domain, protocol)?;

    socket
        .set_write_timeout(Some(timeout))
        .map_err(|e| ProbeError::Mechanism(format!("Failed to set timeout: {}", e)))?;

    let dest = SocketAddr::new(ip, 0);
    socket.connect(&dest.into()).map_err(|e| match e.kind() {
        ErrorKind::PermissionDenied => ProbeError::PermissionDenied(format!("Failed to connect: {}", e)),
        _ => ProbeError::Unreachable(format!("Failed to connect: {}", e)),
    })?;

    let identifier: u16 = rand::random();
    let sequence: u16 = rand::random();
    // The kernel computes ICMPv6 checksums itself
    let packet = build_echo_request(request_type, identifier, sequence, ip.is_ipv4());

    // Start timing just before send
    let start = Instant::now();
    let deadline = start + timeout;

    socket.send(&packet).map_err(|e| {
        if e.kind() == ErrorKind::PermissionDenied {
            ProbeError::PermissionDenied(format!("Failed to send: {}", e))
        } else {
            ProbeError::Unreachable(format!("Failed to send: {}", e))
        }
    })?;

    // Receive replies until we get ours or the deadline passes
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(ProbeError::Timeout(timeout));
        }
        socket
            .set_read_timeout(Some(remaining))
            .map_err(|e| ProbeError::Mechanism(format!("Failed to set timeout: {}", e)))?;

        let mut buf = [MaybeUninit::<u8>::uninit(); 1500];
        let len = socket.recv(&mut buf).map_err(|e| match e.kind() {
            ErrorKind::WouldBlock | ErrorKind::TimedOut => ProbeError::Timeout(timeout),
            _ => ProbeError::Unreachable(format!("Failed to receive: {}", e)),
        })?;
        // SAFETY: recv initialized `len` bytes
        let buf: &[u8] = unsafe { std::slice::from_raw_parts(buf.as_ptr() as *const u8, len) };

        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return Err(ProbeError::Timeout(timeout));
        }

        let reply = EchoMatch {
            reply_type,
            identifier,
            sequence,
            // Linux DGRAM sockets rewrite the identifier to the local port
            check_identifier: raw,
            ipv4: ip.is_ipv4(),
        };
        if reply.matches(buf) {
            return Ok(elapsed.as_secs_f64() * 1000.0);
        }
        // Someone else's packet, keep waiting
    }
}

/// Criteria for recognizing our echo reply in a received datagram.
struct EchoMatch {
    reply_type: u8,
    identifier: u16,
    sequence: u16,
    check_identifier: bool,
    /// IPv4 RAW sockets, and DGRAM sockets on macOS, deliver the IP header
    /// ahead of the ICMP message. Its presence is read from the version nibble.
    ipv4: bool,
}

impl EchoMatch {
    fn matches(&self, buf: &[u8]) -> bool {
        let offset = match buf.first() {
            Some(b) if self.ipv4 && b >> 4 == 4 => usize::from(b & 0x0F) * 4,
            Some(_) => 0,
            None => return false,
        };

        let Some(icmp) = buf.get(offset..offset + 8) else {
            return false;
        };
        let reply_id = u16::from_be_bytes([icmp[4], icmp[5]]);
        let reply_seq = u16::from_be_bytes([icmp[6], icmp[7]]);

        icmp[0] == self.reply_type
            && reply_seq == self.sequence
            && (!self.check_identifier || reply_id == self.identifier)
    }
}

/// Build an echo request: 8 byte header plus 56 byte payload.
fn build_echo_request(kind: u8, identifier: u16, sequence: u16, with_checksum: bool) -> Vec<u8> {
    let mut packet = vec![0u8; 64];

    packet[0] = kind;
    packet[1] = 0; // Code
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());

    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default();
    packet[8..16].copy_from_slice(&timestamp.to_be_bytes());

    if with_checksum {
        let checksum = icmp_checksum(&packet);
        packet[2..4].copy_from_slice(&checksum.to_be_bytes());
    }

    packet
}

/// Compute ICMP checksum (RFC 1071).
fn icmp_checksum(data: &[u8]) -> u16 {
    let mut chunks = data.chunks_exact(2);
    let mut sum: u32 = chunks
        .by_ref()
        .map(|pair| u32::from(u16::from_be_bytes([pair[0], pair[1]])))
        .sum();

    // Handle odd byte
    if let [last] = chunks.remainder() {
        sum += u32::from(*last) << 8;
    }

    // Fold 32-bit sum to 16 bits
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !(sum as u16)
}

/// Run ping via command execution (fallback).
async fn run_ping_command(address: &str, timeout: Duration) -> Result<Option<f64>, ProbeError> {
    if address.trim().is_empty() {
        return Err(ProbeError::Unreachable("empty address".to_string()));
    }
    if address.starts_with('-') {
        return Err(ProbeError::Unreachable(format!("invalid address: {}", address)));
    }

    let mut command = Command::new("ping");
    if cfg!(windows) {
        let timeout_ms = timeout.as_millis().max(1);
        command.args(["-n", "1", "-w", &timeout_ms.to_string()]);
    } else {
        let timeout_secs = timeout.as_secs().max(1);
        command.args(["-c", "1", "-W", &timeout_secs.to_string()]);
    }
    command
        .arg(address)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = tokio::time::timeout(timeout + COMMAND_GRACE, command.output())
        .await
        .map_err(|_| ProbeError::Timeout(timeout))?
        .map_err(|e| match e.kind() {
            ErrorKind::PermissionDenied => {
                ProbeError::PermissionDenied(format!("failed to execute ping: {}", e))
            }
            _ => ProbeError::Mechanism(format!("failed to execute ping: {}", e)),
        })?;

    let stdout = String::from_utf8_lossy(&output.stdout);

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr = stderr.trim();
        if !stderr.is_empty() {
            return Err(ProbeError::Unreachable(stderr.to_string()));
        }
        if stdout.contains("100% packet loss")
            || stdout.contains("100.0% packet loss")
            || stdout.contains("(100% loss)")
            || stdout.contains("timed out")
        {
            return Err(ProbeError::Timeout(timeout));
        }
        return Err(ProbeError::Unreachable(format!("ping exited with {}", output.status)));
    }

    let latency = parse_ping_output(&stdout);
    if latency.is_none() {
        tracing::warn!(address, output = %stdout.trim(), "Could not extract response time from ping output");
    }
    Ok(latency)
}

/// Parse ping command output for latency in milliseconds.
fn parse_ping_output(output: &str) -> Option<f64> {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    let patterns = PATTERNS.get_or_init(|| {
        [
            // Per-packet reply "time=12.3 ms" (Linux, macOS) or "time<1ms" (Windows)
            r"time[=<]\s*(?P<val>[0-9]+(?:\.[0-9]+)?)\s*ms",
            // Summary "round-trip min/avg/max/stddev = X/X/X/X ms" (macOS)
            r"round-trip\s+min/avg/max/(?:stddev|std-dev)\s*=\s*[0-9.]+/(?P<val>[0-9.]+)/",
            // Summary "rtt min/avg/max/mdev = X/X/X/X ms" (Linux)
            r"rtt\s+min/avg/max/mdev\s*=\s*[0-9.]+/(?P<val>[0-9.]+)/",
            // Summary "Average = 12ms" (Windows)
            r"Average\s*=\s*(?P<val>[0-9]+(?:\.[0-9]+)?)\s*ms",
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
    });

    patterns.iter().find_map(|re| {
        re.captures(output)?
            .name("val")?
            .as_str()
            .parse::<f64>()
            .ok()
            .filter(|ms| ms.is_finite())
    })
}
