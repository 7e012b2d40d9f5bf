//! Kernel connection table reader (`/proc/net/{tcp,tcp6,udp,udp6}`)

use serde::Serialize;
use std::io;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Established,
    SynSent,
    SynRecv,
    FinWait1,
    FinWait2,
    TimeWait,
    Close,
    CloseWait,
    LastAck,
    Listen,
    Closing,
    Unknown(u8),
}

impl SocketState {
    fn from_code(code: u8) -> Self {
        match code {
            0x01 => SocketState::Established,
            0x02 => SocketState::SynSent,
            0x03 => SocketState::SynRecv,
            0x04 => SocketState::FinWait1,
            0x05 => SocketState::FinWait2,
            0x06 => SocketState::TimeWait,
            0x07 => SocketState::Close,
            0x08 => SocketState::CloseWait,
            0x09 => SocketState::LastAck,
            0x0A => SocketState::Listen,
            0x0B => SocketState::Closing,
            other => SocketState::Unknown(other),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SocketState::Established => "ESTABLISHED",
            SocketState::SynSent => "SYN_SENT",
            SocketState::SynRecv => "SYN_RECV",
            SocketState::FinWait1 => "FIN_WAIT1",
            SocketState::FinWait2 => "FIN_WAIT2",
            SocketState::TimeWait => "TIME_WAIT",
            SocketState::Close => "CLOSE",
            SocketState::CloseWait => "CLOSE_WAIT",
            SocketState::LastAck => "LAST_ACK",
            SocketState::Listen => "LISTEN",
            SocketState::Closing => "CLOSING",
            SocketState::Unknown(_) => "UNKNOWN",
        }
    }
}

/// One row of a connection table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketEntry {
    pub protocol: Protocol,
    pub local: SocketAddr,
    pub remote: SocketAddr,
    pub state: SocketState,
}

impl SocketEntry {
    /// Bound and waiting for peers. Unconnected UDP sockets count as
    /// listening.
    pub fn is_listening(&self) -> bool {
        match self.protocol {
            Protocol::Tcp => self.state == SocketState::Listen,
            Protocol::Udp => self.remote.port() == 0 && self.remote.ip().is_unspecified(),
        }
    }

    pub fn is_established(&self) -> bool {
        self.protocol == Protocol::Tcp && self.state == SocketState::Established
    }
}

const TABLES: [(&str, Protocol); 4] = [
    ("tcp", Protocol::Tcp),
    ("tcp6", Protocol::Tcp),
    ("udp", Protocol::Udp),
    ("udp6", Protocol::Udp),
];

/// Read every table under `root`. Missing tables are skipped; if none exist
/// the host has no procfs and `NotFound` is returned.
pub async fn read_tables(root: &Path) -> io::Result<Vec<SocketEntry>> {
    let mut entries = Vec::new();
    let mut found = false;

    for (name, protocol) in TABLES {
        match tokio::fs::read_to_string(root.join(name)).await {
            Ok(contents) => {
                found = true;
                entries.extend(parse_table(&contents, protocol));
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        }
    }

    if !found {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no connection tables under {}", root.display()),
        ));
    }
    Ok(entries)
}

/// Parse one table; malformed rows are skipped
pub fn parse_table(contents: &str, protocol: Protocol) -> Vec<SocketEntry> {
    contents
        .lines()
        .skip(1)
        .filter_map(|line| parse_row(line, protocol))
        .collect()
}

fn parse_row(line: &str, protocol: Protocol) -> Option<SocketEntry> {
    let mut fields = line.split_whitespace();
    let _slot = fields.next()?;
    let local = parse_endpoint(fields.next()?)?;
    let remote = parse_endpoint(fields.next()?)?;
    let state = u8::from_str_radix(fields.next()?, 16).ok()?;

    Some(SocketEntry {
        protocol,
        local,
        remote,
        state: SocketState::from_code(state),
    })
}

fn parse_endpoint(field: &str) -> Option<SocketAddr> {
    let (addr, port) = field.split_once(':')?;
    let port = u16::from_str_radix(port, 16).ok()?;
    let ip = match addr.len() {
        8 => IpAddr::V4(parse_word(addr)?.into()),
        32 => {
            let mut octets = [0u8; 16];
            for (i, chunk) in octets.chunks_exact_mut(4).enumerate() {
                chunk.copy_from_slice(&parse_word(&addr[i * 8..i * 8 + 8])?);
            }
            let v6 = Ipv6Addr::from(octets);
            match v6.to_ipv4_mapped() {
                Some(v4) => IpAddr::V4(v4),
                None => IpAddr::V6(v6),
            }
        }
        _ => return None,
    };
    Some(SocketAddr::new(ip, port))
}

/// Kernel prints each 32-bit word in host byte order
fn parse_word(hex: &str) -> Option<[u8; 4]> {
    u32::from_str_radix(hex, 16).ok().map(u32::to_le_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TCP: &str = "\
  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 0100007F:0CEA 00000000:0000 0A 00000000:00000000 00:00000000 00000000   999        0 21877 1 0000000000000000 100 0 0 10 0
   1: 0F02000A:0016 0302000A:D431 01 00000000:00000000 02:000A7D4E 00000000     0        0 31337 2 0000000000000000 20 4 30 10 -1
   2: garbage
";

    const TCP6: &str = "\
  sl  local_address                         remote_address                        st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 00000000000000000000000000000000:0050 00000000000000000000000000000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 1234 1 0000000000000000 100 0 0 10 0
   1: 0000000000000000FFFF00000100007F:1F90 0000000000000000FFFF00000200007F:C350 01 00000000:00000000 00:00000000 00000000     0        0 1235 1 0000000000000000 20 4 30 10 -1
";

    #[test]
    fn test_parse_ipv4_rows() {
        let entries = parse_table(TCP, Protocol::Tcp);
        assert_eq!(entries.len(), 2);

        assert_eq!(entries[0].local, "127.0.0.1:3306".parse().unwrap());
        assert!(entries[0].is_listening());

        assert_eq!(entries[1].local, "10.0.2.15:22".parse().unwrap());
        assert_eq!(entries[1].remote, "10.0.2.3:54321".parse().unwrap());
        assert!(entries[1].is_established());
        assert_eq!(entries[1].state.as_str(), "ESTABLISHED");
    }

    #[test]
    fn test_parse_ipv6_rows() {
        let entries = parse_table(TCP6, Protocol::Tcp);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].local, "[::]:80".parse().unwrap());
        assert!(entries[0].is_listening());
        // v4-mapped addresses collapse to plain v4
        assert_eq!(entries[1].remote, "127.0.0.2:50000".parse().unwrap());
    }

    #[test]
    fn test_udp_unconnected_counts_as_listening() {
        let udp = "\
  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode ref pointer drops
  1: 00000000:0044 00000000:0000 07 00000000:00000000 00:00000000 00000000     0        0 1 2 0000000000000000 0
";
        let entries = parse_table(udp, Protocol::Udp);
        assert_eq!(entries.len(), 1);
        assert!(entries[0].is_listening());
        assert!(!entries[0].is_established());
    }

    #[tokio::test]
    async fn test_read_tables_missing_root() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_tables(dir.path()).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);

        std::fs::write(dir.path().join("tcp"), TCP).unwrap();
        let entries = read_tables(dir.path()).await.unwrap();
        assert_eq!(entries.len(), 2);
    }
}
