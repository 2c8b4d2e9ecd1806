//! Listening-port discovery.
//!
//! The demo container is inspected from the outside: `/proc/net/tcp` and
//! `/proc/net/tcp6` are read inside the container (state `0A` = LISTEN),
//! bind addresses are decoded from their little-endian hex form, and
//! loopback-only binds are flagged unreachable. Main-port selection follows
//! a fixed priority: explicit override, config override, LISTEN∩EXPOSE,
//! well-known preference list, lowest port.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use regex::Regex;
use tracing::debug;

/// Well-known ports tried, in order, when EXPOSE gives no hint.
pub const PREFERRED_PORTS: [u16; 8] = [80, 443, 8080, 8000, 3000, 5000, 5173, 4000];

/// One listening socket discovered inside the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenSocket {
    pub port: u16,
    pub addr: IpAddr,
    /// True when every bind of this port is loopback-only.
    pub loopback_only: bool,
}

/// Decode a `/proc/net/tcp` IPv4 address: 8 hex chars, little-endian.
fn decode_v4(hex: &str) -> Option<Ipv4Addr> {
    if hex.len() != 8 {
        return None;
    }
    let raw = u32::from_str_radix(hex, 16).ok()?;
    // The kernel stores the address in network order read as a
    // little-endian u32, so 127.0.0.1 prints as 0100007F.
    let bytes = raw.to_le_bytes();
    Some(Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]))
}

/// Decode a `/proc/net/tcp6` address: 32 hex chars in four little-endian
/// 32-bit groups.
fn decode_v6(hex: &str) -> Option<Ipv6Addr> {
    if hex.len() != 32 {
        return None;
    }
    let mut octets = [0u8; 16];
    for group in 0..4 {
        let chunk = &hex[group * 8..group * 8 + 8];
        let raw = u32::from_str_radix(chunk, 16).ok()?;
        octets[group * 4..group * 4 + 4].copy_from_slice(&raw.to_le_bytes());
    }
    Some(Ipv6Addr::from(octets))
}

fn is_loopback(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => v4.is_loopback(),
        IpAddr::V6(v6) => v6.is_loopback(),
    }
}

/// Parse one `/proc/net/tcp{,6}` dump, keeping LISTEN (`0A`) sockets.
///
/// Ports are deduplicated; a port is loopback-only when **all** of its binds
/// are loopback.
pub fn parse_proc_net_tcp(contents: &str) -> Vec<ListenSocket> {
    let mut sockets: Vec<ListenSocket> = Vec::new();

    for line in contents.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 {
            continue;
        }
        // fields: sl local_address rem_address st ...
        if fields[3] != "0A" {
            continue;
        }
        let Some((addr_hex, port_hex)) = fields[1].split_once(':') else {
            continue;
        };
        let Ok(port) = u16::from_str_radix(port_hex, 16) else {
            continue;
        };
        let addr: IpAddr = match addr_hex.len() {
            8 => match decode_v4(addr_hex) {
                Some(v4) => IpAddr::V4(v4),
                None => continue,
            },
            32 => match decode_v6(addr_hex) {
                Some(v6) => IpAddr::V6(v6),
                None => continue,
            },
            _ => continue,
        };
        let loopback = is_loopback(&addr);

        match sockets.iter_mut().find(|s| s.port == port) {
            Some(existing) => {
                // Any non-loopback bind makes the port reachable.
                if !loopback {
                    existing.loopback_only = false;
                    existing.addr = addr;
                }
            }
            None => sockets.push(ListenSocket {
                port,
                addr,
                loopback_only: loopback,
            }),
        }
    }

    sockets.sort_by_key(|s| s.port);
    debug!(count = sockets.len(), "listen sockets parsed");
    sockets
}

/// Merge v4 and v6 dumps into one deduplicated socket list.
pub fn merge_listen_sets(v4: Vec<ListenSocket>, v6: Vec<ListenSocket>) -> Vec<ListenSocket> {
    let mut merged = v4;
    for socket in v6 {
        match merged.iter_mut().find(|s| s.port == socket.port) {
            Some(existing) => {
                if !socket.loopback_only {
                    existing.loopback_only = false;
                }
            }
            None => merged.push(socket),
        }
    }
    merged.sort_by_key(|s| s.port);
    merged
}

/// Pick the "main" application port.
pub fn select_main_port(
    listen: &[u16],
    exposed: &[u16],
    user_override: Option<u16>,
    config_override: Option<u16>,
) -> Option<u16> {
    if listen.is_empty() {
        return user_override.or(config_override);
    }
    if let Some(port) = user_override {
        return Some(port);
    }
    if let Some(port) = config_override {
        return Some(port);
    }
    // First port appearing in both LISTEN and EXPOSE.
    if let Some(port) = listen.iter().find(|p| exposed.contains(p)) {
        return Some(*port);
    }
    // Well-known preference order.
    if let Some(port) = PREFERRED_PORTS.iter().find(|p| listen.contains(p)) {
        return Some(*port);
    }
    listen.iter().min().copied()
}

/// Parse `docker port` output lines like `8080/tcp -> 127.0.0.1:49153`.
pub fn parse_docker_port_output(output: &str) -> Vec<crate::container::PortMapping> {
    let re = Regex::new(r"^(\d+)/(?:tcp|udp)\s*->\s*(.+):(\d+)$").expect("static regex");
    output
        .lines()
        .filter_map(|line| {
            let caps = re.captures(line.trim())?;
            Some(crate::container::PortMapping {
                container_port: caps[1].parse().ok()?,
                host_ip: caps[2].trim().to_string(),
                host_port: caps[3].parse().ok()?,
            })
        })
        .collect()
}

/// TCP-probe `127.0.0.1:<port>` within `timeout`.
pub async fn probe_tcp(host_port: u16, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(
            timeout,
            tokio::net::TcpStream::connect(("127.0.0.1", host_port)),
        )
        .await,
        Ok(Ok(_))
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    // Header plus three sockets: 0.0.0.0:8080 LISTEN, 127.0.0.1:5432 LISTEN,
    // one ESTABLISHED row that must be skipped.
    const PROC_TCP: &str = "\
  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 00000000:1F90 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 12345
   1: 0100007F:1538 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 12346
   2: 0100007F:1F90 0100007F:C350 01 00000000:00000000 00:00000000 00000000  1000        0 12347
";

    const PROC_TCP6: &str = "\
  sl  local_address                         rem_address                        st
   0: 00000000000000000000000000000000:0BB8 00000000000000000000000000000000:0000 0A
   1: 00000000000000000000000001000000:1F91 00000000000000000000000000000000:0000 0A
";

    #[test]
    fn parses_listen_sockets_and_decodes_addresses() {
        let sockets = parse_proc_net_tcp(PROC_TCP);
        assert_eq!(sockets.len(), 2);

        let web = sockets.iter().find(|s| s.port == 8080).unwrap();
        assert_eq!(web.addr, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert!(!web.loopback_only);

        let db = sockets.iter().find(|s| s.port == 5432).unwrap();
        assert_eq!(db.addr, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert!(db.loopback_only);
    }

    #[test]
    fn parses_v6_sockets() {
        let sockets = parse_proc_net_tcp(PROC_TCP6);
        assert_eq!(sockets.len(), 2);

        let any = sockets.iter().find(|s| s.port == 3000).unwrap();
        assert!(!any.loopback_only);

        let lo = sockets.iter().find(|s| s.port == 8081).unwrap();
        assert_eq!(lo.addr, IpAddr::V6(Ipv6Addr::LOCALHOST));
        assert!(lo.loopback_only);
    }

    #[test]
    fn dual_bind_port_is_reachable() {
        // Same port bound on loopback and 0.0.0.0: not loopback-only.
        let contents = "\
header
   0: 0100007F:1F90 00000000:0000 0A
   1: 00000000:1F90 00000000:0000 0A
";
        let sockets = parse_proc_net_tcp(contents);
        assert_eq!(sockets.len(), 1);
        assert!(!sockets[0].loopback_only);
    }

    #[test]
    fn merge_prefers_reachable_binds() {
        let v4 = vec![ListenSocket {
            port: 8080,
            addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            loopback_only: true,
        }];
        let v6 = vec![ListenSocket {
            port: 8080,
            addr: IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            loopback_only: false,
        }];
        let merged = merge_listen_sets(v4, v6);
        assert_eq!(merged.len(), 1);
        assert!(!merged[0].loopback_only);
    }

    #[test]
    fn prop_select_main_port_priority() {
        // Preference list beats lowest port.
        assert_eq!(
            select_main_port(&[8080, 3000, 9000], &[5000, 5001], None, None),
            Some(8080)
        );
        // LISTEN∩EXPOSE beats the preference list.
        assert_eq!(
            select_main_port(&[9000, 3000], &[3000, 5001], None, None),
            Some(3000)
        );
        // Overrides beat everything; user beats config.
        assert_eq!(
            select_main_port(&[8080, 3000], &[8080], Some(9999), Some(1234)),
            Some(9999)
        );
        assert_eq!(
            select_main_port(&[8080, 3000], &[8080], None, Some(1234)),
            Some(1234)
        );
        // No intersection, no preferred port: lowest wins.
        assert_eq!(
            select_main_port(&[9100, 9050], &[], None, None),
            Some(9050)
        );
        // Nothing listening and no overrides: nothing to pick.
        assert_eq!(select_main_port(&[], &[], None, None), None);
    }

    #[test]
    fn parses_docker_port_lines() {
        let output = "8080/tcp -> 127.0.0.1:49153\n443/tcp -> 0.0.0.0:8443\ngarbage line\n";
        let mappings = parse_docker_port_output(output);
        assert_eq!(mappings.len(), 2);
        assert_eq!(mappings[0].container_port, 8080);
        assert_eq!(mappings[0].host_ip, "127.0.0.1");
        assert_eq!(mappings[0].host_port, 49153);
        assert_eq!(mappings[1].host_port, 8443);
    }

    #[tokio::test]
    async fn probe_reaches_live_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(probe_tcp(port, Duration::from_secs(1)).await);
        drop(listener);
    }

    #[tokio::test]
    async fn probe_fails_on_closed_port() {
        // Bind then drop to find a port that is very likely closed.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        assert!(!probe_tcp(port, Duration::from_millis(300)).await);
    }
}
