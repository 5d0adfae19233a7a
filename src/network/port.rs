//! Port specifications and host port preflight

use crate::container::{PortMapping, Protocol};
use crate::error::{Result, StevedoreError};
use regex::Regex;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, UdpSocket};
use std::sync::OnceLock;

fn port_spec_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^(?:(?P<ip>\d{1,3}(?:\.\d{1,3}){3}|\[[0-9A-Fa-f:.]+\]):)?(?:(?P<host>\d*(?:-\d+)?):)?(?P<container>\d+(?:-\d+)?)(?:/(?P<proto>[A-Za-z]+))?$",
        )
        .expect("port spec pattern is valid")
    })
}

/// Parse a short port spec: `[ip:][host:]container[/protocol]`
///
/// Ranges (`8000-8002:9000-9002`) expand into one mapping per port and must
/// have equal lengths on both sides.
pub fn parse_port_spec(spec: &str) -> Result<Vec<PortMapping>> {
    let invalid = |reason: &str| {
        StevedoreError::Configuration(format!("Invalid port spec '{}': {}", spec, reason))
    };

    let caps = port_spec_regex()
        .captures(spec.trim())
        .ok_or_else(|| invalid("expected [ip:][host:]container[/protocol]"))?;

    let host_ip = caps.name("ip").map(|m| {
        m.as_str()
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string()
    });
    let protocol = parse_protocol(caps.name("proto").map(|m| m.as_str()))
        .map_err(|e| invalid(&e))?;

    let (container_start, container_end) =
        parse_range(&caps["container"]).map_err(|e| invalid(&e))?;
    let host = caps.name("host").map(|m| m.as_str());
    if host == Some("") && host_ip.is_none() {
        return Err(invalid("missing host port before ':'"));
    }
    let host = host.filter(|s| !s.is_empty());
    let host_range = match host {
        Some(h) => Some(parse_range(h).map_err(|e| invalid(&e))?),
        None => None,
    };

    let count = container_end - container_start;
    if let Some((host_start, host_end)) = host_range {
        if host_end - host_start != count {
            return Err(invalid("host and container ranges differ in length"));
        }
    }

    let mappings = (0..=count)
        .map(|offset| PortMapping {
            host_ip: host_ip.clone(),
            host_port: host_range.map(|(start, _)| start + offset),
            container_port: container_start + offset,
            protocol,
        })
        .collect();

    Ok(mappings)
}

/// Parse an `expose` entry: `port[-port][/protocol]`
pub fn parse_expose(spec: &str) -> Result<Vec<u16>> {
    let invalid = |reason: &str| {
        StevedoreError::Configuration(format!("Invalid expose entry '{}': {}", spec, reason))
    };
    let (ports, proto) = match spec.trim().split_once('/') {
        Some((ports, proto)) => (ports, Some(proto)),
        None => (spec.trim(), None),
    };
    parse_protocol(proto).map_err(|e| invalid(&e))?;
    let (start, end) = parse_range(ports).map_err(|e| invalid(&e))?;
    Ok((start..=end).collect())
}

/// Parse a protocol name, defaulting to tcp
pub fn parse_protocol(proto: Option<&str>) -> std::result::Result<Protocol, String> {
    match proto.map(|p| p.to_ascii_lowercase()) {
        None => Ok(Protocol::Tcp),
        Some(p) if p == "tcp" => Ok(Protocol::Tcp),
        Some(p) if p == "udp" => Ok(Protocol::Udp),
        Some(p) => Err(format!("unsupported protocol '{}'", p)),
    }
}

/// Parse a single port number
pub fn parse_port(value: &str) -> std::result::Result<u16, String> {
    let port: u16 = value
        .trim()
        .parse()
        .map_err(|_| format!("'{}' is not a valid port number", value))?;
    if port == 0 {
        return Err("port 0 is not allowed".to_string());
    }
    Ok(port)
}

fn parse_range(value: &str) -> std::result::Result<(u16, u16), String> {
    match value.split_once('-') {
        Some((start, end)) => {
            let start = parse_port(start)?;
            let end = parse_port(end)?;
            if end < start {
                return Err(format!("range {}-{} is reversed", start, end));
            }
            Ok((start, end))
        }
        None => {
            let port = parse_port(value)?;
            Ok((port, port))
        }
    }
}

/// Check that a host port can be bound right now
///
/// Returns the OS error text when the port is taken or the address is
/// unusable.
pub fn probe_host_port(mapping: &PortMapping) -> std::result::Result<(), String> {
    let port = match mapping.host_port {
        Some(port) => port,
        None => return Ok(()),
    };

    let ip: IpAddr = match &mapping.host_ip {
        Some(ip) => ip
            .parse()
            .map_err(|_| format!("invalid host address '{}'", ip))?,
        None => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
    };
    let addr = SocketAddr::new(ip, port);

    match mapping.protocol {
        Protocol::Tcp => TcpListener::bind(addr).map(drop),
        Protocol::Udp => UdpSocket::bind(addr).map(drop),
    }
    .map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_host_and_container() {
        let mappings = parse_port_spec("8080:80").unwrap();
        assert_eq!(mappings.len(), 1);
        assert_eq!(mappings[0].host_port, Some(8080));
        assert_eq!(mappings[0].container_port, 80);
        assert_eq!(mappings[0].protocol, Protocol::Tcp);
        assert!(mappings[0].host_ip.is_none());
    }

    #[test]
    fn test_parse_container_only() {
        let mappings = parse_port_spec("5432").unwrap();
        assert_eq!(mappings[0].host_port, None);
        assert_eq!(mappings[0].container_port, 5432);
    }

    #[test]
    fn test_parse_ip_and_protocol() {
        let mappings = parse_port_spec("127.0.0.1:5353:53/udp").unwrap();
        assert_eq!(mappings[0].host_ip.as_deref(), Some("127.0.0.1"));
        assert_eq!(mappings[0].host_port, Some(5353));
        assert_eq!(mappings[0].protocol, Protocol::Udp);

        let mappings = parse_port_spec("127.0.0.1::80").unwrap();
        assert_eq!(mappings[0].host_port, None);

        let mappings = parse_port_spec("[::1]:8080:80").unwrap();
        assert_eq!(mappings[0].host_ip.as_deref(), Some("::1"));
    }

    #[test]
    fn test_parse_ranges() {
        let mappings = parse_port_spec("9000-9002:8000-8002").unwrap();
        assert_eq!(mappings.len(), 3);
        assert_eq!(mappings[2].host_port, Some(9002));
        assert_eq!(mappings[2].container_port, 8002);

        assert!(parse_port_spec("9000-9001:8000-8002").is_err());
    }

    #[test]
    fn test_parse_rejects_invalid() {
        assert!(parse_port_spec("").is_err());
        assert!(parse_port_spec(":80").is_err());
        assert!(parse_port_spec("70000:80").is_err());
        assert!(parse_port_spec("8080:80/sctp").is_err());
        assert!(parse_port_spec("abc:80").is_err());
    }

    #[test]
    fn test_parse_expose() {
        assert_eq!(parse_expose("5432").unwrap(), vec![5432]);
        assert_eq!(parse_expose("7000-7002/tcp").unwrap(), vec![7000, 7001, 7002]);
        assert!(parse_expose("x").is_err());
    }

    #[test]
    fn test_probe_detects_bound_port() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let mapping = PortMapping {
            host_ip: Some("127.0.0.1".to_string()),
            host_port: Some(port),
            container_port: 80,
            protocol: Protocol::Tcp,
        };
        assert!(probe_host_port(&mapping).is_err());

        drop(listener);
        assert!(probe_host_port(&mapping).is_ok());
    }
}
