//! Target addressing for outbound connections.

use std::fmt;
use std::net::IpAddr;

use crate::error::BridgeError;

/// Remote endpoint requested by the client, taken from the upgrade path.
///
/// The port is kept as the raw path segment: an unparsable port must surface
/// at connect time as a failure frame on the channel, not as a routing error.
#[derive(Debug, Clone)]
pub struct Target {
    host: String,
    port: String,
}

impl Target {
    pub fn new(host: impl Into<String>, port: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: port.into(),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Raw port segment, for log records.
    pub fn port_raw(&self) -> &str {
        &self.port
    }

    /// Validated port number (1-65535).
    pub fn port(&self) -> Result<u16, BridgeError> {
        match self.port.parse::<u16>() {
            Ok(0) | Err(_) => Err(BridgeError::InvalidPort {
                port: self.port.clone(),
            }),
            Ok(port) => Ok(port),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Hostnames that always refer to the bridge machine itself.
const LOCAL_HOSTS: [&str; 4] = ["127.0.0.1", "localhost", "::1", "0.0.0.0"];

/// Whether a host names the bridge machine or a private network.
///
/// Only literal hostnames and IP addresses are checked; a public DNS name
/// resolving to a private address is not caught here.
pub fn is_local_host(host: &str) -> bool {
    if LOCAL_HOSTS.contains(&host) {
        return true;
    }
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => ip.is_loopback() || ip.is_private() || ip.is_unspecified(),
        Ok(IpAddr::V6(ip)) => {
            // fc00::/7 unique-local range
            let unique_local = (ip.segments()[0] & 0xfe00) == 0xfc00;
            ip.is_loopback() || ip.is_unspecified() || unique_local
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_valid_ports() {
        assert_eq!(Target::new("example.com", "22").port().unwrap(), 22);
        assert_eq!(Target::new("example.com", "65535").port().unwrap(), 65535);
    }

    #[test]
    fn rejects_invalid_ports() {
        assert!(Target::new("example.com", "0").port().is_err());
        assert!(Target::new("example.com", "65536").port().is_err());
        assert!(Target::new("example.com", "ssh").port().is_err());
        assert!(Target::new("example.com", "").port().is_err());
        assert!(Target::new("example.com", "-1").port().is_err());
    }

    #[test]
    fn detects_local_hosts() {
        assert!(is_local_host("localhost"));
        assert!(is_local_host("127.0.0.1"));
        assert!(is_local_host("127.8.8.8"));
        assert!(is_local_host("::1"));
        assert!(is_local_host("0.0.0.0"));
        assert!(is_local_host("10.0.0.1"));
        assert!(is_local_host("172.16.4.2"));
        assert!(is_local_host("192.168.1.1"));
        assert!(is_local_host("fc00::1"));
    }

    #[test]
    fn allows_public_hosts() {
        assert!(!is_local_host("example.com"));
        assert!(!is_local_host("1.1.1.1"));
        assert!(!is_local_host("2606:4700:4700::1111"));
    }
}
