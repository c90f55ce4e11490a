//! Input validation for tabserv
//!
//! Every value that ends up on an iptables command line passes through here
//! first. Arguments are never shell-interpolated, but a token containing
//! whitespace would still split into extra iptables options once the rule is
//! re-read from its canonical key.

use ipnetwork::IpNetwork;

/// Maximum length of a subscription topic
pub const MAX_TOPIC_LEN: usize = 32;

/// Validates a single port number.
///
/// # Errors
///
/// Returns `Err` if port is 0 (reserved).
pub fn validate_port(port: u16) -> Result<u16, String> {
    if port == 0 {
        Err("Port must be between 1 and 65535".to_string())
    } else {
        Ok(port)
    }
}

/// Validates a rule source: a bare IPv4/IPv6 address or a CIDR network.
///
/// # Errors
///
/// Returns `Err` if the input is empty or does not parse as an address/network.
pub fn validate_source_address(input: &str) -> Result<IpNetwork, String> {
    if input.is_empty() {
        return Err("Source address cannot be empty".to_string());
    }

    input
        .parse::<IpNetwork>()
        .map_err(|e| format!("Invalid source address '{input}': {e}"))
}

/// Validates an event topic name.
///
/// Topics are short lowercase-friendly identifiers such as `tcp`.
///
/// # Errors
///
/// Returns `Err` if the topic is empty, too long, or contains characters other
/// than ASCII alphanumerics, dash, underscore and dot.
pub fn validate_topic(topic: &str) -> Result<String, String> {
    if topic.is_empty() {
        return Err("Topic cannot be empty".to_string());
    }

    if topic.len() > MAX_TOPIC_LEN {
        return Err(format!("Topic too long (max {MAX_TOPIC_LEN} characters)"));
    }

    if !topic
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err("Topic contains invalid characters".to_string());
    }

    Ok(topic.to_string())
}

/// Checks if an IP is in a reserved range and returns informational warning.
///
/// This is informational only and does not block the rule.
pub fn check_reserved_ip(ip: IpNetwork) -> Option<String> {
    use std::net::IpAddr;

    match ip.ip() {
        IpAddr::V4(ipv4) => {
            let octets = ipv4.octets();

            // RFC 1918 private ranges
            if octets[0] == 10
                || (octets[0] == 172 && (16..=31).contains(&octets[1]))
                || (octets[0] == 192 && octets[1] == 168)
            {
                return Some("Private IP range (RFC 1918)".to_string());
            }

            if octets[0] == 127 {
                return Some("Loopback range (127.x) - local services may lose access".to_string());
            }

            if octets[0] == 169 && octets[1] == 254 {
                return Some("Link-local range (169.254.x.x) - APIPA addresses".to_string());
            }

            None
        }
        IpAddr::V6(ipv6) => {
            if ipv6.is_loopback() {
                return Some("IPv6 loopback (::1) - local services may lose access".to_string());
            }

            if ipv6.segments()[0] & 0xffc0 == 0xfe80 {
                return Some("IPv6 link-local (fe80::/10) - local network only".to_string());
            }

            None
        }
    }
}
