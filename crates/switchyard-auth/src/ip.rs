//! Allow and deny lists of addresses and CIDR ranges

use std::net::IpAddr;

use ipnetwork::IpNetwork;
use switchyard_core::GatewayError;

fn parse_entry(entry: &str) -> Result<IpNetwork, GatewayError> {
    let entry = entry.trim();
    if let Ok(network) = entry.parse::<IpNetwork>() {
        return Ok(network);
    }

    entry
        .parse::<IpAddr>()
        .map(IpNetwork::from)
        .map_err(|_| GatewayError::Config(format!("invalid ip list entry `{entry}`")))
}

fn any_contains(entries: &[String], ip: IpAddr) -> Result<bool, GatewayError> {
    for entry in entries {
        if parse_entry(entry)?.contains(ip) {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Check a client address against an entity's lists
///
/// The deny list wins over the allow list and an empty allow list admits
/// everyone. An unknown client address is rejected only when an allow list
/// is configured. A malformed entry fails closed with a configuration error.
pub fn check(client_ip: Option<IpAddr>, allow: &[String], deny: &[String]) -> Result<(), GatewayError> {
    let Some(ip) = client_ip else {
        if allow.is_empty() {
            return Ok(());
        }
        return Err(GatewayError::IpNotAllowed {
            ip: "unknown".to_owned(),
        });
    };

    if any_contains(deny, ip)? {
        tracing::debug!(%ip, "client address is on the deny list");
        return Err(GatewayError::IpNotAllowed { ip: ip.to_string() });
    }

    if allow.is_empty() || any_contains(allow, ip)? {
        return Ok(());
    }

    tracing::debug!(%ip, "client address is not on the allow list");
    Err(GatewayError::IpNotAllowed { ip: ip.to_string() })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(entries: &[&str]) -> Vec<String> {
        entries.iter().map(|&e| e.to_owned()).collect()
    }

    fn ip(s: &str) -> Option<IpAddr> {
        Some(s.parse().unwrap())
    }

    #[test]
    fn empty_lists_allow_everyone() {
        assert!(check(ip("203.0.113.7"), &[], &[]).is_ok());
        assert!(check(None, &[], &[]).is_ok());
    }

    #[test]
    fn cidr_and_single_address_entries() {
        let allow = list(&["10.0.0.0/8", "192.168.1.5"]);
        assert!(check(ip("10.20.30.40"), &allow, &[]).is_ok());
        assert!(check(ip("192.168.1.5"), &allow, &[]).is_ok());
        assert!(matches!(
            check(ip("192.168.1.6"), &allow, &[]),
            Err(GatewayError::IpNotAllowed { .. })
        ));
    }

    #[test]
    fn deny_wins_over_allow() {
        let allow = list(&["10.0.0.0/8"]);
        let deny = list(&["10.1.0.0/16"]);
        assert!(check(ip("10.2.0.1"), &allow, &deny).is_ok());
        assert!(matches!(
            check(ip("10.1.2.3"), &allow, &deny),
            Err(GatewayError::IpNotAllowed { .. })
        ));
    }

    #[test]
    fn ipv6_ranges() {
        let deny = list(&["2001:db8::/32"]);
        assert!(check(ip("2001:db8::1"), &[], &deny).is_err());
        assert!(check(ip("2001:db9::1"), &[], &deny).is_ok());
    }

    #[test]
    fn malformed_entry_fails_closed() {
        let allow = list(&["not-an-address"]);
        assert!(matches!(
            check(ip("10.0.0.1"), &allow, &[]),
            Err(GatewayError::Config(_))
        ));
    }

    #[test]
    fn unknown_address_with_allow_list_is_rejected() {
        let allow = list(&["10.0.0.0/8"]);
        assert!(matches!(check(None, &allow, &[]), Err(GatewayError::IpNotAllowed { .. })));
    }
}
