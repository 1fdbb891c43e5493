//! Hostname, DNS and address predicates

use std::net::{IpAddr, ToSocketAddrs};
use wildmatch::WildMatch;

/// True if `host` has no domain part.
pub fn is_plain_host_name(host: &str) -> bool {
    !host.contains('.')
}

/// Literal, case-sensitive suffix match.
pub fn dns_domain_is(host: &str, domain: &str) -> bool {
    host.ends_with(domain)
}

/// True on an exact match, or when an unqualified `host` is the first label
/// of `hostdom`.
pub fn local_host_or_domain_is(host: &str, hostdom: &str) -> bool {
    if host == hostdom {
        return true;
    }
    is_plain_host_name(host)
        && hostdom
            .strip_prefix(host)
            .is_some_and(|rest| rest.starts_with('.'))
}

pub fn is_resolvable(host: &str) -> bool {
    resolve(host).is_some()
}

/// First resolved address, or an empty string.
pub fn dns_resolve(host: &str) -> String {
    resolve(host).map(|ip| ip.to_string()).unwrap_or_default()
}

pub fn dns_domain_levels(host: &str) -> usize {
    host.matches('.').count()
}

/// Resolve `host` and compare it with `netip` under `netmask`.
///
/// The comparison is bitwise, so non-contiguous masks behave the way
/// legacy scripts expect. Families must agree; a v4 host never matches a
/// v6 network.
pub fn is_in_net(host: &str, netip: &str, netmask: &str) -> bool {
    let Some(address) = resolve(host) else {
        return false;
    };
    let (Ok(network), Ok(mask)) = (netip.trim().parse::<IpAddr>(), netmask.trim().parse::<IpAddr>())
    else {
        return false;
    };

    match (address, network, mask) {
        (IpAddr::V4(a), IpAddr::V4(n), IpAddr::V4(m)) => {
            let m = u32::from(m);
            u32::from(a) & m == u32::from(n) & m
        }
        (IpAddr::V6(a), IpAddr::V6(n), IpAddr::V6(m)) => {
            let m = u128::from(m);
            u128::from(a) & m == u128::from(n) & m
        }
        _ => false,
    }
}

/// Anchored shell-glob match: `*` is any run, `?` exactly one character,
/// everything else literal.
pub fn sh_exp_match(s: &str, shexp: &str) -> bool {
    WildMatch::new(shexp).matches(s)
}

/// Low 32 bits of an address as an integer. IPv6 yields its last four bytes,
/// unparseable input yields 0.
pub fn convert_addr(ip: &str) -> u32 {
    match ip.trim().parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => u32::from(v4),
        Ok(IpAddr::V6(v6)) => {
            let octets = v6.octets();
            u32::from_be_bytes([octets[12], octets[13], octets[14], octets[15]])
        }
        Err(_) => 0,
    }
}

/// Address of this machine, or `127.0.0.1` when it cannot be determined.
pub fn my_ip_address() -> String {
    local_hostname()
        .and_then(|name| resolve(&name))
        .map(|ip| ip.to_string())
        .unwrap_or_else(|| "127.0.0.1".to_string())
}

/// System resolver lookup, preferring IPv4 the way browsers do.
fn resolve(host: &str) -> Option<IpAddr> {
    let host = host.trim();
    if host.is_empty() {
        return None;
    }
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);

    let addrs: Vec<IpAddr> = match (host, 0).to_socket_addrs() {
        Ok(iter) => iter.map(|sa| sa.ip()).collect(),
        Err(e) => {
            tracing::debug!(host, error = %e, "name resolution failed");
            return None;
        }
    };

    addrs
        .iter()
        .find(|ip| ip.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
}

fn local_hostname() -> Option<String> {
    let name = gethostname::gethostname().to_string_lossy().into_owned();
    (!name.is_empty()).then_some(name)
}
