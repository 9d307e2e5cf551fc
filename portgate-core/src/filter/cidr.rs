//! Address matching against exact, CIDR and wildcard specs

use ipnet::IpNet;
use std::net::IpAddr;

/// Check whether `address` falls inside `spec`.
///
/// * empty, `*`, `0.0.0.0/0` or `any` (any case) match everything
/// * a spec without `/` must equal `address` exactly, no normalisation
/// * `base/prefix` compares the leading `prefix` bits; families must agree
///
/// Anything unparsable yields `false`. A Deny rule with a malformed spec
/// therefore never matches, and the connection falls through to later rules.
pub fn matches(address: &str, spec: &str) -> bool {
    if is_wildcard(spec) {
        return true;
    }

    match spec.split_once('/') {
        None => address == spec,
        Some((base, prefix)) => in_subnet(address, base, prefix).unwrap_or(false),
    }
}

/// True for specs that match every address
pub fn is_wildcard(spec: &str) -> bool {
    let spec = spec.trim();
    spec.is_empty() || spec == "*" || spec == "0.0.0.0/0" || spec.eq_ignore_ascii_case("any")
}

fn in_subnet(address: &str, base: &str, prefix: &str) -> Option<bool> {
    let base: IpAddr = base.parse().ok()?;
    let prefix: u8 = prefix.trim().parse().ok()?;
    let address: IpAddr = address.parse().ok()?;

    // rejects prefixes wider than the family
    let net = IpNet::new(base, prefix).ok()?;
    Some(net.contains(&address))
}
