use dns_lookup::{lookup_addr, lookup_host};
use std::net::IpAddr;

use crate::error::{IcmpError, Result};
use crate::icmp::Family;

/// Resolves `host` to every address of the wanted family.
///
/// Literal addresses are returned as is, provided they match `family`.
pub fn resolve_all(host: &str, family: Option<Family>) -> Result<Vec<IpAddr>> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return match family {
            Some(family) if Family::of(&ip) != family => Err(IcmpError::NameLookup(format!(
                "{} is not an {} address",
                host, family
            ))),
            _ => Ok(vec![ip]),
        };
    }

    let addresses = lookup_host(host).map_err(|e| IcmpError::NameLookup(format!("{}: {}", host, e)))?;
    log::debug!("{} resolved to {:?}", host, addresses);

    let filtered: Vec<IpAddr> = addresses
        .into_iter()
        .filter(|addr| family.is_none_or(|family| Family::of(addr) == family))
        .collect();

    if filtered.is_empty() {
        return Err(IcmpError::NameLookup(match family {
            Some(family) => format!("no {} addresses found for {}", family, host),
            None => format!("no addresses found for {}", host),
        }));
    }
    Ok(filtered)
}

/// Picks the address to probe: IPv4 first unless IPv6 is forced.
pub fn preferred(addresses: &[IpAddr], family: Option<Family>) -> Option<IpAddr> {
    let wanted = family.unwrap_or(Family::V4);
    addresses
        .iter()
        .find(|addr| Family::of(addr) == wanted)
        .or_else(|| addresses.first())
        .copied()
}

pub async fn resolve_hostname(host: &str, family: Option<Family>) -> Result<IpAddr> {
    let addresses = tokio::task::spawn_blocking({
        let host = host.to_string();
        move || resolve_all(&host, family)
    })
    .await
    .map_err(|e| IcmpError::NameLookup(e.to_string()))??;

    preferred(&addresses, family).ok_or_else(|| IcmpError::NameLookup(format!("no suitable address for {}", host)))
}

pub async fn reverse_lookup(ip: IpAddr) -> Option<String> {
    tokio::task::spawn_blocking(move || lookup_addr(&ip).ok())
        .await
        .ok()
        .flatten()
}
