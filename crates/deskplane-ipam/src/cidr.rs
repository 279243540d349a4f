//! CIDR parsing and address-space arithmetic.
//!
//! Pools are IPv4. The usable range of a block excludes the network and
//! broadcast addresses, so a /30 yields exactly two usable addresses.

use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;

use crate::error::{IpamError, IpamResult};

/// Widest accepted prefix. Anything wider would materialize more than
/// 65k address rows at pool creation.
pub const MIN_PREFIX: u8 = 16;

/// Narrowest accepted prefix. /31 and /32 have no usable host range.
pub const MAX_PREFIX: u8 = 30;

/// Parse and validate a pool CIDR. Host bits are tolerated on input
/// (`10.0.0.5/24` normalizes to `10.0.0.0/24`).
pub fn parse_pool_cidr(cidr: &str) -> IpamResult<Ipv4Network> {
    let net: Ipv4Network = cidr
        .parse()
        .map_err(|e| IpamError::InvalidCidr(format!("{cidr}: {e}")))?;
    if net.prefix() < MIN_PREFIX || net.prefix() > MAX_PREFIX {
        return Err(IpamError::InvalidCidr(format!(
            "{cidr}: prefix must be /{MIN_PREFIX}..=/{MAX_PREFIX}"
        )));
    }
    // Normalize away any host bits.
    Ok(Ipv4Network::new(net.network(), net.prefix())
        .map_err(|e| IpamError::InvalidCidr(format!("{cidr}: {e}")))?)
}

/// First and last usable address of a block (network + 1, broadcast - 1).
pub fn usable_range(net: &Ipv4Network) -> (Ipv4Addr, Ipv4Addr) {
    let first = Ipv4Addr::from(u32::from(net.network()) + 1);
    let last = Ipv4Addr::from(u32::from(net.broadcast()) - 1);
    (first, last)
}

/// Iterate every usable address of a block in ascending order.
pub fn usable_addresses(net: &Ipv4Network) -> impl Iterator<Item = Ipv4Addr> {
    let (first, last) = usable_range(net);
    (u32::from(first)..=u32::from(last)).map(Ipv4Addr::from)
}

/// True if `addr` lies within the usable range of `net`.
pub fn is_usable(net: &Ipv4Network, addr: Ipv4Addr) -> bool {
    let (first, last) = usable_range(net);
    (u32::from(first)..=u32::from(last)).contains(&u32::from(addr))
}

/// The address `n` steps above `addr`, or None on overflow.
pub fn offset(addr: Ipv4Addr, n: u32) -> Option<Ipv4Addr> {
    u32::from(addr).checked_add(n).map(Ipv4Addr::from)
}
