//! Address allocation over IPv4 CIDR space
//!
//! Pure first-fit allocation: given every block already in use, find the
//! lowest aligned block of the requested prefix length inside a parent range
//! that overlaps none of them. Persistence and conflict handling live in
//! [`crate::provisioning`].

use std::net::Ipv4Addr;
use std::str::FromStr;

use ipnet::Ipv4Net;

use crate::error::{ControlError, ControlResult};

/// Parse `a.b.c.d/n`, or a bare address as a /32
pub fn parse_cidr(value: &str) -> ControlResult<Ipv4Net> {
    let value = value.trim();
    if value.contains('/') {
        Ipv4Net::from_str(value)
            .map_err(|e| ControlError::InvalidInput(format!("invalid CIDR '{}': {}", value, e)))
    } else {
        let addr = Ipv4Addr::from_str(value).map_err(|e| {
            ControlError::InvalidInput(format!("invalid address '{}': {}", value, e))
        })?;
        Ok(Ipv4Net::from(addr))
    }
}

fn align_up(value: u64, block: u64) -> u64 {
    value.div_ceil(block) * block
}

/// Lowest `/block_size` block inside `space` that overlaps nothing in `existing`
///
/// Returns `None` when the space is exhausted or the block is larger than the space.
pub fn find_next_available_cidr(
    existing: &[Ipv4Net],
    block_size: u8,
    space: Ipv4Net,
) -> Option<Ipv4Net> {
    if block_size > 32 || block_size < space.prefix_len() {
        return None;
    }

    let block = 1u64 << (32 - block_size);
    let space_start = u64::from(u32::from(space.network()));
    let space_end = u64::from(u32::from(space.broadcast()));

    let mut taken: Vec<(u64, u64)> = existing
        .iter()
        .map(|net| {
            (
                u64::from(u32::from(net.network())),
                u64::from(u32::from(net.broadcast())),
            )
        })
        .filter(|(start, end)| *end >= space_start && *start <= space_end)
        .collect();
    taken.sort_unstable();

    let mut candidate = align_up(space_start, block);
    for (start, end) in taken {
        if end < candidate {
            continue;
        }
        if candidate + block - 1 < start {
            break;
        }
        candidate = align_up(end + 1, block);
    }

    if candidate + block - 1 > space_end {
        return None;
    }

    Ipv4Net::new(Ipv4Addr::from(candidate as u32), block_size).ok()
}

/// Next site subnet carved from an exit node's anchor range
///
/// The anchor itself, normalized to the block size, is always treated as taken
/// so a site never overlaps the exit node's own address.
pub fn next_site_subnet(
    existing: &[Ipv4Net],
    block_size: u8,
    anchor: Ipv4Net,
) -> ControlResult<Ipv4Net> {
    let anchor_block = Ipv4Net::new(anchor.addr(), block_size)
        .map_err(|e| ControlError::InvalidInput(format!("invalid block size {}: {}", block_size, e)))?
        .trunc();

    let mut taken = Vec::with_capacity(existing.len() + 1);
    taken.extend_from_slice(existing);
    taken.push(anchor_block);

    find_next_available_cidr(&taken, block_size, anchor.trunc()).ok_or_else(|| {
        ControlError::CapacityExhausted(format!("no available subnet in {}", anchor.trunc()))
    })
}

/// Next free single address in an organization subnet
///
/// The network and broadcast addresses of the subnet are never handed out.
pub fn next_client_address(existing: &[Ipv4Addr], org_subnet: Ipv4Net) -> ControlResult<Ipv4Addr> {
    let space = org_subnet.trunc();

    let mut taken: Vec<Ipv4Net> = existing.iter().copied().map(Ipv4Net::from).collect();
    if space.prefix_len() < 31 {
        taken.push(Ipv4Net::from(space.network()));
        taken.push(Ipv4Net::from(space.broadcast()));
    }

    find_next_available_cidr(&taken, 32, space)
        .map(|net| net.addr())
        .ok_or_else(|| ControlError::CapacityExhausted(format!("no available address in {}", space)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> Ipv4Net {
        Ipv4Net::from_str(s).unwrap()
    }

    #[test]
    fn test_first_block_in_empty_space() {
        let found = find_next_available_cidr(&[], 30, net("100.89.128.0/24")).unwrap();
        assert_eq!(found, net("100.89.128.0/30"));
    }

    #[test]
    fn test_skips_taken_and_fills_gaps() {
        let existing = vec![
            net("100.89.128.0/30"),
            net("100.89.128.8/30"),
        ];
        let found = find_next_available_cidr(&existing, 30, net("100.89.128.0/24")).unwrap();
        assert_eq!(found, net("100.89.128.4/30"));
    }

    #[test]
    fn test_unaligned_existing_block_pushes_to_next_boundary() {
        // A /32 in the middle of the first /29 makes that whole /29 unusable
        let existing = vec![net("100.89.128.3/32")];
        let found = find_next_available_cidr(&existing, 29, net("100.89.128.0/24")).unwrap();
        assert_eq!(found, net("100.89.128.8/29"));
    }

    #[test]
    fn test_existing_outside_space_is_ignored() {
        let existing = vec![net("10.0.0.0/8")];
        let found = find_next_available_cidr(&existing, 30, net("100.89.128.0/24")).unwrap();
        assert_eq!(found, net("100.89.128.0/30"));
    }

    #[test]
    fn test_exhausted_space_returns_none() {
        let existing = vec![net("100.89.128.0/30")];
        assert!(find_next_available_cidr(&existing, 30, net("100.89.128.0/30")).is_none());
    }

    #[test]
    fn test_block_larger_than_space_returns_none() {
        assert!(find_next_available_cidr(&[], 16, net("100.89.128.0/24")).is_none());
    }

    #[test]
    fn test_site_subnet_never_overlaps_anchor() {
        let anchor = net("100.89.128.1/24");
        let first = next_site_subnet(&[], 30, anchor).unwrap();
        assert_eq!(first, net("100.89.128.4/30"));
        assert!(!first.contains(&anchor.addr()));
    }

    #[test]
    fn test_site_subnets_stay_disjoint_across_allocations() {
        let anchor = net("100.89.137.1/26");
        let mut allocated: Vec<Ipv4Net> = Vec::new();

        while let Ok(subnet) = next_site_subnet(&allocated, 30, anchor) {
            allocated.push(subnet);
        }

        // 16 blocks of /30 in a /26, one held by the anchor
        assert_eq!(allocated.len(), 15);

        let anchor_block = Ipv4Net::new(anchor.addr(), 30).unwrap().trunc();
        for (i, a) in allocated.iter().enumerate() {
            assert!(!a.contains(&anchor_block.network()));
            for b in allocated.iter().skip(i + 1) {
                assert!(!a.contains(&b.network()) && !b.contains(&a.network()));
            }
        }

        let err = next_site_subnet(&allocated, 30, anchor).unwrap_err();
        assert!(matches!(err, ControlError::CapacityExhausted(_)));
    }

    #[test]
    fn test_client_address_skips_network_and_used() {
        let subnet = net("100.90.128.0/24");
        let first = next_client_address(&[], subnet).unwrap();
        assert_eq!(first, Ipv4Addr::new(100, 90, 128, 1));

        let used = vec![Ipv4Addr::new(100, 90, 128, 1), Ipv4Addr::new(100, 90, 128, 2)];
        let next = next_client_address(&used, subnet).unwrap();
        assert_eq!(next, Ipv4Addr::new(100, 90, 128, 3));
    }

    #[test]
    fn test_client_address_exhaustion() {
        let subnet = net("100.90.128.0/30");
        let used = vec![Ipv4Addr::new(100, 90, 128, 1), Ipv4Addr::new(100, 90, 128, 2)];
        let err = next_client_address(&used, subnet).unwrap_err();
        assert!(matches!(err, ControlError::CapacityExhausted(_)));
    }

    #[test]
    fn test_parse_cidr_accepts_bare_address() {
        assert_eq!(parse_cidr("100.90.128.7").unwrap(), net("100.90.128.7/32"));
        assert_eq!(parse_cidr(" 10.0.0.0/8 ").unwrap(), net("10.0.0.0/8"));
        assert!(parse_cidr("not-an-ip").is_err());
    }
}
