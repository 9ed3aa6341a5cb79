//! IPv4 address space helpers.
//!
//! Addresses are handled as `u32` indices so batches are plain integer
//! ranges; dotted-quad strings only appear at the network edge.

use std::net::Ipv4Addr;

/// Lowest index handed out by the allocator (`1.1.1.1`).
pub const FIRST_ADDRESS_INDEX: u32 = 0x0101_0101;

/// Highest index handed out by the allocator (`255.255.255.254`).
pub const LAST_ADDRESS_INDEX: u32 = u32::MAX - 1;

pub fn index_to_address(index: u32) -> String {
    Ipv4Addr::from(index).to_string()
}

pub fn address_to_index(address: &str) -> Option<u32> {
    address.trim().parse::<Ipv4Addr>().ok().map(u32::from)
}

/// True when `host` parses as a dotted-quad IPv4 literal.
pub fn is_ipv4_literal(host: &str) -> bool {
    host.parse::<Ipv4Addr>().is_ok()
}

/// Expand `[start, start + count)` into `(index, dotted)` pairs.
///
/// The range is clipped at the top of the 32-bit space rather than wrapping.
pub fn enumerate_range(start: u32, count: u32) -> impl Iterator<Item = (u32, String)> {
    let end = (start as u64 + count as u64).min(u32::MAX as u64 + 1);
    (start as u64..end).map(|i| {
        let index = i as u32;
        (index, index_to_address(index))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_conversions() {
        assert_eq!(index_to_address(FIRST_ADDRESS_INDEX), "1.1.1.1");
        assert_eq!(index_to_address(LAST_ADDRESS_INDEX), "255.255.255.254");
        assert_eq!(index_to_address(0), "0.0.0.0");
        assert_eq!(address_to_index("203.0.113.9"), Some(0xCB00_7109));
        assert_eq!(address_to_index("not.an.ip.addr"), None);
        assert_eq!(address_to_index("256.0.0.1"), None);
    }

    #[test]
    fn test_round_trip_sampled_space() {
        // Stride through the whole space plus both edges.
        let mut index: u64 = 0;
        while index <= u32::MAX as u64 {
            let i = index as u32;
            assert_eq!(address_to_index(&index_to_address(i)), Some(i));
            index += 65_521;
        }
        for i in [0, 1, 255, 256, u32::MAX - 1, u32::MAX] {
            assert_eq!(address_to_index(&index_to_address(i)), Some(i));
        }
    }

    #[test]
    fn test_enumerate_range_clips_at_top() {
        let all: Vec<_> = enumerate_range(u32::MAX - 1, 10).collect();
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].1, "255.255.255.255");

        let batch: Vec<_> = enumerate_range(FIRST_ADDRESS_INDEX, 3).collect();
        assert_eq!(batch[0], (FIRST_ADDRESS_INDEX, "1.1.1.1".to_string()));
        assert_eq!(batch[2].1, "1.1.1.3");
    }

    #[test]
    fn test_ipv4_literal_detection() {
        assert!(is_ipv4_literal("203.0.113.5"));
        assert!(!is_ipv4_literal("example.com"));
        assert!(!is_ipv4_literal(""));
    }
}
