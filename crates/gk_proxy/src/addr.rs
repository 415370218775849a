use std::net::Ipv4Addr;

/// True when the address lies in 127.0.0.0/8, 10.0.0.0/8, 172.16.0.0/12 or
/// 192.168.0.0/16. Datagrams from these sources reach the game server without
/// an admission entry.
pub fn is_private(addr: Ipv4Addr) -> bool {
    let octets = addr.octets();
    match octets[0] {
        127 | 10 => true,
        172 => (16..=31).contains(&octets[1]),
        192 => octets[1] == 168,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_and_rfc1918_ranges_are_private() {
        assert!(is_private(Ipv4Addr::new(127, 0, 0, 1)));
        assert!(is_private(Ipv4Addr::new(127, 255, 0, 9)));
        assert!(is_private(Ipv4Addr::new(10, 0, 0, 1)));
        assert!(is_private(Ipv4Addr::new(10, 200, 13, 37)));
        assert!(is_private(Ipv4Addr::new(172, 16, 0, 1)));
        assert!(is_private(Ipv4Addr::new(172, 31, 255, 255)));
        assert!(is_private(Ipv4Addr::new(192, 168, 1, 1)));
    }

    #[test]
    fn range_boundaries_are_exact() {
        assert!(!is_private(Ipv4Addr::new(172, 15, 255, 255)));
        assert!(!is_private(Ipv4Addr::new(172, 32, 0, 0)));
        assert!(!is_private(Ipv4Addr::new(192, 167, 0, 1)));
        assert!(!is_private(Ipv4Addr::new(192, 169, 0, 1)));
        assert!(!is_private(Ipv4Addr::new(9, 255, 255, 255)));
        assert!(!is_private(Ipv4Addr::new(11, 0, 0, 0)));
        assert!(!is_private(Ipv4Addr::new(128, 0, 0, 1)));
    }

    #[test]
    fn public_addresses_are_not_private() {
        assert!(!is_private(Ipv4Addr::new(203, 0, 113, 5)));
        assert!(!is_private(Ipv4Addr::new(8, 8, 8, 8)));
        assert!(!is_private(Ipv4Addr::new(198, 51, 100, 9)));
    }
}
