//! Input validation
//!
//! Pure predicates shared by the client (pre-flight checks before any network
//! activity) and the host (re-checked on every join).

use std::net::Ipv4Addr;

const NAME_MIN_LEN: usize = 4;
const NAME_MAX_LEN: usize = 20;

fn is_valid_name(s: &str) -> bool {
    let len = s.chars().count();
    (NAME_MIN_LEN..=NAME_MAX_LEN).contains(&len) && s.chars().all(|c| c.is_ascii_alphanumeric())
}

/// True iff `s` is 4 to 20 ASCII alphanumeric characters
pub fn validate_nickname(s: &str) -> bool {
    is_valid_name(s)
}

/// Room names follow the nickname rule
pub fn validate_room_name(s: &str) -> bool {
    is_valid_name(s)
}

/// True iff `s` is a dotted-quad IPv4 address
pub fn validate_ipv4(s: &str) -> bool {
    s.parse::<Ipv4Addr>().is_ok()
}

/// True iff `port` fits in 0..=65535
pub fn validate_port(port: i64) -> bool {
    (0..=i64::from(u16::MAX)).contains(&port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nickname_length_boundaries() {
        assert!(!validate_nickname("abc"));
        assert!(validate_nickname("abcd"));
        assert!(validate_nickname("a".repeat(20).as_str()));
        assert!(!validate_nickname("a".repeat(21).as_str()));
        assert!(!validate_nickname(""));
    }

    #[test]
    fn test_nickname_charset() {
        assert!(validate_nickname("Alice1"));
        assert!(validate_nickname("0000"));
        assert!(!validate_nickname("Alice 1"));
        assert!(!validate_nickname("Alice_1"));
        assert!(!validate_nickname("Alice-1"));
        assert!(!validate_nickname("Ålice1"));
    }

    #[test]
    fn test_room_name_same_rule() {
        assert!(validate_room_name("TestRoom1"));
        assert!(!validate_room_name("Test Room"));
        assert!(!validate_room_name("abc"));
    }

    #[test]
    fn test_ipv4() {
        assert!(validate_ipv4("127.0.0.1"));
        assert!(validate_ipv4("192.168.1.254"));
        assert!(!validate_ipv4("999.999.999.999"));
        assert!(!validate_ipv4("1.2.3"));
        assert!(!validate_ipv4("localhost"));
        assert!(!validate_ipv4("::1"));
    }

    #[test]
    fn test_port_range() {
        assert!(validate_port(0));
        assert!(validate_port(24872));
        assert!(validate_port(65535));
        assert!(!validate_port(65536));
        assert!(!validate_port(-1));
    }
}
