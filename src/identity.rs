//! Identity normalization for the remote messaging network.
//!
//! Remote identities arrive decorated with a device-instance suffix
//! (`user:device@server`). Classification and contact keying compare the
//! stripped form so that the same account on any device matches.

/// Normalize a remote identity by stripping the device-instance suffix.
///
/// `"4915551234:17@s.net"` → `"4915551234@s.net"`. Identities without an
/// `@` part are stripped the same way. Already-normalized input is returned
/// unchanged.
#[must_use]
pub fn normalize(identity: &str) -> String {
    match identity.split_once('@') {
        Some((user, server)) => {
            let user = user.split(':').next().unwrap_or(user);
            format!("{user}@{server}")
        }
        None => identity
            .split(':')
            .next()
            .unwrap_or(identity)
            .to_string(),
    }
}

/// Whether two identities refer to the same account after normalization.
#[must_use]
pub fn same_account(a: &str, b: &str) -> bool {
    normalize(a) == normalize(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strips_device_suffix() {
        assert_eq!(normalize("4915551234:17@s.net"), "4915551234@s.net");
    }

    #[test]
    fn test_plain_identity_unchanged() {
        assert_eq!(normalize("4915551234@s.net"), "4915551234@s.net");
    }

    #[test]
    fn test_no_server_part() {
        assert_eq!(normalize("4915551234:3"), "4915551234");
    }

    #[test]
    fn test_same_account_across_devices() {
        assert!(same_account("a:1@s.net", "a:9@s.net"));
        assert!(!same_account("a@s.net", "b@s.net"));
    }
}
