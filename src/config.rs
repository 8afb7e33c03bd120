//! Environment-driven configuration, following the same "check a few
//! well-known variables, fall back to a sane default" shape as a desktop
//! audio server's socket/cookie discovery.

use crate::protocol::{DEFAULT_CONTROL_PORT, HANDSHAKE_MAGIC};

/// Determines the control-channel address to connect (or bind) to, checking
/// `BSDEBUG_CONTROL_ADDR` and falling back to `0.0.0.0:<default port>`.
pub fn control_addr_from_env() -> String {
    std::env::var("BSDEBUG_CONTROL_ADDR")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| format!("0.0.0.0:{DEFAULT_CONTROL_PORT}"))
}

/// Determines the handshake magic to expect/send, checking
/// `BSDEBUG_HANDSHAKE_MAGIC` and falling back to the protocol default.
///
/// Only useful for testing against an emulated server configured with a
/// nonstandard magic; real devices always use [`HANDSHAKE_MAGIC`].
pub fn handshake_magic_from_env() -> Vec<u8> {
    std::env::var("BSDEBUG_HANDSHAKE_MAGIC")
        .ok()
        .filter(|s| !s.is_empty())
        .map(|s| s.into_bytes())
        .unwrap_or_else(|| HANDSHAKE_MAGIC.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_addr_defaults_when_unset() {
        std::env::remove_var("BSDEBUG_CONTROL_ADDR");
        assert_eq!(control_addr_from_env(), format!("0.0.0.0:{DEFAULT_CONTROL_PORT}"));
    }

    #[test]
    fn handshake_magic_defaults_when_unset() {
        std::env::remove_var("BSDEBUG_HANDSHAKE_MAGIC");
        assert_eq!(handshake_magic_from_env(), HANDSHAKE_MAGIC.to_vec());
    }
}
