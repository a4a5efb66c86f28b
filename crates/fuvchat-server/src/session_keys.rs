//! Session-key exchange, responder side

use fuvchat_core::{ConnectionId, Result, ServerKeyPair};
use std::sync::Arc;
use tracing::{info, warn};

use crate::presence::PresenceRegistry;

/// Unwraps client session keys with the server's private key
#[derive(Debug)]
pub struct SessionKeyExchange {
    keypair: ServerKeyPair,
    presence: Arc<PresenceRegistry>,
}

impl SessionKeyExchange {
    pub fn new(keypair: ServerKeyPair, presence: Arc<PresenceRegistry>) -> Self {
        Self { keypair, presence }
    }

    /// PEM public key for the out-of-band key fetch
    pub fn public_key_pem(&self) -> Result<String> {
        self.keypair.public_key_pem()
    }

    /// Unwrap and store a connection's session key.
    ///
    /// On failure the connection keeps whatever key state it had and stays open.
    pub fn on_handshake(&self, connection: &ConnectionId, wrapped_b64: &str) -> Result<()> {
        match self.keypair.unwrap_session_key(wrapped_b64) {
            Ok(key) => {
                self.presence.install_key(connection, key);
                info!(conn = %connection, "Session key established");
                Ok(())
            }
            Err(e) => {
                warn!(conn = %connection, "Session key exchange failed: {}", e);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::keypair;
    use fuvchat_core::crypto::wrap_session_key;
    use fuvchat_core::SessionKey;

    #[test]
    fn test_handshake_installs_key() {
        let presence = Arc::new(PresenceRegistry::new(50));
        let exchange = SessionKeyExchange::new(keypair(), presence.clone());
        let connection = ConnectionId::new("c1");
        presence.open_session(&connection);

        let key = SessionKey::generate();
        let wrapped = wrap_session_key(&exchange.public_key_pem().unwrap(), &key).unwrap();
        exchange.on_handshake(&connection, &wrapped).unwrap();

        assert!(presence.key_ready(&connection));
        assert_eq!(presence.session_key(&connection), Some(key));
    }

    #[test]
    fn test_bad_handshake_leaves_key_unset() {
        let presence = Arc::new(PresenceRegistry::new(50));
        let exchange = SessionKeyExchange::new(keypair(), presence.clone());
        let connection = ConnectionId::new("c1");
        presence.open_session(&connection);

        assert!(exchange.on_handshake(&connection, "@@not-base64@@").is_err());
        assert!(!presence.key_ready(&connection));
        assert!(presence.is_connected(&connection));
    }
}
