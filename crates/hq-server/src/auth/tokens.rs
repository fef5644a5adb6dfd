//! Single-use session access tokens.
//!
//! Minted at session creation, handed to the worker through its task
//! environment, and consumed exactly once when the worker dials the relay.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use dashmap::DashMap;
use hq_core::ids::SessionId;
use rand::RngCore;

/// Token bytes before encoding.
const TOKEN_BYTES: usize = 32;

/// In-memory token table: token → session it unlocks.
#[derive(Debug, Default)]
pub struct AccessTokenService {
    tokens: DashMap<String, SessionId>,
}

impl AccessTokenService {
    /// Fresh empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a token for a session.
    pub fn mint(&self, session_id: &SessionId) -> String {
        let mut bytes = [0u8; TOKEN_BYTES];
        rand::rng().fill_bytes(&mut bytes);
        let token = URL_SAFE_NO_PAD.encode(bytes);
        let _ = self.tokens.insert(token.clone(), session_id.clone());
        token
    }

    /// Consume a token for a specific session.
    ///
    /// Succeeds at most once per token, and only for the session the token
    /// was minted for. Unknown tokens, replays, and cross-session attempts
    /// all fail identically.
    pub fn consume(&self, token: &str, session_id: &SessionId) -> bool {
        self.tokens
            .remove_if(token, |_, owner| owner == session_id)
            .is_some()
    }

    /// Drop any outstanding token for a session (termination cleanup).
    pub fn revoke_session(&self, session_id: &SessionId) {
        self.tokens.retain(|_, owner| owner != session_id);
    }

    /// Outstanding token count.
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Whether no tokens are outstanding.
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_is_single_use() {
        let service = AccessTokenService::new();
        let session = SessionId::from_string("sess_1");
        let token = service.mint(&session);
        assert!(service.consume(&token, &session));
        assert!(!service.consume(&token, &session), "replay must fail");
    }

    #[test]
    fn token_is_session_bound() {
        let service = AccessTokenService::new();
        let session = SessionId::from_string("sess_1");
        let other = SessionId::from_string("sess_2");
        let token = service.mint(&session);
        assert!(!service.consume(&token, &other));
        // The failed cross-session attempt must not have consumed it.
        assert!(service.consume(&token, &session));
    }

    #[test]
    fn unknown_token_fails() {
        let service = AccessTokenService::new();
        assert!(!service.consume("bogus", &SessionId::from_string("sess_1")));
    }

    #[test]
    fn revoke_session_drops_tokens() {
        let service = AccessTokenService::new();
        let session = SessionId::from_string("sess_1");
        let token = service.mint(&session);
        service.revoke_session(&session);
        assert!(!service.consume(&token, &session));
        assert!(service.is_empty());
    }

    #[test]
    fn tokens_are_unique_and_url_safe() {
        let service = AccessTokenService::new();
        let session = SessionId::from_string("sess_1");
        let a = service.mint(&session);
        let b = service.mint(&session);
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }
}
