//! Challenge-response authentication over a shared token.
//!
//! The master issues a random challenge per worker; the worker answers with
//! `hex(HMAC-SHA256(token, challenge))`. A challenge can be answered
//! successfully once, within its TTL. The resulting session stays valid for
//! the token expiry window, measured from when the challenge was issued. The
//! master renews a session `renew_before` ahead of its end, so a session that
//! keeps answering never lapses.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use hmac::{Hmac, Mac};
use rand::distributions::Alphanumeric;
use rand::Rng;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const TOKEN_LENGTH: usize = 43;
pub const CHALLENGE_LENGTH: usize = 32;
pub const DEFAULT_CHALLENGE_TTL: Duration = Duration::from_secs(300);
pub const DEFAULT_TOKEN_EXPIRY: Duration = Duration::from_secs(3600);
pub const DEFAULT_RENEW_BEFORE: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Failed to access auth token file {path}: {source}")]
    TokenFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn random_string(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

pub fn generate_token() -> String {
    random_string(TOKEN_LENGTH)
}

/// `hex(HMAC-SHA256(token, challenge))`.
pub fn compute_response(token: &str, challenge: &str) -> String {
    match HmacSha256::new_from_slice(token.as_bytes()) {
        Ok(mut mac) => {
            mac.update(challenge.as_bytes());
            hex::encode(mac.finalize().into_bytes())
        }
        Err(_) => String::new(),
    }
}

/// Read the shared token from `path`, generating and writing one (mode 0600)
/// if the file is missing or empty.
pub fn load_or_create_token(path: &Path) -> Result<String, AuthError> {
    let io_err = |source| AuthError::TokenFile {
        path: path.to_path_buf(),
        source,
    };

    match std::fs::read_to_string(path) {
        Ok(contents) if !contents.trim().is_empty() => return Ok(contents.trim().to_string()),
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(io_err(e)),
    }

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }
    let token = generate_token();
    std::fs::write(path, &token).map_err(io_err)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).map_err(io_err)?;
    }
    tracing::info!(path = %path.display(), "Generated new auth token");
    Ok(token)
}

#[derive(Debug)]
struct AuthSession {
    challenge: String,
    issued_at: Instant,
    answered: bool,
    authenticated_until: Option<Instant>,
}

#[derive(Debug, Clone, Copy)]
pub struct AuthOptions {
    pub challenge_ttl: Duration,
    pub token_expiry: Duration,
    /// Margin before the end of a session at which a new challenge is due.
    pub renew_before: Duration,
}

impl Default for AuthOptions {
    fn default() -> Self {
        Self {
            challenge_ttl: DEFAULT_CHALLENGE_TTL,
            token_expiry: DEFAULT_TOKEN_EXPIRY,
            renew_before: DEFAULT_RENEW_BEFORE,
        }
    }
}

/// Token holder for both roles: the master issues and verifies challenges,
/// the worker answers them.
pub struct AuthManager {
    token: String,
    options: AuthOptions,
    sessions: Mutex<HashMap<String, AuthSession>>,
}

impl std::fmt::Debug for AuthManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthManager")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl AuthManager {
    pub fn new(token: impl Into<String>, options: AuthOptions) -> Self {
        Self {
            token: token.into(),
            options,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_token_file(path: &Path, options: AuthOptions) -> Result<Self, AuthError> {
        Ok(Self::new(load_or_create_token(path)?, options))
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, AuthSession>> {
        self.sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Issue a fresh challenge for `peer`, replacing any outstanding one.
    /// An existing authenticated window is kept until it lapses.
    pub fn issue_challenge(&self, peer: &str) -> String {
        let challenge = random_string(CHALLENGE_LENGTH);
        let mut sessions = self.sessions();
        let authenticated_until = sessions.get(peer).and_then(|s| s.authenticated_until);
        sessions.insert(
            peer.to_string(),
            AuthSession {
                challenge: challenge.clone(),
                issued_at: Instant::now(),
                answered: false,
                authenticated_until,
            },
        );
        challenge
    }

    /// Check `response` against the outstanding challenge for `peer`.
    /// True at most once per challenge; a wrong response leaves it open.
    pub fn verify_response(&self, peer: &str, response: &str) -> bool {
        let mut sessions = self.sessions();
        let Some(session) = sessions.get_mut(peer) else {
            tracing::warn!(peer, "Auth response without a challenge");
            return false;
        };
        if session.answered {
            tracing::warn!(peer, "Challenge already answered");
            return false;
        }
        if session.issued_at.elapsed() > self.options.challenge_ttl {
            tracing::warn!(peer, "Challenge expired");
            return false;
        }

        let Ok(expected) = hex::decode(response.trim()) else {
            tracing::warn!(peer, "Auth response is not hex");
            return false;
        };
        let Ok(mut mac) = HmacSha256::new_from_slice(self.token.as_bytes()) else {
            return false;
        };
        mac.update(session.challenge.as_bytes());
        if mac.verify_slice(&expected).is_err() {
            tracing::warn!(peer, "Auth response rejected");
            return false;
        }

        session.answered = true;
        session.authenticated_until = Some(session.issued_at + self.options.token_expiry);
        true
    }

    pub fn is_authenticated(&self, peer: &str) -> bool {
        self.sessions()
            .get(peer)
            .and_then(|s| s.authenticated_until)
            .is_some_and(|until| Instant::now() < until)
    }

    /// True when `peer` was authenticated once, its window ends within
    /// `renew_before` (or already has) and no unexpired challenge is
    /// outstanding.
    pub fn needs_reauth(&self, peer: &str) -> bool {
        let sessions = self.sessions();
        let Some(session) = sessions.get(peer) else {
            return false;
        };
        let ending = session.authenticated_until.is_some_and(|until| {
            until.saturating_duration_since(Instant::now()) <= self.options.renew_before
        });
        let pending =
            !session.answered && session.issued_at.elapsed() <= self.options.challenge_ttl;
        ending && !pending
    }

    pub fn revoke(&self, peer: &str) {
        self.sessions().remove(peer);
    }

    /// Answer a challenge with this manager's token.
    pub fn respond(&self, challenge: &str) -> String {
        compute_response(&self.token, challenge)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOKEN: &str = "shared-secret";

    fn manager(ttl_ms: u64, expiry_ms: u64) -> AuthManager {
        AuthManager::new(
            TOKEN,
            AuthOptions {
                challenge_ttl: Duration::from_millis(ttl_ms),
                token_expiry: Duration::from_millis(expiry_ms),
                renew_before: Duration::ZERO,
            },
        )
    }

    #[test]
    fn response_is_hex_hmac() {
        let response = compute_response(TOKEN, "challenge");
        assert_eq!(response.len(), 64);
        assert!(response.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(response, compute_response(TOKEN, "challenge"));
        assert_ne!(response, compute_response("other", "challenge"));
    }

    #[test]
    fn challenge_verifies_exactly_once() {
        let auth = manager(60_000, 60_000);
        let challenge = auth.issue_challenge("w1");
        let good = compute_response(TOKEN, &challenge);

        assert!(!auth.verify_response("w1", "deadbeef"));
        assert!(!auth.verify_response("w1", "not hex"));
        assert!(!auth.is_authenticated("w1"));

        assert!(auth.verify_response("w1", &good));
        assert!(auth.is_authenticated("w1"));
        assert!(!auth.verify_response("w1", &good));
    }

    #[test]
    fn expired_challenge_rejected() {
        let auth = manager(20, 60_000);
        let challenge = auth.issue_challenge("w1");
        std::thread::sleep(Duration::from_millis(40));
        assert!(!auth.verify_response("w1", &compute_response(TOKEN, &challenge)));
        assert!(!auth.is_authenticated("w1"));
    }

    #[test]
    fn session_lapses_and_can_be_renewed() {
        let auth = manager(60_000, 30);
        let challenge = auth.issue_challenge("w1");
        assert!(auth.verify_response("w1", &auth.respond(&challenge)));
        assert!(!auth.needs_reauth("w1"));

        std::thread::sleep(Duration::from_millis(50));
        assert!(!auth.is_authenticated("w1"));
        assert!(auth.needs_reauth("w1"));

        let challenge = auth.issue_challenge("w1");
        assert!(!auth.needs_reauth("w1"));
        assert!(auth.verify_response("w1", &auth.respond(&challenge)));
        assert!(auth.is_authenticated("w1"));
    }

    #[test]
    fn renewal_is_due_before_the_session_ends() {
        let auth = AuthManager::new(
            TOKEN,
            AuthOptions {
                challenge_ttl: Duration::from_secs(60),
                token_expiry: Duration::from_millis(300),
                renew_before: Duration::from_millis(200),
            },
        );
        let challenge = auth.issue_challenge("w1");
        assert!(auth.verify_response("w1", &auth.respond(&challenge)));
        assert!(!auth.needs_reauth("w1"));

        std::thread::sleep(Duration::from_millis(150));
        assert!(auth.is_authenticated("w1"));
        assert!(auth.needs_reauth("w1"));

        // The renewal keeps the current window open while it is in flight.
        let challenge = auth.issue_challenge("w1");
        assert!(!auth.needs_reauth("w1"));
        assert!(auth.is_authenticated("w1"));
        assert!(auth.verify_response("w1", &auth.respond(&challenge)));

        std::thread::sleep(Duration::from_millis(200));
        assert!(auth.is_authenticated("w1"));
    }

    #[test]
    fn revoke_forgets_peer() {
        let auth = manager(60_000, 60_000);
        let challenge = auth.issue_challenge("w1");
        assert!(auth.verify_response("w1", &auth.respond(&challenge)));
        auth.revoke("w1");
        assert!(!auth.is_authenticated("w1"));
        assert!(!auth.verify_response("w1", &auth.respond(&challenge)));
    }

    #[test]
    fn token_file_created_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secrets").join("auth_token.txt");

        let token = load_or_create_token(&path).unwrap();
        assert_eq!(token.len(), TOKEN_LENGTH);
        assert!(token.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_eq!(load_or_create_token(&path).unwrap(), token);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }
}
