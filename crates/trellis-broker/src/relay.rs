//! STUN/TURN relay advertisement and credential minting.
//!
//! Relays are configured as URLs in the form
//!
//! ```text
//! turn:[user[:pass]@]host[:port][?transport=udp&secret=...&ttl=1h&realm=...]
//! ```
//!
//! Three credential modes, checked in order:
//! 1. static `user:pass` in the URL: handed out verbatim, no expiry
//! 2. a `secret` query parameter: ephemeral credentials per the coturn
//!    REST API (`--use-auth-secret`): username `<expiry-unix>:<peer>` and
//!    password `base64(HMAC-SHA1(secret, username))`
//! 3. neither: URL only, e.g. a public STUN server

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use thiserror::Error;
use trellis_proto::RelayInfo;
use url::Url;

pub const DEFAULT_RELAY_TTL: Duration = Duration::from_secs(60 * 60);

const DEFAULT_PORT: u16 = 3478;
const DEFAULT_TLS_PORT: u16 = 5349;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("invalid relay URL {0:?}: {1}")]
    InvalidUrl(String, #[source] url::ParseError),

    #[error("invalid relay URL {0:?}: missing host")]
    MissingHost(String),

    #[error("unsupported relay scheme {0:?}")]
    UnsupportedScheme(String),

    #[error("invalid TTL {0:?}: {1}")]
    InvalidTtl(String, #[source] humantime::DurationError),
}

/// A configured STUN/TURN server.
#[derive(Debug, Clone)]
pub struct Relay {
    /// Canonical URL without userinfo and query, e.g. `turn:host:3478`.
    pub url: String,
    pub realm: String,

    pub username: String,
    pub password: String,

    /// Shared secret for the coturn REST credential mechanism.
    pub secret: String,
    /// Lifetime of ephemeral credentials.
    pub ttl: Duration,
}

impl Relay {
    /// Parse a relay URL. `stun:`, `stuns:`, `turn:` and `turns:` schemes
    /// are accepted; credentials and options come from the userinfo and
    /// query parts.
    pub fn parse(arg: &str) -> Result<Self, RelayError> {
        // stun/turn URLs are opaque ("turn:host:port"), which the url
        // crate cannot split. Rewriting the scheme separator to "://"
        // turns them into ordinary authority URLs.
        let rewritten = match arg.split_once(':') {
            Some((scheme, rest)) if !rest.starts_with("//") => {
                format!("{scheme}://{rest}")
            }
            _ => arg.to_string(),
        };

        let url =
            Url::parse(&rewritten).map_err(|e| RelayError::InvalidUrl(arg.to_string(), e))?;

        let scheme = url.scheme();
        let default_port = match scheme {
            "stun" | "turn" => DEFAULT_PORT,
            "stuns" | "turns" => DEFAULT_TLS_PORT,
            other => return Err(RelayError::UnsupportedScheme(other.to_string())),
        };

        let host = url
            .host_str()
            .ok_or_else(|| RelayError::MissingHost(arg.to_string()))?;
        let port = url.port().unwrap_or(default_port);

        let mut relay = Relay {
            url: format!("{scheme}:{host}:{port}"),
            realm: String::new(),
            username: url.username().to_string(),
            password: url.password().unwrap_or_default().to_string(),
            secret: String::new(),
            ttl: DEFAULT_RELAY_TTL,
        };

        for (name, value) in url.query_pairs() {
            match name.as_ref() {
                "secret" => relay.secret = value.into_owned(),
                "realm" => relay.realm = value.into_owned(),
                "ttl" => {
                    relay.ttl = humantime::parse_duration(&value)
                        .map_err(|e| RelayError::InvalidTtl(value.into_owned(), e))?;
                }
                // "transport" is meaningful to the ICE agent, not to us.
                _ => {}
            }
        }

        Ok(relay)
    }

    pub fn parse_all(args: &[String]) -> Result<Vec<Self>, RelayError> {
        args.iter().map(|arg| Self::parse(arg)).collect()
    }

    /// Credentials for `peer` valid from `now`, or `None` when the relay
    /// requires none. The returned expiry is `None` for static
    /// credentials.
    pub fn credentials(
        &self,
        peer: &str,
        now: SystemTime,
    ) -> Option<(String, String, Option<SystemTime>)> {
        if !self.username.is_empty() && !self.password.is_empty() {
            return Some((self.username.clone(), self.password.clone(), None));
        }

        if self.secret.is_empty() {
            return None;
        }

        let name = if self.username.is_empty() {
            peer
        } else {
            &self.username
        };

        let expires = now + self.ttl;
        let unix = expires
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let username = format!("{unix}:{name}");

        // HMAC accepts keys of any length.
        let mut mac = Hmac::<Sha1>::new_from_slice(self.secret.as_bytes())
            .unwrap_or_else(|_| unreachable!());
        mac.update(username.as_bytes());
        let password = BASE64.encode(mac.finalize().into_bytes());

        Some((username, password, Some(expires)))
    }

    /// Render the advertisement sent to `peer` in a GetRelays response.
    pub fn info(&self, peer: &str, now: SystemTime) -> RelayInfo {
        let mut info = RelayInfo {
            url: self.url.clone(),
            ..Default::default()
        };

        if let Some((username, password, expires)) = self.credentials(peer, now) {
            info.username = username;
            info.password = password;
            info.expires = expires.map(|at| {
                let unix = at.duration_since(UNIX_EPOCH).unwrap_or_default();
                prost_types::Timestamp {
                    seconds: unix.as_secs() as i64,
                    nanos: unix.subsec_nanos() as i32,
                }
            });
        }

        info
    }
}
