//! Session identity, target and credential

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use url::Url;

use crate::error::{ListenerError, Result};

/// User name the device expects; the auth code shown by the device is the password
pub const DEFAULT_USERNAME: &str = "velvetSweatshop";

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of one connection attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    /// Allocate the next identity
    pub fn next() -> Self {
        Self(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Username/password pair bound into the transport client before any request
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    username: String,
    password: String,
}

impl Credential {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Credential for the device's fixed user name and the given auth code
    pub fn from_auth_code(code: impl Into<String>) -> Self {
        Self::new(DEFAULT_USERNAME, code)
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Address and port of the device to pull the stream from
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    address: String,
    port: u16,
    url: Url,
}

impl Target {
    /// Validate the target and build its `rtsp://<address>:<port>/` URL
    pub fn new(address: impl Into<String>, port: u16) -> Result<Self> {
        let address = address.into();
        let host = match address.parse::<std::net::Ipv6Addr>() {
            Ok(_) => format!("[{address}]"),
            Err(_) => address.clone(),
        };
        let url = Url::parse(&format!("rtsp://{host}:{port}/")).map_err(|source| {
            ListenerError::InvalidTarget {
                address: address.clone(),
                port,
                source,
            }
        })?;

        Ok(Self { address, port, url })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// A stream advertised on the local network, as supplied by service discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredService {
    pub address: String,
    pub port: u16,
    pub name: String,
}

/// Advisory one-way "do not proceed / do not deliver" marker
///
/// Written by the owner thread, read by the runtime thread at defined checkpoints.
#[derive(Debug, Clone, Default)]
pub struct ExpiryFlag(Arc<AtomicBool>);

impl ExpiryFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn expire(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_expired(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// One connection attempt: what to connect to, how to authenticate, and whether
/// the owner still wants it
#[derive(Debug, Clone)]
pub(crate) struct Session {
    pub id: SessionId,
    pub target: Target,
    pub credential: Credential,
    pub expired: ExpiryFlag,
}

impl Session {
    pub(crate) fn new(target: Target, credential: Credential) -> Self {
        Self {
            id: SessionId::next(),
            target,
            credential,
            expired: ExpiryFlag::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_ids_are_unique() {
        let a = SessionId::next();
        let b = SessionId::next();
        assert_ne!(a, b);
        assert!(a.to_string().starts_with("session-"));
    }

    #[test]
    fn test_target_url() {
        let target = Target::new("10.0.0.5", 554).unwrap();
        assert_eq!(target.url().as_str(), "rtsp://10.0.0.5:554/");
        assert_eq!(target.to_string(), "10.0.0.5:554");

        let v6 = Target::new("fe80::1", 8554).unwrap();
        assert_eq!(v6.url().as_str(), "rtsp://[fe80::1]:8554/");
        assert_eq!(v6.address(), "fe80::1");
    }

    #[test]
    fn test_invalid_target() {
        assert!(matches!(
            Target::new("bad host", 554),
            Err(ListenerError::InvalidTarget { .. })
        ));
    }

    #[test]
    fn test_credential_debug_redacts_password() {
        let credential = Credential::from_auth_code("abcd");
        assert_eq!(credential.username(), DEFAULT_USERNAME);
        assert_eq!(credential.password(), "abcd");
        assert!(!format!("{credential:?}").contains("abcd"));
    }

    #[test]
    fn test_expiry_flag_is_shared() {
        let flag = ExpiryFlag::new();
        let observer = flag.clone();
        assert!(!observer.is_expired());
        flag.expire();
        assert!(observer.is_expired());
    }
}
