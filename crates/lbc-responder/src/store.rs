use std::collections::{HashMap, HashSet};
use std::io;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

/// Source addresses whose requests are treated as load balancer health checks.
///
/// Matching is plain address equality. IPv4-mapped IPv6 addresses are
/// compared in their IPv4 form.
#[derive(Debug, Clone, Default)]
pub struct ProbeAllowlist {
    addrs: HashSet<IpAddr>,
}

impl ProbeAllowlist {
    pub fn new<I>(addrs: I) -> Self
    where
        I: IntoIterator<Item = IpAddr>,
    {
        Self {
            addrs: addrs.into_iter().map(|a| a.to_canonical()).collect(),
        }
    }

    pub fn contains(&self, addr: &IpAddr) -> bool {
        self.addrs.contains(&addr.to_canonical())
    }

    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }
}

impl FromIterator<IpAddr> for ProbeAllowlist {
    fn from_iter<T: IntoIterator<Item = IpAddr>>(iter: T) -> Self {
        Self::new(iter)
    }
}

/// Parse a single probe source address. Ranges are rejected.
pub fn parse_probe_addr(s: &str) -> Result<IpAddr, String> {
    let s = s.trim();
    if s.contains('/') {
        return Err(format!(
            "'{s}' looks like a CIDR range; only single addresses are supported"
        ));
    }
    s.parse::<IpAddr>()
        .map_err(|e| format!("invalid probe address '{s}': {e}"))
}

/// ACME tokens are base64url without padding
pub fn is_valid_token(token: &str) -> bool {
    !token.is_empty()
        && token
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// Challenge tokens and their expected response content.
///
/// In-memory entries are filled before the responder starts and never
/// change afterwards. When bound to a webroot, tokens missing from memory
/// are read from `<webroot>/.well-known/acme-challenge/<token>`, which is
/// where the external certificate client drops its files in webroot mode.
#[derive(Debug, Clone, Default)]
pub struct ChallengeStore {
    entries: HashMap<String, String>,
    challenge_dir: Option<PathBuf>,
}

impl ChallengeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Back the store with a webroot, creating its challenge directory
    pub fn with_webroot(mut self, webroot: &Path) -> io::Result<Self> {
        let dir = challenge_dir(webroot);
        std::fs::create_dir_all(&dir)?;
        self.challenge_dir = Some(dir);
        Ok(self)
    }

    /// Add a token. Returns `false` and stores nothing if the token is not
    /// a valid ACME token.
    pub fn insert(&mut self, token: impl Into<String>, content: impl Into<String>) -> bool {
        let token = token.into();
        if !is_valid_token(&token) {
            return false;
        }
        self.entries.insert(token, content.into());
        true
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn challenge_dir(&self) -> Option<&Path> {
        self.challenge_dir.as_deref()
    }

    /// Content for a token, from memory first and then from the webroot
    pub async fn lookup(&self, token: &str) -> Option<String> {
        if !is_valid_token(token) {
            return None;
        }
        if let Some(content) = self.entries.get(token) {
            return Some(content.clone());
        }
        let dir = self.challenge_dir.as_ref()?;
        match tokio::fs::read_to_string(dir.join(token)).await {
            Ok(content) => Some(content),
            Err(e) => {
                if e.kind() != io::ErrorKind::NotFound {
                    debug!(token, error = %e, "Failed to read challenge file");
                }
                None
            }
        }
    }
}

/// `<webroot>/.well-known/acme-challenge`
pub fn challenge_dir(webroot: &Path) -> PathBuf {
    webroot.join(".well-known").join("acme-challenge")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn test_allowlist_equality_only() {
        let list = ProbeAllowlist::new(["203.0.113.5".parse().unwrap()]);
        assert!(list.contains(&"203.0.113.5".parse().unwrap()));
        assert!(!list.contains(&"203.0.113.6".parse().unwrap()));
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_allowlist_ipv4_mapped() {
        let list = ProbeAllowlist::new([IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7))]);
        let mapped = IpAddr::V6(Ipv4Addr::new(10, 0, 0, 7).to_ipv6_mapped());
        assert!(list.contains(&mapped));

        let v6 = ProbeAllowlist::new([IpAddr::V6(Ipv6Addr::LOCALHOST)]);
        assert!(v6.contains(&IpAddr::V6(Ipv6Addr::LOCALHOST)));
    }

    #[test]
    fn test_parse_probe_addr() {
        assert_eq!(
            parse_probe_addr(" 203.0.113.5 ").unwrap(),
            "203.0.113.5".parse::<IpAddr>().unwrap()
        );
        assert!(parse_probe_addr("2001:db8::1").is_ok());
        assert!(parse_probe_addr("10.0.0.0/24").unwrap_err().contains("CIDR"));
        assert!(parse_probe_addr("lb.example.com").is_err());
    }

    #[test]
    fn test_token_alphabet() {
        assert!(is_valid_token("abc-DEF_123"));
        assert!(!is_valid_token(""));
        assert!(!is_valid_token("../etc/passwd"));
        assert!(!is_valid_token("a/b"));
        assert!(!is_valid_token("tok.en"));
    }

    #[tokio::test]
    async fn test_memory_lookup() {
        let mut store = ChallengeStore::new();
        assert!(store.insert("tok1", "tok1.thumb"));
        assert!(!store.insert("bad/token", "x"));

        assert_eq!(store.lookup("tok1").await.as_deref(), Some("tok1.thumb"));
        assert!(store.lookup("missing").await.is_none());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_webroot_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChallengeStore::new().with_webroot(dir.path()).unwrap();
        let cdir = store.challenge_dir().unwrap().to_path_buf();
        assert!(cdir.is_dir());

        std::fs::write(cdir.join("fromdisk"), "fromdisk.key").unwrap();
        assert_eq!(store.lookup("fromdisk").await.as_deref(), Some("fromdisk.key"));
        assert!(store.lookup("absent").await.is_none());
    }

    #[tokio::test]
    async fn test_memory_wins_over_webroot() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = ChallengeStore::new().with_webroot(dir.path()).unwrap();
        std::fs::write(challenge_dir(dir.path()).join("dup"), "disk").unwrap();
        store.insert("dup", "memory");

        assert_eq!(store.lookup("dup").await.as_deref(), Some("memory"));
    }
}
