use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Defaults resolved from environment variables, then from a `.env` file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvConfig {
    /// Directory holding the rotating log file
    pub log_dir: PathBuf,
    /// External certificate client executable
    pub certbot_bin: String,
    /// Output root used when the requested one cannot be created
    pub fallback_dir: PathBuf,
    /// Cloudflare API token for DNS-01, when not given on the command line
    pub cf_api_token: Option<String>,
    /// Seconds between readiness probe attempts
    pub probe_interval_secs: u64,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("./logs"),
            certbot_bin: "certbot".to_string(),
            fallback_dir: default_fallback_dir(),
            cf_api_token: None,
            probe_interval_secs: 3,
        }
    }
}

/// `~/.oci_lb_certbot/certs`, or a relative path when HOME is unset
pub fn default_fallback_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".oci_lb_certbot")
        .join("certs")
}

impl EnvConfig {
    /// Resolve the configuration from the process environment only
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Resolve the configuration through an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = lookup("LBC_LOG_DIR") {
            config.log_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("LBC_CERTBOT_BIN") {
            config.certbot_bin = v;
        }
        if let Some(v) = lookup("LBC_FALLBACK_DIR") {
            config.fallback_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("CF_API_TOKEN") {
            if !v.is_empty() {
                config.cf_api_token = Some(v);
            }
        }
        if let Some(v) = lookup("LBC_PROBE_INTERVAL_SECS") {
            if let Ok(secs) = v.parse::<u64>() {
                if secs > 0 {
                    config.probe_interval_secs = secs;
                }
            }
        }

        config
    }

    /// Load the `.env` file (explicit path, or `./.env` when present) and
    /// resolve with the process environment taking precedence over it
    pub fn load(env_file: Option<&Path>) -> Self {
        let file_vars = match env_file {
            Some(path) => read_dotenv(path),
            None => {
                let candidate = PathBuf::from(".env");
                if candidate.exists() {
                    read_dotenv(&candidate)
                } else {
                    HashMap::new()
                }
            }
        };

        Self::from_lookup(|key| {
            std::env::var(key)
                .ok()
                .or_else(|| file_vars.get(key).cloned())
        })
    }
}

/// Read a basic `.env` file (KEY=VALUE per line) into a map.
/// Unreadable files yield an empty map.
pub fn read_dotenv(path: &Path) -> HashMap<String, String> {
    match std::fs::read_to_string(path) {
        Ok(content) => parse_dotenv(&content),
        Err(_) => HashMap::new(),
    }
}

fn parse_dotenv(content: &str) -> HashMap<String, String> {
    let mut vars = HashMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            let key = key.trim();
            let value = value.trim().trim_matches('"').trim_matches('\'');
            if !key.is_empty() {
                vars.insert(key.to_string(), value.to_string());
            }
        }
    }
    vars
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EnvConfig::from_lookup(|_| None);
        assert_eq!(config.certbot_bin, "certbot");
        assert_eq!(config.log_dir, PathBuf::from("./logs"));
        assert_eq!(config.probe_interval_secs, 3);
        assert!(config.cf_api_token.is_none());
        assert!(config.fallback_dir.ends_with(".oci_lb_certbot/certs"));
    }

    #[test]
    fn test_lookup_overrides() {
        let vars: HashMap<&str, &str> = [
            ("LBC_LOG_DIR", "/var/log/lbc"),
            ("LBC_CERTBOT_BIN", "/usr/local/bin/certbot"),
            ("CF_API_TOKEN", "secret"),
            ("LBC_PROBE_INTERVAL_SECS", "7"),
        ]
        .into_iter()
        .collect();

        let config = EnvConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(config.log_dir, PathBuf::from("/var/log/lbc"));
        assert_eq!(config.certbot_bin, "/usr/local/bin/certbot");
        assert_eq!(config.cf_api_token.as_deref(), Some("secret"));
        assert_eq!(config.probe_interval_secs, 7);
    }

    #[test]
    fn test_invalid_interval_keeps_default() {
        let config = EnvConfig::from_lookup(|k| {
            (k == "LBC_PROBE_INTERVAL_SECS").then(|| "0".to_string())
        });
        assert_eq!(config.probe_interval_secs, 3);

        let config = EnvConfig::from_lookup(|k| {
            (k == "LBC_PROBE_INTERVAL_SECS").then(|| "soon".to_string())
        });
        assert_eq!(config.probe_interval_secs, 3);
    }

    #[test]
    fn test_parse_dotenv() {
        let vars = parse_dotenv(
            "# comment\n\nCF_API_TOKEN=\"abc\"\nLBC_LOG_DIR = '/tmp/logs'\nnot a pair\n",
        );
        assert_eq!(vars.get("CF_API_TOKEN").map(String::as_str), Some("abc"));
        assert_eq!(vars.get("LBC_LOG_DIR").map(String::as_str), Some("/tmp/logs"));
        assert_eq!(vars.len(), 2);
    }

    #[test]
    fn test_load_reads_env_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.env");
        std::fs::write(&path, "LBC_FALLBACK_DIR=/srv/fallback\n").unwrap();

        let config = EnvConfig::load(Some(&path));
        if std::env::var("LBC_FALLBACK_DIR").is_err() {
            assert_eq!(config.fallback_dir, PathBuf::from("/srv/fallback"));
        }
    }
}
