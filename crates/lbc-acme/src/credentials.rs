//! DNS provider credential files for DNS-01

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::error::{AcmeError, AcmeResult};
use crate::publisher::set_mode;
use crate::types::{CredentialSource, DnsProvider};

/// Make sure the provider credentials exist as an owner-only file and
/// return its path.
///
/// A token is written to `<out_root>/<provider file>`; an existing file is
/// checked and tightened to `0600` when group or others can read it.
pub fn ensure_credentials(
    provider: DnsProvider,
    source: &CredentialSource,
    out_root: &Path,
) -> AcmeResult<PathBuf> {
    match source {
        CredentialSource::Token(token) => {
            let token = token.trim();
            if token.is_empty() {
                return Err(AcmeError::Credentials("API token is empty".into()));
            }
            let path = out_root.join(provider.credentials_file_name());
            write_owner_only(&path, &provider.credentials_contents(token))?;
            info!(provider = %provider, path = %path.display(), "Wrote DNS credentials file");
            Ok(path)
        }
        CredentialSource::File(path) => {
            if !path.is_file() {
                return Err(AcmeError::Credentials(format!(
                    "credentials file {} does not exist",
                    path.display()
                )));
            }
            tighten(path)?;
            Ok(path.clone())
        }
    }
}

fn write_owner_only(path: &Path, contents: &str) -> AcmeResult<()> {
    let mut options = OpenOptions::new();
    options.create(true).write(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    // mode() only applies on creation; a pre-existing file keeps its bits
    set_mode(path, 0o600)?;
    file.write_all(contents.as_bytes())?;
    file.sync_all()?;
    Ok(())
}

#[cfg(unix)]
fn tighten(path: &Path) -> AcmeResult<()> {
    use std::os::unix::fs::PermissionsExt;
    let mode = std::fs::metadata(path)?.permissions().mode();
    if mode & 0o077 != 0 {
        warn!(
            path = %path.display(),
            mode = format!("{:o}", mode & 0o777),
            "Credentials file readable by others, restricting to 0600"
        );
        set_mode(path, 0o600)?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn tighten(_path: &Path) -> AcmeResult<()> {
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn mode_of(path: &Path) -> u32 {
        std::fs::metadata(path).unwrap().permissions().mode() & 0o777
    }

    #[test]
    fn test_token_written_owner_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = ensure_credentials(
            DnsProvider::Cloudflare,
            &CredentialSource::Token(" cf-token \n".into()),
            dir.path(),
        )
        .unwrap();

        assert_eq!(path, dir.path().join("cloudflare.ini"));
        assert_eq!(mode_of(&path), 0o600);
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "dns_cloudflare_api_token = cf-token\n"
        );
    }

    #[test]
    fn test_token_overwrites_loose_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let existing = dir.path().join("cloudflare.ini");
        std::fs::write(&existing, "old contents that are longer than the new ones\n").unwrap();
        std::fs::set_permissions(&existing, std::fs::Permissions::from_mode(0o644)).unwrap();

        ensure_credentials(
            DnsProvider::Cloudflare,
            &CredentialSource::Token("new".into()),
            dir.path(),
        )
        .unwrap();

        assert_eq!(mode_of(&existing), 0o600);
        assert_eq!(
            std::fs::read_to_string(&existing).unwrap(),
            "dns_cloudflare_api_token = new\n"
        );
    }

    #[test]
    fn test_existing_file_tightened() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("my-cf.ini");
        std::fs::write(&path, "dns_cloudflare_api_token = abc\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();

        let resolved = ensure_credentials(
            DnsProvider::Cloudflare,
            &CredentialSource::File(path.clone()),
            dir.path(),
        )
        .unwrap();

        assert_eq!(resolved, path);
        assert_eq!(mode_of(&path), 0o600);
    }

    #[test]
    fn test_missing_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = ensure_credentials(
            DnsProvider::Cloudflare,
            &CredentialSource::File(dir.path().join("absent.ini")),
            dir.path(),
        )
        .unwrap_err();
        assert!(matches!(err, AcmeError::Credentials(_)));
    }

    #[test]
    fn test_empty_token_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = ensure_credentials(
            DnsProvider::Cloudflare,
            &CredentialSource::Token("   ".into()),
            dir.path(),
        )
        .unwrap_err();
        assert!(matches!(err, AcmeError::Credentials(_)));
        assert!(!dir.path().join("cloudflare.ini").exists());
    }
}
