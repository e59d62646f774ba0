use std::fs;
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};
use tracing::{error, info, warn};

use crate::error::PublishError;
use crate::types::{
    ARTIFACT_FILES, CertificateArtifactSet, DESCRIPTOR_FILE, LbConfigDescriptor, PRIVATE_KEY_FILE,
};

const DIR_MODE: u32 = 0o700;
const KEY_MODE: u32 = 0o600;
const CERT_MODE: u32 = 0o644;

/// Copies issued files into the output layout and hardens them
#[derive(Debug, Clone)]
pub struct ArtifactPublisher {
    fallback_dir: PathBuf,
}

impl ArtifactPublisher {
    pub fn new(fallback_dir: impl Into<PathBuf>) -> Self {
        Self {
            fallback_dir: fallback_dir.into(),
        }
    }

    /// Create the output root and return its absolute path.
    ///
    /// An output root inside `<webroot>/.well-known` is moved to
    /// `<webroot>/certs`. When the root cannot be created or written for
    /// lack of permission, the fallback directory is used instead.
    pub fn prepare_output_root(&self, requested: &Path, webroot: Option<&Path>) -> io::Result<PathBuf> {
        let mut out = absolutize(requested)?;

        if let Some(webroot) = webroot {
            let webroot = absolutize(webroot)?;
            if out.starts_with(webroot.join(".well-known")) {
                let moved = webroot.join("certs");
                warn!(
                    requested = %out.display(),
                    using = %moved.display(),
                    "Output directory is inside the served challenge tree, relocating"
                );
                out = moved;
            }
        }

        let out = match create_writable(&out) {
            Ok(()) => out,
            Err(e) if is_permission_error(&e) => {
                let fallback = absolutize(&self.fallback_dir)?;
                warn!(
                    requested = %out.display(),
                    fallback = %fallback.display(),
                    error = %e,
                    "Output directory not writable, using fallback"
                );
                create_writable(&fallback)?;
                fallback
            }
            Err(e) => return Err(e),
        };

        if let Err(e) = set_mode(&out, DIR_MODE) {
            warn!(path = %out.display(), error = %e, "Could not restrict output directory");
        }
        Ok(out)
    }

    /// Copy the four artifacts from `live_dir` into `<out_root>/<domain>/`,
    /// harden permissions, and write `lb-config.json`.
    ///
    /// Returns `Ok(None)` for a dry run that produced no live directory.
    /// On a partial copy the destination is left for inspection and the
    /// error lists every file.
    pub fn publish(
        &self,
        domain: &str,
        live_dir: &Path,
        out_root: &Path,
        dry_run: bool,
    ) -> Result<Option<CertificateArtifactSet>, PublishError> {
        let dest = out_root.join(domain);
        let mut report = PublishError {
            dest: dest.clone(),
            ..Default::default()
        };

        if !live_dir.is_dir() {
            if dry_run {
                warn!(
                    live_dir = %live_dir.display(),
                    "Dry run left no live certificate directory, nothing to publish"
                );
                return Ok(None);
            }
            report.failed = ARTIFACT_FILES
                .iter()
                .map(|name| (name.to_string(), format!("missing from {}", live_dir.display())))
                .collect();
            error!(live_dir = %live_dir.display(), "No certificate files found");
            return Err(report);
        }

        if let Err(e) = fs::create_dir_all(&dest).and_then(|_| set_mode(&dest, DIR_MODE)) {
            report.failed = ARTIFACT_FILES
                .iter()
                .map(|name| (name.to_string(), format!("destination directory: {e}")))
                .collect();
            return Err(report);
        }

        for name in ARTIFACT_FILES {
            let target = dest.join(name);
            let mode = if name == PRIVATE_KEY_FILE { KEY_MODE } else { CERT_MODE };
            match fs::copy(live_dir.join(name), &target).and_then(|_| set_mode(&target, mode)) {
                Ok(()) => report.copied.push(name.to_string()),
                Err(e) => {
                    error!(file = name, error = %e, "Failed to publish artifact");
                    report.failed.push((name.to_string(), e.to_string()));
                }
            }
        }

        if !report.failed.is_empty() {
            error!(
                dest = %dest.display(),
                copied = ?report.copied,
                "Artifact set is incomplete, left in place for inspection"
            );
            return Err(report);
        }

        let set = CertificateArtifactSet::in_dir(domain, &dest);
        let descriptor = LbConfigDescriptor::new(&set, live_dir);
        let written = serde_json::to_string_pretty(&descriptor)
            .map_err(io::Error::from)
            .and_then(|json| fs::write(set.descriptor_path(), json + "\n"));
        if let Err(e) = written {
            report.failed.push((DESCRIPTOR_FILE.to_string(), e.to_string()));
            return Err(report);
        }

        info!(
            domain,
            dest = %dest.display(),
            files = ?report.copied,
            "Published certificate artifacts"
        );
        Ok(Some(set))
    }
}

/// Append the entries that keep issued material out of version control.
/// Returns what was added.
pub fn update_gitignore(dir: &Path, out_root: &Path) -> io::Result<Vec<String>> {
    let path = dir.join(".gitignore");
    let existing = match fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e),
    };
    let present: Vec<&str> = existing.lines().map(str::trim).collect();

    let dir = absolutize(dir)?;
    let out_entry = match out_root.strip_prefix(&dir) {
        Ok(rel) if !rel.as_os_str().is_empty() => format!("{}/", rel.display()),
        _ => format!("{}/", out_root.display()),
    };
    let entries = [
        out_entry,
        "*.pem".to_string(),
        "letsencrypt/".to_string(),
        "letsencrypt-work/".to_string(),
        "letsencrypt-logs/".to_string(),
        "cloudflare.ini".to_string(),
    ];

    let mut to_append: Vec<String> = entries
        .into_iter()
        .filter(|e| !present.contains(&e.as_str()))
        .collect();
    if to_append.is_empty() {
        return Ok(to_append);
    }

    const HEADER: &str = "# oci-lb-certbot generated certificates";
    if !present.contains(&HEADER) {
        to_append.insert(0, HEADER.to_string());
    }

    let mut file = fs::OpenOptions::new().create(true).append(true).open(&path)?;
    let mut block = String::new();
    if !existing.is_empty() && !existing.ends_with('\n') {
        block.push('\n');
    }
    block.push_str(&to_append.join("\n"));
    block.push('\n');
    file.write_all(block.as_bytes())?;

    info!(path = %path.display(), entries = ?to_append, "Updated .gitignore");
    Ok(to_append)
}

fn create_writable(dir: &Path) -> io::Result<()> {
    fs::create_dir_all(dir)?;
    let probe = dir.join(".lbc-write-test");
    fs::write(&probe, b"")?;
    fs::remove_file(&probe)
}

fn is_permission_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::PermissionDenied | io::ErrorKind::ReadOnlyFilesystem
    )
}

/// Absolute, lexically normalized form of `path`
pub(crate) fn absolutize(path: &Path) -> io::Result<PathBuf> {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };

    let mut normalized = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    Ok(normalized)
}

#[cfg(unix)]
pub(crate) fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
pub(crate) fn set_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}
