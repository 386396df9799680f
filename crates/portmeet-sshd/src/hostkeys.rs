//! Host-key bootstrap
//!
//! The broker presents the standard RSA/ECDSA/Ed25519 trio to connecting
//! agents. Keys live under the configured folder and are generated once with
//! `ssh-keygen`; existing files are left untouched.

use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::info;

use crate::{SshdError, SshdResult};

/// Paths of the three host-key files a child sshd is started with.
#[derive(Debug, Clone)]
pub struct HostKeys {
    pub rsa: PathBuf,
    pub ecdsa: PathBuf,
    pub ed25519: PathBuf,
}

impl HostKeys {
    /// Conventional file names inside `folder`.
    pub fn in_folder(folder: &Path) -> Self {
        Self {
            rsa: folder.join("ssh_host_rsa_key"),
            ecdsa: folder.join("ssh_host_ecdsa_key"),
            ed25519: folder.join("ssh_host_ed25519_key"),
        }
    }

    /// All three paths, in the order they are handed to sshd.
    pub fn paths(&self) -> [&Path; 3] {
        [&self.rsa, &self.ecdsa, &self.ed25519]
    }

    /// Generate any missing key with `ssh-keygen`.
    pub fn ensure(&self) -> SshdResult<()> {
        generate_if_missing(&self.rsa, "rsa", Some("4096"))?;
        generate_if_missing(&self.ecdsa, "ecdsa", None)?;
        generate_if_missing(&self.ed25519, "ed25519", None)?;
        Ok(())
    }
}

/// Run `ssh-keygen -t <kind> [-b bits] -f <path> -N ""` unless the key exists.
fn generate_if_missing(path: &Path, kind: &str, bits: Option<&str>) -> SshdResult<()> {
    if path.exists() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut cmd = Command::new("ssh-keygen");
    cmd.args(["-t", kind]);
    if let Some(bits) = bits {
        cmd.args(["-b", bits]);
    }
    cmd.args(["-f"])
        .arg(path)
        .args(["-N", "", "-q"]);

    let status = cmd.status().map_err(|e| SshdError::Keygen {
        path: path.display().to_string(),
        reason: format!("could not run ssh-keygen (is openssh installed?): {e}"),
    })?;
    if !status.success() {
        return Err(SshdError::Keygen {
            path: path.display().to_string(),
            reason: format!("exit status {status}"),
        });
    }

    info!("generated {} host key at {}", kind, path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conventional_names() {
        let keys = HostKeys::in_folder(Path::new("keys"));
        assert_eq!(keys.rsa, Path::new("keys/ssh_host_rsa_key"));
        assert_eq!(keys.ecdsa, Path::new("keys/ssh_host_ecdsa_key"));
        assert_eq!(keys.ed25519, Path::new("keys/ssh_host_ed25519_key"));
    }

    #[test]
    fn paths_order_matches_sshd_invocation() {
        let keys = HostKeys::in_folder(Path::new("k"));
        let [a, b, c] = keys.paths();
        assert!(a.ends_with("ssh_host_rsa_key"));
        assert!(b.ends_with("ssh_host_ecdsa_key"));
        assert!(c.ends_with("ssh_host_ed25519_key"));
    }
}
