//! Ephemeral `AuthorizedKeysCommand` scripts
//!
//! Each tunnel gets one executable shell script that prints the two
//! participants' public keys, each behind a forced command so an
//! authenticated session can do nothing but TCP forwarding. Scripts are
//! keyed by sshd port, which is unique per live tunnel.

use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::SshdResult;

/// Option prefix forced onto every key line the script prints.
const FORCED_OPTIONS: &str = "command=\"echo 'This account is restricted to port forwarding'\",\
no-pty,no-agent-forwarding,no-X11-forwarding";

/// Writes and removes per-tunnel authorized-keys scripts under one directory.
#[derive(Debug, Clone)]
pub struct KeyScripts {
    dir: PathBuf,
}

impl KeyScripts {
    /// The directory used when none is configured.
    pub fn default_dir() -> PathBuf {
        std::env::temp_dir().join("authorized_keys")
    }

    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// Path of the script for a given sshd port.
    pub fn path_for(&self, sshd_port: u16) -> PathBuf {
        self.dir.join(format!("authorized_keys_{sshd_port}"))
    }

    /// Write the script for `sshd_port`, replacing any stale file.
    ///
    /// The directory is created owner-only on first use; the script itself
    /// must be executable for sshd to run it as the keys-command user.
    pub fn write(&self, sshd_port: u16, authorized_keys: &[String]) -> SshdResult<PathBuf> {
        if !self.dir.exists() {
            fs::create_dir_all(&self.dir)?;
            fs::set_permissions(&self.dir, fs::Permissions::from_mode(0o700))?;
        }

        let path = self.path_for(sshd_port);
        if path.exists() {
            fs::remove_file(&path)?;
        }

        let mut script = String::from("#!/bin/sh\ncat <<'EOF'\n");
        for key in authorized_keys {
            script.push_str(FORCED_OPTIONS);
            script.push(' ');
            script.push_str(key.trim());
            script.push('\n');
        }
        script.push_str("EOF\n");

        let mut file = fs::File::create(&path)?;
        file.write_all(script.as_bytes())?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755))?;

        debug!("wrote authorized-keys script {}", path.display());
        Ok(path)
    }

    /// Remove the script for `sshd_port`; missing files are not an error.
    pub fn remove(&self, sshd_port: u16) {
        let path = self.path_for(sshd_port);
        if let Err(e) = fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                debug!("could not remove {}: {}", path.display(), e);
            }
        }
    }
}

impl Default for KeyScripts {
    fn default() -> Self {
        Self::new(Self::default_dir())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_scripts(test: &str) -> KeyScripts {
        let dir = std::env::temp_dir()
            .join(format!("portmeet-keyscript-{test}-{}", uuid::Uuid::new_v4()));
        KeyScripts::new(dir)
    }

    #[test]
    fn writes_one_restricted_line_per_key() {
        let scripts = scratch_scripts("lines");
        let keys = vec!["ssh-rsa KEY_S".to_string(), "ssh-ed25519 KEY_R".to_string()];

        let path = scripts.write(7857, &keys).unwrap();
        let body = fs::read_to_string(&path).unwrap();

        assert!(body.starts_with("#!/bin/sh\n"));
        assert_eq!(body.matches(FORCED_OPTIONS).count(), 2);
        assert!(body.contains("ssh-rsa KEY_S\n"));
        assert!(body.contains("ssh-ed25519 KEY_R\n"));
        assert!(body.contains("restricted to port forwarding"));
    }

    #[test]
    fn script_is_executable_and_dir_owner_only() {
        let scripts = scratch_scripts("perms");
        let path = scripts
            .write(7858, &["ssh-rsa K".to_string()])
            .unwrap();

        let script_mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(script_mode, 0o755);

        let dir_mode = fs::metadata(path.parent().unwrap())
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(dir_mode, 0o700);
    }

    #[test]
    fn rewrite_replaces_stale_file() {
        let scripts = scratch_scripts("rewrite");
        scripts.write(7859, &["ssh-rsa OLD".to_string()]).unwrap();
        let path = scripts.write(7859, &["ssh-rsa NEW".to_string()]).unwrap();

        let body = fs::read_to_string(&path).unwrap();
        assert!(body.contains("ssh-rsa NEW"));
        assert!(!body.contains("ssh-rsa OLD"));
    }

    #[test]
    fn remove_tolerates_missing_file() {
        let scripts = scratch_scripts("remove");
        scripts.remove(7999);

        let path = scripts.write(7860, &["ssh-rsa K".to_string()]).unwrap();
        scripts.remove(7860);
        assert!(!path.exists());
    }
}
