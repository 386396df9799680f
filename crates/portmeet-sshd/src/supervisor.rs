//! Spawning and supervising hardened `sshd` children
//!
//! One child per tunnel, fully configured on the command line so no config
//! file ever touches disk. A watcher task owns each child: deliberate
//! teardown signals it to kill the process, and an unexpected exit is
//! reported on the supervisor's event channel so the broker can reap the
//! tunnel and tell both peers.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::{HostKeys, KeyScripts, SshdError, SshdResult};

/// Absolute path of the sshd binary the broker invokes.
pub const SSHD_BINARY: &str = "/usr/bin/sshd";

/// Readiness probe: attempts * interval bounds how long a child may take to
/// bind its listening port.
const READY_ATTEMPTS: u32 = 20;
const READY_INTERVAL: Duration = Duration::from_millis(50);

/// Seam between the signaling engine and the child-process layer.
///
/// The engine only ever asks for "a tunnel on this port pair admitting these
/// keys"; tests substitute a recording stub.
#[async_trait]
pub trait TunnelSpawner: Send + Sync {
    /// Bring up a tunnel endpoint on `sshd_port` restricted to forwarding
    /// onto `local_port`, admitting exactly `authorized_keys`.
    async fn spawn(
        &self,
        sshd_port: u16,
        local_port: u16,
        authorized_keys: &[String],
    ) -> SshdResult<TunnelHandle>;
}

/// Handle to a live tunnel child.
///
/// Killing (or dropping) the handle signals the watcher task, which
/// terminates the child and removes its authorized-keys script without
/// reporting an unexpected exit.
#[derive(Debug)]
pub struct TunnelHandle {
    shutdown: Option<oneshot::Sender<()>>,
}

impl TunnelHandle {
    pub fn new(shutdown: oneshot::Sender<()>) -> Self {
        Self {
            shutdown: Some(shutdown),
        }
    }

    /// Tear the tunnel down deliberately.
    pub fn kill(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for TunnelHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

/// Spawns real `sshd` processes.
pub struct SshdSupervisor {
    forwarding_user: String,
    host_keys: HostKeys,
    scripts: KeyScripts,
    exit_tx: mpsc::UnboundedSender<u16>,
}

impl SshdSupervisor {
    /// `exit_tx` receives the sshd port of any child that exits without
    /// being asked to.
    pub fn new(
        forwarding_user: String,
        host_keys: HostKeys,
        scripts: KeyScripts,
        exit_tx: mpsc::UnboundedSender<u16>,
    ) -> Self {
        Self {
            forwarding_user,
            host_keys,
            scripts,
            exit_tx,
        }
    }
}

#[async_trait]
impl TunnelSpawner for SshdSupervisor {
    async fn spawn(
        &self,
        sshd_port: u16,
        local_port: u16,
        authorized_keys: &[String],
    ) -> SshdResult<TunnelHandle> {
        let script = self.scripts.write(sshd_port, authorized_keys)?;

        let args = build_args(
            &self.forwarding_user,
            &self.host_keys,
            &script,
            sshd_port,
            local_port,
        );
        debug!("spawning {} {}", SSHD_BINARY, args.join(" "));

        let child = Command::new(SSHD_BINARY)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
        let mut child = match child {
            Ok(child) => child,
            Err(e) => {
                self.scripts.remove(sshd_port);
                return Err(SshdError::Spawn(e.to_string()));
            }
        };

        if let Err(e) = wait_until_ready(sshd_port, READY_ATTEMPTS, READY_INTERVAL).await {
            warn!("sshd on port {} never came up, killing it", sshd_port);
            let _ = child.start_kill();
            let _ = child.wait().await;
            self.scripts.remove(sshd_port);
            return Err(e);
        }

        info!(
            sshd_port,
            local_port, "sshd ready, forwarding restricted to localhost:{local_port}"
        );

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let scripts = self.scripts.clone();
        let exit_tx = self.exit_tx.clone();
        tokio::spawn(watch(child, shutdown_rx, sshd_port, scripts, exit_tx));

        Ok(TunnelHandle::new(shutdown_tx))
    }
}

/// Full command line for one hardened child, per-connection values filled in.
fn build_args(
    forwarding_user: &str,
    host_keys: &HostKeys,
    script: &Path,
    sshd_port: u16,
    local_port: u16,
) -> Vec<String> {
    let mut args: Vec<String> = vec!["-D".into(), "-f".into(), "/dev/null".into()];
    let mut opt = |value: String| {
        args.push("-o".into());
        args.push(value);
    };

    opt(format!("AllowUsers={forwarding_user}"));
    opt("PasswordAuthentication=no".into());
    opt("PubkeyAuthentication=yes".into());
    opt("AllowTcpForwarding=yes".into());
    opt("PermitTunnel=no".into());
    opt("PermitRootLogin=no".into());
    opt("X11Forwarding=no".into());
    opt("PermitUserEnvironment=no".into());
    opt("AllowAgentForwarding=no".into());
    opt(format!("Port={sshd_port}"));
    opt(format!("PermitOpen=localhost:{local_port}"));
    opt("AuthorizedKeysCommandUser=nobody".into());
    opt(format!("AuthorizedKeysCommand={}", script.display()));
    for key in host_keys.paths() {
        opt(format!("HostKey={}", key.display()));
    }

    args
}

/// Probe the child's listening port until it accepts a TCP connection.
async fn wait_until_ready(port: u16, attempts: u32, interval: Duration) -> SshdResult<()> {
    for _ in 0..attempts {
        if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            return Ok(());
        }
        tokio::time::sleep(interval).await;
    }
    Err(SshdError::NotReady {
        port,
        waited_ms: (attempts as u64) * interval.as_millis() as u64,
    })
}

/// Owns the child until teardown or exit.
async fn watch(
    mut child: Child,
    shutdown_rx: oneshot::Receiver<()>,
    sshd_port: u16,
    scripts: KeyScripts,
    exit_tx: mpsc::UnboundedSender<u16>,
) {
    tokio::select! {
        status = child.wait() => {
            warn!(sshd_port, "sshd exited unexpectedly: {:?}", status);
            scripts.remove(sshd_port);
            let _ = exit_tx.send(sshd_port);
        }
        // Fires on kill() and on handle drop alike.
        _ = shutdown_rx => {
            debug!(sshd_port, "tearing down sshd");
            let _ = child.start_kill();
            let _ = child.wait().await;
            scripts.remove(sshd_port);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn args_for(port: u16, local: u16) -> Vec<String> {
        let keys = HostKeys::in_folder(Path::new("keys"));
        build_args(
            "forward_user",
            &keys,
            &PathBuf::from("/tmp/authorized_keys/authorized_keys_7857"),
            port,
            local,
        )
    }

    fn options(args: &[String]) -> Vec<&str> {
        args.windows(2)
            .filter(|w| w[0] == "-o")
            .map(|w| w[1].as_str())
            .collect()
    }

    #[test]
    fn runs_in_foreground_with_no_config_file() {
        let args = args_for(7857, 7860);
        assert_eq!(&args[..3], &["-D", "-f", "/dev/null"]);
    }

    #[test]
    fn hardening_options_are_all_present() {
        let args = args_for(7857, 7860);
        let opts = options(&args);
        for expected in [
            "AllowUsers=forward_user",
            "PasswordAuthentication=no",
            "PubkeyAuthentication=yes",
            "AllowTcpForwarding=yes",
            "PermitTunnel=no",
            "PermitRootLogin=no",
            "X11Forwarding=no",
            "PermitUserEnvironment=no",
            "AllowAgentForwarding=no",
            "Port=7857",
            "PermitOpen=localhost:7860",
            "AuthorizedKeysCommandUser=nobody",
            "AuthorizedKeysCommand=/tmp/authorized_keys/authorized_keys_7857",
        ] {
            assert!(opts.contains(&expected), "missing {expected} in {opts:?}");
        }
    }

    #[test]
    fn presents_all_three_host_keys() {
        let args = args_for(7857, 7860);
        let opts = options(&args);
        assert!(opts.contains(&"HostKey=keys/ssh_host_rsa_key"));
        assert!(opts.contains(&"HostKey=keys/ssh_host_ecdsa_key"));
        assert!(opts.contains(&"HostKey=keys/ssh_host_ed25519_key"));
    }

    #[tokio::test]
    async fn readiness_probe_sees_a_bound_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        wait_until_ready(port, 3, Duration::from_millis(10))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn readiness_probe_gives_up_on_a_dead_port() {
        // Nothing listens on port 1 for unprivileged test runs.
        let err = wait_until_ready(1, 2, Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, SshdError::NotReady { port: 1, .. }));
    }
}
