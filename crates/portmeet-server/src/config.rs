//! Server configuration and startup preflight

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::{bail, Context, Result};
use clap::Parser;
use portmeet_sshd::supervisor::SSHD_BINARY;

/// Rendezvous broker for SSH port forwarding tunnels.
#[derive(Parser, Debug)]
#[command(name = "portmeet-server")]
#[command(about = "Run the portmeet rendezvous broker", long_about = None)]
pub struct ServerArgs {
    /// TCP port for the websocket listener
    #[arg(long, env = "SERVER_PORT", default_value_t = 7856)]
    pub server_port: u16,

    /// System user the child sshd instances admit; must exist on this host
    #[arg(long, env = "FORWARDING_USER")]
    pub forwarding_user: String,

    /// Comma-separated candidate ports for the child sshd instances
    #[arg(long, env = "OPENED_PORTS", value_delimiter = ',', required = true)]
    pub opened_ports: Vec<u16>,

    /// Directory holding the RSA/ECDSA/Ed25519 host keys (generated if missing)
    #[arg(long, env = "KEYS_FOLDER", default_value = "keys")]
    pub keys_folder: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

/// Everything that must hold before the broker starts taking sockets.
pub fn preflight(args: &ServerArgs) -> Result<()> {
    if !Path::new(SSHD_BINARY).exists() {
        bail!("{SSHD_BINARY} not found; the broker needs an OpenSSH server installed");
    }

    if args.opened_ports.is_empty() {
        bail!("OPENED_PORTS must name at least one candidate sshd port");
    }
    if args.opened_ports.contains(&0) {
        bail!("OPENED_PORTS entries must be between 1 and 65535");
    }

    let status = Command::new("id")
        .arg(&args.forwarding_user)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .context("could not run `id` to check the forwarding user")?;
    if !status.success() {
        bail!(
            "forwarding user \"{}\" does not exist on this host",
            args.forwarding_user
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(forwarding_user: &str, opened_ports: Vec<u16>) -> ServerArgs {
        ServerArgs {
            server_port: 7856,
            forwarding_user: forwarding_user.into(),
            opened_ports,
            keys_folder: PathBuf::from("keys"),
            log_level: "info".into(),
        }
    }

    #[test]
    fn empty_port_set_is_fatal() {
        assert!(preflight(&args("root", vec![])).is_err());
    }

    #[test]
    fn port_zero_is_fatal() {
        assert!(preflight(&args("root", vec![7857, 0])).is_err());
    }

    #[test]
    fn unknown_forwarding_user_is_fatal() {
        assert!(preflight(&args("portmeet-no-such-user", vec![7857])).is_err());
    }

    #[test]
    fn env_and_flags_share_one_schema() {
        use clap::CommandFactory;
        ServerArgs::command().debug_assert();
    }
}
