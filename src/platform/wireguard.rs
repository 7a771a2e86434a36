//! WireGuard tunnel provisioning
//!
//! The coordinator hands out tunnel addresses; the node generates its key
//! pair with the `wg` tool, requests an assignment, writes the tunnel
//! configuration, and brings the interface up with `wg-quick`. State is
//! latched into the node configuration so provisioning is one-shot.

use super::api::CoordinatorClient;
use super::PlatformError;
use crate::config::{ConfigStore, WireGuardBinding};
use std::path::Path;
use tokio::process::Command;
use tracing::{info, warn};

const KEYS_DIR: &str = "/etc/wireguard/keys";
const TUNNEL_CONF: &str = "/etc/wireguard/wg-iris.conf";
const INTERFACE: &str = "wg-iris";

/// Returns the node key pair, generating and persisting one on first use.
pub async fn ensure_keys() -> Result<(String, String), PlatformError> {
    let keys_dir = Path::new(KEYS_DIR);
    let private_path = keys_dir.join("private.key");
    let public_path = keys_dir.join("public.key");

    if private_path.is_file() && public_path.is_file() {
        let private = std::fs::read_to_string(&private_path)?.trim().to_string();
        let public = std::fs::read_to_string(&public_path)?.trim().to_string();
        if !private.is_empty() && !public.is_empty() {
            return Ok((private, public));
        }
    }

    let genkey = Command::new("wg").arg("genkey").output().await?;
    if !genkey.status.success() {
        return Err(PlatformError::WireGuard("wg genkey failed".to_string()));
    }
    let private = String::from_utf8_lossy(&genkey.stdout).trim().to_string();

    let mut pubkey = Command::new("wg")
        .arg("pubkey")
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .spawn()?;
    if let Some(mut stdin) = pubkey.stdin.take() {
        use tokio::io::AsyncWriteExt;
        stdin.write_all(private.as_bytes()).await?;
    }
    let output = pubkey.wait_with_output().await?;
    if !output.status.success() {
        return Err(PlatformError::WireGuard("wg pubkey failed".to_string()));
    }
    let public = String::from_utf8_lossy(&output.stdout).trim().to_string();

    std::fs::create_dir_all(keys_dir)?;
    std::fs::write(&private_path, format!("{}\n", private))?;
    std::fs::write(&public_path, format!("{}\n", public))?;
    info!("Generated WireGuard key pair");

    Ok((private, public))
}

/// Requests a tunnel assignment from the coordinator, writes the tunnel
/// configuration, brings the interface up, and latches the binding.
pub async fn setup(
    client: &CoordinatorClient,
    store: &ConfigStore,
) -> Result<WireGuardBinding, PlatformError> {
    let config = store.get();
    if config.wireguard.configured {
        info!("WireGuard already configured, skipping setup");
        return Ok(config.wireguard);
    }
    if !config.state.is_provisioned() {
        return Err(PlatformError::NotProvisioned);
    }

    let (private, public) = ensure_keys().await?;
    let response = client
        .wireguard_setup(&config.platform.worker_id, &config.platform.auth_token, &public)
        .await?;
    let assignment = response.wireguard;

    write_tunnel_conf(
        &private,
        &assignment.assigned_ip,
        &assignment.server_pubkey,
        &assignment.server_endpoint,
    )?;

    if let Err(e) = bring_up().await {
        // The config is on disk; the operator can bring the tunnel up
        // manually and the latch still records the assignment.
        warn!(error = %e, "wg-quick up failed");
    }

    let binding = WireGuardBinding {
        enabled: true,
        private_key: private,
        public_key: public,
        address: assignment.assigned_ip,
        server_public_key: assignment.server_pubkey,
        server_endpoint: assignment.server_endpoint,
        configured: true,
    };
    store.set_wireguard(binding.clone())?;
    info!(address = %binding.address, "WireGuard tunnel configured");

    Ok(binding)
}

fn write_tunnel_conf(
    private_key: &str,
    address: &str,
    server_pubkey: &str,
    server_endpoint: &str,
) -> Result<(), PlatformError> {
    let conf = format!(
        "[Interface]\n\
         PrivateKey = {}\n\
         Address = {}\n\
         \n\
         [Peer]\n\
         PublicKey = {}\n\
         Endpoint = {}\n\
         AllowedIPs = 10.8.0.0/24\n\
         PersistentKeepalive = 25\n",
        private_key, address, server_pubkey, server_endpoint
    );
    if let Some(parent) = Path::new(TUNNEL_CONF).parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(TUNNEL_CONF, conf)?;
    Ok(())
}

async fn bring_up() -> Result<(), PlatformError> {
    // Restart cleanly if a previous instance is still up.
    let _ = Command::new("wg-quick")
        .args(["down", INTERFACE])
        .output()
        .await;
    let output = Command::new("wg-quick")
        .args(["up", INTERFACE])
        .output()
        .await?;
    if !output.status.success() {
        return Err(PlatformError::WireGuard(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }
    Ok(())
}
