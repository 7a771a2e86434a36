//! systemd service install / uninstall

use std::path::Path;
use tracing::info;

const UNIT_PATH: &str = "/etc/systemd/system/magicbox.service";

/// Writes the service unit pointing at the current executable with the
/// given arguments, and enables it.
pub fn install(config_path: &str, data_dir: &str) -> std::io::Result<()> {
    let exe = std::env::current_exe()?;
    let unit = format!(
        "[Unit]\n\
         Description=MagicBox edge analytics node\n\
         After=network-online.target\n\
         Wants=network-online.target\n\
         \n\
         [Service]\n\
         ExecStart={} --config {} --data {}\n\
         Restart=always\n\
         RestartSec=5\n\
         \n\
         [Install]\n\
         WantedBy=multi-user.target\n",
        exe.display(),
        config_path,
        data_dir,
    );
    std::fs::write(UNIT_PATH, unit)?;
    let _ = std::process::Command::new("systemctl")
        .args(["enable", "magicbox.service"])
        .status();
    info!(unit = UNIT_PATH, "Service installed");
    Ok(())
}

/// Disables and removes the service unit.
pub fn uninstall() -> std::io::Result<()> {
    let _ = std::process::Command::new("systemctl")
        .args(["disable", "--now", "magicbox.service"])
        .status();
    if Path::new(UNIT_PATH).is_file() {
        std::fs::remove_file(UNIT_PATH)?;
    }
    info!("Service removed");
    Ok(())
}
