//! Host identity detection: hostname, device model, primary MAC address.

use std::fs;
use std::path::Path;

/// Returns the machine hostname, falling back to "magicbox" when the kernel
/// does not expose one.
pub fn hostname() -> String {
    if let Ok(name) = fs::read_to_string("/proc/sys/kernel/hostname") {
        let name = name.trim();
        if !name.is_empty() {
            return name.to_string();
        }
    }
    if let Ok(name) = std::env::var("HOSTNAME") {
        if !name.is_empty() {
            return name;
        }
    }
    "magicbox".to_string()
}

/// Returns a human-readable device model.
///
/// Embedded boards (Jetson, Raspberry Pi) publish their model in the device
/// tree; generic machines fall back to the OS pretty name.
pub fn device_model() -> String {
    if let Ok(model) = fs::read_to_string("/proc/device-tree/model") {
        // Device-tree strings are NUL terminated.
        let model = model.trim_matches(char::from(0)).trim();
        if !model.is_empty() {
            return model.to_string();
        }
    }

    if let Ok(release) = fs::read_to_string("/etc/os-release") {
        for line in release.lines() {
            if let Some(value) = line.strip_prefix("PRETTY_NAME=") {
                return value.trim_matches('"').to_string();
            }
        }
    }

    "unknown".to_string()
}

/// Returns the MAC address of the primary non-loopback interface.
///
/// Wired interfaces are preferred over wireless; virtual interfaces
/// (bridges, tunnels, containers) are skipped.
pub fn primary_mac() -> Option<String> {
    let entries = fs::read_dir("/sys/class/net").ok()?;

    let mut candidates: Vec<(u8, String, String)> = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        if name == "lo" || is_virtual_interface(&name) {
            continue;
        }
        let mac = match read_mac(&entry.path()) {
            Some(mac) => mac,
            None => continue,
        };
        let rank = if name.starts_with("eth") || name.starts_with("en") {
            0
        } else if name.starts_with("wl") {
            1
        } else {
            2
        };
        candidates.push((rank, name, mac));
    }

    candidates.sort();
    candidates.into_iter().next().map(|(_, _, mac)| mac)
}

fn is_virtual_interface(name: &str) -> bool {
    const VIRTUAL_PREFIXES: &[&str] = &["wg", "docker", "veth", "br-", "virbr", "tun", "tap"];
    VIRTUAL_PREFIXES.iter().any(|p| name.starts_with(p))
}

fn read_mac(iface_dir: &Path) -> Option<String> {
    let mac = fs::read_to_string(iface_dir.join("address")).ok()?;
    let mac = mac.trim().to_string();
    if mac.is_empty() || mac == "00:00:00:00:00:00" {
        return None;
    }
    Some(mac)
}

/// Best-effort local IP discovery: open a UDP socket towards a public
/// address and read the chosen source address. No packets are sent.
pub fn local_ip() -> String {
    use std::net::UdpSocket;

    if let Ok(socket) = UdpSocket::bind("0.0.0.0:0") {
        if socket.connect("8.8.8.8:80").is_ok() {
            if let Ok(addr) = socket.local_addr() {
                return addr.ip().to_string();
            }
        }
    }

    "127.0.0.1".to_string()
}
