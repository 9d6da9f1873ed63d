//! # Device information reported to the control server.
//!
//! [`DevInfo`] is collected once at agent construction. It feeds the update
//! request's query string and the `agent.info()` table exposed to scripts.
//!
//! Host, CPU, memory and network values come from [`sysinfo`]. The baseboard is
//! read from DMI and the Android identifiers from `getprop`/`settings` when the
//! host looks like an Android system.
//!
//! Values that cannot be read on the current platform are left empty; collection
//! never fails.

use std::fs;
use std::path::Path;
use std::process::Command;

use sysinfo::{Networks, System};

/// Snapshot of host properties.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DevInfo {
    /// Host name.
    pub hostname: String,
    /// Operating system (`linux`, `macos`, `windows`, `android`, ...).
    pub os: String,
    /// Distribution id (`ubuntu`, `debian`, ...), or the OS family.
    pub platform: String,
    /// Distribution or OS version, when available.
    pub platform_version: String,
    /// Boot time in seconds since the Unix epoch.
    pub boot_time: u64,
    /// CPU architecture.
    pub arch: String,
    /// `name:mac` pairs of every network interface, comma separated.
    pub macs: String,
    /// CPU model name, when available.
    pub cpu_model: String,
    /// Logical CPU count.
    pub cpu_cores: usize,
    /// Frequency of the first CPU in MHz.
    pub cpu_mhz: u64,
    /// Total memory in bytes.
    pub total_memory: u64,
    /// Used memory in bytes.
    pub used_memory: u64,
    /// Available memory in bytes.
    pub available_memory: u64,
    /// Baseboard vendor and product.
    pub baseboard: String,
    /// Stable machine identifier, when available.
    pub machine_id: String,
    /// Android `secure android_id`, empty elsewhere.
    pub android_id: String,
    /// Android `ro.serialno`, empty elsewhere.
    pub android_serial: String,
}

impl DevInfo {
    /// Collects device information from the running host.
    pub fn collect() -> Self {
        let sys = System::new_all();
        let cpus = sys.cpus();
        let networks = Networks::new_with_refreshed_list();

        let (android_id, android_serial) = if is_android() {
            (
                command_output("settings", &["get", "secure", "android_id"]),
                command_output("getprop", &["ro.serialno"]),
            )
        } else {
            (String::new(), String::new())
        };

        Self {
            hostname: System::host_name().unwrap_or_default(),
            os: resolve_os(std::env::consts::OS, &android_id, &android_serial),
            platform: non_empty(System::distribution_id())
                .unwrap_or_else(|| std::env::consts::FAMILY.to_string()),
            platform_version: System::os_version().unwrap_or_default(),
            boot_time: System::boot_time(),
            arch: std::env::consts::ARCH.to_string(),
            macs: join_macs(
                networks
                    .list()
                    .iter()
                    .map(|(name, data)| (name.clone(), data.mac_address().to_string())),
            ),
            cpu_model: cpus
                .first()
                .map(|c| c.brand().trim().to_string())
                .unwrap_or_default(),
            cpu_cores: if cpus.is_empty() {
                std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1)
            } else {
                cpus.len()
            },
            cpu_mhz: cpus.first().map(|c| c.frequency()).unwrap_or(0),
            total_memory: sys.total_memory(),
            used_memory: sys.used_memory(),
            available_memory: sys.available_memory(),
            baseboard: format!(
                "Vendor:{},Product:{}",
                read_trimmed("/sys/class/dmi/id/board_vendor"),
                read_trimmed("/sys/class/dmi/id/board_name")
            ),
            machine_id: read_trimmed("/etc/machine-id"),
            android_id,
            android_serial,
        }
    }

    /// Returns `(key, value)` pairs for the update request query string.
    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        vec![
            ("hostname", self.hostname.clone()),
            ("os", self.os.clone()),
            ("platform", self.platform.clone()),
            ("platformVersion", self.platform_version.clone()),
            ("bootTime", self.boot_time.to_string()),
            ("arch", self.arch.clone()),
            ("macs", self.macs.clone()),
            ("cpuModuleName", self.cpu_model.clone()),
            ("cpuCores", self.cpu_cores.to_string()),
            ("cpuMhz", self.cpu_mhz.to_string()),
            ("totalmemory", self.total_memory.to_string()),
            ("usedMemory", self.used_memory.to_string()),
            ("availableMemory", self.available_memory.to_string()),
            ("baseboard", self.baseboard.clone()),
            ("uuid", self.machine_id.clone()),
            ("androidID", self.android_id.clone()),
            ("androidSerialNumber", self.android_serial.clone()),
        ]
    }
}

/// Any Android identifier turns the reported OS into `android`.
fn resolve_os(base: &str, android_id: &str, android_serial: &str) -> String {
    if android_id.is_empty() && android_serial.is_empty() {
        base.to_string()
    } else {
        "android".to_string()
    }
}

/// Formats interfaces as `name:mac,name:mac`, sorted by name.
fn join_macs(interfaces: impl Iterator<Item = (String, String)>) -> String {
    let mut pairs: Vec<_> = interfaces.collect();
    pairs.sort();
    pairs
        .iter()
        .map(|(name, mac)| format!("{name}:{mac}"))
        .collect::<Vec<_>>()
        .join(",")
}

fn is_android() -> bool {
    cfg!(target_os = "linux") && Path::new("/system/build.prop").exists()
}

fn command_output(program: &str, args: &[&str]) -> String {
    Command::new(program)
        .args(args)
        .output()
        .ok()
        .filter(|out| out.status.success())
        .map(|out| String::from_utf8_lossy(&out.stdout).trim().to_string())
        .unwrap_or_default()
}

fn non_empty(s: String) -> Option<String> {
    (!s.is_empty()).then_some(s)
}

fn read_trimmed(path: &str) -> String {
    fs::read_to_string(path)
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collect_fills_build_constants() {
        let info = DevInfo::collect();
        assert!(info.os == std::env::consts::OS || info.os == "android");
        assert_eq!(info.arch, std::env::consts::ARCH);
        assert!(info.cpu_cores >= 1);
        assert!(info.baseboard.starts_with("Vendor:"));
    }

    #[test]
    fn test_android_identifiers_override_os() {
        assert_eq!(resolve_os("linux", "", ""), "linux");
        assert_eq!(resolve_os("linux", "", "R58M"), "android");
        assert_eq!(resolve_os("linux", "9774d56d682e549c", ""), "android");
    }

    #[test]
    fn test_macs_are_sorted_pairs() {
        let macs = join_macs(
            [
                ("wlan0".to_string(), "aa:bb:cc:dd:ee:ff".to_string()),
                ("eth0".to_string(), "00:11:22:33:44:55".to_string()),
            ]
            .into_iter(),
        );
        assert_eq!(macs, "eth0:00:11:22:33:44:55,wlan0:aa:bb:cc:dd:ee:ff");
        assert_eq!(join_macs(std::iter::empty()), "");
    }

    #[test]
    fn test_query_pairs_cover_identity_fields() {
        let info = DevInfo {
            hostname: "edge-01".into(),
            cpu_cores: 4,
            boot_time: 1_700_000_000,
            used_memory: 512,
            ..DevInfo::default()
        };
        let pairs = info.query_pairs();
        assert!(pairs.contains(&("hostname", "edge-01".to_string())));
        assert!(pairs.contains(&("cpuCores", "4".to_string())));
        assert!(pairs.contains(&("bootTime", "1700000000".to_string())));
        assert!(pairs.contains(&("usedMemory", "512".to_string())));
        assert!(pairs.contains(&("androidID", String::new())));
    }
}
