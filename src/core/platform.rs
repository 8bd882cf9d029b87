//! KL-003: Host platform detection.

use super::types::Platform;

/// Map Rust's `std::env::consts::OS` to recipe vocabulary.
pub fn normalize_os(os: &str) -> String {
    match os {
        "macos" => "darwin".to_string(),
        other => other.to_string(),
    }
}

/// Map Rust's `std::env::consts::ARCH` to recipe vocabulary.
pub fn normalize_arch(arch: &str) -> String {
    match arch {
        "x86_64" => "amd64".to_string(),
        "aarch64" => "arm64".to_string(),
        "x86" => "386".to_string(),
        "arm" => "armv7".to_string(),
        other => other.to_string(),
    }
}

/// Classify a Linux distribution from `/etc/os-release` content by
/// package-manager lineage.
pub fn family_from_os_release(content: &str) -> Option<String> {
    let mut ids: Vec<String> = Vec::new();
    for line in content.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        if key == "ID" || key == "ID_LIKE" {
            let value = value.trim().trim_matches('"').trim_matches('\'');
            ids.extend(value.split_whitespace().map(|s| s.to_ascii_lowercase()));
        }
    }
    ids.iter().find_map(|id| {
        let family = match id.as_str() {
            "debian" | "ubuntu" | "linuxmint" | "pop" | "raspbian" => "debian",
            "rhel" | "fedora" | "centos" | "rocky" | "almalinux" | "amzn" => "rhel",
            "alpine" => "alpine",
            "arch" | "manjaro" | "endeavouros" => "arch",
            "suse" | "opensuse" | "opensuse-leap" | "opensuse-tumbleweed" | "sles" => "suse",
            _ => return None,
        };
        Some(family.to_string())
    })
}

/// Detect the C library flavor on Linux.
fn detect_libc() -> Option<String> {
    if cfg!(target_env = "musl") {
        return Some("musl".to_string());
    }
    let musl_loader = std::fs::read_dir("/lib")
        .ok()?
        .filter_map(|e| e.ok())
        .any(|e| e.file_name().to_string_lossy().starts_with("ld-musl-"));
    Some(if musl_loader { "musl" } else { "glibc" }.to_string())
}

/// Detect the host platform.
pub fn detect_host() -> Platform {
    let mut platform = Platform::new(
        &normalize_os(std::env::consts::OS),
        &normalize_arch(std::env::consts::ARCH),
    );
    if platform.os == "linux" {
        platform.linux_family = std::fs::read_to_string("/etc/os-release")
            .ok()
            .and_then(|c| family_from_os_release(&c));
        platform.libc = detect_libc();
    }
    platform
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kl003_normalize() {
        assert_eq!(normalize_os("macos"), "darwin");
        assert_eq!(normalize_os("linux"), "linux");
        assert_eq!(normalize_arch("x86_64"), "amd64");
        assert_eq!(normalize_arch("aarch64"), "arm64");
        assert_eq!(normalize_arch("riscv64"), "riscv64");
    }

    #[test]
    fn test_kl003_family_ubuntu() {
        let content = "NAME=\"Ubuntu\"\nID=ubuntu\nID_LIKE=debian\nVERSION_ID=\"24.04\"\n";
        assert_eq!(family_from_os_release(content).as_deref(), Some("debian"));
    }

    #[test]
    fn test_kl003_family_rocky_id_like() {
        let content = "ID=\"rocky\"\nID_LIKE=\"rhel centos fedora\"\n";
        assert_eq!(family_from_os_release(content).as_deref(), Some("rhel"));
    }

    #[test]
    fn test_kl003_family_alpine() {
        assert_eq!(
            family_from_os_release("ID=alpine\n").as_deref(),
            Some("alpine")
        );
    }

    #[test]
    fn test_kl003_family_unknown() {
        assert_eq!(family_from_os_release("ID=plan9\n"), None);
        assert_eq!(family_from_os_release(""), None);
    }

    #[test]
    fn test_kl003_detect_host_consistent() {
        let host = detect_host();
        assert!(!host.os.is_empty());
        assert!(!host.arch.is_empty());
        if host.os != "linux" {
            assert!(host.linux_family.is_none());
        }
        assert_eq!(host, detect_host());
    }
}
