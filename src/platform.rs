//! Operating system and architecture naming.
//!
//! Registry rules, build-cache asset names, and toolchain environment
//! variables all use Go-style names (`darwin`, `linux`, `windows`;
//! `amd64`, `arm64`). The host platform is detected from
//! `std::env::consts` and normalized into that vocabulary.

use std::fmt;

/// Every release-archive entry is checked against these pairs.
pub const VALIDATION_MATRIX: [(&str, &str); 5] = [
    ("darwin", "amd64"),
    ("darwin", "arm64"),
    ("linux", "amd64"),
    ("linux", "arm64"),
    ("windows", "amd64"),
];

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Platform {
    pub os: String,
    pub arch: String,
}

impl Platform {
    pub fn new(os: &str, arch: &str) -> Self {
        Self {
            os: normalize_os(os),
            arch: normalize_arch(arch),
        }
    }

    /// The platform this process is running on.
    pub fn host() -> Self {
        Self::new(std::env::consts::OS, std::env::consts::ARCH)
    }

    pub fn is_host(&self) -> bool {
        *self == Self::host()
    }

    pub fn is_windows(&self) -> bool {
        self.os == "windows"
    }

    /// ".exe" for Windows targets, empty otherwise.
    pub fn exe_suffix(&self) -> &'static str {
        if self.is_windows() { ".exe" } else { "" }
    }

    /// Appends the executable suffix unless `name` already carries it.
    pub fn executable_name(&self, name: &str) -> String {
        let suffix = self.exe_suffix();
        if suffix.is_empty() || name.ends_with(suffix) {
            name.to_string()
        } else {
            format!("{name}{suffix}")
        }
    }

    /// Keys a vendor manifest may use for this platform, most specific first.
    ///
    /// Vendors publish either Go-style (`linux-amd64`) or Node-style
    /// (`linux-x64`, `win32-x64`) platform strings.
    pub fn vendor_keys(&self) -> Vec<String> {
        let node_os = match self.os.as_str() {
            "windows" => "win32",
            other => other,
        };
        let node_arch = match self.arch.as_str() {
            "amd64" => "x64",
            other => other,
        };
        let mut keys = vec![format!("{}-{}", self.os, self.arch)];
        let node = format!("{node_os}-{node_arch}");
        if !keys.contains(&node) {
            keys.push(node);
        }
        keys
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.arch)
    }
}

fn normalize_os(os: &str) -> String {
    match os.to_ascii_lowercase().as_str() {
        "macos" | "osx" | "darwin" => "darwin".to_string(),
        "win32" | "windows" => "windows".to_string(),
        other => other.to_string(),
    }
}

fn normalize_arch(arch: &str) -> String {
    match arch.to_ascii_lowercase().as_str() {
        "x86_64" | "x64" | "amd64" => "amd64".to_string(),
        "aarch64" | "arm64" => "arm64".to_string(),
        other => other.to_string(),
    }
}
