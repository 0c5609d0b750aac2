use std::fs;
use std::process::Command;
use tempfile::tempdir;

// Nothing listens on the discard port, so every release lookup fails fast.
const UNREACHABLE: &str = r#"{
    "api_base": "http://127.0.0.1:9",
    "retries": 0,
    "binaries": [{
        "name": "broken",
        "repo": "example/broken",
        "version": "v1.0.0",
        "source": "release-archive",
        "assets": [
            {"os": "darwin", "arch": "amd64", "match": "\\.tar\\.gz$"},
            {"os": "darwin", "arch": "arm64", "match": "\\.tar\\.gz$"},
            {"os": "linux", "arch": "amd64", "match": "\\.tar\\.gz$"},
            {"os": "linux", "arch": "arm64", "match": "\\.tar\\.gz$"},
            {"os": "windows", "arch": "amd64", "match": "\\.tar\\.gz$"}
        ]
    }]
}"#;

#[test]
fn upgrade_failures_name_each_binary_once() {
    let temp = tempdir().expect("Failed to create temp dir");
    let config = temp.path().join("binaries.json");
    fs::write(&config, UNREACHABLE).expect("Failed to write test registry");

    let output = Command::new(env!("CARGO_BIN_EXE_toolpin"))
        .arg("--config")
        .arg(&config)
        .arg("--install-dir")
        .arg(temp.path().join("bin"))
        .arg("upgrade")
        .env_remove("TOOLPIN_INSTALL_DIR")
        .env_remove("GITHUB_TOKEN")
        .env_remove("GH_TOKEN")
        .output()
        .expect("Failed to execute command");

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert_eq!(output.status.code(), Some(1), "stderr: {stderr}");
    assert!(stdout.contains("0 upgraded, 0 up to date, 1 failed"), "stdout: {stdout}");
    assert!(stderr.contains("broken: "), "stderr: {stderr}");
    assert!(!stderr.contains("broken: broken:"), "stderr: {stderr}");
}
