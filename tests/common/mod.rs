//! Shared helpers for integration tests

#![allow(dead_code)]

use std::path::{Path, PathBuf};

use certsuite::HarnessConfig;

/// A raw structured log where every result is as expected
pub const PASSING_LOG: &str = r#"{"action": "suite_start", "tests": ["t1"], "time": 1}
{"action": "test_start", "test": "t1", "time": 2}
{"action": "test_status", "test": "t1", "subtest": "s1", "status": "PASS", "time": 3}
{"action": "test_end", "test": "t1", "status": "OK", "time": 4}
{"action": "suite_end", "time": 5}"#;

/// A raw structured log with one unexpected failure
pub const FAILING_LOG: &str = r#"{"action": "suite_start", "tests": ["t1"], "time": 1}
{"action": "test_start", "test": "t1", "time": 2}
{"action": "test_status", "test": "t1", "subtest": "s1", "status": "FAIL", "expected": "PASS", "time": 3}
{"action": "test_end", "test": "t1", "status": "OK", "time": 4}
{"action": "suite_end", "time": 5}"#;

/// Config with fast timeouts, a fixed host address and a probe port picked
/// by the OS
pub fn base_config() -> HarnessConfig {
    HarnessConfig::parse_toml(
        r#"
version = "2.0"

[timeouts]
poll_interval_ms = 10
network_seconds = 1
device_ready_seconds = 1
agent_port_seconds = 1

[host_check]
ports = [0]
host_ip = "127.0.0.1"

[device]
backup_dirs = ["/a/b"]
backup_files = ["/c/d.cfg"]
"#,
    )
    .unwrap()
}

/// Write an executable shell script that records its arguments to
/// `<dir>/<name>.args` and writes `log` to the `--log-raw=` path
#[cfg(unix)]
pub fn suite_script(dir: &Path, name: &str, log: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    let args_file = dir.join(format!("{}.args", name));
    let body = format!(
        r#"#!/bin/sh
for a in "$@"; do
  echo "$a" >> '{args}'
  case "$a" in
    --log-raw=*) raw="${{a#--log-raw=}}" ;;
  esac
done
echo --- >> '{args}'
cat > "$raw" <<'CERTSUITE_EOF'
{log}
CERTSUITE_EOF
"#,
        args = args_file.display(),
        log = log
    );
    std::fs::write(&path, body).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Argument lists a script written by [`suite_script`] was invoked with
#[cfg(unix)]
pub fn recorded_invocations(dir: &Path, name: &str) -> Vec<Vec<String>> {
    let content = std::fs::read_to_string(dir.join(format!("{}.args", name))).unwrap_or_default();
    content
        .split("---\n")
        .filter(|chunk| !chunk.is_empty())
        .map(|chunk| chunk.lines().map(str::to_string).collect())
        .collect()
}

/// Names of the entries in a `.tar.gz` archive, in order
pub fn archive_entries(path: &Path) -> Vec<String> {
    let file = std::fs::File::open(path).unwrap();
    let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(file));
    archive
        .entries()
        .unwrap()
        .map(|entry| entry.unwrap().path().unwrap().display().to_string())
        .collect()
}

/// Content of one entry in a `.tar.gz` archive
pub fn archive_file(path: &Path, name: &str) -> Option<String> {
    use std::io::Read;

    let file = std::fs::File::open(path).unwrap();
    let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(file));
    let mut entries = archive.entries().unwrap();
    entries.find_map(|entry| {
        let mut entry = entry.unwrap();
        if entry.path().unwrap().display().to_string() != name {
            return None;
        }
        let mut content = String::new();
        entry.read_to_string(&mut content).unwrap();
        Some(content)
    })
}
