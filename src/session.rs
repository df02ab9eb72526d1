//! Device session: readiness probes over the device-control transport
//!
//! The device offers no notifications, so every state transition is
//! observed by polling:
//! - network-ready: the device reports a usable IP address
//! - device-ready: b2g rewrote `prefs.js` after a restart or reboot
//! - process-stopped: a named process left the process table
//!
//! State-changing commands (`stop b2g`, `start b2g`, reboot) run as the
//! after-first-poll callback, so they only fire once the probe has seen the
//! device is not already in the target state.

use std::cell::Cell;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use certsuite_device::{DeviceControl, DeviceError};
use chrono::{Local, TimeZone};
use regex_lite::Regex;
use tracing::{debug, info, warn};

use crate::config::HarnessConfig;
use crate::failure::FailureKind;
use crate::poll::{poll_wait, PollError};
use crate::signal::SignalState;
use crate::timeout::TimeoutConfig;

/// Main b2g process name
pub const B2G_PROCESS: &str = "b2g";

/// How far `prefs.js` is pushed into the past before waiting for b2g to
/// rewrite it: 1 year, 1 day, 1 hour, 1 minute and 1 second.
pub const PREFS_BACKDATE_SECONDS: i64 = 365 * 86_400 + 86_400 + 3_600 + 60 + 1;

/// Session errors
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error("timed out waiting for {what} after {elapsed_ms}ms ({attempts} polls)")]
    Timeout {
        what: &'static str,
        elapsed_ms: u128,
        attempts: u32,
    },

    #[error("expected exactly one profile under {base}, found {count}")]
    ProfileCount { base: String, count: usize },

    #[error("unexpected output from `{command}`: {output:?}")]
    BadOutput { command: String, output: String },

    #[error("local I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("interrupted while waiting for {0}")]
    Interrupted(&'static str),
}

impl SessionError {
    pub fn kind(&self) -> FailureKind {
        match self {
            SessionError::Device(e) if e.is_timeout() => FailureKind::Timeout,
            SessionError::Device(_) => FailureKind::Transport,
            SessionError::Timeout { .. } => FailureKind::Timeout,
            SessionError::ProfileCount { .. } | SessionError::BadOutput { .. } => FailureKind::Transport,
            SessionError::Io(_) => FailureKind::Other,
            SessionError::Interrupted(_) => FailureKind::Interrupted,
        }
    }

    /// True when a device command failed because its program is missing
    pub fn is_command_not_found(&self, program: &str) -> bool {
        match self {
            SessionError::Device(e) => e
                .output()
                .map(|out| out.contains(&format!("{}: not found", program)))
                .unwrap_or(false),
            _ => false,
        }
    }

    fn from_poll(what: &'static str, error: PollError<SessionError>) -> Self {
        match error {
            PollError::Timeout { elapsed, attempts } => SessionError::Timeout {
                what,
                elapsed_ms: elapsed.as_millis(),
                attempts,
            },
            PollError::Predicate(e) => e,
        }
    }
}

/// One-shot action run after the first failed poll
pub type AfterFirst<'a> = Option<&'a mut dyn FnMut() -> Result<(), SessionError>>;

/// Live control channel to the device under test
pub struct DeviceSession {
    device: Arc<dyn DeviceControl>,
    timeouts: TimeoutConfig,
    profile_base: String,
    signals: Option<Arc<SignalState>>,
}

impl DeviceSession {
    pub fn new(device: Arc<dyn DeviceControl>, timeouts: TimeoutConfig, profile_base: impl Into<String>) -> Self {
        Self {
            device,
            timeouts,
            profile_base: profile_base.into(),
            signals: None,
        }
    }

    /// Abandon readiness waits once an interrupt arrives
    pub fn with_signals(mut self, signals: Arc<SignalState>) -> Self {
        self.signals = Some(signals);
        self
    }

    fn check_interrupt(&self, what: &'static str) -> Result<(), SessionError> {
        match self.signals {
            Some(ref signals) if signals.is_cancel_requested() => Err(SessionError::Interrupted(what)),
            _ => Ok(()),
        }
    }

    pub fn from_config(device: Arc<dyn DeviceControl>, config: &HarnessConfig) -> Self {
        Self::new(device, config.timeouts, config.device.profile_base.clone())
    }

    pub fn device(&self) -> &Arc<dyn DeviceControl> {
        &self.device
    }

    pub fn timeouts(&self) -> &TimeoutConfig {
        &self.timeouts
    }

    /// Run a shell command with the configured command timeout
    pub fn shell(&self, command: &str) -> Result<String, SessionError> {
        Ok(self.device.shell(command, Some(self.timeouts.command_timeout()))?)
    }

    /// Current IP address of the device, if it has one.
    ///
    /// Reads `netcfg`, falling back to `ifconfig wlan0` on firmware without
    /// it.
    pub fn get_ip_address(&self) -> Result<Option<String>, SessionError> {
        match self.shell("netcfg") {
            Ok(output) => return Ok(parse_netcfg(&output)),
            Err(e) if e.is_command_not_found("netcfg") => {
                debug!("netcfg not available, trying ifconfig");
            }
            Err(e) => return Err(e),
        }
        match self.shell("ifconfig wlan0") {
            Ok(output) => Ok(parse_ifconfig(&output)),
            Err(SessionError::Device(DeviceError::CommandFailed { .. })) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Wait for the device to report an IP address
    pub fn wait_for_net(&self) -> Result<String, SessionError> {
        info!("Waiting for network connection");
        let ip = poll_wait(
            || {
                self.check_interrupt("network")?;
                self.get_ip_address()
            },
            self.timeouts.network(),
            None,
        )
            .map_err(|e| SessionError::from_poll("network", e))?;
        info!(ip = %ip, "Network is up");
        Ok(ip)
    }

    /// Profiles listed in `<profile_base>/profiles.ini`, name to absolute path
    pub fn get_profiles(&self) -> Result<BTreeMap<String, String>, SessionError> {
        let staging = tempfile::tempdir()?;
        let local = staging.path().join("profiles.ini");
        let remote = format!("{}/profiles.ini", self.profile_base);
        self.device.pull(&remote, &local)?;
        let content = std::fs::read_to_string(&local)?;
        Ok(parse_profiles_ini(&content, &self.profile_base))
    }

    /// Device clock, in seconds since the epoch
    pub fn device_time(&self) -> Result<i64, SessionError> {
        let command = "date +%s";
        let output = self.shell(command)?;
        output.trim().parse().map_err(|_| SessionError::BadOutput {
            command: command.to_string(),
            output,
        })
    }

    /// Set a remote file's modification time.
    ///
    /// Newer toolbox `touch` takes seconds since the epoch; older firmware
    /// only accepts `YYYYmmdd.HHMMSS`.
    pub fn set_mtime(&self, remote: &str, timestamp: i64) -> Result<(), SessionError> {
        match self.shell(&format!("touch -t {} {}", timestamp, remote)) {
            Ok(_) => Ok(()),
            Err(SessionError::Device(DeviceError::CommandFailed { output, .. })) => {
                debug!(output = %output.trim(), "touch rejected epoch timestamp, retrying with date format");
                let formatted = Local
                    .timestamp_opt(timestamp, 0)
                    .single()
                    .map(|t| t.format("%Y%m%d.%H%M%S").to_string())
                    .ok_or_else(|| SessionError::BadOutput {
                        command: "date +%s".to_string(),
                        output: timestamp.to_string(),
                    })?;
                self.shell(&format!("touch -t {} {}", formatted, remote))?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Modification time of a remote file as shown by `ls -l`
    pub fn listing_mtime(&self, remote: &str) -> Result<String, SessionError> {
        let output = self.shell(&format!("ls -l {}", remote))?;
        let line = output.lines().next().unwrap_or_default();
        Ok(parse_listing_mtime(line))
    }

    /// Wait until b2g has (re)written its prefs.
    ///
    /// Back-dates `prefs.js`, runs `after_first` once the first poll saw no
    /// change, then polls the listing until the modification time moves.
    /// Once the action has fired, transport errors count as "not yet": the
    /// device is expected to drop off while it restarts.
    pub fn wait_for_device_ready(&self, mut after_first: AfterFirst<'_>) -> Result<(), SessionError> {
        let profiles = self.get_profiles()?;
        if profiles.len() != 1 {
            return Err(SessionError::ProfileCount {
                base: self.profile_base.clone(),
                count: profiles.len(),
            });
        }
        let Some(profile) = profiles.values().next() else {
            return Err(SessionError::ProfileCount {
                base: self.profile_base.clone(),
                count: 0,
            });
        };
        let prefs = format!("{}/prefs.js", profile);

        let now = self.device_time()?;
        self.set_mtime(&prefs, now - PREFS_BACKDATE_SECONDS)?;
        let initial = self.listing_mtime(&prefs)?;
        debug!(prefs = %prefs, mtime = %initial, "Back-dated prefs");

        let fired = Cell::new(false);
        let mut fire = || -> Result<(), SessionError> {
            fired.set(true);
            match after_first.as_mut() {
                Some(action) => action(),
                None => Ok(()),
            }
        };

        poll_wait(
            || {
                self.check_interrupt("device ready")?;
                match self.listing_mtime(&prefs) {
                    Ok(mtime) => Ok((mtime != initial).then_some(())),
                    Err(e) if fired.get() => {
                        debug!(error = %e, "Device not responding yet");
                        Ok(None)
                    }
                    Err(e) => Err(e),
                }
            },
            self.timeouts.device_ready(),
            Some(&mut fire),
        )
        .map_err(|e| SessionError::from_poll("device ready", e))
    }

    /// Whether a process with this executable basename is running
    pub fn is_process_running(&self, name: &str) -> Result<bool, SessionError> {
        Ok(self.device.process_list()?.iter().any(|p| p.basename() == name))
    }

    /// Wait until no process named `name` is running
    pub fn wait_for_process_stopped(&self, name: &str, after_first: AfterFirst<'_>) -> Result<(), SessionError> {
        poll_wait(
            || {
                self.check_interrupt("process exit")?;
                Ok((!self.is_process_running(name)?).then_some(()))
            },
            self.timeouts.device_ready(),
            after_first,
        )
        .map_err(|e| SessionError::from_poll("process exit", e))
    }

    /// Stop b2g and wait for it to exit
    pub fn stop(&self) -> Result<(), SessionError> {
        info!("Stopping b2g");
        let mut stop = || self.shell("stop b2g").map(drop);
        self.wait_for_process_stopped(B2G_PROCESS, Some(&mut stop))
    }

    /// Start b2g and wait for it to settle
    pub fn start(&self) -> Result<(), SessionError> {
        info!("Starting b2g");
        let mut start = || self.shell("start b2g").map(drop);
        self.wait_for_device_ready(Some(&mut start))
    }

    pub fn restart(&self) -> Result<(), SessionError> {
        self.stop()?;
        self.start()
    }

    /// Reboot and wait for b2g to settle
    pub fn reboot(&self) -> Result<(), SessionError> {
        info!("Rebooting device");
        let mut reboot = || self.device.reboot().map_err(SessionError::from);
        self.wait_for_device_ready(Some(&mut reboot))
    }

    /// Issue a reboot without waiting for the device to come back
    pub fn request_reboot(&self) -> Result<(), SessionError> {
        warn!("Rebooting device");
        Ok(self.device.reboot()?)
    }

    /// Push a file that is removed again when the guard drops.
    /// Paths under `/system/` remount the system partition first.
    pub fn push_file(&self, local: &Path, remote: &str) -> Result<PushFile<'_>, SessionError> {
        if remote.starts_with("/system/") {
            self.device.remount()?;
        }
        self.device.push(local, remote)?;
        Ok(PushFile {
            session: self,
            remote: remote.to_string(),
            removed: false,
        })
    }
}

/// A file pushed for the duration of a scope
pub struct PushFile<'a> {
    session: &'a DeviceSession,
    remote: String,
    removed: bool,
}

impl PushFile<'_> {
    pub fn remote(&self) -> &str {
        &self.remote
    }

    /// Remove the file now, surfacing errors
    pub fn remove(mut self) -> Result<(), SessionError> {
        self.removed = true;
        Ok(self.session.device.remove(&self.remote, false)?)
    }
}

impl Drop for PushFile<'_> {
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        if let Err(e) = self.session.device.remove(&self.remote, false) {
            warn!(remote = %self.remote, error = %e, "Failed to remove pushed file");
        }
    }
}

fn up_address_pattern() -> Option<Regex> {
    Regex::new(r"UP\s+([1-9]\d{0,2}\.\d{1,3}\.\d{1,3}\.\d{1,3})").ok()
}

/// First non-loopback address of an interface that is UP
pub fn parse_netcfg(output: &str) -> Option<String> {
    let pattern = up_address_pattern()?;
    output
        .lines()
        .filter(|line| line.split_whitespace().next() != Some("lo"))
        .filter_map(|line| pattern.captures(line))
        .filter_map(|caps| caps.get(1).map(|m| m.as_str().to_string()))
        .find(|ip| !ip.starts_with("127."))
}

/// Address from `ifconfig <iface>` (`wlan0: ip 10.0.0.5 mask ...` or
/// `inet addr:10.0.0.5 ...`)
pub fn parse_ifconfig(output: &str) -> Option<String> {
    let pattern = Regex::new(r"(?:\bip\s+|inet addr:|inet\s+)([1-9]\d{0,2}\.\d{1,3}\.\d{1,3}\.\d{1,3})").ok()?;
    let found = pattern
        .captures_iter(output)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str().to_string()))
        .find(|ip| !ip.starts_with("127."));
    found
}

/// Parse `profiles.ini` into profile name to absolute path
pub fn parse_profiles_ini(content: &str, base: &str) -> BTreeMap<String, String> {
    #[derive(Default)]
    struct Section {
        name: Option<String>,
        path: Option<String>,
        relative: bool,
    }

    let mut sections: Vec<Section> = Vec::new();
    let mut in_profile = false;

    for line in content.lines().map(str::trim) {
        if line.starts_with('[') && line.ends_with(']') {
            in_profile = line[1..line.len() - 1].starts_with("Profile");
            if in_profile {
                sections.push(Section {
                    relative: true,
                    ..Section::default()
                });
            }
            continue;
        }
        if !in_profile {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        if let Some(section) = sections.last_mut() {
            match key.trim() {
                "Name" => section.name = Some(value.trim().to_string()),
                "Path" => section.path = Some(value.trim().to_string()),
                "IsRelative" => section.relative = value.trim() != "0",
                _ => {}
            }
        }
    }

    sections
        .into_iter()
        .filter_map(|s| {
            let path = s.path?;
            let name = s.name.unwrap_or_else(|| path.clone());
            let full = if s.relative {
                format!("{}/{}", base.trim_end_matches('/'), path)
            } else {
                path
            };
            Some((name, full))
        })
        .collect()
}

/// Extract the date and time columns of an `ls -l` line.
///
/// Handles toolbox (`... 1234 2014-05-01 10:20 prefs.js`) and busybox
/// (`... 1234 May  1 10:20 prefs.js`) layouts; anything else is compared
/// as a whole line.
pub fn parse_listing_mtime(line: &str) -> String {
    let fields: Vec<&str> = line.split_whitespace().collect();
    let n = fields.len();
    if n >= 5 {
        let month = fields[n - 4];
        if month.len() == 3 && month.chars().all(|c| c.is_ascii_alphabetic()) {
            return fields[n - 4..n - 1].join(" ");
        }
    }
    if n >= 3 {
        return fields[n - 3..n - 1].join(" ");
    }
    line.trim().to_string()
}
