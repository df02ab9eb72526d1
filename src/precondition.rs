//! Precondition pipeline
//!
//! Checks run in a fixed order and stop at the first failure:
//! 1. `root`: adbd runs as root
//! 2. `agent_install`: the automation agent is installed (restarting b2g
//!    after a fresh install)
//! 3. `settings`: test-friendly device settings applied through the agent
//! 4. `network`: the device has an IP address
//! 5. `host_reachable`: the device can fetch a page served from this host
//!
//! An error inside a check is logged with its cause chain and counted as a
//! failure of that check. On the first failure the device is rebooted once
//! and the pipeline stops; re-running is left to the caller. Only an
//! interrupt escapes as an error.

use std::net::{IpAddr, Ipv4Addr, UdpSocket};

use certsuite_device::DeviceError;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::agent::{AgentError, AgentSession, AutomationAgent, InstallOutcome};
use crate::config::{HarnessConfig, MissingClientPolicy};
use crate::failure::FailureKind;
use crate::logging::error_chain;
use crate::probe_server::{ProbeServer, ProbeServerError, PROBE_BODY};
use crate::session::{DeviceSession, SessionError};
use crate::signal::SignalState;

/// Device-side HTTP client used for the reachability probe
const HTTP_CLIENT: &str = "curl";

/// Precondition errors
#[derive(Debug, thiserror::Error)]
pub enum PreconditionError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error(transparent)]
    ProbeServer(#[from] ProbeServerError),

    #[error("could not determine host address: {0}")]
    HostAddress(#[source] std::io::Error),

    #[error("interrupted before check '{0}'")]
    Interrupted(&'static str),
}

impl From<DeviceError> for PreconditionError {
    fn from(e: DeviceError) -> Self {
        PreconditionError::Session(SessionError::Device(e))
    }
}

impl PreconditionError {
    pub fn kind(&self) -> FailureKind {
        match self {
            PreconditionError::Session(e) => e.kind(),
            PreconditionError::Agent(e) => e.kind(),
            PreconditionError::ProbeServer(_) | PreconditionError::HostAddress(_) => FailureKind::Other,
            PreconditionError::Interrupted(_) => FailureKind::Interrupted,
        }
    }
}

/// Named checks, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckName {
    Root,
    AgentInstall,
    Settings,
    Network,
    HostReachable,
}

impl CheckName {
    pub const ALL: [CheckName; 5] = [
        CheckName::Root,
        CheckName::AgentInstall,
        CheckName::Settings,
        CheckName::Network,
        CheckName::HostReachable,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CheckName::Root => "root",
            CheckName::AgentInstall => "agent_install",
            CheckName::Settings => "settings",
            CheckName::Network => "network",
            CheckName::HostReachable => "host_reachable",
        }
    }
}

/// Result of one check
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum CheckOutcome {
    Passed,
    /// Could not be checked; does not stop the run
    Skipped(String),
    Failed(String),
}

impl CheckOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, CheckOutcome::Failed(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckResult {
    pub name: CheckName,
    pub outcome: CheckOutcome,
}

/// Outcome of the whole pipeline
#[derive(Debug, Clone, Default, Serialize)]
pub struct PreconditionReport {
    /// Checks that ran, in order; stops at the first failure
    pub checks: Vec<CheckResult>,
    /// Whether a reboot was issued after a failure
    pub rebooted: bool,
}

impl PreconditionReport {
    pub fn passed(&self) -> bool {
        !self.checks.iter().any(|c| c.outcome.is_failure())
    }

    pub fn failed_check(&self) -> Option<&CheckResult> {
        self.checks.iter().find(|c| c.outcome.is_failure())
    }

    pub fn outcome(&self, name: CheckName) -> Option<&CheckOutcome> {
        self.checks.iter().find(|c| c.name == name).map(|c| &c.outcome)
    }
}

/// Ordered readiness checks against one device
pub struct PreconditionPipeline<'a> {
    session: &'a DeviceSession,
    agent: &'a mut dyn AutomationAgent,
    config: &'a HarnessConfig,
    signals: Option<&'a SignalState>,
    device_ip: Option<String>,
}

impl<'a> PreconditionPipeline<'a> {
    pub fn new(session: &'a DeviceSession, agent: &'a mut dyn AutomationAgent, config: &'a HarnessConfig) -> Self {
        Self {
            session,
            agent,
            config,
            signals: None,
            device_ip: None,
        }
    }

    /// Stop between checks once an interrupt arrives
    pub fn with_signals(mut self, signals: &'a SignalState) -> Self {
        self.signals = Some(signals);
        self
    }

    /// Run every check in order
    pub fn run(&mut self) -> Result<PreconditionReport, PreconditionError> {
        let mut report = PreconditionReport::default();

        for name in CheckName::ALL {
            if self.signals.map(SignalState::is_cancel_requested).unwrap_or(false) {
                return Err(PreconditionError::Interrupted(name.as_str()));
            }

            info!(check = name.as_str(), "Checking precondition");
            let outcome = match self.run_check(name) {
                Ok(outcome) => outcome,
                Err(e) if e.kind().propagates() => return Err(e),
                Err(e) => {
                    error!(
                        critical = true,
                        check = name.as_str(),
                        kind = %e.kind(),
                        "Precondition check raised: {}",
                        error_chain(&e)
                    );
                    CheckOutcome::Failed(e.to_string())
                }
            };

            match outcome {
                CheckOutcome::Failed(ref reason) => {
                    error!(critical = true, check = name.as_str(), "Precondition failed: {}", reason);
                    report.checks.push(CheckResult { name, outcome });
                    if matches!(name, CheckName::Settings | CheckName::HostReachable) {
                        self.dump_logcat();
                    }
                    self.reboot_after_failure(&mut report);
                    return Ok(report);
                }
                CheckOutcome::Skipped(ref reason) => {
                    warn!(check = name.as_str(), "Precondition skipped: {}", reason);
                }
                CheckOutcome::Passed => {}
            }
            report.checks.push(CheckResult { name, outcome });
        }

        info!("All preconditions met");
        Ok(report)
    }

    fn dump_logcat(&self) {
        match self.session.device().logcat() {
            Ok(lines) => {
                debug!(lines = lines.len(), "Device logcat follows");
                for line in lines {
                    debug!(target: "logcat", "{}", line);
                }
            }
            Err(e) => error!("Failed to get logcat: {}", e),
        }
    }

    fn reboot_after_failure(&self, report: &mut PreconditionReport) {
        match self.session.request_reboot() {
            Ok(()) => report.rebooted = true,
            Err(e) => error!(critical = true, "Reboot after failed precondition failed: {}", error_chain(&e)),
        }
    }

    fn run_check(&mut self, name: CheckName) -> Result<CheckOutcome, PreconditionError> {
        match name {
            CheckName::Root => self.check_root(),
            CheckName::AgentInstall => self.check_agent_install(),
            CheckName::Settings => self.check_settings(),
            CheckName::Network => self.check_network(),
            CheckName::HostReachable => self.check_host_reachable(),
        }
    }

    fn check_root(&mut self) -> Result<CheckOutcome, PreconditionError> {
        let processes = self.session.device().process_list()?;
        let Some(adbd) = processes.iter().find(|p| p.basename() == "adbd") else {
            return Ok(CheckOutcome::Failed("adbd is not running".to_string()));
        };
        if adbd.user != "root" {
            return Ok(CheckOutcome::Failed(format!(
                "adbd is running as '{}', not root; a rooted build is required",
                adbd.user
            )));
        }
        Ok(CheckOutcome::Passed)
    }

    fn check_agent_install(&mut self) -> Result<CheckOutcome, PreconditionError> {
        match self.agent.install(&self.config.version)? {
            InstallOutcome::AlreadyInstalled => {
                info!(version = %self.config.version, "Automation agent already installed");
            }
            InstallOutcome::Installed => {
                info!(version = %self.config.version, "Automation agent installed, restarting b2g");
                self.session.restart()?;
            }
        }
        Ok(CheckOutcome::Passed)
    }

    fn check_settings(&mut self) -> Result<CheckOutcome, PreconditionError> {
        let mut agent_session = AgentSession::open(self.session.device().as_ref(), &mut *self.agent, self.config.agent.port)?;
        for (name, value) in &self.config.agent.settings {
            info!(setting = %name, value = %value, "Applying device setting");
            agent_session.set_setting(name, value)?;
        }
        agent_session.close()?;
        Ok(CheckOutcome::Passed)
    }

    fn check_network(&mut self) -> Result<CheckOutcome, PreconditionError> {
        self.device_ip = Some(self.session.wait_for_net()?);
        Ok(CheckOutcome::Passed)
    }

    fn host_ip(&self) -> Result<String, PreconditionError> {
        if let Some(ref ip) = self.config.host_check.host_ip {
            return Ok(ip.clone());
        }
        let target = match self.device_ip {
            Some(ref ip) => ip.clone(),
            None => self.session.wait_for_net()?,
        };
        detect_host_ip(&target).map_err(PreconditionError::HostAddress)
    }

    fn check_host_reachable(&mut self) -> Result<CheckOutcome, PreconditionError> {
        let host_ip = self.host_ip()?;
        info!(host_ip = %host_ip, "Checking access to host machine");
        let policy = self.config.host_check.missing_client;
        let mut probed = 0;

        for &port in &self.config.host_check.ports {
            let server = match ProbeServer::start(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port) {
                Ok(server) => server,
                Err(ProbeServerError::AddrInUse(addr)) => {
                    warn!(%addr, "Port in use, trying next port");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let url = format!("http://{}:{}/", host_ip, server.local_addr().port());
            let response = self.session.shell(&format!("{} {}", HTTP_CLIENT, url));
            server.stop()?;

            match response {
                Ok(body) if body.contains(PROBE_BODY) => probed += 1,
                Ok(body) => {
                    return Ok(CheckOutcome::Failed(format!(
                        "unexpected response from {}: {:?}",
                        url,
                        body.trim()
                    )))
                }
                Err(e) if e.is_command_not_found(HTTP_CLIENT) => {
                    return Ok(missing_client_outcome(policy));
                }
                Err(e) => return Err(e.into()),
            }
        }

        if probed == 0 {
            return Ok(CheckOutcome::Failed(format!(
                "no free port among {:?} for the probe server",
                self.config.host_check.ports
            )));
        }
        Ok(CheckOutcome::Passed)
    }
}

fn missing_client_outcome(policy: MissingClientPolicy) -> CheckOutcome {
    let reason = format!("{} not present on device; host access not verified", HTTP_CLIENT);
    match policy {
        MissingClientPolicy::Pass => {
            warn!("{}; counting as passed. If timeouts occur, check your network configuration.", reason);
            CheckOutcome::Passed
        }
        MissingClientPolicy::Skip => CheckOutcome::Skipped(reason),
        MissingClientPolicy::Fail => CheckOutcome::Failed(reason),
    }
}

/// Local address of the interface that routes to `device_ip`. No packets
/// are sent.
pub fn detect_host_ip(device_ip: &str) -> std::io::Result<String> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    socket.connect((device_ip, 9))?;
    Ok(socket.local_addr()?.ip().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentCall, MockAgent};
    use certsuite_device::{FailureConfig, MockCall, MockDevice, MockOp, ProcessInfo};
    use std::sync::Arc;

    fn config(policy: &str) -> HarnessConfig {
        HarnessConfig::parse_toml(&format!(
            "version = \"2.0\"\n[timeouts]\npoll_interval_ms = 10\nnetwork_seconds = 1\ndevice_ready_seconds = 1\n\
             [host_check]\nports = [0]\nhost_ip = \"127.0.0.1\"\nmissing_client = \"{}\"\n",
            policy
        ))
        .unwrap()
    }

    fn run(device: &Arc<MockDevice>, agent: &mut MockAgent, config: &HarnessConfig) -> PreconditionReport {
        let session = DeviceSession::from_config(device.clone(), config);
        PreconditionPipeline::new(&session, agent, config).run().unwrap()
    }

    #[test]
    fn test_healthy_device_passes_with_skipped_host_check() {
        let device = Arc::new(MockDevice::healthy());
        let config = config("skip");
        let mut agent = MockAgent::installed();
        let report = run(&device, &mut agent, &config);

        assert!(report.passed());
        assert_eq!(report.checks.len(), 5);
        assert!(matches!(
            report.outcome(CheckName::HostReachable),
            Some(CheckOutcome::Skipped(_))
        ));
        assert!(!report.rebooted);
        assert_eq!(device.reboot_count(), 0);

        let settings = agent
            .calls()
            .into_iter()
            .filter(|c| matches!(c, AgentCall::SetSetting(..)))
            .count();
        assert_eq!(settings, 3);
    }

    #[test]
    fn test_missing_root_stops_and_reboots_once() {
        let device = Arc::new(MockDevice::healthy());
        device.set_processes(vec![ProcessInfo::new(112, "/sbin/adbd", "shell")]);
        let config = config("skip");
        let mut agent = MockAgent::installed();
        let report = run(&device, &mut agent, &config);

        assert!(!report.passed());
        assert_eq!(report.checks.len(), 1);
        assert_eq!(report.failed_check().map(|c| c.name), Some(CheckName::Root));
        assert!(report.rebooted);
        assert_eq!(device.reboot_count(), 1);
        assert!(agent.calls().is_empty(), "later checks must not run");
        assert!(device.shell_commands().is_empty());
    }

    #[test]
    fn test_agent_session_failure_dumps_logcat_before_reboot() {
        let device = Arc::new(MockDevice::healthy());
        device.push_log("E/GeckoConsole: marionette failed to start");
        device.fail(MockOp::Forward, FailureConfig::error("cannot bind tcp:2828"));
        let config = config("skip");
        let mut agent = MockAgent::installed();
        let report = run(&device, &mut agent, &config);

        assert_eq!(report.failed_check().map(|c| c.name), Some(CheckName::Settings));
        assert!(!agent.calls().iter().any(|c| matches!(c, AgentCall::StartSession(_))));
        let calls = device.calls();
        let logcat = calls.iter().position(|c| *c == MockCall::Logcat).unwrap();
        let reboot = calls.iter().position(|c| *c == MockCall::Reboot).unwrap();
        assert!(logcat < reboot);
        assert_eq!(device.reboot_count(), 1);
    }

    #[test]
    fn test_logcat_failure_still_reboots() {
        let device = Arc::new(MockDevice::healthy());
        device.fail(MockOp::Forward, FailureConfig::error("cannot bind tcp:2828"));
        device.fail(MockOp::Logcat, FailureConfig::error("device offline"));
        let config = config("skip");
        let report = run(&device, &mut MockAgent::installed(), &config);

        assert!(report.rebooted);
        assert_eq!(device.count_calls(|c| *c == MockCall::Logcat), 1);
    }

    #[test]
    fn test_early_failures_skip_logcat() {
        let device = Arc::new(MockDevice::healthy());
        device.set_processes(vec![ProcessInfo::new(112, "/sbin/adbd", "shell")]);
        let config = config("skip");
        let report = run(&device, &mut MockAgent::installed(), &config);

        assert!(report.rebooted);
        assert_eq!(device.count_calls(|c| *c == MockCall::Logcat), 0);
    }

    #[test]
    fn test_check_error_becomes_failure() {
        let device = Arc::new(MockDevice::healthy());
        let config = config("skip");
        let mut agent = MockAgent::default();
        agent.fail_install = true;
        let report = run(&device, &mut agent, &config);

        assert_eq!(report.failed_check().map(|c| c.name), Some(CheckName::AgentInstall));
        assert_eq!(report.checks.len(), 2);
        assert_eq!(device.reboot_count(), 1);
    }

    #[test]
    fn test_missing_client_policy_fail() {
        let device = Arc::new(MockDevice::healthy());
        let config = config("fail");
        let report = run(&device, &mut MockAgent::installed(), &config);
        assert_eq!(report.failed_check().map(|c| c.name), Some(CheckName::HostReachable));
        assert_eq!(device.reboot_count(), 1);
    }

    #[test]
    fn test_missing_client_policy_pass() {
        let device = Arc::new(MockDevice::healthy());
        let config = config("pass");
        let report = run(&device, &mut MockAgent::installed(), &config);
        assert_eq!(report.outcome(CheckName::HostReachable), Some(&CheckOutcome::Passed));
    }

    #[test]
    fn test_host_reachable_fetches_probe_page() {
        let device = Arc::new(MockDevice::healthy());
        device.respond("curl ", |cmd| {
            let url = cmd.trim_start_matches("curl ").to_string();
            let addr = url.trim_start_matches("http://").trim_end_matches('/').to_string();
            let mut stream = std::net::TcpStream::connect(addr.as_str())
                .map_err(|e| DeviceError::Unreachable(e.to_string()))?;
            use std::io::{Read, Write};
            stream.write_all(b"GET / HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")?;
            let mut response = String::new();
            stream.read_to_string(&mut response)?;
            Ok(response)
        });
        let config = config("fail");
        let report = run(&device, &mut MockAgent::installed(), &config);
        assert_eq!(report.outcome(CheckName::HostReachable), Some(&CheckOutcome::Passed));
    }

    #[test]
    fn test_curl_error_fails_check() {
        let device = Arc::new(MockDevice::healthy());
        device.respond("curl ", |cmd| {
            Err(DeviceError::CommandFailed {
                command: cmd.to_string(),
                status: Some(7),
                output: "curl: (7) couldn't connect to host".to_string(),
            })
        });
        let config = config("skip");
        let report = run(&device, &mut MockAgent::installed(), &config);
        assert_eq!(report.failed_check().map(|c| c.name), Some(CheckName::HostReachable));
    }

    #[test]
    fn test_interrupt_propagates() {
        let device = Arc::new(MockDevice::healthy());
        let config = config("skip");
        let session = DeviceSession::from_config(device.clone(), &config);
        let signals = SignalState::new();
        signals.handle_signal();
        let mut agent = MockAgent::installed();

        let result = PreconditionPipeline::new(&session, &mut agent, &config)
            .with_signals(&signals)
            .run();
        assert!(matches!(result, Err(PreconditionError::Interrupted("root"))));
        assert_eq!(device.reboot_count(), 0);
    }

    #[test]
    fn test_no_network_fails() {
        let device = Arc::new(MockDevice::healthy());
        device.respond("netcfg", |_| Ok("wlan0 DOWN 0.0.0.0/0 0x0\n".to_string()));
        let config = config("skip");
        let report = run(&device, &mut MockAgent::installed(), &config);
        assert_eq!(report.failed_check().map(|c| c.name), Some(CheckName::Network));
    }
}
