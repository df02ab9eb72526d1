//! Automation agent: installs the on-device automation server and applies
//! settings through it.
//!
//! `CommandAgent` drives an external helper executable:
//! - `<cmd> install --version V`: exit 0 installed, exit 3 already installed
//! - `<cmd> set --port P <name> <json-value>`: apply one setting
//! - `<cmd> end --port P`: close the session
//!
//! The helper talks to the agent over a forwarded TCP port; `AgentSession`
//! sets up the forward and ends the session when dropped.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::path::PathBuf;
use std::process::{Command, Output};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use certsuite_device::{DeviceControl, DeviceError};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::failure::FailureKind;
use crate::poll::{poll_wait, PollError, PollOptions};

/// Helper exit status meaning the agent was already installed
pub const EXIT_ALREADY_INSTALLED: i32 = 3;

/// Result of an install request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    /// Freshly installed; b2g must restart to load it
    Installed,
    AlreadyInstalled,
}

/// Automation agent errors
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("failed to run agent helper {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("agent {action} failed (status {status:?}): {output}")]
    Failed {
        action: &'static str,
        status: Option<i32>,
        output: String,
    },

    #[error("agent port {port} did not accept connections within {seconds}s")]
    PortTimeout { port: u16, seconds: u64 },

    #[error("no agent session is open")]
    NoSession,

    #[error("failed to forward agent port: {0}")]
    Forward(#[from] DeviceError),
}

impl AgentError {
    pub fn kind(&self) -> FailureKind {
        match self {
            AgentError::PortTimeout { .. } => FailureKind::Timeout,
            AgentError::Forward(e) if e.is_timeout() => FailureKind::Timeout,
            AgentError::Forward(_) => FailureKind::Transport,
            AgentError::Failed { .. } => FailureKind::Transport,
            AgentError::Spawn { .. } | AgentError::NoSession => FailureKind::Other,
        }
    }
}

/// On-device automation agent
pub trait AutomationAgent: Send {
    /// Install the agent for `version`. Installing over an existing install
    /// is not an error.
    fn install(&mut self, version: &str) -> Result<InstallOutcome, AgentError>;

    /// Open a session over a forwarded port, blocking until it accepts
    fn start_session(&mut self, port: u16) -> Result<(), AgentError>;

    /// Apply one device setting
    fn set_setting(&mut self, name: &str, value: &Value) -> Result<(), AgentError>;

    fn end_session(&mut self) -> Result<(), AgentError>;
}

/// Agent driven through an external helper executable
pub struct CommandAgent {
    command: PathBuf,
    serial: Option<String>,
    port_wait: PollOptions,
    session_port: Option<u16>,
}

impl CommandAgent {
    pub fn new(command: impl Into<PathBuf>, serial: Option<String>, port_wait: PollOptions) -> Self {
        Self {
            command: command.into(),
            serial,
            port_wait,
            session_port: None,
        }
    }

    fn run(&self, args: &[String]) -> Result<Output, AgentError> {
        let mut command = Command::new(&self.command);
        command.args(args);
        if let Some(ref serial) = self.serial {
            command.env("ANDROID_SERIAL", serial);
        }
        debug!(command = %self.command.display(), args = ?args, "Running agent helper");
        command.output().map_err(|source| AgentError::Spawn {
            command: self.command.display().to_string(),
            source,
        })
    }

    fn port(&self) -> Result<u16, AgentError> {
        self.session_port.ok_or(AgentError::NoSession)
    }
}

fn combined_output(output: &Output) -> String {
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    text.trim().to_string()
}

impl AutomationAgent for CommandAgent {
    fn install(&mut self, version: &str) -> Result<InstallOutcome, AgentError> {
        let output = self.run(&["install".to_string(), "--version".to_string(), version.to_string()])?;
        match output.status.code() {
            Some(0) => Ok(InstallOutcome::Installed),
            Some(EXIT_ALREADY_INSTALLED) => Ok(InstallOutcome::AlreadyInstalled),
            status => Err(AgentError::Failed {
                action: "install",
                status,
                output: combined_output(&output),
            }),
        }
    }

    fn start_session(&mut self, port: u16) -> Result<(), AgentError> {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        let connect_timeout = self.port_wait.interval.max(Duration::from_millis(100));
        poll_wait(
            || Ok::<_, AgentError>(TcpStream::connect_timeout(&addr, connect_timeout).ok().map(drop)),
            self.port_wait,
            None,
        )
        .map_err(|e| match e {
            PollError::Timeout { .. } => AgentError::PortTimeout {
                port,
                seconds: self.port_wait.timeout.as_secs(),
            },
            PollError::Predicate(e) => e,
        })?;
        self.session_port = Some(port);
        Ok(())
    }

    fn set_setting(&mut self, name: &str, value: &Value) -> Result<(), AgentError> {
        let port = self.port()?;
        let output = self.run(&[
            "set".to_string(),
            "--port".to_string(),
            port.to_string(),
            name.to_string(),
            value.to_string(),
        ])?;
        if output.status.success() {
            Ok(())
        } else {
            Err(AgentError::Failed {
                action: "set",
                status: output.status.code(),
                output: combined_output(&output),
            })
        }
    }

    fn end_session(&mut self) -> Result<(), AgentError> {
        let Some(port) = self.session_port.take() else {
            return Ok(());
        };
        let output = self.run(&["end".to_string(), "--port".to_string(), port.to_string()])?;
        if output.status.success() {
            Ok(())
        } else {
            Err(AgentError::Failed {
                action: "end",
                status: output.status.code(),
                output: combined_output(&output),
            })
        }
    }
}

/// An open agent session; ended on drop
pub struct AgentSession<'a> {
    agent: &'a mut dyn AutomationAgent,
    open: bool,
}

impl<'a> AgentSession<'a> {
    /// Forward `port` to the device and open a session on it
    pub fn open(device: &dyn DeviceControl, agent: &'a mut dyn AutomationAgent, port: u16) -> Result<Self, AgentError> {
        device.forward(port, port)?;
        agent.start_session(port)?;
        info!(port, "Automation agent session open");
        Ok(Self { agent, open: true })
    }

    pub fn set_setting(&mut self, name: &str, value: &Value) -> Result<(), AgentError> {
        self.agent.set_setting(name, value)
    }

    /// End the session, surfacing errors
    pub fn close(mut self) -> Result<(), AgentError> {
        self.open = false;
        self.agent.end_session()
    }
}

impl Drop for AgentSession<'_> {
    fn drop(&mut self) {
        if self.open {
            if let Err(e) = self.agent.end_session() {
                warn!(error = %e, "Failed to end agent session");
            }
        }
    }
}

/// A recorded call against the mock agent
#[derive(Debug, Clone, PartialEq)]
pub enum AgentCall {
    Install(String),
    StartSession(u16),
    SetSetting(String, Value),
    EndSession,
}

/// In-process agent for tests
#[derive(Debug, Clone, Default)]
pub struct MockAgent {
    /// Report `AlreadyInstalled` instead of `Installed`
    pub already_installed: bool,
    /// Fail the install step
    pub fail_install: bool,
    /// Fail setting this name
    pub fail_setting: Option<String>,
    calls: Arc<Mutex<Vec<AgentCall>>>,
}

impl MockAgent {
    /// An agent that is already installed and accepts every setting
    pub fn installed() -> Self {
        Self {
            already_installed: true,
            ..Self::default()
        }
    }

    /// Calls made so far; clones share the journal
    pub fn calls(&self) -> Vec<AgentCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn record(&self, call: AgentCall) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }
}

impl AutomationAgent for MockAgent {
    fn install(&mut self, version: &str) -> Result<InstallOutcome, AgentError> {
        self.record(AgentCall::Install(version.to_string()));
        if self.fail_install {
            return Err(AgentError::Failed {
                action: "install",
                status: Some(1),
                output: "install failed".to_string(),
            });
        }
        Ok(if self.already_installed {
            InstallOutcome::AlreadyInstalled
        } else {
            InstallOutcome::Installed
        })
    }

    fn start_session(&mut self, port: u16) -> Result<(), AgentError> {
        self.record(AgentCall::StartSession(port));
        Ok(())
    }

    fn set_setting(&mut self, name: &str, value: &Value) -> Result<(), AgentError> {
        self.record(AgentCall::SetSetting(name.to_string(), value.clone()));
        if self.fail_setting.as_deref() == Some(name) {
            return Err(AgentError::Failed {
                action: "set",
                status: Some(1),
                output: format!("cannot set {}", name),
            });
        }
        Ok(())
    }

    fn end_session(&mut self) -> Result<(), AgentError> {
        self.record(AgentCall::EndSession);
        Ok(())
    }
}
