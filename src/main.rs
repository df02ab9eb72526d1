//! certsuite CLI
//!
//! Entry point for the `certsuite` command-line tool.

use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use certsuite::agent::{AutomationAgent, CommandAgent, MockAgent};
use certsuite::logging::{error_chain, log_run_metadata, RUN_LOG_NAME};
use certsuite::run::{default_output_dir, dry_device};
use certsuite::suite::list_test_groups;
use certsuite::{
    ExitCode, HarnessConfig, LoadedConfig, LogContext, LogManager, RunManager, RunRequest, SessionDeviceHandler,
    SignalHandler, SignalState, SuiteRunner,
};
use certsuite_device::{AdbConfig, AdbDevice, DeviceControl};
use clap::Parser;
use tracing::{error, warn};

#[derive(Parser)]
#[command(name = "certsuite")]
#[command(about = "Run the device certification suites against an attached device", version)]
struct Cli {
    /// Path to config file (default: config.toml beside the executable)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// List every suite and test group available to run
    #[arg(long)]
    list_tests: bool,

    /// Directory to write the results archive to (default: current directory)
    #[arg(long, short = 'o')]
    output_dir: Option<PathBuf>,

    /// Run against a simulated device instead of one attached over adb
    #[arg(long)]
    dry_device: bool,

    /// Log debug output to the console
    #[arg(long, short = 'v')]
    verbose: bool,

    /// Tests to run as suite[:group] (default: everything)
    #[arg(value_name = "TEST")]
    tests: Vec<String>,
}

fn main() {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(HarnessConfig::default_path);
    let loaded = match HarnessConfig::load(&config_path) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("Error: {}", error_chain(&e));
            process::exit(ExitCode::Failed.code());
        }
    };

    if cli.list_tests {
        process::exit(list_tests(&loaded.config));
    }

    let output_dir = cli.output_dir.clone().unwrap_or_else(default_output_dir);
    let log_dir = match tempfile::Builder::new().prefix("certsuite-log-").tempdir() {
        Ok(dir) => dir,
        Err(e) => {
            eprintln!("Error: failed to create log directory: {}", e);
            process::exit(ExitCode::Failed.code());
        }
    };
    let log = match LogContext::new(&log_dir.path().join(RUN_LOG_NAME), cli.verbose) {
        Ok(log) => log,
        Err(e) => {
            eprintln!("Error: {}", error_chain(&e));
            process::exit(ExitCode::Failed.code());
        }
    };

    let signals = SignalHandler::new();
    if let Err(e) = signals.install() {
        eprintln!("Warning: failed to install signal handler: {}", e);
    }

    let code = log.in_scope(|| run_tests(&cli, &loaded, &output_dir, log.log_path(), signals.state()));
    drop(log_dir);
    process::exit(code.code());
}

fn list_tests(config: &HarnessConfig) -> i32 {
    let temp_dir = match tempfile::tempdir() {
        Ok(dir) => dir,
        Err(e) => {
            eprintln!("Error: failed to create temp directory: {}", e);
            return ExitCode::Failed.code();
        }
    };

    let mut code = ExitCode::Success;
    println!("Tests available:");
    for suite_id in config.suites.keys() {
        match list_test_groups(config, suite_id, temp_dir.path()) {
            Ok(groups) => {
                for group in groups {
                    println!("{}:{}", suite_id, group);
                }
            }
            Err(e) => {
                eprintln!("Error: {}", error_chain(&e));
                code = ExitCode::Failed;
            }
        }
    }
    println!("To run a set of tests, pass those test names on the command line, like:");
    println!("certsuite suite1:group1 suite1:group2 suite2:group1 [...]");
    code.code()
}

fn run_tests(cli: &Cli, loaded: &LoadedConfig, output_dir: &Path, log_path: &Path, signals: Arc<SignalState>) -> ExitCode {
    let config = &loaded.config;
    log_run_metadata(loaded);

    let request = match RunRequest::from_tokens(&cli.tests, config) {
        Ok(request) => request,
        Err(e) => {
            error!(critical = true, "Invalid test selection: {}", e);
            return ExitCode::Failed;
        }
    };
    for unknown in request.unknown_suites(config) {
        warn!(suite = unknown, "Requested suite is not in the configuration");
    }

    let aggregator = match LogManager::new(output_dir, log_path) {
        Ok(aggregator) => aggregator,
        Err(e) => {
            error!(critical = true, "{}", error_chain(&e));
            return ExitCode::Failed;
        }
    };
    let archive_path = aggregator.archive_path().to_path_buf();

    let (device, agent): (Arc<dyn DeviceControl>, Box<dyn AutomationAgent>) = if cli.dry_device {
        warn!("Running against a simulated device; results say nothing about real hardware");
        (Arc::new(dry_device(config)), Box::new(MockAgent::installed()))
    } else {
        let adb_config = AdbConfig {
            adb_path: config
                .device
                .adb_path
                .clone()
                .unwrap_or_else(certsuite_device::adb::default_adb_path),
            serial: config.device.serial.clone(),
            command_timeout: config.timeouts.command_timeout(),
        };
        let device = match AdbDevice::connect(adb_config) {
            Ok(device) => device,
            Err(e) => {
                error!(critical = true, "Could not connect to device: {}", error_chain(&e));
                drop(aggregator);
                report_archive(&archive_path);
                return ExitCode::Failed;
            }
        };
        let agent = CommandAgent::new(
            config.agent.command.clone(),
            config.device.serial.clone(),
            config.timeouts.agent_port(),
        );
        (Arc::new(device), Box::new(agent))
    };

    let mut handler = SessionDeviceHandler::new(device, agent, config, signals.clone());
    let mut runner = SuiteRunner::new(config, signals.clone());

    let code = match RunManager::new(signals).run(&mut handler, &mut runner, &request, aggregator) {
        Ok(outcome) => outcome.exit_code,
        Err(e) => {
            error!(critical = true, "Encountered error at top level: {}", error_chain(&e));
            ExitCode::Failed
        }
    };
    report_archive(&archive_path);
    code
}

fn report_archive(path: &Path) {
    eprintln!("Results saved in {}", path.display());
}
