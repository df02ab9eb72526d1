//! Run artifact aggregation
//!
//! A [`LogManager`] owns one gzip-compressed tar archive for the whole run.
//! Entries are appended as the run progresses:
//! - each suite's raw log and extra files under `<suite>/`
//! - `<suite>/report.html` for every suite that did not pass
//!
//! `finalize` appends the orchestrator's own `run.log` and the summary
//! `report.html`, then closes the archive. Finalization happens exactly
//! once: explicitly, or on drop if the run unwound before reaching it.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use certsuite_report::{parse_harness_log, parse_suite_log, render_subsuite, render_summary, HarnessLog, SuiteResults};
use chrono::{DateTime, Local};
use flate2::write::GzEncoder;
use flate2::Compression;
use tar::{Builder, Header};
use tracing::{debug, info, warn};

use crate::failure::FailureKind;
use crate::logging::RUN_LOG_NAME;

/// Archive file name prefix
pub const ARCHIVE_PREFIX: &str = "firefox-os-certification";

/// Summary report name, and per-suite report name under `<suite>/`
pub const REPORT_NAME: &str = "report.html";

/// Aggregation errors
#[derive(Debug, thiserror::Error)]
pub enum AggregateError {
    #[error("failed to create archive {path}: {source}")]
    Create {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to add {name} to the archive: {source}")]
    Append {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to read harness log {path}: {source}")]
    HarnessLog {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to close archive: {0}")]
    Close(#[source] io::Error),

    #[error("archive already finalized")]
    Finalized,
}

impl AggregateError {
    pub fn kind(&self) -> FailureKind {
        FailureKind::Other
    }
}

/// What the sealed archive says about the run
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub archive_path: PathBuf,
    pub suites: Vec<SuiteResults>,
    pub harness: HarnessLog,
}

impl RunSummary {
    /// Every suite passed and the harness logged no errors
    pub fn passed(&self) -> bool {
        self.harness.is_clean() && self.suites.iter().all(SuiteResults::is_pass)
    }
}

/// Archive name for a run started at `started`
pub fn archive_name(started: DateTime<Local>) -> String {
    format!("{}_{}.tar.gz", ARCHIVE_PREFIX, started.format("%Y%m%d%H%M%S"))
}

/// Accumulates run output into one archive
pub struct LogManager {
    archive_path: PathBuf,
    harness_log: PathBuf,
    started: DateTime<Local>,
    builder: Option<Builder<GzEncoder<File>>>,
    suites: Vec<SuiteResults>,
}

impl LogManager {
    /// Create the archive in `output_dir`. `harness_log` is the JSON log the
    /// logging context writes; it is read back at finalization.
    pub fn new(output_dir: &Path, harness_log: &Path) -> Result<Self, AggregateError> {
        let started = Local::now();
        let archive_path = output_dir.join(archive_name(started));
        let file = File::create(&archive_path).map_err(|source| AggregateError::Create {
            path: archive_path.clone(),
            source,
        })?;
        debug!(archive = %archive_path.display(), "Created run archive");

        Ok(Self {
            archive_path,
            harness_log: harness_log.to_path_buf(),
            started,
            builder: Some(Builder::new(GzEncoder::new(file, Compression::default()))),
            suites: Vec::new(),
        })
    }

    pub fn archive_path(&self) -> &Path {
        &self.archive_path
    }

    /// Results recorded so far, in order
    pub fn suite_results(&self) -> &[SuiteResults] {
        &self.suites
    }

    fn builder(&mut self) -> Result<&mut Builder<GzEncoder<File>>, AggregateError> {
        self.builder.as_mut().ok_or(AggregateError::Finalized)
    }

    /// Copy a local file into the archive as `name`
    pub fn add_file(&mut self, path: &Path, name: &str) -> Result<(), AggregateError> {
        debug!(path = %path.display(), name, "Adding file to archive");
        let append = |source| AggregateError::Append {
            name: name.to_string(),
            source,
        };
        let mut file = File::open(path).map_err(append)?;
        self.builder()?.append_file(name, &mut file).map_err(append)
    }

    /// Write in-memory content into the archive as `name`
    pub fn add_bytes(&mut self, name: &str, contents: &[u8]) -> Result<(), AggregateError> {
        let append = |source| AggregateError::Append {
            name: name.to_string(),
            source,
        };
        let mut header = Header::new_gnu();
        header.set_path(name).map_err(append)?;
        header.set_size(contents.len() as u64);
        header.set_mtime(Local::now().timestamp().max(0) as u64);
        header.set_mode(0o644);
        header.set_cksum();
        self.builder()?.append(&header, contents).map_err(append)
    }

    /// Fold a suite's raw log into the run results. A missing or unreadable
    /// log counts as a suite that never started. Suites that did not pass
    /// get a detail report at `<suite>/report.html`.
    pub fn add_suite_report(&mut self, suite_id: &str, raw_log: &Path) -> Result<&SuiteResults, AggregateError> {
        let results = match parse_suite_log(suite_id, raw_log) {
            Ok(results) => results,
            Err(e) => {
                warn!(suite = suite_id, "No usable structured log: {}", e);
                SuiteResults::new(suite_id)
            }
        };

        if results.is_pass() {
            info!(suite = suite_id, results = results.result_count(), "Suite passed");
        } else {
            warn!(
                suite = suite_id,
                unexpected = results.unexpected_count(),
                started = results.started,
                "Suite did not pass"
            );
            let report = render_subsuite(&results);
            self.add_bytes(&format!("{}/{}", suite_id, REPORT_NAME), report.as_bytes())?;
        }

        self.suites.push(results);
        Ok(&self.suites[self.suites.len() - 1])
    }

    /// Whether the run passes so far: every recorded suite passed and the
    /// harness log holds no errors. An unreadable log counts as a failure.
    pub fn run_passed(&self) -> bool {
        if !self.suites.iter().all(SuiteResults::is_pass) {
            return false;
        }
        match std::fs::read_to_string(&self.harness_log) {
            Ok(content) => parse_harness_log(&content).is_clean(),
            Err(e) => {
                warn!(path = %self.harness_log.display(), "Cannot read harness log: {}", e);
                false
            }
        }
    }

    /// Append the harness log and summary report, then close the archive.
    /// Events logged after this call are not archived.
    pub fn finalize(mut self) -> Result<RunSummary, AggregateError> {
        self.seal()
    }

    fn seal(&mut self) -> Result<RunSummary, AggregateError> {
        let Some(mut builder) = self.builder.take() else {
            return Err(AggregateError::Finalized);
        };
        info!(archive = %self.archive_path.display(), "Finalizing run archive");

        let harness_bytes = std::fs::read(&self.harness_log).map_err(|source| AggregateError::HarnessLog {
            path: self.harness_log.clone(),
            source,
        })?;
        let harness = parse_harness_log(&String::from_utf8_lossy(&harness_bytes));
        let summary = render_summary(self.started, &harness, &self.suites);

        for (name, contents) in [(RUN_LOG_NAME, harness_bytes.as_slice()), (REPORT_NAME, summary.as_bytes())] {
            let mut header = Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mtime(Local::now().timestamp().max(0) as u64);
            header.set_mode(0o644);
            builder
                .append_data(&mut header, name, contents)
                .map_err(|source| AggregateError::Append {
                    name: name.to_string(),
                    source,
                })?;
        }

        builder
            .into_inner()
            .and_then(GzEncoder::finish)
            .map_err(AggregateError::Close)?;

        Ok(RunSummary {
            archive_path: self.archive_path.clone(),
            suites: std::mem::take(&mut self.suites),
            harness,
        })
    }
}

impl Drop for LogManager {
    fn drop(&mut self) {
        if self.builder.is_some() {
            if let Err(e) = self.seal() {
                warn!("Failed to finalize run archive: {}", e);
            }
        }
    }
}
