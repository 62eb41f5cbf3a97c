use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use time::format_description::well_known::Rfc3339;
use time::{OffsetDateTime, UtcOffset};

use super::config::Config;
use super::constants::FIRST_RUN_NUMBER;
use super::error::ReportError;
use super::stop::StopReason;

/// Offset of the local time zone, UTC if it can not be determined
pub fn local_offset() -> UtcOffset {
    UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC)
}

/// Current wall clock time in the given offset
pub fn now_in(offset: UtcOffset) -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(offset)
}

fn format_timestamp(timestamp: &OffsetDateTime) -> String {
    timestamp
        .format(&Rfc3339)
        .unwrap_or_else(|_| timestamp.to_string())
}

/// Outcome of a run as it is written into the run report
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_number: u64,
    pub start_time: OffsetDateTime,
    pub end_time: OffsetDateTime,
    pub elapsed_seconds: f64,
    pub total_ions: u64,
    pub max_specimen_voltage: f64,
    pub max_pulse_voltage: f64,
    pub stop_reason: StopReason,
}

impl RunReport {
    /// Render the report as `key: value` lines
    pub fn render(&self, config: &Config) -> String {
        let mut text = String::new();
        let lines = [
            ("Username", config.user_name.clone()),
            ("Experiment Name", config.run_name.clone()),
            ("Run Number", self.run_number.to_string()),
            ("Acquisition Mode", config.acquisition_mode.to_string()),
            ("Detection Rate (%)", config.detection_rate.to_string()),
            ("Maximum Number of Ions", config.max_ions.to_string()),
            ("Control Refresh freq. (Hz)", config.ex_freq.to_string()),
            ("Time bins (Sec)", (1.0 / config.ex_freq as f64).to_string()),
            ("Cycle for Avg.", config.cycle_avg.to_string()),
            ("K_p Upwards", config.vdc_step_up.to_string()),
            ("K_p Downwards", config.vdc_step_down.to_string()),
            (
                "Experiment Elapsed Time (Sec)",
                format!("{:.3}", self.elapsed_seconds),
            ),
            ("Experiment Total Ions", self.total_ions.to_string()),
            ("Email", config.email.clone()),
            ("Specimen start Voltage (V)", config.vdc_min.to_string()),
            ("Specimen Stop Voltage (V)", config.vdc_max.to_string()),
            (
                "Specimen Max Achieved Voltage (V)",
                format!("{:.3}", self.max_specimen_voltage),
            ),
            ("Pulse start Voltage (V)", config.v_p_min.to_string()),
            ("Pulse Stop Voltage (V)", config.v_p_max.to_string()),
            ("Pulse Fraction", config.pulse_fraction.to_string()),
            (
                "Specimen Max Achieved Pulse Voltage (V)",
                format!("{:.3}", self.max_pulse_voltage),
            ),
            ("Start Time", format_timestamp(&self.start_time)),
            ("End Time", format_timestamp(&self.end_time)),
            ("Stop Reason", self.stop_reason.to_string()),
        ];
        for (key, value) in lines {
            // Writing into a String cannot fail
            let _ = writeln!(text, "{key}: {value}");
        }
        text
    }

    pub fn write(&self, config: &Config, path: &Path) -> Result<(), ReportError> {
        std::fs::write(path, self.render(config))?;
        log::info!("Run report written to {}", path.display());
        Ok(())
    }
}

/// Sends the end-of-run message to the operator
pub trait Notifier: Send {
    fn notify(&mut self, recipient: &str, subject: &str, body: &str);
}

/// Notifier that only writes the message to the log
#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&mut self, recipient: &str, subject: &str, body: &str) {
        log::info!("Notification for {recipient}: {subject}");
        for line in body.lines() {
            log::debug!("  {line}");
        }
    }
}

/// The run counter file: a single integer, the number of the next run
#[derive(Debug, Clone)]
pub struct RunCounter {
    path: PathBuf,
}

impl RunCounter {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    /// Number of the next run. A missing file means no run was recorded yet.
    pub fn read(&self) -> Result<u64, ReportError> {
        if !self.path.exists() {
            return Ok(FIRST_RUN_NUMBER);
        }
        let text = std::fs::read_to_string(&self.path)?;
        Ok(text.trim().parse::<u64>()?)
    }

    /// Record a completed run. Returns the number of the next run.
    pub fn increment(&self) -> Result<u64, ReportError> {
        let next = self.read()? + 1;
        std::fs::write(&self.path, next.to_string())?;
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_starts_at_one_and_increments() {
        let dir = tempfile::tempdir().unwrap();
        let counter = RunCounter::new(&dir.path().join("counter.txt"));
        assert_eq!(counter.read().unwrap(), 1);
        assert_eq!(counter.increment().unwrap(), 2);
        assert_eq!(counter.read().unwrap(), 2);
        assert_eq!(counter.increment().unwrap(), 3);
    }

    #[test]
    fn test_counter_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("counter.txt");
        std::fs::write(&path, "seven").unwrap();
        match RunCounter::new(&path).read() {
            Err(ReportError::BadCounter(_)) => (),
            other => panic!("expected BadCounter, got {other:?}"),
        }
    }

    #[test]
    fn test_report_contains_outcome() {
        let mut config = Config::default();
        config.user_name = String::from("operator");
        let report = RunReport {
            run_number: 12,
            start_time: OffsetDateTime::UNIX_EPOCH,
            end_time: OffsetDateTime::UNIX_EPOCH,
            elapsed_seconds: 12.3456,
            total_ions: 4321,
            max_specimen_voltage: 5123.4567,
            max_pulse_voltage: 1024.5,
            stop_reason: StopReason::IonCountReached,
        };
        let text = report.render(&config);
        assert!(text.contains("Username: operator\n"));
        assert!(text.contains("Run Number: 12\n"));
        assert!(text.contains("Experiment Elapsed Time (Sec): 12.346\n"));
        assert!(text.contains("Experiment Total Ions: 4321\n"));
        assert!(text.contains("Specimen Max Achieved Voltage (V): 5123.457\n"));
        assert!(text.contains("Start Time: 1970-01-01T00:00:00Z\n"));
        assert!(text.contains("Stop Reason: ion count reached\n"));
    }
}
