use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::constants::{HV_DEFAULT_BAUD, MAX_EX_FREQ, PULSER_DEFAULT_BAUD, VDC_DEBOUNCE_SECONDS};
use super::error::ConfigError;

/// Where the controller gets its ion count from, and which event queues are drained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquisitionMode {
    /// TDC delivering paired delay-line detector hits (x, y, t, start counter)
    TdcPaired,
    /// TDC delivering raw per-channel timestamps (channel, time data, start counter)
    TdcRaw,
    /// Four channel waveform digitizer; no ion counting
    Waveform,
    /// Hardware edge counter on the detector MCP signal
    EdgeCounter,
}

impl Display for AcquisitionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TdcPaired => write!(f, "tdc_paired"),
            Self::TdcRaw => write!(f, "tdc_raw"),
            Self::Waveform => write!(f, "waveform"),
            Self::EdgeCounter => write!(f, "edge_counter"),
        }
    }
}

/// Fixed waits of the run lifecycle. Defaults match the instrument's settle times.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Timing {
    /// Settle time after switching the pulser output on
    pub pulser_settle_ms: u64,
    /// Settle time after switching the HV output on
    pub hv_settle_ms: u64,
    /// Wait for all devices to be ready before the first tick
    pub warmup_ms: u64,
    /// Grace period after asking the acquisition process to stop
    pub grace_ms: u64,
    /// Graceful join timeout of the acquisition process
    pub acquisition_join_ms: u64,
    /// Join timeout after the acquisition process was forcibly terminated
    pub terminate_join_ms: u64,
    /// Sleep of a queue drain when all of its queues are empty
    pub drain_idle_us: u64,
    /// Wait for the remaining columns of a batch once its first column arrived
    pub column_wait_ms: u64,
    /// Delay between writing a serial command and reading the reply
    pub serial_response_ms: u64,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            pulser_settle_ms: 500,
            hv_settle_ms: 500,
            warmup_ms: 4000,
            grace_ms: 1000,
            acquisition_join_ms: 3000,
            terminate_join_ms: 1000,
            drain_idle_us: 500,
            column_wait_ms: 10,
            serial_response_ms: 5,
        }
    }
}

impl Timing {
    /// All waits set to zero, except the short waits that keep the drains from spinning
    pub fn immediate() -> Self {
        Self {
            pulser_settle_ms: 0,
            hv_settle_ms: 0,
            warmup_ms: 0,
            grace_ms: 0,
            acquisition_join_ms: 100,
            terminate_join_ms: 100,
            drain_idle_us: 100,
            column_wait_ms: 10,
            serial_response_ms: 0,
        }
    }
}

/// Structure representing the experiment configuration. Contains the control parameters,
/// stop criteria, device ports and output paths of a single run.
/// Configs are seralizable and deserializable to YAML using serde and serde_yaml
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub user_name: String,
    pub run_name: String,
    pub email: String,
    pub data_path: PathBuf,
    pub counter_path: PathBuf,
    pub acquisition_mode: AcquisitionMode,
    /// Command line of the acquisition process (program followed by its arguments)
    pub acquisition_command: Vec<String>,
    pub hv_port: String,
    pub hv_baud: u32,
    pub pulser_port: String,
    pub pulser_baud: u32,
    /// Target detection rate in %
    pub detection_rate: f64,
    /// Control loop frequency in Hz
    pub ex_freq: u64,
    /// Experiment time in seconds
    pub ex_time: u64,
    /// Number of ticks in the count rate average
    pub cycle_avg: usize,
    pub vdc_step_up: f64,
    pub vdc_step_down: f64,
    pub vdc_min: f64,
    pub vdc_max: f64,
    pub v_p_min: f64,
    pub v_p_max: f64,
    /// Pulse voltage as a fraction of the specimen voltage
    pub pulse_fraction: f64,
    /// Pulse amplitude delivered per volt of pulser supply voltage
    pub pulse_amp_per_supply_voltage: f64,
    /// Pulse frequency in kHz
    pub pulse_frequency: f64,
    pub max_ions: u64,
    pub criteria_ions: bool,
    pub criteria_vdc: bool,
    pub criteria_time: bool,
    pub timing: Timing,
}

impl Default for Config {
    /// Generate a new Config object with conservative control parameters. Paths and ports
    /// are placeholders.
    fn default() -> Self {
        Self {
            user_name: String::from(""),
            run_name: String::from("run"),
            email: String::from(""),
            data_path: PathBuf::from("None"),
            counter_path: PathBuf::from("counter.txt"),
            acquisition_mode: AcquisitionMode::TdcPaired,
            acquisition_command: vec![],
            hv_port: String::from("/dev/ttyUSB0"),
            hv_baud: HV_DEFAULT_BAUD,
            pulser_port: String::from("/dev/ttyUSB1"),
            pulser_baud: PULSER_DEFAULT_BAUD,
            detection_rate: 1.0,
            ex_freq: 10,
            ex_time: 900,
            cycle_avg: 10,
            vdc_step_up: 10.0,
            vdc_step_down: 10.0,
            vdc_min: 500.0,
            vdc_max: 10_000.0,
            v_p_min: 40.0,
            v_p_max: 3000.0,
            pulse_fraction: 0.2,
            pulse_amp_per_supply_voltage: 3500.0 / 160.0,
            pulse_frequency: 200.0,
            max_ions: 10_000_000,
            criteria_ions: true,
            criteria_vdc: true,
            criteria_time: true,
            timing: Timing::default(),
        }
    }
}

impl Config {
    /// Read the configuration in a YAML file
    /// Returns a Config if successful
    pub fn read_config_file(config_path: &Path) -> Result<Self, ConfigError> {
        if !config_path.exists() {
            return Err(ConfigError::BadFilePath(config_path.to_path_buf()));
        }

        let yaml_str = std::fs::read_to_string(config_path)?;

        Ok(serde_yaml::from_str::<Self>(&yaml_str)?)
    }

    /// Write the configuration to a YAML file
    pub fn write_config_file(&self, config_path: &Path) -> Result<(), ConfigError> {
        std::fs::write(config_path, serde_yaml::to_string(self)?)?;
        Ok(())
    }

    /// Check the control parameters before any device is touched
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ex_freq == 0 || self.ex_freq > MAX_EX_FREQ {
            return Err(ConfigError::InvalidValue {
                field: "ex_freq",
                reason: format!("control frequency must be between 1 and {MAX_EX_FREQ} Hz"),
            });
        }
        let values = [
            ("detection_rate", self.detection_rate),
            ("vdc_step_up", self.vdc_step_up),
            ("vdc_step_down", self.vdc_step_down),
            ("vdc_min", self.vdc_min),
            ("vdc_max", self.vdc_max),
            ("v_p_min", self.v_p_min),
            ("v_p_max", self.v_p_max),
            ("pulse_fraction", self.pulse_fraction),
            ("pulse_amp_per_supply_voltage", self.pulse_amp_per_supply_voltage),
            ("pulse_frequency", self.pulse_frequency),
        ];
        if let Some((field, value)) = values.into_iter().find(|(_, value)| !value.is_finite()) {
            return Err(ConfigError::InvalidValue {
                field,
                reason: format!("{value} is not a finite number"),
            });
        }
        if self.cycle_avg == 0 {
            return Err(ConfigError::InvalidValue {
                field: "cycle_avg",
                reason: String::from("averaging window must be at least one tick"),
            });
        }
        if self.vdc_min >= self.vdc_max {
            return Err(ConfigError::InvalidValue {
                field: "vdc_min",
                reason: format!("{} is not below vdc_max {}", self.vdc_min, self.vdc_max),
            });
        }
        if self.v_p_min >= self.v_p_max {
            return Err(ConfigError::InvalidValue {
                field: "v_p_min",
                reason: format!("{} is not below v_p_max {}", self.v_p_min, self.v_p_max),
            });
        }
        if self.pulse_amp_per_supply_voltage <= 0.0 {
            return Err(ConfigError::InvalidValue {
                field: "pulse_amp_per_supply_voltage",
                reason: String::from("must be positive"),
            });
        }
        if self.pulse_frequency <= 0.0 {
            return Err(ConfigError::InvalidValue {
                field: "pulse_frequency",
                reason: String::from("must be positive"),
            });
        }
        Ok(())
    }

    /// Target of the controller as a detected fraction of pulses
    pub fn counts_target(&self) -> f64 {
        ((self.detection_rate / 100.0) * self.pulse_frequency) / self.pulse_frequency
    }

    /// Duration of one control period
    pub fn tick_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.ex_freq as f64)
    }

    /// Number of consecutive ticks at the voltage ceiling before the run stops
    pub fn vdc_debounce_ticks(&self) -> u64 {
        self.ex_freq.saturating_mul(VDC_DEBOUNCE_SECONDS)
    }

    /// Pulser supply voltage bounds, from the pulse amplitude bounds
    pub fn pulse_supply_bounds(&self) -> (f64, f64) {
        (
            self.v_p_min / self.pulse_amp_per_supply_voltage,
            self.v_p_max / self.pulse_amp_per_supply_voltage,
        )
    }

    /// Get the directory for a given run, creating it if needed
    pub fn get_run_directory(&self, run_number: u64) -> Result<PathBuf, ConfigError> {
        if !self.data_path.exists() {
            return Err(ConfigError::BadFilePath(self.data_path.clone()));
        }
        let run_dir = self.data_path.join(self.get_run_str(run_number));
        std::fs::create_dir_all(&run_dir)?;
        Ok(run_dir)
    }

    /// Get the path to the output hdf5 file
    pub fn get_hdf_file_name(&self, run_dir: &Path) -> PathBuf {
        run_dir.join(format!("{}_data.h5", self.run_name))
    }

    /// Get the path to the run report
    pub fn get_report_file_name(&self, run_dir: &Path) -> PathBuf {
        run_dir.join("parameters.txt")
    }

    /// Construct the run string from the run counter and run name
    fn get_run_str(&self, run_number: u64) -> String {
        format!("{run_number}_{}", self.run_name)
    }

    pub fn has_acquisition_command(&self) -> bool {
        !self.acquisition_command.is_empty()
    }

    pub fn wants_notification(&self) -> bool {
        self.email.len() > 3
    }
}
