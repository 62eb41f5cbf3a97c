use std::path::PathBuf;
use thiserror::Error;

use super::config::AcquisitionMode;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration as file {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("Config failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Config failed to parse YAML: {0}")]
    ParsingError(#[from] serde_yaml::Error),
    #[error("Config has an invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("Device {0} failed due to IO error: {1}")]
    IOError(String, #[source] std::io::Error),
    #[error("Could not open serial port {0}: {1}")]
    OpenFailed(String, #[source] serialport::Error),
    #[error("Device {0} was used after it was closed")]
    Closed(String),
    #[error("Device {0} returned a response that could not be parsed: {1:?}")]
    BadResponse(String, String),
}

#[derive(Debug, Error)]
pub enum AcquisitionError {
    #[error("Acquisition process could not be started: {0}")]
    SpawnFailed(#[source] std::io::Error),
    #[error("Acquisition process failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Acquisition record is malformed: {0:?}")]
    BadRecord(String),
    #[error("Acquisition record has a bad integer value: {0}")]
    BadInteger(#[from] std::num::ParseIntError),
    #[error("Acquisition record has a bad float value: {0}")]
    BadFloat(#[from] std::num::ParseFloatError),
    #[error("Acquisition mode {0} does not stream events over queues")]
    NoQueues(AcquisitionMode),
    #[error("Acquisition record of kind {0} does not match the queues of mode {1}")]
    WrongKind(String, AcquisitionMode),
}

#[derive(Debug, Error)]
pub enum HDF5WriterError {
    #[error("HDF5Writer failed due to HDF5 error: {0}")]
    HDF5Error(#[from] hdf5::Error),
    #[error("HDF5Writer failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("HDF5Writer could not encode the version string: {0}")]
    VersionError(String),
}

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("Run report failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Run counter file contains an invalid integer: {0}")]
    BadCounter(#[from] std::num::ParseIntError),
}

#[derive(Debug, Error)]
pub enum ExperimentError {
    #[error("Experiment failed due to Config error: {0}")]
    ConfigError(#[from] ConfigError),
    #[error("Experiment failed due to Device error: {0}")]
    DeviceError(#[from] DeviceError),
    #[error("Experiment failed due to Acquisition error: {0}")]
    AcquisitionError(#[from] AcquisitionError),
    #[error("Experiment failed due to HDF5Writer error: {0}")]
    HDFError(#[from] HDF5WriterError),
    #[error("Experiment failed due to run report error: {0}")]
    ReportError(#[from] ReportError),
    #[error("Experiment failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Experiment was given {given} event queues but is configured for {expected}")]
    ModeMismatch {
        given: AcquisitionMode,
        expected: AcquisitionMode,
    },
    #[error("Experiment in edge counter mode requires an edge counter device")]
    MissingCounter,
    #[error("Experiment in {0} mode requires an acquisition process and its event queues")]
    MissingAcquisition(AcquisitionMode),
}
