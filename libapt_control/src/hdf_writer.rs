use hdf5::types::VarLenUnicode;
use hdf5::{File, Group, H5Type};
use ndarray::Array1;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use super::accumulator::{ColumnAccumulator, EventData};
use super::error::HDF5WriterError;
use super::run_state::Telemetry;

const EXPERIMENT_NAME: &str = "experiment";
const TIME_NAME: &str = "time";
const DLD_NAME: &str = "dld";
const TDC_NAME: &str = "tdc";
const DRS_NAME: &str = "drs";
const HIGH_VOLTAGE_NAME: &str = "high_voltage";
const PULSE_VOLTAGE_NAME: &str = "pulse_voltage";

/// This is the version of the output format
const FORMAT_VERSION: &str = "1.0";

/// A simple struct which wraps around the hdf5-rust library.
///
/// Opens an HDF5 file for writing the data of one run. The layout is the same for every
/// acquisition mode; groups of modes that did not run hold empty datasets.
#[derive(Debug)]
pub struct HDFWriter {
    file_handle: File,
    path: PathBuf,
}
// Structure
// version(attr)
// experiment
// |---- high_voltage, pulse_voltage, num_events, time_counter, elapsed_time (dset)
// time
// |---- time_h, time_m, time_s (dset)
// dld
// |---- x, y, t, start_counter, high_voltage, pulse_voltage (dset)
// tdc
// |---- channel, time_data, start_counter, high_voltage, pulse_voltage (dset)
// drs
// |---- ch0_time, ch0_wave, ..., ch3_wave, high_voltage, pulse_voltage (dset)

impl HDFWriter {
    /// Create the writer, opening a file at path and tagging it with the format version
    pub fn new(path: &Path) -> Result<Self, HDF5WriterError> {
        let file_handle = File::create(path)?;
        let writer_version = format!("{}:{}", env!("CARGO_PKG_NAME"), FORMAT_VERSION);
        let version = VarLenUnicode::from_str(&writer_version)
            .map_err(|e| HDF5WriterError::VersionError(e.to_string()))?;
        file_handle
            .new_attr::<VarLenUnicode>()
            .create("version")?
            .write_scalar(&version)?;

        Ok(Self {
            file_handle,
            path: path.to_path_buf(),
        })
    }

    /// Write the per-tick telemetry into the experiment and time groups
    pub fn write_telemetry(&self, telemetry: &Telemetry) -> Result<(), HDF5WriterError> {
        let experiment = self.file_handle.create_group(EXPERIMENT_NAME)?;
        write_dataset(&experiment, HIGH_VOLTAGE_NAME, &telemetry.high_voltage)?;
        write_dataset(&experiment, PULSE_VOLTAGE_NAME, &telemetry.pulse_voltage)?;
        write_dataset(&experiment, "num_events", &telemetry.num_events)?;
        write_dataset(&experiment, "time_counter", &telemetry.time_counter)?;
        write_dataset(&experiment, "elapsed_time", &telemetry.elapsed_time)?;

        let time = self.file_handle.create_group(TIME_NAME)?;
        write_dataset(&time, "time_h", &telemetry.time_h)?;
        write_dataset(&time, "time_m", &telemetry.time_m)?;
        write_dataset(&time, "time_s", &telemetry.time_s)?;
        Ok(())
    }

    /// Write the event columns of every acquisition mode
    pub fn write_events(&self, events: &EventData) -> Result<(), HDF5WriterError> {
        self.write_accumulator(DLD_NAME, &events.dld)?;
        self.write_accumulator(TDC_NAME, &events.tdc)?;
        self.write_accumulator(DRS_NAME, &events.drs)?;
        Ok(())
    }

    fn write_accumulator<T: H5Type>(
        &self,
        group_name: &str,
        accumulator: &ColumnAccumulator<T>,
    ) -> Result<(), HDF5WriterError> {
        let group = self.file_handle.create_group(group_name)?;
        for (name, column) in accumulator.names().iter().zip(accumulator.columns.iter()) {
            write_dataset(&group, name, column)?;
        }
        write_dataset(&group, HIGH_VOLTAGE_NAME, &accumulator.high_voltage)?;
        write_dataset(&group, PULSE_VOLTAGE_NAME, &accumulator.pulse_voltage)?;
        Ok(())
    }

    /// Flush and close the file, consume the writer. Returns the path of the written file.
    pub fn close(self) -> Result<PathBuf, HDF5WriterError> {
        self.file_handle.flush()?;
        drop(self.file_handle);
        let size = std::fs::metadata(&self.path)?.len();
        log::info!(
            "Wrote {} ({})",
            self.path.display(),
            human_bytes::human_bytes(size as f64)
        );
        Ok(self.path)
    }
}

fn write_dataset<T: H5Type>(group: &Group, name: &str, data: &[T]) -> Result<(), HDF5WriterError> {
    group.new_dataset_builder().with_data(data).create(name)?;
    Ok(())
}

fn read_dataset<T: H5Type>(group: &Group, name: &str) -> Result<Vec<T>, HDF5WriterError> {
    let data: Array1<T> = group.dataset(name)?.read_1d::<T>()?;
    Ok(data.to_vec())
}

fn read_accumulator<T: H5Type>(
    file: &File,
    group_name: &str,
    mut accumulator: ColumnAccumulator<T>,
) -> Result<ColumnAccumulator<T>, HDF5WriterError> {
    let group = file.group(group_name)?;
    let mut columns = Vec::with_capacity(accumulator.names().len());
    for name in accumulator.names() {
        columns.push(read_dataset(&group, name)?);
    }
    accumulator.columns = columns;
    accumulator.high_voltage = read_dataset(&group, HIGH_VOLTAGE_NAME)?;
    accumulator.pulse_voltage = read_dataset(&group, PULSE_VOLTAGE_NAME)?;
    Ok(accumulator)
}

/// The contents of a run file, loaded back into memory
#[derive(Debug, Clone, PartialEq)]
pub struct RunFile {
    pub version: String,
    pub telemetry: Telemetry,
    pub events: EventData,
}

impl RunFile {
    pub fn read(path: &Path) -> Result<Self, HDF5WriterError> {
        let file = File::open(path)?;
        let version = file.attr("version")?.read_scalar::<VarLenUnicode>()?;

        let experiment = file.group(EXPERIMENT_NAME)?;
        let time = file.group(TIME_NAME)?;
        let telemetry = Telemetry {
            high_voltage: read_dataset(&experiment, HIGH_VOLTAGE_NAME)?,
            pulse_voltage: read_dataset(&experiment, PULSE_VOLTAGE_NAME)?,
            num_events: read_dataset(&experiment, "num_events")?,
            time_counter: read_dataset(&experiment, "time_counter")?,
            elapsed_time: read_dataset(&experiment, "elapsed_time")?,
            time_h: read_dataset(&time, "time_h")?,
            time_m: read_dataset(&time, "time_m")?,
            time_s: read_dataset(&time, "time_s")?,
        };

        let empty = EventData::default();
        let events = EventData {
            dld: read_accumulator(&file, DLD_NAME, empty.dld)?,
            tdc: read_accumulator(&file, TDC_NAME, empty.tdc)?,
            drs: read_accumulator(&file, DRS_NAME, empty.drs)?,
        };

        Ok(Self {
            version: version.as_str().to_string(),
            telemetry,
            events,
        })
    }
}
