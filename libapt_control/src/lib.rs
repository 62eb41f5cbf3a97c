//! # apt_control
//!
//! apt_control is the experiment control for a pulsed atom probe tomography (APT)
//! instrument, written in Rust. It drives the specimen high voltage and the pulse generator
//! in a closed loop so that ions field evaporate from the specimen at a constant target
//! detection rate, collects the detector events streamed by the acquisition backend, and
//! writes everything recorded during the run to a single HDF5 file.
//!
//! ## Installation
//!
//! The only method of install is from source, which is laid out below.
//!
//! ### Rust
//!
//! If you have not used Rust before, you will most likely need to install the Rust tool
//! chain. See the [Rust docs](https://www.rust-lang.org/tools/install) for installation
//! instructions.
//!
//! ### HDF5
//!
//! Before building and running apt_control, HDF5 must be installed. Typically this will
//! be installed using a package manager (homebrew, apt, etc), and the Rust libraries will
//! auto detect the location of the HDF install. If HDF5 lives in a custom location, write
//! the following snippet into the file `.cargo/config.toml` in the repository:
//!
//! ```toml
//! [env]
//! HDF5_DIR="/path/to/my/hdf5/install/"
//!
//! [build]
//! rustflags="-C link-args=-Wl,-rpath,/path/to/my/hdf5/install/lib"
//! ```
//!
//! ### Building & Install
//!
//! To build and install the CLI use `cargo install --path ./apt_control_cli` from the top
//! level repository. To use the CLI see the `apt_control_cli` README.
//!
//! ## How a run works
//!
//! 1. The configuration is validated and the run directory
//!    `<data_path>/<run number>_<run_name>` is created. The run number is read from the
//!    run counter file.
//! 2. The HV supply and the pulser are brought to their minimum values, one drain thread per
//!    event queue is started, and the outputs are switched on (warm-up).
//! 3. The control loop ticks at `ex_freq`. Every tick reads the cumulative ion count, steps
//!    the specimen voltage up in proportion to the detection rate error, sets the pulse
//!    voltage to a fixed fraction of the specimen voltage and records one telemetry row.
//! 4. The run stops on operator abort, on reaching the ion count, after the specimen voltage
//!    held its maximum for ten seconds, or when the experiment time is up.
//! 5. The acquisition backend is stopped (and terminated if it does not comply), the queues
//!    are drained, and the HDF5 file, the run report and the run counter are written.
//! 6. The devices are switched off and released. This happens whatever the outcome of the
//!    previous steps.
//!
//! ## Acquisition modes
//!
//! - `tdc_paired`: TDC delivering delay-line detector hits (x, y, t, start counter). One hit
//! is one ion.
//! - `tdc_raw`: TDC delivering raw channel timestamps (channel, time data, start counter).
//! Four entries are one ion.
//! - `waveform`: four channel digitizer. Ions are not counted during the run, so the
//! specimen voltage ramps at the full gain.
//! - `edge_counter`: a hardware counter of detector edges supplies the ion count. No event
//! data is recorded.
//!
//! An external acquisition program writes one batch per line on its stdout:
//!
//! ```text
//! dld 12,-40 301,77 1020,998 5,6
//! tdc 0,1,2,3 1200,1215,1230,1244 9,9,9,9
//! ```
//!
//! The first word is the record kind, followed by one comma separated column each (`-` is
//! an empty column). It is asked to stop by a single `stop` line on its stdin.
//!
//! ## Configuration
//!
//! Configurations are YAML files. Any field left out takes its default value. A template is
//! written by `apt_control_cli -p config.yml new`.
//!
//! ```yml
//! user_name: ''
//! run_name: run
//! email: ''
//! data_path: None
//! counter_path: counter.txt
//! acquisition_mode: tdc_paired
//! acquisition_command: []
//! hv_port: /dev/ttyUSB0
//! hv_baud: 115200
//! pulser_port: /dev/ttyUSB1
//! pulser_baud: 9600
//! detection_rate: 1.0
//! ex_freq: 10
//! ex_time: 900
//! cycle_avg: 10
//! vdc_step_up: 10.0
//! vdc_step_down: 10.0
//! vdc_min: 500.0
//! vdc_max: 10000.0
//! v_p_min: 40.0
//! v_p_max: 3000.0
//! pulse_fraction: 0.2
//! pulse_amp_per_supply_voltage: 21.875
//! pulse_frequency: 200.0
//! max_ions: 10000000
//! criteria_ions: true
//! criteria_vdc: true
//! criteria_time: true
//! ```
//!
//! ## Output
//!
//! Every run directory holds the HDF5 data file `<run_name>_data.h5` and the run report
//! `parameters.txt`. The data format used in the HDF5 file is as follows:
//!
//! ```text
//! <run_name>_data.h5 - version
//! experiment
//! |---- high_voltage, pulse_voltage, num_events, time_counter, elapsed_time (dset)
//! time
//! |---- time_h, time_m, time_s (dset)
//! dld
//! |---- x, y, t, start_counter, high_voltage, pulse_voltage (dset)
//! tdc
//! |---- channel, time_data, start_counter, high_voltage, pulse_voltage (dset)
//! drs
//! |---- ch0_time, ch0_wave, ch1_time, ch1_wave, ch2_time, ch2_wave, ch3_time, ch3_wave,
//! |     high_voltage, pulse_voltage (dset)
//! ```
//!
//! Groups of modes that did not run contain empty datasets.
pub mod accumulator;
pub mod acquisition;
pub mod config;
pub mod constants;
pub mod controller;
pub mod devices;
pub mod drain;
pub mod error;
pub mod experiment;
pub mod hdf_writer;
pub mod ion_source;
pub mod report;
pub mod run_state;
pub mod simulation;
pub mod status;
pub mod stop;
