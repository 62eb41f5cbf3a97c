//! # apt_control_cli
//!
//! Part of the apt_control crate family.
//!
//! Command line front end for running an atom probe experiment.
//!
//! ## Use
//!
//! Make a template configuration:
//!
//! ```bash
//! apt_control_cli -p config.yml new
//! ```
//!
//! Run an experiment with the configuration:
//!
//! ```bash
//! apt_control_cli -p config.yml
//! ```
//!
//! Add `--simulate` to run against the simulated instrument instead of the serial devices
//! and the acquisition program. While the run is going, type `stop` and enter to end it, or
//! `time <seconds>` to change the experiment time.
use clap::{Arg, ArgAction, Command};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use indicatif_log_bridge::LogWrapper;
use std::fs::File;
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::mpsc;

use libapt_control::acquisition::{event_queues, AcquisitionProcess, ChildAcquisition};
use libapt_control::config::{AcquisitionMode, Config};
use libapt_control::devices::Devices;
use libapt_control::error::ExperimentError;
use libapt_control::experiment::Experiment;
use libapt_control::run_state::RunControl;
use libapt_control::simulation::{EvaporationModel, SimulatedBench};

const LOG_FILE: &str = "apt_control.log";

/// Open the devices and the acquisition backend for the configured mode
fn build_experiment(config: Config, simulate: bool) -> Result<Experiment, ExperimentError> {
    let mode = config.acquisition_mode;
    let bench = simulate.then(|| SimulatedBench::new(&config, EvaporationModel::default()));
    let devices = match &bench {
        Some(bench) => bench.devices(mode),
        // No hardware edge counter binding is available; the run will refuse to start
        None => Devices::open_serial(&config, None)?,
    };

    if mode == AcquisitionMode::EdgeCounter {
        return Ok(Experiment::new(config, devices));
    }

    let (tx, rx) = event_queues(mode)?;
    let process: Box<dyn AcquisitionProcess> = match &bench {
        Some(bench) => Box::new(bench.acquisition(tx)),
        None if config.has_acquisition_command() => {
            Box::new(ChildAcquisition::spawn(&config.acquisition_command, tx)?)
        }
        None => return Err(ExperimentError::MissingAcquisition(mode)),
    };
    Ok(Experiment::new(config, devices).with_acquisition(process, rx))
}

/// Read operator commands from stdin for the lifetime of the program
fn listen_for_commands(control: RunControl) {
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let line = match line {
                Ok(l) => l,
                Err(_) => break,
            };
            let mut words = line.split_whitespace();
            match (words.next(), words.next()) {
                (Some("stop"), None) => {
                    log::info!("Stop requested by the operator");
                    control.abort();
                }
                (Some("time"), Some(seconds)) => match seconds.parse::<u64>() {
                    Ok(s) => {
                        log::info!("Experiment time changed to {s} s");
                        control.set_ex_time(s);
                    }
                    Err(e) => log::warn!("Invalid experiment time {seconds}: {e}"),
                },
                (None, _) => (),
                _ => log::warn!("Unknown command {line:?}; use 'stop' or 'time <seconds>'"),
            }
        }
    });
}

fn main() {
    // Create a cli
    let matches = Command::new("apt_control_cli")
        .arg_required_else_help(true)
        .subcommand(Command::new("new").about("Make a template configuration yaml file"))
        .arg(
            Arg::new("path")
                .short('p')
                .long("path")
                .help("Path to the configuration file"),
        )
        .arg(
            Arg::new("simulate")
                .long("simulate")
                .action(ArgAction::SetTrue)
                .help("Run against the simulated instrument"),
        )
        .get_matches();

    // Initialize feedback
    let mut loggers: Vec<Box<dyn simplelog::SharedLogger>> = vec![simplelog::TermLogger::new(
        simplelog::LevelFilter::Info,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    )];
    match File::create(LOG_FILE) {
        Ok(file) => loggers.push(simplelog::WriteLogger::new(
            simplelog::LevelFilter::Debug,
            simplelog::Config::default(),
            file,
        )),
        Err(e) => eprintln!("Could not create log file {LOG_FILE}: {e}"),
    }
    let logger = simplelog::CombinedLogger::new(loggers);

    let pb_manager = MultiProgress::new();

    LogWrapper::new(pb_manager.clone(), logger)
        .try_init()
        .expect("Could not create logging/progress!");
    log::set_max_level(log::LevelFilter::Debug);

    // Parse the cli
    let config_path = PathBuf::from(matches.get_one::<String>("path").expect("We require args"));
    let simulate = matches.get_flag("simulate");

    if let Some(("new", _)) = matches.subcommand() {
        log::info!(
            "Making a template config at {}...",
            config_path.to_string_lossy()
        );
        match Config::default().write_config_file(&config_path) {
            Ok(()) => log::info!("Done."),
            Err(e) => log::error!("{e}"),
        }
        return;
    }

    // Load our config
    log::info!("Loading config from {}...", config_path.to_string_lossy());
    let config = match Config::read_config_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            log::error!("{e}");
            return;
        }
    };
    log::info!("Config successfully loaded.");
    log::info!("Operator: {}", config.user_name);
    log::info!("Run Name: {}", config.run_name);
    log::info!("Data Path: {}", config.data_path.to_string_lossy());
    log::info!("Acquisition Mode: {}", config.acquisition_mode);
    log::info!(
        "Detection Rate: {}% at {} kHz, control at {} Hz",
        config.detection_rate,
        config.pulse_frequency,
        config.ex_freq
    );
    log::info!(
        "Specimen Voltage: {} V to {} V",
        config.vdc_min,
        config.vdc_max
    );
    if simulate {
        log::info!("Using the simulated instrument");
    }

    let experiment = match build_experiment(config, simulate) {
        Ok(e) => e,
        Err(e) => {
            log::error!("Could not set up the experiment: {e}");
            return;
        }
    };

    // Setup the progress bar
    let pb = pb_manager.add(ProgressBar::new(1000));
    if let Ok(style) = ProgressStyle::with_template("{bar:40.cyan/blue} {percent:>3}% {msg}") {
        pb.set_style(style);
    }
    let (tx, rx) = mpsc::channel();
    let experiment = experiment.with_status(tx);
    listen_for_commands(experiment.control());

    // Spawn the task!
    let handle = std::thread::spawn(move || experiment.run());

    loop {
        std::thread::sleep(std::time::Duration::from_millis(500));
        if let Some(status) = rx.try_iter().last() {
            pb.set_position((status.progress * 1000.0) as u64);
            pb.set_message(format!(
                "{:?} | {} ions | {:.1} V | {:.1} s",
                status.state, status.total_ions, status.specimen_voltage, status.elapsed
            ));
        }

        if handle.is_finished() {
            match handle.join() {
                Ok(result) => match result {
                    Ok(summary) => {
                        log::info!(
                            "Run {} finished: {}. {} ions in {:.1} s, {} overrun ticks",
                            summary.run_number,
                            summary.stop_reason,
                            summary.total_ions,
                            summary.elapsed.as_secs_f64(),
                            summary.overruns
                        );
                        log::info!("Data written to {}", summary.hdf_path.display());
                        if !summary.length_mismatches.is_empty() {
                            log::warn!(
                                "{} event columns have mismatched lengths; see {LOG_FILE}",
                                summary.length_mismatches.len()
                            );
                        }
                    }
                    Err(e) => log::error!("Experiment failed with error: {e}"),
                },
                Err(_) => log::error!("Failed to join experiment task!"),
            }
            break;
        }
    }

    pb.finish();

    log::info!("Done.");
}
