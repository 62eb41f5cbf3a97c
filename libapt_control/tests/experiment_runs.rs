use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use libapt_control::acquisition::{
    event_queues, AcquisitionProcess, EventSenders, ThreadAcquisition,
};
use libapt_control::config::{AcquisitionMode, Config, Timing};
use libapt_control::devices::EdgeCounter;
use libapt_control::error::{AcquisitionError, ConfigError, DeviceError, ExperimentError};
use libapt_control::experiment::Experiment;
use libapt_control::hdf_writer::RunFile;
use libapt_control::simulation::{EvaporationModel, SimulatedBench};
use libapt_control::stop::StopReason;

fn test_config(dir: &Path, mode: AcquisitionMode) -> Config {
    let mut config = Config::default();
    config.run_name = String::from("tip");
    config.data_path = dir.to_path_buf();
    config.counter_path = dir.join("counter.txt");
    config.acquisition_mode = mode;
    config.ex_freq = 50;
    config.ex_time = 1;
    config.vdc_min = 3000.0;
    config.vdc_max = 9000.0;
    config.criteria_ions = false;
    config.timing = Timing::immediate();
    config
}

/// Acquisition backend that never exits on its own
struct StubbornAcquisition {
    terminated: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
    _senders: EventSenders,
}

impl AcquisitionProcess for StubbornAcquisition {
    fn name(&self) -> &str {
        "stubborn"
    }
    fn request_stop(&mut self) -> bool {
        true
    }
    fn join(&mut self, _timeout: Duration) -> bool {
        false
    }
    fn is_alive(&mut self) -> bool {
        true
    }
    fn terminate(&mut self) -> Result<(), AcquisitionError> {
        self.terminated.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
    fn close(&mut self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Edge counter that takes longer to read than a control period
struct SlowCounter {
    delay: Duration,
    reads: Arc<AtomicUsize>,
}

impl EdgeCounter for SlowCounter {
    fn start(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }
    fn read(&mut self) -> Result<u64, DeviceError> {
        std::thread::sleep(self.delay);
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(0)
    }
    fn stop(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }
    fn close(&mut self) {}
}

#[test]
fn edge_counter_run_stops_on_ion_count() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path(), AcquisitionMode::EdgeCounter);
    config.ex_time = 10;
    config.criteria_ions = true;
    config.max_ions = 200;

    let bench = SimulatedBench::new(&config, EvaporationModel::default());
    let devices = bench.devices(AcquisitionMode::EdgeCounter);
    let summary = Experiment::new(config.clone(), devices).run().unwrap();

    assert_eq!(summary.stop_reason, StopReason::IonCountReached);
    assert!(summary.total_ions >= 200);
    assert_eq!(summary.run_number, 1);
    assert!(bench.is_closed());
    assert_eq!(
        std::fs::read_to_string(&config.counter_path).unwrap(),
        "2"
    );
    assert!(summary.report_path.exists());
    assert!(summary.length_mismatches.is_empty());

    let run = RunFile::read(&summary.hdf_path).unwrap();
    assert_eq!(run.telemetry.len() as u64, summary.ticks);
    assert!(run
        .telemetry
        .high_voltage
        .windows(2)
        .all(|pair| pair[1] >= pair[0]));
    assert!(run.events.dld.is_empty());
    assert!(summary.hdf_path.starts_with(dir.path().join("1_tip")));
}

#[test]
fn simulated_paired_run_records_events() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), AcquisitionMode::TdcPaired);

    let bench = SimulatedBench::new(&config, EvaporationModel::default());
    let devices = bench.devices(AcquisitionMode::TdcPaired);
    let (tx, rx) = event_queues(AcquisitionMode::TdcPaired).unwrap();
    let process = Box::new(bench.acquisition(tx));
    let summary = Experiment::new(config.clone(), devices)
        .with_acquisition(process, rx)
        .run()
        .unwrap();

    assert_eq!(summary.stop_reason, StopReason::TimeElapsed);
    assert_eq!(summary.ticks, config.ex_time * config.ex_freq);
    assert!(bench.is_closed());

    let run = RunFile::read(&summary.hdf_path).unwrap();
    assert!(!run.events.dld.is_empty());
    assert_eq!(run.events.dld.len() as u64, summary.total_ions);
    assert!(run.events.length_mismatches().is_empty());
    assert!(run
        .events
        .dld
        .high_voltage
        .iter()
        .all(|v| *v >= config.vdc_min));
    assert_eq!(
        bench.pulser_commands().last().map(String::as_str),
        Some("OUTPut OFF")
    );
}

#[test]
fn slow_ticks_are_counted_as_overruns() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), AcquisitionMode::EdgeCounter);
    let period = config.tick_period();

    let bench = SimulatedBench::new(&config, EvaporationModel::default());
    let mut devices = bench.devices(AcquisitionMode::EdgeCounter);
    let reads = Arc::new(AtomicUsize::new(0));
    devices.counter = Some(Box::new(SlowCounter {
        delay: period + period / 2,
        reads: reads.clone(),
    }));
    let summary = Experiment::new(config.clone(), devices).run().unwrap();

    // Every tick still completes, late ticks just start the next one right away
    assert_eq!(summary.stop_reason, StopReason::TimeElapsed);
    assert_eq!(summary.ticks, config.ex_time * config.ex_freq);
    assert!(summary.overruns > 0);
    assert!(summary.overruns < summary.ticks);
    assert!(reads.load(Ordering::SeqCst) as u64 >= summary.ticks);
    assert!(summary.elapsed >= period * summary.ticks as u32);
    assert!(bench.is_closed());
}

#[test]
fn unresponsive_acquisition_is_terminated_once() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), AcquisitionMode::TdcPaired);

    let bench = SimulatedBench::new(&config, EvaporationModel::default());
    let devices = bench.devices(AcquisitionMode::TdcPaired);
    let (tx, rx) = event_queues(AcquisitionMode::TdcPaired).unwrap();
    let terminated = Arc::new(AtomicUsize::new(0));
    let closed = Arc::new(AtomicUsize::new(0));
    let process = Box::new(StubbornAcquisition {
        terminated: terminated.clone(),
        closed: closed.clone(),
        _senders: tx,
    });

    let summary = Experiment::new(config, devices)
        .with_acquisition(process, rx)
        .run()
        .unwrap();

    assert_eq!(summary.stop_reason, StopReason::TimeElapsed);
    assert_eq!(terminated.load(Ordering::SeqCst), 1);
    assert_eq!(closed.load(Ordering::SeqCst), 1);
    assert!(bench.is_closed());
    assert!(summary.hdf_path.exists());
}

#[test]
fn unequal_batches_are_persisted_and_reported() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), AcquisitionMode::TdcPaired);

    let bench = SimulatedBench::new(&config, EvaporationModel::default());
    let devices = bench.devices(AcquisitionMode::TdcPaired);
    let (tx, rx) = event_queues(AcquisitionMode::TdcPaired).unwrap();
    let process = Box::new(ThreadAcquisition::spawn("uneven", move |mut stop| {
        if let EventSenders::Paired(columns) = &tx {
            columns.send_row(vec![vec![1, 2, 3], vec![4, 5], vec![6, 7, 8], vec![9, 9, 9]]);
        }
        while !stop.should_stop() {
            std::thread::sleep(Duration::from_millis(1));
        }
    }));

    let experiment = Experiment::new(config, devices).with_acquisition(process, rx);
    experiment.control().abort();
    let summary = experiment.run().unwrap();

    assert_eq!(summary.stop_reason, StopReason::UserAbort);
    assert_eq!(summary.ticks, 1);
    assert_eq!(summary.length_mismatches.len(), 1);
    assert!(summary.length_mismatches[0].starts_with("dld: y has 2 entries"));

    let run = RunFile::read(&summary.hdf_path).unwrap();
    assert_eq!(run.events.dld.column("x"), Some(&[1, 2, 3][..]));
    assert_eq!(run.events.dld.column("y"), Some(&[4, 5][..]));
    assert_eq!(run.events.dld.high_voltage.len(), 3);
}

#[test]
fn mode_mismatch_fails_and_still_cleans_up() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), AcquisitionMode::TdcRaw);

    let bench = SimulatedBench::new(&config, EvaporationModel::default());
    let devices = bench.devices(AcquisitionMode::TdcRaw);
    let (tx, rx) = event_queues(AcquisitionMode::TdcPaired).unwrap();
    let terminated = Arc::new(AtomicUsize::new(0));
    let closed = Arc::new(AtomicUsize::new(0));
    let process = Box::new(StubbornAcquisition {
        terminated: terminated.clone(),
        closed: closed.clone(),
        _senders: tx,
    });

    match Experiment::new(config, devices)
        .with_acquisition(process, rx)
        .run()
    {
        Err(ExperimentError::ModeMismatch { given, expected }) => {
            assert_eq!(given, AcquisitionMode::TdcPaired);
            assert_eq!(expected, AcquisitionMode::TdcRaw);
        }
        other => panic!("expected a mode mismatch, got {other:?}"),
    }
    assert!(bench.is_closed());
    assert_eq!(closed.load(Ordering::SeqCst), 1);
    assert!(!dir.path().join("counter.txt").exists());
}

#[test]
fn missing_data_path_is_fatal_before_the_loop() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path(), AcquisitionMode::EdgeCounter);
    config.data_path = dir.path().join("not_there");

    let bench = SimulatedBench::new(&config, EvaporationModel::default());
    let devices = bench.devices(AcquisitionMode::EdgeCounter);
    match Experiment::new(config, devices).run() {
        Err(ExperimentError::ConfigError(ConfigError::BadFilePath(_))) => (),
        other => panic!("expected a bad data path, got {other:?}"),
    }
    // Only the clean-up reached the supply
    assert!(bench.is_closed());
    assert_eq!(bench.hv_commands(), vec![String::from("F0")]);
}
