use std::path::PathBuf;
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use time::UtcOffset;

use super::accumulator::{ColumnAccumulator, EventData};
use super::acquisition::{
    AcquisitionProcess, EventReceivers, DLD_COLUMNS, DRS_COLUMNS, TDC_COLUMNS,
};
use super::config::{AcquisitionMode, Config, Timing};
use super::controller::{ControllerState, RateController};
use super::devices::Devices;
use super::drain::{lock_accumulator, DrainHandle, QueueDrain};
use super::error::ExperimentError;
use super::hdf_writer::HDFWriter;
use super::ion_source::IonCountSource;
use super::report::{local_offset, now_in, LogNotifier, Notifier, RunCounter, RunReport};
use super::run_state::{RunControl, RunFlags, RunState, SharedVoltages};
use super::status::ExperimentStatus;
use super::stop::{StopEvaluator, StopReason};

/// What a finished run produced
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_number: u64,
    pub stop_reason: StopReason,
    pub total_ions: u64,
    pub ticks: u64,
    /// Ticks that took longer than the control period
    pub overruns: u64,
    pub elapsed: Duration,
    pub max_specimen_voltage: f64,
    pub max_pulse_voltage: f64,
    pub hdf_path: PathBuf,
    pub report_path: PathBuf,
    pub length_mismatches: Vec<String>,
}

/// Accumulators of every mode, shared with the drain of the active mode
struct SharedEvents {
    dld: Arc<Mutex<ColumnAccumulator<i32>>>,
    tdc: Arc<Mutex<ColumnAccumulator<i32>>>,
    drs: Arc<Mutex<ColumnAccumulator<f32>>>,
}

impl SharedEvents {
    fn new() -> Self {
        Self {
            dld: Arc::new(Mutex::new(ColumnAccumulator::new(&DLD_COLUMNS))),
            tdc: Arc::new(Mutex::new(ColumnAccumulator::new(&TDC_COLUMNS))),
            drs: Arc::new(Mutex::new(ColumnAccumulator::new(&DRS_COLUMNS))),
        }
    }

    /// Move the accumulated data out. Only call once the drains are done.
    fn take(&self) -> EventData {
        EventData {
            dld: std::mem::replace(
                &mut *lock_accumulator(&self.dld),
                ColumnAccumulator::new(&DLD_COLUMNS),
            ),
            tdc: std::mem::replace(
                &mut *lock_accumulator(&self.tdc),
                ColumnAccumulator::new(&TDC_COLUMNS),
            ),
            drs: std::mem::replace(
                &mut *lock_accumulator(&self.drs),
                ColumnAccumulator::new(&DRS_COLUMNS),
            ),
        }
    }
}

/// Start the drain of the queues and hand back the ion count source they feed
fn spawn_drain(
    receivers: EventReceivers,
    events: &SharedEvents,
    voltages: &Arc<SharedVoltages>,
    flags: &Arc<RunFlags>,
    timing: &Timing,
) -> (DrainHandle, IonCountSource) {
    let idle_wait = Duration::from_micros(timing.drain_idle_us);
    let column_wait = Duration::from_millis(timing.column_wait_ms);
    match receivers {
        EventReceivers::Paired(rx) => {
            let drain = QueueDrain::new(
                "dld",
                rx,
                events.dld.clone(),
                voltages.clone(),
                flags.clone(),
                idle_wait,
                column_wait,
            );
            let source = IonCountSource::PairedEvents(drain.event_counter());
            (drain.spawn(), source)
        }
        EventReceivers::Raw(rx) => {
            let drain = QueueDrain::new(
                "tdc",
                rx,
                events.tdc.clone(),
                voltages.clone(),
                flags.clone(),
                idle_wait,
                column_wait,
            );
            let source = IonCountSource::RawEvents(drain.event_counter());
            (drain.spawn(), source)
        }
        EventReceivers::Waveform(rx) => {
            let drain = QueueDrain::new(
                "drs",
                rx,
                events.drs.clone(),
                voltages.clone(),
                flags.clone(),
                idle_wait,
                column_wait,
            );
            (drain.spawn(), IonCountSource::WaveformChannels)
        }
    }
}

/// Stop the acquisition backend, escalating if it does not exit. Never fails.
fn shutdown_acquisition(process: &mut dyn AcquisitionProcess, timing: &Timing) {
    let name = process.name().to_string();
    if !process.join(Duration::from_millis(timing.acquisition_join_ms)) {
        log::warn!("Acquisition {name} did not exit after the stop request; terminating it");
        if let Err(e) = process.terminate() {
            log::error!("Could not terminate acquisition {name}: {e}");
        }
        if !process.join(Duration::from_millis(timing.terminate_join_ms)) {
            log::error!("Acquisition {name} is still alive after it was terminated");
        }
    }
    process.close();
    log::info!("Acquisition {name} is shut down");
}

/// A single experiment run.
///
/// Owns the devices and the acquisition backend for the run. [`Experiment::run`] walks the
/// whole lifecycle (initialization, warm-up, the control loop, draining, persistence) and
/// always cleans up the devices before it returns, whatever the outcome.
pub struct Experiment {
    config: Config,
    devices: Devices,
    control: RunControl,
    acquisition: Option<Box<dyn AcquisitionProcess>>,
    receivers: Option<EventReceivers>,
    status_tx: Option<Sender<ExperimentStatus>>,
    notifier: Box<dyn Notifier>,
}

impl Experiment {
    pub fn new(config: Config, devices: Devices) -> Self {
        let control = RunControl::new(config.ex_time);
        Self {
            config,
            devices,
            control,
            acquisition: None,
            receivers: None,
            status_tx: None,
            notifier: Box::new(LogNotifier),
        }
    }

    /// Attach the acquisition backend and the consumer side of its event queues
    pub fn with_acquisition(
        mut self,
        process: Box<dyn AcquisitionProcess>,
        receivers: EventReceivers,
    ) -> Self {
        self.acquisition = Some(process);
        self.receivers = Some(receivers);
        self
    }

    pub fn with_status(mut self, tx: Sender<ExperimentStatus>) -> Self {
        self.status_tx = Some(tx);
        self
    }

    pub fn with_notifier(mut self, notifier: Box<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Handle for aborting the run or changing its duration from another thread
    pub fn control(&self) -> RunControl {
        self.control.clone()
    }

    /// Run the experiment to completion
    pub fn run(mut self) -> Result<RunSummary, ExperimentError> {
        let result = self.run_inner();
        if let Some(mut process) = self.acquisition.take() {
            // Early failure, the acquisition never reached the draining phase
            process.request_stop();
            shutdown_acquisition(process.as_mut(), &self.config.timing);
        }
        self.devices.clean_up();
        match &result {
            Ok(summary) => log::info!(
                "Run {} finished: {} after {} ticks, {} ions",
                summary.run_number,
                summary.stop_reason,
                summary.ticks,
                summary.total_ions
            ),
            Err(e) => log::error!("Run failed: {e}"),
        }
        result
    }

    fn check_mode(&self) -> Result<(), ExperimentError> {
        let expected = self.config.acquisition_mode;
        match (&self.receivers, expected) {
            (Some(rx), AcquisitionMode::EdgeCounter) => Err(ExperimentError::ModeMismatch {
                given: rx.mode(),
                expected,
            }),
            (Some(rx), _) if rx.mode() != expected => Err(ExperimentError::ModeMismatch {
                given: rx.mode(),
                expected,
            }),
            (Some(_), _) => Ok(()),
            (None, AcquisitionMode::EdgeCounter) if self.devices.counter.is_none() => {
                Err(ExperimentError::MissingCounter)
            }
            (None, AcquisitionMode::EdgeCounter) => Ok(()),
            (None, mode) => Err(ExperimentError::MissingAcquisition(mode)),
        }
    }

    fn run_inner(&mut self) -> Result<RunSummary, ExperimentError> {
        self.config.validate()?;
        self.check_mode()?;

        let counter = RunCounter::new(&self.config.counter_path);
        let run_number = counter.read()?;
        let run_dir = self.config.get_run_directory(run_number)?;
        log::info!("Starting run {} in {}", run_number, run_dir.display());

        self.devices.initialize(&self.config)?;

        let offset = local_offset();
        let start_time = now_in(offset);
        let timing = self.config.timing.clone();
        let voltages = Arc::new(SharedVoltages::new(
            self.config.vdc_min,
            self.config.v_p_min,
        ));
        let flags = self.control.flags().clone();
        let events = SharedEvents::new();
        let (drain, ion_source) = match self.receivers.take() {
            Some(receivers) => {
                let (handle, source) = spawn_drain(receivers, &events, &voltages, &flags, &timing);
                (Some(handle), source)
            }
            None => (None, IonCountSource::EdgeCounter),
        };

        let mut controller = RateController::new(&self.config);
        let mut state = RunState::new(
            self.config.vdc_min,
            self.config.vdc_max,
            self.config.v_p_min,
        );
        let loop_result = self.control_loop(&mut controller, &mut state, &ion_source, &voltages, offset);

        // Every stop path converges here
        controller.begin_draining();
        self.send_status(controller.state(), &state, 1.0);
        if let Some(process) = self.acquisition.as_mut() {
            if !process.request_stop() {
                log::warn!("Stop token for acquisition {} was not posted", process.name());
            }
        }
        std::thread::sleep(Duration::from_millis(timing.grace_ms));
        if let Some(mut process) = self.acquisition.take() {
            shutdown_acquisition(process.as_mut(), &timing);
        }
        flags.end_experiment();
        if let Some(drain) = drain {
            match drain.join(Duration::from_millis(timing.acquisition_join_ms)) {
                Some(n_batches) => log::info!("Drained {n_batches} event batches"),
                None => log::error!("Event drain did not finish; saving what was collected"),
            }
        }

        let (stop_reason, overruns, elapsed) = loop_result?;
        let end_time = now_in(offset);

        match ion_source.current_total_ions(self.devices.counter.as_mut()) {
            Ok(Some(total)) => state.total_ions = total,
            Ok(None) => (),
            Err(e) => log::warn!("Could not read the final ion count: {e}"),
        }

        let event_data = events.take();
        let length_mismatches = event_data.length_mismatches();
        for mismatch in length_mismatches.iter() {
            log::warn!("Event column length mismatch: {mismatch}");
        }

        let hdf_path = self.config.get_hdf_file_name(&run_dir);
        let writer = HDFWriter::new(&hdf_path)?;
        writer.write_telemetry(&state.telemetry)?;
        writer.write_events(&event_data)?;
        let hdf_path = writer.close()?;

        let max_pulse_voltage = state
            .telemetry
            .pulse_voltage
            .iter()
            .copied()
            .fold(state.pulse_voltage, f64::max);
        let report = RunReport {
            run_number,
            start_time,
            end_time,
            elapsed_seconds: elapsed.as_secs_f64(),
            total_ions: state.total_ions,
            max_specimen_voltage: state.specimen(),
            max_pulse_voltage,
            stop_reason,
        };
        let report_path = self.config.get_report_file_name(&run_dir);
        report.write(&self.config, &report_path)?;

        let next_run = counter.increment()?;
        log::info!("Run counter advanced to {next_run}");

        if self.config.wants_notification() {
            let subject = format!("Experiment {} finished", self.config.run_name);
            self.notifier
                .notify(&self.config.email, &subject, &report.render(&self.config));
        }

        controller.terminate();
        self.send_status(controller.state(), &state, 1.0);

        Ok(RunSummary {
            run_number,
            stop_reason,
            total_ions: state.total_ions,
            ticks: state.iteration,
            overruns,
            elapsed,
            max_specimen_voltage: state.specimen(),
            max_pulse_voltage,
            hdf_path,
            report_path,
            length_mismatches,
        })
    }

    /// Warm up, then tick until a stop criterion fires.
    /// Returns the stop reason, the number of overrun ticks and the time spent ticking.
    fn control_loop(
        &mut self,
        controller: &mut RateController,
        state: &mut RunState,
        ion_source: &IonCountSource,
        voltages: &SharedVoltages,
        offset: UtcOffset,
    ) -> Result<(StopReason, u64, Duration), ExperimentError> {
        controller.warm_up(&mut self.devices, &self.config.timing)?;
        log::info!("Devices are warmed up, starting the control loop");

        let mut evaluator = StopEvaluator::new(&self.config, self.control.clone());
        let period = self.config.tick_period();
        let mut overruns = 0;
        let start = Instant::now();
        loop {
            let tick_start = Instant::now();
            let total_ions = match ion_source.current_total_ions(self.devices.counter.as_mut()) {
                Ok(total) => total,
                Err(e) => {
                    log::warn!("Could not read the ion count: {e}");
                    None
                }
            };
            controller.advance_tick(
                state,
                total_ions,
                self.devices.hv.as_mut(),
                self.devices.pulser.as_mut(),
                now_in(offset).time(),
                start.elapsed(),
            );
            voltages.publish(state.specimen(), state.pulse_voltage);

            let progress = self.progress(state, &evaluator);
            self.send_status(controller.state(), state, progress);

            if let Some(reason) = evaluator.evaluate(state) {
                return Ok((reason, overruns, start.elapsed()));
            }

            let spent = tick_start.elapsed();
            if spent < period {
                std::thread::sleep(period - spent);
            } else {
                overruns += 1;
                log::warn!(
                    "Tick {} took {:?}, longer than the control period of {:?}",
                    state.iteration,
                    spent,
                    period
                );
            }
        }
    }

    fn progress(&self, state: &RunState, evaluator: &StopEvaluator) -> f32 {
        let fraction = if self.config.criteria_ions && self.config.max_ions > 0 {
            state.total_ions as f64 / self.config.max_ions as f64
        } else if self.config.criteria_time && evaluator.tick_budget() > 0 {
            state.iteration as f64 / evaluator.tick_budget() as f64
        } else {
            0.0
        };
        fraction.min(1.0) as f32
    }

    /// Report progress to the front end. A front end that went away is dropped.
    fn send_status(&mut self, controller_state: ControllerState, state: &RunState, progress: f32) {
        if let Some(tx) = &self.status_tx {
            let status = ExperimentStatus {
                state: controller_state,
                iteration: state.iteration,
                total_ions: state.total_ions,
                specimen_voltage: state.specimen(),
                pulse_voltage: state.pulse_voltage,
                elapsed: state.elapsed.as_secs_f64(),
                progress,
            };
            if tx.send(status).is_err() {
                log::debug!("Status receiver is gone; no more status updates");
                self.status_tx = None;
            }
        }
    }
}
