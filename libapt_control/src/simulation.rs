//! Simulated instrument.
//!
//! A [`SimulatedBench`] stands in for the HV supply, the pulser, the edge counter and the
//! acquisition backend so a full run can execute without hardware. All of them share one
//! specimen voltage: whatever the controller sends to the simulated HV supply drives the
//! simulated field evaporation seen by the counter and the acquisition producer.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use super::acquisition::{EventRecord, EventSenders, ThreadAcquisition};
use super::config::{AcquisitionMode, Config};
use super::constants::{RAW_EVENTS_PER_ION, WAVEFORM_CHANNELS};
use super::devices::{hv_commands, Devices, EdgeCounter, HighVoltageSupply, Pulser};
use super::error::DeviceError;
use super::run_state::SharedVoltages;

const SAMPLES_PER_WAVEFORM: usize = 16;

/// Field evaporation of the specimen: the detection probability per pulse rises linearly with
/// the specimen voltage above an onset, up to a saturation.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaporationModel {
    pub onset_voltage: f64,
    /// Increase of the detection probability per volt above the onset
    pub probability_per_volt: f64,
    pub max_probability: f64,
}

impl Default for EvaporationModel {
    fn default() -> Self {
        Self {
            onset_voltage: 2000.0,
            probability_per_volt: 5.0e-6,
            max_probability: 0.05,
        }
    }
}

impl EvaporationModel {
    pub fn detection_probability(&self, specimen_voltage: f64) -> f64 {
        ((specimen_voltage - self.onset_voltage) * self.probability_per_volt)
            .clamp(0.0, self.max_probability)
    }

    /// Expected number of ions over `interval` at a pulse rate (Hz)
    pub fn expected_ions(&self, specimen_voltage: f64, pulse_rate: f64, interval: Duration) -> f64 {
        self.detection_probability(specimen_voltage) * pulse_rate * interval.as_secs_f64()
    }
}

/// Turns an expected (fractional) ion rate into whole ions, carrying the remainder
#[derive(Debug, Clone)]
struct IonClock {
    model: EvaporationModel,
    pulse_rate: f64,
    carry: f64,
}

impl IonClock {
    fn new(model: EvaporationModel, pulse_rate: f64) -> Self {
        Self {
            model,
            pulse_rate,
            carry: 0.0,
        }
    }

    fn advance(&mut self, specimen_voltage: f64, interval: Duration) -> u64 {
        let expected =
            self.model.expected_ions(specimen_voltage, self.pulse_rate, interval) + self.carry;
        let whole = expected.floor();
        self.carry = expected - whole;
        whole as u64
    }
}

/// Deterministic pseudo random sequence for detector coordinates
#[derive(Debug, Clone)]
struct Lcg(u64);

impl Lcg {
    fn next_u32(&mut self) -> u32 {
        self.0 = self
            .0
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        (self.0 >> 33) as u32
    }

    fn range(&mut self, low: i32, high: i32) -> i32 {
        low + (self.next_u32() % (high - low) as u32) as i32
    }
}

/// Commands received by the simulated devices, shared with whoever wants to inspect them
pub type CommandLog = Arc<Mutex<Vec<String>>>;

fn log_command(log: &CommandLog, command: &str) {
    match log.lock() {
        Ok(mut commands) => commands.push(command.to_string()),
        Err(e) => log::error!("Simulated device command log is poisoned: {e}"),
    }
}

/// Simulated specimen HV supply. Set points are published to the bench.
pub struct SimulatedHvSupply {
    bench: Arc<SharedVoltages>,
    commands: CommandLog,
    output_on: bool,
    closed: Arc<AtomicBool>,
}

impl HighVoltageSupply for SimulatedHvSupply {
    fn send(&mut self, command: &str) -> Result<Option<String>, DeviceError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DeviceError::Closed(String::from("simulated hv")));
        }
        log_command(&self.commands, command);
        match command {
            hv_commands::OUTPUT_ON => self.output_on = true,
            hv_commands::OUTPUT_OFF => self.output_on = false,
            hv_commands::QUERY_SETPOINT | hv_commands::QUERY_ACTUAL => {
                return Ok(Some(format!("{:.3}", self.bench.specimen())));
            }
            hv_commands::QUERY_OUTPUT => {
                return Ok(Some(String::from(if self.output_on { "1" } else { "0" })));
            }
            _ => {
                if let Some(value) = command.strip_prefix(">S0 ") {
                    let volts = value.trim().parse::<f64>().map_err(|_| {
                        DeviceError::BadResponse(String::from("simulated hv"), command.to_string())
                    })?;
                    self.bench.publish(volts, self.bench.pulse());
                }
            }
        }
        Ok(None)
    }

    fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Simulated pulser. Only records what it is told.
pub struct SimulatedPulser {
    commands: CommandLog,
    closed: Arc<AtomicBool>,
}

impl Pulser for SimulatedPulser {
    fn write(&mut self, command: &str) -> Result<(), DeviceError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DeviceError::Closed(String::from("simulated pulser")));
        }
        log_command(&self.commands, command);
        Ok(())
    }

    fn query(&mut self, command: &str) -> Result<Option<String>, DeviceError> {
        self.write(command)?;
        Ok(None)
    }

    fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Simulated edge counter. Counts evaporated ions at the bench voltage between reads.
pub struct SimulatedCounter {
    bench: Arc<SharedVoltages>,
    clock: IonClock,
    running: bool,
    last_read: Instant,
    total: u64,
}

impl EdgeCounter for SimulatedCounter {
    fn start(&mut self) -> Result<(), DeviceError> {
        self.running = true;
        self.last_read = Instant::now();
        Ok(())
    }

    fn read(&mut self) -> Result<u64, DeviceError> {
        if self.running {
            let now = Instant::now();
            self.total += self
                .clock
                .advance(self.bench.specimen(), now - self.last_read);
            self.last_read = now;
        }
        Ok(self.total)
    }

    fn stop(&mut self) -> Result<(), DeviceError> {
        self.running = false;
        Ok(())
    }

    fn close(&mut self) {
        self.running = false;
    }
}

/// Build the event record of `n_ions` detected ions in the format of `mode`
fn synthesize_record(mode: AcquisitionMode, n_ions: u64, rng: &mut Lcg, start: &mut i32) -> EventRecord {
    let n = n_ions as usize;
    match mode {
        AcquisitionMode::TdcRaw => {
            let n_entries = n * RAW_EVENTS_PER_ION as usize;
            let mut row = vec![Vec::with_capacity(n_entries); 3];
            for _ in 0..n {
                *start += 1;
                for channel in 0..RAW_EVENTS_PER_ION as i32 {
                    row[0].push(channel);
                    row[1].push(rng.range(1_000, 50_000));
                    row[2].push(*start);
                }
            }
            EventRecord::Raw(row)
        }
        AcquisitionMode::Waveform => {
            let mut row = vec![Vec::with_capacity(n * SAMPLES_PER_WAVEFORM); 2 * WAVEFORM_CHANNELS];
            for _ in 0..n {
                for channel in 0..WAVEFORM_CHANNELS {
                    for sample in 0..SAMPLES_PER_WAVEFORM {
                        row[2 * channel].push(sample as f32 * 0.2);
                        row[2 * channel + 1].push(-(rng.range(0, 500) as f32) / 1000.0);
                    }
                }
            }
            EventRecord::Waveform(row)
        }
        _ => {
            let mut row = vec![Vec::with_capacity(n); 4];
            for _ in 0..n {
                *start += 1;
                row[0].push(rng.range(-2_000, 2_000));
                row[1].push(rng.range(-2_000, 2_000));
                row[2].push(rng.range(5_000, 40_000));
                row[3].push(*start);
            }
            EventRecord::Paired(row)
        }
    }
}

/// The simulated instrument
#[derive(Debug, Clone)]
pub struct SimulatedBench {
    voltages: Arc<SharedVoltages>,
    model: EvaporationModel,
    pulse_rate: f64,
    hv_commands: CommandLog,
    pulser_commands: CommandLog,
    hv_closed: Arc<AtomicBool>,
    pulser_closed: Arc<AtomicBool>,
    batch_interval: Duration,
}

impl SimulatedBench {
    pub fn new(config: &Config, model: EvaporationModel) -> Self {
        Self {
            voltages: Arc::new(SharedVoltages::new(config.vdc_min, config.v_p_min)),
            model,
            pulse_rate: config.pulse_frequency * 1000.0,
            hv_commands: Arc::new(Mutex::new(Vec::new())),
            pulser_commands: Arc::new(Mutex::new(Vec::new())),
            hv_closed: Arc::new(AtomicBool::new(false)),
            pulser_closed: Arc::new(AtomicBool::new(false)),
            batch_interval: Duration::from_millis(5),
        }
    }

    pub fn hv_commands(&self) -> Vec<String> {
        self.hv_commands.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn pulser_commands(&self) -> Vec<String> {
        self.pulser_commands
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    /// True once both the HV supply and the pulser were closed
    pub fn is_closed(&self) -> bool {
        self.hv_closed.load(Ordering::SeqCst) && self.pulser_closed.load(Ordering::SeqCst)
    }

    /// Device bundle wired to this bench. Includes a counter in edge counter mode.
    pub fn devices(&self, mode: AcquisitionMode) -> Devices {
        let hv = SimulatedHvSupply {
            bench: self.voltages.clone(),
            commands: self.hv_commands.clone(),
            output_on: false,
            closed: self.hv_closed.clone(),
        };
        let pulser = SimulatedPulser {
            commands: self.pulser_commands.clone(),
            closed: self.pulser_closed.clone(),
        };
        let counter: Option<Box<dyn EdgeCounter>> = match mode {
            AcquisitionMode::EdgeCounter => Some(Box::new(SimulatedCounter {
                bench: self.voltages.clone(),
                clock: IonClock::new(self.model.clone(), self.pulse_rate),
                running: false,
                last_read: Instant::now(),
                total: 0,
            })),
            _ => None,
        };
        Devices::new(Box::new(hv), Box::new(pulser), counter)
    }

    /// Acquisition producer streaming synthetic events into `senders` until stopped
    pub fn acquisition(&self, senders: EventSenders) -> ThreadAcquisition {
        let bench = self.voltages.clone();
        let mut clock = IonClock::new(self.model.clone(), self.pulse_rate);
        let interval = self.batch_interval;
        let mode = senders.mode();
        ThreadAcquisition::spawn(&format!("simulated {mode}"), move |mut stop| {
            let mut rng = Lcg(0x5eed);
            let mut start_counter = 0;
            let mut last = Instant::now();
            while !stop.should_stop() {
                std::thread::sleep(interval);
                let now = Instant::now();
                let n_ions = clock.advance(bench.specimen(), now - last);
                last = now;
                if n_ions == 0 {
                    continue;
                }
                let record = synthesize_record(mode, n_ions, &mut rng, &mut start_counter);
                match senders.send_record(record) {
                    Ok(true) => (),
                    Ok(false) => break,
                    Err(e) => {
                        log::error!("Simulated acquisition produced a bad record: {e}");
                        break;
                    }
                }
            }
            log::info!("Simulated acquisition stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::{event_queues, AcquisitionProcess, EventReceivers};

    #[test]
    fn test_detection_probability_is_clamped() {
        let model = EvaporationModel::default();
        assert_eq!(model.detection_probability(1000.0), 0.0);
        assert!((model.detection_probability(3000.0) - 0.005).abs() < 1e-12);
        assert_eq!(model.detection_probability(1.0e6), model.max_probability);
    }

    #[test]
    fn test_ion_clock_carries_fractions() {
        let model = EvaporationModel {
            onset_voltage: 0.0,
            probability_per_volt: 1.0e-3,
            max_probability: 1.0,
        };
        // 0.25 probability at 250 V, one pulse per second -> 0.25 ions per step
        let mut clock = IonClock::new(model, 1.0);
        let total: u64 = (0..8)
            .map(|_| clock.advance(250.0, Duration::from_secs(1)))
            .sum();
        assert_eq!(total, 2);
    }

    #[test]
    fn test_hv_set_point_drives_bench() {
        let config = Config::default();
        let bench = SimulatedBench::new(&config, EvaporationModel::default());
        let mut devices = bench.devices(AcquisitionMode::TdcPaired);
        devices.hv.send(&hv_commands::set_voltage(4321.5)).unwrap();
        assert_eq!(bench.voltages.specimen(), 4321.5);
        assert_eq!(
            devices.hv.send(hv_commands::QUERY_SETPOINT).unwrap(),
            Some(String::from("4321.500"))
        );
        devices.clean_up();
        assert!(bench.is_closed());
        assert!(devices.hv.send(hv_commands::OUTPUT_ON).is_err());
    }

    #[test]
    fn test_raw_records_have_four_entries_per_ion() {
        let mut rng = Lcg(1);
        let mut start = 0;
        match synthesize_record(AcquisitionMode::TdcRaw, 3, &mut rng, &mut start) {
            EventRecord::Raw(row) => {
                assert_eq!(row.len(), 3);
                assert!(row.iter().all(|c| c.len() == 12));
                assert_eq!(start, 3);
            }
            other => panic!("expected a raw record, got {}", other.kind()),
        }
    }

    #[test]
    fn test_simulated_acquisition_streams_and_stops() {
        let mut config = Config::default();
        config.vdc_min = 8000.0;
        let bench = SimulatedBench::new(&config, EvaporationModel::default());
        let (tx, rx) = event_queues(AcquisitionMode::TdcPaired).unwrap();
        let mut acquisition = bench.acquisition(tx);
        std::thread::sleep(Duration::from_millis(50));
        assert!(acquisition.request_stop());
        assert!(acquisition.join(Duration::from_secs(2)));
        acquisition.close();

        let receivers = match rx {
            EventReceivers::Paired(r) => r,
            _ => panic!("wrong receivers"),
        };
        let n_batches = receivers.column(0).try_iter().count();
        assert!(n_batches > 0);
    }
}
