use std::time::Duration;

use super::config::{Config, Timing};
use super::constants::{FAST_RAMP_FACTOR, FAST_RAMP_VOLTAGE_LIMIT, SLOW_RATE_THRESHOLD};
use super::devices::{hv_commands, pulser_commands, Devices, HighVoltageSupply, Pulser};
use super::error::DeviceError;
use super::run_state::{RunState, TickRecord};

/// Lifecycle of the rate controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    WarmingUp,
    Running,
    Draining,
    Terminated,
}

/// RateController is the proportional detection-rate controller.
///
/// Each tick it turns the latest cumulative ion count into a smoothed count rate, compares it
/// to the target rate per pulse, and steps the specimen voltage up by an amount proportional
/// to the error. The specimen voltage is a ratchet so a negative error only slows the ramp.
/// The pulse voltage follows the specimen voltage at a fixed fraction.
#[derive(Debug, Clone)]
pub struct RateController {
    state: ControllerState,
    ex_freq: f64,
    cycle_avg: usize,
    pulse_frequency: f64,
    counts_target: f64,
    vdc_step_up: f64,
    vdc_step_down: f64,
    pulse_fraction: f64,
    pulse_amp_per_supply_voltage: f64,
    pulse_supply_min: f64,
    pulse_supply_max: f64,
}

impl RateController {
    pub fn new(config: &Config) -> Self {
        let (pulse_supply_min, pulse_supply_max) = config.pulse_supply_bounds();
        Self {
            state: ControllerState::Idle,
            ex_freq: config.ex_freq as f64,
            cycle_avg: config.cycle_avg.max(1),
            pulse_frequency: config.pulse_frequency,
            counts_target: config.counts_target(),
            vdc_step_up: config.vdc_step_up,
            vdc_step_down: config.vdc_step_down,
            pulse_fraction: config.pulse_fraction,
            pulse_amp_per_supply_voltage: config.pulse_amp_per_supply_voltage,
            pulse_supply_min,
            pulse_supply_max,
        }
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    /// Switch the outputs on and wait for the hardware to settle. One shot, from Idle.
    pub fn warm_up(&mut self, devices: &mut Devices, timing: &Timing) -> Result<(), DeviceError> {
        if self.state != ControllerState::Idle {
            log::warn!("Warm up requested in state {:?}; ignoring", self.state);
            return Ok(());
        }
        self.state = ControllerState::WarmingUp;

        devices.pulser.write(pulser_commands::OUTPUT_ON)?;
        std::thread::sleep(Duration::from_millis(timing.pulser_settle_ms));
        if devices.hv.send(hv_commands::OUTPUT_ON)?.is_none() {
            log::debug!("HV supply did not acknowledge output on");
        }
        std::thread::sleep(Duration::from_millis(timing.hv_settle_ms));
        if let Some(counter) = devices.counter.as_mut() {
            counter.start()?;
            log::info!("Edge counter started");
        }
        std::thread::sleep(Duration::from_millis(timing.warmup_ms));

        self.state = ControllerState::Running;
        Ok(())
    }

    /// Smoothed count rate: the mean ion delta over the averaging window, in ions per second
    fn average_count_rate(&self, state: &RunState, count_delta: i64) -> f64 {
        let window_sum = state.telemetry.recent_events(self.cycle_avg - 1) + count_delta;
        self.ex_freq * (window_sum as f64 / self.cycle_avg as f64)
    }

    /// Proportional voltage step for a smoothed count rate at a given specimen voltage
    pub fn voltage_step(&self, avg_count_rate: f64, specimen_voltage: f64) -> f64 {
        let pulses = 1.0 + self.pulse_frequency * 1000.0;
        let counts_measured = avg_count_rate / pulses;
        let counts_error = self.counts_target - counts_measured;

        let rate = (avg_count_rate * 100.0) / pulses;
        let ramp_speed_factor =
            if rate < SLOW_RATE_THRESHOLD && specimen_voltage < FAST_RAMP_VOLTAGE_LIMIT {
                FAST_RAMP_FACTOR
            } else {
                1.0
            };

        if counts_error > 0.0 {
            counts_error * self.vdc_step_up * ramp_speed_factor
        } else {
            counts_error * self.vdc_step_down * ramp_speed_factor
        }
    }

    /// Pulser supply voltage for a specimen voltage, if it is inside the pulser's bounds
    pub fn pulse_supply_for(&self, specimen_voltage: f64) -> Option<f64> {
        let supply =
            specimen_voltage * self.pulse_fraction * (1.0 / self.pulse_amp_per_supply_voltage);
        if supply > self.pulse_supply_min && supply < self.pulse_supply_max {
            Some(supply)
        } else {
            None
        }
    }

    /// Run one control period.
    ///
    /// `total_ions` is the latest cumulative count, or None when the source does not count
    /// ions (the delta is then zero). Device failures and silence are logged and leave the
    /// corresponding value unchanged for this tick.
    pub fn advance_tick(
        &mut self,
        state: &mut RunState,
        total_ions: Option<u64>,
        hv: &mut dyn HighVoltageSupply,
        pulser: &mut dyn Pulser,
        wall_clock: time::Time,
        elapsed: Duration,
    ) -> TickRecord {
        if let Some(total) = total_ions {
            state.total_ions = total;
        }
        let total = total_ions.unwrap_or(state.count_last);
        let count_delta = total as i64 - state.count_last as i64;
        state.count_last = total;
        state.count_delta = count_delta;
        state.avg_count_rate = self.average_count_rate(state, count_delta);

        let step = self.voltage_step(state.avg_count_rate, state.specimen());
        if let Some(specimen) = state.specimen_voltage.apply_step(step) {
            match hv.send(&hv_commands::set_voltage(specimen)) {
                Ok(_) => (),
                Err(e) => log::warn!("HV update to {specimen:.3} V not confirmed: {e}"),
            }
        }

        if let Some(supply) = self.pulse_supply_for(state.specimen()) {
            match pulser.write(&pulser_commands::set_voltage(supply)) {
                Ok(()) => state.pulse_voltage = supply * self.pulse_amp_per_supply_voltage,
                Err(e) => log::warn!("Pulser update to {supply:.3} V failed: {e}"),
            }
        }

        state.elapsed = elapsed;
        let record = TickRecord {
            iteration: state.iteration,
            count_delta,
            specimen_voltage: state.specimen(),
            pulse_voltage: state.pulse_voltage,
            elapsed: elapsed.as_secs_f64(),
            hour: wall_clock.hour(),
            minute: wall_clock.minute(),
            second: wall_clock.second(),
        };
        state.telemetry.push(&record);
        state.iteration += 1;
        record
    }

    pub fn begin_draining(&mut self) {
        self.state = ControllerState::Draining;
    }

    pub fn terminate(&mut self) {
        self.state = ControllerState::Terminated;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingHv {
        commands: Vec<String>,
        fail: bool,
    }

    impl HighVoltageSupply for RecordingHv {
        fn send(&mut self, command: &str) -> Result<Option<String>, DeviceError> {
            self.commands.push(command.to_string());
            if self.fail {
                Err(DeviceError::Closed(String::from("hv")))
            } else {
                Ok(None)
            }
        }
        fn close(&mut self) {}
    }

    #[derive(Default)]
    struct RecordingPulser {
        commands: Vec<String>,
    }

    impl Pulser for RecordingPulser {
        fn write(&mut self, command: &str) -> Result<(), DeviceError> {
            self.commands.push(command.to_string());
            Ok(())
        }
        fn query(&mut self, _command: &str) -> Result<Option<String>, DeviceError> {
            Ok(None)
        }
        fn close(&mut self) {}
    }

    fn scenario_config() -> Config {
        let mut config = Config::default();
        config.detection_rate = 1.0;
        config.pulse_frequency = 200.0;
        config.cycle_avg = 10;
        config.ex_freq = 10;
        config.vdc_min = 1000.0;
        config.vdc_max = 9000.0;
        config.vdc_step_up = 100.0;
        config.vdc_step_down = 100.0;
        config.v_p_min = 10.0;
        config.v_p_max = 5000.0;
        config.pulse_fraction = 0.2;
        config.pulse_amp_per_supply_voltage = 20.0;
        config
    }

    fn tick(
        controller: &mut RateController,
        state: &mut RunState,
        total: Option<u64>,
        hv: &mut RecordingHv,
        pulser: &mut RecordingPulser,
    ) -> TickRecord {
        controller.advance_tick(
            state,
            total,
            hv,
            pulser,
            time::Time::MIDNIGHT,
            Duration::from_millis(100 * state.iteration),
        )
    }

    #[test]
    fn test_zero_events_ramp_voltage_up() {
        let config = scenario_config();
        let mut controller = RateController::new(&config);
        let mut state = RunState::new(config.vdc_min, config.vdc_max, config.v_p_min);
        let mut hv = RecordingHv::default();
        let mut pulser = RecordingPulser::default();

        let mut last = state.specimen();
        for _ in 0..20 {
            let record = tick(&mut controller, &mut state, Some(0), &mut hv, &mut pulser);
            assert!(record.specimen_voltage > last);
            last = record.specimen_voltage;
        }
        // error = 0.01, gain 100, fast ramp 2.5 -> 2.5 V per tick
        assert!((state.specimen() - (1000.0 + 20.0 * 2.5)).abs() < 1e-9);
        assert_eq!(hv.commands.len(), 20);
        assert_eq!(hv.commands[0], ">S0 1002.500");
    }

    #[test]
    fn test_voltage_never_decreases_when_rate_is_too_high() {
        let config = scenario_config();
        let mut controller = RateController::new(&config);
        let mut state = RunState::new(config.vdc_min, config.vdc_max, config.v_p_min);
        let mut hv = RecordingHv::default();
        let mut pulser = RecordingPulser::default();

        let mut total = 0;
        let mut last = state.specimen();
        for i in 0..40 {
            // Bursts far above the target rate, then silence
            total += if i < 20 { 100_000 } else { 0 };
            let record = tick(&mut controller, &mut state, Some(total), &mut hv, &mut pulser);
            assert!(record.specimen_voltage >= last);
            last = record.specimen_voltage;
        }
    }

    #[test]
    fn test_error_zero_gives_zero_step() {
        let config = scenario_config();
        let controller = RateController::new(&config);
        let pulses = 1.0 + config.pulse_frequency * 1000.0;
        let avg_at_target = config.counts_target() * pulses;
        let step = controller.voltage_step(avg_at_target, 6000.0);
        assert!(step.abs() < 1e-9);
    }

    #[test]
    fn test_fast_ramp_only_below_voltage_limit() {
        let config = scenario_config();
        let controller = RateController::new(&config);
        let slow = controller.voltage_step(0.0, 4999.0);
        let normal = controller.voltage_step(0.0, 5000.0);
        assert!((slow / normal - 2.5).abs() < 1e-12);
    }

    #[test]
    fn test_pulse_follows_specimen_voltage() {
        let config = scenario_config();
        let mut controller = RateController::new(&config);
        let mut state = RunState::new(config.vdc_min, config.vdc_max, config.v_p_min);
        let mut hv = RecordingHv::default();
        let mut pulser = RecordingPulser::default();
        tick(&mut controller, &mut state, Some(0), &mut hv, &mut pulser);

        let expected_supply = state.specimen() * 0.2 / 20.0;
        assert_eq!(
            pulser.commands[0],
            pulser_commands::set_voltage(expected_supply)
        );
        assert!((state.pulse_voltage - state.specimen() * 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_pulse_out_of_bounds_is_retained() {
        let mut config = scenario_config();
        // Supply for 1000 V is 10 V which is above this ceiling
        config.v_p_max = 100.0;
        let mut controller = RateController::new(&config);
        let mut state = RunState::new(config.vdc_min, config.vdc_max, config.v_p_min);
        let mut hv = RecordingHv::default();
        let mut pulser = RecordingPulser::default();
        tick(&mut controller, &mut state, Some(0), &mut hv, &mut pulser);
        assert!(pulser.commands.is_empty());
        assert_eq!(state.pulse_voltage, config.v_p_min);
    }

    #[test]
    fn test_hv_failure_is_not_fatal() {
        let config = scenario_config();
        let mut controller = RateController::new(&config);
        let mut state = RunState::new(config.vdc_min, config.vdc_max, config.v_p_min);
        let mut hv = RecordingHv {
            fail: true,
            ..Default::default()
        };
        let mut pulser = RecordingPulser::default();
        let record = tick(&mut controller, &mut state, Some(0), &mut hv, &mut pulser);
        assert_eq!(record.iteration, 0);
        assert_eq!(state.telemetry.len(), 1);
    }

    #[test]
    fn test_missing_ion_count_keeps_totals() {
        let config = scenario_config();
        let mut controller = RateController::new(&config);
        let mut state = RunState::new(config.vdc_min, config.vdc_max, config.v_p_min);
        let mut hv = RecordingHv::default();
        let mut pulser = RecordingPulser::default();
        tick(&mut controller, &mut state, Some(5), &mut hv, &mut pulser);
        let record = tick(&mut controller, &mut state, None, &mut hv, &mut pulser);
        assert_eq!(record.count_delta, 0);
        assert_eq!(state.total_ions, 5);
        assert_eq!(state.telemetry.num_events, vec![5, 0]);
    }
}
