//! State shared by one run.
//!
//! Ownership is split by writer:
//!
//! - [`RunState`] is owned by the main thread. The rate controller and the stop evaluator are
//!   the only readers and writers, so it needs no synchronization.
//! - [`SharedVoltages`] is written by the controller once per tick and read by the queue drains,
//!   which tag every event batch with the voltages in effect when it was drained.
//! - [`RunFlags`] carries the operator abort and the end-of-experiment signal across threads.
//! - [`RunControl`] is the handle given to a front end (abort, changing the experiment time).
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A voltage that can only be stepped upwards while it is inside its operating window.
///
/// A step is applied only if the current value is within `[floor, ceiling)` and the step
/// strictly increases the value. The value may end up above the ceiling after the last
/// step, after which it is frozen.
#[derive(Debug, Clone, PartialEq)]
pub struct VoltageRatchet {
    value: f64,
    floor: f64,
    ceiling: f64,
}

impl VoltageRatchet {
    pub fn new(start: f64, floor: f64, ceiling: f64) -> Self {
        Self {
            value: start,
            floor,
            ceiling,
        }
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn is_at_ceiling(&self) -> bool {
        self.value >= self.ceiling
    }

    /// Try to move by `delta`. Returns the new value if the ratchet moved.
    pub fn apply_step(&mut self, delta: f64) -> Option<f64> {
        if self.value < self.floor || self.value >= self.ceiling {
            return None;
        }
        let candidate = self.value + delta;
        if candidate > self.value {
            self.value = candidate;
            Some(candidate)
        } else {
            None
        }
    }
}

/// Specimen and pulse voltage published for the drain threads, stored as f64 bits
#[derive(Debug, Default)]
pub struct SharedVoltages {
    specimen: AtomicU64,
    pulse: AtomicU64,
}

impl SharedVoltages {
    pub fn new(specimen: f64, pulse: f64) -> Self {
        Self {
            specimen: AtomicU64::new(specimen.to_bits()),
            pulse: AtomicU64::new(pulse.to_bits()),
        }
    }

    pub fn publish(&self, specimen: f64, pulse: f64) {
        self.specimen.store(specimen.to_bits(), Ordering::Release);
        self.pulse.store(pulse.to_bits(), Ordering::Release);
    }

    pub fn specimen(&self) -> f64 {
        f64::from_bits(self.specimen.load(Ordering::Acquire))
    }

    pub fn pulse(&self) -> f64 {
        f64::from_bits(self.pulse.load(Ordering::Acquire))
    }
}

/// Cross-thread signals of one run
#[derive(Debug, Default)]
pub struct RunFlags {
    abort: AtomicBool,
    end_experiment: AtomicBool,
}

impl RunFlags {
    pub fn request_abort(&self) {
        self.abort.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    pub fn end_experiment(&self) {
        self.end_experiment.store(true, Ordering::SeqCst);
    }

    pub fn is_ended(&self) -> bool {
        self.end_experiment.load(Ordering::SeqCst)
    }
}

/// Front end handle on a running experiment. Cheap to clone.
#[derive(Debug, Clone)]
pub struct RunControl {
    flags: Arc<RunFlags>,
    ex_time: Arc<AtomicU64>,
}

impl RunControl {
    pub fn new(ex_time: u64) -> Self {
        Self {
            flags: Arc::new(RunFlags::default()),
            ex_time: Arc::new(AtomicU64::new(ex_time)),
        }
    }

    /// Ask the run to stop at the next tick
    pub fn abort(&self) {
        self.flags.request_abort();
    }

    /// Change the experiment time (seconds) of a running experiment
    pub fn set_ex_time(&self, seconds: u64) {
        self.ex_time.store(seconds, Ordering::SeqCst);
    }

    pub fn ex_time(&self) -> u64 {
        self.ex_time.load(Ordering::SeqCst)
    }

    pub fn flags(&self) -> &Arc<RunFlags> {
        &self.flags
    }
}

/// One row of per-tick telemetry
#[derive(Debug, Clone, PartialEq)]
pub struct TickRecord {
    pub iteration: u64,
    pub count_delta: i64,
    pub specimen_voltage: f64,
    pub pulse_voltage: f64,
    pub elapsed: f64,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

/// Append-only per-tick telemetry, one column per quantity
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Telemetry {
    pub high_voltage: Vec<f64>,
    pub pulse_voltage: Vec<f64>,
    pub num_events: Vec<i64>,
    pub time_counter: Vec<u64>,
    pub elapsed_time: Vec<f64>,
    pub time_h: Vec<u8>,
    pub time_m: Vec<u8>,
    pub time_s: Vec<u8>,
}

impl Telemetry {
    pub fn push(&mut self, record: &TickRecord) {
        self.high_voltage.push(record.specimen_voltage);
        self.pulse_voltage.push(record.pulse_voltage);
        self.num_events.push(record.count_delta);
        self.time_counter.push(record.iteration);
        self.elapsed_time.push(record.elapsed);
        self.time_h.push(record.hour);
        self.time_m.push(record.minute);
        self.time_s.push(record.second);
    }

    pub fn len(&self) -> usize {
        self.time_counter.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time_counter.is_empty()
    }

    /// Sum of the event deltas of the last `window` ticks
    pub fn recent_events(&self, window: usize) -> i64 {
        let start = self.num_events.len().saturating_sub(window);
        self.num_events[start..].iter().sum()
    }
}

/// The mutable record of a run, owned by the main thread
#[derive(Debug, Clone)]
pub struct RunState {
    pub specimen_voltage: VoltageRatchet,
    pub pulse_voltage: f64,
    pub total_ions: u64,
    pub count_last: u64,
    pub count_delta: i64,
    pub avg_count_rate: f64,
    pub elapsed: Duration,
    pub iteration: u64,
    pub telemetry: Telemetry,
}

impl RunState {
    /// The state at the start of a run: specimen at its minimum, pulse at its minimum
    pub fn new(vdc_min: f64, vdc_max: f64, v_p_min: f64) -> Self {
        Self {
            specimen_voltage: VoltageRatchet::new(vdc_min, vdc_min, vdc_max),
            pulse_voltage: v_p_min,
            total_ions: 0,
            count_last: 0,
            count_delta: 0,
            avg_count_rate: 0.0,
            elapsed: Duration::ZERO,
            iteration: 0,
            telemetry: Telemetry::default(),
        }
    }

    pub fn specimen(&self) -> f64 {
        self.specimen_voltage.value()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ratchet_only_moves_up() {
        let mut ratchet = VoltageRatchet::new(1000.0, 1000.0, 2000.0);
        assert_eq!(ratchet.apply_step(10.0), Some(1010.0));
        assert_eq!(ratchet.apply_step(-5.0), None);
        assert_eq!(ratchet.apply_step(0.0), None);
        assert_eq!(ratchet.value(), 1010.0);
    }

    #[test]
    fn test_ratchet_freezes_at_ceiling() {
        let mut ratchet = VoltageRatchet::new(1990.0, 1000.0, 2000.0);
        // The last step may overshoot
        assert_eq!(ratchet.apply_step(25.0), Some(2015.0));
        assert!(ratchet.is_at_ceiling());
        assert_eq!(ratchet.apply_step(25.0), None);
        assert_eq!(ratchet.value(), 2015.0);
    }

    #[test]
    fn test_ratchet_below_floor_does_not_move() {
        let mut ratchet = VoltageRatchet::new(500.0, 1000.0, 2000.0);
        assert_eq!(ratchet.apply_step(100.0), None);
    }

    #[test]
    fn test_shared_voltages_round_trip_bits() {
        let shared = SharedVoltages::new(0.0, 0.0);
        shared.publish(4321.125, 864.225);
        assert_eq!(shared.specimen(), 4321.125);
        assert_eq!(shared.pulse(), 864.225);
    }

    #[test]
    fn test_recent_events_window() {
        let mut telemetry = Telemetry::default();
        for (i, delta) in [1, 2, 3, 4].iter().enumerate() {
            telemetry.push(&TickRecord {
                iteration: i as u64,
                count_delta: *delta,
                specimen_voltage: 0.0,
                pulse_voltage: 0.0,
                elapsed: 0.0,
                hour: 0,
                minute: 0,
                second: 0,
            });
        }
        assert_eq!(telemetry.recent_events(2), 7);
        assert_eq!(telemetry.recent_events(10), 10);
        assert_eq!(telemetry.len(), 4);
    }

    #[test]
    fn test_run_control_shares_flags() {
        let control = RunControl::new(60);
        let other = control.clone();
        other.abort();
        other.set_ex_time(120);
        assert!(control.flags().is_aborted());
        assert_eq!(control.ex_time(), 120);
    }
}
