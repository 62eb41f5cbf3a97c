use std::fmt::Display;

use super::config::Config;
use super::run_state::{RunControl, RunState};

/// Why a run left its tick loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    UserAbort,
    IonCountReached,
    VoltageCeilingReached,
    TimeElapsed,
}

impl Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UserAbort => write!(f, "aborted by the operator"),
            Self::IonCountReached => write!(f, "ion count reached"),
            Self::VoltageCeilingReached => write!(f, "maximum specimen voltage reached"),
            Self::TimeElapsed => write!(f, "experiment time elapsed"),
        }
    }
}

/// StopEvaluator decides after every tick whether the run is over.
///
/// Criteria are checked in a fixed order: operator abort, ion count, voltage ceiling, time.
/// The voltage ceiling must hold for `ex_freq * 10` further ticks before it stops the run,
/// and its counter is never reset. Once a reason has fired it is returned again on every
/// later call and no counter moves.
#[derive(Debug)]
pub struct StopEvaluator {
    control: RunControl,
    ex_freq: u64,
    criteria_ions: bool,
    max_ions: u64,
    criteria_vdc: bool,
    vdc_max: f64,
    debounce_ticks: u64,
    criteria_time: bool,
    vdc_debounce: u64,
    budget_extension: u64,
    fired: Option<StopReason>,
}

impl StopEvaluator {
    pub fn new(config: &Config, control: RunControl) -> Self {
        Self {
            control,
            ex_freq: config.ex_freq,
            criteria_ions: config.criteria_ions,
            max_ions: config.max_ions,
            criteria_vdc: config.criteria_vdc,
            vdc_max: config.vdc_max,
            debounce_ticks: config.vdc_debounce_ticks(),
            criteria_time: config.criteria_time,
            vdc_debounce: 0,
            budget_extension: 0,
            fired: None,
        }
    }

    pub fn fired(&self) -> Option<StopReason> {
        self.fired
    }

    /// Ticks the run may last, from the current experiment time plus any extension
    pub fn tick_budget(&self) -> u64 {
        self.control
            .ex_time()
            .saturating_mul(self.ex_freq)
            .saturating_add(self.budget_extension)
    }

    /// Evaluate the criteria after a completed tick. `state.iteration` is the number of
    /// completed ticks.
    pub fn evaluate(&mut self, state: &RunState) -> Option<StopReason> {
        if self.fired.is_some() {
            return self.fired;
        }

        let reason = self.check(state);
        if let Some(reason) = reason {
            log::info!(
                "Stopping after {} ticks: {} (ions {}, specimen voltage {:.3} V)",
                state.iteration,
                reason,
                state.total_ions,
                state.specimen()
            );
            self.fired = Some(reason);
        }
        reason
    }

    fn check(&mut self, state: &RunState) -> Option<StopReason> {
        if self.control.flags().is_aborted() {
            return Some(StopReason::UserAbort);
        }

        if self.criteria_ions && state.total_ions >= self.max_ions {
            return Some(StopReason::IonCountReached);
        }

        if self.criteria_vdc && state.specimen() >= self.vdc_max {
            if self.vdc_debounce >= self.debounce_ticks {
                return Some(StopReason::VoltageCeilingReached);
            }
            self.vdc_debounce += 1;
        }

        if state.iteration >= self.tick_budget() {
            if self.criteria_time {
                return Some(StopReason::TimeElapsed);
            }
            self.budget_extension += 1;
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        let mut config = Config::default();
        config.ex_freq = 10;
        config.ex_time = 5;
        config.vdc_min = 1000.0;
        config.vdc_max = 2000.0;
        config.max_ions = 100;
        config
    }

    fn state_at(iteration: u64, total_ions: u64, specimen: f64) -> RunState {
        let mut state = RunState::new(1000.0, 2000.0, 40.0);
        state.specimen_voltage = crate::run_state::VoltageRatchet::new(specimen, 1000.0, 2000.0);
        state.iteration = iteration;
        state.total_ions = total_ions;
        state
    }

    #[test]
    fn test_ceiling_stops_after_exact_debounce() {
        let config = config();
        let mut evaluator = StopEvaluator::new(&config, RunControl::new(1_000));
        let debounce = config.vdc_debounce_ticks();
        assert_eq!(debounce, 100);

        let mut ticks_at_ceiling = 0;
        let reason = loop {
            let state = state_at(ticks_at_ceiling + 1, 0, 2000.0);
            if let Some(reason) = evaluator.evaluate(&state) {
                break reason;
            }
            ticks_at_ceiling += 1;
            assert!(ticks_at_ceiling <= debounce, "ceiling never stopped the run");
        };
        assert_eq!(reason, StopReason::VoltageCeilingReached);
        assert_eq!(ticks_at_ceiling, debounce);
    }

    #[test]
    fn test_debounce_is_not_reset() {
        let config = config();
        let mut evaluator = StopEvaluator::new(&config, RunControl::new(1_000));
        for i in 0..60 {
            assert!(evaluator.evaluate(&state_at(i, 0, 2000.0)).is_none());
        }
        // Dropping below the ceiling keeps the counter
        assert!(evaluator.evaluate(&state_at(60, 0, 1500.0)).is_none());
        for i in 61..101 {
            assert!(evaluator.evaluate(&state_at(i, 0, 2000.0)).is_none());
        }
        assert_eq!(
            evaluator.evaluate(&state_at(101, 0, 2000.0)),
            Some(StopReason::VoltageCeilingReached)
        );
    }

    #[test]
    fn test_abort_has_priority_and_is_terminal() {
        let config = config();
        let control = RunControl::new(config.ex_time);
        let mut evaluator = StopEvaluator::new(&config, control.clone());
        control.abort();
        assert_eq!(
            evaluator.evaluate(&state_at(1_000, 500, 2000.0)),
            Some(StopReason::UserAbort)
        );
        // Terminal: same reason, no debounce progress
        assert_eq!(
            evaluator.evaluate(&state_at(1_001, 500, 2000.0)),
            Some(StopReason::UserAbort)
        );
        assert_eq!(evaluator.vdc_debounce, 0);
        assert_eq!(evaluator.fired(), Some(StopReason::UserAbort));
    }

    #[test]
    fn test_ion_count_criterion() {
        let mut config = config();
        let mut evaluator = StopEvaluator::new(&config, RunControl::new(config.ex_time));
        assert!(evaluator.evaluate(&state_at(1, 99, 1500.0)).is_none());
        assert_eq!(
            evaluator.evaluate(&state_at(2, 100, 1500.0)),
            Some(StopReason::IonCountReached)
        );

        config.criteria_ions = false;
        let mut evaluator = StopEvaluator::new(&config, RunControl::new(config.ex_time));
        assert!(evaluator.evaluate(&state_at(2, 100, 1500.0)).is_none());
    }

    #[test]
    fn test_time_budget() {
        let config = config();
        let mut evaluator = StopEvaluator::new(&config, RunControl::new(config.ex_time));
        assert!(evaluator.evaluate(&state_at(49, 0, 1500.0)).is_none());
        assert_eq!(
            evaluator.evaluate(&state_at(50, 0, 1500.0)),
            Some(StopReason::TimeElapsed)
        );
    }

    #[test]
    fn test_time_off_extends_budget() {
        let mut config = config();
        config.criteria_time = false;
        let mut evaluator = StopEvaluator::new(&config, RunControl::new(config.ex_time));
        for i in 0..200 {
            assert!(evaluator.evaluate(&state_at(i, 0, 1500.0)).is_none());
        }
        assert_eq!(evaluator.tick_budget(), 200);
    }

    #[test]
    fn test_huge_ex_time_saturates_the_budget() {
        let config = config();
        let control = RunControl::new(config.ex_time);
        let mut evaluator = StopEvaluator::new(&config, control.clone());
        control.set_ex_time(u64::MAX);
        assert_eq!(evaluator.tick_budget(), u64::MAX);
        assert!(evaluator.evaluate(&state_at(1_000_000, 0, 1500.0)).is_none());

        let mut config = config;
        config.criteria_time = false;
        let control = RunControl::new(u64::MAX);
        let mut evaluator = StopEvaluator::new(&config, control);
        assert!(evaluator.evaluate(&state_at(u64::MAX, 0, 1500.0)).is_none());
        assert_eq!(evaluator.tick_budget(), u64::MAX);
    }

    #[test]
    fn test_ex_time_change_moves_budget() {
        let config = config();
        let control = RunControl::new(config.ex_time);
        let mut evaluator = StopEvaluator::new(&config, control.clone());
        assert!(evaluator.evaluate(&state_at(30, 0, 1500.0)).is_none());
        control.set_ex_time(2);
        assert_eq!(evaluator.tick_budget(), 20);
        assert_eq!(
            evaluator.evaluate(&state_at(31, 0, 1500.0)),
            Some(StopReason::TimeElapsed)
        );
    }
}
