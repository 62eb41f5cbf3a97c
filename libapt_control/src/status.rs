use super::controller::ControllerState;

/// Progress of a running experiment, sent to the front end once per tick
#[derive(Debug, Clone, PartialEq)]
pub struct ExperimentStatus {
    pub state: ControllerState,
    pub iteration: u64,
    pub total_ions: u64,
    pub specimen_voltage: f64,
    pub pulse_voltage: f64,
    pub elapsed: f64,
    /// Fraction of the run done, by whichever of ions or time is a stop criterion
    pub progress: f32,
}

