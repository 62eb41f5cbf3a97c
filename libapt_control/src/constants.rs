// Controller calibration
/// Below this smoothed detection rate (in %) the voltage ramp is accelerated
pub const SLOW_RATE_THRESHOLD: f64 = 0.01;
/// The accelerated ramp only applies while the specimen is below this voltage (V)
pub const FAST_RAMP_VOLTAGE_LIMIT: f64 = 5000.0;
/// Ramp speed multiplier used during the initial voltage rise
pub const FAST_RAMP_FACTOR: f64 = 2.5;
/// The voltage ceiling must hold for this many seconds worth of ticks before the run stops
pub const VDC_DEBOUNCE_SECONDS: u64 = 10;
/// Highest control loop frequency accepted (Hz)
pub const MAX_EX_FREQ: u64 = 1000;

// Event records
/// Number of raw TDC channel entries that make up one detected ion
pub const RAW_EVENTS_PER_ION: u64 = 4;
/// Number of waveform channels read out by the digitizer
pub const WAVEFORM_CHANNELS: usize = 4;

// Serial devices
pub const HV_DEFAULT_BAUD: u32 = 115_200;
pub const PULSER_DEFAULT_BAUD: u32 = 9_600;
pub const HV_TERMINATOR: &str = "\r\n";
pub const PULSER_TERMINATOR: &str = "\n";
/// HV supply ramp rate set at initialization
pub const HV_RAMP_RATE: &str = "3.0e-4";

// Run counter
/// Value of the run counter when no counter file exists yet
pub const FIRST_RUN_NUMBER: u64 = 1;
