//! Device adapters used by the control loop.
//!
//! Every adapter is a thin synchronous command/response wrapper. The loop only ever needs the
//! few operations of the traits below; anything that answers them (a serial instrument, the
//! simulator, a test double) can drive a run.
use std::io::{Read, Write};
use std::time::Duration;

use serialport::SerialPort;

use super::config::Config;
use super::constants::{HV_RAMP_RATE, HV_TERMINATOR, PULSER_TERMINATOR};
use super::error::DeviceError;

/// Command strings understood by the HV supply
pub mod hv_commands {
    use super::HV_RAMP_RATE;

    pub const OUTPUT_ON: &str = "F1";
    pub const OUTPUT_OFF: &str = "F0";
    pub const QUERY_SETPOINT: &str = ">S0?";
    pub const QUERY_OUTPUT: &str = ">DON?";
    pub const QUERY_ACTUAL: &str = ">S0A?";

    pub fn set_voltage(volts: f64) -> String {
        format!(">S0 {volts:.3}")
    }

    pub fn set_ramp_rate(rate: &str) -> String {
        format!(">S1 {rate}")
    }

    /// Sequence sent once after the port is opened
    pub fn initialize(vdc_min: f64) -> Vec<String> {
        vec![
            set_ramp_rate(HV_RAMP_RATE),
            String::from(">S0B 0"),
            set_voltage(vdc_min),
            String::from(OUTPUT_OFF),
            String::from(QUERY_SETPOINT),
            String::from(QUERY_OUTPUT),
            String::from(QUERY_ACTUAL),
        ]
    }
}

/// Command strings understood by the pulser
pub mod pulser_commands {
    pub const RESET: &str = "*RST";
    pub const QUERY_VOLTAGE: &str = "VOLT?";
    pub const OUTPUT_ON: &str = "OUTPut ON";
    pub const OUTPUT_OFF: &str = "OUTPut OFF";

    pub fn set_voltage(volts: f64) -> String {
        format!("VOLT {volts:.3}")
    }
}

/// The specimen high voltage supply.
///
/// `send` returns `Ok(None)` when the device did not answer within its poll window. Callers
/// treat that as "no new data", never as a failure.
pub trait HighVoltageSupply: Send {
    fn send(&mut self, command: &str) -> Result<Option<String>, DeviceError>;
    fn close(&mut self);
}

/// The pulse generator supply
pub trait Pulser: Send {
    fn write(&mut self, command: &str) -> Result<(), DeviceError>;
    fn query(&mut self, command: &str) -> Result<Option<String>, DeviceError>;
    fn close(&mut self);
}

/// A hardware counter of detector edges
pub trait EdgeCounter: Send {
    fn start(&mut self) -> Result<(), DeviceError>;
    /// Total number of edges counted since `start`
    fn read(&mut self) -> Result<u64, DeviceError>;
    fn stop(&mut self) -> Result<(), DeviceError>;
    fn close(&mut self);
}

/// Write a command with its terminator, wait, then collect whatever line the device sent back
fn serial_exchange(
    port: &mut Box<dyn SerialPort>,
    name: &str,
    command: &str,
    terminator: &str,
    response_delay: Duration,
) -> Result<Option<String>, DeviceError> {
    let cmd = format!("{command}{terminator}");
    log::trace!("Sending command to {}: '{}'", name, cmd.escape_default());
    port.write_all(cmd.as_bytes())
        .map_err(|e| DeviceError::IOError(name.to_string(), e))?;
    std::thread::sleep(response_delay);

    let mut response = String::new();
    let mut buffer = [0u8; 256];
    loop {
        let waiting = match port.bytes_to_read() {
            Ok(n) => n,
            Err(e) => {
                log::debug!("{name} could not report pending bytes: {e}");
                0
            }
        };
        if waiting == 0 {
            break;
        }
        match port.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => response.push_str(&String::from_utf8_lossy(&buffer[..n])),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => break,
            Err(e) => return Err(DeviceError::IOError(name.to_string(), e)),
        }
    }

    // Only the last complete line is the answer to this command
    let line = response
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .last()
        .map(String::from);
    log::trace!("Received response from {}: {:?}", name, line);
    Ok(line)
}

fn open_port(port_name: &str, baud: u32) -> Result<Box<dyn SerialPort>, DeviceError> {
    serialport::new(port_name, baud)
        .data_bits(serialport::DataBits::Eight)
        .parity(serialport::Parity::None)
        .stop_bits(serialport::StopBits::One)
        .timeout(Duration::from_millis(10))
        .open()
        .map_err(|e| DeviceError::OpenFailed(port_name.to_string(), e))
}

/// HV supply on a line-oriented serial port (CRLF terminated)
pub struct SerialHvSupply {
    name: String,
    port: Option<Box<dyn SerialPort>>,
    response_delay: Duration,
}

impl SerialHvSupply {
    /// Open the port. Failing to open is a configuration error of the run.
    pub fn open(config: &Config) -> Result<Self, DeviceError> {
        let mut port = open_port(&config.hv_port, config.hv_baud)?;
        // Stale bytes from a previous session would be read as replies
        if let Err(e) = port.clear(serialport::ClearBuffer::All) {
            log::warn!("Could not flush HV port {}: {e}", config.hv_port);
        }
        Ok(Self {
            name: config.hv_port.clone(),
            port: Some(port),
            response_delay: Duration::from_millis(config.timing.serial_response_ms),
        })
    }
}

impl HighVoltageSupply for SerialHvSupply {
    fn send(&mut self, command: &str) -> Result<Option<String>, DeviceError> {
        match self.port.as_mut() {
            Some(port) => serial_exchange(
                port,
                &self.name,
                command,
                HV_TERMINATOR,
                self.response_delay,
            ),
            None => Err(DeviceError::Closed(self.name.clone())),
        }
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            log::info!("Closed HV supply port {}", self.name);
        }
    }
}

/// SCPI pulser on a serial port (newline terminated)
pub struct SerialPulser {
    name: String,
    port: Option<Box<dyn SerialPort>>,
    response_delay: Duration,
}

impl SerialPulser {
    pub fn open(config: &Config) -> Result<Self, DeviceError> {
        Ok(Self {
            name: config.pulser_port.clone(),
            port: Some(open_port(&config.pulser_port, config.pulser_baud)?),
            response_delay: Duration::from_millis(config.timing.serial_response_ms),
        })
    }
}

impl Pulser for SerialPulser {
    fn write(&mut self, command: &str) -> Result<(), DeviceError> {
        match self.port.as_mut() {
            Some(port) => {
                let cmd = format!("{command}{PULSER_TERMINATOR}");
                log::trace!("Sending command to {}: '{}'", self.name, cmd.escape_default());
                port.write_all(cmd.as_bytes())
                    .map_err(|e| DeviceError::IOError(self.name.clone(), e))
            }
            None => Err(DeviceError::Closed(self.name.clone())),
        }
    }

    fn query(&mut self, command: &str) -> Result<Option<String>, DeviceError> {
        match self.port.as_mut() {
            Some(port) => serial_exchange(
                port,
                &self.name,
                command,
                PULSER_TERMINATOR,
                self.response_delay,
            ),
            None => Err(DeviceError::Closed(self.name.clone())),
        }
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            log::info!("Closed pulser port {}", self.name);
        }
    }
}

/// All device adapters of a run. Opened once before the run; cleaned up exactly once.
pub struct Devices {
    pub hv: Box<dyn HighVoltageSupply>,
    pub pulser: Box<dyn Pulser>,
    pub counter: Option<Box<dyn EdgeCounter>>,
    cleaned_up: bool,
}

impl Devices {
    pub fn new(
        hv: Box<dyn HighVoltageSupply>,
        pulser: Box<dyn Pulser>,
        counter: Option<Box<dyn EdgeCounter>>,
    ) -> Self {
        Self {
            hv,
            pulser,
            counter,
            cleaned_up: false,
        }
    }

    /// Open the serial HV supply and pulser named in the config
    pub fn open_serial(
        config: &Config,
        counter: Option<Box<dyn EdgeCounter>>,
    ) -> Result<Self, DeviceError> {
        let hv = SerialHvSupply::open(config)?;
        log::info!("HV supply opened on {}", config.hv_port);
        let pulser = SerialPulser::open(config)?;
        log::info!("Pulser opened on {}", config.pulser_port);
        Ok(Self::new(Box::new(hv), Box::new(pulser), counter))
    }

    /// Bring the supplies to their start values. Outputs stay off.
    pub fn initialize(&mut self, config: &Config) -> Result<(), DeviceError> {
        for cmd in hv_commands::initialize(config.vdc_min) {
            match self.hv.send(&cmd)? {
                Some(response) => log::debug!("HV {cmd} -> {response}"),
                None => log::debug!("HV {cmd} -> no response"),
            }
        }
        log::info!("High voltage is initialized");

        // A reset has no reply
        self.pulser.write(pulser_commands::RESET)?;
        let (supply_min, _) = config.pulse_supply_bounds();
        self.pulser.write(&pulser_commands::set_voltage(supply_min))?;
        match self.pulser.query(pulser_commands::QUERY_VOLTAGE)? {
            Some(response) => log::debug!("Pulser voltage -> {response}"),
            None => log::debug!("Pulser voltage -> no response"),
        }
        log::info!("Pulser is initialized");
        Ok(())
    }

    /// Switch everything off and release the handles. Safe to call more than once; only the
    /// first call talks to the devices. Failures are logged since clean-up must finish.
    pub fn clean_up(&mut self) {
        if self.cleaned_up {
            return;
        }
        self.cleaned_up = true;
        log::info!("Starting to clean up devices");

        if let Err(e) = self.hv.send(hv_commands::OUTPUT_OFF) {
            log::error!("Could not switch off the HV output: {e}");
        }
        self.hv.close();

        if let Err(e) = self.pulser.write(&pulser_commands::set_voltage(0.0)) {
            log::error!("Could not zero the pulser: {e}");
        }
        if let Err(e) = self.pulser.write(pulser_commands::OUTPUT_OFF) {
            log::error!("Could not switch off the pulser output: {e}");
        }
        self.pulser.close();

        if let Some(counter) = self.counter.as_mut() {
            if let Err(e) = counter.stop() {
                log::error!("Could not stop the edge counter: {e}");
            }
            counter.close();
        }
        log::info!("Clean up is finished");
    }
}

impl Drop for Devices {
    fn drop(&mut self) {
        self.clean_up();
    }
}
