//! The boundary between the control loop and the acquisition backend.
//!
//! The acquisition backend (TDC or digitizer) runs isolated from the controller, normally as a
//! separate OS process since vendor libraries may block or are not thread-safe. It streams
//! event batches into typed queues, one queue per column, and listens on a one-slot stop
//! signal. Nothing else crosses the boundary.
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, SyncSender, TryRecvError, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::config::AcquisitionMode;
use super::constants::WAVEFORM_CHANNELS;
use super::error::AcquisitionError;

pub const DLD_COLUMNS: [&str; 4] = ["x", "y", "t", "start_counter"];
pub const TDC_COLUMNS: [&str; 3] = ["channel", "time_data", "start_counter"];
pub const DRS_COLUMNS: [&str; 2 * WAVEFORM_CHANNELS] = [
    "ch0_time", "ch0_wave", "ch1_time", "ch1_wave", "ch2_time", "ch2_wave", "ch3_time",
    "ch3_wave",
];

const STOP_TOKEN: &str = "stop";
const EMPTY_COLUMN: &str = "-";
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Producer side of a set of column queues
#[derive(Debug, Clone)]
pub struct ColumnSenders<T> {
    senders: Vec<Sender<Vec<T>>>,
}

impl<T> ColumnSenders<T> {
    /// Send one batch per column, in column order.
    /// Returns false once the consumer side is gone.
    pub fn send_row(&self, row: Vec<Vec<T>>) -> bool {
        for (sender, batch) in self.senders.iter().zip(row) {
            if sender.send(batch).is_err() {
                return false;
            }
        }
        true
    }

    pub fn n_columns(&self) -> usize {
        self.senders.len()
    }
}

/// Consumer side of a set of column queues
#[derive(Debug)]
pub struct ColumnReceivers<T> {
    receivers: Vec<Receiver<Vec<T>>>,
}

impl<T> ColumnReceivers<T> {
    pub fn n_columns(&self) -> usize {
        self.receivers.len()
    }

    pub fn column(&self, idx: usize) -> &Receiver<Vec<T>> {
        &self.receivers[idx]
    }
}

fn column_queues<T>(n_columns: usize) -> (ColumnSenders<T>, ColumnReceivers<T>) {
    let (senders, receivers) = (0..n_columns).map(|_| mpsc::channel::<Vec<T>>()).unzip();
    (ColumnSenders { senders }, ColumnReceivers { receivers })
}

/// Producer side of the queues of one acquisition mode
#[derive(Debug, Clone)]
pub enum EventSenders {
    Paired(ColumnSenders<i32>),
    Raw(ColumnSenders<i32>),
    Waveform(ColumnSenders<f32>),
}

/// Consumer side of the queues of one acquisition mode
#[derive(Debug)]
pub enum EventReceivers {
    Paired(ColumnReceivers<i32>),
    Raw(ColumnReceivers<i32>),
    Waveform(ColumnReceivers<f32>),
}

impl EventReceivers {
    pub fn mode(&self) -> AcquisitionMode {
        match self {
            Self::Paired(_) => AcquisitionMode::TdcPaired,
            Self::Raw(_) => AcquisitionMode::TdcRaw,
            Self::Waveform(_) => AcquisitionMode::Waveform,
        }
    }
}

/// Create the queues for a mode. The edge counter mode has no queues.
pub fn event_queues(
    mode: AcquisitionMode,
) -> Result<(EventSenders, EventReceivers), AcquisitionError> {
    match mode {
        AcquisitionMode::TdcPaired => {
            let (tx, rx) = column_queues(DLD_COLUMNS.len());
            Ok((EventSenders::Paired(tx), EventReceivers::Paired(rx)))
        }
        AcquisitionMode::TdcRaw => {
            let (tx, rx) = column_queues(TDC_COLUMNS.len());
            Ok((EventSenders::Raw(tx), EventReceivers::Raw(rx)))
        }
        AcquisitionMode::Waveform => {
            let (tx, rx) = column_queues(DRS_COLUMNS.len());
            Ok((EventSenders::Waveform(tx), EventReceivers::Waveform(rx)))
        }
        AcquisitionMode::EdgeCounter => Err(AcquisitionError::NoQueues(mode)),
    }
}

/// One decoded line of the acquisition stream: one batch per column
#[derive(Debug, Clone, PartialEq)]
pub enum EventRecord {
    Paired(Vec<Vec<i32>>),
    Raw(Vec<Vec<i32>>),
    Waveform(Vec<Vec<f32>>),
}

impl EventRecord {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Paired(_) => "dld",
            Self::Raw(_) => "tdc",
            Self::Waveform(_) => "drs",
        }
    }
}

fn parse_columns<T: std::str::FromStr>(
    fields: &[&str],
    n_columns: usize,
    line: &str,
) -> Result<Vec<Vec<T>>, AcquisitionError>
where
    AcquisitionError: From<T::Err>,
{
    if fields.len() != n_columns {
        return Err(AcquisitionError::BadRecord(line.to_string()));
    }
    let mut columns = Vec::with_capacity(n_columns);
    for field in fields {
        if *field == EMPTY_COLUMN {
            columns.push(Vec::new());
            continue;
        }
        let mut column = Vec::new();
        for value in field.split(',') {
            column.push(value.parse::<T>()?);
        }
        columns.push(column);
    }
    Ok(columns)
}

/// Decode a line of the form `<kind> <col> <col> ...`. Columns are comma separated values,
/// `-` marks an empty column.
pub fn decode_record(line: &str) -> Result<EventRecord, AcquisitionError> {
    let mut tokens = line.split_whitespace();
    let kind = tokens
        .next()
        .ok_or_else(|| AcquisitionError::BadRecord(line.to_string()))?;
    let fields: Vec<&str> = tokens.collect();
    match kind {
        "dld" => Ok(EventRecord::Paired(parse_columns(
            &fields,
            DLD_COLUMNS.len(),
            line,
        )?)),
        "tdc" => Ok(EventRecord::Raw(parse_columns(
            &fields,
            TDC_COLUMNS.len(),
            line,
        )?)),
        "drs" => Ok(EventRecord::Waveform(parse_columns(
            &fields,
            DRS_COLUMNS.len(),
            line,
        )?)),
        _ => Err(AcquisitionError::BadRecord(line.to_string())),
    }
}

impl EventSenders {
    pub fn mode(&self) -> AcquisitionMode {
        match self {
            Self::Paired(_) => AcquisitionMode::TdcPaired,
            Self::Raw(_) => AcquisitionMode::TdcRaw,
            Self::Waveform(_) => AcquisitionMode::Waveform,
        }
    }

    /// Forward a decoded record. Returns Ok(false) once the consumer side is gone.
    pub fn send_record(&self, record: EventRecord) -> Result<bool, AcquisitionError> {
        match (self, record) {
            (Self::Paired(tx), EventRecord::Paired(row)) => Ok(tx.send_row(row)),
            (Self::Raw(tx), EventRecord::Raw(row)) => Ok(tx.send_row(row)),
            (Self::Waveform(tx), EventRecord::Waveform(row)) => Ok(tx.send_row(row)),
            (_, record) => Err(AcquisitionError::WrongKind(
                record.kind().to_string(),
                self.mode(),
            )),
        }
    }
}

/// Control surface of a running acquisition backend
pub trait AcquisitionProcess: Send {
    fn name(&self) -> &str;
    /// Post the stop token. Non-blocking and best-effort; returns false if it was not posted.
    fn request_stop(&mut self) -> bool;
    /// Wait up to `timeout` for the backend to exit. Returns true if it exited.
    fn join(&mut self, timeout: Duration) -> bool;
    fn is_alive(&mut self) -> bool;
    /// Forcibly end the backend
    fn terminate(&mut self) -> Result<(), AcquisitionError>;
    /// Release everything held for the backend
    fn close(&mut self);
}

/// Acquisition backend running as a child process that writes one record per line on stdout
pub struct ChildAcquisition {
    name: String,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    reader: Option<JoinHandle<()>>,
}

impl ChildAcquisition {
    /// Start the program with its arguments and forward its stdout records into the senders
    pub fn spawn(command: &[String], senders: EventSenders) -> Result<Self, AcquisitionError> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| AcquisitionError::BadRecord(String::from("empty command line")))?;
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .map_err(AcquisitionError::SpawnFailed)?;
        let stdin = child.stdin.take();
        let stdout = child.stdout.take().ok_or_else(|| {
            AcquisitionError::SpawnFailed(std::io::Error::other("child has no stdout"))
        })?;

        let name = program.clone();
        let reader_name = name.clone();
        let reader = std::thread::spawn(move || {
            let mut n_records: u64 = 0;
            for line in BufReader::new(stdout).lines() {
                let line = match line {
                    Ok(l) => l,
                    Err(e) => {
                        log::error!("Reading from acquisition process {reader_name} failed: {e}");
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                let record = match decode_record(&line) {
                    Ok(r) => r,
                    Err(e) => {
                        log::warn!("Skipping record from {reader_name}: {e}");
                        continue;
                    }
                };
                match senders.send_record(record) {
                    Ok(true) => n_records += 1,
                    Ok(false) => break,
                    Err(e) => log::warn!("Skipping record from {reader_name}: {e}"),
                }
            }
            log::info!("Acquisition stream of {reader_name} ended after {n_records} records");
        });
        log::info!("Started acquisition process {name} (pid {})", child.id());

        Ok(Self {
            name,
            child: Some(child),
            stdin,
            reader: Some(reader),
        })
    }
}

impl AcquisitionProcess for ChildAcquisition {
    fn name(&self) -> &str {
        &self.name
    }

    fn request_stop(&mut self) -> bool {
        // The stop slot holds a single token; once posted the pipe is closed
        match self.stdin.take() {
            Some(mut stdin) => match writeln!(stdin, "{STOP_TOKEN}").and_then(|_| stdin.flush()) {
                Ok(()) => true,
                Err(e) => {
                    log::warn!("Could not post stop token to {}: {e}", self.name);
                    false
                }
            },
            None => false,
        }
    }

    fn join(&mut self, timeout: Duration) -> bool {
        let start = Instant::now();
        loop {
            if !self.is_alive() {
                return true;
            }
            if start.elapsed() >= timeout {
                return false;
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    fn is_alive(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    fn terminate(&mut self) -> Result<(), AcquisitionError> {
        if let Some(child) = self.child.as_mut() {
            child.kill()?;
            let status = child.wait()?;
            log::info!("Acquisition process {} killed ({status})", self.name);
        }
        Ok(())
    }

    fn close(&mut self) {
        self.stdin = None;
        if let Some(mut child) = self.child.take() {
            let reaped = match child.try_wait() {
                Ok(Some(_)) => Ok(()),
                Ok(None) => {
                    log::warn!(
                        "Acquisition process {} still running at close; killing it",
                        self.name
                    );
                    child.kill().and_then(|_| child.wait()).map(|_| ())
                }
                Err(e) => Err(e),
            };
            if let Err(e) = reaped {
                log::warn!("Could not reap acquisition process {}: {e}", self.name);
            }
        }
        if let Some(reader) = self.reader.take() {
            if reader.is_finished() {
                if reader.join().is_err() {
                    log::error!("Acquisition reader of {} panicked", self.name);
                }
            } else {
                log::warn!(
                    "Acquisition reader of {} still running; detaching it",
                    self.name
                );
            }
        }
    }
}

/// What an in-process producer sees of the stop signal
pub struct StopListener {
    stop_rx: Receiver<()>,
    kill: Arc<AtomicBool>,
    stopped: bool,
}

impl StopListener {
    /// True once the stop token was posted or the backend was terminated
    pub fn should_stop(&mut self) -> bool {
        if self.kill.load(Ordering::SeqCst) {
            return true;
        }
        if !self.stopped {
            self.stopped = matches!(
                self.stop_rx.try_recv(),
                Ok(()) | Err(TryRecvError::Disconnected)
            );
        }
        self.stopped
    }

    pub fn is_terminated(&self) -> bool {
        self.kill.load(Ordering::SeqCst)
    }
}

/// Acquisition backend running as a producer thread in this process.
///
/// A thread cannot be killed, so `terminate` raises a flag the producer must honor.
pub struct ThreadAcquisition {
    name: String,
    handle: Option<JoinHandle<()>>,
    stop_tx: SyncSender<()>,
    kill: Arc<AtomicBool>,
}

impl ThreadAcquisition {
    pub fn spawn<F>(name: &str, producer: F) -> Self
    where
        F: FnOnce(StopListener) + Send + 'static,
    {
        let (stop_tx, stop_rx) = mpsc::sync_channel::<()>(1);
        let kill = Arc::new(AtomicBool::new(false));
        let listener = StopListener {
            stop_rx,
            kill: kill.clone(),
            stopped: false,
        };
        let handle = std::thread::spawn(move || producer(listener));
        Self {
            name: name.to_string(),
            handle: Some(handle),
            stop_tx,
            kill,
        }
    }
}

impl AcquisitionProcess for ThreadAcquisition {
    fn name(&self) -> &str {
        &self.name
    }

    fn request_stop(&mut self) -> bool {
        match self.stop_tx.try_send(()) {
            Ok(()) => true,
            Err(TrySendError::Full(())) => false,
            Err(TrySendError::Disconnected(())) => false,
        }
    }

    fn join(&mut self, timeout: Duration) -> bool {
        let start = Instant::now();
        loop {
            if !self.is_alive() {
                return true;
            }
            if start.elapsed() >= timeout {
                return false;
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    fn is_alive(&mut self) -> bool {
        match self.handle.as_ref() {
            Some(handle) => !handle.is_finished(),
            None => false,
        }
    }

    fn terminate(&mut self) -> Result<(), AcquisitionError> {
        self.kill.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn close(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.is_finished() {
                if handle.join().is_err() {
                    log::error!("Acquisition thread {} panicked", self.name);
                }
            } else {
                log::warn!("Acquisition thread {} still running; detaching it", self.name);
            }
        }
    }
}
