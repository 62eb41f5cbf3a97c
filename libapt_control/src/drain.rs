use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::TryRecvError;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::accumulator::ColumnAccumulator;
use super::acquisition::ColumnReceivers;
use super::run_state::{RunFlags, SharedVoltages};

/// Lock an accumulator, recovering the data if a drain panicked while holding it
pub fn lock_accumulator<T>(
    accumulator: &Mutex<ColumnAccumulator<T>>,
) -> MutexGuard<'_, ColumnAccumulator<T>> {
    match accumulator.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            log::error!("Event accumulator lock was poisoned; keeping the data collected so far");
            poisoned.into_inner()
        }
    }
}

/// QueueDrain moves event batches from the acquisition queues of one mode into that mode's
/// accumulator.
///
/// A drain is the only writer of its accumulator. It keeps an atomic count of the entries in
/// the first column so the controller can read the running total without taking the lock.
pub struct QueueDrain<T> {
    name: &'static str,
    receivers: ColumnReceivers<T>,
    accumulator: Arc<Mutex<ColumnAccumulator<T>>>,
    events: Arc<AtomicU64>,
    voltages: Arc<SharedVoltages>,
    flags: Arc<RunFlags>,
    idle_wait: Duration,
    column_wait: Duration,
}

impl<T: Send + 'static> QueueDrain<T> {
    pub fn new(
        name: &'static str,
        receivers: ColumnReceivers<T>,
        accumulator: Arc<Mutex<ColumnAccumulator<T>>>,
        voltages: Arc<SharedVoltages>,
        flags: Arc<RunFlags>,
        idle_wait: Duration,
        column_wait: Duration,
    ) -> Self {
        Self {
            name,
            receivers,
            accumulator,
            events: Arc::new(AtomicU64::new(0)),
            voltages,
            flags,
            idle_wait,
            column_wait,
        }
    }

    /// Running count of entries in the first column
    pub fn event_counter(&self) -> Arc<AtomicU64> {
        self.events.clone()
    }

    /// Pop one batch from every queue, in column order, and append them as one row.
    ///
    /// Returns false if every queue was empty. Once any column produced a batch, the others
    /// get a short wait for theirs, since the producer sends the columns one after another.
    fn pop_row(&self, accumulator: &mut ColumnAccumulator<T>) -> bool {
        let n_columns = self.receivers.n_columns();
        let mut row: Vec<Option<Vec<T>>> = (0..n_columns)
            .map(|idx| match self.receivers.column(idx).try_recv() {
                Ok(batch) => Some(batch),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
            })
            .collect();
        if row.iter().all(Option::is_none) {
            return false;
        }

        for (idx, slot) in row.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = self.receivers.column(idx).recv_timeout(self.column_wait).ok();
                if slot.is_none() {
                    log::warn!(
                        "{} drain: batch of column {} did not arrive with its row",
                        self.name,
                        accumulator.names()[idx]
                    );
                }
            }
        }

        accumulator.append_row(row, self.voltages.specimen(), self.voltages.pulse());
        self.events.store(accumulator.len() as u64, Ordering::Release);
        true
    }

    /// Drain everything currently queued. Returns the number of rows moved.
    pub fn drain_available(&self) -> u64 {
        let mut n_rows = 0;
        loop {
            let mut accumulator = lock_accumulator(&self.accumulator);
            if !self.pop_row(&mut accumulator) {
                break;
            }
            n_rows += 1;
        }
        n_rows
    }

    /// Drain until the end-of-experiment flag is set and a final pass finds nothing left
    pub fn run(self) -> u64 {
        log::info!("{} drain started", self.name);
        let mut total_rows = 0;
        loop {
            let moved = self.drain_available();
            total_rows += moved;
            if moved > 0 {
                continue;
            }
            if self.flags.is_ended() {
                // A batch may have landed between the last pass and the flag
                let last = self.drain_available();
                total_rows += last;
                if last == 0 {
                    break;
                }
                continue;
            }
            std::thread::sleep(self.idle_wait);
        }
        log::info!("{} drain finished after {} batches", self.name, total_rows);
        total_rows
    }

    pub fn spawn(self) -> DrainHandle {
        let name = self.name;
        DrainHandle {
            name,
            handle: Some(std::thread::spawn(move || self.run())),
        }
    }
}

/// Handle on a running drain thread
pub struct DrainHandle {
    name: &'static str,
    handle: Option<JoinHandle<u64>>,
}

impl DrainHandle {
    /// Wait up to `timeout` for the drain to finish. Returns the number of batches it moved,
    /// or None if it did not finish (it is then detached) or panicked.
    pub fn join(mut self, timeout: Duration) -> Option<u64> {
        let handle = self.handle.take()?;
        let start = Instant::now();
        while !handle.is_finished() {
            if start.elapsed() >= timeout {
                log::warn!("{} drain did not finish in {:?}; detaching it", self.name, timeout);
                return None;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        match handle.join() {
            Ok(n) => Some(n),
            Err(_) => {
                log::error!("{} drain panicked", self.name);
                None
            }
        }
    }
}
