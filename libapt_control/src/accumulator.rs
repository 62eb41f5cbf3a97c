use super::acquisition::{DLD_COLUMNS, DRS_COLUMNS, TDC_COLUMNS};

/// Growable event columns of one acquisition mode, each batch tagged with the specimen and
/// pulse voltage at the time it was drained.
///
/// The columns of a mode are parallel and should stay equal length. A mismatch is reported
/// by [`ColumnAccumulator::length_mismatches`] but never repaired.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnAccumulator<T> {
    names: &'static [&'static str],
    pub columns: Vec<Vec<T>>,
    pub high_voltage: Vec<f64>,
    pub pulse_voltage: Vec<f64>,
}

impl<T> ColumnAccumulator<T> {
    pub fn new(names: &'static [&'static str]) -> Self {
        Self {
            names,
            columns: names.iter().map(|_| Vec::new()).collect(),
            high_voltage: Vec::new(),
            pulse_voltage: Vec::new(),
        }
    }

    pub fn names(&self) -> &'static [&'static str] {
        self.names
    }

    /// Append one batch per column. Missing batches (None) append nothing. The tag columns
    /// grow by the length of the first batch present.
    pub fn append_row(&mut self, row: Vec<Option<Vec<T>>>, specimen: f64, pulse: f64) {
        let tag_len = row
            .iter()
            .flatten()
            .map(|batch| batch.len())
            .next()
            .unwrap_or(0);
        for (column, batch) in self.columns.iter_mut().zip(row) {
            if let Some(mut batch) = batch {
                column.append(&mut batch);
            }
        }
        self.high_voltage
            .extend(std::iter::repeat(specimen).take(tag_len));
        self.pulse_voltage.extend(std::iter::repeat(pulse).take(tag_len));
    }

    pub fn column(&self, name: &str) -> Option<&[T]> {
        self.names
            .iter()
            .position(|n| *n == name)
            .map(|idx| self.columns[idx].as_slice())
    }

    /// Number of entries in the first column
    pub fn len(&self) -> usize {
        self.columns.first().map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Describe every column (including the voltage tags) whose length differs from the first
    pub fn length_mismatches(&self) -> Vec<String> {
        let expected = self.len();
        let mut mismatches = Vec::new();
        let lengths = self
            .names
            .iter()
            .copied()
            .zip(self.columns.iter().map(Vec::len))
            .chain([
                ("high_voltage", self.high_voltage.len()),
                ("pulse_voltage", self.pulse_voltage.len()),
            ]);
        for (name, len) in lengths {
            if len != expected {
                mismatches.push(format!(
                    "{name} has {len} entries, {} has {expected}",
                    self.names[0]
                ));
            }
        }
        mismatches
    }
}

/// The event data of a run, one accumulator per acquisition mode. Modes that did not run
/// stay empty so the output schema is the same for every run.
#[derive(Debug, Clone, PartialEq)]
pub struct EventData {
    pub dld: ColumnAccumulator<i32>,
    pub tdc: ColumnAccumulator<i32>,
    pub drs: ColumnAccumulator<f32>,
}

impl Default for EventData {
    fn default() -> Self {
        Self {
            dld: ColumnAccumulator::new(&DLD_COLUMNS),
            tdc: ColumnAccumulator::new(&TDC_COLUMNS),
            drs: ColumnAccumulator::new(&DRS_COLUMNS),
        }
    }
}

impl EventData {
    /// Length mismatches of all modes, prefixed with the mode group name
    pub fn length_mismatches(&self) -> Vec<String> {
        let mut all = Vec::new();
        for (group, mismatches) in [
            ("dld", self.dld.length_mismatches()),
            ("tdc", self.tdc.length_mismatches()),
            ("drs", self.drs.length_mismatches()),
        ] {
            all.extend(mismatches.into_iter().map(|m| format!("{group}: {m}")));
        }
        all
    }
}
