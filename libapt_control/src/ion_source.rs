use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::constants::RAW_EVENTS_PER_ION;
use super::devices::EdgeCounter;
use super::error::DeviceError;

/// Where the controller reads the cumulative number of detected ions from
pub enum IonCountSource {
    /// Paired detector hits; one hit is one ion
    PairedEvents(Arc<AtomicU64>),
    /// Raw TDC channel entries; several entries make one ion
    RawEvents(Arc<AtomicU64>),
    /// Waveform digitizer; ions are not counted during the run
    WaveformChannels,
    /// Hardware counter of detector edges
    EdgeCounter,
}

impl IonCountSource {
    /// Current cumulative ion count, or None if this source does not count ions.
    ///
    /// The edge counter variant reads the hardware, which is owned by the device bundle and
    /// passed in here.
    pub fn current_total_ions(
        &self,
        counter: Option<&mut Box<dyn EdgeCounter>>,
    ) -> Result<Option<u64>, DeviceError> {
        match self {
            Self::PairedEvents(events) => Ok(Some(events.load(Ordering::Acquire))),
            Self::RawEvents(events) => {
                Ok(Some(events.load(Ordering::Acquire) / RAW_EVENTS_PER_ION))
            }
            Self::WaveformChannels => Ok(None),
            Self::EdgeCounter => match counter {
                Some(counter) => Ok(Some(counter.read()?)),
                None => Ok(None),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedCounter(u64);

    impl EdgeCounter for FixedCounter {
        fn start(&mut self) -> Result<(), DeviceError> {
            Ok(())
        }
        fn read(&mut self) -> Result<u64, DeviceError> {
            Ok(self.0)
        }
        fn stop(&mut self) -> Result<(), DeviceError> {
            Ok(())
        }
        fn close(&mut self) {}
    }

    #[test]
    fn test_raw_events_divide_by_record_arity() {
        let events = Arc::new(AtomicU64::new(10));
        let source = IonCountSource::RawEvents(events.clone());
        assert_eq!(source.current_total_ions(None).unwrap(), Some(2));
        events.store(12, Ordering::Release);
        assert_eq!(source.current_total_ions(None).unwrap(), Some(3));
    }

    #[test]
    fn test_paired_and_waveform() {
        let source = IonCountSource::PairedEvents(Arc::new(AtomicU64::new(7)));
        assert_eq!(source.current_total_ions(None).unwrap(), Some(7));
        assert_eq!(
            IonCountSource::WaveformChannels
                .current_total_ions(None)
                .unwrap(),
            None
        );
    }

    #[test]
    fn test_edge_counter_reads_hardware() {
        let mut counter: Box<dyn EdgeCounter> = Box::new(FixedCounter(1234));
        let source = IonCountSource::EdgeCounter;
        assert_eq!(
            source.current_total_ions(Some(&mut counter)).unwrap(),
            Some(1234)
        );
    }
}
