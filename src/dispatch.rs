//! Routes decoded ITM messages to per-variant handlers.
//!
//! Dispatch is synchronous and in stream order on the pump thread; a
//! message goes to exactly one handler, by value, and the core keeps no
//! reference to it afterwards. Variants without an interested handler
//! fall through the trait's no-op defaults.

use crate::itm::{
    DataAccessWp, DataOffsetWp, DataRwwp, DwtEvent, ExceptionTrace, LocalTimestamp, Message, NiSync,
    Overflow, PcSample, Software,
};

/// Software channel reserved for the filewriter protocol.
pub const FILEWRITER_CHANNEL: u8 = 29;

/// Number of software stimulus channels.
pub const NUM_CHANNELS: u8 = 32;

/// Per-variant message callbacks. Implementations override the
/// variants they care about.
pub trait Handler {
    fn software(&mut self, _m: Software) {}
    fn local_timestamp(&mut self, _m: LocalTimestamp) {}
    fn exception(&mut self, _m: ExceptionTrace) {}
    fn pc_sample(&mut self, _m: PcSample) {}
    fn dwt_event(&mut self, _m: DwtEvent) {}
    fn data_rwwp(&mut self, _m: DataRwwp) {}
    fn data_access_wp(&mut self, _m: DataAccessWp) {}
    fn data_offset_wp(&mut self, _m: DataOffsetWp) {}
    fn nisync(&mut self, _m: NiSync) {}
    fn overflow(&mut self, _m: Overflow) {}
}

/// Sink for software messages on the reserved filewriter channel.
pub trait FileWriter {
    fn process(&mut self, m: Software);
}

/// Message router: one handler, plus an optional filewriter that
/// captures software traffic on [`FILEWRITER_CHANNEL`].
pub struct Dispatcher {
    handler: Box<dyn Handler + Send>,
    filewriter: Option<Box<dyn FileWriter + Send>>,
}

impl Dispatcher {
    pub fn new(handler: Box<dyn Handler + Send>) -> Self {
        Self {
            handler,
            filewriter: None,
        }
    }

    pub fn set_filewriter(&mut self, filewriter: Box<dyn FileWriter + Send>) {
        self.filewriter = Some(filewriter);
    }

    pub fn handler_mut(&mut self) -> &mut (dyn Handler + Send) {
        &mut *self.handler
    }

    /// Route one message.
    pub fn dispatch(&mut self, message: Message) {
        match message {
            Message::Software(m) => {
                if m.src_addr == FILEWRITER_CHANNEL {
                    if let Some(fw) = self.filewriter.as_mut() {
                        fw.process(m);
                        return;
                    }
                }
                self.handler.software(m);
            }
            Message::LocalTimestamp(m) => self.handler.local_timestamp(m),
            Message::ExceptionTrace(m) => self.handler.exception(m),
            Message::PcSample(m) => self.handler.pc_sample(m),
            Message::DwtEvent(m) => self.handler.dwt_event(m),
            Message::DataRwwp(m) => self.handler.data_rwwp(m),
            Message::DataAccessWp(m) => self.handler.data_access_wp(m),
            Message::DataOffsetWp(m) => self.handler.data_offset_wp(m),
            Message::NiSync(m) => self.handler.nisync(m),
            Message::Overflow(m) => self.handler.overflow(m),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        software: Vec<Software>,
        timestamps: Vec<LocalTimestamp>,
    }

    struct SharedRecorder(std::sync::Arc<std::sync::Mutex<Recorder>>);

    impl Handler for SharedRecorder {
        fn software(&mut self, m: Software) {
            self.0.lock().unwrap().software.push(m);
        }

        fn local_timestamp(&mut self, m: LocalTimestamp) {
            self.0.lock().unwrap().timestamps.push(m);
        }
    }

    struct CountingWriter(std::sync::Arc<std::sync::atomic::AtomicUsize>);

    impl FileWriter for CountingWriter {
        fn process(&mut self, _m: Software) {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
    }

    fn sw(src_addr: u8) -> Message {
        Message::Software(Software {
            timestamp: 0,
            src_addr,
            len: 1,
            value: 0,
        })
    }

    #[test]
    fn routes_by_variant_and_ignores_unhandled() {
        use crate::itm::TimeStatus;

        let recorder = std::sync::Arc::new(std::sync::Mutex::new(Recorder::default()));
        let mut dispatcher = Dispatcher::new(Box::new(SharedRecorder(recorder.clone())));

        dispatcher.dispatch(sw(1));
        dispatcher.dispatch(Message::LocalTimestamp(LocalTimestamp {
            timestamp: 0,
            time_inc: 1,
            status: TimeStatus::Exact,
        }));
        // No handler override; silently dropped.
        dispatcher.dispatch(Message::Overflow(Overflow { timestamp: 0 }));

        let recorder = recorder.lock().unwrap();
        assert_eq!(recorder.software.len(), 1);
        assert_eq!(recorder.timestamps.len(), 1);
    }

    #[test]
    fn filewriter_channel_is_steered() {
        let recorder = std::sync::Arc::new(std::sync::Mutex::new(Recorder::default()));
        let count = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let mut dispatcher = Dispatcher::new(Box::new(SharedRecorder(recorder.clone())));

        // Without a filewriter the reserved channel behaves normally.
        dispatcher.dispatch(sw(FILEWRITER_CHANNEL));
        assert_eq!(recorder.lock().unwrap().software.len(), 1);

        dispatcher.set_filewriter(Box::new(CountingWriter(count.clone())));
        dispatcher.dispatch(sw(FILEWRITER_CHANNEL));
        dispatcher.dispatch(sw(3));

        assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(recorder.lock().unwrap().software.len(), 2);
    }
}
