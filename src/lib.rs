//! Decode the byte stream of an ARM Cortex debug trace port.
//!
//! Two physical formats are layered: an outer framing protocol (the
//! TPIU, which multiplexes several logical streams onto one link) and
//! an inner instrumentation protocol (the ITM, carrying software,
//! hardware and timestamp messages). A post-mortem variant captures a
//! third stream into a ring buffer and replays it through an ETM
//! instruction-flow decoder.
//!
//! Data flows strictly left to right:
//!
//! ```text
//!  raw bytes ─▶ tpiu ─▶ demux ─▶ itm ─▶ dispatch ─▶ sinks
//!                         │
//!                         └▶ ring ─▶ etm ─▶ sinks
//! ```
//!
//! [`session::Session`] owns one instance of each decoder and does the
//! coupling; [`sources`] and [`sinks`] are the edges of the pipeline.

pub mod channels;
pub mod diag;
pub mod dispatch;
pub mod etm;
pub mod itm;
pub mod log;
pub mod ring;
pub mod session;
pub mod sinks;
pub mod sources;
pub mod tpiu;
