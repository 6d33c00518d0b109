//! Host-side lifecycle driver for SA72xx smart-amplifier / haptic chips
//!
//! The SA72xx parts pair an analog output stage (speaker amplifier or
//! haptic actuator driver) with an on-board DSP whose firmware the host
//! loads over the serial control port at every cold start. This crate is
//! the host's side of that relationship:
//!
//! - [`fw_image`] — streaming decoder for the vendor firmware-image
//!   container, fed in bounded chunks from wherever the host keeps images
//! - [`wseq`] — the hibernate write-sequence log: register writes the chip
//!   replays itself when waking from its memory-off low-power mode
//! - [`event`] — interrupt-status decode to semantic event flags, plus the
//!   actuator-safe-mode hazard recovery protocol
//! - [`driver`] — the lifecycle controller sequencing reset → boot → power
//!   transitions → calibration over all of the above
//! - [`cal_store`] — fixed-layout blob for persisting calibration results
//! - [`mock`] — in-process mock control port for host tests
//!
//! Transport access goes through the [`control_port::ControlPort`] contract;
//! see that crate for ready-made I²C and SPI bridges.
//!
//! # Concurrency model
//!
//! Single-threaded, cooperative, non-preemptive. Every entry point runs to
//! completion on the caller's thread; all waiting is bounded polling
//! through the transport's delay primitive. The only interrupt-context
//! interaction is the one-word IRQ latch consumed by
//! [`Driver::process`](driver::Driver::process).
//!
//! # Example
//!
//! ```no_run
//! use smart_amp::{Config, Driver, PowerRequest};
//! # fn demo<P: control_port::ControlPort>(port: P) -> Result<(), smart_amp::Error<P::Error>> {
//! let mut amp = Driver::new(port);
//! amp.configure(Config::default())?;
//! amp.reset()?;
//! // …decode and load a firmware image, then:
//! amp.power(PowerRequest::Up)?;
//! loop {
//!     amp.process()?;
//!     # break;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! - `std`: Enable standard library support (for testing)
//! - `defmt`: Enable defmt::Format derives and lifecycle milestone logs

// ── Lint policy ─────────────────────────────────────────────────────────────
#![deny(clippy::unwrap_used)] // no .unwrap() in production code
#![deny(clippy::expect_used)] // no .expect() in production code
#![deny(clippy::panic)] // no panic!() in production code
#![deny(unused_must_use)]
// ────────────────────────────────────────────────────────────────────────────
#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::doc_markdown)] // hex addresses and register names in doc comments
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod cal_store;
pub mod driver;
pub mod event;
pub mod fw_image;
pub mod mock;
pub mod registers;
pub mod wseq;

// Re-export the lifecycle surface
pub use driver::{
    CalibrationData, CalibrationKind, Config, Driver, Error, FwDescriptor, Mode, PowerRequest,
    State,
};
pub use fw_image::{
    Decode, DecodeBuffers, FwImageDecoder, FwImageHeader, ImageError, SymbolEntry,
};
pub use wseq::{WriteSequencer, WseqError, WSEQ_CAPACITY};
