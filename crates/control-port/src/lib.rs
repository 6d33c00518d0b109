//! Control-port transport contract for register-file devices
//!
//! Smart-amplifier and haptic-driver chips expose their entire register file
//! over a serial control port (I²C or SPI). This crate defines the transport
//! contract the lifecycle driver is written against, plus ready-made bridges
//! onto `embedded-hal` 1.0 blocking buses.
//!
//! # Architecture Layers
//!
//! ```text
//! Lifecycle driver (smart-amp crate)
//!         ↓
//! ControlPort contract (this crate — trait + IrqSignal)
//!         ↓
//! Bus bridges (this crate — I2cPort / SpiPort over embedded-hal 1.0)
//!         ↓
//! Hardware Layer (HAL bus peripherals + EXTI)
//! ```
//!
//! Every driver handle owns its own `ControlPort` instance — there is no
//! process-global transport binding, so a test process can host any number
//! of simulated devices side by side.
//!
//! # Features
//!
//! - `std`: Enable standard library support (for testing)
//! - `defmt`: Enable defmt::Format derives on public types

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

pub mod i2c;
pub mod irq;
pub mod spi;

pub use i2c::I2cPort;
pub use irq::IrqSignal;
pub use spi::SpiPort;

use thiserror_no_std::Error;

/// Largest block transfer the bus bridges will stage in one transaction.
///
/// Callers streaming firmware data must chunk block writes at or below this
/// size. The lifecycle driver's image decoder already bounds its scratch
/// buffer, so in practice this only constrains hand-rolled callers.
pub const MAX_BLOCK_TRANSFER: usize = 1024;

/// Synchronous register-access contract between the lifecycle driver and the
/// chip's serial control port.
///
/// All operations are blocking and run to completion on the caller's thread.
/// Any `Err` aborts the higher-level operation in progress — the contract
/// defines no partial-success semantics.
pub trait ControlPort {
    /// Transport error type. Opaque to the driver; only its presence matters.
    type Error: core::fmt::Debug;

    /// Read one 32-bit register.
    fn read_reg(&mut self, addr: u32) -> Result<u32, Self::Error>;

    /// Write one 32-bit register.
    fn write_reg(&mut self, addr: u32, value: u32) -> Result<(), Self::Error>;

    /// Read-modify-write the masked field of a register.
    ///
    /// Bits outside `mask` are preserved; bits inside are replaced with the
    /// corresponding bits of `value`.
    fn update_reg(&mut self, addr: u32, mask: u32, value: u32) -> Result<(), Self::Error> {
        let current = self.read_reg(addr)?;
        self.write_reg(addr, (current & !mask) | (value & mask))
    }

    /// Write a contiguous block of bytes starting at `addr`.
    fn write_block(&mut self, addr: u32, data: &[u8]) -> Result<(), Self::Error>;

    /// Read a contiguous block of bytes starting at `addr` into `out`.
    fn read_block(&mut self, addr: u32, out: &mut [u8]) -> Result<(), Self::Error>;

    /// Drive the chip's hardware reset line.
    ///
    /// `asserted = true` holds the chip in reset (the line itself is
    /// active-low on the supported parts; the bridge hides the polarity).
    fn set_reset(&mut self, asserted: bool) -> Result<(), Self::Error>;

    /// Block the calling thread for at least `ms` milliseconds.
    fn delay_ms(&mut self, ms: u32);

    /// Globally enable or disable delivery of the chip's interrupt edge.
    ///
    /// While disarmed, [`ControlPort::take_irq`] reports no pending edges
    /// even if the hardware line toggles.
    fn arm_irq(&mut self, armed: bool) -> Result<(), Self::Error>;

    /// Consume the latched interrupt edge, if any (clear-on-read).
    ///
    /// The latch is set from interrupt context via [`IrqSignal::notify`];
    /// its only side effect is flagging the poll loop. A stale `false` here
    /// simply means "try again next poll" — the hardware line remains
    /// asserted until the driver services and clears the status registers.
    fn take_irq(&mut self) -> bool;
}

/// Errors produced by the bus bridges in this crate.
#[derive(Debug, PartialEq, Eq, Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PortError<E> {
    /// The underlying bus transaction failed (NAK, arbitration loss, …).
    #[error("bus transaction failed")]
    Bus(E),
    /// A block transfer exceeded [`MAX_BLOCK_TRANSFER`].
    #[error("block transfer exceeds staging capacity")]
    BlockTooLarge,
    /// The reset GPIO could not be driven.
    #[error("reset line error")]
    ResetPin,
}
