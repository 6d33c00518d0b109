//! SPI bridge onto the [`ControlPort`] contract.
//!
//! Same register model as the I²C bridge (32-bit addresses and values,
//! big-endian on the wire) with one difference: reads clock out one 32-bit
//! pad word of dummy cycles between the address and the data phase, which
//! the chip needs to turn the bus around.

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::OutputPin;
use embedded_hal::spi::{Operation, SpiDevice};

use crate::{ControlPort, IrqSignal, PortError, MAX_BLOCK_TRANSFER};

/// Staging capacity: start address plus the largest supported payload.
const BLOCK_STAGING: usize = MAX_BLOCK_TRANSFER + 4;

/// [`ControlPort`] implementation over a blocking SPI device.
///
/// The `SpiDevice` abstraction owns chip-select framing; each contract
/// operation maps to exactly one SPI transaction.
pub struct SpiPort<S, R, D> {
    spi: S,
    reset: R,
    delay: D,
    irq: &'static IrqSignal,
    armed: bool,
    staging: heapless::Vec<u8, BLOCK_STAGING>,
}

impl<S, R, D> SpiPort<S, R, D>
where
    S: SpiDevice,
    R: OutputPin,
    D: DelayNs,
{
    /// Create a new SPI control port.
    ///
    /// `irq` must be the same signal the platform's interrupt edge callback
    /// notifies; the port starts disarmed.
    pub fn new(spi: S, reset: R, delay: D, irq: &'static IrqSignal) -> Self {
        Self {
            spi,
            reset,
            delay,
            irq,
            armed: false,
            staging: heapless::Vec::new(),
        }
    }

    /// Release the bus, reset pin, and delay source.
    pub fn release(self) -> (S, R, D) {
        (self.spi, self.reset, self.delay)
    }
}

impl<S, R, D> ControlPort for SpiPort<S, R, D>
where
    S: SpiDevice,
    R: OutputPin,
    D: DelayNs,
{
    type Error = PortError<S::Error>;

    fn read_reg(&mut self, addr: u32) -> Result<u32, Self::Error> {
        let mut value = [0u8; 4];
        self.spi
            .transaction(&mut [
                Operation::Write(&addr.to_be_bytes()),
                // Pad word: dummy cycles while the chip fetches the value.
                Operation::Write(&[0u8; 4]),
                Operation::Read(&mut value),
            ])
            .map_err(PortError::Bus)?;
        Ok(u32::from_be_bytes(value))
    }

    fn write_reg(&mut self, addr: u32, value: u32) -> Result<(), Self::Error> {
        self.spi
            .transaction(&mut [
                Operation::Write(&addr.to_be_bytes()),
                Operation::Write(&value.to_be_bytes()),
            ])
            .map_err(PortError::Bus)
    }

    fn write_block(&mut self, addr: u32, data: &[u8]) -> Result<(), Self::Error> {
        if data.len() > MAX_BLOCK_TRANSFER {
            return Err(PortError::BlockTooLarge);
        }
        self.staging.clear();
        // Capacity checked above: 4 address bytes + data always fit.
        self.staging.extend_from_slice(&addr.to_be_bytes()).ok();
        self.staging.extend_from_slice(data).ok();
        self.spi.write(&self.staging).map_err(PortError::Bus)
    }

    fn read_block(&mut self, addr: u32, out: &mut [u8]) -> Result<(), Self::Error> {
        if out.len() > MAX_BLOCK_TRANSFER {
            return Err(PortError::BlockTooLarge);
        }
        self.spi
            .transaction(&mut [
                Operation::Write(&addr.to_be_bytes()),
                Operation::Write(&[0u8; 4]),
                Operation::Read(out),
            ])
            .map_err(PortError::Bus)
    }

    fn set_reset(&mut self, asserted: bool) -> Result<(), Self::Error> {
        // RESET is active-low: asserted = line low.
        let result = if asserted {
            self.reset.set_low()
        } else {
            self.reset.set_high()
        };
        result.map_err(|_| PortError::ResetPin)
    }

    fn delay_ms(&mut self, ms: u32) {
        self.delay.delay_ms(ms);
    }

    fn arm_irq(&mut self, armed: bool) -> Result<(), Self::Error> {
        self.armed = armed;
        Ok(())
    }

    fn take_irq(&mut self) -> bool {
        if !self.armed {
            return false;
        }
        self.irq.take()
    }
}
