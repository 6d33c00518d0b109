//! I²C bridge onto the [`ControlPort`] contract.
//!
//! Wire framing used by the supported register-file chips:
//!
//! - every register is 32 bits wide and addressed by a 32-bit byte address;
//! - both address and data travel big-endian on the wire;
//! - a register write is one transaction of `addr ‖ value` (8 bytes);
//! - a register read is a write-read of the 4 address bytes, clocking back
//!   4 data bytes;
//! - block transfers concatenate the start address with the payload and rely
//!   on the chip's internal address auto-increment.

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::OutputPin;
use embedded_hal::i2c::I2c;

use crate::{ControlPort, IrqSignal, PortError, MAX_BLOCK_TRANSFER};

/// Staging capacity: start address plus the largest supported payload.
const BLOCK_STAGING: usize = MAX_BLOCK_TRANSFER + 4;

/// [`ControlPort`] implementation over a blocking I²C bus.
///
/// Owns the bus handle, the active-low reset pin, a blocking delay source,
/// and a reference to the [`IrqSignal`] the platform's edge callback latches.
pub struct I2cPort<I, R, D> {
    i2c: I,
    address: u8,
    reset: R,
    delay: D,
    irq: &'static IrqSignal,
    armed: bool,
    // Staging lives in the struct, not on the stack — block writes can be
    // up to MAX_BLOCK_TRANSFER bytes.
    staging: heapless::Vec<u8, BLOCK_STAGING>,
}

impl<I, R, D> I2cPort<I, R, D>
where
    I: I2c,
    R: OutputPin,
    D: DelayNs,
{
    /// Create a new I²C control port.
    ///
    /// `address` is the chip's 7-bit bus address. `irq` must be the same
    /// signal the platform's interrupt edge callback notifies; the port
    /// starts disarmed until the driver calls [`ControlPort::arm_irq`].
    pub fn new(i2c: I, address: u8, reset: R, delay: D, irq: &'static IrqSignal) -> Self {
        Self {
            i2c,
            address,
            reset,
            delay,
            irq,
            armed: false,
            staging: heapless::Vec::new(),
        }
    }

    /// Release the bus, reset pin, and delay source.
    pub fn release(self) -> (I, R, D) {
        (self.i2c, self.reset, self.delay)
    }
}

impl<I, R, D> ControlPort for I2cPort<I, R, D>
where
    I: I2c,
    R: OutputPin,
    D: DelayNs,
{
    type Error = PortError<I::Error>;

    fn read_reg(&mut self, addr: u32) -> Result<u32, Self::Error> {
        let mut value = [0u8; 4];
        self.i2c
            .write_read(self.address, &addr.to_be_bytes(), &mut value)
            .map_err(PortError::Bus)?;
        Ok(u32::from_be_bytes(value))
    }

    fn write_reg(&mut self, addr: u32, value: u32) -> Result<(), Self::Error> {
        let mut frame = [0u8; 8];
        frame[..4].copy_from_slice(&addr.to_be_bytes());
        frame[4..].copy_from_slice(&value.to_be_bytes());
        self.i2c.write(self.address, &frame).map_err(PortError::Bus)
    }

    fn write_block(&mut self, addr: u32, data: &[u8]) -> Result<(), Self::Error> {
        if data.len() > MAX_BLOCK_TRANSFER {
            return Err(PortError::BlockTooLarge);
        }
        self.staging.clear();
        // Capacity checked above: 4 address bytes + data always fit.
        self.staging.extend_from_slice(&addr.to_be_bytes()).ok();
        self.staging.extend_from_slice(data).ok();
        self.i2c
            .write(self.address, &self.staging)
            .map_err(PortError::Bus)
    }

    fn read_block(&mut self, addr: u32, out: &mut [u8]) -> Result<(), Self::Error> {
        if out.len() > MAX_BLOCK_TRANSFER {
            return Err(PortError::BlockTooLarge);
        }
        self.i2c
            .write_read(self.address, &addr.to_be_bytes(), out)
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
