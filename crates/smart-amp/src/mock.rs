//! Mock control port for host-side testing
//!
//! Implements [`ControlPort`] without any hardware dependency. Records all
//! transport calls for assertion in tests and replays scripted register
//! reads, so bounded polling loops can be exercised deterministically
//! (e.g. "boot-done appears on the second poll").

use control_port::ControlPort;

/// Error type returned by scripted transport failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MockError;

/// Mock control port — records all calls for test assertions.
#[derive(Debug, Default)]
pub struct MockPort {
    /// Backing register file: last written / seeded value per address.
    regs: heapless::Vec<(u32, u32), 64>,
    /// Scripted read values per address, consumed FIFO before the backing
    /// file is consulted.
    queued: heapless::Vec<(u32, heapless::Vec<u32, 8>), 16>,
    /// Every `write_reg` in call order.
    pub reg_writes: heapless::Vec<(u32, u32), 128>,
    /// Every `write_block` in call order.
    pub block_writes: heapless::Vec<(u32, heapless::Vec<u8, 64>), 64>,
    /// Every reset-line change (`true` = asserted).
    pub reset_changes: heapless::Vec<bool, 8>,
    /// Accumulated blocking delay.
    pub delay_total_ms: u32,
    /// Total transport calls (register, block, reset, IRQ arm).
    pub calls: usize,
    /// Latched interrupt edge, consumed by `take_irq`.
    pub irq_latched: bool,
    /// Whether IRQ delivery is armed.
    pub irq_armed: bool,
    /// Fail this many upcoming `write_reg` calls (wake-path NAK simulation).
    pub nak_writes: u8,
    /// Fail this many upcoming `read_reg` calls.
    pub nak_reads: u8,
}

impl MockPort {
    /// Create an empty mock with no scripted reads.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the backing register file.
    pub fn set_reg(&mut self, addr: u32, value: u32) {
        if let Some(slot) = self.regs.iter_mut().find(|(a, _)| *a == addr) {
            slot.1 = value;
            return;
        }
        self.regs.push((addr, value)).ok();
    }

    /// Queue a one-shot read value for `addr`, consumed before the backing
    /// file. Queue several to script a polling sequence.
    pub fn queue_read(&mut self, addr: u32, value: u32) {
        if let Some(slot) = self.queued.iter_mut().find(|(a, _)| *a == addr) {
            slot.1.push(value).ok();
            return;
        }
        let mut fifo = heapless::Vec::new();
        fifo.push(value).ok();
        self.queued.push((addr, fifo)).ok();
    }

    /// Latch an interrupt edge, as the platform's GPIO callback would.
    pub fn raise_irq(&mut self) {
        self.irq_latched = true;
    }

    /// Number of `write_reg` calls that hit `addr` with `value`.
    #[must_use]
    pub fn reg_write_count(&self, addr: u32, value: u32) -> usize {
        self.reg_writes
            .iter()
            .filter(|&&(a, v)| a == addr && v == value)
            .count()
    }
}

impl ControlPort for MockPort {
    type Error = MockError;

    fn read_reg(&mut self, addr: u32) -> Result<u32, Self::Error> {
        self.calls = self.calls.saturating_add(1);
        if self.nak_reads > 0 {
            self.nak_reads = self.nak_reads.saturating_sub(1);
            return Err(MockError);
        }
        if let Some(slot) = self.queued.iter_mut().find(|(a, q)| *a == addr && !q.is_empty()) {
            return Ok(slot.1.remove(0));
        }
        Ok(self
            .regs
            .iter()
            .find(|(a, _)| *a == addr)
            .map_or(0, |&(_, v)| v))
    }

    fn write_reg(&mut self, addr: u32, value: u32) -> Result<(), Self::Error> {
        self.calls = self.calls.saturating_add(1);
        if self.nak_writes > 0 {
            self.nak_writes = self.nak_writes.saturating_sub(1);
            return Err(MockError);
        }
        self.reg_writes.push((addr, value)).ok();
        self.set_reg(addr, value);
        Ok(())
    }

    fn write_block(&mut self, addr: u32, data: &[u8]) -> Result<(), Self::Error> {
        self.calls = self.calls.saturating_add(1);
        let mut copy = heapless::Vec::new();
        copy.extend_from_slice(data).ok();
        self.block_writes.push((addr, copy)).ok();
        Ok(())
    }

    fn read_block(&mut self, _addr: u32, out: &mut [u8]) -> Result<(), Self::Error> {
        self.calls = self.calls.saturating_add(1);
        out.fill(0);
        Ok(())
    }

    fn set_reset(&mut self, asserted: bool) -> Result<(), Self::Error> {
        self.calls = self.calls.saturating_add(1);
        self.reset_changes.push(asserted).ok();
        Ok(())
    }

    fn delay_ms(&mut self, ms: u32) {
        self.delay_total_ms = self.delay_total_ms.saturating_add(ms);
    }

    fn arm_irq(&mut self, armed: bool) -> Result<(), Self::Error> {
        self.calls = self.calls.saturating_add(1);
        self.irq_armed = armed;
        Ok(())
    }

    fn take_irq(&mut self) -> bool {
        if !self.irq_armed {
            return false;
        }
        let pending = self.irq_latched;
        self.irq_latched = false;
        pending
    }
}
