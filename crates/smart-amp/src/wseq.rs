//! Hibernate write-sequence log.
//!
//! Hibernate powers down the DSP memory, so register state the chip needs
//! on wake must be replayed by the chip itself, before the host is even
//! aware the wake happened. The log remembers exactly those writes, in
//! device-replay order, and [`WriteSequencer::commit`] serializes them into
//! the XM replay table immediately before hibernate entry.
//!
//! Ordering invariant: the table ends with a reserved pair of lock/key
//! entries that re-close the protected trim region after replay. Every
//! insertion goes *before* that tail, through one auditable splice point
//! ([`WriteSequencer::update`]); the tail entries themselves only ever move,
//! never change content.

use control_port::ControlPort;

use crate::registers::REG_TEST_KEY_CTRL;

/// Maximum number of tracked writes, terminator slot excluded.
pub const WSEQ_CAPACITY: usize = 48;

/// On-wire record: two big-endian words per entry.
const RECORD_SIZE: usize = 8;

/// End-of-script terminator record; the replay engine stops here.
const TERMINATOR_RECORD: [u8; RECORD_SIZE] = [0xFF; RECORD_SIZE];

/// Errors from log mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum WseqError {
    /// The log is at capacity and the address is not already tracked. The
    /// write itself still reached the device; it just will not survive
    /// hibernate. There is no eviction.
    Full,
}

/// One tracked register write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct WseqEntry {
    /// Register address within the replayable low 64 KiB region.
    pub address: u16,
    /// Value the replay engine will write.
    pub value: u32,
    changed: bool,
}

impl WseqEntry {
    /// Whether this entry still needs to be written to the device's replay
    /// table at the next commit.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.changed
    }

    /// Serialize to the on-wire record format: the address sits in the top
    /// half of the first word, the value is split across the remainder.
    #[allow(clippy::indexing_slicing)] // compile-time ranges into [u8; 8]
    fn pack(&self) -> [u8; RECORD_SIZE] {
        let word0 = (u32::from(self.address) << 16) | (self.value >> 16);
        let word1 = self.value & 0xFFFF;
        let mut record = [0u8; RECORD_SIZE];
        record[..4].copy_from_slice(&word0.to_be_bytes());
        record[4..].copy_from_slice(&word1.to_be_bytes());
        record
    }
}

/// Capacity-bounded, ordered log of hibernate-durable register writes.
#[derive(Debug, Default)]
pub struct WriteSequencer {
    entries: heapless::Vec<WseqEntry, WSEQ_CAPACITY>,
    reserved_tail: usize,
}

impl WriteSequencer {
    /// Create an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: heapless::Vec::new(),
            reserved_tail: 0,
        }
    }

    /// Drop all entries and the tail reservation.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.reserved_tail = 0;
    }

    /// Number of tracked entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the log is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of entries that would be written by the next commit.
    #[must_use]
    pub fn dirty_count(&self) -> usize {
        self.entries.iter().filter(|e| e.changed).count()
    }

    /// Entry at `index`, if any.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&WseqEntry> {
        self.entries.get(index)
    }

    /// Append a dirty entry at the tail.
    ///
    /// Used while building the table in replay order (unlock keys first,
    /// lock keys last). Once the table is built, mutate through
    /// [`update`](Self::update) instead.
    ///
    /// # Errors
    ///
    /// [`WseqError::Full`] at capacity.
    pub fn add(&mut self, address: u16, value: u32) -> Result<(), WseqError> {
        self.entries
            .push(WseqEntry {
                address,
                value,
                changed: true,
            })
            .map_err(|_| WseqError::Full)
    }

    /// Declare the last `count` entries as the protected lock/key tail.
    ///
    /// From here on, insertions splice in front of these entries so the
    /// replay sequence always re-locks the trim region last.
    pub fn reserve_tail(&mut self, count: usize) {
        self.reserved_tail = count.min(self.entries.len());
    }

    /// Track a register write, updating in place when the address is known.
    ///
    /// The lock-toggle register is never tracked here — its unlock/lock
    /// entries are placed structurally by the boot path, and a stray update
    /// would corrupt the bracketing.
    ///
    /// A value identical to the tracked one leaves the entry clean; the
    /// stored value is compared directly (the packed record format exists
    /// only on the wire), so store-then-compare always round-trips.
    ///
    /// # Errors
    ///
    /// [`WseqError::Full`] when the address is new and the log is at
    /// capacity. Updates to tracked addresses cannot fail.
    #[allow(clippy::cast_possible_truncation)] // REG_TEST_KEY_CTRL < 0x10000
    pub fn update(&mut self, address: u16, value: u32) -> Result<(), WseqError> {
        if address == REG_TEST_KEY_CTRL as u16 {
            return Ok(());
        }
        if let Some(entry) = self.entries.iter_mut().find(|e| e.address == address) {
            if entry.value != value {
                entry.value = value;
                entry.changed = true;
            }
            return Ok(());
        }
        self.insert_before_tail(WseqEntry {
            address,
            value,
            changed: true,
        })
    }

    /// The single splice point that upholds the tail invariant: new entries
    /// land just in front of the reserved lock/key pair, which is re-marked
    /// dirty because its position in the replay table moved.
    fn insert_before_tail(&mut self, entry: WseqEntry) -> Result<(), WseqError> {
        let at = self.entries.len().saturating_sub(self.reserved_tail);
        self.entries.insert(at, entry).map_err(|_| WseqError::Full)?;
        let len = self.entries.len();
        let tail_from = len.saturating_sub(self.reserved_tail);
        for tail in self.entries.iter_mut().skip(tail_from) {
            tail.changed = true;
        }
        Ok(())
    }

    /// Write every dirty entry's record into the device replay table at
    /// `base + 8 * index`, clear the dirty bits, and terminate the script
    /// one slot past the last entry. Performs exactly
    /// `dirty_count() + 1` block writes.
    ///
    /// # Errors
    ///
    /// Any transport failure aborts the commit; dirty bits of unwritten
    /// entries are preserved so a retry finishes the job.
    #[allow(clippy::arithmetic_side_effects)] // index < WSEQ_CAPACITY, base is a fixed XM address
    #[allow(clippy::cast_possible_truncation)] // record offsets fit u32
    pub fn commit<P: ControlPort>(&mut self, port: &mut P, base: u32) -> Result<(), P::Error> {
        for (index, entry) in self.entries.iter_mut().enumerate() {
            if !entry.changed {
                continue;
            }
            port.write_block(base + (index * RECORD_SIZE) as u32, &entry.pack())?;
            entry.changed = false;
        }
        let end = base + (self.entries.len() * RECORD_SIZE) as u32;
        port.write_block(end, &TERMINATOR_RECORD)
    }
}
