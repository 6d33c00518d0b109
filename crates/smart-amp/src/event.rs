//! Interrupt-status decode and hazard recovery.
//!
//! The chip latches fault and status conditions in write-1-to-clear
//! interrupt status registers and holds the interrupt line asserted while
//! any unmasked bit is set. One pass of [`handle_events`] translates the
//! raw bits into the semantic event-flag set the notification callback
//! receives, clears what it saw, and runs the actuator-safe-mode release
//! protocol.
//!
//! Register access happens here, in polling context — never in the
//! interrupt callback itself.

use control_port::ControlPort;

use crate::registers::{
    BST_EN_MASK, ERR_RELEASE_ALL_MASK, IRQ1_AMP_SHORT_MASK, IRQ1_TEMP_ERR_MASK,
    IRQ1_TEMP_WARN_MASK, IRQ2_BST_OVP_MASK, IRQ2_BST_SHORT_MASK, IRQ2_BST_UVP_MASK,
    IRQ_MASK_OFFSET, REG_ERROR_RELEASE, REG_GLOBAL_ENABLES, REG_IRQ1_STATUS_1,
    REG_IRQ1_STATUS_2,
};

// ---------------------------------------------------------------------------
// Semantic event flags
// ---------------------------------------------------------------------------

/// Amplifier output short detected; the output stage latched off.
pub const EVENT_AMP_SHORT: u32 = 1 << 0;
/// Die temperature crossed the warning threshold.
pub const EVENT_TEMP_WARN: u32 = 1 << 1;
/// Die temperature error; the output stage latched off.
pub const EVENT_TEMP_ERROR: u32 = 1 << 2;
/// Boost inductor short detected.
pub const EVENT_BST_SHORT: u32 = 1 << 3;
/// Boost converter under-voltage.
pub const EVENT_BST_UNDERVOLT: u32 = 1 << 4;
/// Boost converter over-voltage.
pub const EVENT_BST_OVERVOLT: u32 = 1 << 5;
/// Synthetic flag: the driver entered its terminal error state.
pub const EVENT_DRIVER_ERROR: u32 = 1 << 31;

/// Every hardware-sourced event flag.
pub const EVENT_ALL_HARDWARE: u32 = EVENT_AMP_SHORT
    | EVENT_TEMP_WARN
    | EVENT_TEMP_ERROR
    | EVENT_BST_SHORT
    | EVENT_BST_UNDERVOLT
    | EVENT_BST_OVERVOLT;

/// Faults that require the boost converter to be cycled as part of
/// releasing actuator-safe mode.
pub const BOOST_HAZARD_EVENTS: u32 = EVENT_BST_SHORT | EVENT_BST_UNDERVOLT | EVENT_BST_OVERVOLT;

// ---------------------------------------------------------------------------
// Status-bit → flag table
// ---------------------------------------------------------------------------

struct EventSource {
    status: u32,
    mask: u32,
    flag: u32,
}

/// Ordered so entries sharing a status register are adjacent — the walk
/// below reuses the last read instead of re-reading the register.
const EVENT_SOURCES: &[EventSource] = &[
    EventSource {
        status: REG_IRQ1_STATUS_1,
        mask: IRQ1_AMP_SHORT_MASK,
        flag: EVENT_AMP_SHORT,
    },
    EventSource {
        status: REG_IRQ1_STATUS_1,
        mask: IRQ1_TEMP_WARN_MASK,
        flag: EVENT_TEMP_WARN,
    },
    EventSource {
        status: REG_IRQ1_STATUS_1,
        mask: IRQ1_TEMP_ERR_MASK,
        flag: EVENT_TEMP_ERROR,
    },
    EventSource {
        status: REG_IRQ1_STATUS_2,
        mask: IRQ2_BST_SHORT_MASK,
        flag: EVENT_BST_SHORT,
    },
    EventSource {
        status: REG_IRQ1_STATUS_2,
        mask: IRQ2_BST_UVP_MASK,
        flag: EVENT_BST_UNDERVOLT,
    },
    EventSource {
        status: REG_IRQ1_STATUS_2,
        mask: IRQ2_BST_OVP_MASK,
        flag: EVENT_BST_OVERVOLT,
    },
];

/// Unmask the hardware interrupt sources whose semantic flags are enabled;
/// everything else stays masked. Called once per reset.
pub(crate) fn apply_event_mask<P: ControlPort>(port: &mut P, enabled: u32) -> Result<(), P::Error> {
    let mut status_reg = None;
    for source in EVENT_SOURCES {
        if status_reg == Some(source.status) {
            continue;
        }
        status_reg = Some(source.status);
        let unmasked: u32 = EVENT_SOURCES
            .iter()
            .filter(|s| s.status == source.status && enabled & s.flag != 0)
            .fold(0, |bits, s| bits | s.mask);
        port.write_reg(source.status + IRQ_MASK_OFFSET, !unmasked)?;
    }
    Ok(())
}

/// One event-service pass.
///
/// Reads each status register at most once per pass, accumulates the
/// enabled semantic flags, clears the matched status bits (write-1-to-
/// clear), and finishes with the actuator-safe-mode release strobe. The
/// strobe runs even when no flag matched — it also clears simple latched
/// errors that never surface as events — and is wrapped in a boost-converter
/// disable/re-enable cycle only when a boost hazard was among the flags.
///
/// Returns the accumulated semantic flags.
pub(crate) fn handle_events<P: ControlPort>(port: &mut P, enabled: u32) -> Result<u32, P::Error> {
    let mut flags = 0u32;
    let mut cached: Option<(u32, u32)> = None;

    for source in EVENT_SOURCES {
        if enabled & source.flag == 0 {
            continue;
        }
        let value = match cached {
            Some((reg, value)) if reg == source.status => value,
            _ => {
                let value = port.read_reg(source.status)?;
                cached = Some((source.status, value));
                value
            }
        };
        if value & source.mask != 0 {
            flags |= source.flag;
            port.write_reg(source.status, value & source.mask)?;
        }
    }

    // Actuator-safe-mode release. Boost hazards additionally require the
    // converter off while the latch clears, then restored exactly as found.
    let mut saved_enables = None;
    if flags & BOOST_HAZARD_EVENTS != 0 {
        let enables = port.read_reg(REG_GLOBAL_ENABLES)?;
        port.write_reg(REG_GLOBAL_ENABLES, enables & !BST_EN_MASK)?;
        saved_enables = Some(enables);
    }
    port.write_reg(REG_ERROR_RELEASE, ERR_RELEASE_ALL_MASK)?;
    port.write_reg(REG_ERROR_RELEASE, 0)?;
    if let Some(enables) = saved_enables {
        port.write_reg(REG_GLOBAL_ENABLES, enables)?;
    }

    Ok(flags)
}
