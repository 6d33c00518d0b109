//! Device lifecycle controller.
//!
//! Orchestrates the full life of an SA72xx part: hardware reset, firmware
//! boot, power transitions (including the hibernate/wake dance built on the
//! write-sequence log), calibration, and the event poll loop.
//!
//! State machine:
//!
//! ```text
//! Unconfigured → Configured → Standby ⇄ PowerUp            (no firmware)
//!                                │
//!                     boot(fw)   ▼
//!                             DspStandby ⇄ DspPowerUp ⇄ Hibernate
//!                             CalStandby ⇄ CalPowerUp      (cal image)
//!
//! Error: reachable from event handling / ambiguous mid-transition
//!        failures; terminal until initialize().
//! ```
//!
//! Every blocking wait is a bounded poll — fixed interval, fixed maximum
//! iteration count — through the transport's delay primitive. All entry
//! points run to completion on the caller's thread; the only cross-context
//! input is the interrupt latch consumed by [`Driver::process`].

use control_port::ControlPort;

use crate::event::{self, EVENT_ALL_HARDWARE, EVENT_DRIVER_ERROR};
use crate::fw_image::{FwImageHeader, ImageError, SymbolEntry};
use crate::registers::{
    AMP_GAIN_PCM_MASK, CAL_REQUEST_F0, CAL_REQUEST_RE_DC, CAL_STATUS_DONE, DEVID_SA7210,
    DEVID_SA7211, DSP_CLK_EN_MASK, DSP_MEM_EN_MASK, ERRATA_WRITES, FW_ID_CALIBRATION,
    FW_STATE_ACTIVE, FW_STATE_STANDBY, GLOBAL_EN_MASK, IRQ1_BOOT_DONE_MASK, IRQ1_BOOT_ERR_MASK,
    MBOX_CMD_HIBERNATE, MBOX_CMD_NONE, MBOX_CMD_STANDBY, MBOX_CMD_WAKEUP, POST_BOOT_WRITES,
    REG_AMP_GAIN, REG_DEVID, REG_DSP_CLOCK_CTRL, REG_DSP_MBOX_CMD, REG_DSP_MEM_CTRL,
    REG_GLOBAL_ENABLES, REG_IRQ1_STATUS_1, REG_POWER_ON_SEQ_BASE, REG_REVID, REG_TEST_KEY_CTRL,
    REG_XM_FW_ID, SYM_ID_CAL_F0, SYM_ID_CAL_REQUEST, SYM_ID_CAL_RE_DC, SYM_ID_CAL_STATUS,
    SYM_ID_RUN_STATE, TEST_KEY_LOCK_1, TEST_KEY_LOCK_2, TEST_KEY_UNLOCK_1, TEST_KEY_UNLOCK_2,
};
use crate::wseq::{WriteSequencer, WseqError};

// ---------------------------------------------------------------------------
// Timing and retry budgets
// ---------------------------------------------------------------------------

/// Reset pulse width; the part specifies a 1 ms minimum.
const RESET_PULSE_MS: u32 = 2;
/// Settle time after reset deassertion before the control port is usable.
const RESET_SETTLE_MS: u32 = 3;
/// Boot-done poll budget after reset.
const BOOT_DONE_RETRIES: u32 = 10;
const BOOT_DONE_INTERVAL_MS: u32 = 1;
/// Firmware run-state poll budget after DSP clock enable and after wake.
const DSP_STATE_RETRIES: u32 = 10;
const DSP_STATE_INTERVAL_MS: u32 = 5;
/// Mailbox acknowledge poll budget.
const MBOX_ACK_RETRIES: u32 = 10;
const MBOX_ACK_INTERVAL_MS: u32 = 1;
/// Wake command retries — the chip NAKs the bus until its oscillator runs.
const WAKE_CMD_RETRIES: u32 = 5;
const WAKE_CMD_INTERVAL_MS: u32 = 1;
/// Firmware-ID reappearance poll budget after a wake command.
const WAKE_FW_ID_RETRIES: u32 = 10;
const WAKE_FW_ID_INTERVAL_MS: u32 = 5;
/// Outer wake attempts; each failed attempt forces a fresh hibernate entry.
const WAKE_ATTEMPTS: u32 = 2;
/// Delay after a forced hibernate re-entry before retrying the wake.
const WAKE_REENTRY_DELAY_MS: u32 = 10;
/// Fixed settle time after a calibration trigger before polling.
const CAL_SETTLE_MS: u32 = 400;
/// Calibration completion poll budget.
const CAL_POLL_RETRIES: u32 = 30;
const CAL_POLL_INTERVAL_MS: u32 = 10;

/// Upper bound of the write-sequence-replayable register region.
const WSEQ_ADDR_LIMIT: u32 = 0xFFFF;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Lifecycle states. `Unconfigured` is the only initial state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum State {
    /// Fresh or re-initialized handle; nothing is known about the chip.
    Unconfigured,
    /// Configuration stored and interrupt delivery armed; chip untouched.
    Configured,
    /// Chip out of reset, no firmware loaded, signal chain off.
    Standby,
    /// Pre-firmware minimal operation: signal chain on, DSP dark.
    PowerUp,
    /// Firmware loaded, DSP dark.
    DspStandby,
    /// Firmware running.
    DspPowerUp,
    /// Calibration firmware loaded, DSP dark.
    CalStandby,
    /// Calibration firmware running.
    CalPowerUp,
    /// DSP memory powered down; only the wake path may touch the chip.
    Hibernate,
    /// Hardware state ambiguous. Terminal until [`Driver::initialize`].
    Error,
}

/// What the poll loop is currently doing. Flips to `HandlingEvents` for the
/// duration of an event-service pass inside [`Driver::process`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Mode {
    /// Normal entry-point processing.
    HandlingControls,
    /// Servicing a latched interrupt.
    HandlingEvents,
}

/// Requested power transition for [`Driver::power`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PowerRequest {
    /// Standby variant → powered-up variant.
    Up,
    /// Powered-up variant → standby variant.
    Down,
    /// `DspPowerUp` → `Hibernate`, committing the write-sequence log first.
    Hibernate,
    /// `Hibernate` → `DspPowerUp`.
    Wake,
}

/// Calibration measurements supported by the calibration firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CalibrationKind {
    /// Load DC resistance (detects a detached or damaged load).
    Impedance,
    /// Mechanical resonant frequency of the actuator.
    ResonantFrequency,
}

/// Measurement results, cached in the handle and persistable through
/// [`crate::cal_store`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CalibrationData {
    /// Load DC resistance, firmware fixed-point.
    pub re_dc: Option<u32>,
    /// Resonant frequency, firmware fixed-point.
    pub f0: Option<u32>,
}

/// Driver errors, generic over the transport error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error<E> {
    /// A control-port call failed; the calling operation was aborted.
    Bus(E),
    /// A bounded poll exhausted its budget. State is unchanged; the caller
    /// may retry or abandon.
    Timeout,
    /// The call is not valid in the current lifecycle state. No hardware
    /// access was attempted.
    InvalidTransition,
    /// The chip reported a boot error after reset.
    BootFailure,
    /// The chip's DEVID is not one this driver supports.
    UnsupportedDevice(u32),
    /// The operation needs a loaded firmware image and none is active.
    NoFirmware,
    /// The active firmware image does not export a required symbol.
    SymbolMissing(u32),
    /// The write-sequence log is full; the triggering write reached the
    /// device but will not survive hibernate.
    WseqFull,
    /// Firmware-image decode failure, forwarded for callers composing
    /// decode and boot in one fallible flow.
    Image(ImageError),
}

impl<E> From<WseqError> for Error<E> {
    fn from(err: WseqError) -> Self {
        match err {
            WseqError::Full => Self::WseqFull,
        }
    }
}

impl<E> From<ImageError> for Error<E> {
    fn from(err: ImageError) -> Self {
        Self::Image(err)
    }
}

/// Active-firmware descriptor: identification plus the symbol and algorithm
/// tables decoded from the image. The tables stay caller-owned; the driver
/// only borrows them for the firmware's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FwDescriptor<'a> {
    /// Firmware identifier from the image header.
    pub fw_id: u32,
    /// Firmware version from the image header.
    pub fw_rev: u32,
    /// Decoded symbol table.
    pub symbols: &'a [SymbolEntry],
    /// Decoded algorithm-ID list.
    pub alg_ids: &'a [u32],
}

impl<'a> FwDescriptor<'a> {
    /// Build a descriptor from a decoded header and the caller's table
    /// buffers, trimming oversized buffers to the header-declared counts.
    #[must_use]
    pub fn from_image(
        header: &FwImageHeader,
        symbols: &'a [SymbolEntry],
        alg_ids: &'a [u32],
    ) -> Self {
        Self {
            fw_id: header.fw_id,
            fw_rev: header.fw_rev,
            symbols: symbols.get(..header.sym_count as usize).unwrap_or(symbols),
            alg_ids: alg_ids.get(..header.alg_count as usize).unwrap_or(alg_ids),
        }
    }

    /// Resolve a firmware symbol to its control-port address.
    #[must_use]
    pub fn find_symbol(&self, id: u32) -> Option<u32> {
        self.symbols.iter().find(|s| s.id == id).map(|s| s.address)
    }

    /// Whether this image is the calibration-only firmware.
    #[must_use]
    pub fn is_calibration(&self) -> bool {
        self.fw_id == FW_ID_CALIBRATION
    }
}

/// Caller-supplied configuration, stored by [`Driver::configure`].
#[derive(Clone, Copy)]
pub struct Config<'a> {
    /// Event notification sink, invoked synchronously from
    /// [`Driver::process`] — never re-entrant, never with zero flags. State
    /// the callback needs lives in its captured environment.
    pub notify: Option<&'a dyn Fn(u32)>,
    /// Register defaults written (and made hibernate-durable) at boot.
    pub defaults: &'a [(u32, u32)],
    /// Which semantic event flags to unmask and report (`EVENT_*`).
    pub event_mask: u32,
}

impl Default for Config<'_> {
    fn default() -> Self {
        Self {
            notify: None,
            defaults: &[],
            event_mask: EVENT_ALL_HARDWARE,
        }
    }
}

/// Truncate a control-port address into the write-sequence address space.
/// Callers guarantee `addr <= WSEQ_ADDR_LIMIT`.
#[allow(clippy::cast_possible_truncation)]
fn wseq_addr(addr: u32) -> u16 {
    (addr & WSEQ_ADDR_LIMIT) as u16
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

/// Lifecycle driver handle. Owns its control port exclusively; callers
/// serialize entry-point calls on one handle themselves.
pub struct Driver<'a, P: ControlPort> {
    port: P,
    state: State,
    mode: Mode,
    config: Config<'a>,
    devid: u32,
    revid: u32,
    fw: Option<FwDescriptor<'a>>,
    wseq: WriteSequencer,
    cal: Option<CalibrationData>,
    event_flags: u32,
}

impl<'a, P: ControlPort> Driver<'a, P> {
    /// Create a fresh handle in [`State::Unconfigured`].
    pub fn new(port: P) -> Self {
        Self {
            port,
            state: State::Unconfigured,
            mode: Mode::HandlingControls,
            config: Config::default(),
            devid: 0,
            revid: 0,
            fw: None,
            wseq: WriteSequencer::new(),
            cal: None,
            event_flags: 0,
        }
    }

    /// Return the handle to its power-on state, dropping configuration,
    /// firmware tracking, cached calibration, and pending events. The only
    /// way out of [`State::Error`].
    pub fn initialize(&mut self) {
        self.state = State::Unconfigured;
        self.mode = Mode::HandlingControls;
        self.config = Config::default();
        self.devid = 0;
        self.revid = 0;
        self.fw = None;
        self.wseq.clear();
        self.cal = None;
        self.event_flags = 0;
    }

    /// Store the configuration and arm interrupt delivery.
    ///
    /// Idempotent: re-configuration is allowed until the chip has been
    /// reset, after which the configuration is considered live.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidTransition`] past [`State::Configured`];
    /// [`Error::Bus`] if arming the interrupt fails.
    pub fn configure(&mut self, config: Config<'a>) -> Result<(), Error<P::Error>> {
        match self.state {
            State::Unconfigured | State::Configured => {}
            _ => return Err(Error::InvalidTransition),
        }
        self.config = config;
        self.port.arm_irq(true).map_err(Error::Bus)?;
        self.state = State::Configured;
        Ok(())
    }

    /// Hardware-reset the chip and bring it to [`State::Standby`].
    ///
    /// Pulses the reset line, waits for the boot-done status bit (bounded),
    /// validates DEVID, applies the silicon errata patch under the test
    /// key, and unmasks the configured event sources.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidTransition`] from `Unconfigured`/`Error`;
    /// [`Error::BootFailure`] if the chip flags a boot error;
    /// [`Error::Timeout`] if boot-done never appears;
    /// [`Error::UnsupportedDevice`] on a foreign DEVID. State is unchanged
    /// on failure.
    pub fn reset(&mut self) -> Result<(), Error<P::Error>> {
        match self.state {
            State::Unconfigured | State::Error => return Err(Error::InvalidTransition),
            _ => {}
        }

        self.port.set_reset(true).map_err(Error::Bus)?;
        self.port.delay_ms(RESET_PULSE_MS);
        self.port.set_reset(false).map_err(Error::Bus)?;
        self.port.delay_ms(RESET_SETTLE_MS);

        let mut booted = false;
        for attempt in 0..BOOT_DONE_RETRIES {
            if attempt > 0 {
                self.port.delay_ms(BOOT_DONE_INTERVAL_MS);
            }
            let status = self.port.read_reg(REG_IRQ1_STATUS_1).map_err(Error::Bus)?;
            if status & IRQ1_BOOT_ERR_MASK != 0 {
                return Err(Error::BootFailure);
            }
            if status & IRQ1_BOOT_DONE_MASK != 0 {
                self.port
                    .write_reg(REG_IRQ1_STATUS_1, IRQ1_BOOT_DONE_MASK)
                    .map_err(Error::Bus)?;
                booted = true;
                break;
            }
        }
        if !booted {
            return Err(Error::Timeout);
        }

        let devid = self.port.read_reg(REG_DEVID).map_err(Error::Bus)?;
        if devid != DEVID_SA7210 && devid != DEVID_SA7211 {
            return Err(Error::UnsupportedDevice(devid));
        }
        self.devid = devid;
        self.revid = self.port.read_reg(REG_REVID).map_err(Error::Bus)?;

        // Silicon errata patch, bracketed by the test key.
        self.port
            .write_reg(REG_TEST_KEY_CTRL, TEST_KEY_UNLOCK_1)
            .map_err(Error::Bus)?;
        self.port
            .write_reg(REG_TEST_KEY_CTRL, TEST_KEY_UNLOCK_2)
            .map_err(Error::Bus)?;
        for &(addr, value) in ERRATA_WRITES {
            self.port.write_reg(addr, value).map_err(Error::Bus)?;
        }
        self.port
            .write_reg(REG_TEST_KEY_CTRL, TEST_KEY_LOCK_1)
            .map_err(Error::Bus)?;
        self.port
            .write_reg(REG_TEST_KEY_CTRL, TEST_KEY_LOCK_2)
            .map_err(Error::Bus)?;

        event::apply_event_mask(&mut self.port, self.config.event_mask).map_err(Error::Bus)?;

        // Hard reset wiped DSP RAM; any previously loaded image is gone.
        self.fw = None;
        self.event_flags = 0;
        self.state = State::Standby;
        #[cfg(feature = "defmt")]
        defmt::info!("reset complete: devid={=u32:#x} revid={=u32:#x}", self.devid, self.revid);
        Ok(())
    }

    /// Activate a decoded firmware image, or invalidate the active one.
    ///
    /// `boot(None)` drops the firmware descriptor without touching
    /// hardware — used before loading a different image. `boot(Some(fw))`
    /// rebuilds the write-sequence log in replay order (unlock keys,
    /// errata, post-boot writes, configured defaults, lock keys), writes
    /// the post-boot registers and defaults to the chip, applies cached
    /// calibration through the firmware symbol table, and moves to the
    /// firmware standby state.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidTransition`] outside the standby states;
    /// [`Error::WseqFull`] when the configured defaults overflow the log.
    pub fn boot(&mut self, firmware: Option<FwDescriptor<'a>>) -> Result<(), Error<P::Error>> {
        match self.state {
            State::Standby | State::DspStandby | State::CalStandby => {}
            _ => return Err(Error::InvalidTransition),
        }
        let Some(fw) = firmware else {
            self.fw = None;
            self.state = State::Standby;
            return Ok(());
        };

        let key = wseq_addr(REG_TEST_KEY_CTRL);
        self.wseq.clear();
        self.wseq.add(key, TEST_KEY_UNLOCK_1)?;
        self.wseq.add(key, TEST_KEY_UNLOCK_2)?;
        for &(addr, value) in ERRATA_WRITES {
            self.wseq.add(wseq_addr(addr), value)?;
        }
        for &(addr, value) in POST_BOOT_WRITES {
            self.port.write_reg(addr, value).map_err(Error::Bus)?;
            self.wseq.add(wseq_addr(addr), value)?;
        }
        let defaults = self.config.defaults;
        for &(addr, value) in defaults {
            self.port.write_reg(addr, value).map_err(Error::Bus)?;
            self.wseq.add(wseq_addr(addr), value)?;
        }
        self.wseq.add(key, TEST_KEY_LOCK_1)?;
        self.wseq.add(key, TEST_KEY_LOCK_2)?;
        self.wseq.reserve_tail(2);

        // Previously measured calibration goes straight into firmware RAM.
        if let Some(cal) = self.cal {
            if let (Some(re_dc), Some(addr)) = (cal.re_dc, fw.find_symbol(SYM_ID_CAL_RE_DC)) {
                self.port.write_reg(addr, re_dc).map_err(Error::Bus)?;
            }
            if let (Some(f0), Some(addr)) = (cal.f0, fw.find_symbol(SYM_ID_CAL_F0)) {
                self.port.write_reg(addr, f0).map_err(Error::Bus)?;
            }
        }

        self.state = if fw.is_calibration() {
            State::CalStandby
        } else {
            State::DspStandby
        };
        self.fw = Some(fw);
        #[cfg(feature = "defmt")]
        defmt::info!("firmware active: id={=u32:#x} rev={=u32:#x}", fw.fw_id, fw.fw_rev);
        Ok(())
    }

    /// Transmit one staged firmware data block to the chip.
    ///
    /// Called by the image-loading loop each time the decoder reports a
    /// staged block.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidTransition`] when the chip cannot accept writes.
    pub fn load_firmware_block(&mut self, address: u32, data: &[u8]) -> Result<(), Error<P::Error>> {
        match self.state {
            State::Unconfigured | State::Error | State::Hibernate => {
                return Err(Error::InvalidTransition)
            }
            _ => {}
        }
        self.port.write_block(address, data).map_err(Error::Bus)
    }

    /// Request a power transition. See [`PowerRequest`] for the state table;
    /// any other (request, state) pairing fails without touching hardware.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidTransition`], [`Error::Timeout`], or [`Error::Bus`].
    /// Failures leave the state unchanged except the wake path's forced
    /// hibernate re-entry, which moves to [`State::Error`] if the chip can
    /// no longer be addressed at all.
    pub fn power(&mut self, request: PowerRequest) -> Result<(), Error<P::Error>> {
        match (request, self.state) {
            (PowerRequest::Up, State::Standby) => {
                self.port
                    .update_reg(REG_GLOBAL_ENABLES, GLOBAL_EN_MASK, GLOBAL_EN_MASK)
                    .map_err(Error::Bus)?;
                self.state = State::PowerUp;
                Ok(())
            }
            (PowerRequest::Up, State::DspStandby) => {
                self.dsp_power_up()?;
                self.state = State::DspPowerUp;
                Ok(())
            }
            (PowerRequest::Up, State::CalStandby) => {
                self.dsp_power_up()?;
                self.state = State::CalPowerUp;
                Ok(())
            }
            (PowerRequest::Down, State::PowerUp) => {
                self.port
                    .update_reg(REG_GLOBAL_ENABLES, GLOBAL_EN_MASK, 0)
                    .map_err(Error::Bus)?;
                self.state = State::Standby;
                Ok(())
            }
            (PowerRequest::Down, State::DspPowerUp) => {
                self.dsp_power_down()?;
                self.state = State::DspStandby;
                Ok(())
            }
            (PowerRequest::Down, State::CalPowerUp) => {
                self.dsp_power_down()?;
                self.state = State::CalStandby;
                Ok(())
            }
            (PowerRequest::Hibernate, State::DspPowerUp) => self.hibernate(),
            (PowerRequest::Wake, State::Hibernate) => self.wake(),
            _ => Err(Error::InvalidTransition),
        }
    }

    /// Run one calibration measurement. Only valid in [`State::CalPowerUp`].
    ///
    /// The analog gain is muted through the write-sequence log for the
    /// duration (so the mute is hibernate-durable), restored afterwards
    /// even when the measurement fails, and the result is cached in the
    /// handle and returned.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidTransition`], [`Error::SymbolMissing`],
    /// [`Error::Timeout`], or [`Error::Bus`].
    pub fn calibrate(&mut self, kind: CalibrationKind) -> Result<u32, Error<P::Error>> {
        if self.state != State::CalPowerUp {
            return Err(Error::InvalidTransition);
        }
        let fw = self.fw.as_ref().ok_or(Error::NoFirmware)?;
        let request = fw
            .find_symbol(SYM_ID_CAL_REQUEST)
            .ok_or(Error::SymbolMissing(SYM_ID_CAL_REQUEST))?;
        let status = fw
            .find_symbol(SYM_ID_CAL_STATUS)
            .ok_or(Error::SymbolMissing(SYM_ID_CAL_STATUS))?;
        let (request_value, result_id) = match kind {
            CalibrationKind::Impedance => (CAL_REQUEST_RE_DC, SYM_ID_CAL_RE_DC),
            CalibrationKind::ResonantFrequency => (CAL_REQUEST_F0, SYM_ID_CAL_F0),
        };
        let result = fw.find_symbol(result_id).ok_or(Error::SymbolMissing(result_id))?;

        // Mute for the duration; through the log so an interrupting
        // hibernate wakes up still muted.
        let gain = self.port.read_reg(REG_AMP_GAIN).map_err(Error::Bus)?;
        self.write_tracked(REG_AMP_GAIN, gain & !AMP_GAIN_PCM_MASK)?;

        let outcome = self.run_cal_phase(request, status, result, request_value);

        self.write_tracked(REG_AMP_GAIN, gain)?;
        let value = outcome?;

        let cal = self.cal.get_or_insert_with(CalibrationData::default);
        match kind {
            CalibrationKind::Impedance => cal.re_dc = Some(value),
            CalibrationKind::ResonantFrequency => cal.f0 = Some(value),
        }
        #[cfg(feature = "defmt")]
        defmt::info!("calibration result: {=u32:#x}", value);
        Ok(value)
    }

    /// The poll entry point. Call continuously from the host main loop.
    ///
    /// No-ops in `Unconfigured`/`Error`. Consumes the interrupt latch and,
    /// when the state permits register access, runs the event-service pass;
    /// a deferred latch costs nothing and loses nothing, because the
    /// hardware line stays asserted until serviced. Accumulated event flags
    /// (including the synthetic driver-error flag) are delivered to the
    /// notification callback exactly once, then cleared.
    ///
    /// # Errors
    ///
    /// [`Error::Bus`] when event handling itself failed — the driver is in
    /// [`State::Error`] by the time this returns.
    pub fn process(&mut self) -> Result<(), Error<P::Error>> {
        if matches!(self.state, State::Unconfigured | State::Error) {
            return Ok(());
        }
        let mut failure = None;
        if self.port.take_irq() {
            self.mode = Mode::HandlingEvents;
            let permitted = !matches!(self.state, State::Configured | State::Hibernate);
            if permitted {
                match event::handle_events(&mut self.port, self.config.event_mask) {
                    Ok(flags) => self.event_flags |= flags,
                    Err(e) => {
                        // Status bits may be half-cleared: ambiguous.
                        self.state = State::Error;
                        self.event_flags |= EVENT_DRIVER_ERROR;
                        failure = Some(e);
                    }
                }
            }
            self.mode = Mode::HandlingControls;
        }
        if self.event_flags != 0 {
            if let Some(notify) = self.config.notify {
                notify(self.event_flags);
            }
            self.event_flags = 0;
        }
        match failure {
            Some(e) => Err(Error::Bus(e)),
            None => Ok(()),
        }
    }

    /// Write a register and mirror it into the write-sequence log so the
    /// value survives hibernate. Addresses above the replayable low 64 KiB
    /// region are written but not tracked.
    ///
    /// # Errors
    ///
    /// [`Error::WseqFull`] when the log cannot take a new address — the
    /// write itself still reached the device.
    pub fn write_tracked(&mut self, addr: u32, value: u32) -> Result<(), Error<P::Error>> {
        self.port.write_reg(addr, value).map_err(Error::Bus)?;
        if addr <= WSEQ_ADDR_LIMIT {
            self.wseq.update(wseq_addr(addr), value)?;
        }
        Ok(())
    }

    // -- Accessors ----------------------------------------------------------

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> State {
        self.state
    }

    /// Current access mode.
    #[must_use]
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// DEVID read at the last successful reset.
    #[must_use]
    pub fn device_id(&self) -> u32 {
        self.devid
    }

    /// REVID read at the last successful reset.
    #[must_use]
    pub fn revision(&self) -> u32 {
        self.revid
    }

    /// The active firmware descriptor, if any.
    #[must_use]
    pub fn firmware(&self) -> Option<&FwDescriptor<'a>> {
        self.fw.as_ref()
    }

    /// Calibration measurements cached in this handle.
    #[must_use]
    pub fn calibration(&self) -> Option<CalibrationData> {
        self.cal
    }

    /// Seed the handle with persisted calibration (see [`crate::cal_store`]);
    /// applied to firmware RAM at the next [`Driver::boot`].
    pub fn set_cached_calibration(&mut self, cal: CalibrationData) {
        self.cal = Some(cal);
    }

    /// The write-sequence log (read-only; mutation goes through
    /// [`Driver::write_tracked`] and the lifecycle paths).
    #[must_use]
    pub fn write_sequence(&self) -> &WriteSequencer {
        &self.wseq
    }

    /// Escape hatch to the underlying transport.
    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    /// Consume the handle and return the transport.
    pub fn release(self) -> P {
        self.port
    }

    // -- Internal transitions ----------------------------------------------

    /// Resolve the firmware run-state symbol address.
    fn run_state_symbol(&self) -> Result<u32, Error<P::Error>> {
        let fw = self.fw.as_ref().ok_or(Error::NoFirmware)?;
        fw.find_symbol(SYM_ID_RUN_STATE)
            .ok_or(Error::SymbolMissing(SYM_ID_RUN_STATE))
    }

    /// Bounded poll of one register until `accept` passes.
    fn poll_until(
        &mut self,
        addr: u32,
        retries: u32,
        interval_ms: u32,
        accept: impl Fn(u32) -> bool,
    ) -> Result<u32, Error<P::Error>> {
        for attempt in 0..retries {
            if attempt > 0 {
                self.port.delay_ms(interval_ms);
            }
            let value = self.port.read_reg(addr).map_err(Error::Bus)?;
            if accept(value) {
                return Ok(value);
            }
        }
        Err(Error::Timeout)
    }

    /// Clock the DSP and wait for the firmware to report itself running.
    fn dsp_power_up(&mut self) -> Result<(), Error<P::Error>> {
        let run_state = self.run_state_symbol()?;
        self.port
            .update_reg(REG_GLOBAL_ENABLES, GLOBAL_EN_MASK, GLOBAL_EN_MASK)
            .map_err(Error::Bus)?;
        self.port
            .update_reg(REG_DSP_MEM_CTRL, DSP_MEM_EN_MASK, DSP_MEM_EN_MASK)
            .map_err(Error::Bus)?;
        self.port
            .update_reg(REG_DSP_CLOCK_CTRL, DSP_CLK_EN_MASK, DSP_CLK_EN_MASK)
            .map_err(Error::Bus)?;
        self.poll_until(run_state, DSP_STATE_RETRIES, DSP_STATE_INTERVAL_MS, |v| {
            v == FW_STATE_ACTIVE
        })?;
        Ok(())
    }

    /// Force the firmware into standby (acknowledged) and gate its clock.
    fn dsp_power_down(&mut self) -> Result<(), Error<P::Error>> {
        self.port
            .write_reg(REG_DSP_MBOX_CMD, MBOX_CMD_STANDBY)
            .map_err(Error::Bus)?;
        self.poll_until(REG_DSP_MBOX_CMD, MBOX_ACK_RETRIES, MBOX_ACK_INTERVAL_MS, |v| {
            v == MBOX_CMD_NONE
        })?;
        self.port
            .update_reg(REG_DSP_CLOCK_CTRL, DSP_CLK_EN_MASK, 0)
            .map_err(Error::Bus)?;
        Ok(())
    }

    /// Commit the replay table, then ask the firmware to power itself down.
    fn hibernate(&mut self) -> Result<(), Error<P::Error>> {
        self.wseq
            .commit(&mut self.port, REG_POWER_ON_SEQ_BASE)
            .map_err(Error::Bus)?;
        self.port.arm_irq(false).map_err(Error::Bus)?;
        self.port
            .write_reg(REG_DSP_MBOX_CMD, MBOX_CMD_HIBERNATE)
            .map_err(Error::Bus)?;
        self.state = State::Hibernate;
        #[cfg(feature = "defmt")]
        defmt::info!("hibernate entered, {=usize} writes replayable", self.wseq.len());
        Ok(())
    }

    /// Wake the chip, tolerating the NAK window while it is still asleep.
    fn wake(&mut self) -> Result<(), Error<P::Error>> {
        let fw_id = self.fw.as_ref().ok_or(Error::NoFirmware)?.fw_id;
        let run_state = self.run_state_symbol()?;

        for _ in 0..WAKE_ATTEMPTS {
            // The chip NAKs until its oscillator restarts; only here is a
            // transport failure tolerated rather than fatal.
            for _ in 0..WAKE_CMD_RETRIES {
                if self.port.write_reg(REG_DSP_MBOX_CMD, MBOX_CMD_WAKEUP).is_ok() {
                    break;
                }
                self.port.delay_ms(WAKE_CMD_INTERVAL_MS);
            }

            let mut alive = false;
            for attempt in 0..WAKE_FW_ID_RETRIES {
                if attempt > 0 {
                    self.port.delay_ms(WAKE_FW_ID_INTERVAL_MS);
                }
                if matches!(self.port.read_reg(REG_XM_FW_ID), Ok(v) if v == fw_id) {
                    alive = true;
                    break;
                }
            }

            if alive {
                self.poll_until(run_state, DSP_STATE_RETRIES, DSP_STATE_INTERVAL_MS, |v| {
                    v == FW_STATE_ACTIVE || v == FW_STATE_STANDBY
                })?;
                self.port.arm_irq(true).map_err(Error::Bus)?;
                self.state = State::DspPowerUp;
                return Ok(());
            }

            // Firmware never came back: force a clean hibernate entry and
            // retry the whole sequence.
            if let Err(e) = self.port.write_reg(REG_DSP_MBOX_CMD, MBOX_CMD_HIBERNATE) {
                // Neither awake nor known-asleep.
                self.state = State::Error;
                self.event_flags |= EVENT_DRIVER_ERROR;
                return Err(Error::Bus(e));
            }
            self.port.delay_ms(WAKE_REENTRY_DELAY_MS);
        }
        Err(Error::Timeout)
    }

    /// One timed calibration phase: trigger, settle, poll, read back.
    fn run_cal_phase(
        &mut self,
        request: u32,
        status: u32,
        result: u32,
        request_value: u32,
    ) -> Result<u32, Error<P::Error>> {
        self.port.write_reg(request, request_value).map_err(Error::Bus)?;
        self.port.delay_ms(CAL_SETTLE_MS);
        self.poll_until(status, CAL_POLL_RETRIES, CAL_POLL_INTERVAL_MS, |v| {
            v == CAL_STATUS_DONE
        })?;
        self.port.read_reg(result).map_err(Error::Bus)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Tests use unwrap() for readable assertions
#[allow(clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::mock::{MockError, MockPort};
    use crate::registers::REVID_B0;
    use core::cell::Cell;

    /// Symbol table the synthetic firmware exports.
    const SYMBOLS: &[SymbolEntry] = &[
        SymbolEntry { id: SYM_ID_RUN_STATE, address: 0x0280_1000 },
        SymbolEntry { id: SYM_ID_CAL_REQUEST, address: 0x0280_1004 },
        SymbolEntry { id: SYM_ID_CAL_STATUS, address: 0x0280_1008 },
        SymbolEntry { id: SYM_ID_CAL_RE_DC, address: 0x0280_100C },
        SymbolEntry { id: SYM_ID_CAL_F0, address: 0x0280_1010 },
    ];
    const ALG_IDS: &[u32] = &[0x0004_AB01];

    fn runtime_fw() -> FwDescriptor<'static> {
        FwDescriptor {
            fw_id: crate::registers::FW_ID_RUNTIME,
            fw_rev: 0x0001_0000,
            symbols: SYMBOLS,
            alg_ids: ALG_IDS,
        }
    }

    fn cal_fw() -> FwDescriptor<'static> {
        FwDescriptor {
            fw_id: FW_ID_CALIBRATION,
            ..runtime_fw()
        }
    }

    /// Mock seeded so reset() succeeds with boot-done on the second poll.
    fn bootable_port() -> MockPort {
        let mut port = MockPort::new();
        port.queue_read(REG_IRQ1_STATUS_1, 0);
        port.queue_read(REG_IRQ1_STATUS_1, IRQ1_BOOT_DONE_MASK);
        port.set_reg(REG_DEVID, DEVID_SA7210);
        port.set_reg(REG_REVID, REVID_B0);
        port
    }

    fn configured_standby<'d>() -> Driver<'d, MockPort> {
        let mut drv = Driver::new(bootable_port());
        drv.configure(Config::default()).unwrap();
        drv.reset().unwrap();
        drv
    }

    #[test]
    fn reset_requires_configuration_and_touches_nothing_early() {
        let mut drv = Driver::new(MockPort::new());
        assert_eq!(drv.reset(), Err(Error::InvalidTransition));
        assert_eq!(drv.port_mut().calls, 0);
    }

    #[test]
    fn reset_sequences_pulse_poll_identify_errata() {
        let mut drv = configured_standby();
        assert_eq!(drv.state(), State::Standby);
        assert_eq!(drv.device_id(), DEVID_SA7210);
        assert_eq!(drv.revision(), REVID_B0);

        let port = drv.port_mut();
        assert_eq!(port.reset_changes.as_slice(), &[true, false]);
        // Errata writes are bracketed by the unlock/lock key words.
        let unlock_at = port
            .reg_writes
            .iter()
            .position(|&w| w == (REG_TEST_KEY_CTRL, TEST_KEY_UNLOCK_1))
            .unwrap();
        let lock_at = port
            .reg_writes
            .iter()
            .position(|&w| w == (REG_TEST_KEY_CTRL, TEST_KEY_LOCK_2))
            .unwrap();
        for &(addr, value) in ERRATA_WRITES {
            let at = port.reg_writes.iter().position(|&w| w == (addr, value)).unwrap();
            assert!(unlock_at < at && at < lock_at);
        }
    }

    #[test]
    fn reset_reports_boot_error_bit() {
        let mut port = MockPort::new();
        port.queue_read(REG_IRQ1_STATUS_1, IRQ1_BOOT_ERR_MASK);
        let mut drv = Driver::new(port);
        drv.configure(Config::default()).unwrap();
        assert_eq!(drv.reset(), Err(Error::BootFailure));
        assert_eq!(drv.state(), State::Configured);
    }

    #[test]
    fn reset_times_out_when_boot_done_never_appears() {
        let mut drv = Driver::new(MockPort::new());
        drv.configure(Config::default()).unwrap();
        // Backing file reads 0 forever.
        assert_eq!(drv.reset(), Err(Error::Timeout));
        assert_eq!(drv.state(), State::Configured);
    }

    #[test]
    fn foreign_devid_is_rejected() {
        let mut port = MockPort::new();
        port.queue_read(REG_IRQ1_STATUS_1, IRQ1_BOOT_DONE_MASK);
        port.set_reg(REG_DEVID, 0x0000_9999);
        let mut drv = Driver::new(port);
        drv.configure(Config::default()).unwrap();
        assert_eq!(drv.reset(), Err(Error::UnsupportedDevice(0x9999)));
    }

    #[test]
    fn configure_is_idempotent_until_reset() {
        let mut drv = Driver::new(MockPort::new());
        drv.configure(Config::default()).unwrap();
        drv.configure(Config::default()).unwrap();
        assert_eq!(drv.state(), State::Configured);

        let mut drv = configured_standby();
        assert_eq!(
            drv.configure(Config::default()),
            Err(Error::InvalidTransition)
        );
    }

    #[test]
    fn boot_none_invalidates_firmware_without_hardware_access() {
        let mut drv = configured_standby();
        drv.boot(Some(runtime_fw())).unwrap();
        assert_eq!(drv.state(), State::DspStandby);
        let calls_before = drv.port_mut().calls;
        drv.boot(None).unwrap();
        assert_eq!(drv.state(), State::Standby);
        assert!(drv.firmware().is_none());
        assert_eq!(drv.port_mut().calls, calls_before);
    }

    #[test]
    fn boot_builds_replay_log_in_order_with_reserved_tail() {
        let mut drv = configured_standby();
        drv.boot(Some(runtime_fw())).unwrap();

        let seq = drv.write_sequence();
        // unlock(2) + errata(3) + post-boot(2) + defaults(0) + lock(2)
        assert_eq!(seq.len(), 9);
        assert_eq!(seq.get(0).unwrap().value, TEST_KEY_UNLOCK_1);
        assert_eq!(seq.get(1).unwrap().value, TEST_KEY_UNLOCK_2);
        assert_eq!(seq.get(7).unwrap().value, TEST_KEY_LOCK_1);
        assert_eq!(seq.get(8).unwrap().value, TEST_KEY_LOCK_2);
    }

    #[test]
    fn boot_selects_calibration_standby_for_cal_images() {
        let mut drv = configured_standby();
        drv.boot(Some(cal_fw())).unwrap();
        assert_eq!(drv.state(), State::CalStandby);
    }

    #[test]
    fn boot_applies_cached_calibration_through_symbols() {
        let mut drv = configured_standby();
        drv.set_cached_calibration(CalibrationData {
            re_dc: Some(0x1234),
            f0: None,
        });
        drv.boot(Some(runtime_fw())).unwrap();
        assert_eq!(drv.port_mut().reg_write_count(0x0280_100C, 0x1234), 1);
        // No f0 measurement, no f0 write.
        assert_eq!(drv.port_mut().reg_write_count(0x0280_1010, 0), 0);
    }

    #[test]
    fn power_up_is_rejected_before_standby_without_bus_traffic() {
        let mut drv = Driver::new(MockPort::new());
        assert_eq!(drv.power(PowerRequest::Up), Err(Error::InvalidTransition));
        drv.configure(Config::default()).unwrap();
        let calls = drv.port_mut().calls;
        assert_eq!(drv.power(PowerRequest::Up), Err(Error::InvalidTransition));
        assert_eq!(drv.port_mut().calls, calls);
    }

    #[test]
    fn pre_firmware_power_cycle_toggles_global_enable() {
        let mut drv = configured_standby();
        drv.power(PowerRequest::Up).unwrap();
        assert_eq!(drv.state(), State::PowerUp);
        drv.power(PowerRequest::Down).unwrap();
        assert_eq!(drv.state(), State::Standby);
        let port = drv.port_mut();
        assert_eq!(port.reg_write_count(REG_GLOBAL_ENABLES, GLOBAL_EN_MASK), 1);
        assert_eq!(port.reg_write_count(REG_GLOBAL_ENABLES, 0), 1);
    }

    #[test]
    fn dsp_power_up_polls_run_state_symbol() {
        let mut drv = configured_standby();
        drv.boot(Some(runtime_fw())).unwrap();
        drv.port_mut().queue_read(0x0280_1000, 0);
        drv.port_mut().queue_read(0x0280_1000, FW_STATE_ACTIVE);
        drv.power(PowerRequest::Up).unwrap();
        assert_eq!(drv.state(), State::DspPowerUp);
    }

    #[test]
    fn dsp_power_up_timeout_leaves_state_unchanged() {
        let mut drv = configured_standby();
        drv.boot(Some(runtime_fw())).unwrap();
        // Run state stays 0 forever.
        assert_eq!(drv.power(PowerRequest::Up), Err(Error::Timeout));
        assert_eq!(drv.state(), State::DspStandby);
    }

    #[test]
    fn dsp_power_down_needs_mailbox_acknowledge() {
        let mut drv = configured_standby();
        drv.boot(Some(runtime_fw())).unwrap();
        drv.port_mut().set_reg(0x0280_1000, FW_STATE_ACTIVE);
        drv.power(PowerRequest::Up).unwrap();

        drv.port_mut().queue_read(REG_DSP_MBOX_CMD, MBOX_CMD_NONE);
        drv.power(PowerRequest::Down).unwrap();
        assert_eq!(drv.state(), State::DspStandby);
        assert_eq!(
            drv.port_mut().reg_write_count(REG_DSP_MBOX_CMD, MBOX_CMD_STANDBY),
            1
        );
    }

    #[test]
    fn wake_is_only_valid_from_hibernate() {
        let mut drv = configured_standby();
        assert_eq!(drv.power(PowerRequest::Wake), Err(Error::InvalidTransition));
        drv.boot(Some(runtime_fw())).unwrap();
        assert_eq!(drv.power(PowerRequest::Wake), Err(Error::InvalidTransition));
    }

    #[test]
    fn calibrate_requires_cal_power_up() {
        let mut drv = configured_standby();
        assert_eq!(
            drv.calibrate(CalibrationKind::Impedance),
            Err(Error::InvalidTransition)
        );
    }

    #[test]
    fn calibrate_mutes_measures_and_restores_gain() {
        let mut drv = configured_standby();
        drv.boot(Some(cal_fw())).unwrap();
        drv.port_mut().set_reg(0x0280_1000, FW_STATE_ACTIVE);
        drv.power(PowerRequest::Up).unwrap();
        assert_eq!(drv.state(), State::CalPowerUp);

        let gain = 0x0000_0014;
        drv.port_mut().set_reg(REG_AMP_GAIN, gain);
        drv.port_mut()
            .queue_read(0x0280_1008, crate::registers::CAL_STATUS_IN_PROGRESS);
        drv.port_mut().queue_read(0x0280_1008, CAL_STATUS_DONE);
        drv.port_mut().set_reg(0x0280_100C, 0x0001_F3A2);

        let value = drv.calibrate(CalibrationKind::Impedance).unwrap();
        assert_eq!(value, 0x0001_F3A2);
        assert_eq!(drv.calibration().unwrap().re_dc, Some(0x0001_F3A2));

        let port = drv.port_mut();
        // Muted then restored.
        assert_eq!(port.reg_write_count(REG_AMP_GAIN, 0), 1);
        assert_eq!(port.reg_write_count(REG_AMP_GAIN, gain), 1);
        // Trigger written to the request symbol.
        assert_eq!(port.reg_write_count(0x0280_1004, CAL_REQUEST_RE_DC), 1);
        // The restored gain is what the replay table will reapply.
        let seq = drv.write_sequence();
        let tracked = (0..seq.len())
            .filter_map(|i| seq.get(i))
            .find(|e| u32::from(e.address) == REG_AMP_GAIN)
            .unwrap();
        assert_eq!(tracked.value, gain);
    }

    #[test]
    fn process_is_inert_when_unconfigured() {
        let mut drv = Driver::new(MockPort::new());
        drv.port_mut().raise_irq();
        drv.process().unwrap();
        assert_eq!(drv.port_mut().calls, 0);
    }

    #[test]
    fn process_delivers_flags_once_then_clears() {
        let seen = Cell::new(0u32);
        let hits = Cell::new(0u32);
        let notify = |flags: u32| {
            seen.set(flags);
            hits.set(hits.get() + 1);
        };
        let config = Config {
            notify: Some(&notify),
            ..Config::default()
        };

        let mut drv = Driver::new(bootable_port());
        drv.configure(config).unwrap();
        drv.reset().unwrap();

        drv.port_mut()
            .set_reg(REG_IRQ1_STATUS_1, crate::registers::IRQ1_AMP_SHORT_MASK);
        drv.port_mut().irq_latched = true;
        drv.process().unwrap();
        assert_eq!(seen.get(), crate::event::EVENT_AMP_SHORT);
        assert_eq!(hits.get(), 1);

        // Nothing pending: the callback must not fire again.
        drv.process().unwrap();
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn deferred_interrupt_consumes_latch_without_bus_access() {
        let mut drv = configured_standby();
        drv.boot(Some(runtime_fw())).unwrap();
        drv.port_mut().set_reg(0x0280_1000, FW_STATE_ACTIVE);
        drv.power(PowerRequest::Up).unwrap();
        drv.power(PowerRequest::Hibernate).unwrap();
        assert_eq!(drv.state(), State::Hibernate);

        // arm_irq(false) ran at hibernate; re-arm so the latch is visible,
        // as a spurious EXTI edge during hibernate would be.
        drv.port_mut().irq_armed = true;
        drv.port_mut().raise_irq();
        let calls = drv.port_mut().calls;
        drv.process().unwrap();
        assert_eq!(drv.port_mut().calls, calls);
        assert!(!drv.port_mut().irq_latched);
    }

    #[test]
    fn event_handling_bus_failure_is_terminal_and_flagged() {
        let seen = Cell::new(0u32);
        let notify = |flags: u32| seen.set(flags);
        let config = Config {
            notify: Some(&notify),
            ..Config::default()
        };
        let mut drv = Driver::new(bootable_port());
        drv.configure(config).unwrap();
        drv.reset().unwrap();

        drv.port_mut().irq_latched = true;
        drv.port_mut().nak_reads = 1;
        assert_eq!(drv.process(), Err(Error::Bus(MockError)));
        assert_eq!(drv.state(), State::Error);
        assert_eq!(seen.get(), EVENT_DRIVER_ERROR);

        // Terminal: further polls are inert until initialize().
        drv.process().unwrap();
        drv.initialize();
        assert_eq!(drv.state(), State::Unconfigured);
    }
}
