pub(crate) mod block;
pub(crate) mod cmd;
pub(crate) mod init;

use log::{debug, info, warn};

use crate::card::{CardSession, CardState};
use crate::osa;
use crate::regs::{self, Ctl, DmaCtl, DmaIntEn, Ectl, GIntEn, Gctl, IntEn, IntSts, SdhRegs};

/// Driver error codes. Stored in the session as `last_error` after every
/// failed operation so upper layers can report diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdhError {
    /// Generic failure: wedged engine reset, rejected arguments.
    Fail,
    /// Response or data-in never arrived within the wait bound.
    Timeout,
    /// No identified card behind the session.
    NoCard,
    /// DMA bus abort; both engines were reset before returning.
    Device,
    /// Card stayed busy beyond the OCR retry bound.
    InitTimeout,
    /// CMD7 selection failed during bring-up.
    SelectError,
    /// Write refused before touching the hardware.
    WriteProtect,
    /// A required CRC failed during bring-up.
    InitError,
    /// Response CRC7 fault on a response that requires one.
    Crc7,
    /// Data-in CRC16 fault; both engines were reset before returning.
    Crc16,
    /// Data-out CRC status fault; both engines were reset before returning.
    Crc,
    /// The voltage-check command wedged the engine.
    Cmd8,
    /// The DMA bounce pool could not satisfy an allocation.
    OutOfMemory,
}

pub type SdhResult<T = ()> = Result<T, SdhError>;

/// Card detect input routing. The two sources report CDSTS with opposite
/// polarity: DAT3 reads 1 when a card is inserted, GPIO reads 1 when it is
/// removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardDetectSource {
    /// Card DAT3 pin; needs a free-running SD clock (CLKKEEP).
    Dat3,
    /// Board GPIO routed to the controller.
    Gpio,
}

/// One of the two card ports multiplexed onto a controller engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdhPort {
    Port0,
    Port1,
}

impl SdhPort {
    pub const fn index(self) -> u32 {
        match self {
            SdhPort::Port0 => 0,
            SdhPort::Port1 => 1,
        }
    }
}

/// Default poll-iteration bound per wait primitive.
pub const DEFAULT_TIMEOUT: u32 = 2_000_000;
/// Default OCR busy retry bound.
pub const DEFAULT_OCR_RETRY: u32 = 2_000_000;
/// Hardware response/data-in timeout backstop programmed at open.
const DEFAULT_TOUT: u32 = 0xFFFFF;

/// Static description of one controller instance.
///
/// The original driver kept file-scope `SD0`/`SD1` state; here the platform
/// builds whatever registry it needs out of owned [`SdhController`] values,
/// one per `SdhConfig`.
#[derive(Debug, Clone, Copy)]
pub struct SdhConfig {
    /// Base address of the SDH register block.
    pub base_addr: usize,
    pub detect_source: CardDetectSource,
    /// Board write-protect input, polled before any write command.
    pub write_protect: Option<fn() -> bool>,
    /// Platform hook that retargets the SD engine clock, in kHz. The divider
    /// lives in the SoC clock controller, outside this register block.
    pub set_clock_khz: Option<fn(u32)>,
    /// Called once per poll iteration, e.g. a microsecond delay or an RTOS
    /// yield. Without one the waits are plain spin loops.
    pub delay: Option<fn()>,
    /// Poll-iteration bound handed to every wait primitive.
    pub timeout: u32,
    /// How many OCR rounds to tolerate a busy card during bring-up.
    pub ocr_retry: u32,
}

impl SdhConfig {
    pub const fn new(base_addr: usize) -> Self {
        SdhConfig {
            base_addr,
            detect_source: CardDetectSource::Dat3,
            write_protect: None,
            set_clock_khz: None,
            delay: None,
            timeout: DEFAULT_TIMEOUT,
            ocr_retry: DEFAULT_OCR_RETRY,
        }
    }
}

/// Bounded busy-wait. Every polling loop in the driver runs off one of
/// these, so no wait can spin forever.
pub(crate) struct PollBudget {
    remaining: u32,
    delay: Option<fn()>,
}

impl PollBudget {
    pub(crate) fn new(limit: u32, delay: Option<fn()>) -> Self {
        PollBudget {
            remaining: limit,
            delay,
        }
    }

    /// One more spin. Returns false once the budget is exhausted.
    pub(crate) fn tick(&mut self) -> bool {
        if self.remaining == 0 {
            return false;
        }
        self.remaining -= 1;
        match self.delay {
            Some(delay) => delay(),
            None => core::hint::spin_loop(),
        }
        true
    }
}

/// One SD/MMC host controller instance.
///
/// At most one command or data transfer may be in flight per controller;
/// callers sharing a controller across threads must wrap it in their own
/// single-owner lock. Two controllers operate fully independently.
pub struct SdhController {
    pub(crate) regs: SdhRegs,
    pub(crate) config: SdhConfig,
    pub(crate) session: CardSession,
}

impl SdhController {
    pub fn new(config: SdhConfig) -> Self {
        SdhController {
            regs: SdhRegs::new(config.base_addr),
            config,
            session: CardSession::new(),
        }
    }

    pub fn session(&self) -> &CardSession {
        &self.session
    }

    pub(crate) fn budget(&self) -> PollBudget {
        PollBudget::new(self.config.timeout, self.config.delay)
    }

    /// Busy-wait for `mask` bits at `offset` to read back zero.
    pub(crate) fn wait_reg_clear(&self, offset: u32, mask: u32) -> SdhResult {
        let mut budget = self.budget();
        while self.regs.read_reg32(offset) & mask != 0 {
            if !budget.tick() {
                return Err(SdhError::Fail);
            }
        }
        Ok(())
    }

    /// Power up and reset the engine, program the card-detect source, and
    /// start a fresh session. Must run before probe/read/write.
    pub fn open(&mut self) -> SdhResult {
        osa::pool_init();

        // Global engine reset, then enable the SD function.
        self.regs.set_bits32(regs::GCTL, Gctl::GCTLRST.bits());
        self.wait_reg_clear(regs::GCTL, Gctl::GCTLRST.bits())?;
        self.regs.write_reg32(regs::GCTL, Gctl::SDEN.bits());

        // DMA engine on, internal state cleared.
        self.regs
            .write_reg32(regs::DMACTL, (DmaCtl::DMAEN | DmaCtl::DMARST).bits());
        self.wait_reg_clear(regs::DMACTL, DmaCtl::DMARST.bits())?;
        self.regs.set_bits32(regs::CTL, Ctl::CTLRST.bits());
        self.wait_reg_clear(regs::CTL, Ctl::CTLRST.bits())?;

        // NWR gap for block writes.
        let mut ctl = self.regs.read_reg32(regs::CTL);
        ctl = (ctl & !regs::CTL_SDNWR_MSK) | (0x9 << regs::CTL_SDNWR_POS);
        self.regs.write_reg32(regs::CTL, ctl);

        // Card detect routing. DAT3 sampling needs the clock kept running.
        match self.config.detect_source {
            CardDetectSource::Dat3 => {
                self.regs
                    .clear_bits32(regs::INTEN, (IntEn::CDSRC0 | IntEn::CDSRC1).bits());
                self.regs.set_bits32(regs::CTL, Ctl::CLKKEEP0.bits());
            }
            CardDetectSource::Gpio => {
                self.regs
                    .set_bits32(regs::INTEN, (IntEn::CDSRC0 | IntEn::CDSRC1).bits());
            }
        }
        self.regs.set_bits32(
            regs::INTEN,
            (IntEn::CDIEN0 | IntEn::RTOIEN | IntEn::DITOIEN).bits(),
        );
        self.regs
            .write_reg32(regs::DMAINTEN, (DmaIntEn::ABORTIEN | DmaIntEn::WEOTIEN).bits());
        self.regs.write_reg32(regs::GINTEN, GIntEn::DTAIEN.bits());

        // Port 0 powered by default; card_select powers the other port.
        self.regs.clear_bits32(regs::ECTL, Ectl::POWEROFF0.bits());

        self.regs.write_reg32(regs::TOUT, DEFAULT_TOUT & regs::TOUT_MSK);
        self.regs
            .write_reg32(regs::BLEN, crate::common::SECTOR_SIZE - 1);

        // Drop anything a previous session left pending.
        self.regs.clear_intsts(
            IntSts::BLKDIF
                | IntSts::CRCIF
                | IntSts::CDIF0
                | IntSts::CDIF1
                | IntSts::RTOIF
                | IntSts::DITOIF,
        );

        self.session = CardSession::new();
        debug!(
            "sdh open: base {:#x}, detect {:?}",
            self.config.base_addr, self.config.detect_source
        );
        Ok(())
    }

    /// Quiesce interrupt generation and invalidate the session. Leaves the
    /// configuration registers (CTL fields, BLEN, TOUT) untouched, so a
    /// subsequent open starts from a known place. Safe to call repeatedly,
    /// and before open.
    pub fn close(&mut self) {
        self.regs.clear_bits32(
            regs::INTEN,
            (IntEn::BLKDIEN
                | IntEn::CRCIEN
                | IntEn::CDIEN0
                | IntEn::CDIEN1
                | IntEn::RTOIEN
                | IntEn::DITOIEN
                | IntEn::WKIEN)
                .bits(),
        );
        self.regs.write_reg32(regs::DMAINTEN, 0);
        self.regs.write_reg32(regs::GINTEN, 0);
        self.session.clear();
        debug!("sdh close: base {:#x}", self.config.base_addr);
    }

    /// Raw detect state for `port`: (change pending, card present).
    fn detect_bits(&self, port: u32) -> (bool, bool) {
        let sts = IntSts::from_bits_truncate(self.regs.read_reg32(regs::INTSTS));
        let (cdif, cdsts) = if port == 1 {
            (IntSts::CDIF1, IntSts::CDSTS1)
        } else {
            (IntSts::CDIF0, IntSts::CDSTS0)
        };
        let raw = sts.contains(cdsts);
        let present = match self.config.detect_source {
            CardDetectSource::Dat3 => raw,
            CardDetectSource::Gpio => !raw,
        };
        (sts.contains(cdif), present)
    }

    pub(crate) fn presence(&self, port: SdhPort) -> bool {
        self.detect_bits(port.index()).1
    }

    /// Sample the card-detect input and reconcile the session with it.
    ///
    /// A fresh insertion re-runs the initialization state machine; a removal
    /// clears the session so any further transfer fails with `NoCard`.
    /// Returns the physical presence.
    pub fn card_detection(&mut self, port: SdhPort) -> SdhResult<bool> {
        let idx = port.index();
        let (change, present) = self.detect_bits(idx);
        if change {
            let flag = if idx == 1 { IntSts::CDIF1 } else { IntSts::CDIF0 };
            self.regs.clear_intsts(flag);
        }

        if !present {
            if self.session.is_card_insert {
                info!("sdh: card removed");
                self.session.clear();
            }
        } else if !self.session.is_card_insert {
            info!("sdh: card inserted, probing");
            // Probe records its own outcome in the session.
            let _ = self.probe(port);
        }
        Ok(present)
    }

    /// Route the engine to `port` and power it. The selection is plain
    /// register state, re-read by every operation that needs it.
    pub fn card_select(&mut self, port: SdhPort) {
        let mut ctl = self.regs.read_reg32(regs::CTL);
        ctl = (ctl & !regs::CTL_SDPORT_MSK) | (port.index() << regs::CTL_SDPORT_POS);
        self.regs.write_reg32(regs::CTL, ctl);
        let poweroff = match port {
            SdhPort::Port0 => Ectl::POWEROFF0,
            SdhPort::Port1 => Ectl::POWEROFF1,
        };
        self.regs.clear_bits32(regs::ECTL, poweroff.bits());
    }

    /// Port index currently routed to the engine.
    pub fn which_card_is_selected(&self) -> u32 {
        (self.regs.read_reg32(regs::CTL) & regs::CTL_SDPORT_MSK) >> regs::CTL_SDPORT_POS
    }

    /// Fold a pending removal event into the session. Wait loops call this
    /// so a pulled card surfaces as `NoCard` instead of a generic timeout.
    pub(crate) fn card_gone(&mut self) -> bool {
        if !self.session.is_card_insert {
            return false;
        }
        let port = self.which_card_is_selected();
        let (change, present) = self.detect_bits(port);
        if change && !present {
            let flag = if port == 1 { IntSts::CDIF1 } else { IntSts::CDIF0 };
            self.regs.clear_intsts(flag);
            warn!("sdh: card removed mid-operation");
            self.session.clear();
            return true;
        }
        false
    }

    /// Session is usable for data commands?
    pub(crate) fn require_transfer_session(&mut self) -> SdhResult {
        self.card_gone();
        if !self.session.is_card_insert || self.session.state != CardState::Transfer {
            return Err(self.session.set_last_error(SdhError::NoCard));
        }
        Ok(())
    }
}
