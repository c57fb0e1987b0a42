//! Command engine: one bus transaction at a time.
//!
//! A command is fired with a single CTL write carrying the command code and
//! the relevant enable bits. The enables self-clear when the hardware
//! finishes, so completion is a bounded poll for them to read back zero;
//! software must never write them back to zero itself.

use core::sync::atomic::{Ordering, fence};

use log::trace;

use crate::common::commands::{DataDirection, ResponseToken, ResponseType, SdhCommand, repack_r2};
use crate::host::{SdhController, SdhError, SdhResult};
use crate::regs::{self, Ctl, IntSts};

/// Engine-level failure, finer grained than [`SdhError`] so the init state
/// machine can tell a silent card from a wedged engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CmdError {
    /// Hardware response timeout: no start bit arrived (RTOIF).
    RspTimeout,
    /// The enable bits never self-cleared within the poll budget.
    Wedged,
    /// Response CRC7 fault on a response that requires validation.
    Crc7,
    /// The card went away mid-command.
    NoCard,
}

impl From<CmdError> for SdhError {
    fn from(err: CmdError) -> Self {
        match err {
            CmdError::RspTimeout | CmdError::Wedged => SdhError::Timeout,
            CmdError::Crc7 => SdhError::Crc7,
            CmdError::NoCard => SdhError::NoCard,
        }
    }
}

impl SdhController {
    /// Program argument and geometry, then fire one CTL write with the
    /// command code and `enables`.
    pub(crate) fn issue(&self, cmd: &SdhCommand, enables: Ctl) {
        self.regs.write_reg32(regs::CMDARG, cmd.arg);

        let mut ctl = self.regs.read_reg32(regs::CTL);
        ctl &= !(regs::CTL_CMDCODE_MSK | regs::CTL_BLKCNT_MSK);
        ctl |= ((cmd.opcode as u32) << regs::CTL_CMDCODE_POS) & regs::CTL_CMDCODE_MSK;
        if cmd.data != DataDirection::None {
            self.regs
                .write_reg32(regs::BLEN, (cmd.block_len - 1) & regs::BLEN_BLKLEN_MSK);
            ctl |= (cmd.block_count << regs::CTL_BLKCNT_POS) & regs::CTL_BLKCNT_MSK;
        }
        trace!(
            "sdh cmd{}: arg {:#010x}, resp {:?}, data {:?}",
            cmd.opcode, cmd.arg, cmd.resp, cmd.data
        );
        // Argument and geometry must land before the enables fire.
        fence(Ordering::Release);
        self.regs.write_reg32(regs::CTL, ctl | enables.bits());
    }

    /// Poll for the self-clearing enables in `mask` to drop, watching the
    /// response-timeout flag and the card-detect input on the way.
    pub(crate) fn wait_enable_clear(
        &mut self,
        mask: Ctl,
        response_expected: bool,
    ) -> Result<(), CmdError> {
        let mut budget = self.budget();
        loop {
            if !budget.tick() {
                return Err(CmdError::Wedged);
            }
            if self.regs.read_reg32(regs::CTL) & mask.bits() == 0 {
                // Operation finished; the status flags and response tokens
                // are final now. A response timeout also self-clears the
                // enables.
                fence(Ordering::Acquire);
                if response_expected && self.regs.intsts_any(IntSts::RTOIF) {
                    self.regs.clear_intsts(IntSts::RTOIF);
                    return Err(CmdError::RspTimeout);
                }
                return Ok(());
            }
            if self.card_gone() {
                return Err(CmdError::NoCard);
            }
        }
    }

    /// Command with no response phase (CMD0, deselect).
    pub(crate) fn command_only(&mut self, cmd: &SdhCommand) -> Result<(), CmdError> {
        self.issue(cmd, Ctl::COEN);
        self.wait_enable_clear(Ctl::COEN, false)
    }

    /// Command with a 48-bit response.
    pub(crate) fn command_with_response(
        &mut self,
        cmd: &SdhCommand,
    ) -> Result<ResponseToken, CmdError> {
        self.issue(cmd, Ctl::COEN | Ctl::RIEN);
        self.wait_enable_clear(Ctl::COEN | Ctl::RIEN, true)?;
        self.finish_response(cmd.resp)
    }

    /// Validate CRC7 per the response policy and latch the token.
    pub(crate) fn finish_response(
        &mut self,
        resp: ResponseType,
    ) -> Result<ResponseToken, CmdError> {
        let check = resp.has_crc7()
            && !(resp == ResponseType::R7 && self.session.r7_flag)
            && !self.session.r3_flag;
        if check {
            if !self.regs.intsts_any(IntSts::CRC7) {
                self.regs.clear_intsts(IntSts::CRCIF);
                return Err(CmdError::Crc7);
            }
        } else {
            // The engine computes CRC7 even for responses that carry none
            // and raises CRCIF; clear it so it cannot leak into later
            // transactions.
            self.regs.clear_intsts(IntSts::CRCIF);
        }
        Ok(ResponseToken::new(
            self.regs.read_reg32(regs::RESP0),
            self.regs.read_reg32(regs::RESP1),
        ))
    }

    /// Command with a 136-bit response (CID/CSD), delivered via the FIFO.
    pub(crate) fn command_r2(&mut self, cmd: &SdhCommand) -> Result<[u32; 4], CmdError> {
        self.issue(cmd, Ctl::COEN | Ctl::R2EN);
        self.wait_enable_clear(Ctl::COEN | Ctl::R2EN, true)?;
        if !self.regs.intsts_any(IntSts::CRC7) {
            self.regs.clear_intsts(IntSts::CRCIF);
            return Err(CmdError::Crc7);
        }
        let mut fifo = [0u32; 5];
        for (i, word) in fifo.iter_mut().enumerate() {
            *word = self.regs.read_fb(i as u32);
        }
        Ok(repack_r2(&fifo))
    }

    /// 74 initialization clocks after power up.
    pub(crate) fn clock_74(&mut self) -> Result<(), CmdError> {
        self.regs.set_bits32(regs::CTL, Ctl::CLK74OEN.bits());
        self.wait_enable_clear(Ctl::CLK74OEN, false)
    }

    /// One burst of 8 clocks, used to pump DAT0 while the card is busy.
    pub(crate) fn clock_8(&mut self) -> Result<(), CmdError> {
        self.regs.set_bits32(regs::CTL, Ctl::CLK8OEN.bits());
        self.wait_enable_clear(Ctl::CLK8OEN, false)
    }

    /// Drain card busy after an R1b command: pump clocks until DAT0 reads
    /// high again.
    pub(crate) fn check_rb(&mut self) -> Result<(), CmdError> {
        let mut budget = self.budget();
        loop {
            self.clock_8()?;
            if self.regs.intsts_any(IntSts::DAT0STS) {
                return Ok(());
            }
            if self.card_gone() {
                return Err(CmdError::NoCard);
            }
            if !budget.tick() {
                return Err(CmdError::Wedged);
            }
        }
    }

    /// Submit one bus transaction and decode its 48-bit response.
    ///
    /// Data-phase commands belong to the block engine; R2 responses go
    /// through [`SdhController::submit_r2`].
    pub fn submit(&mut self, cmd: &SdhCommand) -> SdhResult<ResponseToken> {
        if cmd.data != DataDirection::None || cmd.resp == ResponseType::R2 {
            return Err(self.session.set_last_error(SdhError::Fail));
        }
        let res = match cmd.resp {
            ResponseType::None => self.command_only(cmd).map(|_| ResponseToken::default()),
            _ => self.command_with_response(cmd),
        };
        res.map_err(|e| self.session.set_last_error(e.into()))
    }

    /// Submit a command expecting a 136-bit response and return the four
    /// payload words.
    pub fn submit_r2(&mut self, cmd: &SdhCommand) -> SdhResult<[u32; 4]> {
        if cmd.resp != ResponseType::R2 {
            return Err(self.session.set_last_error(SdhError::Fail));
        }
        self.command_r2(cmd)
            .map_err(|e| self.session.set_last_error(e.into()))
    }
}
