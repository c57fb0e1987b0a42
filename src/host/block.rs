//! Block transfer engine: DMA-driven sector read/write.
//!
//! The DMA engine works a word-aligned region in normal (non scatter-gather)
//! mode; callers handing over unaligned buffers are bounced through the pool.
//! On CRC or bus-abort faults both engines are software reset before the
//! error is reported, and the engine never retries on its own — after an
//! abort the data must be transferred again by the caller.

use core::sync::atomic::{Ordering, fence};

use log::{trace, warn};

use crate::common::{self, cmd as op};
use crate::common::commands::{ResponseType, SdhCommand};
use crate::host::{SdhController, SdhError, SdhResult};
use crate::osa;
use crate::regs::{self, Ctl, DmaCtl, DmaIntSts, GIntSts, IntSts};

impl SdhController {
    /// Software reset of the DMA and SD engines, required after CRC or
    /// target-abort faults before any further command.
    pub(crate) fn reset_engines(&mut self) {
        self.regs.set_bits32(regs::DMACTL, DmaCtl::DMARST.bits());
        if self
            .wait_reg_clear(regs::DMACTL, (DmaCtl::DMARST | DmaCtl::DMABUSY).bits())
            .is_err()
        {
            warn!("sdh: dma reset did not complete");
        }
        self.regs.set_bits32(regs::CTL, Ctl::CTLRST.bits());
        if self.wait_reg_clear(regs::CTL, Ctl::CTLRST.bits()).is_err() {
            warn!("sdh: sd engine reset did not complete");
        }
        self.regs
            .clear_intsts(IntSts::BLKDIF | IntSts::CRCIF | IntSts::RTOIF | IntSts::DITOIF);
    }

    /// Wait for the block-transfer-done flag, watching the data timeout,
    /// the DMA abort flags, and the card-detect input.
    fn wait_block_done(&mut self) -> SdhResult {
        let mut budget = self.budget();
        loop {
            if !budget.tick() {
                return Err(SdhError::Timeout);
            }
            if self.regs.intsts_any(IntSts::BLKDIF) {
                return Ok(());
            }
            if self.regs.intsts_any(IntSts::DITOIF) {
                self.regs.clear_intsts(IntSts::DITOIF);
                return Err(SdhError::Timeout);
            }
            let dma_sts = self.regs.read_reg32(regs::DMAINTSTS);
            if dma_sts & (DmaIntSts::ABORTIF | DmaIntSts::WEOTIF).bits() != 0 {
                self.regs.write_reg32(regs::DMAINTSTS, dma_sts);
                warn!("sdh: dma abort ({dma_sts:#x}), resetting engines");
                self.reset_engines();
                return Err(SdhError::Device);
            }
            if self.regs.read_reg32(regs::GINTSTS) & GIntSts::DTAIF.bits() != 0 {
                self.regs.write_reg32(regs::GINTSTS, GIntSts::DTAIF.bits());
                warn!("sdh: bus target abort, resetting engines");
                self.reset_engines();
                return Err(SdhError::Device);
            }
            if self.card_gone() {
                return Err(SdhError::NoCard);
            }
        }
    }

    /// Run one data-in command with the DMA destination armed.
    /// `dma_addr` must be word aligned.
    pub(crate) fn transfer_data_in(&mut self, cmd: &SdhCommand, dma_addr: usize) -> SdhResult {
        self.regs.write_reg32(regs::DMACTL, DmaCtl::DMAEN.bits());
        self.regs.write_reg32(regs::DMASA, dma_addr as u32);
        fence(Ordering::Release);

        self.issue(cmd, Ctl::COEN | Ctl::RIEN | Ctl::DIEN);
        self.wait_enable_clear(Ctl::COEN | Ctl::RIEN, true)?;
        self.finish_response(cmd.resp)?;
        self.wait_block_done()?;
        fence(Ordering::Acquire);

        let crc16_ok = self.regs.intsts_any(IntSts::CRC16);
        self.regs.clear_intsts(IntSts::BLKDIF | IntSts::CRCIF);
        if !crc16_ok {
            warn!("sdh: data-in CRC16 fault, resetting engines");
            self.reset_engines();
            return Err(SdhError::Crc16);
        }
        Ok(())
    }

    /// Run one data-out command with the DMA source armed.
    /// `dma_addr` must be word aligned.
    pub(crate) fn transfer_data_out(&mut self, cmd: &SdhCommand, dma_addr: usize) -> SdhResult {
        self.regs.write_reg32(regs::DMACTL, DmaCtl::DMAEN.bits());
        self.regs.write_reg32(regs::DMASA, dma_addr as u32);
        fence(Ordering::Release);

        self.issue(cmd, Ctl::COEN | Ctl::RIEN | Ctl::DOEN);
        self.wait_enable_clear(Ctl::COEN | Ctl::RIEN, true)?;
        self.finish_response(cmd.resp)?;
        self.wait_block_done()?;

        let crcsts =
            (self.regs.read_reg32(regs::INTSTS) & regs::INTSTS_CRCSTS_MSK) >> regs::INTSTS_CRCSTS_POS;
        self.regs.clear_intsts(IntSts::BLKDIF | IntSts::CRCIF);
        if crcsts != regs::CRCSTS_POSITIVE {
            warn!("sdh: data-out CRC status {crcsts:#b}, resetting engines");
            self.reset_engines();
            return Err(SdhError::Crc);
        }
        Ok(())
    }

    /// Read `count` sectors into `buf`.
    ///
    /// Returns the number of bytes transferred. `count` must be positive and
    /// `start_sector + count` must stay within the identified capacity; both
    /// are rejected before any register is touched. Recovery after an error
    /// is the caller's responsibility.
    pub fn read_blocks(
        &mut self,
        buf: &mut [u8],
        start_sector: u32,
        count: u32,
    ) -> SdhResult<usize> {
        self.require_transfer_session()?;
        self.validate_range(buf.len(), start_sector, count)?;

        let res = if buf.as_ptr() as usize % 4 == 0 {
            self.read_dma(buf.as_mut_ptr() as usize, start_sector, count)
        } else {
            self.read_bounced(buf, start_sector, count)
        };
        match res {
            Ok(()) => Ok(count as usize * common::SECTOR_SIZE as usize),
            Err(e) => Err(self.session.set_last_error(e)),
        }
    }

    /// Write `count` sectors from `buf`. Symmetric to [`Self::read_blocks`];
    /// a write-protected card is refused before any hardware access.
    pub fn write_blocks(&mut self, buf: &[u8], start_sector: u32, count: u32) -> SdhResult<usize> {
        if let Some(write_protected) = self.config.write_protect {
            if write_protected() {
                warn!("sdh: card is write protected");
                return Err(self.session.set_last_error(SdhError::WriteProtect));
            }
        }
        self.require_transfer_session()?;
        self.validate_range(buf.len(), start_sector, count)?;

        let res = if buf.as_ptr() as usize % 4 == 0 {
            self.write_dma(buf.as_ptr() as usize, start_sector, count)
        } else {
            self.write_bounced(buf, start_sector, count)
        };
        match res {
            Ok(()) => Ok(count as usize * common::SECTOR_SIZE as usize),
            Err(e) => Err(self.session.set_last_error(e)),
        }
    }

    fn validate_range(&mut self, buf_len: usize, start_sector: u32, count: u32) -> SdhResult {
        let total = self.session.total_sectors;
        let in_range = count > 0
            && start_sector
                .checked_add(count)
                .is_some_and(|end| end <= total)
            && buf_len >= count as usize * common::SECTOR_SIZE as usize;
        if !in_range {
            return Err(self.session.set_last_error(SdhError::Fail));
        }
        Ok(())
    }

    /// Sector number or byte offset, depending on the capacity class.
    fn data_address(&self, sector: u32) -> u32 {
        if self.session.card_type.is_sector_addressed() {
            sector
        } else {
            sector * common::SECTOR_SIZE
        }
    }

    fn read_dma(&mut self, dest: usize, start_sector: u32, count: u32) -> SdhResult {
        let mut sector = start_sector;
        let mut addr = dest;
        let mut remaining = count;
        while remaining > 0 {
            // BLKCNT is 8 bits wide and must never be programmed 0.
            let n = remaining.min(common::MAX_BLOCKS_PER_CMD);
            let (opcode, multi) = if n == 1 {
                (op::READ_SINGLE_BLOCK, false)
            } else {
                (op::READ_MULTIPLE_BLOCK, true)
            };
            trace!("sdh read: sector {sector}, {n} blocks -> {addr:#x}");
            let cmd = SdhCommand::new(opcode, self.data_address(sector), ResponseType::R1)
                .with_data_in(n, common::SECTOR_SIZE);
            self.transfer_data_in(&cmd, addr)?;
            if multi {
                self.stop_transmission()?;
            }
            remaining -= n;
            sector += n;
            addr += (n * common::SECTOR_SIZE) as usize;
        }
        Ok(())
    }

    fn write_dma(&mut self, src: usize, start_sector: u32, count: u32) -> SdhResult {
        let mut sector = start_sector;
        let mut addr = src;
        let mut remaining = count;
        while remaining > 0 {
            let n = remaining.min(common::MAX_BLOCKS_PER_CMD);
            let (opcode, multi) = if n == 1 {
                (op::WRITE_BLOCK, false)
            } else {
                (op::WRITE_MULTIPLE_BLOCK, true)
            };
            trace!("sdh write: sector {sector}, {n} blocks <- {addr:#x}");
            let cmd = SdhCommand::new(opcode, self.data_address(sector), ResponseType::R1)
                .with_data_out(n, common::SECTOR_SIZE);
            self.transfer_data_out(&cmd, addr)?;
            if multi {
                self.stop_transmission()?;
            } else {
                // Single-block writes still leave the card programming.
                self.check_rb()?;
            }
            remaining -= n;
            sector += n;
            addr += (n * common::SECTOR_SIZE) as usize;
        }
        Ok(())
    }

    fn read_bounced(&mut self, buf: &mut [u8], start_sector: u32, count: u32) -> SdhResult {
        warn!("sdh: read buffer not word aligned, bouncing through the dma pool");
        let mut sector = start_sector;
        let mut done = 0usize;
        let mut remaining = count;
        while remaining > 0 {
            let n = remaining.min(common::MAX_BLOCKS_PER_CMD);
            let bytes = (n * common::SECTOR_SIZE) as usize;
            let bounce =
                osa::pool_alloc_aligned(bytes, 4).map_err(|_| SdhError::OutOfMemory)?;
            self.read_dma(bounce.addr(), sector, n)?;
            buf[done..done + bytes].copy_from_slice(&bounce.as_slice()[..bytes]);
            remaining -= n;
            sector += n;
            done += bytes;
        }
        Ok(())
    }

    fn write_bounced(&mut self, buf: &[u8], start_sector: u32, count: u32) -> SdhResult {
        warn!("sdh: write buffer not word aligned, bouncing through the dma pool");
        let mut sector = start_sector;
        let mut done = 0usize;
        let mut remaining = count;
        while remaining > 0 {
            let n = remaining.min(common::MAX_BLOCKS_PER_CMD);
            let bytes = (n * common::SECTOR_SIZE) as usize;
            let mut bounce =
                osa::pool_alloc_aligned(bytes, 4).map_err(|_| SdhError::OutOfMemory)?;
            bounce
                .copy_from_slice(&buf[done..done + bytes])
                .map_err(|_| SdhError::OutOfMemory)?;
            self.write_dma(bounce.addr(), sector, n)?;
            remaining -= n;
            sector += n;
            done += bytes;
        }
        Ok(())
    }

    /// CMD12 after a multi-block transfer, then drain card busy.
    fn stop_transmission(&mut self) -> SdhResult {
        self.command_with_response(&SdhCommand::new(
            op::STOP_TRANSMISSION,
            0,
            ResponseType::R1,
        ))?;
        self.check_rb()?;
        Ok(())
    }
}
