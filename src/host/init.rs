//! Card bring-up: power-up, identification, selection, bus configuration.
//!
//! The sequence walks the session through Idle → Ready → Identified →
//! Standby → Transfer with plain sequential commands. Every wait inside is
//! budget bounded, so probe always terminates: either in Transfer or with a
//! terminal error and a cleared session.

use log::{debug, info};

use crate::card::{CardCid, CardSession, CardState, CardType, parse_csd};
use crate::common::{self, cmd as op};
use crate::common::commands::{ResponseType, SdhCommand};
use crate::host::cmd::CmdError;
use crate::host::{SdhController, SdhError, SdhPort, SdhResult};
use crate::regs::{self, Ctl, IntSts};

/// EXT_CSD byte offset of SEC_COUNT.
const EXT_CSD_SEC_CNT: usize = 212;
/// SD CMD6: query function group 1 for high-speed support.
const SWITCH_CHECK_HS_ARG: u32 = 0x00FF_FF01;
/// SD CMD6: engage function group 1 high-speed.
const SWITCH_SET_HS_ARG: u32 = 0x80FF_FF01;
/// MMC SWITCH: write EXT_CSD.BUS_WIDTH for 4-bit.
const MMC_SWITCH_BUS_WIDTH_4_ARG: u32 = 0x03B7_0100;

fn init_map(err: CmdError) -> SdhError {
    match err {
        CmdError::Crc7 => SdhError::InitError,
        CmdError::NoCard => SdhError::NoCard,
        CmdError::RspTimeout | CmdError::Wedged => SdhError::Timeout,
    }
}

impl SdhController {
    /// Run the full initialization state machine on `port`.
    ///
    /// On success the session is in Transfer state and the card type is
    /// returned. On failure the session is cleared (card not usable) with
    /// the error retained for diagnostics.
    pub fn probe(&mut self, port: SdhPort) -> SdhResult<CardType> {
        self.card_select(port);
        self.session = CardSession::new();

        if !self.presence(port) {
            return Err(self.session.set_last_error(SdhError::NoCard));
        }
        self.session.is_card_insert = true;

        // Identification needs a clean engine.
        self.reset_engines();
        self.regs.clear_intsts(
            IntSts::BLKDIF | IntSts::CRCIF | IntSts::RTOIF | IntSts::DITOIF,
        );
        self.regs
            .write_reg32(regs::BLEN, common::SECTOR_SIZE - 1);

        if let Some(set_clock) = self.config.set_clock_khz {
            set_clock(common::INIT_FREQ_KHZ);
        }

        match self.bring_up() {
            Ok(card_type) => {
                info!(
                    "sdh: {:?} card ready, {} sectors ({} KiB)",
                    card_type, self.session.total_sectors, self.session.disk_size_kb
                );
                Ok(card_type)
            }
            Err(e) => {
                // A failed CRC anywhere in the sequence aborts the whole open.
                let e = match e {
                    SdhError::Crc7 | SdhError::Crc16 | SdhError::Crc => SdhError::InitError,
                    other => other,
                };
                self.session.set_last_error(e);
                self.session.clear();
                Err(e)
            }
        }
    }

    fn bring_up(&mut self) -> SdhResult<CardType> {
        self.identify()?;
        self.read_card_info()?;
        self.enter_transfer()?;
        Ok(self.session.card_type)
    }

    /// Power-up and identification: 74 clocks, CMD0, voltage check, OCR
    /// exchange, CID, relative address.
    fn identify(&mut self) -> SdhResult {
        self.clock_74().map_err(init_map)?;
        self.command_only(&SdhCommand::new(op::GO_IDLE_STATE, 0, ResponseType::None))
            .map_err(init_map)?;
        self.session.state = CardState::Idle;

        // Voltage check. Pre-2.0 cards legitimately never answer and a
        // garbled answer just demotes the card to the legacy path; only a
        // wedged engine is fatal here.
        self.session.r7_flag = true;
        let if_cond = self.command_with_response(&SdhCommand::new(
            op::SEND_IF_COND,
            common::IF_COND_ARG,
            ResponseType::R7,
        ));
        self.session.r7_flag = false;

        let card_type = match if_cond {
            Ok(tok) if tok.check_pattern() == 0x55 => {
                self.ocr_poll(true, common::OP_COND_HCS_ARG)?
            }
            Ok(_) | Err(CmdError::RspTimeout) | Err(CmdError::Crc7) => self.legacy_identify()?,
            Err(CmdError::Wedged) => return Err(SdhError::Cmd8),
            Err(CmdError::NoCard) => return Err(SdhError::NoCard),
        };
        self.session.card_type = card_type;
        self.session.state = CardState::Ready;
        debug!("sdh: identified {card_type:?}");

        let cid_raw = self
            .command_r2(&SdhCommand::new(op::ALL_SEND_CID, 0, ResponseType::R2))
            .map_err(init_map)?;
        debug!("sdh cid: {:x?}", CardCid::from_raw(&cid_raw));

        match card_type {
            CardType::SdHigh | CardType::SdLow => {
                let tok = self
                    .command_with_response(&SdhCommand::new(
                        op::SEND_RELATIVE_ADDR,
                        0,
                        ResponseType::R6,
                    ))
                    .map_err(init_map)?;
                self.session.rca = tok.rca();
            }
            _ => {
                // MMC/eMMC: the host assigns the address.
                self.command_with_response(&SdhCommand::new(
                    op::SEND_RELATIVE_ADDR,
                    common::MMC_RCA_ARG,
                    ResponseType::R1,
                ))
                .map_err(init_map)?;
                self.session.rca = common::MMC_RCA_ARG >> 16;
            }
        }
        self.session.state = CardState::Identified;
        Ok(())
    }

    /// No usable CMD8 answer: retry ACMD41 without HCS, falling through to
    /// the MMC op-cond command if the card rejects the SD application path.
    fn legacy_identify(&mut self) -> SdhResult<CardType> {
        debug!("sdh: no CMD8 response, legacy identification");
        match self.command_with_response(&SdhCommand::new(op::APP_CMD, 0, ResponseType::R1)) {
            Ok(_) => self.ocr_poll(true, common::OP_COND_LEGACY_ARG),
            Err(CmdError::RspTimeout) | Err(CmdError::Crc7) => {
                self.command_only(&SdhCommand::new(op::GO_IDLE_STATE, 0, ResponseType::None))
                    .map_err(init_map)?;
                self.ocr_poll(false, common::OP_COND_HCS_ARG)
            }
            Err(e) => Err(init_map(e)),
        }
    }

    /// Repeat the op-cond exchange while the card reports busy, bounded by
    /// the configured retry count. OCR responses carry no CRC7, so the R3
    /// policy flag suppresses CRC checking for the duration.
    fn ocr_poll(&mut self, sd: bool, arg: u32) -> SdhResult<CardType> {
        self.session.r3_flag = true;
        let result = self.ocr_poll_inner(sd, arg);
        self.session.r3_flag = false;
        result
    }

    fn ocr_poll_inner(&mut self, sd: bool, arg: u32) -> SdhResult<CardType> {
        let mut retry = self.config.ocr_retry;
        loop {
            let ocr = if sd {
                self.command_with_response(&SdhCommand::new(op::APP_CMD, 0, ResponseType::R1))
                    .map_err(init_map)?;
                self.command_with_response(&SdhCommand::new(
                    op::SD_SEND_OP_COND,
                    arg,
                    ResponseType::R3,
                ))
                .map_err(init_map)?
                .ocr()
            } else {
                self.command_with_response(&SdhCommand::new(
                    op::SEND_OP_COND,
                    arg,
                    ResponseType::R3,
                ))
                .map_err(init_map)?
                .ocr()
            };

            if ocr & common::OCR_READY != 0 {
                let sector_addressed = ocr & common::OCR_CCS != 0;
                return Ok(match (sd, sector_addressed) {
                    (true, true) => CardType::SdHigh,
                    (true, false) => CardType::SdLow,
                    (false, true) => CardType::Emmc,
                    (false, false) => CardType::Mmc,
                });
            }
            if retry == 0 {
                return Err(SdhError::InitTimeout);
            }
            retry -= 1;
        }
    }

    /// CMD9 capacity decode; large MMC parts carry the real sector count in
    /// EXT_CSD, which takes a temporary selection to read.
    fn read_card_info(&mut self) -> SdhResult {
        let raw = self
            .command_r2(&SdhCommand::new(
                op::SEND_CSD,
                self.session.rca << 16,
                ResponseType::R2,
            ))
            .map_err(init_map)?;
        let is_mmc = matches!(self.session.card_type, CardType::Mmc | CardType::Emmc);
        let info = parse_csd(&raw, is_mmc);
        let mut total_sectors = info.total_sectors;
        let mut disk_size_kb = info.disk_size_kb;

        if is_mmc && info.structure >= 2 && info.c_size == 0xFFF {
            self.command_with_response(&SdhCommand::new(
                op::SELECT_CARD,
                self.session.rca << 16,
                ResponseType::R1,
            ))
            .map_err(|_| SdhError::SelectError)?;
            self.check_rb().map_err(init_map)?;

            let mut ext_csd = [0u32; 128];
            let cmd = SdhCommand::new(op::SEND_EXT_CSD, 0, ResponseType::R1)
                .with_data_in(1, common::SECTOR_SIZE);
            self.transfer_data_in(&cmd, ext_csd.as_mut_ptr() as usize)?;
            // The buffer was filled by DMA; read it as the hardware left it.
            let sec_count = u32::from_le(unsafe {
                core::ptr::read_volatile(ext_csd.as_ptr().add(EXT_CSD_SEC_CNT / 4))
            });
            total_sectors = sec_count;
            disk_size_kb = sec_count / 2;

            // Deselect again; the selection step below re-runs with busy
            // handling.
            self.command_only(&SdhCommand::new(op::SELECT_CARD, 0, ResponseType::None))
                .map_err(init_map)?;
        }

        self.session.total_sectors = total_sectors;
        self.session.disk_size_kb = disk_size_kb;
        self.session.sector_size = info.sector_size;
        self.session.state = CardState::Standby;
        debug!("sdh: {total_sectors} sectors of {} bytes", info.sector_size);
        Ok(())
    }

    /// CMD7 selection and bus configuration: block length, bus width,
    /// high-speed switch, target clock.
    fn enter_transfer(&mut self) -> SdhResult {
        self.command_with_response(&SdhCommand::new(
            op::SELECT_CARD,
            self.session.rca << 16,
            ResponseType::R1,
        ))
        .map_err(|_| SdhError::SelectError)?;
        self.check_rb().map_err(|_| SdhError::SelectError)?;

        if !self.session.card_type.is_sector_addressed() {
            self.command_with_response(&SdhCommand::new(
                op::SET_BLOCKLEN,
                common::SECTOR_SIZE,
                ResponseType::R1,
            ))
            .map_err(init_map)?;
        }

        let mut freq = match self.session.card_type {
            CardType::SdHigh | CardType::SdLow => common::SD_FREQ_KHZ,
            _ => common::MMC_FREQ_KHZ,
        };

        match self.session.card_type {
            CardType::SdHigh | CardType::SdLow => {
                self.sd_wide_bus()?;
                if self.session.card_type == CardType::SdHigh && self.switch_high_speed()? {
                    freq = common::SDHC_FREQ_KHZ;
                }
            }
            CardType::Mmc | CardType::Emmc => self.mmc_wide_bus()?,
            CardType::Unknown => {}
        }

        if let Some(set_clock) = self.config.set_clock_khz {
            set_clock(freq);
        }

        // Data commands run 512-byte blocks from here on.
        self.regs
            .write_reg32(regs::BLEN, common::SECTOR_SIZE - 1);
        self.session.state = CardState::Transfer;
        Ok(())
    }

    /// ACMD51 SCR read, then ACMD6 if the card supports a 4-bit bus.
    fn sd_wide_bus(&mut self) -> SdhResult {
        self.command_with_response(&SdhCommand::new(
            op::APP_CMD,
            self.session.rca << 16,
            ResponseType::R1,
        ))
        .map_err(init_map)?;
        let mut scr = [0u32; 2];
        let cmd = SdhCommand::new(op::SEND_SCR, 0, ResponseType::R1).with_data_in(1, 8);
        self.transfer_data_in(&cmd, scr.as_mut_ptr() as usize)?;

        // SCR is big-endian; SD_BUS_WIDTHS is the low nibble of byte 1.
        let scr0 = u32::from_be(unsafe { core::ptr::read_volatile(scr.as_ptr()) });
        let widths = (scr0 >> 16) & 0xF;
        if widths & 0x4 == 0 {
            debug!("sdh: card only supports a 1-bit bus");
            return Ok(());
        }

        self.command_with_response(&SdhCommand::new(
            op::APP_CMD,
            self.session.rca << 16,
            ResponseType::R1,
        ))
        .map_err(init_map)?;
        self.command_with_response(&SdhCommand::new(op::SET_BUS_WIDTH, 2, ResponseType::R1))
            .map_err(init_map)?;
        self.regs.set_bits32(regs::CTL, Ctl::DBW.bits());
        Ok(())
    }

    /// SD CMD6 high-speed switch: query group 1, engage when supported.
    /// Returns whether the card is now running the 50 MHz timing.
    fn switch_high_speed(&mut self) -> SdhResult<bool> {
        let mut status = [0u32; 16];
        let check = SdhCommand::new(op::SWITCH_FUNC, SWITCH_CHECK_HS_ARG, ResponseType::R1)
            .with_data_in(1, 64);
        self.transfer_data_in(&check, status.as_mut_ptr() as usize)?;

        // Group 1 support bits sit in byte 13 of the big-endian status.
        let word3 = u32::from_be(unsafe { core::ptr::read_volatile(status.as_ptr().add(3)) });
        if (word3 >> 16) & 0x2 == 0 {
            return Ok(false);
        }

        let set = SdhCommand::new(op::SWITCH_FUNC, SWITCH_SET_HS_ARG, ResponseType::R1)
            .with_data_in(1, 64);
        self.transfer_data_in(&set, status.as_mut_ptr() as usize)?;
        self.check_rb().map_err(init_map)?;

        // Byte 16 low nibble is the function now selected for group 1.
        let word4 = u32::from_be(unsafe { core::ptr::read_volatile(status.as_ptr().add(4)) });
        Ok((word4 >> 24) & 0xF == 1)
    }

    /// EXT_CSD bus-width switch for MMC. Old byte-addressed parts ignore
    /// CMD6; that is not a failure, the bus just stays 1-bit.
    fn mmc_wide_bus(&mut self) -> SdhResult {
        match self.command_with_response(&SdhCommand::new(
            op::SWITCH_FUNC,
            MMC_SWITCH_BUS_WIDTH_4_ARG,
            ResponseType::R1,
        )) {
            Ok(_) => {
                self.check_rb().map_err(init_map)?;
                self.regs.set_bits32(regs::CTL, Ctl::DBW.bits());
                Ok(())
            }
            Err(CmdError::RspTimeout) | Err(CmdError::Crc7) => {
                debug!("sdh: mmc bus-width switch not taken, staying 1-bit");
                Ok(())
            }
            Err(e) => Err(init_map(e)),
        }
    }
}
