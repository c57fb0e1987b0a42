//! Software model of the SDH controller and an SD/MMC card behind it.
//!
//! A background thread plays the hardware: it watches the register memory
//! the driver is pointed at, self-clears the CTL enable bits, produces
//! response tokens and CSD/CID FIFO contents, moves DMA data, and raises
//! the same status flags the real engine would. Write-1-to-clear registers
//! are emulated with a mailbox scheme: the thread knows the last value it
//! wrote, so any different value must be a clear request from the driver.
//!
//! The model also asserts the hardware contracts the driver must honor
//! (BLKCNT never programmed 0, 512-byte BLEN for sector transfers, aligned
//! DMA addresses); breaches are recorded as violations for the tests to
//! check.

use std::ptr::{read_volatile, write_volatile};
use std::sync::atomic::{AtomicBool, Ordering, fence};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use nu_sdh::regs;

/// Words of simulated register space (covers offsets up to ECTL at 0x840).
const REG_WORDS: usize = 0x300;

const CTL_ENABLES: u32 = 0x1F; // COEN | RIEN | DIEN | DOEN | R2EN

const SECTOR: usize = 512;

/// What kind of card sits in the simulated socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardKind {
    /// SD 2.0 high capacity: answers CMD8, OCR reports CCS.
    SdHc,
    /// SD 1.x standard capacity: silent on CMD8, byte addressed.
    SdSc,
    /// Sector-addressed MMC with its capacity in EXT_CSD.
    Emmc,
}

pub struct CardModel {
    pub kind: CardKind,
    pub present: bool,
    pub total_sectors: u32,
    pub storage: Vec<u8>,
    /// OCR rounds that report busy before power-up completes.
    pub ocr_busy_rounds: u32,
    /// Card never leaves busy; probe must hit its retry bound.
    pub ocr_stuck: bool,
    /// CMD8 leaves the enables set forever (wedged engine).
    pub wedge_cmd8: bool,
    pub fail_crc16_read_sector: Option<u32>,
    pub fail_crc_write: bool,
    /// Next data command raises a DMA target abort instead of finishing.
    pub abort_next_data: bool,
    /// Next data command yanks the card mid-transfer.
    pub remove_during_next_data: bool,
    pub supports_hs: bool,

    // Runtime state.
    app_cmd: bool,
    rca: u16,
    pending: u32,
    levels: u32,
    pub violations: Vec<String>,
    pub seen_cmds: Vec<u8>,
}

impl CardModel {
    pub fn new(kind: CardKind, total_sectors: u32) -> Self {
        let mut storage = vec![0u8; total_sectors as usize * SECTOR];
        // Deterministic content so reads are checkable.
        for (i, b) in storage.iter_mut().enumerate() {
            *b = ((i / SECTOR) as u8) ^ (i as u8).wrapping_mul(31);
        }
        CardModel {
            kind,
            present: true,
            total_sectors,
            storage,
            ocr_busy_rounds: 2,
            ocr_stuck: false,
            wedge_cmd8: false,
            fail_crc16_read_sector: None,
            fail_crc_write: false,
            abort_next_data: false,
            remove_during_next_data: false,
            supports_hs: true,
            app_cmd: false,
            rca: 0x1234,
            pending: 0,
            levels: regs::IntSts::DAT0STS.bits()
                | regs::IntSts::CRC7.bits()
                | regs::IntSts::CRC16.bits(),
            violations: Vec::new(),
            seen_cmds: Vec::new(),
        }
    }

    pub fn expected_byte(&self, sector: u32, offset: usize) -> u8 {
        let i = sector as usize * SECTOR + offset;
        (sector as u8) ^ (i as u8).wrapping_mul(31)
    }

    fn sector_addressed(&self) -> bool {
        matches!(self.kind, CardKind::SdHc | CardKind::Emmc)
    }

    fn is_sd(&self) -> bool {
        matches!(self.kind, CardKind::SdHc | CardKind::SdSc)
    }

    fn csd_words(&self) -> [u32; 4] {
        match self.kind {
            CardKind::SdHc => {
                // CSD v2: capacity in 1024-sector units.
                let c_size = self.total_sectors / 1024 - 1;
                [1 << 30, c_size >> 16, (c_size & 0xFFFF) << 16, 0]
            }
            CardKind::SdSc => {
                // CSD v1 with READ_BL_LEN 9 and MULT 0:
                // sectors = (C_SIZE + 1) * 4.
                let c_size = self.total_sectors / 4 - 1;
                [0, (9 << 16) | (c_size >> 2), (c_size & 0x3) << 30, 0]
            }
            CardKind::Emmc => {
                // EXT_CSD-era CSD: saturated C_SIZE, v1 layout.
                [3 << 30, (9 << 16) | (0xFFF >> 2), (0xFFF & 0x3) << 30, 0]
            }
        }
    }
}

struct RegFile {
    base: usize,
    last_intsts: u32,
    last_dmaintsts: u32,
    last_gintsts: u32,
    abort_pending: bool,
}

fn rd(base: usize, off: u32) -> u32 {
    unsafe { read_volatile((base + off as usize) as *const u32) }
}

fn wr(base: usize, off: u32, v: u32) {
    unsafe { write_volatile((base + off as usize) as *mut u32, v) }
}

impl RegFile {
    fn canonical_intsts(&self, card: &CardModel) -> u32 {
        let mut v = card.levels | card.pending;
        // GPIO detect polarity: CDSTS reads 1 when the card is removed.
        if !card.present {
            v |= regs::IntSts::CDSTS0.bits() | regs::IntSts::CDSTS1.bits();
        }
        v
    }

    /// Apply driver write-1-to-clear requests and republish canonical
    /// status values.
    fn sync(&mut self, card: &mut CardModel) {
        let m = rd(self.base, regs::INTSTS);
        if m != self.last_intsts {
            // The driver wrote a clear mask.
            card.pending &= !m;
        }
        let canonical = self.canonical_intsts(card);
        if canonical != m {
            wr(self.base, regs::INTSTS, canonical);
        }
        self.last_intsts = canonical;

        let m = rd(self.base, regs::DMAINTSTS);
        if m != self.last_dmaintsts {
            // Clears only; canonical DMA status is rebuilt per command.
            let canonical = self.last_dmaintsts & !m;
            wr(self.base, regs::DMAINTSTS, canonical);
            self.last_dmaintsts = canonical;
        }

        let m = rd(self.base, regs::GINTSTS);
        if m != self.last_gintsts {
            let canonical = self.last_gintsts & !m;
            wr(self.base, regs::GINTSTS, canonical);
            self.last_gintsts = canonical;
        }
    }

    fn publish_intsts(&mut self, card: &CardModel) {
        let canonical = self.canonical_intsts(card);
        wr(self.base, regs::INTSTS, canonical);
        self.last_intsts = canonical;
    }

    fn raise_dma_abort(&mut self) {
        self.abort_pending = true;
    }

    /// 48-bit response: RESP0 carries bits 47..16, RESP1 bits 15..8.
    fn respond48(&mut self, card: &mut CardModel, index: u8, payload: u32, crc_ok: bool) {
        wr(
            self.base,
            regs::RESP0,
            ((index as u32) << 24) | (payload >> 8),
        );
        wr(self.base, regs::RESP1, payload & 0xFF);
        if crc_ok {
            card.levels |= regs::IntSts::CRC7.bits();
        } else {
            card.levels &= !regs::IntSts::CRC7.bits();
        }
    }

    /// 136-bit response into the FIFO: header byte then the 16 payload
    /// bytes, packed little-endian per word.
    fn respond_r2(&mut self, card: &mut CardModel, words: [u32; 4]) {
        let mut stream = [0u8; 20];
        stream[0] = 0x3F;
        for (i, w) in words.iter().enumerate() {
            stream[1 + i * 4..5 + i * 4].copy_from_slice(&w.to_be_bytes());
        }
        for (i, chunk) in stream.chunks(4).enumerate() {
            let v = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            wr(self.base, regs::FB + (i as u32) * 4, v);
        }
        card.levels |= regs::IntSts::CRC7.bits();
    }

    fn response_timeout(&mut self, card: &mut CardModel) {
        card.pending |= regs::IntSts::RTOIF.bits();
    }
}

fn ocr_payload(card: &mut CardModel) -> u32 {
    if card.ocr_stuck {
        return 0x00FF_8000;
    }
    if card.ocr_busy_rounds > 0 {
        card.ocr_busy_rounds -= 1;
        return 0x00FF_8000;
    }
    let ccs = if card.sector_addressed() { 1 << 30 } else { 0 };
    0x80FF_8000 | ccs
}

fn process_command(rf: &mut RegFile, card: &mut CardModel, ctl: u32) {
    fence(Ordering::SeqCst);
    let base = rf.base;
    let code = ((ctl & regs::CTL_CMDCODE_MSK) >> regs::CTL_CMDCODE_POS) as u8;
    let blkcnt = (ctl & regs::CTL_BLKCNT_MSK) >> regs::CTL_BLKCNT_POS;
    let arg = rd(base, regs::CMDARG);
    let blen = (rd(base, regs::BLEN) & regs::BLEN_BLKLEN_MSK) + 1;
    let data_in = ctl & regs::Ctl::DIEN.bits() != 0;
    let data_out = ctl & regs::Ctl::DOEN.bits() != 0;
    let r2 = ctl & regs::Ctl::R2EN.bits() != 0;

    if card.wedge_cmd8 && code == 8 && !data_in {
        // Engine hangs: never complete, never respond.
        return;
    }
    card.seen_cmds.push(code);

    // A new command supersedes the completion flags of the previous one;
    // the driver has consumed and cleared them by now.
    card.pending &= !(regs::IntSts::RTOIF
        | regs::IntSts::DITOIF
        | regs::IntSts::BLKDIF
        | regs::IntSts::CRCIF)
        .bits();

    let app = card.app_cmd;
    card.app_cmd = false;

    if !card.present {
        rf.response_timeout(card);
        finish(rf, card, ctl);
        return;
    }

    if data_in || data_out {
        if blkcnt == 0 {
            card.violations.push(format!("cmd{code}: BLKCNT programmed 0"));
        }
        if rd(base, regs::DMACTL) & regs::DmaCtl::DMAEN.bits() == 0 {
            card.violations.push(format!("cmd{code}: DMA not enabled"));
        }
        if rd(base, regs::DMASA) % 4 != 0 {
            card.violations.push(format!("cmd{code}: DMASA not word aligned"));
        }
    }

    match code {
        0 => {
            // GO_IDLE: no response phase.
        }
        8 if data_in => {
            // MMC SEND_EXT_CSD.
            rf.respond48(card, 8, 0x0000_0900, true);
            let mut ext_csd = [0u8; 512];
            ext_csd[212..216].copy_from_slice(&card.total_sectors.to_le_bytes());
            dma_out_bytes(base, &ext_csd);
            complete_data_in(card, true);
        }
        8 => {
            if card.kind == CardKind::SdHc {
                rf.respond48(card, 8, arg & 0xFFF, true);
            } else {
                rf.response_timeout(card);
            }
        }
        55 => {
            if card.is_sd() {
                card.app_cmd = true;
                rf.respond48(card, 55, 0x0000_0120, true);
            } else {
                rf.response_timeout(card);
            }
        }
        41 if app => {
            // ACMD41 answers R3: no CRC7 on the bus, the engine reports a
            // CRC fault the driver must ignore.
            let payload = ocr_payload(card);
            rf.respond48(card, 0x3F, payload, false);
        }
        1 => {
            if card.is_sd() {
                rf.response_timeout(card);
            } else {
                let payload = ocr_payload(card);
                rf.respond48(card, 0x3F, payload, false);
            }
        }
        2 if r2 => {
            // Any CID will do; the driver only logs it.
            rf.respond_r2(card, [0x0353_4453, 0x4331_3647, 0x80DE_ADBE, 0xEF01_0C00]);
        }
        3 => {
            if card.is_sd() {
                let payload = (card.rca as u32) << 16 | 0x0500;
                rf.respond48(card, 3, payload, true);
            } else {
                card.rca = (arg >> 16) as u16;
                rf.respond48(card, 3, 0x0000_0500, true);
            }
        }
        9 if r2 => {
            let words = card.csd_words();
            rf.respond_r2(card, words);
        }
        7 => {
            rf.respond48(card, 7, 0x0000_0700, true);
        }
        16 => {
            rf.respond48(card, 16, 0x0000_0900, true);
        }
        51 if app && data_in => {
            // SCR: 1-bit and 4-bit bus widths supported.
            let scr = [0x02u8, 0x05, 0, 0, 0, 0, 0, 0];
            rf.respond48(card, 51, 0x0000_0900, true);
            dma_out_bytes(base, &scr[..blen.min(8) as usize]);
            complete_data_in(card, true);
        }
        6 if app => {
            // ACMD6 SET_BUS_WIDTH.
            rf.respond48(card, 6, 0x0000_0900, true);
        }
        6 if data_in => {
            // SD SWITCH_FUNC status block.
            let mut status = [0u8; 64];
            if card.supports_hs {
                status[13] = 0x02;
            }
            if arg & 0x8000_0000 != 0 {
                status[16] = 0x01;
            }
            rf.respond48(card, 6, 0x0000_0900, true);
            dma_out_bytes(base, &status[..blen.min(64) as usize]);
            complete_data_in(card, true);
        }
        6 => {
            // MMC SWITCH (R1b).
            rf.respond48(card, 6, 0x0000_0900, true);
        }
        17 | 18 if data_in => {
            rf.respond48(card, code, 0x0000_0900, true);
            if blen != 512 {
                card.violations
                    .push(format!("cmd{code}: BLEN {} for sector data", blen));
            }
            if card.remove_during_next_data {
                card.remove_during_next_data = false;
                card.present = false;
                card.pending |= regs::IntSts::CDIF0.bits();
            } else if card.abort_next_data {
                card.abort_next_data = false;
                rf.raise_dma_abort();
            } else {
                let sector = start_sector(card, arg);
                let crc_ok = read_sectors(base, card, sector, blkcnt);
                complete_data_in(card, crc_ok);
            }
        }
        24 | 25 if data_out => {
            rf.respond48(card, code, 0x0000_0900, true);
            if card.abort_next_data {
                card.abort_next_data = false;
                rf.raise_dma_abort();
            } else {
                let sector = start_sector(card, arg);
                let crc_ok = !card.fail_crc_write;
                write_sectors(base, card, sector, blkcnt);
                complete_data_out(card, crc_ok);
            }
        }
        12 => {
            rf.respond48(card, 12, 0x0000_0900, true);
        }
        13 => {
            rf.respond48(card, 13, 0x0000_0900, true);
        }
        _ => {
            card.violations.push(format!("unexpected cmd{code}"));
            rf.response_timeout(card);
        }
    }

    finish(rf, card, ctl);
}

fn finish(rf: &mut RegFile, card: &mut CardModel, ctl: u32) {
    // Status first, then the self-clearing enables: the driver decides only
    // after the enables read back zero. Each command rebuilds the DMA and
    // global status registers, which drops flags the driver already cleared.
    let dma = if rf.abort_pending {
        regs::DmaIntSts::ABORTIF.bits()
    } else {
        0
    };
    rf.abort_pending = false;
    wr(rf.base, regs::DMAINTSTS, dma);
    rf.last_dmaintsts = dma;
    wr(rf.base, regs::GINTSTS, 0);
    rf.last_gintsts = 0;

    rf.publish_intsts(card);
    fence(Ordering::SeqCst);
    wr(rf.base, regs::CTL, ctl & !CTL_ENABLES);
}

fn start_sector(card: &CardModel, arg: u32) -> u32 {
    if card.sector_addressed() {
        arg
    } else {
        arg / SECTOR as u32
    }
}

fn dma_out_bytes(base: usize, bytes: &[u8]) {
    let dest = rd(base, regs::DMASA) as usize;
    unsafe {
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), dest as *mut u8, bytes.len());
    }
}

fn read_sectors(base: usize, card: &mut CardModel, sector: u32, blkcnt: u32) -> bool {
    let dest = rd(base, regs::DMASA) as usize;
    let mut crc_ok = true;
    for blk in 0..blkcnt {
        let s = sector + blk;
        if s >= card.total_sectors {
            card.violations.push(format!("read past capacity: {s}"));
            return false;
        }
        if card.fail_crc16_read_sector == Some(s) {
            crc_ok = false;
        }
        let src = &card.storage[s as usize * SECTOR..(s as usize + 1) * SECTOR];
        unsafe {
            std::ptr::copy_nonoverlapping(
                src.as_ptr(),
                (dest + blk as usize * SECTOR) as *mut u8,
                SECTOR,
            );
        }
    }
    crc_ok
}

fn write_sectors(base: usize, card: &mut CardModel, sector: u32, blkcnt: u32) {
    let src = rd(base, regs::DMASA) as usize;
    for blk in 0..blkcnt {
        let s = sector + blk;
        if s >= card.total_sectors {
            card.violations.push(format!("write past capacity: {s}"));
            return;
        }
        let dst = &mut card.storage[s as usize * SECTOR..(s as usize + 1) * SECTOR];
        unsafe {
            std::ptr::copy_nonoverlapping(
                (src + blk as usize * SECTOR) as *const u8,
                dst.as_mut_ptr(),
                SECTOR,
            );
        }
    }
}

fn complete_data_in(card: &mut CardModel, crc_ok: bool) {
    if crc_ok {
        card.levels |= regs::IntSts::CRC16.bits();
    } else {
        card.levels &= !regs::IntSts::CRC16.bits();
    }
    card.pending |= regs::IntSts::BLKDIF.bits();
}

fn complete_data_out(card: &mut CardModel, crc_ok: bool) {
    let sts = if crc_ok { 0b010 } else { 0b101 };
    card.levels = (card.levels & !regs::INTSTS_CRCSTS_MSK) | (sts << regs::INTSTS_CRCSTS_POS);
    card.pending |= regs::IntSts::BLKDIF.bits();
}

/// The running simulator: owns the register memory and the engine thread.
pub struct Sim {
    mem: Box<[u32]>,
    card: Arc<Mutex<CardModel>>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Sim {
    pub fn start(card: CardModel) -> Sim {
        let mut mem = vec![0u32; REG_WORDS].into_boxed_slice();
        let base = mem.as_mut_ptr() as usize;
        let card = Arc::new(Mutex::new(card));
        let stop = Arc::new(AtomicBool::new(false));

        let card2 = Arc::clone(&card);
        let stop2 = Arc::clone(&stop);
        let thread = thread::spawn(move || {
            let mut rf = RegFile {
                base,
                last_intsts: 0,
                last_dmaintsts: 0,
                last_gintsts: 0,
                abort_pending: false,
            };
            while !stop2.load(Ordering::Relaxed) {
                {
                    let mut card = card2.lock().unwrap();
                    rf.sync(&mut card);

                    // Self-clearing reset bits.
                    let gctl = rd(base, regs::GCTL);
                    if gctl & regs::Gctl::GCTLRST.bits() != 0 {
                        wr(base, regs::GCTL, gctl & !regs::Gctl::GCTLRST.bits());
                    }
                    let dmactl = rd(base, regs::DMACTL);
                    if dmactl & regs::DmaCtl::DMARST.bits() != 0 {
                        wr(
                            base,
                            regs::DMACTL,
                            dmactl & !(regs::DmaCtl::DMARST | regs::DmaCtl::DMABUSY).bits(),
                        );
                    }
                    let ctl = rd(base, regs::CTL);
                    if ctl & regs::Ctl::CTLRST.bits() != 0 {
                        wr(base, regs::CTL, ctl & !(regs::Ctl::CTLRST.bits() | CTL_ENABLES));
                    } else if ctl & regs::Ctl::CLK74OEN.bits() != 0 {
                        wr(base, regs::CTL, ctl & !regs::Ctl::CLK74OEN.bits());
                    } else if ctl & regs::Ctl::CLK8OEN.bits() != 0 {
                        wr(base, regs::CTL, ctl & !regs::Ctl::CLK8OEN.bits());
                    } else if ctl & regs::Ctl::COEN.bits() != 0 {
                        process_command(&mut rf, &mut card, ctl);
                    }
                }
                thread::yield_now();
            }
        });

        Sim {
            mem,
            card,
            stop,
            thread: Some(thread),
        }
    }

    pub fn base(&self) -> usize {
        self.mem.as_ptr() as usize
    }

    pub fn read_reg(&self, off: u32) -> u32 {
        rd(self.base(), off)
    }

    pub fn with_card<T>(&self, f: impl FnOnce(&mut CardModel) -> T) -> T {
        f(&mut self.card.lock().unwrap())
    }

    /// Insert or remove the card, raising the detect-change flag.
    pub fn set_present(&self, present: bool) {
        self.with_card(|card| {
            if card.present != present {
                card.present = present;
                card.pending |= regs::IntSts::CDIF0.bits();
            }
        });
    }

    pub fn violations(&self) -> Vec<String> {
        self.with_card(|card| card.violations.clone())
    }
}

impl Drop for Sim {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}
