pub mod commands;

/// Bus command codes used by the driver.
pub(crate) mod cmd {
    pub const GO_IDLE_STATE: u8 = 0;
    /// MMC only.
    pub const SEND_OP_COND: u8 = 1;
    pub const ALL_SEND_CID: u8 = 2;
    pub const SEND_RELATIVE_ADDR: u8 = 3;
    /// CMD6 for SD is SWITCH_FUNC (data-in); ACMD6 is SET_BUS_WIDTH.
    pub const SWITCH_FUNC: u8 = 6;
    pub const SET_BUS_WIDTH: u8 = 6;
    pub const SELECT_CARD: u8 = 7;
    /// CMD8 for SD is SEND_IF_COND; for MMC it is SEND_EXT_CSD (data-in).
    pub const SEND_IF_COND: u8 = 8;
    pub const SEND_EXT_CSD: u8 = 8;
    pub const SEND_CSD: u8 = 9;
    pub const STOP_TRANSMISSION: u8 = 12;
    pub const SET_BLOCKLEN: u8 = 16;
    pub const READ_SINGLE_BLOCK: u8 = 17;
    pub const READ_MULTIPLE_BLOCK: u8 = 18;
    pub const WRITE_BLOCK: u8 = 24;
    pub const WRITE_MULTIPLE_BLOCK: u8 = 25;
    pub const APP_CMD: u8 = 55;
    /// ACMD41.
    pub const SD_SEND_OP_COND: u8 = 41;
    /// ACMD51.
    pub const SEND_SCR: u8 = 51;
}

/// CMD8 check pattern: 2.7-3.6 V supply window plus the 0x55 echo byte.
pub(crate) const IF_COND_ARG: u32 = 0x0000_0155;
/// ACMD41/CMD1 voltage window with the host capacity support bit.
pub(crate) const OP_COND_HCS_ARG: u32 = 0x40FF_8000;
/// ACMD41 voltage window without HCS, for the legacy fallback.
pub(crate) const OP_COND_LEGACY_ARG: u32 = 0x00FF_8000;
/// OCR power-up-done bit (card no longer busy).
pub(crate) const OCR_READY: u32 = 1 << 31;
/// OCR card capacity status bit: set for sector-addressed cards.
pub(crate) const OCR_CCS: u32 = 1 << 30;
/// RCA the driver assigns to MMC/eMMC cards with CMD3.
pub(crate) const MMC_RCA_ARG: u32 = 0x0001_0000;

/// Block size all supported cards transfer with.
pub const SECTOR_SIZE: u32 = 512;
/// Largest value the 8-bit CTL.BLKCNT field can carry per command.
pub(crate) const MAX_BLOCKS_PER_CMD: u32 = 255;

/// Target bus clocks in kHz, handed to the platform clock hook per card type.
pub const MMC_FREQ_KHZ: u32 = 20_000;
pub const SD_FREQ_KHZ: u32 = 25_000;
pub const SDHC_FREQ_KHZ: u32 = 50_000;
/// Identification-phase clock in kHz.
pub const INIT_FREQ_KHZ: u32 = 300;
