mod cid;
mod csd;

pub use cid::CardCid;
pub use csd::{CsdInfo, parse_csd};

use crate::host::SdhError;

/// Capacity class of the identified card.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardType {
    Unknown,
    /// SDHC/SDXC, sector addressed.
    SdHigh,
    /// Standard capacity SD, byte addressed.
    SdLow,
    /// Byte addressed MMC.
    Mmc,
    /// Sector addressed MMC.
    Emmc,
}

impl CardType {
    /// Sector-addressed cards take block numbers as command arguments,
    /// byte-addressed cards take byte offsets.
    pub fn is_sector_addressed(self) -> bool {
        matches!(self, CardType::SdHigh | CardType::Emmc)
    }
}

/// Bring-up progress of the card on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardState {
    PoweredOff,
    Idle,
    Ready,
    Identified,
    Standby,
    /// Terminal success state: data commands are accepted.
    Transfer,
}

/// Per-controller card record.
///
/// Created on open, refreshed by probe, cleared whenever a removal is
/// detected. `total_sectors` is zero exactly when no card is identified;
/// `sector_size` stays a positive power of two.
#[derive(Debug, Clone)]
pub struct CardSession {
    pub(crate) is_card_insert: bool,
    pub(crate) card_type: CardType,
    pub(crate) state: CardState,
    pub(crate) rca: u32,
    pub(crate) total_sectors: u32,
    pub(crate) sector_size: u32,
    pub(crate) disk_size_kb: u32,
    pub(crate) last_error: Option<SdhError>,
    /// Ignore CRC7 faults on the next R3-class response (OCR polling).
    pub(crate) r3_flag: bool,
    /// Ignore CRC7 faults on the next R7 response (voltage check).
    pub(crate) r7_flag: bool,
}

impl CardSession {
    pub(crate) fn new() -> Self {
        CardSession {
            is_card_insert: false,
            card_type: CardType::Unknown,
            state: CardState::PoweredOff,
            rca: 0,
            total_sectors: 0,
            sector_size: crate::common::SECTOR_SIZE,
            disk_size_kb: 0,
            last_error: None,
            r3_flag: false,
            r7_flag: false,
        }
    }

    /// Forget the identified card. Keeps `last_error` for diagnostics.
    pub(crate) fn clear(&mut self) {
        self.is_card_insert = false;
        self.card_type = CardType::Unknown;
        self.state = CardState::PoweredOff;
        self.rca = 0;
        self.total_sectors = 0;
        self.disk_size_kb = 0;
        self.r3_flag = false;
        self.r7_flag = false;
    }

    pub fn is_card_insert(&self) -> bool {
        self.is_card_insert
    }

    pub fn card_type(&self) -> CardType {
        self.card_type
    }

    pub fn state(&self) -> CardState {
        self.state
    }

    pub fn rca(&self) -> u32 {
        self.rca
    }

    pub fn total_sectors(&self) -> u32 {
        self.total_sectors
    }

    pub fn sector_size(&self) -> u32 {
        self.sector_size
    }

    /// Card capacity in KiB.
    pub fn disk_size_kb(&self) -> u32 {
        self.disk_size_kb
    }

    /// Error code of the last failed operation, for diagnostics.
    pub fn last_error(&self) -> Option<SdhError> {
        self.last_error
    }

    pub(crate) fn set_last_error(&mut self, err: SdhError) -> SdhError {
        self.last_error = Some(err);
        err
    }
}
