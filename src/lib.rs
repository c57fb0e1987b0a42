//! Blocking driver for the Nuvoton N9H30-class SD/MMC host controller (SDH).
//!
//! The crate drives card detection, the command/response engine, the card
//! bring-up state machine, and DMA block transfer, and presents a small
//! blocking API (`open` / `probe` / `read_blocks` / `write_blocks` /
//! `card_detection` / `close`) to a block-device or filesystem layer above.
//!
//! Each [`SdhController`] owns one register block and one card session; two
//! controllers run fully independently. Within one controller at most one
//! command or transfer is in flight, and callers sharing it across threads
//! must provide their own single-owner lock. Every internal wait is bounded,
//! so no call can spin forever.

#![cfg_attr(not(test), no_std)]

pub mod card;
pub mod common;
pub mod host;
pub mod osa;
pub mod regs;

pub use card::{CardCid, CardSession, CardState, CardType, CsdInfo, parse_csd};
pub use common::SECTOR_SIZE;
pub use common::commands::{DataDirection, ResponseToken, ResponseType, SdhCommand};
pub use host::{
    CardDetectSource, SdhConfig, SdhController, SdhError, SdhPort, SdhResult,
};
