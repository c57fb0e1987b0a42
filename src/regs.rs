//! Typed volatile view over the SDH register block.
//!
//! The controller is a memory mapped peripheral that changes state behind the
//! compiler's back (command completion, DMA, card detect), so every access
//! goes through `read_volatile`/`write_volatile`. Offsets and bit positions
//! are fixed by the hardware and must not be rearranged.

use bitflags::bitflags;

/// Shared buffer (FIFO), 32 words. R2 responses land here.
pub const FB: u32 = 0x000;
/// DMA control and status.
pub const DMACTL: u32 = 0x400;
/// DMA transfer starting address (word aligned, bit 0 is the PAD fetch order).
pub const DMASA: u32 = 0x408;
/// DMA remaining byte count (read only).
pub const DMABCNT: u32 = 0x40C;
/// DMA interrupt enable.
pub const DMAINTEN: u32 = 0x410;
/// DMA interrupt status (write 1 to clear).
pub const DMAINTSTS: u32 = 0x414;
/// Global control and status.
pub const GCTL: u32 = 0x800;
/// Global interrupt enable.
pub const GINTEN: u32 = 0x804;
/// Global interrupt status.
pub const GINTSTS: u32 = 0x808;
/// SD engine control and status.
pub const CTL: u32 = 0x820;
/// Command argument.
pub const CMDARG: u32 = 0x824;
/// SD interrupt enable, including the card detect source selection.
pub const INTEN: u32 = 0x828;
/// SD interrupt status (flag bits are write 1 to clear).
pub const INTSTS: u32 = 0x82C;
/// Response token bits 47..16.
pub const RESP0: u32 = 0x830;
/// Response token bits 15..8.
pub const RESP1: u32 = 0x834;
/// Block length minus one, 11 bits.
pub const BLEN: u32 = 0x838;
/// Response/data-in hardware timeout count, 24 bits.
pub const TOUT: u32 = 0x83C;
/// Extend control: per-port power off bits.
pub const ECTL: u32 = 0x840;

bitflags! {
    /// DMACTL bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DmaCtl: u32 {
        const DMAEN   = 1 << 0;
        const DMARST  = 1 << 1;
        const SGEN    = 1 << 3;
        const DMABUSY = 1 << 9;
    }
}

bitflags! {
    /// DMAINTEN bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DmaIntEn: u32 {
        const ABORTIEN = 1 << 0;
        const WEOTIEN  = 1 << 1;
    }
}

bitflags! {
    /// DMAINTSTS bits. Both are write 1 to clear; when either is set the
    /// DMA and SD engines must be software reset before the next transfer.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DmaIntSts: u32 {
        const ABORTIF = 1 << 0;
        const WEOTIF  = 1 << 1;
    }
}

bitflags! {
    /// GCTL bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Gctl: u32 {
        const GCTLRST = 1 << 0;
        const SDEN    = 1 << 1;
    }
}

bitflags! {
    /// GINTEN bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GIntEn: u32 {
        const DTAIEN = 1 << 0;
    }
}

bitflags! {
    /// GINTSTS bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GIntSts: u32 {
        const DTAIF = 1 << 0;
    }
}

bitflags! {
    /// CTL single-bit fields. The enable bits (COEN..CLK8OEN, R2EN) self
    /// clear when the operation finishes; software never writes them back
    /// to zero, only CTLRST clears them early.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Ctl: u32 {
        const COEN     = 1 << 0;
        const RIEN     = 1 << 1;
        const DIEN     = 1 << 2;
        const DOEN     = 1 << 3;
        const R2EN     = 1 << 4;
        const CLK74OEN = 1 << 5;
        const CLK8OEN  = 1 << 6;
        const CLKKEEP0 = 1 << 7;
        const CTLRST   = 1 << 14;
        const DBW      = 1 << 15;
        const CLKKEEP1 = 1 << 31;
    }
}

/// CTL.CMDCODE field, 6 bits.
pub const CTL_CMDCODE_POS: u32 = 8;
pub const CTL_CMDCODE_MSK: u32 = 0x3F << CTL_CMDCODE_POS;
/// CTL.BLKCNT field, 8 bits. Never program 0.
pub const CTL_BLKCNT_POS: u32 = 16;
pub const CTL_BLKCNT_MSK: u32 = 0xFF << CTL_BLKCNT_POS;
/// CTL.SDNWR field, 4 bits (NWR clock count minus one for block writes).
pub const CTL_SDNWR_POS: u32 = 24;
pub const CTL_SDNWR_MSK: u32 = 0xF << CTL_SDNWR_POS;
/// CTL.SDPORT field, 2 bits.
pub const CTL_SDPORT_POS: u32 = 29;
pub const CTL_SDPORT_MSK: u32 = 0x3 << CTL_SDPORT_POS;

bitflags! {
    /// INTEN bits. CDSRC0/CDSRC1 select the card detect source
    /// (0 = DAT3 pin, 1 = GPIO) and invert the CDSTS polarity.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IntEn: u32 {
        const BLKDIEN = 1 << 0;
        const CRCIEN  = 1 << 1;
        const CDIEN0  = 1 << 8;
        const CDIEN1  = 1 << 9;
        const RTOIEN  = 1 << 12;
        const DITOIEN = 1 << 13;
        const WKIEN   = 1 << 14;
        const CDSRC0  = 1 << 30;
        const CDSRC1  = 1 << 31;
    }
}

bitflags! {
    /// INTSTS bits. BLKDIF/CRCIF/CDIF/RTOIF/DITOIF are write 1 to clear;
    /// CRC7/CRC16/DAT0STS/CDSTS are level status.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IntSts: u32 {
        const BLKDIF  = 1 << 0;
        const CRCIF   = 1 << 1;
        const CRC7    = 1 << 2;
        const CRC16   = 1 << 3;
        const DAT0STS = 1 << 7;
        const CDIF0   = 1 << 8;
        const CDIF1   = 1 << 9;
        const RTOIF   = 1 << 12;
        const DITOIF  = 1 << 13;
        const CDSTS0  = 1 << 16;
        const CDSTS1  = 1 << 17;
        const DAT1STS = 1 << 18;
    }
}

/// INTSTS.CRCSTS field: CRC status token of a data-out transfer.
pub const INTSTS_CRCSTS_POS: u32 = 4;
pub const INTSTS_CRCSTS_MSK: u32 = 0x7 << INTSTS_CRCSTS_POS;
/// Positive CRC status; anything else after a data-out phase is a fault.
pub const CRCSTS_POSITIVE: u32 = 0b010;

/// BLEN.BLKLEN mask (block length minus one).
pub const BLEN_BLKLEN_MSK: u32 = 0x7FF;
/// TOUT mask.
pub const TOUT_MSK: u32 = 0xFF_FFFF;

bitflags! {
    /// ECTL bits: card power is active low per port.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Ectl: u32 {
        const POWEROFF0 = 1 << 0;
        const POWEROFF1 = 1 << 1;
    }
}

#[macro_export]
macro_rules! impl_register_ops {
    ($struct_name:ident, $field_name:ident) => {
        impl $struct_name {
            #[inline]
            pub fn read_reg32(&self, offset: u32) -> u32 {
                unsafe {
                    core::ptr::read_volatile((self.$field_name + offset as usize) as *const u32)
                }
            }

            #[inline]
            pub fn write_reg32(&self, offset: u32, value: u32) {
                unsafe {
                    core::ptr::write_volatile(
                        (self.$field_name + offset as usize) as *mut u32,
                        value,
                    )
                }
            }

            #[inline]
            pub fn set_bits32(&self, offset: u32, mask: u32) {
                self.write_reg32(offset, self.read_reg32(offset) | mask);
            }

            #[inline]
            pub fn clear_bits32(&self, offset: u32, mask: u32) {
                self.write_reg32(offset, self.read_reg32(offset) & !mask);
            }
        }
    };
}

/// One SDH register block at a fixed base address.
#[derive(Debug, Clone, Copy)]
pub struct SdhRegs {
    base: usize,
}

impl_register_ops!(SdhRegs, base);

impl SdhRegs {
    pub const fn new(base: usize) -> Self {
        SdhRegs { base }
    }

    pub const fn base(&self) -> usize {
        self.base
    }

    /// Read one word of the shared FIFO buffer.
    #[inline]
    pub fn read_fb(&self, word: u32) -> u32 {
        self.read_reg32(FB + word * 4)
    }

    /// True if any bit of `mask` is set in INTSTS.
    #[inline]
    pub fn intsts_any(&self, mask: IntSts) -> bool {
        self.read_reg32(INTSTS) & mask.bits() != 0
    }

    /// Clear write-1-to-clear INTSTS flags.
    #[inline]
    pub fn clear_intsts(&self, mask: IntSts) {
        self.write_reg32(INTSTS, mask.bits());
    }
}
