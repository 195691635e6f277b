//! Register map and bus access
//!
//! The scaler exposes two register layouts:
//! - the legacy layout shared by VC4 and VC5 (one global DISPCTRL/DISPSTAT
//!   pair plus a 0x10-stride block per channel), with VC5 moving a few
//!   bitfields around
//! - the gen 6 layout, with a 0x20-stride DISPX block per channel
//!
//! Registers are addressed by [`Reg`], a byte offset into the register
//! window. The window itself belongs to whoever implements
//! [`RegisterBus`]; this crate never touches memory directly.
//!
//! # Device-live guard
//! Every access goes through an [`Access`] guard. Creating one calls
//! [`RegisterBus::enter`] and dropping it calls [`RegisterBus::exit`]. Once the
//! device has been removed `enter` fails and callers fall back to their
//! documented "no hardware" behaviour instead of faulting.

use bitflags::bitflags;

/// Byte offset into the scaler register window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Reg(u32);

impl Reg {
    pub const fn new(offset: u32) -> Self {
        Self(offset)
    }

    pub const fn offset(self) -> u32 {
        self.0
    }
}

/// Contiguous bitfield `[high:low]` inside a 32-bit register
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    shift: u32,
    width: u32,
}

impl Field {
    /// Field spanning bits `high` down to `low`, inclusive
    pub const fn new(high: u32, low: u32) -> Self {
        Self {
            shift: low,
            width: high - low + 1,
        }
    }

    pub const fn mask(self) -> u32 {
        (((1u64 << self.width) - 1) as u32) << self.shift
    }

    /// Extract the field from a register value
    pub const fn get(self, value: u32) -> u32 {
        (value & self.mask()) >> self.shift
    }

    /// Place `value` into the field position, truncating to the field width
    pub const fn set(self, value: u32) -> u32 {
        (value << self.shift) & self.mask()
    }

    /// Replace the field inside `reg` with `value`
    pub const fn replace(self, reg: u32, value: u32) -> u32 {
        (reg & !self.mask()) | self.set(value)
    }
}

/// Display-list terminator word
pub const DLIST_END: u32 = 1 << 31;

/// Legacy (VC4/VC5) register layout
pub mod legacy {
    use super::{bitflags, Field, Reg};

    pub const DISPCTRL: Reg = Reg(0x00);
    pub const DISPSTAT: Reg = Reg(0x04);
    pub const DISPECTRL: Reg = Reg(0x0c);
    pub const DISPDITHER: Reg = Reg(0x14);
    pub const DISPEOLN: Reg = Reg(0x18);
    pub const GAMADDR: Reg = Reg(0x78);
    pub const GAMDATA: Reg = Reg(0xe0);

    /// Display-list pointer of channel `ch`
    pub const fn displist(ch: usize) -> Reg {
        Reg(0x20 + 4 * ch as u32)
    }

    pub const fn dispctrlx(ch: usize) -> Reg {
        Reg(0x40 + 0x10 * ch as u32)
    }

    pub const fn dispbkgndx(ch: usize) -> Reg {
        Reg(0x44 + 0x10 * ch as u32)
    }

    pub const fn dispstatx(ch: usize) -> Reg {
        Reg(0x48 + 0x10 * ch as u32)
    }

    /// Frame counters of channels 0 and 1 live in DISPSTAT1, channel 2's in
    /// DISPSTAT2.
    pub const DISPSTAT1: Reg = dispstatx(1);
    pub const DISPSTAT2: Reg = dispstatx(2);

    /// Display-list memory in words, bootloader list included
    pub const DLIST_WORDS: usize = 4096;

    bitflags! {
        /// Fixed DISPCTRL bits. Per-channel enables are built by the
        /// generation profile because VC4 and VC5 lay them out differently.
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct DispCtrl: u32 {
            const ENABLE    = 1 << 31;
            const SLVRDEIRQ = 1 << 6;
            const SLVWREIRQ = 1 << 5;
            const DMAEIRQ   = 1 << 4;
            const DISPEIRQ0 = 1 << 1;
            const DISPEIRQ1 = 1 << 2;
            const DISPEIRQ2 = 1 << 3;
            const SCLEIRQ   = 1 << 0;
        }
    }

    pub const DISPCTRL_PANIC0: Field = Field::new(25, 24);
    pub const DISPCTRL_PANIC1: Field = Field::new(27, 26);
    pub const DISPCTRL_PANIC2: Field = Field::new(29, 28);
    pub const DISPCTRL_DSP3_MUX: Field = Field::new(19, 18);

    pub const DISPECTRL_DSP2_MUX: Field = Field::new(31, 31);
    pub const DISPEOLN_DSP4_MUX: Field = Field::new(31, 30);
    pub const DISPDITHER_DSP5_MUX: Field = Field::new(31, 30);

    /// Per-channel DISPSTAT bits, write one to clear
    pub const fn dispstat_eof(ch: usize) -> u32 {
        1 << (8 + 8 * ch)
    }

    pub const fn dispstat_euflow(ch: usize) -> u32 {
        1 << (9 + 8 * ch)
    }

    /// Every status bit belonging to channel `ch`
    pub const fn dispstat_irqmask(ch: usize) -> u32 {
        0x3f << (8 + 8 * ch)
    }

    bitflags! {
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct DispCtrlX: u32 {
            const ENABLE = 1 << 31;
            const RESET  = 1 << 30;
        }
    }

    pub const VC4_DISPCTRLX_ONESHOT: u32 = 1 << 29;
    pub const VC4_DISPCTRLX_WIDTH: Field = Field::new(23, 12);
    pub const VC4_DISPCTRLX_HEIGHT: Field = Field::new(11, 0);
    pub const VC5_DISPCTRLX_ONESHOT: u32 = 1 << 15;
    pub const VC5_DISPCTRLX_WIDTH: Field = Field::new(28, 16);
    pub const VC5_DISPCTRLX_HEIGHT: Field = Field::new(12, 0);

    bitflags! {
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct DispBkgnd: u32 {
            const AUTOHS    = 1 << 31;
            const INTERLACE = 1 << 30;
            const GAMMA     = 1 << 29;
            const BCK2BCK   = 1 << 25;
            const FILL      = 1 << 24;
        }
    }

    pub const DISPSTATX_MODE: Field = Field::new(31, 30);
    pub const DISPSTATX_FULL: u32 = 1 << 29;
    pub const DISPSTATX_EMPTY: u32 = 1 << 28;
    pub const DISPSTAT1_FRCNT0: Field = Field::new(23, 18);
    pub const DISPSTAT1_FRCNT1: Field = Field::new(17, 12);
    pub const DISPSTAT2_FRCNT2: Field = Field::new(17, 12);
    pub const VC5_DISPSTAT1_FRCNT0: Field = Field::new(25, 20);
    pub const VC5_DISPSTAT1_FRCNT1: Field = Field::new(19, 14);
    pub const VC5_DISPSTAT2_FRCNT2: Field = Field::new(19, 14);

    pub const GAMADDR_AUTOINC: u32 = 1 << 31;
}

/// Gen 6 register layout
pub mod gen6 {
    use super::{Field, Reg};

    pub const VERSION: Reg = Reg(0x000);
    pub const CXM_SIZE: Reg = Reg(0x008);
    pub const CONTROL: Reg = Reg(0x010);

    pub const VERSION_FIELD: Field = Field::new(31, 24);
    pub const VERSION_C0: u32 = 0x20;
    pub const VERSION_D0: u32 = 0x21;

    pub const CONTROL_HVS_EN: u32 = 1 << 31;
    pub const CONTROL_PF_LINES: Field = Field::new(22, 18);
    pub const CONTROL_MAX_REQS: Field = Field::new(7, 4);
    pub const PRI_MAP0: Reg = Reg(0x020);
    pub const PRI_MAP1: Reg = Reg(0x024);

    const fn dispx(ch: usize, reg: u32) -> Reg {
        Reg(0x80 + 0x20 * ch as u32 + reg)
    }

    pub const fn ctrl0(ch: usize) -> Reg {
        dispx(ch, 0x00)
    }

    pub const fn ctrl1(ch: usize) -> Reg {
        dispx(ch, 0x04)
    }

    pub const fn bgnd(ch: usize) -> Reg {
        dispx(ch, 0x08)
    }

    pub const fn lptrs(ch: usize) -> Reg {
        dispx(ch, 0x0c)
    }

    pub const fn status(ch: usize) -> Reg {
        dispx(ch, 0x14)
    }

    pub const CTRL0_ENB: u32 = 1 << 31;
    pub const CTRL0_RESET: u32 = 1 << 30;
    pub const CTRL0_FWIDTH: Field = Field::new(28, 16);
    pub const CTRL0_ONESHOT: u32 = 1 << 15;
    pub const CTRL0_LINES: Field = Field::new(12, 0);

    pub const CTRL1_BGENB: u32 = 1 << 8;
    pub const CTRL1_INTLACE: u32 = 1 << 0;

    pub const LPTRS_HEADE: Field = Field::new(15, 0);

    pub const STATUS_FRCNT: Field = Field::new(23, 18);
    pub const STATUS_EMPTY: u32 = 1 << 16;
    pub const STATUS_MODE: Field = Field::new(15, 14);
}

/// DISPSTATX / STATUS mode field values
pub const MODE_DISABLED: u32 = 0;
pub const MODE_RUN: u32 = 2;
pub const MODE_EOF: u32 = 3;

/// Register window of one scaler instance
///
/// Implementations must be callable from interrupt context and from the
/// sweep worker concurrently, hence `Send + Sync` and `&self` everywhere.
pub trait RegisterBus: Send + Sync {
    fn read(&self, reg: Reg) -> u32;

    fn write(&self, reg: Reg, value: u32);

    /// Copy `words` into display-list memory starting at word `offset`
    fn write_dlist(&self, offset: usize, words: &[u32]);

    /// Device-live check, paired with [`exit`](Self::exit)
    ///
    /// Returns `false` once the device has been removed. No register access
    /// may happen unless this returned `true`.
    fn enter(&self) -> bool {
        true
    }

    fn exit(&self) {}

    /// Enable or disable the dedicated end-of-frame interrupt line of a
    /// channel. Only meaningful on parts with per-channel lines.
    fn set_eof_line(&self, channel: usize, enabled: bool) {
        let _ = (channel, enabled);
    }
}

/// Scoped register access, only exists while the device is live
pub struct Access<'a> {
    bus: &'a dyn RegisterBus,
}

impl<'a> Access<'a> {
    /// Enter the device, `None` if it is gone
    pub fn enter(bus: &'a dyn RegisterBus) -> Option<Self> {
        if bus.enter() {
            Some(Self { bus })
        } else {
            None
        }
    }

    pub fn read(&self, reg: Reg) -> u32 {
        self.bus.read(reg)
    }

    pub fn write(&self, reg: Reg, value: u32) {
        self.bus.write(reg, value)
    }

    /// Read-modify-write: clear `clear` bits, then set `set` bits
    pub fn modify(&self, reg: Reg, clear: u32, set: u32) {
        let value = self.bus.read(reg);
        self.bus.write(reg, (value & !clear) | set);
    }

    pub fn read_field(&self, reg: Reg, field: Field) -> u32 {
        field.get(self.bus.read(reg))
    }

    pub fn write_dlist(&self, offset: usize, words: &[u32]) {
        self.bus.write_dlist(offset, words)
    }

    pub fn set_eof_line(&self, channel: usize, enabled: bool) {
        self.bus.set_eof_line(channel, enabled)
    }
}

impl Drop for Access<'_> {
    fn drop(&mut self) {
        self.bus.exit();
    }
}
