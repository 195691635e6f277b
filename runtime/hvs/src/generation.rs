//! Generation profiles
//!
//! Three scaler generations share the same allocator and reclaim logic but
//! differ at the register level: control bit layout, where the frame
//! counter lives, how end-of-frame interrupts are armed, and what the
//! bring-up sequence looks like. [`Generation`] is the one place that knows
//! about those differences; everything above it talks to the profile.
//!
//! All register-level methods take an [`Access`] guard, so they can only
//! run while the device is live.

use crate::channel::{ChannelId, GammaLut, Geometry, GAMMA_ENTRIES};
use crate::frcnt::FrameCount;
use crate::regs::{gen6, legacy, Access, Field, Reg, MODE_DISABLED};
use crate::{HvsError, Result};
use legacy::{DispBkgnd, DispCtrl, DispCtrlX};

/// Words the firmware's boot-time display list occupies at the start of
/// display-list memory. Never handed out, so the boot image stays intact
/// until the first commit.
pub const BOOTLOADER_DLIST_END: usize = 32;

/// Hardware generation of one scaler instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Generation {
    /// BCM2835 family
    Vc4,
    /// BCM2711, legacy registers with moved bitfields
    Vc5,
    /// BCM2712 C-step
    Vc6C,
    /// BCM2712 D-step
    Vc6D,
}

/// Result of a channel stop sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopReport {
    /// The channel was running before the stop
    pub was_enabled: bool,
    /// First idle indicator that did not read back as expected
    pub problem: Option<&'static str>,
}

impl Generation {
    /// Look up a generation from its device-tree compatible string
    ///
    /// # Errors
    /// `UnknownHardwareGeneration` for anything this crate does not drive.
    pub fn from_compatible(compatible: &str) -> Result<Self> {
        match compatible {
            "brcm,bcm2835-hvs" => Ok(Self::Vc4),
            "brcm,bcm2711-hvs" => Ok(Self::Vc5),
            "brcm,bcm2712-hvs" => Ok(Self::Vc6C),
            other => Err(HvsError::UnknownHardwareGeneration {
                compatible: other.into(),
            }),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Vc4 => "vc4",
            Self::Vc5 => "vc5",
            Self::Vc6C => "vc6-c",
            Self::Vc6D => "vc6-d",
        }
    }

    pub fn is_gen6(self) -> bool {
        matches!(self, Self::Vc6C | Self::Vc6D)
    }

    /// Interrupt causes arrive through one shared status register
    ///
    /// Gen 6 raises a dedicated line per channel instead.
    pub fn has_shared_irq(self) -> bool {
        !self.is_gen6()
    }

    /// The compatible string only identifies the package. A C-step part
    /// whose version register reads D0 is really a D-step.
    pub fn detect_revision(self, regs: &Access<'_>) -> Self {
        if self == Self::Vc6C
            && regs.read_field(gen6::VERSION, gen6::VERSION_FIELD) == gen6::VERSION_D0
        {
            log::info!("hvs: version register reports D0");
            return Self::Vc6D;
        }
        self
    }

    /// Total display-list memory in words, `None` if it has to be read
    /// from the hardware
    pub fn dlist_words(self) -> Option<usize> {
        if self.is_gen6() {
            None
        } else {
            Some(legacy::DLIST_WORDS)
        }
    }

    /// Read the display-list memory size from the hardware
    pub fn probe_dlist_words(self, regs: &Access<'_>) -> usize {
        match self.dlist_words() {
            Some(words) => words,
            None => regs.read(gen6::CXM_SIZE) as usize,
        }
    }

    /// Line-buffer memory in words
    pub fn lbm_words(self) -> usize {
        match self {
            Self::Vc4 => 48 * 1024,
            Self::Vc5 => 60 * 1024,
            Self::Vc6C | Self::Vc6D => 1024,
        }
    }

    /// Unified pixel memory in words, zero where the part has none
    pub fn upm_words(self) -> usize {
        if self.is_gen6() {
            1024 * 256
        } else {
            0
        }
    }

    /// Global bring-up sequence
    pub fn hw_init(self, regs: &Access<'_>) {
        if self.is_gen6() {
            regs.write(
                gen6::CONTROL,
                gen6::CONTROL_HVS_EN
                    | gen6::CONTROL_PF_LINES.set(8)
                    | gen6::CONTROL_MAX_REQS.set(15),
            );
            regs.write(gen6::PRI_MAP0, u32::MAX);
            regs.write(gen6::PRI_MAP1, u32::MAX);
            return;
        }

        regs.modify(legacy::DISPCTRL, 0, DispCtrl::ENABLE.bits());

        // Output 2 on channel 0, outputs 3..5 unconnected
        let reg = regs.read(legacy::DISPECTRL);
        regs.write(legacy::DISPECTRL, legacy::DISPECTRL_DSP2_MUX.replace(reg, 0));
        let reg = regs.read(legacy::DISPCTRL);
        regs.write(legacy::DISPCTRL, legacy::DISPCTRL_DSP3_MUX.replace(reg, 3));
        let reg = regs.read(legacy::DISPEOLN);
        regs.write(legacy::DISPEOLN, legacy::DISPEOLN_DSP4_MUX.replace(reg, 3));
        let reg = regs.read(legacy::DISPDITHER);
        regs.write(legacy::DISPDITHER, legacy::DISPDITHER_DSP5_MUX.replace(reg, 3));

        let mut dispctrl = regs.read(legacy::DISPCTRL);
        dispctrl |= (DispCtrl::DISPEIRQ0 | DispCtrl::DISPEIRQ1 | DispCtrl::DISPEIRQ2).bits();

        // Every per-channel cause starts disarmed; EOF is armed on demand
        let mut disarm = DispCtrl::DMAEIRQ | DispCtrl::SCLEIRQ | DispCtrl::SLVWREIRQ;
        if self == Self::Vc4 {
            disarm |= DispCtrl::SLVRDEIRQ;
        }
        dispctrl &= !disarm.bits();
        for ch in ChannelId::all() {
            dispctrl &= !(self.eof_irq_bit(ch) | self.eoln_irq_bit(ch) | self.underrun_irq_bit(ch));
        }

        // AXI panic when the FIFO runs below two lines
        for panic in [
            legacy::DISPCTRL_PANIC0,
            legacy::DISPCTRL_PANIC1,
            legacy::DISPCTRL_PANIC2,
        ] {
            dispctrl = panic.replace(dispctrl, 2);
        }

        regs.write(legacy::DISPCTRL, dispctrl);
    }

    /// DISPCTRL end-of-frame enable of a legacy channel
    pub fn eof_irq_bit(self, ch: ChannelId) -> u32 {
        let ch = ch.index();
        match self {
            Self::Vc4 => 1 << (7 + 2 * ch),
            _ => 1 << (7 + 4 * ch),
        }
    }

    /// DISPCTRL end-of-line enable of a legacy channel
    pub fn eoln_irq_bit(self, ch: ChannelId) -> u32 {
        let ch = ch.index();
        match self {
            Self::Vc4 => 1 << (8 + 2 * ch),
            _ => 1 << (8 + 4 * ch),
        }
    }

    /// DISPCTRL underrun enable of a legacy channel
    pub fn underrun_irq_bit(self, ch: ChannelId) -> u32 {
        let ch = ch.index();
        match self {
            Self::Vc4 => 1 << (13 + ch),
            _ => 1 << (9 + 4 * ch),
        }
    }

    /// Register and field holding the frame counter of `ch`
    pub fn frame_count_location(self, ch: ChannelId) -> (Reg, Field) {
        if self.is_gen6() {
            return (gen6::status(ch.index()), gen6::STATUS_FRCNT);
        }
        match (self, ch.index()) {
            (Self::Vc4, 0) => (legacy::DISPSTAT1, legacy::DISPSTAT1_FRCNT0),
            (Self::Vc4, 1) => (legacy::DISPSTAT1, legacy::DISPSTAT1_FRCNT1),
            (Self::Vc4, _) => (legacy::DISPSTAT2, legacy::DISPSTAT2_FRCNT2),
            (_, 0) => (legacy::DISPSTAT1, legacy::VC5_DISPSTAT1_FRCNT0),
            (_, 1) => (legacy::DISPSTAT1, legacy::VC5_DISPSTAT1_FRCNT1),
            (_, _) => (legacy::DISPSTAT2, legacy::VC5_DISPSTAT2_FRCNT2),
        }
    }

    pub fn frame_count(self, regs: &Access<'_>, ch: ChannelId) -> FrameCount {
        let (reg, field) = self.frame_count_location(ch);
        FrameCount::new(regs.read_field(reg, field))
    }

    /// Register and bit telling whether `ch` is running
    pub fn enable_location(self, ch: ChannelId) -> (Reg, u32) {
        if self.is_gen6() {
            (gen6::ctrl0(ch.index()), gen6::CTRL0_ENB)
        } else {
            (legacy::dispctrlx(ch.index()), DispCtrlX::ENABLE.bits())
        }
    }

    pub fn channel_enabled(self, regs: &Access<'_>, ch: ChannelId) -> bool {
        let (reg, bit) = self.enable_location(ch);
        regs.read(reg) & bit != 0
    }

    /// Reset the channel and program it for `geometry`
    ///
    /// Returns `true` when the caller has to reload the channel's gamma
    /// table: on VC4 the gamma SRAM is shared and powers down when every
    /// channel has gamma disabled, losing its contents.
    pub fn init_channel(self, regs: &Access<'_>, ch: ChannelId, geometry: &Geometry) -> bool {
        let idx = ch.index();
        let width = geometry.width;
        let height = geometry.height;

        if self.is_gen6() {
            regs.write(gen6::ctrl0(idx), gen6::CTRL0_RESET);
            regs.write(
                gen6::ctrl1(idx),
                if geometry.interlaced {
                    gen6::CTRL1_INTLACE
                } else {
                    0
                },
            );
            let mut ctrl0 = gen6::CTRL0_ENB
                | gen6::CTRL0_FWIDTH.set(width - 1)
                | gen6::CTRL0_LINES.set(height - 1);
            if geometry.oneshot {
                ctrl0 |= gen6::CTRL0_ONESHOT;
            }
            regs.write(gen6::ctrl0(idx), ctrl0);
            return false;
        }

        let ctrlx = legacy::dispctrlx(idx);
        regs.write(ctrlx, 0);
        regs.write(ctrlx, DispCtrlX::RESET.bits());
        regs.write(ctrlx, 0);

        let mut value = DispCtrlX::ENABLE.bits();
        match self {
            Self::Vc4 => {
                value |= legacy::VC4_DISPCTRLX_WIDTH.set(width)
                    | legacy::VC4_DISPCTRLX_HEIGHT.set(height);
                if geometry.oneshot {
                    value |= legacy::VC4_DISPCTRLX_ONESHOT;
                }
            }
            _ => {
                value |= legacy::VC5_DISPCTRLX_WIDTH.set(width)
                    | legacy::VC5_DISPCTRLX_HEIGHT.set(height);
                if geometry.oneshot {
                    value |= legacy::VC5_DISPCTRLX_ONESHOT;
                }
            }
        }
        regs.write(ctrlx, value);

        let mut bkgnd = DispBkgnd::from_bits_retain(regs.read(legacy::dispbkgndx(idx)));
        bkgnd.remove(DispBkgnd::GAMMA | DispBkgnd::INTERLACE);
        if self == Self::Vc4 {
            bkgnd.insert(DispBkgnd::AUTOHS | DispBkgnd::GAMMA);
        } else {
            bkgnd.remove(DispBkgnd::BCK2BCK);
        }
        if geometry.interlaced {
            bkgnd.insert(DispBkgnd::INTERLACE);
        }
        regs.write(legacy::dispbkgndx(idx), bkgnd.bits());

        self == Self::Vc4
    }

    /// Stop the channel, optionally checking it reached idle
    ///
    /// The channel ends up in the disabled register state whatever the
    /// check finds.
    pub fn stop_channel(self, regs: &Access<'_>, ch: ChannelId, verify: bool) -> StopReport {
        let idx = ch.index();

        let (ctrl, enable, reset, status, mode, empty) = if self.is_gen6() {
            (
                gen6::ctrl0(idx),
                gen6::CTRL0_ENB,
                gen6::CTRL0_RESET,
                gen6::status(idx),
                gen6::STATUS_MODE,
                gen6::STATUS_EMPTY,
            )
        } else {
            (
                legacy::dispctrlx(idx),
                DispCtrlX::ENABLE.bits(),
                DispCtrlX::RESET.bits(),
                legacy::dispstatx(idx),
                legacy::DISPSTATX_MODE,
                legacy::DISPSTATX_EMPTY,
            )
        };

        let was_enabled = regs.read(ctrl) & enable != 0;
        if was_enabled {
            if self.is_gen6() {
                // CTRL0 keeps its geometry, only RESET and ENB change
                regs.write(ctrl, regs.read(ctrl) | reset);
                regs.write(ctrl, regs.read(ctrl) & !enable);
            } else {
                regs.write(ctrl, reset);
                regs.write(ctrl, 0);
            }
        }

        let mut report = StopReport {
            was_enabled,
            problem: None,
        };
        if !verify {
            return report;
        }

        let full = if self.is_gen6() {
            0
        } else {
            legacy::DISPSTATX_FULL
        };
        let stat = regs.read(status);

        report.problem = if regs.read(ctrl) & reset != 0 {
            Some("reset still asserted")
        } else if mode.get(stat) != MODE_DISABLED {
            Some("mode is not disabled")
        } else if stat & (full | empty) != empty {
            Some("FIFO is not empty")
        } else {
            None
        };
        report
    }

    /// Point the channel at the display list starting at word `start`
    pub fn install_dlist(self, regs: &Access<'_>, ch: ChannelId, start: usize) {
        if self.is_gen6() {
            regs.write(
                gen6::lptrs(ch.index()),
                gen6::LPTRS_HEADE.set(start as u32),
            );
        } else {
            regs.write(legacy::displist(ch.index()), start as u32);
        }
    }

    /// Arm or disarm the end-of-frame interrupt of `ch`
    pub fn set_eof_irq(self, regs: &Access<'_>, ch: ChannelId, enabled: bool) {
        if self.is_gen6() {
            regs.set_eof_line(ch.index(), enabled);
            return;
        }
        let bit = self.eof_irq_bit(ch);
        if enabled {
            regs.modify(legacy::DISPCTRL, 0, bit);
        } else {
            regs.modify(legacy::DISPCTRL, bit, 0);
        }
    }

    /// Acknowledge a pending end-of-frame status so the next arm does not
    /// fire on a stale event
    pub fn clear_eof_status(self, regs: &Access<'_>, ch: ChannelId) {
        if self.has_shared_irq() {
            regs.write(legacy::DISPSTAT, legacy::dispstat_eof(ch.index()));
        }
    }

    /// Enable or disable the underrun interrupt of `ch`
    ///
    /// Enabling also acknowledges any underrun that is already pending.
    /// Gen 6 has no underrun cause, this is a no-op there.
    pub fn set_underrun_irq(self, regs: &Access<'_>, ch: ChannelId, enabled: bool) {
        if !self.has_shared_irq() {
            return;
        }
        let bit = self.underrun_irq_bit(ch);
        if enabled {
            regs.write(legacy::DISPSTAT, legacy::dispstat_euflow(ch.index()));
            regs.modify(legacy::DISPCTRL, 0, bit);
        } else {
            regs.modify(legacy::DISPCTRL, bit, 0);
        }
    }

    /// Apply the background-fill request of the last commit
    pub fn set_bg_fill(self, regs: &Access<'_>, ch: ChannelId, enabled: bool) {
        let (reg, bit) = if self.is_gen6() {
            (gen6::ctrl1(ch.index()), gen6::CTRL1_BGENB)
        } else {
            (legacy::dispbkgndx(ch.index()), DispBkgnd::FILL.bits())
        };
        if enabled {
            regs.modify(reg, 0, bit);
        } else {
            regs.modify(reg, bit, 0);
        }
    }

    /// Upload a gamma table. Only VC4 has a per-channel LUT in the scaler.
    pub fn load_gamma(self, regs: &Access<'_>, ch: ChannelId, lut: &GammaLut) {
        if self != Self::Vc4 {
            return;
        }

        let base = (ch.index() * 3 * GAMMA_ENTRIES) as u32;
        regs.write(legacy::GAMADDR, legacy::GAMADDR_AUTOINC | base);
        for component in lut.components() {
            for &value in component.iter() {
                regs.write(legacy::GAMDATA, value as u32);
            }
        }
    }

    /// Which channel feeds display output `output`
    ///
    /// `None` when the output is not connected to any channel. Reads the
    /// output mux on VC5, hence the register guard.
    pub fn channel_for_output(self, regs: &Access<'_>, output: usize) -> Option<ChannelId> {
        let index = match self {
            Self::Vc4 => output,
            Self::Vc5 => match output {
                0 | 1 => output,
                2 => {
                    let mux = regs.read_field(legacy::DISPECTRL, legacy::DISPECTRL_DSP2_MUX);
                    if mux == 0 {
                        2
                    } else {
                        0
                    }
                }
                3 => Self::muxed(regs.read_field(legacy::DISPCTRL, legacy::DISPCTRL_DSP3_MUX))?,
                4 => Self::muxed(regs.read_field(legacy::DISPEOLN, legacy::DISPEOLN_DSP4_MUX))?,
                5 => Self::muxed(regs.read_field(legacy::DISPDITHER, legacy::DISPDITHER_DSP5_MUX))?,
                _ => return None,
            },
            Self::Vc6C | Self::Vc6D => match output {
                0 => 0,
                2 => 2,
                1 | 3 | 4 => 1,
                _ => return None,
            },
        };
        ChannelId::new(index).ok()
    }

    /// Mux value 3 means "not connected"
    fn muxed(value: u32) -> Option<usize> {
        if value == 3 {
            None
        } else {
            Some(value as usize)
        }
    }
}
