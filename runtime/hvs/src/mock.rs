//! In-memory scaler for tests and simulation
//!
//! [`MockHvs`] implements [`RegisterBus`] over a register map and a
//! display-list memory, with just enough behaviour for the device logic
//! to see realistic state:
//! - DISPSTAT is write-one-to-clear
//! - Enabling or disabling a channel updates its status mode and FIFO
//!   bits, leaving the frame counter alone
//! - Frame counters only move when the test says so
//! - The device can be "removed", after which [`RegisterBus::enter`]
//!   fails

use crate::channel::ChannelId;
use crate::frcnt::FrameCount;
use crate::generation::Generation;
use crate::regs::legacy::{self, DispCtrlX};
use crate::regs::{gen6, Field, Reg, RegisterBus, MODE_DISABLED, MODE_RUN};
use crate::MAX_CHANNELS;
use spin::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Display-list memory reported by a gen 6 mock
pub const MOCK_CXM_WORDS: u32 = 8192;

pub struct MockHvs {
    generation: Generation,
    regs: Mutex<HashMap<u32, u32>>,
    dlist: Mutex<Vec<u32>>,
    writes: Mutex<Vec<(u32, u32)>>,
    live: AtomicBool,
    eof_lines: [AtomicBool; MAX_CHANNELS],
    stalled: [AtomicBool; MAX_CHANNELS],
    outstanding: AtomicUsize,
}

impl MockHvs {
    /// A freshly reset scaler of `generation`, every channel idle
    pub fn new(generation: Generation) -> Self {
        let mut regs = HashMap::new();

        if generation.is_gen6() {
            let version = match generation {
                Generation::Vc6D => gen6::VERSION_D0,
                _ => gen6::VERSION_C0,
            };
            regs.insert(gen6::VERSION.offset(), gen6::VERSION_FIELD.set(version));
            regs.insert(gen6::CXM_SIZE.offset(), MOCK_CXM_WORDS);
        }

        let mock = Self {
            generation,
            regs: Mutex::new(regs),
            dlist: Mutex::new(vec![0; generation.dlist_words().unwrap_or(MOCK_CXM_WORDS as usize)]),
            writes: Mutex::new(Vec::new()),
            live: AtomicBool::new(true),
            eof_lines: Default::default(),
            stalled: Default::default(),
            outstanding: AtomicUsize::new(0),
        };

        for ch in ChannelId::all() {
            mock.update_status(ch.index(), false);
        }
        mock
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Current value of `reg`, bypassing the live check
    pub fn reg(&self, reg: Reg) -> u32 {
        self.regs.lock().get(&reg.offset()).copied().unwrap_or(0)
    }

    /// Overwrite `reg` without any write emulation
    pub fn set_reg(&self, reg: Reg, value: u32) {
        self.regs.lock().insert(reg.offset(), value);
    }

    fn latch(&self, reg: Reg, bits: u32) {
        *self.regs.lock().entry(reg.offset()).or_insert(0) |= bits;
    }

    fn set_field(&self, reg: Reg, field: Field, value: u32) {
        let mut regs = self.regs.lock();
        let slot = regs.entry(reg.offset()).or_insert(0);
        *slot = field.replace(*slot, value);
    }

    /// Where the silicon keeps the frame counter of `ch`
    ///
    /// Written out per chip rather than taken from the generation profile,
    /// so a wrong profile shows up as a disagreement with the mock.
    fn frame_counter(&self, ch: ChannelId) -> (Reg, Field) {
        let dispstat1 = Reg::new(0x58);
        let dispstat2 = Reg::new(0x68);
        match (self.generation, ch.index()) {
            (Generation::Vc4, 0) => (dispstat1, Field::new(23, 18)),
            (Generation::Vc4, 1) => (dispstat1, Field::new(17, 12)),
            (Generation::Vc4, _) => (dispstat2, Field::new(17, 12)),
            (Generation::Vc5, 0) => (dispstat1, Field::new(25, 20)),
            (Generation::Vc5, 1) => (dispstat1, Field::new(19, 14)),
            (Generation::Vc5, _) => (dispstat2, Field::new(19, 14)),
            (_, idx) => (Reg::new(0x94 + 0x20 * idx as u32), Field::new(23, 18)),
        }
    }

    pub fn frame_count(&self, ch: ChannelId) -> FrameCount {
        let (reg, field) = self.frame_counter(ch);
        FrameCount::new(field.get(self.reg(reg)))
    }

    pub fn set_frame_count(&self, ch: ChannelId, count: u32) {
        let (reg, field) = self.frame_counter(ch);
        self.set_field(reg, field, FrameCount::new(count).get() as u32);
    }

    /// Move the frame counter of `ch` forward by `frames`, wrapping at 64
    pub fn advance_frames(&self, ch: ChannelId, frames: u32) {
        let current = self.frame_count(ch).get() as u32;
        self.set_frame_count(ch, current + frames);
    }

    /// Latch an end-of-frame event for `ch` in DISPSTAT
    ///
    /// Gen 6 has no status bit for it: call the handler for the channel's
    /// line directly.
    pub fn raise_eof(&self, ch: ChannelId) {
        if self.generation.has_shared_irq() {
            self.latch(legacy::DISPSTAT, legacy::dispstat_eof(ch.index()));
        }
    }

    /// Latch an underrun for `ch` in DISPSTAT
    pub fn raise_underrun(&self, ch: ChannelId) {
        if self.generation.has_shared_irq() {
            self.latch(legacy::DISPSTAT, legacy::dispstat_euflow(ch.index()));
        }
    }

    /// Whether the end-of-frame interrupt of `ch` is enabled in hardware
    pub fn eof_armed(&self, ch: ChannelId) -> bool {
        if self.generation.is_gen6() {
            self.eof_lines[ch.index()].load(Ordering::Acquire)
        } else {
            self.reg(legacy::DISPCTRL) & self.generation.eof_irq_bit(ch) != 0
        }
    }

    pub fn underrun_enabled(&self, ch: ChannelId) -> bool {
        self.reg(legacy::DISPCTRL) & self.generation.underrun_irq_bit(ch) != 0
    }

    /// Keep the FIFO of `ch` busy: the next disable leaves it running
    pub fn stall_fifo(&self, ch: ChannelId, stalled: bool) {
        self.stalled[ch.index()].store(stalled, Ordering::Release);
    }

    /// Simulate hot-unplug
    pub fn remove(&self) {
        self.live.store(false, Ordering::Release);
    }

    /// Register accesses entered and not yet exited
    pub fn outstanding_accesses(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    pub fn dlist_words(&self, start: usize, len: usize) -> Vec<u32> {
        let mem = self.dlist.lock();
        (start..start + len)
            .map(|i| mem.get(i).copied().unwrap_or(0))
            .collect()
    }

    /// Every value written to `reg`, oldest first
    pub fn writes_to(&self, reg: Reg) -> Vec<u32> {
        self.writes
            .lock()
            .iter()
            .filter(|(offset, _)| *offset == reg.offset())
            .map(|&(_, value)| value)
            .collect()
    }

    pub fn clear_write_log(&self) {
        self.writes.lock().clear();
    }

    fn channel_of_control(&self, offset: u32) -> Option<usize> {
        (0..MAX_CHANNELS).find(|&ch| {
            let reg = if self.generation.is_gen6() {
                gen6::ctrl0(ch)
            } else {
                legacy::dispctrlx(ch)
            };
            reg.offset() == offset
        })
    }

    fn update_status(&self, ch: usize, enabled: bool) {
        let (status, mode, empty, full) = if self.generation.is_gen6() {
            (gen6::status(ch), gen6::STATUS_MODE, gen6::STATUS_EMPTY, 0)
        } else {
            (
                legacy::dispstatx(ch),
                legacy::DISPSTATX_MODE,
                legacy::DISPSTATX_EMPTY,
                legacy::DISPSTATX_FULL,
            )
        };

        let mut regs = self.regs.lock();
        let slot = regs.entry(status.offset()).or_insert(0);
        if enabled || self.stalled[ch].load(Ordering::Acquire) {
            *slot = mode.replace(*slot, MODE_RUN) & !(empty | full);
        } else {
            *slot = mode.replace(*slot, MODE_DISABLED) | empty;
        }
    }
}

impl RegisterBus for MockHvs {
    fn read(&self, reg: Reg) -> u32 {
        self.reg(reg)
    }

    fn write(&self, reg: Reg, value: u32) {
        let offset = reg.offset();
        self.writes.lock().push((offset, value));

        if self.generation.has_shared_irq() && offset == legacy::DISPSTAT.offset() {
            let mut regs = self.regs.lock();
            let slot = regs.entry(offset).or_insert(0);
            *slot &= !value;
            return;
        }

        self.set_reg(reg, value);

        if let Some(ch) = self.channel_of_control(offset) {
            let enable = if self.generation.is_gen6() {
                gen6::CTRL0_ENB
            } else {
                DispCtrlX::ENABLE.bits()
            };
            self.update_status(ch, value & enable != 0);
        }
    }

    fn write_dlist(&self, offset: usize, words: &[u32]) {
        let mut mem = self.dlist.lock();
        let end = offset + words.len();
        if mem.len() < end {
            mem.resize(end, 0);
        }
        mem[offset..end].copy_from_slice(words);
    }

    fn enter(&self) -> bool {
        if !self.live.load(Ordering::Acquire) {
            return false;
        }
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        true
    }

    fn exit(&self) {
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
    }

    fn set_eof_line(&self, channel: usize, enabled: bool) {
        if let Some(line) = self.eof_lines.get(channel) {
            line.store(enabled, Ordering::Release);
        }
    }
}
