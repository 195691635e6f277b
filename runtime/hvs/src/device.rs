//! Device - Arenas, deferred free and channel control for one scaler
//!
//! # Ownership
//! [`HvsDevice`] is the single owner of everything the scaler's memories
//! are carved into. Commit paths, the interrupt dispatcher and the sweep
//! worker all reach the same [`Shared`] state through it; there is no
//! global.
//!
//! # Locking
//! - One `spin::Mutex` covers the three arenas and the deferred-free queue.
//!   It is held for every allocate, free, enqueue and sweep step, and for
//!   the end-of-frame arm/disarm writes that must stay ordered with the
//!   queue contents.
//! - Each channel has its own `spin::Mutex` for its software state.
//! - A channel lock may be held while taking the arena lock, never the
//!   other way round.
//! - Frame counters and enable bits used to judge reclaim eligibility are
//!   read outside the arena lock.
//!
//! # Display list life cycle
//! ```text
//! allocate_dlist -> write_dlist -> install / enable_channel -> retire
//!   (reserved)      (populated)      (programmed)              |
//!                                                               v
//!                          free now if never programmed, else queue with
//!                          target = frame count + 1 until a sweep sees
//!                          the channel reach it or go idle
//! ```

use crate::channel::{Channel, ChannelId, ChannelState, GammaLut, Geometry, MAX_CHANNELS};
use crate::config::HvsConfig;
use crate::dlist::{DlistAllocation, DlistBuilder, FilterKernel, KERNEL_WORDS};
use crate::frcnt::FrameCount;
use crate::generation::Generation;
use crate::irq::{self, IrqReturn, IrqSource};
use crate::regs::{gen6, legacy, Access, RegisterBus};
use crate::snapshot::{ArenaSnapshot, MmSnapshot, StaleSnapshot};
use crate::stale::{ChannelSample, StaleQueue};
use crate::sweep::{sweep_queue, SweepCause, SweepHandle, SweepWorker};
use crate::{HvsError, Result};
use hvs_allocator::{AllocError, Allocation, Handle, HandleTable, RangeAllocator};
use spin::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Everything behind the arena lock
struct MmState {
    dlist: RangeAllocator,
    lbm: RangeAllocator,
    upm: HandleTable,
    stale: StaleQueue,
    /// Filter kernels, allocated for the lifetime of the device
    kernels: Vec<(FilterKernel, Allocation)>,
    /// Set by teardown, every arena operation fails afterwards
    closed: bool,
}

impl MmState {
    fn check_open(&self) -> Result<()> {
        if self.closed {
            Err(HvsError::ShutDown)
        } else {
            Ok(())
        }
    }
}

/// State shared between the device handle, the interrupt path and the
/// sweep worker
pub(crate) struct Shared {
    bus: Arc<dyn RegisterBus>,
    generation: Generation,
    mm: Mutex<MmState>,
    channels: [Mutex<Channel>; MAX_CHANNELS],
    /// Mirrors the end-of-frame enable of each channel, written under the
    /// arena lock
    eof_armed: [AtomicBool; MAX_CHANNELS],
    underruns: AtomicU64,
    channel_underruns: [AtomicU64; MAX_CHANNELS],
    sweep: SweepHandle,
    shut_down: AtomicBool,
    verify_disable: bool,
}

impl Shared {
    pub(crate) fn generation(&self) -> Generation {
        self.generation
    }

    /// Enter the device, `None` once it has been removed
    pub(crate) fn access(&self) -> Option<Access<'_>> {
        Access::enter(self.bus.as_ref())
    }

    pub(crate) fn channel(&self, ch: ChannelId) -> &Mutex<Channel> {
        &self.channels[ch.index()]
    }

    pub(crate) fn eof_armed(&self, ch: ChannelId) -> bool {
        self.eof_armed[ch.index()].load(Ordering::Acquire)
    }

    fn check_live(&self) -> Result<()> {
        if self.shut_down.load(Ordering::Acquire) {
            Err(HvsError::ShutDown)
        } else {
            Ok(())
        }
    }

    /// Acknowledge any stale end-of-frame event and arm the interrupt.
    /// Caller holds the arena lock.
    fn arm_eof(&self, ch: ChannelId) {
        let Some(regs) = self.access() else {
            return;
        };
        self.generation.clear_eof_status(&regs, ch);
        if !self.eof_armed[ch.index()].swap(true, Ordering::AcqRel) {
            self.generation.set_eof_irq(&regs, ch, true);
        }
    }

    /// Caller holds the arena lock
    fn disarm_eof(&self, ch: ChannelId) {
        if !self.eof_armed[ch.index()].swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(regs) = self.access() {
            self.generation.set_eof_irq(&regs, ch, false);
        }
    }

    /// End-of-frame follow-up from interrupt context: queue a sweep if
    /// anything is waiting, and stop listening on `ch` once nothing of its
    /// own is
    pub(crate) fn schedule_sweep(&self, ch: ChannelId) {
        let mm = self.mm.lock();

        if !mm.stale.is_empty() {
            self.sweep.schedule();
        }
        if mm.stale.len_for(ch) == 0 {
            self.disarm_eof(ch);
        }
    }

    pub(crate) fn report_underrun(&self, ch: ChannelId) {
        self.underruns.fetch_add(1, Ordering::Relaxed);
        self.channel_underruns[ch.index()].fetch_add(1, Ordering::Relaxed);
        log::error!("HVS underrun on channel {}", ch);
    }

    /// Enable state and frame counter of every channel
    ///
    /// With the device gone every channel reads as inactive: nothing can be
    /// fetching from display-list memory any more.
    fn sample_channels(&self) -> [ChannelSample; MAX_CHANNELS] {
        let mut samples = [ChannelSample::INACTIVE; MAX_CHANNELS];
        let Some(regs) = self.access() else {
            return samples;
        };

        for ch in ChannelId::all() {
            samples[ch.index()] = ChannelSample {
                active: self.generation.channel_enabled(&regs, ch),
                frame_count: self.generation.frame_count(&regs, ch),
            };
        }
        samples
    }

    fn frame_count(&self, ch: ChannelId) -> FrameCount {
        match self.access() {
            Some(regs) => self.generation.frame_count(&regs, ch),
            None => FrameCount::default(),
        }
    }

    /// Reclaim every queued display list the hardware is done with
    ///
    /// Returns the number of entries freed.
    pub(crate) fn sweep(&self, cause: SweepCause) -> usize {
        let snapshot = {
            let mm = self.mm.lock();
            if mm.stale.is_empty() {
                return 0;
            }
            mm.stale.snapshot()
        };

        let samples = self.sample_channels();

        let mut mm = self.mm.lock();
        let reclaimed = mm.stale.drain_reclaimable(snapshot, &samples);
        let count = reclaimed.len();

        for entry in reclaimed {
            let (start, size) = (entry.alloc.start(), entry.alloc.size());
            if let Err(e) = mm.dlist.free(entry.alloc) {
                log::error!("sweep: failed to free [{:#x} + {:#x}]: {}", start, size, e);
            }
        }

        for ch in ChannelId::all() {
            if mm.stale.len_for(ch) == 0 {
                self.disarm_eof(ch);
            }
        }

        if count > 0 {
            log::debug!(
                "sweep ({:?}): reclaimed {}, {} still queued, {} words free",
                cause,
                count,
                mm.stale.len(),
                mm.dlist.free_space()
            );
        } else {
            log::trace!("sweep ({:?}): nothing eligible, {} queued", cause, mm.stale.len());
        }
        count
    }

    fn control_register(&self) -> u32 {
        let reg = if self.generation.is_gen6() {
            gen6::CONTROL
        } else {
            legacy::DISPCTRL
        };
        self.access().map(|regs| regs.read(reg)).unwrap_or(0)
    }
}

/// One brought-up scaler
///
/// All methods take `&self`: wrap the device in an `Arc` to share it
/// between the commit path and the interrupt handler.
pub struct HvsDevice {
    shared: Arc<Shared>,
    worker: Mutex<SweepWorker>,
}

impl HvsDevice {
    /// Bring up the scaler
    ///
    /// Detects the exact revision, sizes the arenas, runs the generation's
    /// init sequence, uploads the filter kernels and starts the sweep
    /// worker.
    ///
    /// # Errors
    /// - `DeviceGone` if the register window is not accessible
    /// - `ResourceExhausted` if the filter kernels do not fit
    /// - `WorkerSpawn` if the sweep thread cannot be started
    pub fn bring_up(bus: Arc<dyn RegisterBus>, config: HvsConfig) -> Result<Self> {
        let (generation, dlist_total) = {
            let regs = Access::enter(bus.as_ref()).ok_or(HvsError::DeviceGone)?;
            let generation = config.generation.detect_revision(&regs);
            let total = generation.probe_dlist_words(&regs);
            generation.hw_init(&regs);
            (generation, total)
        };

        let dlist_capacity = config.dlist_capacity(dlist_total);
        let mut mm = MmState {
            dlist: RangeAllocator::new("dlist", config.dlist_base, dlist_capacity),
            lbm: RangeAllocator::new("lbm", 0, config.lbm_size),
            upm: HandleTable::new(
                RangeAllocator::new("upm", 0, config.upm_size),
                config.upm_handles,
            ),
            stale: StaleQueue::new(),
            kernels: Vec::new(),
            closed: false,
        };

        if config.filter_kernels {
            for kernel in FilterKernel::ALL {
                let range = mm.dlist.allocate(KERNEL_WORDS).map_err(|e| {
                    log::error!("Failed to allocate space for filter kernel {:?}: {}", kernel, e);
                    HvsError::from_arena("dlist", KERNEL_WORDS)(e)
                })?;
                if let Some(regs) = Access::enter(bus.as_ref()) {
                    regs.write_dlist(range.start(), &kernel.words());
                }
                mm.kernels.push((kernel, range));
            }
        }

        log::info!(
            "hvs: {} bring-up, dlist [{:#x} + {:#x}], lbm {} words, upm {} words / {} handles",
            generation.name(),
            config.dlist_base,
            dlist_capacity,
            config.lbm_size,
            config.upm_size,
            config.upm_handles
        );

        let (sweep, queue) = sweep_queue();
        let shared = Arc::new(Shared {
            bus,
            generation,
            mm: Mutex::new(mm),
            channels: Default::default(),
            eof_armed: Default::default(),
            underruns: AtomicU64::new(0),
            channel_underruns: Default::default(),
            sweep,
            shut_down: AtomicBool::new(false),
            verify_disable: cfg!(any(debug_assertions, feature = "diagnostics")),
        });

        let job_state = Arc::clone(&shared);
        let worker = SweepWorker::spawn(queue, config.fallback_sweep, move |cause| {
            if cause == SweepCause::Fallback && job_state.mm.lock().stale.is_empty() {
                return;
            }
            job_state.sweep(cause);
        })?;

        Ok(Self {
            shared,
            worker: Mutex::new(worker),
        })
    }

    /// Generation after revision detection
    pub fn generation(&self) -> Generation {
        self.shared.generation
    }

    /// Reserve display-list memory for one commit on `channel`
    ///
    /// Size it as the sum of the plane descriptor sizes plus one for the
    /// end word. When the arena is full the queue is swept once and the
    /// allocation retried; there is no further retry.
    ///
    /// # Errors
    /// `ResourceExhausted` if the retry fails too. The whole commit must
    /// then be abandoned.
    pub fn allocate_dlist(&self, channel: ChannelId, words: usize) -> Result<DlistAllocation> {
        let first = {
            let mut mm = self.shared.mm.lock();
            mm.check_open()?;
            mm.dlist.allocate(words)
        };

        let range = match first {
            Ok(range) => range,
            Err(AllocError::OutOfSpace { available, .. }) => {
                log::error!(
                    "Failed to allocate display list: requested {} words, {} free, DISPCTRL is {:08x}",
                    words,
                    available,
                    self.shared.control_register()
                );

                self.shared.sweep(SweepCause::Demand);

                let mut mm = self.shared.mm.lock();
                mm.check_open()?;
                mm.dlist.allocate(words).map_err(|e| {
                    log::error!("Display list allocation still failing after sweep: {}", e);
                    HvsError::from_arena("dlist", words)(e)
                })?
            }
            Err(e) => return Err(e.into()),
        };

        log::trace!(
            "channel {}: dlist [{:#x} + {:#x}]",
            channel,
            range.start(),
            range.size()
        );
        Ok(DlistAllocation::new(range, channel))
    }

    /// Write the display list into the reserved memory
    ///
    /// # Errors
    /// - `DlistSizeMismatch` unless `words` fills the allocation exactly
    /// - `DlistProgrammed` if the hardware may already be reading it
    pub fn write_dlist(&self, dlist: &mut DlistAllocation, words: &[u32]) -> Result<()> {
        self.shared.check_live()?;

        if dlist.programmed {
            return Err(HvsError::DlistProgrammed {
                start: dlist.start(),
            });
        }
        if words.len() != dlist.size() {
            return Err(HvsError::DlistSizeMismatch {
                expected: dlist.size(),
                actual: words.len(),
            });
        }

        if let Some(regs) = self.shared.access() {
            regs.write_dlist(dlist.start(), words);
        }
        dlist.populated = true;
        Ok(())
    }

    /// Point `channel` at a populated display list
    ///
    /// The allocation is marked programmed before the pointer register is
    /// written, and the channel's current list only changes after the
    /// write. With the device gone the install is skipped and the
    /// allocation stays unprogrammed.
    ///
    /// # Errors
    /// `ChannelMismatch` or `DlistNotPopulated` on caller mistakes.
    pub fn install(&self, channel: ChannelId, dlist: &mut DlistAllocation) -> Result<()> {
        self.shared.check_live()?;
        Self::check_owner(channel, dlist)?;
        if !dlist.populated {
            return Err(HvsError::DlistNotPopulated {
                start: dlist.start(),
            });
        }

        let Some(regs) = self.shared.access() else {
            log::debug!("channel {}: device gone, install skipped", channel);
            return Ok(());
        };

        dlist.programmed = true;
        self.shared
            .generation
            .install_dlist(&regs, channel, dlist.start());
        drop(regs);

        self.shared.channel(channel).lock().current_dlist = Some(dlist.start());
        Ok(())
    }

    /// Give up a display list that `channel` no longer needs
    ///
    /// Never-programmed lists go straight back to the arena. Programmed ones
    /// are queued until the channel's frame counter passes the current
    /// frame, and the channel's end-of-frame interrupt is armed to drive
    /// the sweep.
    ///
    /// # Errors
    /// `ChannelMismatch` if the list belongs to another channel. It is
    /// still retired, against the channel that owns it.
    pub fn retire(&self, channel: ChannelId, dlist: DlistAllocation) -> Result<()> {
        let owner = dlist.channel;
        let mismatch = Self::check_owner(channel, &dlist).err();
        if let Some(err) = &mismatch {
            log::warn!("retire: {}", err);
        }

        if !dlist.programmed {
            let mut mm = self.shared.mm.lock();
            mm.check_open()?;
            mm.dlist.free(dlist.range)?;
            return mismatch.map_or(Ok(()), Err);
        }

        let Some(regs) = self.shared.access() else {
            // Nothing can be reading it any more
            let mut mm = self.shared.mm.lock();
            mm.check_open()?;
            mm.dlist.free(dlist.range)?;
            return mismatch.map_or(Ok(()), Err);
        };
        let target = self.shared.generation.frame_count(&regs, owner).next();
        drop(regs);

        let mut mm = self.shared.mm.lock();
        mm.check_open()?;
        log::trace!(
            "channel {}: retiring [{:#x} + {:#x}] until frame {}",
            owner,
            dlist.start(),
            dlist.size(),
            target
        );
        mm.stale.push(dlist.range, owner, target);
        self.shared.arm_eof(owner);
        drop(mm);

        mismatch.map_or(Ok(()), Err)
    }

    /// Allocate, populate and (if the channel runs) install one frame's
    /// display list
    ///
    /// Nothing is left behind on failure. The caller retires the previous
    /// list once this succeeds.
    pub fn commit(&self, channel: ChannelId, planes: DlistBuilder) -> Result<DlistAllocation> {
        let mut dlist = self.allocate_dlist(channel, planes.word_count())?;

        if let Err(e) = self.write_dlist(&mut dlist, &planes.finish()) {
            self.retire(channel, dlist)?;
            return Err(e);
        }

        if self.shared.channel(channel).lock().is_enabled() {
            if let Err(e) = self.install(channel, &mut dlist) {
                self.retire(channel, dlist)?;
                return Err(e);
            }
        }
        Ok(dlist)
    }

    /// Reset `channel`, program its geometry and point it at `dlist`
    ///
    /// On VC4 the channel's gamma table is reloaded as part of the enable.
    ///
    /// # Errors
    /// - `InvalidGeometry` for a zero-sized mode
    /// - `InvalidTransition` if the channel is not disabled
    /// - `ChannelMismatch`, `DlistNotPopulated` on caller mistakes
    /// - `DeviceGone` if the registers are not accessible
    pub fn enable_channel(
        &self,
        channel: ChannelId,
        geometry: Geometry,
        dlist: &mut DlistAllocation,
    ) -> Result<()> {
        self.shared.check_live()?;
        geometry.validate(channel)?;
        Self::check_owner(channel, dlist)?;
        if !dlist.populated {
            return Err(HvsError::DlistNotPopulated {
                start: dlist.start(),
            });
        }

        let regs = self.shared.access().ok_or(HvsError::DeviceGone)?;
        let generation = self.shared.generation;
        let mut state = self.shared.channel(channel).lock();

        state.transition(channel, ChannelState::Resetting)?;

        if generation.init_channel(&regs, channel, &geometry) {
            let linear;
            let lut = match &state.gamma {
                Some(lut) => lut,
                None => {
                    linear = GammaLut::linear();
                    &linear
                }
            };
            generation.load_gamma(&regs, channel, lut);
        }

        generation.set_bg_fill(&regs, channel, state.bg_fill);

        dlist.programmed = true;
        generation.install_dlist(&regs, channel, dlist.start());
        state.current_dlist = Some(dlist.start());
        state.geometry = Some(geometry);

        state.transition(channel, ChannelState::Enabled)?;
        log::debug!(
            "channel {}: enabled {}x{}{}",
            channel,
            geometry.width,
            geometry.height,
            if geometry.interlaced { "i" } else { "" }
        );
        Ok(())
    }

    /// Stop `channel`
    ///
    /// Idempotent. The hardware ends up in the disabled state even when the
    /// idle check fails; the failure is logged and kept for
    /// [`channel_diagnostic`](Self::channel_diagnostic). Every list queued
    /// for the channel becomes reclaimable and a sweep is scheduled.
    pub fn disable_channel(&self, channel: ChannelId) -> Result<()> {
        self.shared.check_live()?;

        let mut state = self.shared.channel(channel).lock();

        if let Some(regs) = self.shared.access() {
            let report =
                self.shared
                    .generation
                    .stop_channel(&regs, channel, self.shared.verify_disable);

            state.last_diagnostic = report.problem.map(|detail| {
                let err = HvsError::InconsistentHardwareState {
                    channel: channel.index(),
                    detail: detail.into(),
                };
                log::warn!("{}", err);
                err
            });
        }

        if state.state != ChannelState::Disabled {
            state.transition(channel, ChannelState::Disabled)?;
            log::debug!("channel {}: disabled", channel);
        }
        state.current_dlist = None;
        drop(state);

        if self.shared.mm.lock().stale.len_for(channel) > 0 {
            self.shared.sweep.schedule();
        }
        Ok(())
    }

    /// Store a gamma table for `channel`, `None` for the identity ramp
    ///
    /// Uploaded right away when the channel is running on VC4, and on
    /// every later enable.
    pub fn set_gamma(&self, channel: ChannelId, lut: Option<GammaLut>) -> Result<()> {
        self.shared.check_live()?;
        let mut state = self.shared.channel(channel).lock();
        state.gamma = lut;

        if state.is_enabled() {
            if let Some(regs) = self.shared.access() {
                let lut = state.gamma.clone().unwrap_or_else(GammaLut::linear);
                self.shared.generation.load_gamma(&regs, channel, &lut);
            }
        }
        Ok(())
    }

    /// Request background fill for the next frames of `channel`
    ///
    /// Legacy parts take it immediately; gen 6 latches it at the next
    /// end of frame.
    pub fn set_background_fill(&self, channel: ChannelId, enabled: bool) -> Result<()> {
        self.shared.check_live()?;
        self.shared.channel(channel).lock().bg_fill = enabled;

        if self.shared.generation.has_shared_irq() {
            if let Some(regs) = self.shared.access() {
                self.shared.generation.set_bg_fill(&regs, channel, enabled);
            }
        }
        Ok(())
    }

    /// Take a reference to a unified-pixel-memory range of `words`
    ///
    /// # Errors
    /// `ResourceExhausted` when no handle or no space is left.
    pub fn acquire_handle(&self, words: usize) -> Result<Handle> {
        let mut mm = self.shared.mm.lock();
        mm.check_open()?;
        mm.upm
            .acquire(words)
            .map_err(HvsError::from_arena("upm", words))
    }

    /// Drop a reference taken with [`acquire_handle`](Self::acquire_handle)
    pub fn release_handle(&self, handle: Handle) -> Result<()> {
        let mut mm = self.shared.mm.lock();
        mm.check_open()?;
        mm.upm.release(handle)?;
        Ok(())
    }

    pub fn handle_refcount(&self, handle: Handle) -> Option<u32> {
        self.shared.mm.lock().upm.refcount(handle)
    }

    /// Line-buffer space for one plane
    ///
    /// Line buffers are not referenced from the display-list FIFO, so
    /// they are freed synchronously with [`free_lbm`](Self::free_lbm).
    pub fn allocate_lbm(&self, words: usize) -> Result<Allocation> {
        let mut mm = self.shared.mm.lock();
        mm.check_open()?;
        mm.lbm
            .allocate(words)
            .map_err(HvsError::from_arena("lbm", words))
    }

    pub fn free_lbm(&self, range: Allocation) -> Result<()> {
        let mut mm = self.shared.mm.lock();
        mm.check_open()?;
        mm.lbm.free(range)?;
        Ok(())
    }

    /// Interrupt entry point, call from the interrupt routing layer
    pub fn handle_irq(&self, source: IrqSource) -> IrqReturn {
        irq::dispatch(&self.shared, source)
    }

    /// Sweep right now on the calling thread
    ///
    /// Returns the number of display lists reclaimed.
    pub fn sweep_now(&self) -> usize {
        self.shared.sweep(SweepCause::Demand)
    }

    /// Stop reporting underruns for `channel`
    pub fn mask_underrun(&self, channel: ChannelId) {
        if let Some(regs) = self.shared.access() {
            self.shared
                .generation
                .set_underrun_irq(&regs, channel, false);
        }
    }

    /// Acknowledge any pending underrun on `channel` and report new ones
    pub fn unmask_underrun(&self, channel: ChannelId) {
        if let Some(regs) = self.shared.access() {
            self.shared
                .generation
                .set_underrun_irq(&regs, channel, true);
        }
    }

    /// Underruns seen on any channel since bring-up
    pub fn underrun_count(&self) -> u64 {
        self.shared.underruns.load(Ordering::Relaxed)
    }

    pub fn channel_underruns(&self, channel: ChannelId) -> u64 {
        self.shared.channel_underruns[channel.index()].load(Ordering::Relaxed)
    }

    /// Channel feeding display output `output`, `None` if unconnected or
    /// if the device is gone
    pub fn channel_for_output(&self, output: usize) -> Option<ChannelId> {
        let regs = self.shared.access()?;
        self.shared.generation.channel_for_output(&regs, output)
    }

    /// Current hardware frame counter of `channel`, zero if the device is
    /// gone
    pub fn frame_count(&self, channel: ChannelId) -> FrameCount {
        self.shared.frame_count(channel)
    }

    pub fn channel_state(&self, channel: ChannelId) -> ChannelState {
        self.shared.channel(channel).lock().state
    }

    /// Geometry of the last successful enable
    pub fn channel_geometry(&self, channel: ChannelId) -> Option<Geometry> {
        self.shared.channel(channel).lock().geometry
    }

    /// Start of the display list `channel` was last pointed at
    pub fn current_dlist(&self, channel: ChannelId) -> Option<usize> {
        self.shared.channel(channel).lock().current_dlist
    }

    /// Idle-check failure from the last disable of `channel`
    pub fn channel_diagnostic(&self, channel: ChannelId) -> Option<HvsError> {
        self.shared.channel(channel).lock().last_diagnostic.clone()
    }

    pub fn eof_armed(&self, channel: ChannelId) -> bool {
        self.shared.eof_armed(channel)
    }

    /// Offset of a filter kernel in display-list memory
    pub fn filter_kernel(&self, kernel: FilterKernel) -> Option<usize> {
        self.shared
            .mm
            .lock()
            .kernels
            .iter()
            .find(|(k, _)| *k == kernel)
            .map(|(_, range)| range.start())
    }

    pub fn stale_len(&self) -> usize {
        self.shared.mm.lock().stale.len()
    }

    pub fn stale_len_for(&self, channel: ChannelId) -> usize {
        self.shared.mm.lock().stale.len_for(channel)
    }

    pub fn dlist_free(&self) -> usize {
        self.shared.mm.lock().dlist.free_space()
    }

    pub fn lbm_free(&self) -> usize {
        self.shared.mm.lock().lbm.free_space()
    }

    pub fn upm_free(&self) -> usize {
        self.shared.mm.lock().upm.arena().free_space()
    }

    /// Copy of the arena state, taken under the lock
    pub fn mm_snapshot(&self) -> MmSnapshot {
        let mm = self.shared.mm.lock();
        MmSnapshot {
            dlist: ArenaSnapshot::of(&mm.dlist),
            lbm: ArenaSnapshot::of(&mm.lbm),
            upm: ArenaSnapshot::of(mm.upm.arena()),
            stale: mm
                .stale
                .iter()
                .map(|e| StaleSnapshot {
                    start: e.alloc.start(),
                    size: e.alloc.size(),
                    channel: e.channel,
                    target: e.target,
                })
                .collect(),
            handles: MmSnapshot::handles_of(&mm.upm),
        }
    }

    /// Shut the device down
    ///
    /// Cancels and joins the sweep worker, then drains the deferred-free
    /// queue and releases every range before the arenas go away. Any
    /// operation after this returns `ShutDown`. Idempotent, and also run
    /// on drop.
    pub fn teardown(&self) {
        if self.shared.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }

        self.worker.lock().shutdown();

        let mut mm = self.shared.mm.lock();
        mm.closed = true;

        let drained = mm.stale.drain_all();
        let stale_count = drained.len();
        for entry in drained {
            if let Err(e) = mm.dlist.free(entry.alloc) {
                log::error!("teardown: {}", e);
            }
        }
        for ch in ChannelId::all() {
            self.shared.disarm_eof(ch);
        }

        for (_, range) in core::mem::take(&mut mm.kernels) {
            if let Err(e) = mm.dlist.free(range) {
                log::error!("teardown: {}", e);
            }
        }

        let leftover = mm.dlist.live_count() + mm.lbm.live_count() + mm.upm.in_use();
        if leftover > 0 {
            log::warn!("teardown: {} ranges still owned by callers", leftover);
        }

        mm.dlist.clear();
        mm.lbm.clear();
        mm.upm.clear();

        log::info!("hvs: torn down ({} stale display lists drained)", stale_count);
    }

    fn check_owner(channel: ChannelId, dlist: &DlistAllocation) -> Result<()> {
        if dlist.channel != channel {
            return Err(HvsError::ChannelMismatch {
                channel: channel.index(),
                owner: dlist.channel.index(),
            });
        }
        Ok(())
    }
}

impl Drop for HvsDevice {
    fn drop(&mut self) {
        self.teardown();
    }
}
