//! Integration tests for the complete scaler memory manager
//!
//! Every test brings up a real [`HvsDevice`] on top of [`MockHvs`] and
//! drives it the way the commit path and the interrupt routing layer
//! would:
//! - Display-list allocation, population and installation
//! - Deferred free against the frame counter
//! - Interrupt dispatch on both interrupt models
//! - Channel enable/disable sequencing
//! - Handle and line-buffer arenas
//! - Teardown and device removal

use hvs::mock::MockHvs;
use hvs::regs::{gen6, legacy, DLIST_END};
use hvs::*;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn ch(index: usize) -> ChannelId {
    ChannelId::new(index).unwrap()
}

/// Arena starting at word 0, no kernels, no timer: every reclaim in the
/// test is explicit
fn bare_config(generation: Generation, words: usize) -> HvsConfig {
    HvsConfig::for_generation(generation)
        .with_dlist_base(0)
        .with_dlist_size(words)
        .with_filter_kernels(false)
        .with_fallback_sweep(None)
}

fn bring_up(config: HvsConfig) -> (Arc<MockHvs>, HvsDevice) {
    init_logging();
    let mock = Arc::new(MockHvs::new(config.generation));
    let device = HvsDevice::bring_up(mock.clone(), config).expect("bring-up failed");
    (mock, device)
}

/// Allocate and populate a list of exactly `words` words
fn populated(device: &HvsDevice, channel: ChannelId, words: usize) -> DlistAllocation {
    let mut dlist = device.allocate_dlist(channel, words).unwrap();
    let mut contents = vec![0x1000_0000 | words as u32; words - 1];
    contents.push(DLIST_END);
    device.write_dlist(&mut dlist, &contents).unwrap();
    dlist
}

fn enabled_channel(device: &HvsDevice, channel: ChannelId, words: usize) -> DlistAllocation {
    let mut dlist = populated(device, channel, words);
    device
        .enable_channel(channel, Geometry::new(1920, 1080), &mut dlist)
        .unwrap();
    dlist
}

fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(1));
    }
}

/// Programmed list retired at frame 10 waits for frame 11
#[test]
fn test_deferred_free_waits_for_next_frame() {
    let (mock, device) = bring_up(bare_config(Generation::Vc4, 16000));
    let ch0 = ch(0);

    let dlist = enabled_channel(&device, ch0, 100);
    assert_eq!(dlist.start(), 0);
    assert!(dlist.is_programmed());
    assert_eq!(mock.reg(legacy::displist(0)), 0);

    mock.set_frame_count(ch0, 10);
    let free_before = device.dlist_free();
    assert_eq!(free_before, 15900);

    device.retire(ch0, dlist).unwrap();
    assert_eq!(device.stale_len(), 1);
    assert_eq!(device.mm_snapshot().stale[0].target, FrameCount::new(11));
    assert!(device.eof_armed(ch0));
    assert!(mock.eof_armed(ch0));

    assert_eq!(device.sweep_now(), 0);
    assert_eq!(device.dlist_free(), free_before);
    assert_eq!(device.stale_len(), 1);

    mock.set_frame_count(ch0, 11);
    assert_eq!(device.sweep_now(), 1);
    assert_eq!(device.dlist_free(), 16000);
    assert_eq!(device.stale_len(), 0);

    // Nothing left for the channel, stop listening
    assert!(!device.eof_armed(ch0));
    assert!(!mock.eof_armed(ch0));
}

#[test]
fn test_target_wraps_past_63() {
    let (mock, device) = bring_up(bare_config(Generation::Vc5, 1024));
    let ch2 = ch(2);

    let dlist = enabled_channel(&device, ch2, 8);
    mock.set_frame_count(ch2, 63);
    device.retire(ch2, dlist).unwrap();
    assert_eq!(device.mm_snapshot().stale[0].target, FrameCount::new(0));

    assert_eq!(device.sweep_now(), 0);
    mock.advance_frames(ch2, 1);
    assert_eq!(mock.frame_count(ch2).get(), 0);
    assert_eq!(device.sweep_now(), 1);
}

#[test]
fn test_exhaustion_after_forced_sweep() {
    let (_mock, device) = bring_up(bare_config(Generation::Vc4, 16050));
    let ch0 = ch(0);

    let a = device.allocate_dlist(ch0, 100).unwrap();
    let b = device.allocate_dlist(ch0, 15950).unwrap();
    assert_eq!(a.start(), 0);
    assert_eq!(b.start(), 100);

    let err = device.allocate_dlist(ch0, 100).unwrap_err();
    assert_eq!(
        err,
        HvsError::ResourceExhausted {
            arena: "dlist",
            requested: 100
        }
    );
    assert_eq!(device.stale_len(), 0);
}

#[test]
fn test_forced_sweep_reclaims_only_eligible_entries() {
    let (mock, device) = bring_up(bare_config(Generation::Vc4, 200));
    let ch0 = ch(0);

    let old = enabled_channel(&device, ch0, 100);
    let mut new = populated(&device, ch0, 100);
    device.install(ch0, &mut new).unwrap();
    assert_eq!(device.current_dlist(ch0), Some(100));

    mock.set_frame_count(ch0, 5);
    device.retire(ch0, old).unwrap();

    // Hardware may still be on the old list
    assert!(matches!(
        device.allocate_dlist(ch0, 100),
        Err(HvsError::ResourceExhausted { arena: "dlist", .. })
    ));
    assert_eq!(device.stale_len(), 1);

    mock.set_frame_count(ch0, 6);
    let again = device.allocate_dlist(ch0, 100).unwrap();
    assert_eq!(again.start(), 0);
    assert_eq!(device.stale_len(), 0);
}

#[test]
fn test_unprogrammed_retire_frees_immediately() {
    let (_mock, device) = bring_up(bare_config(Generation::Vc4, 1000));
    let ch1 = ch(1);

    let reserved = device.allocate_dlist(ch1, 50).unwrap();
    let written = populated(&device, ch1, 30);
    assert!(!written.is_programmed());
    assert_eq!(device.dlist_free(), 920);

    device.retire(ch1, reserved).unwrap();
    device.retire(ch1, written).unwrap();

    assert_eq!(device.stale_len(), 0);
    assert_eq!(device.dlist_free(), 1000);
    assert!(!device.eof_armed(ch1));
}

#[test]
fn test_disable_makes_entries_reclaimable() {
    let (mock, device) = bring_up(bare_config(Generation::Vc5, 1000));
    let ch1 = ch(1);

    let dlist = enabled_channel(&device, ch1, 20);
    mock.set_frame_count(ch1, 10);
    device.retire(ch1, dlist).unwrap();
    assert_eq!(device.sweep_now(), 0);

    device.disable_channel(ch1).unwrap();
    assert_eq!(device.channel_state(ch1), ChannelState::Disabled);
    assert_eq!(device.current_dlist(ch1), None);

    // Counter never moved; the worker or this sweep gets it
    device.sweep_now();
    wait_for("queue to drain", || device.stale_len() == 0);
    assert_eq!(mock.frame_count(ch1).get(), 10);
    assert_eq!(device.dlist_free(), 1000);

    // Idempotent
    device.disable_channel(ch1).unwrap();
    assert_eq!(device.channel_state(ch1), ChannelState::Disabled);
}

/// Raw status words as each chip lays them out
#[test]
fn test_frame_counter_layout_per_generation() {
    let (mock, device) = bring_up(bare_config(Generation::Vc4, 1000));
    mock.set_reg(legacy::DISPSTAT1, (10 << 18) | (20 << 12));
    mock.set_reg(legacy::DISPSTAT2, 30 << 12);
    assert_eq!(device.frame_count(ch(0)).get(), 10);
    assert_eq!(device.frame_count(ch(1)).get(), 20);
    assert_eq!(device.frame_count(ch(2)).get(), 30);

    let (mock, device) = bring_up(bare_config(Generation::Vc5, 1000));
    mock.set_reg(legacy::DISPSTAT1, (10 << 20) | (20 << 14));
    mock.set_reg(legacy::DISPSTAT2, 30 << 14);
    assert_eq!(device.frame_count(ch(0)).get(), 10);
    assert_eq!(device.frame_count(ch(1)).get(), 20);
    assert_eq!(device.frame_count(ch(2)).get(), 30);

    let (mock, device) = bring_up(bare_config(Generation::Vc6D, 1000));
    for i in 0..3 {
        mock.set_reg(gen6::status(i), (11 + i as u32) << 18);
        assert_eq!(device.frame_count(ch(i)).get() as usize, 11 + i);
    }
}

#[test]
fn test_vc5_list_waits_for_its_own_counter() {
    let (mock, device) = bring_up(bare_config(Generation::Vc5, 1000));
    let ch0 = ch(0);
    let ch1 = ch(1);

    let dlist = enabled_channel(&device, ch0, 16);
    mock.set_frame_count(ch0, 10);
    mock.set_frame_count(ch1, 0);
    assert_eq!(device.frame_count(ch0).get(), 10);

    device.retire(ch0, dlist).unwrap();
    assert_eq!(device.mm_snapshot().stale[0].target, FrameCount::new(11));

    // Neighbouring counter moves, channel 0 is still on the same frame
    mock.set_frame_count(ch1, 16);
    assert_eq!(device.frame_count(ch0).get(), 10);
    assert_eq!(device.sweep_now(), 0);
    assert_eq!(device.stale_len(), 1);

    mock.set_frame_count(ch0, 11);
    assert_eq!(device.sweep_now(), 1);
    assert_eq!(device.dlist_free(), 1000);
}

#[test]
fn test_legacy_enable_programs_background() {
    let (mock, device) = bring_up(bare_config(Generation::Vc4, 1000));
    let _dlist = enabled_channel(&device, ch(0), 8);
    let bkgnd = mock.reg(legacy::dispbkgndx(0));
    assert_ne!(bkgnd & legacy::DispBkgnd::AUTOHS.bits(), 0);
    assert_ne!(bkgnd & legacy::DispBkgnd::GAMMA.bits(), 0);

    let (mock, device) = bring_up(bare_config(Generation::Vc5, 1000));
    let stale = legacy::DispBkgnd::BCK2BCK | legacy::DispBkgnd::FILL;
    mock.set_reg(legacy::dispbkgndx(1), stale.bits());
    let _dlist = enabled_channel(&device, ch(1), 8);
    let bkgnd = mock.reg(legacy::dispbkgndx(1));
    assert_eq!(bkgnd & legacy::DispBkgnd::BCK2BCK.bits(), 0);
    assert_eq!(bkgnd & legacy::DispBkgnd::AUTOHS.bits(), 0);
    assert_ne!(bkgnd & legacy::DispBkgnd::FILL.bits(), 0);
}

#[test]
fn test_gen6_disable_keeps_ctrl0_geometry() {
    let (mock, device) = bring_up(bare_config(Generation::Vc6D, 1000));
    let ch0 = ch(0);
    let _dlist = enabled_channel(&device, ch0, 8);

    mock.clear_write_log();
    device.disable_channel(ch0).unwrap();

    let writes = mock.writes_to(gen6::ctrl0(0));
    assert_eq!(writes.len(), 2);
    assert_ne!(writes[0] & gen6::CTRL0_ENB, 0);
    assert_ne!(writes[0] & gen6::CTRL0_RESET, 0);
    assert_eq!(writes[1] & gen6::CTRL0_ENB, 0);
    assert_ne!(writes[1] & gen6::CTRL0_RESET, 0);
    assert_eq!(gen6::CTRL0_FWIDTH.get(writes[1]), 1919);
    assert_eq!(gen6::CTRL0_LINES.get(writes[1]), 1079);
    assert_eq!(device.channel_diagnostic(ch0), None);
}

#[test]
fn test_handle_round_trip() {
    let (_mock, device) = bring_up(bare_config(Generation::Vc6D, 1000));
    let free_before = device.upm_free();
    assert_eq!(free_before, 1024 * 256);

    let handle = device.acquire_handle(4096).unwrap();
    assert_eq!(device.upm_free(), free_before - 4096);

    // Same size shares the slot
    let shared = device.acquire_handle(4096).unwrap();
    assert_eq!(shared, handle);
    assert_eq!(device.handle_refcount(handle), Some(2));

    let other = device.acquire_handle(128).unwrap();
    assert_ne!(other, handle);

    device.release_handle(shared).unwrap();
    device.release_handle(handle).unwrap();
    device.release_handle(other).unwrap();
    assert_eq!(device.upm_free(), free_before);

    assert!(matches!(
        device.release_handle(handle),
        Err(HvsError::Alloc(AllocError::InvalidHandle { .. }))
    ));
}

#[test]
fn test_handles_exhaust() {
    let config = bare_config(Generation::Vc6D, 1000).with_upm_handles(2);
    let (_mock, device) = bring_up(config);

    device.acquire_handle(16).unwrap();
    device.acquire_handle(32).unwrap();
    assert!(matches!(
        device.acquire_handle(64),
        Err(HvsError::ResourceExhausted { arena: "upm", .. })
    ));
}

#[test]
fn test_lbm_is_freed_synchronously() {
    let (_mock, device) = bring_up(bare_config(Generation::Vc5, 1000));
    assert_eq!(device.lbm_free(), 60 * 1024);

    let a = device.allocate_lbm(2048).unwrap();
    let b = device.allocate_lbm(4096).unwrap();
    assert_eq!(device.lbm_free(), 60 * 1024 - 6144);

    device.free_lbm(a).unwrap();
    device.free_lbm(b).unwrap();
    assert_eq!(device.lbm_free(), 60 * 1024);
}

#[test]
fn test_eof_interrupt_drives_sweep() {
    let (mock, device) = bring_up(bare_config(Generation::Vc5, 1000));
    let ch0 = ch(0);

    let dlist = enabled_channel(&device, ch0, 10);
    mock.set_frame_count(ch0, 20);
    device.retire(ch0, dlist).unwrap();

    mock.advance_frames(ch0, 1);
    mock.raise_eof(ch0);
    assert_eq!(device.handle_irq(IrqSource::Shared), IrqReturn::Handled);
    assert_eq!(mock.reg(legacy::DISPSTAT) & legacy::dispstat_irqmask(0), 0);

    wait_for("sweep worker", || device.stale_len() == 0);
    wait_for("EOF disarm", || !mock.eof_armed(ch0));
    assert_eq!(device.dlist_free(), 1000);
}

#[test]
fn test_spurious_interrupt() {
    let (_mock, device) = bring_up(bare_config(Generation::Vc4, 1000));
    assert_eq!(device.handle_irq(IrqSource::Shared), IrqReturn::None);

    // Wrong interrupt model for this part
    assert_eq!(
        device.handle_irq(IrqSource::EndOfFrame(ch(0))),
        IrqReturn::None
    );
}

#[test]
fn test_coalesced_interrupt_handles_every_cause() {
    let (mock, device) = bring_up(bare_config(Generation::Vc4, 1000));

    let a = enabled_channel(&device, ch(0), 10);
    let b = enabled_channel(&device, ch(2), 10);
    device.retire(ch(0), a).unwrap();
    device.retire(ch(2), b).unwrap();
    device.unmask_underrun(ch(1));

    mock.advance_frames(ch(0), 1);
    mock.advance_frames(ch(2), 1);
    mock.raise_eof(ch(0));
    mock.raise_eof(ch(2));
    mock.raise_underrun(ch(1));

    assert_eq!(device.handle_irq(IrqSource::Shared), IrqReturn::Handled);
    assert_eq!(mock.reg(legacy::DISPSTAT), 0);
    assert_eq!(device.underrun_count(), 1);
    assert_eq!(device.channel_underruns(ch(1)), 1);

    wait_for("both channels reclaimed", || device.stale_len() == 0);
}

#[test]
fn test_underrun_is_masked_after_report() {
    let (mock, device) = bring_up(bare_config(Generation::Vc5, 1000));
    let ch2 = ch(2);

    device.unmask_underrun(ch2);
    assert!(mock.underrun_enabled(ch2));

    mock.raise_underrun(ch2);
    assert_eq!(device.handle_irq(IrqSource::Shared), IrqReturn::Handled);
    assert_eq!(device.channel_underruns(ch2), 1);
    assert!(!mock.underrun_enabled(ch2));

    // Masked: latched but not reported again
    mock.raise_underrun(ch2);
    assert_eq!(device.handle_irq(IrqSource::Shared), IrqReturn::None);
    assert_eq!(device.underrun_count(), 1);

    device.unmask_underrun(ch2);
    mock.raise_underrun(ch2);
    device.handle_irq(IrqSource::Shared);
    assert_eq!(device.underrun_count(), 2);
}

#[test]
fn test_gen6_eof_line_applies_background_fill() {
    let (mock, device) = bring_up(bare_config(Generation::Vc6D, 1000));
    let ch1 = ch(1);

    let dlist = enabled_channel(&device, ch1, 10);
    assert_eq!(
        gen6::LPTRS_HEADE.get(mock.reg(gen6::lptrs(1))),
        dlist.start() as u32
    );

    device.set_background_fill(ch1, true).unwrap();
    assert_eq!(mock.reg(gen6::ctrl1(1)) & gen6::CTRL1_BGENB, 0);

    // Line not armed: not ours
    assert_eq!(device.handle_irq(IrqSource::EndOfFrame(ch1)), IrqReturn::None);
    assert_eq!(device.handle_irq(IrqSource::Shared), IrqReturn::None);

    mock.set_frame_count(ch1, 3);
    device.retire(ch1, dlist).unwrap();
    assert!(mock.eof_armed(ch1));

    mock.advance_frames(ch1, 1);
    assert_eq!(
        device.handle_irq(IrqSource::EndOfFrame(ch1)),
        IrqReturn::Handled
    );
    assert_ne!(mock.reg(gen6::ctrl1(1)) & gen6::CTRL1_BGENB, 0);

    wait_for("sweep worker", || device.stale_len() == 0);
    wait_for("EOF line off", || !mock.eof_armed(ch1));
}

#[test]
fn test_teardown_drains_queue() {
    let (mock, device) = bring_up(bare_config(Generation::Vc5, 1000));
    let ch0 = ch(0);

    let first = enabled_channel(&device, ch0, 10);
    let mut second = populated(&device, ch0, 10);
    device.install(ch0, &mut second).unwrap();
    mock.set_frame_count(ch0, 30);
    device.retire(ch0, first).unwrap();
    device.retire(ch0, second).unwrap();
    assert_eq!(device.stale_len(), 2);

    device.teardown();
    assert_eq!(device.stale_len(), 0);
    assert!(!mock.eof_armed(ch0));
    assert!(device.mm_snapshot().dlist.live.is_empty());

    assert_eq!(
        device.allocate_dlist(ch0, 10).unwrap_err(),
        HvsError::ShutDown
    );
    assert_eq!(device.acquire_handle(1).unwrap_err(), HvsError::ShutDown);
    assert_eq!(device.disable_channel(ch0).unwrap_err(), HvsError::ShutDown);

    // Again, and once more on drop
    device.teardown();
}

#[test]
fn test_device_removed() {
    let (mock, device) = bring_up(bare_config(Generation::Vc4, 1000));
    let ch0 = ch(0);

    let dlist = enabled_channel(&device, ch0, 10);
    mock.set_frame_count(ch0, 10);
    device.retire(ch0, dlist).unwrap();
    assert_eq!(device.sweep_now(), 0);

    mock.remove();

    // Nothing can be fetching any more
    assert_eq!(device.sweep_now(), 1);
    assert_eq!(device.frame_count(ch0), FrameCount::new(0));

    let mut next = populated(&device, ch0, 10);
    device.install(ch0, &mut next).unwrap();
    assert!(!next.is_programmed());
    device.retire(ch0, next).unwrap();
    assert_eq!(device.stale_len(), 0);
    assert_eq!(device.dlist_free(), 1000);

    let mut another = populated(&device, ch(1), 10);
    assert_eq!(
        device
            .enable_channel(ch(1), Geometry::new(640, 480), &mut another)
            .unwrap_err(),
        HvsError::DeviceGone
    );
    assert_eq!(device.channel_for_output(0), None);
    assert_eq!(device.handle_irq(IrqSource::Shared), IrqReturn::None);

    drop(device);
    assert_eq!(mock.outstanding_accesses(), 0);
}

#[test]
fn test_bring_up_on_removed_device() {
    init_logging();
    let mock = Arc::new(MockHvs::new(Generation::Vc5));
    mock.remove();

    let result = HvsDevice::bring_up(mock, HvsConfig::for_generation(Generation::Vc5));
    assert!(matches!(result, Err(HvsError::DeviceGone)));
}

#[test]
fn test_default_bring_up_reserves_bootloader_list() {
    let (mock, device) = bring_up(HvsConfig::for_generation(Generation::Vc4));

    let mitchell = device.filter_kernel(FilterKernel::MitchellNetravali).unwrap();
    let nearest = device.filter_kernel(FilterKernel::NearestNeighbour).unwrap();
    assert_eq!(mitchell, 32);
    assert_eq!(nearest, 32 + 11);
    assert_eq!(
        mock.dlist_words(mitchell, 11),
        FilterKernel::MitchellNetravali.words().to_vec()
    );
    assert_eq!(device.dlist_free(), 4096 - 32 - 22);

    let first = device.allocate_dlist(ch(0), 4).unwrap();
    assert_eq!(first.start(), 54);

    assert_ne!(mock.reg(legacy::DISPCTRL) & legacy::DispCtrl::ENABLE.bits(), 0);
}

#[test]
fn test_c_step_reporting_d0_is_promoted() {
    init_logging();
    let mock = Arc::new(MockHvs::new(Generation::Vc6D));
    let device =
        HvsDevice::bring_up(mock.clone(), HvsConfig::for_generation(Generation::Vc6C)).unwrap();

    assert_eq!(device.generation(), Generation::Vc6D);
    assert_eq!(device.dlist_free(), 8192 - 32 - 22);
    assert_ne!(mock.reg(gen6::CONTROL) & gen6::CONTROL_HVS_EN, 0);
}

#[test]
fn test_compatible_strings() {
    assert_eq!(
        Generation::from_compatible("brcm,bcm2711-hvs").unwrap(),
        Generation::Vc5
    );
    assert!(matches!(
        Generation::from_compatible("brcm,bcm2709-foo"),
        Err(HvsError::UnknownHardwareGeneration { .. })
    ));
}

#[test]
fn test_vc4_enable_reloads_gamma() {
    let (mock, device) = bring_up(bare_config(Generation::Vc4, 1000));
    let ch1 = ch(1);

    let mut lut = GammaLut::linear();
    lut.red[0] = 7;
    device.set_gamma(ch1, Some(lut)).unwrap();
    assert!(mock.writes_to(legacy::GAMDATA).is_empty());

    let _dlist = enabled_channel(&device, ch1, 10);
    let data = mock.writes_to(legacy::GAMDATA);
    assert_eq!(data.len(), 3 * 256);
    assert_eq!(data[0], 7);
    assert_eq!(
        mock.writes_to(legacy::GAMADDR),
        vec![legacy::GAMADDR_AUTOINC | 768]
    );
    assert_ne!(
        mock.reg(legacy::dispbkgndx(1)) & legacy::DispBkgnd::GAMMA.bits(),
        0
    );

    // Running channel: upload right away
    mock.clear_write_log();
    device.set_gamma(ch1, None).unwrap();
    assert_eq!(mock.writes_to(legacy::GAMDATA)[0], 0);
}

#[test]
fn test_vc5_has_no_scaler_gamma() {
    let (mock, device) = bring_up(bare_config(Generation::Vc5, 1000));
    device.set_gamma(ch(0), Some(GammaLut::linear())).unwrap();
    let _dlist = enabled_channel(&device, ch(0), 10);
    assert!(mock.writes_to(legacy::GAMDATA).is_empty());
}

#[test]
fn test_output_mapping() {
    let (_mock, vc5) = bring_up(bare_config(Generation::Vc5, 1000));
    assert_eq!(vc5.channel_for_output(1), Some(ch(1)));
    assert_eq!(vc5.channel_for_output(2), Some(ch(2)));
    assert_eq!(vc5.channel_for_output(3), None);
    assert_eq!(vc5.channel_for_output(9), None);

    let (_mock, vc6) = bring_up(bare_config(Generation::Vc6D, 1000));
    assert_eq!(vc6.channel_for_output(3), Some(ch(1)));
    assert_eq!(vc6.channel_for_output(2), Some(ch(2)));
}

#[cfg(debug_assertions)]
#[test]
fn test_disable_with_busy_fifo_is_diagnosed() {
    let (mock, device) = bring_up(bare_config(Generation::Vc4, 1000));
    let ch0 = ch(0);

    let _dlist = enabled_channel(&device, ch0, 10);
    mock.stall_fifo(ch0, true);
    device.disable_channel(ch0).unwrap();

    assert_eq!(device.channel_state(ch0), ChannelState::Disabled);
    assert!(matches!(
        device.channel_diagnostic(ch0),
        Some(HvsError::InconsistentHardwareState { channel: 0, .. })
    ));
    assert_eq!(
        mock.reg(legacy::dispctrlx(0)) & legacy::DispCtrlX::ENABLE.bits(),
        0
    );

    mock.stall_fifo(ch0, false);
    let mut dlist = populated(&device, ch0, 10);
    let pal = Geometry::new(720, 576).interlaced(true);
    device.enable_channel(ch0, pal, &mut dlist).unwrap();
    assert_eq!(device.channel_geometry(ch0), Some(pal));
    assert_ne!(
        mock.reg(legacy::dispbkgndx(0)) & legacy::DispBkgnd::INTERLACE.bits(),
        0
    );
    device.disable_channel(ch0).unwrap();
    assert_eq!(device.channel_diagnostic(ch0), None);
}

#[test]
fn test_enable_requires_disabled_channel() {
    let (_mock, device) = bring_up(bare_config(Generation::Vc5, 1000));
    let ch0 = ch(0);

    let _first = enabled_channel(&device, ch0, 10);
    let mut second = populated(&device, ch0, 10);
    assert!(matches!(
        device.enable_channel(ch0, Geometry::new(1920, 1080), &mut second),
        Err(HvsError::InvalidTransition { channel: 0, .. })
    ));

    let mut third = populated(&device, ch(1), 10);
    assert!(matches!(
        device.enable_channel(ch(1), Geometry::new(0, 1080), &mut third),
        Err(HvsError::InvalidGeometry { .. })
    ));
}

#[test]
fn test_commit_installs_only_on_running_channel() {
    let (mock, device) = bring_up(bare_config(Generation::Vc5, 1000));
    let ch0 = ch(0);

    let mut planes = DlistBuilder::new();
    planes.push_plane(&[1, 2, 3]).push_plane(&[4, 5]);
    let idle = device.commit(ch0, planes.clone()).unwrap();
    assert!(idle.is_populated());
    assert!(!idle.is_programmed());
    assert_eq!(mock.dlist_words(idle.start(), 6), vec![1, 2, 3, 4, 5, DLIST_END]);

    let mut first = idle;
    device
        .enable_channel(ch0, Geometry::new(1280, 720), &mut first)
        .unwrap();

    let next = device.commit(ch0, planes).unwrap();
    assert!(next.is_programmed());
    assert_eq!(mock.reg(legacy::displist(0)), next.start() as u32);
    device.retire(ch0, first).unwrap();
    assert_eq!(device.stale_len_for(ch0), 1);
}

#[test]
fn test_caller_mistakes_are_rejected() {
    let (_mock, device) = bring_up(bare_config(Generation::Vc4, 1000));

    let mut dlist = device.allocate_dlist(ch(0), 4).unwrap();
    assert_eq!(
        device.write_dlist(&mut dlist, &[1, 2, DLIST_END]).unwrap_err(),
        HvsError::DlistSizeMismatch {
            expected: 4,
            actual: 3
        }
    );
    assert!(matches!(
        device.install(ch(0), &mut dlist),
        Err(HvsError::DlistNotPopulated { .. })
    ));

    device.write_dlist(&mut dlist, &[1, 2, 3, DLIST_END]).unwrap();
    assert_eq!(
        device.install(ch(1), &mut dlist).unwrap_err(),
        HvsError::ChannelMismatch {
            channel: 1,
            owner: 0
        }
    );

    device.install(ch(0), &mut dlist).unwrap();
    assert!(matches!(
        device.write_dlist(&mut dlist, &[0; 4]),
        Err(HvsError::DlistProgrammed { .. })
    ));

    // Still retired, against its owner
    assert!(matches!(
        device.retire(ch(2), dlist),
        Err(HvsError::ChannelMismatch { channel: 2, owner: 0 })
    ));
    assert_eq!(device.stale_len_for(ch(0)), 1);
    assert_eq!(device.stale_len_for(ch(2)), 0);
}

#[test]
fn test_snapshot_listing() {
    let (mock, device) = bring_up(bare_config(Generation::Vc6D, 1000));
    let ch0 = ch(0);

    let dlist = enabled_channel(&device, ch0, 16);
    let _keep = device.allocate_dlist(ch0, 8).unwrap();
    let handle = device.acquire_handle(64).unwrap();
    mock.set_frame_count(ch0, 10);
    device.retire(ch0, dlist).unwrap();

    let snapshot = device.mm_snapshot();
    assert_eq!(snapshot.dlist.live, vec![(0, 16), (16, 8)]);
    assert_eq!(snapshot.handles.len(), 1);
    assert_eq!(snapshot.handles[0].handle, handle);

    let text = snapshot.to_string();
    assert!(text.contains("Allocated nodes:"));
    assert!(text.contains("node [00000010 + 00000008]"));
    assert!(text.contains("Stale nodes:"));
    assert!(text.contains("channel 0 frcnt 11"));
    assert!(text.contains("UPM Handles:"));
    assert!(text.contains("handle 1: refcount 1, size 64"));
}

#[test]
fn test_fallback_sweep_without_interrupts() {
    let config =
        bare_config(Generation::Vc5, 1000).with_fallback_sweep(Some(Duration::from_millis(5)));
    let (mock, device) = bring_up(config);
    let ch1 = ch(1);

    let dlist = enabled_channel(&device, ch1, 10);
    mock.set_frame_count(ch1, 40);
    device.retire(ch1, dlist).unwrap();

    // No EOF is ever delivered
    mock.advance_frames(ch1, 1);
    wait_for("fallback sweep", || device.stale_len() == 0);
    assert_eq!(device.dlist_free(), 1000);
}

/// Three commit paths and the interrupt handler hammering one device
#[test]
fn test_concurrent_commits_and_interrupts() {
    let config =
        bare_config(Generation::Vc4, 4096).with_fallback_sweep(Some(Duration::from_millis(1)));
    let (mock, device) = bring_up(config);
    let device = Arc::new(device);

    let mut first = Vec::new();
    for channel in ChannelId::all() {
        first.push(enabled_channel(&device, channel, 5));
    }

    let workers: Vec<_> = ChannelId::all()
        .zip(first)
        .map(|(channel, mut current)| {
            let device = Arc::clone(&device);
            let mock = Arc::clone(&mock);
            thread::spawn(move || {
                for frame in 0..200 {
                    let mut planes = DlistBuilder::new();
                    for _ in 0..(frame % 4 + 1) {
                        planes.push_plane(&[0xdead_0000 | frame as u32; 7]);
                    }
                    let next = device.commit(channel, planes).unwrap();
                    assert!(next.is_programmed());
                    device
                        .retire(channel, std::mem::replace(&mut current, next))
                        .unwrap();

                    mock.advance_frames(channel, 1);
                    mock.raise_eof(channel);
                    device.handle_irq(IrqSource::Shared);
                }
                current
            })
        })
        .collect();

    let last: Vec<_> = workers.into_iter().map(|w| w.join().unwrap()).collect();

    for (channel, dlist) in ChannelId::all().zip(last) {
        device.disable_channel(channel).unwrap();
        device.retire(channel, dlist).unwrap();
    }
    device.sweep_now();
    wait_for("everything reclaimed", || device.stale_len() == 0);
    assert_eq!(device.dlist_free(), 4096);
    assert!(device.mm_snapshot().dlist.live.is_empty());
}
