//! Interrupt dispatcher
//!
//! Runs in interrupt context: read status, classify, schedule the sweep,
//! acknowledge. Never takes more than the short arena lock and never
//! reclaims anything itself.
//!
//! VC4/VC5 report every cause through DISPSTAT. A single invocation may
//! carry several causes for several channels (interrupts coalesce), or
//! none at all (spurious), so the handler walks every channel and then
//! acknowledges all per-channel bits at once.
//!
//! Gen 6 has one end-of-frame line per channel and no underrun cause.

use crate::channel::ChannelId;
use crate::device::Shared;
use crate::regs::legacy;

/// Which interrupt fired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqSource {
    /// The shared status interrupt (VC4/VC5)
    Shared,
    /// A channel's dedicated end-of-frame line (gen 6)
    EndOfFrame(ChannelId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqReturn {
    /// Nothing for us
    None,
    Handled,
}

pub(crate) fn dispatch(shared: &Shared, source: IrqSource) -> IrqReturn {
    match source {
        IrqSource::Shared if shared.generation().has_shared_irq() => handle_status(shared),
        IrqSource::EndOfFrame(ch) if !shared.generation().has_shared_irq() => handle_eof_line(shared, ch),
        _ => {
            log::warn!(
                "{:?} interrupt on a {} scaler ignored",
                source,
                shared.generation().name()
            );
            IrqReturn::None
        }
    }
}

fn handle_status(shared: &Shared) -> IrqReturn {
    let generation = shared.generation();
    let Some(regs) = shared.access() else {
        return IrqReturn::None;
    };

    let status = regs.read(legacy::DISPSTAT);
    let control = regs.read(legacy::DISPCTRL);
    let mut ret = IrqReturn::None;

    for ch in ChannelId::all() {
        // Masking is not always honoured, check the enable as well
        if status & legacy::dispstat_euflow(ch.index()) != 0
            && control & generation.underrun_irq_bit(ch) != 0
        {
            generation.set_underrun_irq(&regs, ch, false);
            shared.report_underrun(ch);
            ret = IrqReturn::Handled;
        }

        if status & legacy::dispstat_eof(ch.index()) != 0 {
            shared.schedule_sweep(ch);
            ret = IrqReturn::Handled;
        }
    }

    let ack = ChannelId::all().fold(0, |acc, ch| acc | legacy::dispstat_irqmask(ch.index()));
    regs.write(legacy::DISPSTAT, ack);

    ret
}

fn handle_eof_line(shared: &Shared, ch: ChannelId) -> IrqReturn {
    if !shared.eof_armed(ch) {
        return IrqReturn::None;
    }

    let bg_fill = shared.channel(ch).lock().bg_fill;
    if let Some(regs) = shared.access() {
        shared.generation().set_bg_fill(&regs, ch, bg_fill);
    }

    shared.schedule_sweep(ch);
    IrqReturn::Handled
}
