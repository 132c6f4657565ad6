//! # monitor
//! The monitor inserts a check before every memory operand of every freshly
//! translated block. When a check runs, it re-decodes its instruction,
//! computes the operand's effective address from the live registers and
//! reads the aligned word there. A sentinel word means the access hits a
//! redzone or freed memory.
//!
//! Only one word at the aligned address is read, whatever the width of
//! the access.
use log::{debug, trace, warn};

use crate::{
    GuestAddr, align_down,
    config::MonitorMode,
    context::EngineContext,
    errors::{AccessKind, Violation},
    event::BasicBlock,
    host::{Directive, Host, Instruction, InstructionClass, Operand},
};

/// A check inserted before the instruction at `pc`, for the `operand`-th
/// source (reads) or destination (writes) operand.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CheckCall {
    pub pc: GuestAddr,
    pub access: AccessKind,
    pub operand: usize,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AccessMonitor;

impl AccessMonitor {
    /// Collects the checks for `block` into `block.checks`. Returns how many
    /// were added.
    pub fn instrument_block(block: &mut BasicBlock) -> usize {
        let before = block.checks.len();
        for instr in &block.instructions {
            if instr.class != InstructionClass::Plain {
                trace!("{:#x}: skipping {:?}", instr.address, instr.class);
                continue;
            }
            block.checks.extend(Self::checks_for(instr, AccessKind::Read));
            block.checks.extend(Self::checks_for(instr, AccessKind::Write));
        }
        block.checks.len() - before
    }

    fn checks_for(instr: &Instruction, access: AccessKind) -> impl Iterator<Item = CheckCall> + '_ {
        let operands = match access {
            AccessKind::Read => &instr.srcs,
            AccessKind::Write => &instr.dsts,
        };
        operands
            .iter()
            .enumerate()
            .filter(|(_, operand)| operand.is_memory())
            .map(move |(operand, _)| CheckCall {
                pc: instr.address,
                access,
                operand,
            })
    }

    /// Runs an inserted check against the live state of the host.
    pub fn check<H: Host>(cx: &mut EngineContext, host: &H, check: CheckCall) -> Directive {
        let CheckCall { pc, access, operand } = check;
        trace!("{access} check at {pc:#x}, operand: {operand}");

        let mc = host.machine_context();
        let Some(instr) = host.decode(pc) else {
            warn!("cannot decode instruction at {pc:#x}");
            return Directive::Continue;
        };
        let operands = match access {
            AccessKind::Read => &instr.srcs,
            AccessKind::Write => &instr.dsts,
        };
        let Some(Operand::Mem(mem)) = operands.get(operand) else {
            warn!("{pc:#x}: operand {operand} is not a memory reference");
            return Directive::Continue;
        };

        let addr = align_down(mem.effective_address(&mc, instr.next_pc()));
        let Some(word) = host.safe_read(addr) else {
            cx.counters.count(access);
            cx.reports
                .report(Violation::InaccessibleAccess { access, pc, addr });
            return Directive::Continue;
        };
        if !cx.layout.is_sentinel(word) {
            return Directive::Continue;
        }

        cx.counters.count(access);
        let stack = cx.is_stack_address(&mc, addr);
        cx.reports.report(Violation::SentinelViolation {
            access,
            pc,
            addr,
            stack,
        });
        if stack || cx.mode == MonitorMode::Observe {
            return Directive::Continue;
        }

        match access {
            AccessKind::Write => {
                debug!("skipping write at {pc:#x}");
                Directive::Redirect {
                    pc: instr.next_pc(),
                    write: None,
                }
            }
            AccessKind::Read => Self::substitute_read(cx, &instr),
        }
    }

    /// Skips a poisoned load, handing its destination register a value that
    /// grows with every execution of the same instruction.
    fn substitute_read(cx: &mut EngineContext, instr: &Instruction) -> Directive {
        let Some(Operand::Reg(reg)) = instr.dsts.first() else {
            debug!("{:#x}: no register destination, not substituting", instr.address);
            return Directive::Continue;
        };
        let value = cx.next_substitute(instr.address);
        debug!("replacing read at {:#x} with {value:#x} in {}", instr.address, reg.name());
        Directive::Redirect {
            pc: instr.next_pc(),
            write: Some((*reg, value)),
        }
    }
}
