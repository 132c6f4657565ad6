//! # host
//! The boundary to the binary-instrumentation engine that runs the monitored
//! program. The engine translates blocks, resolves symbols, wraps functions
//! and owns the live machine context; the runtime only asks it for those
//! services through [`Host`] and answers with [`Directive`]s.
use core::fmt::Debug;

use serde::{Deserialize, Serialize};

use crate::{GuestAddr, event::EventKind};

/// The count of general purpose registers in a [`MachineContext`].
pub const REGISTER_COUNT: usize = 16;

/// The general purpose registers, in the order they are saved in a
/// [`MachineContext`], plus the instruction pointer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Register {
    Rax,
    Rbx,
    Rcx,
    Rdx,
    Rbp,
    Rsp,
    Rsi,
    Rdi,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
    Rip,
}

/// The register names, in [`Register`] order
pub const REGISTER_NAMES: [&str; REGISTER_COUNT + 1] = [
    "rax", "rbx", "rcx", "rdx", "rbp", "rsp", "rsi", "rdi", "r8", "r9", "r10", "r11", "r12", "r13",
    "r14", "r15", "rip",
];

impl Register {
    #[must_use]
    pub fn name(self) -> &'static str {
        REGISTER_NAMES[self as usize]
    }
}

/// A snapshot of the registers of the thread that triggered a callback.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MachineContext {
    pub pc: GuestAddr,
    pub regs: [GuestAddr; REGISTER_COUNT],
}

impl MachineContext {
    #[must_use]
    pub fn get(&self, reg: Register) -> GuestAddr {
        match reg {
            Register::Rip => self.pc,
            _ => self.regs[reg as usize],
        }
    }

    pub fn set(&mut self, reg: Register, value: GuestAddr) {
        match reg {
            Register::Rip => self.pc = value,
            _ => self.regs[reg as usize] = value,
        }
    }

    #[must_use]
    pub fn sp(&self) -> GuestAddr {
        self.get(Register::Rsp)
    }

    #[must_use]
    pub fn bp(&self) -> GuestAddr {
        self.get(Register::Rbp)
    }
}

/// A `base + index * scale + disp` memory reference.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemOperand {
    pub base: Option<Register>,
    pub index: Option<Register>,
    pub scale: u8,
    pub disp: i64,
}

impl MemOperand {
    /// The address this reference resolves to for the instruction ending at
    /// `next_pc`. A `rip` base is relative to the end of the instruction.
    #[must_use]
    pub fn effective_address(&self, mc: &MachineContext, next_pc: GuestAddr) -> GuestAddr {
        let value = |reg: Register| match reg {
            Register::Rip => next_pc,
            _ => mc.get(reg),
        };
        let base = self.base.map_or(0, value);
        let index = self
            .index
            .map_or(0, |reg| value(reg).wrapping_mul(GuestAddr::from(self.scale)));
        base.wrapping_add(index).wrapping_add_signed(self.disp as isize)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operand {
    Reg(Register),
    Mem(MemOperand),
    Imm(i64),
}

impl Operand {
    #[must_use]
    pub fn is_memory(&self) -> bool {
        matches!(self, Operand::Mem(_))
    }
}

/// How an instruction relates to memory beyond its operand list.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum InstructionClass {
    #[default]
    Plain,
    /// Implicitly iterating string operations (`movs`, `stos`, `cmps`, ...)
    /// whose addresses do not follow the operand list.
    StringOp,
    /// Instructions with a memory form that never touch memory (`lea`,
    /// `nop dword [rax + rax]`).
    LoadAddress,
}

/// A decoded instruction, as the host's decoder reports it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Instruction {
    pub address: GuestAddr,
    pub length: usize,
    pub class: InstructionClass,
    pub srcs: Vec<Operand>,
    pub dsts: Vec<Operand>,
}

impl Instruction {
    #[must_use]
    pub fn next_pc(&self) -> GuestAddr {
        self.address + self.length
    }
}

/// A module the host has just mapped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModuleInfo {
    pub name: String,
    pub path: String,
    pub base: GuestAddr,
}

/// What the host does with the current thread once a callback returns.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Directive {
    /// Resume the instruction the callback was inserted before.
    #[default]
    Continue,
    /// Optionally write a register, then resume at `pc`.
    Redirect {
        pc: GuestAddr,
        write: Option<(Register, GuestAddr)>,
    },
}

/// The argument and return value accessors of one wrapped call.
pub trait WrapContext {
    fn arg(&self, index: usize) -> GuestAddr;
    fn set_arg(&mut self, index: usize, value: GuestAddr);
    /// Only meaningful once the wrapped function has returned.
    fn retval(&self) -> GuestAddr;
    fn set_retval(&mut self, value: GuestAddr);
}

/// The services of the instrumentation engine.
pub trait Host: Debug {
    type Error: Debug;

    /// Asks for the given events to be delivered to the runtime.
    fn subscribe(&mut self, events: &[EventKind]) -> Result<(), Self::Error>;

    /// Resolves an exported symbol of `module`.
    fn resolve_export(&self, module: &ModuleInfo, name: &str) -> Option<GuestAddr>;

    /// Resolves any symbol of `module`, including internal ones from its
    /// debug information.
    fn lookup_symbol(&self, module: &ModuleInfo, name: &str) -> Option<GuestAddr>;

    /// Wraps the function at `target`. Every call of it is then delivered as
    /// a [`crate::Event::FunctionEntered`] and [`crate::Event::FunctionExited`]
    /// pair.
    fn wrap(&mut self, target: GuestAddr) -> Result<(), Self::Error>;

    fn machine_context(&self) -> MachineContext;

    fn decode(&self, pc: GuestAddr) -> Option<Instruction>;

    /// Reads one word without faulting, `None` if `addr` is not readable.
    fn safe_read(&self, addr: GuestAddr) -> Option<GuestAddr>;
}
