#![allow(dead_code)]
//! A fake instrumentation host for driving the runtime in tests. It owns a
//! word aligned arena handed out by a first-fit bump allocator standing in
//! for the program's allocator, a scripted decoder and a settable machine
//! context.
use std::{collections::HashMap, ptr::copy_nonoverlapping};

use libafl_redzone::{
    AccessKind, Event, EventHandler, EventKind, GuestAddr, RedzoneConfig, RedzoneRuntime, WORD_SIZE,
    config::{POST_REDZONE_SIZE, PRE_REDZONE_SIZE},
    host::{
        Directive, Host, Instruction, MachineContext, MemOperand, ModuleInfo, Operand, Register,
        WrapContext,
    },
    interceptor::CallStash,
    monitor::CheckCall,
};

pub const ARENA_SIZE: usize = 0x10000;

pub const MALLOC: GuestAddr = 0x1000;
pub const CALLOC: GuestAddr = 0x1010;
pub const REALLOC: GuestAddr = 0x1020;
pub const FREE: GuestAddr = 0x1030;
pub const TMALLOC: GuestAddr = 0x2000;
pub const TFREE: GuestAddr = 0x2010;

/// Far away from the arena so nothing in it looks like stack.
const STACK_TOP: GuestAddr = 0x100;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FakeFunction {
    Malloc,
    Calloc,
    Realloc,
    Free,
    /// Allocates through `malloc`
    TMalloc,
    /// Frees through `free`
    TFree,
}

#[derive(Debug, PartialEq, Eq)]
pub enum FakeHostError {
    WrapRejected(GuestAddr),
}

#[derive(Debug)]
pub struct FakeHost {
    _arena: Box<[GuestAddr]>,
    start: GuestAddr,
    top: usize,
    blocks: HashMap<GuestAddr, usize>,
    free_list: Vec<(GuestAddr, usize)>,
    /// Every argument the fake `free` received
    pub freed: Vec<GuestAddr>,
    pub exports: HashMap<(String, String), GuestAddr>,
    pub symbols: HashMap<(String, String), GuestAddr>,
    pub functions: HashMap<GuestAddr, FakeFunction>,
    pub wrapped: Vec<GuestAddr>,
    pub subscribed: Vec<EventKind>,
    pub code: HashMap<GuestAddr, Instruction>,
    pub mc: MachineContext,
    pub fail_allocations: bool,
    pub reject_wraps: bool,
}

pub fn libc() -> ModuleInfo {
    ModuleInfo {
        name: "libc.so.6".to_string(),
        path: "/lib/x86_64-linux-gnu/libc.so.6".to_string(),
        base: 0x1000,
    }
}

pub fn app() -> ModuleInfo {
    ModuleInfo {
        name: "app".to_string(),
        path: "/usr/bin/app".to_string(),
        base: 0x2000,
    }
}

impl FakeHost {
    pub fn new() -> Self {
        let mut arena = vec![0; ARENA_SIZE / WORD_SIZE].into_boxed_slice();
        let start = arena.as_mut_ptr() as GuestAddr;

        let mut exports = HashMap::new();
        for (name, addr) in [
            ("malloc", MALLOC),
            ("calloc", CALLOC),
            ("realloc", REALLOC),
            ("free", FREE),
        ] {
            exports.insert((libc().name, name.to_string()), addr);
        }
        let mut symbols = HashMap::new();
        symbols.insert((app().name, "tmalloc".to_string()), TMALLOC);
        symbols.insert((app().name, "tfree".to_string()), TFREE);

        let functions = HashMap::from([
            (MALLOC, FakeFunction::Malloc),
            (CALLOC, FakeFunction::Calloc),
            (REALLOC, FakeFunction::Realloc),
            (FREE, FakeFunction::Free),
            (TMALLOC, FakeFunction::TMalloc),
            (TFREE, FakeFunction::TFree),
        ]);

        let mut mc = MachineContext::default();
        mc.set(Register::Rsp, STACK_TOP);
        mc.set(Register::Rbp, STACK_TOP);

        Self {
            _arena: arena,
            start,
            top: 0,
            blocks: HashMap::new(),
            free_list: Vec::new(),
            freed: Vec::new(),
            exports,
            symbols,
            functions,
            wrapped: Vec::new(),
            subscribed: Vec::new(),
            code: HashMap::new(),
            mc,
            fail_allocations: false,
            reject_wraps: false,
        }
    }

    pub fn contains(&self, addr: GuestAddr) -> bool {
        addr >= self.start && addr + WORD_SIZE <= self.start + ARENA_SIZE
    }

    pub fn read(&self, addr: GuestAddr) -> GuestAddr {
        assert!(self.contains(addr), "read outside the arena: {addr:#x}");
        unsafe { (addr as *const GuestAddr).read_volatile() }
    }

    pub fn write(&mut self, addr: GuestAddr, value: GuestAddr) {
        assert!(self.contains(addr), "write outside the arena: {addr:#x}");
        unsafe { (addr as *mut GuestAddr).write_volatile(value) };
    }

    pub fn malloc(&mut self, size: usize) -> GuestAddr {
        if self.fail_allocations {
            return 0;
        }
        let Some(size) = size
            .checked_add(WORD_SIZE - 1)
            .map(|s| s & !(WORD_SIZE - 1))
        else {
            return 0;
        };
        if let Some(i) = self.free_list.iter().position(|(_, cap)| *cap >= size) {
            let (base, cap) = self.free_list.remove(i);
            self.blocks.insert(base, cap);
            return base;
        }
        if size > ARENA_SIZE - self.top {
            return 0;
        }
        let base = self.start + self.top;
        self.top += size;
        self.blocks.insert(base, size);
        base
    }

    pub fn calloc(&mut self, count: usize, size: usize) -> GuestAddr {
        let Some(total) = count.checked_mul(size) else {
            return 0;
        };
        let base = self.malloc(total);
        if base != 0 {
            let cap = self.blocks[&base];
            unsafe { (base as *mut u8).write_bytes(0, cap) };
        }
        base
    }

    pub fn realloc(&mut self, base: GuestAddr, size: usize) -> GuestAddr {
        if base == 0 {
            return self.malloc(size);
        }
        if size == 0 {
            self.free(base);
            return 0;
        }
        let old = self.blocks[&base];
        let new = self.malloc(size);
        if new == 0 {
            return 0;
        }
        unsafe { copy_nonoverlapping(base as *const u8, new as *mut u8, old.min(size)) };
        self.free(base);
        new
    }

    pub fn free(&mut self, base: GuestAddr) {
        self.freed.push(base);
        if base == 0 {
            return;
        }
        let Some(cap) = self.blocks.remove(&base) else {
            panic!("invalid free of {base:#x}");
        };
        self.free_list.push((base, cap));
    }
}

impl Host for FakeHost {
    type Error = FakeHostError;

    fn subscribe(&mut self, events: &[EventKind]) -> Result<(), Self::Error> {
        self.subscribed.extend_from_slice(events);
        Ok(())
    }

    fn resolve_export(&self, module: &ModuleInfo, name: &str) -> Option<GuestAddr> {
        self.exports
            .get(&(module.name.clone(), name.to_string()))
            .copied()
    }

    fn lookup_symbol(&self, module: &ModuleInfo, name: &str) -> Option<GuestAddr> {
        self.symbols
            .get(&(module.name.clone(), name.to_string()))
            .copied()
    }

    fn wrap(&mut self, target: GuestAddr) -> Result<(), Self::Error> {
        if self.reject_wraps {
            return Err(FakeHostError::WrapRejected(target));
        }
        self.wrapped.push(target);
        Ok(())
    }

    fn machine_context(&self) -> MachineContext {
        self.mc
    }

    fn decode(&self, pc: GuestAddr) -> Option<Instruction> {
        self.code.get(&pc).cloned()
    }

    fn safe_read(&self, addr: GuestAddr) -> Option<GuestAddr> {
        self.contains(addr).then(|| self.read(addr))
    }
}

#[derive(Debug, Default)]
pub struct FakeCall {
    pub args: Vec<GuestAddr>,
    pub ret: GuestAddr,
}

impl WrapContext for FakeCall {
    fn arg(&self, index: usize) -> GuestAddr {
        self.args[index]
    }

    fn set_arg(&mut self, index: usize, value: GuestAddr) {
        self.args[index] = value;
    }

    fn retval(&self) -> GuestAddr {
        self.ret
    }

    fn set_retval(&mut self, value: GuestAddr) {
        self.ret = value;
    }
}

pub type Runtime = RedzoneRuntime<FakeHost>;

pub fn runtime() -> Runtime {
    runtime_with(RedzoneConfig::default())
}

/// A runtime with the allocators of [`libc`] and [`app`] wrapped.
pub fn runtime_with(config: RedzoneConfig) -> Runtime {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut rt = RedzoneRuntime::init(FakeHost::new(), config).unwrap();
    rt.handle(Event::ModuleLoaded(&libc())).unwrap();
    rt.handle(Event::ModuleLoaded(&app())).unwrap();
    rt
}

/// Calls the function at `target` the way the host would: entry event, the
/// fake function with the possibly rewritten arguments, exit event.
pub fn invoke(rt: &mut Runtime, target: GuestAddr, args: &[GuestAddr]) -> GuestAddr {
    let mut call = FakeCall {
        args: args.to_vec(),
        ret: 0,
    };
    let mut stash = CallStash::default();
    rt.handle(Event::FunctionEntered {
        target,
        call: &mut call,
        stash: &mut stash,
    })
    .unwrap();
    call.ret = execute(rt, target, &call.args);
    rt.handle(Event::FunctionExited {
        target,
        call: &mut call,
        stash,
    })
    .unwrap();
    call.ret
}

fn execute(rt: &mut Runtime, target: GuestAddr, args: &[GuestAddr]) -> GuestAddr {
    match rt.host().functions[&target] {
        FakeFunction::Malloc => rt.host_mut().malloc(args[0]),
        FakeFunction::Calloc => rt.host_mut().calloc(args[0], args[1]),
        FakeFunction::Realloc => rt.host_mut().realloc(args[0], args[1]),
        FakeFunction::Free => {
            rt.host_mut().free(args[0]);
            0
        }
        FakeFunction::TMalloc => invoke(rt, MALLOC, &[args[0]]),
        FakeFunction::TFree => {
            invoke(rt, FREE, &[args[0]]);
            0
        }
    }
}

pub fn malloc(rt: &mut Runtime, size: usize) -> GuestAddr {
    invoke(rt, MALLOC, &[size])
}

pub fn free(rt: &mut Runtime, ptr: GuestAddr) {
    invoke(rt, FREE, &[ptr]);
}

/// Whether every word of `[start, start + len)` holds the sentinel.
pub fn is_poisoned(rt: &Runtime, start: GuestAddr, len: usize) -> bool {
    (start..start + len)
        .step_by(WORD_SIZE)
        .all(|addr| rt.host().read(addr) == rt.config().sentinel)
}

/// Whether both guards of the user region at `user` are intact.
pub fn is_guarded(rt: &Runtime, user: GuestAddr, rounded: usize) -> bool {
    is_poisoned(rt, user - PRE_REDZONE_SIZE, PRE_REDZONE_SIZE)
        && is_poisoned(rt, user + rounded, POST_REDZONE_SIZE)
}

fn mem(base: Register) -> Operand {
    Operand::Mem(MemOperand {
        base: Some(base),
        ..MemOperand::default()
    })
}

/// Places `mov [rdi], rax` at `pc`.
pub fn place_store(rt: &mut Runtime, pc: GuestAddr) {
    let instr = Instruction {
        address: pc,
        length: 3,
        srcs: vec![Operand::Reg(Register::Rax)],
        dsts: vec![mem(Register::Rdi)],
        ..Instruction::default()
    };
    rt.host_mut().code.insert(pc, instr);
}

/// Places `mov rbx, [rsi]` at `pc`.
pub fn place_load(rt: &mut Runtime, pc: GuestAddr) {
    let instr = Instruction {
        address: pc,
        length: 3,
        srcs: vec![mem(Register::Rsi)],
        dsts: vec![Operand::Reg(Register::Rbx)],
        ..Instruction::default()
    };
    rt.host_mut().code.insert(pc, instr);
}

/// Runs the store placed at `pc` writing `value` to `addr`, including its
/// check. The store only happens if the check lets it.
pub fn run_store(rt: &mut Runtime, pc: GuestAddr, addr: GuestAddr, value: GuestAddr) -> Directive {
    let host = rt.host_mut();
    host.mc.pc = pc;
    host.mc.set(Register::Rdi, addr);
    host.mc.set(Register::Rax, value);
    let directive = rt
        .handle(Event::AccessCheck(CheckCall {
            pc,
            access: AccessKind::Write,
            operand: 0,
        }))
        .unwrap();
    if directive == Directive::Continue {
        rt.host_mut().write(addr, value);
    }
    directive
}

/// Runs the check of the load placed at `pc` reading from `addr`.
pub fn run_load(rt: &mut Runtime, pc: GuestAddr, addr: GuestAddr) -> Directive {
    let host = rt.host_mut();
    host.mc.pc = pc;
    host.mc.set(Register::Rsi, addr);
    rt.handle(Event::AccessCheck(CheckCall {
        pc,
        access: AccessKind::Read,
        operand: 0,
    }))
    .unwrap()
}
