//! Sequential Y86-64 interpreter.
//!
//! Each instruction goes through the six classic stages in order: fetch,
//! decode, execute, memory, write back and PC update. The stages exchange
//! values through a per-step [`Sigs`] record; architectural state lives in
//! [`Cpu`] and is only mutated by the stages.

use anyhow::Result;

use crate::cache::Cache;
use crate::isa::{reg_name, CondFn, Icode, OpFn, RNONE, RSP};
use crate::mem::{Memory, MEM_SIZE};
use crate::regs::RegisterFile;

/// Machine status after each step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Stat {
    /// Indicates that everything is fine.
    #[default]
    Aok = 1,
    /// The halt state, entered when a halt instruction executes.
    Hlt = 2,
    /// Instruction fetch or data memory touched an invalid address.
    Adr = 3,
    /// The instruction fetcher read an invalid instruction code.
    Ins = 4,
}

/// Condition codes, updated by `opq` instructions only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CondCode {
    pub zf: bool,
    pub sf: bool,
    pub of: bool,
}

impl Default for CondCode {
    fn default() -> Self {
        Self {
            zf: true,
            sf: false,
            of: false,
        }
    }
}

impl CondCode {
    /// Flags for `e = b op a` under signed interpretation.
    fn of_op(fun: OpFn, a: i64, b: i64, e: i64) -> Self {
        let of = match fun {
            OpFn::Add => (a > 0 && b > 0 && e < 0) || (a < 0 && b < 0 && e >= 0),
            OpFn::Sub => (b > 0 && a < 0 && e < 0) || (b < 0 && a > 0 && e >= 0),
            OpFn::And | OpFn::Xor => false,
        };
        Self {
            zf: e == 0,
            sf: e < 0,
            of,
        }
    }

    /// Evaluate a branch or move condition against the current flags.
    fn test(&self, fun: CondFn) -> bool {
        match fun {
            CondFn::Yes => true,
            CondFn::Le => (self.sf ^ self.of) || self.zf,
            CondFn::L => self.sf ^ self.of,
            CondFn::E => self.zf,
            CondFn::Ne => !self.zf,
            CondFn::Ge => !(self.sf ^ self.of),
            CondFn::G => !(self.sf ^ self.of) && !self.zf,
        }
    }
}

fn alu(fun: OpFn, a: i64, b: i64) -> i64 {
    match fun {
        OpFn::Add => b.wrapping_add(a),
        OpFn::Sub => b.wrapping_sub(a),
        OpFn::And => b & a,
        OpFn::Xor => b ^ a,
    }
}

/// Stage-to-stage signals of a single instruction, reset every step.
#[derive(Debug, Default)]
struct Sigs {
    icode: Icode,
    ifun: u8,
    ra: u8,
    rb: u8,
    valc: i64,
    valp: u64,
    vala: i64,
    valb: i64,
    vale: i64,
    valm: i64,
    cnd: bool,
}

/// The sequential processor.
pub struct Cpu {
    pc: u64,
    regs: RegisterFile,
    cc: CondCode,
    stat: Stat,
    mem: Memory,
    cache: Option<Cache>,
}

impl Cpu {
    pub fn new(mem: Memory) -> Self {
        Self {
            pc: 0,
            regs: RegisterFile::default(),
            cc: CondCode::default(),
            stat: Stat::Aok,
            mem,
            cache: None,
        }
    }

    /// Interpose an observation-only cache on data memory accesses.
    pub fn attach_cache(&mut self, cache: Cache) {
        self.cache = Some(cache);
    }

    pub fn pc(&self) -> u64 {
        self.pc
    }

    pub fn stat(&self) -> Stat {
        self.stat
    }

    pub fn cc(&self) -> CondCode {
        self.cc
    }

    pub fn regs(&self) -> &RegisterFile {
        &self.regs
    }

    pub fn mem(&self) -> &Memory {
        &self.mem
    }

    pub fn cache(&self) -> Option<&Cache> {
        self.cache.as_ref()
    }

    /// Process one instruction.
    ///
    /// A fetch fault skips the remaining stages so the faulting PC stays
    /// observable; a fault in a later stage still runs the stages after it
    /// but inhibits the PC update.
    pub fn step(&mut self) {
        if self.stat != Stat::Aok {
            return;
        }
        let mut s = Sigs::default();
        self.fetch(&mut s);
        if self.stat == Stat::Aok {
            self.decode(&mut s);
            self.execute(&mut s);
            self.memory(&mut s);
            self.write_back(&s);
            self.update_pc(&s);
        }
    }

    /// Drive the processor until it leaves the running state, calling
    /// `on_step` with the architectural state after every instruction.
    pub fn run(&mut self, mut on_step: impl FnMut(&Cpu) -> Result<()>) -> Result<()> {
        loop {
            self.step();
            on_step(self)?;
            if self.stat != Stat::Aok {
                break;
            }
            if self.pc >= MEM_SIZE as u64 {
                break;
            }
        }
        Ok(())
    }

    fn fetch(&mut self, s: &mut Sigs) {
        use Icode::*;
        let Some(byte) = self.mem.read_byte(self.pc) else {
            self.stat = Stat::Adr;
            return;
        };
        s.icode = match Icode::try_from(byte >> 4) {
            Ok(icode) => icode,
            Err(_) => {
                self.stat = Stat::Ins;
                return;
            }
        };
        s.ifun = byte & 0xf;
        s.valp = self.pc + 1;
        if matches!(
            s.icode,
            Cmovx | Irmovq | Rmmovq | Mrmovq | Opq | Pushq | Popq
        ) {
            let Some(regids) = self.mem.read_byte(s.valp) else {
                self.stat = Stat::Adr;
                return;
            };
            s.ra = regids >> 4;
            s.rb = regids & 0xf;
            s.valp += 1;
        } else {
            s.ra = RNONE;
            s.rb = RNONE;
        }
        if matches!(s.icode, Irmovq | Rmmovq | Mrmovq | Jx | Call) {
            let Some(valc) = self.mem.read_quad(s.valp) else {
                self.stat = Stat::Adr;
                return;
            };
            s.valc = valc;
            s.valp += 8;
        }
    }

    fn decode(&mut self, s: &mut Sigs) {
        use Icode::*;
        let srca = match s.icode {
            Cmovx | Rmmovq | Opq | Pushq => s.ra,
            Popq | Ret => RSP,
            _ => RNONE,
        };
        let srcb = match s.icode {
            Opq | Rmmovq | Mrmovq => s.rb,
            Pushq | Popq | Call | Ret => RSP,
            _ => RNONE,
        };
        s.vala = self.regs.get(srca);
        s.valb = self.regs.get(srcb);
    }

    fn execute(&mut self, s: &mut Sigs) {
        use Icode::*;
        s.vale = match s.icode {
            Opq => match OpFn::try_from(s.ifun) {
                Ok(fun) => {
                    let vale = alu(fun, s.vala, s.valb);
                    self.cc = CondCode::of_op(fun, s.vala, s.valb, vale);
                    tracing::debug!(
                        "CC update: a = {:#x}, b = {:#x}, e = {:#x}, cc = {:?}",
                        s.vala,
                        s.valb,
                        vale,
                        self.cc
                    );
                    vale
                }
                // undefined ALU function: no result and the flags stay put
                Err(_) => 0,
            },
            Irmovq => s.valc,
            Cmovx => s.vala,
            Rmmovq | Mrmovq => s.valb.wrapping_add(s.valc),
            Pushq | Call => s.valb.wrapping_sub(8),
            Popq | Ret => s.valb.wrapping_add(8),
            _ => 0,
        };
        if matches!(s.icode, Jx | Cmovx) {
            // an undefined condition nibble never fires
            s.cnd = CondFn::try_from(s.ifun)
                .map(|fun| self.cc.test(fun))
                .unwrap_or(false);
        }
        if s.icode == Halt {
            self.stat = Stat::Hlt;
        }
    }

    fn memory(&mut self, s: &mut Sigs) {
        use Icode::*;
        let (addr, store) = match s.icode {
            Rmmovq | Pushq => (s.vale as u64, Some(s.vala)),
            Call => (s.vale as u64, Some(s.valp as i64)),
            Mrmovq => (s.vale as u64, None),
            Popq | Ret => (s.vala as u64, None),
            _ => return,
        };
        let ok = match store {
            Some(val) => {
                let ok = self.mem.write_quad(addr, val);
                if ok {
                    tracing::debug!("write memory: addr = {:#x}, data = {:#x}", addr, val);
                }
                ok
            }
            None => match self.mem.read_quad(addr) {
                Some(val) => {
                    s.valm = val;
                    true
                }
                None => {
                    s.valm = 0;
                    false
                }
            },
        };
        if !ok {
            self.stat = Stat::Adr;
            return;
        }
        if let Some(cache) = self.cache.as_mut() {
            cache.access(addr, 8);
        }
    }

    fn write_back(&mut self, s: &Sigs) {
        use Icode::*;
        let dste = match s.icode {
            Opq | Irmovq => s.rb,
            Cmovx => {
                if s.cnd {
                    s.rb
                } else {
                    RNONE
                }
            }
            Pushq | Popq | Call | Ret => RSP,
            _ => RNONE,
        };
        let dstm = match s.icode {
            Mrmovq | Popq => s.ra,
            _ => RNONE,
        };
        if dste != RNONE {
            tracing::debug!("write back dstE = {}, valE = {:#x}", reg_name(dste), s.vale);
        }
        if dstm != RNONE {
            tracing::debug!("write back dstM = {}, valM = {:#x}", reg_name(dstm), s.valm);
        }
        // dstM second: `popq %rsp` must leave the loaded value in rsp
        self.regs.set(dste, s.vale);
        self.regs.set(dstm, s.valm);
    }

    fn update_pc(&mut self, s: &Sigs) {
        use Icode::*;
        if self.stat != Stat::Aok {
            return;
        }
        self.pc = match s.icode {
            Call => s.valc as u64,
            Ret => s.valm as u64,
            Jx => {
                if s.cnd {
                    s.valc as u64
                } else {
                    s.valp
                }
            }
            _ => s.valp,
        };
    }
}
