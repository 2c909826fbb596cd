//! Per-step execution trace.
//!
//! After every instruction the whole architectural state is serialised as
//! one record; a run produces a single JSON array of records.

use std::collections::BTreeMap;
use std::io::Write;

use anyhow::Result;
use serde::Serialize;

use crate::cache::CacheStats;
use crate::cpu::Cpu;
use crate::isa::{RAX, RBP, RBX, RCX, RDI, RDX, RSI, RSP, R10, R11, R12, R13, R14, R8, R9};
use crate::mem::{Memory, MEM_SIZE};
use crate::regs::RegisterFile;

#[derive(Debug, Serialize)]
struct CcRecord {
    #[serde(rename = "OF")]
    of: u8,
    #[serde(rename = "SF")]
    sf: u8,
    #[serde(rename = "ZF")]
    zf: u8,
}

/// All fifteen registers by name, as signed decimals.
#[derive(Debug, Serialize)]
struct RegRecord {
    rax: i64,
    rcx: i64,
    rdx: i64,
    rbx: i64,
    rsp: i64,
    rbp: i64,
    rsi: i64,
    rdi: i64,
    r8: i64,
    r9: i64,
    r10: i64,
    r11: i64,
    r12: i64,
    r13: i64,
    r14: i64,
}

impl RegRecord {
    fn snapshot(regs: &RegisterFile) -> Self {
        Self {
            rax: regs.get(RAX),
            rcx: regs.get(RCX),
            rdx: regs.get(RDX),
            rbx: regs.get(RBX),
            rsp: regs.get(RSP),
            rbp: regs.get(RBP),
            rsi: regs.get(RSI),
            rdi: regs.get(RDI),
            r8: regs.get(R8),
            r9: regs.get(R9),
            r10: regs.get(R10),
            r11: regs.get(R11),
            r12: regs.get(R12),
            r13: regs.get(R13),
            r14: regs.get(R14),
        }
    }
}

/// Every 8-byte aligned quad word with a non-zero value, keyed by its
/// decimal address.
fn mem_words(mem: &Memory) -> BTreeMap<u64, i64> {
    let mut words = BTreeMap::new();
    for addr in (0..MEM_SIZE as u64).step_by(8) {
        match mem.read_quad(addr) {
            Some(0) | None => {}
            Some(val) => {
                words.insert(addr, val);
            }
        }
    }
    words
}

/// State snapshot emitted after one instruction.
#[derive(Debug, Serialize)]
pub struct Record {
    #[serde(rename = "PC")]
    pc: u64,
    #[serde(rename = "STAT")]
    stat: u8,
    #[serde(rename = "CC")]
    cc: CcRecord,
    #[serde(rename = "REG")]
    reg: RegRecord,
    #[serde(rename = "MEM")]
    mem: BTreeMap<u64, i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cache: Option<CacheStats>,
}

impl Record {
    pub fn snapshot(cpu: &Cpu) -> Self {
        let cc = cpu.cc();
        Self {
            pc: cpu.pc(),
            stat: cpu.stat() as u8,
            cc: CcRecord {
                of: cc.of as u8,
                sf: cc.sf as u8,
                zf: cc.zf as u8,
            },
            reg: RegRecord::snapshot(cpu.regs()),
            mem: mem_words(cpu.mem()),
            cache: cpu.cache().map(|c| c.stats()),
        }
    }
}

/// Streams records as one JSON array, in emission order.
pub struct TraceWriter<W: Write> {
    out: W,
    count: usize,
}

impl<W: Write> TraceWriter<W> {
    pub fn new(out: W) -> Self {
        Self { out, count: 0 }
    }

    pub fn record(&mut self, record: &Record) -> Result<()> {
        self.out
            .write_all(if self.count == 0 { b"[" } else { b"," })?;
        serde_json::to_writer(&mut self.out, record)?;
        self.count += 1;
        Ok(())
    }

    /// Close the array and flush.
    pub fn finish(mut self) -> Result<W> {
        if self.count == 0 {
            self.out.write_all(b"[")?;
        }
        self.out.write_all(b"]\n")?;
        self.out.flush()?;
        Ok(self.out)
    }
}
