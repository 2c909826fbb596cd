//! Y86 assembler: translates symbolic assembly into a memory image.
//!
//! Assembly is two passes: the first walks the parsed lines, assigns
//! addresses and collects label symbols; the second encodes every
//! statement into the image, resolving label references.

use std::collections::BTreeMap;
use std::fmt::Display;

use anyhow::{bail, Context, Result};
use pest::Parser;
use pest_derive::Parser;

use crate::isa::{self, CondFn, Icode, OpFn};
use crate::mem::Memory;
use crate::utils::parse_literal;

#[derive(Parser)]
#[grammar = "src/asm/grammar.pest"]
struct Y86AsmParser;

pub type SymbolMap = BTreeMap<String, u64>;

/// Immediate values (raw number or address of a label)
#[derive(Debug, Clone)]
enum Imm {
    Num(i64),
    Label(String),
}

impl Imm {
    fn resolve(&self, symbols: &SymbolMap) -> Result<i64> {
        match self {
            Imm::Num(num) => Ok(*num),
            Imm::Label(label) => symbols
                .get(label)
                .copied()
                .map(|addr| addr as i64)
                .with_context(|| format!("undefined label `{label}`")),
        }
    }
}

/// One decoded instruction, registers and functions as their 4-bit codes.
#[derive(Debug, Clone)]
enum Inst {
    Halt,
    Nop,
    Ret,
    /// `rrmovq/cmovXX rA, rB`
    Cmov(CondFn, u8, u8),
    /// `irmovq $V, rB`
    Irmov(u8, Imm),
    /// `rmmovq rA, D(rB)`
    Rmmov(u8, i64, u8),
    /// `mrmovq D(rB), rA`
    Mrmov(i64, u8, u8),
    Op(OpFn, u8, u8),
    Jump(CondFn, Imm),
    Call(Imm),
    Push(u8),
    Pop(u8),
}

fn pack(hi: u8, lo: u8) -> u8 {
    hi << 4 | (lo & 0xf)
}

impl Inst {
    fn len(&self) -> u64 {
        use Inst::*;
        match self {
            Halt | Nop | Ret => 1,
            Cmov(..) | Op(..) | Push(_) | Pop(_) => 2,
            Jump(..) | Call(_) => 9,
            Irmov(..) | Rmmov(..) | Mrmov(..) => 10,
        }
    }

    fn encode(&self, symbols: &SymbolMap) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(10);
        match self {
            Inst::Halt => out.push(pack(Icode::Halt as u8, 0)),
            Inst::Nop => out.push(pack(Icode::Nop as u8, 0)),
            Inst::Ret => out.push(pack(Icode::Ret as u8, 0)),
            Inst::Cmov(cond, ra, rb) => {
                out.push(pack(Icode::Cmovx as u8, *cond as u8));
                out.push(pack(*ra, *rb));
            }
            Inst::Irmov(rb, v) => {
                out.push(pack(Icode::Irmovq as u8, 0));
                out.push(pack(isa::RNONE, *rb));
                out.extend_from_slice(&v.resolve(symbols)?.to_le_bytes());
            }
            Inst::Rmmov(ra, disp, rb) => {
                out.push(pack(Icode::Rmmovq as u8, 0));
                out.push(pack(*ra, *rb));
                out.extend_from_slice(&disp.to_le_bytes());
            }
            Inst::Mrmov(disp, rb, ra) => {
                out.push(pack(Icode::Mrmovq as u8, 0));
                out.push(pack(*ra, *rb));
                out.extend_from_slice(&disp.to_le_bytes());
            }
            Inst::Op(op, ra, rb) => {
                out.push(pack(Icode::Opq as u8, *op as u8));
                out.push(pack(*ra, *rb));
            }
            Inst::Jump(cond, v) => {
                out.push(pack(Icode::Jx as u8, *cond as u8));
                out.extend_from_slice(&v.resolve(symbols)?.to_le_bytes());
            }
            Inst::Call(v) => {
                out.push(pack(Icode::Call as u8, 0));
                out.extend_from_slice(&v.resolve(symbols)?.to_le_bytes());
            }
            Inst::Push(ra) => {
                out.push(pack(Icode::Pushq as u8, 0));
                out.push(pack(*ra, isa::RNONE));
            }
            Inst::Pop(ra) => {
                out.push(pack(Icode::Popq as u8, 0));
                out.push(pack(*ra, isa::RNONE));
            }
        }
        Ok(out)
    }
}

#[derive(Debug, Clone)]
enum Item {
    Inst(Inst),
    Quad(Imm),
}

/// One source line annotated with its address and encoded width.
#[derive(Debug)]
struct SourceLine {
    addr: Option<u64>,
    len: u64,
    body: Option<Item>,
    text: String,
}

/// Assembled program: memory image plus symbol table.
pub struct Object {
    pub mem: Memory,
    pub symbols: SymbolMap,
    source: Vec<SourceLine>,
}

impl Display for Object {
    /// Render in the program-image text format understood by the loader.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for line in &self.source {
            if let Some(addr) = line.addr {
                write!(f, "{:#06x}: ", addr)?;
                for i in 0..line.len {
                    write!(f, "{:02x}", self.mem.bytes()[(addr + i) as usize])?;
                }
                write!(f, "{: <1$}", "", (21 - line.len * 2) as usize)?;
            } else {
                write!(f, "{: <29}", "")?;
            }
            writeln!(f, "| {}", line.text)?;
        }
        Ok(())
    }
}

fn reg_of(pair: pest::iterators::Pair<'_, Rule>) -> Result<u8> {
    Ok(match pair.as_str() {
        "%rax" => isa::RAX,
        "%rcx" => isa::RCX,
        "%rdx" => isa::RDX,
        "%rbx" => isa::RBX,
        "%rsp" => isa::RSP,
        "%rbp" => isa::RBP,
        "%rsi" => isa::RSI,
        "%rdi" => isa::RDI,
        "%r8" => isa::R8,
        "%r9" => isa::R9,
        "%r10" => isa::R10,
        "%r11" => isa::R11,
        "%r12" => isa::R12,
        "%r13" => isa::R13,
        "%r14" => isa::R14,
        other => bail!("invalid register `{other}`"),
    })
}

fn cond_of(name: &str) -> Result<CondFn> {
    Ok(match name {
        "rrmovq" | "jmp" => CondFn::Yes,
        "cmovle" | "jle" => CondFn::Le,
        "cmovl" | "jl" => CondFn::L,
        "cmove" | "je" => CondFn::E,
        "cmovne" | "jne" => CondFn::Ne,
        "cmovge" | "jge" => CondFn::Ge,
        "cmovg" | "jg" => CondFn::G,
        other => bail!("invalid condition mnemonic `{other}`"),
    })
}

fn op_of(name: &str) -> Result<OpFn> {
    Ok(match name {
        "addq" => OpFn::Add,
        "subq" => OpFn::Sub,
        "andq" => OpFn::And,
        "xorq" => OpFn::Xor,
        other => bail!("invalid operation mnemonic `{other}`"),
    })
}

fn number_of(pair: pest::iterators::Pair<'_, Rule>) -> Result<i64> {
    let text = pair.as_str();
    parse_literal(text).with_context(|| format!("invalid numeric literal `{text}`"))
}

/// `constant` / `dest` wrapper: a label name, or a number with optional `$`.
fn imm_of(pair: pest::iterators::Pair<'_, Rule>) -> Result<Imm> {
    let inner = pair.into_inner().next().context("empty constant")?;
    Ok(match inner.as_rule() {
        Rule::ident => Imm::Label(inner.as_str().to_string()),
        _ => {
            let text = inner.as_str();
            let text = text.strip_prefix('$').unwrap_or(text);
            Imm::Num(parse_literal(text).with_context(|| format!("invalid literal `{text}`"))?)
        }
    })
}

/// `mem_ref`: optional displacement and a base register.
fn mem_ref_of(pair: pest::iterators::Pair<'_, Rule>) -> Result<(i64, u8)> {
    let mut it = pair.into_inner();
    let first = it.next().context("empty memory operand")?;
    if first.as_rule() == Rule::number {
        let disp = number_of(first)?;
        let reg = reg_of(it.next().context("missing base register")?)?;
        Ok((disp, reg))
    } else {
        Ok((0, reg_of(first)?))
    }
}

/// transform assembly code to a binary memory image
pub fn assemble(src: &str) -> Result<Object> {
    let lines = Y86AsmParser::parse(Rule::main, src)
        .context("fail to parse ys file")?
        .next()
        .context("empty parse result")?
        .into_inner();

    let mut symbols = SymbolMap::new();
    let mut source = Vec::new();
    let mut cur_addr = 0u64;

    for line in lines.filter(|l| l.as_rule() == Rule::line) {
        let text = line.as_str().to_string();
        let Some(item) = line.into_inner().next() else {
            source.push(SourceLine {
                addr: None,
                len: 0,
                body: None,
                text,
            });
            continue;
        };
        let mut entry = SourceLine {
            addr: Some(cur_addr),
            len: 0,
            body: None,
            text,
        };
        let mut it = item.clone().into_inner();
        match item.as_rule() {
            Rule::label_def => {
                let name = it.next().context("label name")?.as_str().to_string();
                symbols.insert(name, cur_addr);
            }
            Rule::dir_pos => {
                cur_addr = number_of(it.next().context("position")?)? as u64;
                entry.addr = Some(cur_addr);
            }
            Rule::dir_align => {
                let align = number_of(it.next().context("alignment")?)? as u64;
                if !align.is_power_of_two() {
                    bail!("alignment {align} is not a power of two");
                }
                cur_addr = (cur_addr + align - 1) & !(align - 1);
                entry.addr = Some(cur_addr);
            }
            Rule::dir_quad => {
                entry.body = Some(Item::Quad(imm_of(it.next().context("quad value")?)?));
                entry.len = 8;
                cur_addr += 8;
            }
            rule => {
                let inst = match rule {
                    Rule::inst_simple => match item.as_str() {
                        "halt" => Inst::Halt,
                        "nop" => Inst::Nop,
                        "ret" => Inst::Ret,
                        other => bail!("invalid instruction `{other}`"),
                    },
                    Rule::inst_cmov => {
                        let cond = cond_of(it.next().context("mnemonic")?.as_str())?;
                        let ra = reg_of(it.next().context("source register")?)?;
                        let rb = reg_of(it.next().context("destination register")?)?;
                        Inst::Cmov(cond, ra, rb)
                    }
                    Rule::inst_irmov => {
                        let v = imm_of(it.next().context("immediate")?)?;
                        let rb = reg_of(it.next().context("destination register")?)?;
                        Inst::Irmov(rb, v)
                    }
                    Rule::inst_rmmov => {
                        let ra = reg_of(it.next().context("source register")?)?;
                        let (disp, rb) = mem_ref_of(it.next().context("memory operand")?)?;
                        Inst::Rmmov(ra, disp, rb)
                    }
                    Rule::inst_mrmov => {
                        let (disp, rb) = mem_ref_of(it.next().context("memory operand")?)?;
                        let ra = reg_of(it.next().context("destination register")?)?;
                        Inst::Mrmov(disp, rb, ra)
                    }
                    Rule::inst_op => {
                        let op = op_of(it.next().context("mnemonic")?.as_str())?;
                        let ra = reg_of(it.next().context("source register")?)?;
                        let rb = reg_of(it.next().context("destination register")?)?;
                        Inst::Op(op, ra, rb)
                    }
                    Rule::inst_jump => {
                        let cond = cond_of(it.next().context("mnemonic")?.as_str())?;
                        Inst::Jump(cond, imm_of(it.next().context("target")?)?)
                    }
                    Rule::inst_call => Inst::Call(imm_of(it.next().context("target")?)?),
                    Rule::inst_push => Inst::Push(reg_of(it.next().context("register")?)?),
                    Rule::inst_pop => Inst::Pop(reg_of(it.next().context("register")?)?),
                    rule => bail!("unexpected syntax item {rule:?}"),
                };
                entry.len = inst.len();
                cur_addr += inst.len();
                entry.body = Some(Item::Inst(inst));
            }
        }
        source.push(entry);
    }
    tracing::debug!("symbols: {:?}", symbols);

    let mut mem = Memory::default();
    for line in &source {
        let (Some(addr), Some(body)) = (line.addr, &line.body) else {
            continue;
        };
        let bytes = match body {
            Item::Inst(inst) => inst.encode(&symbols)?,
            Item::Quad(v) => v.resolve(&symbols)?.to_le_bytes().to_vec(),
        };
        for (i, byte) in bytes.iter().enumerate() {
            mem.write_byte(addr + i as u64, *byte);
        }
    }

    Ok(Object {
        mem,
        symbols,
        source,
    })
}

#[cfg(test)]
pub mod tests {
    use pest::Parser;

    use super::{assemble, Rule, Y86AsmParser};

    pub const ASUM_YS: &str = r#"
# iteratively add up four quad words
    .pos 0
    irmovq stack, %rsp
    irmovq array, %rdi
    irmovq $4, %rsi
    irmovq $0, %rax
loop:
    andq %rsi, %rsi
    je done
    mrmovq (%rdi), %rbx
    addq %rbx, %rax
    irmovq $8, %r8
    addq %r8, %rdi
    irmovq $1, %r9
    subq %r9, %rsi
    jmp loop
done:
    halt

    .align 8
array:
    .quad 0x1
    .quad 0x10
    .quad 0x100
    .quad 0x1000

    .pos 0x200
stack:
"#;

    #[test]
    fn test_parser() {
        let lines = Y86AsmParser::parse(Rule::main, ASUM_YS)
            .unwrap()
            .next()
            .unwrap()
            .into_inner();
        for line in lines.filter(|l| l.as_rule() == Rule::line) {
            dbg!(line);
        }
    }

    #[test]
    fn test_encoding() {
        let obj = assemble("irmovq $10, %rdx\nnop\naddq %rdx, %rax\nhalt\n").unwrap();
        let expect: [u8; 14] = [0x30, 0xf2, 0x0a, 0, 0, 0, 0, 0, 0, 0, 0x10, 0x60, 0x20, 0x00];
        assert_eq!(obj.mem.bytes()[..14], expect[..]);
    }

    #[test]
    fn test_labels_and_directives() {
        let obj = assemble(ASUM_YS).unwrap();
        assert_eq!(obj.symbols["loop"], 40);
        assert_eq!(obj.symbols["stack"], 0x200);
        let array = obj.symbols["array"];
        assert_eq!(array % 8, 0);
        assert_eq!(obj.mem.read_quad(array + 16), Some(0x100));
    }

    #[test]
    fn test_undefined_label() {
        assert!(assemble("jmp nowhere\n").is_err());
    }

    #[test]
    fn test_image_text_round_trip() {
        let obj = assemble(ASUM_YS).unwrap();
        let mut mem = crate::mem::Memory::default();
        crate::loader::load_image(&obj.to_string(), &mut mem);
        assert_eq!(mem.bytes(), obj.mem.bytes());
    }
}
