// End-to-end runs driven through the public API: load or assemble a
// program, execute it and check the final state and the emitted trace.

use serde_json::Value;
use y86_seq_rs::isa::{RAX, RCX, RDX, RSP, R12, R13};
use y86_seq_rs::{assemble, load_image, Cache, Cpu, Memory, Record, Stat, TraceWriter};

const CHAIN_YO: &str = "\
0x000: 30f20a00000000000000 |
0x00a: 30f00300000000000000 |
0x014: 10
0x015: 10
0x016: 10
0x017: 6020
0x019: 00
";

fn run_with_trace(mem: Memory, cache: bool) -> (Cpu, Vec<Value>) {
    let mut cpu = Cpu::new(mem);
    if cache {
        cpu.attach_cache(Cache::default());
    }
    let mut writer = TraceWriter::new(Vec::new());
    cpu.run(|cpu| writer.record(&Record::snapshot(cpu))).unwrap();
    let buf = writer.finish().unwrap();
    let trace: Value = serde_json::from_slice(&buf).unwrap();
    (cpu, trace.as_array().unwrap().clone())
}

fn run_ys(src: &str) -> (Cpu, Vec<Value>) {
    let obj = assemble(src).unwrap();
    run_with_trace(obj.mem, false)
}

#[test]
fn test_image_run() {
    let mut mem = Memory::default();
    assert_eq!(load_image(CHAIN_YO, &mut mem), 26);
    let image = mem.clone();
    let (cpu, trace) = run_with_trace(mem, false);

    assert_eq!(cpu.stat(), Stat::Hlt);
    assert_eq!(cpu.regs().get(RAX), 13);
    assert_eq!(cpu.regs().get(RDX), 10);
    assert_eq!(cpu.pc(), 0x19);

    // seven instructions, one record each
    assert_eq!(trace.len(), 7);

    // after the first irmovq: PC moved past it, flags still at reset
    let first = &trace[0];
    assert_eq!(first["PC"], 10);
    assert_eq!(first["STAT"], 1);
    assert_eq!(first["CC"]["ZF"], 1);
    assert_eq!(first["REG"]["rdx"], 10);
    assert_eq!(first["REG"]["rax"], 0);

    // the memory object carries exactly the non-zero words of the image
    let words = first["MEM"].as_object().unwrap();
    for addr in (0..0x20u64).step_by(8) {
        let expect = image.read_quad(addr).unwrap();
        match words.get(&addr.to_string()) {
            Some(v) => assert_eq!(v.as_i64().unwrap(), expect, "word at {addr}"),
            None => assert_eq!(expect, 0, "word at {addr}"),
        }
    }
    assert!(!words.contains_key("32"));

    // addq: 10 + 3, no flags
    let add = &trace[5];
    assert_eq!(add["PC"], 0x19);
    assert_eq!(add["REG"]["rax"], 13);
    assert_eq!(add["CC"]["ZF"], 0);
    assert_eq!(add["CC"]["SF"], 0);
    assert_eq!(add["CC"]["OF"], 0);

    // halt: status change without PC advance
    let halt = &trace[6];
    assert_eq!(halt["PC"], 0x19);
    assert_eq!(halt["STAT"], 2);
}

#[test]
fn test_assembler_matches_image() {
    let obj = assemble(
        r#"
        irmovq $10, %rdx
        irmovq $3, %rax
        nop
        nop
        nop
        addq %rdx, %rax
        halt
    "#,
    )
    .unwrap();
    let mut mem = Memory::default();
    load_image(CHAIN_YO, &mut mem);
    assert_eq!(obj.mem.bytes()[..0x20], mem.bytes()[..0x20]);
}

#[test]
fn test_subq_sets_zf() {
    let (cpu, trace) = run_ys(
        r#"
        irmovq $5, %rax
        subq %rax, %rax
        halt
    "#,
    );
    assert_eq!(cpu.stat(), Stat::Hlt);
    assert_eq!(cpu.regs().get(RAX), 0);
    let last = trace.last().unwrap();
    assert_eq!(last["CC"]["ZF"], 1);
    assert_eq!(last["CC"]["SF"], 0);
    assert_eq!(last["CC"]["OF"], 0);
}

#[test]
fn test_subq_signed_overflow() {
    let (cpu, trace) = run_ys(
        r#"
        irmovq $0x8000000000000000, %rax
        irmovq $-1, %rbx
        subq %rbx, %rax
        halt
    "#,
    );
    assert_eq!(cpu.stat(), Stat::Hlt);
    let last = trace.last().unwrap();
    assert_eq!(last["CC"]["OF"], 1);
    assert_eq!(last["CC"]["SF"], 1);
    assert_eq!(last["CC"]["ZF"], 0);
}

#[test]
fn test_cmovg_taken() {
    let (cpu, _) = run_ys(
        r#"
        irmovq $1, %rax
        irmovq $2, %rbx
        subq %rax, %rbx
        cmovg %rax, %rcx
        halt
    "#,
    );
    assert_eq!(cpu.regs().get(RCX), 1);
}

#[test]
fn test_call_and_ret() {
    let (cpu, trace) = run_ys(
        r#"
        irmovq $0x100, %rsp
        call f
        halt
    f:
        ret
    "#,
    );
    assert_eq!(cpu.stat(), Stat::Hlt);
    assert_eq!(cpu.regs().get(RSP), 0x100);

    // call: jumps to f, pushes the return address at 0xf8
    let call = &trace[1];
    assert_eq!(call["PC"], 20);
    assert_eq!(call["REG"]["rsp"], 0xf8);
    assert_eq!(call["MEM"]["248"], 19);

    // ret: back to the halt right after the call
    let ret = &trace[2];
    assert_eq!(ret["PC"], 19);
    assert_eq!(ret["REG"]["rsp"], 0x100);
}

#[test]
fn test_bad_address_stops_before_halt() {
    let (cpu, trace) = run_ys(
        r#"
        irmovq $0x10000, %rax
        mrmovq 0(%rax), %rbx
        halt
    "#,
    );
    assert_eq!(cpu.stat(), Stat::Adr);
    // the fault record points at the mrmovq and is the last one
    assert_eq!(trace.len(), 2);
    let last = trace.last().unwrap();
    assert_eq!(last["STAT"], 3);
    assert_eq!(last["PC"], 10);
}

#[test]
fn test_flags_untouched_off_opq() {
    let (_, trace) = run_ys(
        r#"
        irmovq $7, %rax
        irmovq $7, %rbx
        subq %rax, %rbx
        irmovq $0x80, %rsp
        pushq %rax
        popq %rcx
        rrmovq %rax, %rdx
        jmp end
    end:
        halt
    "#,
    );
    // subq set ZF; everything after it must leave the flags alone
    for record in &trace[2..] {
        assert_eq!(record["CC"]["ZF"], 1);
        assert_eq!(record["CC"]["SF"], 0);
        assert_eq!(record["CC"]["OF"], 0);
    }
}

#[test]
fn test_cache_is_transparent() {
    let src = r#"
        irmovq $0x300, %rbx
        irmovq $-7, %rax
        rmmovq %rax, 0(%rbx)
        mrmovq 0(%rbx), %rcx
        mrmovq 0(%rbx), %rdx
        halt
    "#;
    let (plain_cpu, plain_trace) = run_with_trace(assemble(src).unwrap().mem, false);
    let (cached_cpu, cached_trace) = run_with_trace(assemble(src).unwrap().mem, true);

    assert_eq!(plain_cpu.stat(), cached_cpu.stat());
    assert_eq!(plain_cpu.pc(), cached_cpu.pc());
    for id in 0..15 {
        assert_eq!(plain_cpu.regs().get(id), cached_cpu.regs().get(id));
    }
    assert_eq!(plain_cpu.mem().bytes(), cached_cpu.mem().bytes());

    for (plain, cached) in plain_trace.iter().zip(&cached_trace) {
        for field in ["PC", "STAT", "CC", "REG", "MEM"] {
            assert_eq!(plain[field], cached[field], "field {field}");
        }
        assert!(plain.get("cache").is_none());
        assert!(cached.get("cache").is_some());
    }

    // three data accesses to one block: one miss, two hits
    let stats = &cached_trace.last().unwrap()["cache"];
    assert_eq!(stats["accesses"], 3);
    assert_eq!(stats["misses"], 1);
    assert_eq!(stats["hits"], 2);
}

#[test]
fn test_push_pop_discipline() {
    let (cpu, _) = run_ys(
        r#"
        irmovq $0x100, %rsp
        irmovq $-99, %r12
        pushq %r12
        popq %r13
        halt
    "#,
    );
    assert_eq!(cpu.regs().get(R13), -99);
    assert_eq!(cpu.regs().get(R12), -99);
    assert_eq!(cpu.regs().get(RSP), 0x100);
}
