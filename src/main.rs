use std::io::Write;

use anyhow::{Context, Result};
use clap::Parser;
use y86_seq_rs::{
    assemble, load_image, logging_setup, mem_diff, Cache, Cpu, Memory, Record, TraceWriter,
};

/// Y86 sequential simulator written in rust
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// input file path (.ys assembly, otherwise a program image)
    input: String,
    /// trace output filename (default is stdout)
    #[arg(short = 'o', long)]
    output: Option<String>,
    /// print simulation logs and include cache statistics in the trace
    #[arg(short = 'v', long)]
    verbose: bool,
    /// print a memory diff of the run to stderr
    #[arg(long)]
    diff: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    logging_setup(if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    });

    let content = std::fs::read_to_string(&args.input)
        .with_context(|| format!("could not read file `{}`", &args.input))?;
    let mem = if args.input.ends_with(".ys") {
        assemble(&content)?.mem
    } else {
        let mut mem = Memory::default();
        load_image(&content, &mut mem);
        mem
    };

    let init_mem = mem.clone();
    let mut cpu = Cpu::new(mem);
    if args.verbose {
        cpu.attach_cache(Cache::default());
    }

    let out: Box<dyn Write> = match &args.output {
        Some(path) => Box::new(
            std::fs::File::create(path)
                .with_context(|| format!("could not write file `{path}`"))?,
        ),
        None => Box::new(std::io::stdout().lock()),
    };
    let mut trace = TraceWriter::new(std::io::BufWriter::new(out));
    cpu.run(|cpu| trace.record(&Record::snapshot(cpu)))?;
    trace.finish()?;

    if args.diff {
        mem_diff(&init_mem, cpu.mem());
    }
    Ok(())
}
