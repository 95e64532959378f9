//! kvmfork benchmark runner.
//!
//! Boots a guest binary, prepares it as a copy-on-write master, then forks
//! it and times repeated calls into one guest function.
//!
//! This binary requires Linux with KVM support. It will not run on other
//! platforms.

use clap::Parser;
use std::process::ExitCode;

fn parse_address(s: &str) -> Result<u64, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid address {s:?}: {e}"))
}

#[derive(Parser, Debug)]
#[command(name = "kvmfork")]
#[command(about = "Boot a guest under KVM and benchmark copy-on-write forks of it")]
struct Args {
    /// Path to the guest binary (static ELF64 or flat image)
    binary: String,

    /// Guest memory size in megabytes
    #[arg(short, long, default_value = "64")]
    memory: u64,

    /// Working memory per fork in megabytes (0 = unlimited)
    #[arg(long, default_value = "0")]
    cow_memory: u64,

    /// Working memory kept by the master in megabytes (0 = flatten it)
    #[arg(long, default_value = "0")]
    master_memory: u64,

    /// Guest address from which memory stays shared between forks
    #[arg(long, value_parser = parse_address, default_value = "0")]
    shared_boundary: u64,

    /// Guest function to call (defaults to the entry point)
    #[arg(short, long, value_parser = parse_address)]
    function: Option<u64>,

    /// Integer arguments passed to the function
    #[arg(short, long, value_parser = parse_address)]
    arg: Vec<u64>,

    /// Number of forks
    #[arg(long, default_value = "1")]
    forks: usize,

    /// Calls per fork, with a reset in between
    #[arg(long, default_value = "100")]
    calls: usize,

    /// Per-call timeout in milliseconds (0 = none)
    #[arg(long, default_value = "1000")]
    timeout_ms: u64,

    /// Map the heap with 4KB pages only
    #[arg(long)]
    split_hugepages: bool,

    /// Log page tables and the exception table
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    if let Err(e) = run(args) {
        eprintln!("Error: {e}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

#[cfg(target_os = "linux")]
fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    use kvmfork::{kvm, CallArg, Machine, MachineOptions};
    use std::time::{Duration, Instant};

    kvm::init()?;

    let binary = kvmfork::load_file(&args.binary)?;
    let options = MachineOptions {
        max_mem: args.memory << 20,
        max_cow_mem: args.cow_memory << 20,
        shared_memory_boundary: args.shared_boundary,
        split_hugepages: args.split_hugepages,
        verbose: args.verbose,
        ..Default::default()
    };
    let timeout = (args.timeout_ms > 0).then(|| Duration::from_millis(args.timeout_ms));
    let function = args.function.unwrap_or(binary.entry);
    let call_args: Vec<CallArg> = args.arg.iter().copied().map(CallArg::Int).collect();

    let started = Instant::now();
    let mut master = Machine::new(&binary, options.clone())?;
    tracing::info!(elapsed = ?started.elapsed(), "master created");

    if args.verbose {
        println!("{}", master.print_exception_handlers()?);
    }

    let status = master.vmcall(function, &call_args, timeout)?;
    println!("master call: {status:?}");

    master.prepare_copy_on_write(args.master_memory << 20, options.shared_memory_boundary)?;

    let mut total = Duration::ZERO;
    let mut faults = 0;
    for i in 0..args.forks {
        let started = Instant::now();
        let mut fork = master.fork(&options)?;
        let fork_time = started.elapsed();

        for _ in 0..args.calls {
            let started = Instant::now();
            let status = fork.vmcall(function, &call_args, timeout)?;
            total += started.elapsed();
            faults += fork.cow_faults();
            if status.return_value().is_none() {
                println!("fork {i}: {status:?}");
            }
            fork.reset_to(&master)?;
        }
        tracing::debug!(fork = i, ?fork_time, banks = fork.bank_count(), "fork done");
    }

    let calls = (args.forks * args.calls).max(1) as u32;
    println!(
        "{} calls, {:?} per call, {:.1} copy-on-write faults per call",
        args.forks * args.calls,
        total / calls,
        faults as f64 / f64::from(calls)
    );

    kvm::teardown();
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn run(_args: Args) -> Result<(), Box<dyn std::error::Error>> {
    Err("kvmfork requires Linux with KVM support".into())
}
