use std::process;

use clap::Parser;

use gengc_runtime::{formatted_size, FatalError, GcError, Timer, Vm, GENERATIONS};

mod flags;
mod workload;

fn main() {
    process::exit(start());
}

fn start() -> i32 {
    let cli = flags::Cli::parse();
    init_logging(&cli.gc);

    let gc_flags = match cli.gc.to_gc_flags() {
        Ok(flags) => flags,
        Err(err) => {
            eprintln!("{}", err);
            return 1;
        }
    };

    let gc_stats = gc_flags.gc_stats;

    let vm = match Vm::new(gc_flags) {
        Ok(vm) => vm,
        Err(err) => {
            eprintln!("{}", err);
            return 1;
        }
    };

    let mut timer = Timer::start();
    let report = match workload::run(&vm, &cli.workload) {
        Ok(report) => report,
        Err(GcError::OutOfMemory { requested }) => {
            log::error!("allocation of {} failed", formatted_size(requested));
            vm.gc.fatal(&*vm, FatalError::HeapExhausted)
        }
        Err(err) => {
            eprintln!("{}", err);
            return 1;
        }
    };
    let runtime = timer.stop();

    let stats = vm.gc.heap_stats();
    let collections: Vec<String> = (0..GENERATIONS)
        .map(|generation| vm.gc.collection_count(generation).to_string())
        .collect();

    println!(
        "{} allocations ({} large), {} finalized, {} verifications in {:.1}ms",
        report.allocations, report.large_allocations, report.finalized, report.verified, runtime
    );
    println!(
        "{} collections (per generation {}), heap in use {}",
        vm.gc.gc_index(),
        collections.join("/"),
        formatted_size(stats.total_used())
    );

    if gc_stats {
        vm.gc.dump_summary(runtime);
    }

    0
}

fn init_logging(flags: &flags::CollectorFlags) {
    let level = if flags.gc_dev_verbose {
        log::LevelFilter::Debug
    } else if flags.gc_verbose {
        log::LevelFilter::Info
    } else {
        log::LevelFilter::Warn
    };

    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();
}
