//! chainplugin CLI: inspect defaults and run the in-memory demo.
//!
//! Usage:
//! ```bash
//! chainplugin info
//! chainplugin demo
//! CHAINPLUGIN_LOG=debug chainplugin demo
//! ```

use std::env;
use std::process;

use chainplugin_runtime::ManagerConfig;

mod demo;
mod logging;

fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        process::exit(1);
    }

    let result = match args[1].as_str() {
        "info" => {
            cmd_info();
            Ok(())
        }
        "demo" => cmd_demo(),
        "version" | "--version" | "-V" => {
            println!("chainplugin {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {other}");
            print_usage();
            process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn print_usage() {
    println!("chainplugin {}", env!("CARGO_PKG_VERSION"));
    println!("Middleware-based plugins for chain commits, reverts and reorgs\n");
    println!("USAGE:");
    println!("    chainplugin <COMMAND>\n");
    println!("COMMANDS:");
    println!("    info     Show ChainPlugin defaults");
    println!("    demo     Run two plugins against an in-memory chain");
    println!("    version  Print version");
    println!("    help     Print this help");
}

fn cmd_info() {
    let config = ManagerConfig::default();
    println!("ChainPlugin v{}", env!("CARGO_PKG_VERSION"));
    println!("  Default chain label: {}", config.chain);
    println!("  Default backfill batch size: {} blocks/call", config.backfill_batch_size);
    println!("  Reject start ahead of head: {}", config.reject_start_ahead_of_head);
    println!("  Dedup live after backfill: {}", config.dedup_live_after_backfill);
    println!("  Notification kinds: commit, revert, reorg");
    println!("  Sources: in-memory (MemoryChain), custom NotificationSource");
}

fn cmd_demo() -> anyhow::Result<()> {
    logging::init_tracing(&logging::LogConfig::from_env())?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(demo::run())
}
