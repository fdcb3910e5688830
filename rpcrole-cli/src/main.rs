/*!
Scan every running process for RPC runtime usage and print one JSON
record per classified process on stdout. Diagnostics go to stderr
through the logger so the output stream stays machine-readable.
*/

use clap::{ArgAction, Parser};
use log::LevelFilter;

#[derive(Parser)]
#[command(name = "rpcrole")]
#[command(about = "Classify running processes as RPC clients, servers or both")]
struct Cli {
    /// Activate verbose mode (-v, -vv for additional levels)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

#[cfg(windows)]
fn run() -> rpcrole::error::Result<()> {
    use rpcrole::native::{enable_debug_privilege, processes, Win32Opener};
    use rpcrole::scan::Scanner;

    // without the debug privilege the scan still works against
    // processes of the current user; everything else is skipped
    if let Err(err) = enable_debug_privilege() {
        log::warn!("{}; scanning with current rights only", err);
    }

    let procs = processes()?;
    log::info!("scanning {} processes", procs.len());

    let mut opener = Win32Opener;
    Scanner::new().scan(&mut opener, &procs, |record| {
        match serde_json::to_string(&record) {
            Ok(line) => println!("{}", line),
            Err(err) => log::warn!("pid {}: could not serialize record: {}", record.pid, err),
        }
    });

    Ok(())
}

fn main() {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::new().filter_level(level).init();

    #[cfg(windows)]
    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    #[cfg(not(windows))]
    {
        eprintln!("rpcrole reads live process memory through the windows api; this host is not supported");
        std::process::exit(1);
    }
}
