//! ledger-runner: headless runner for the risk ledger.
//!
//! Usage:
//!   ledger-runner --seed 12345 --ticks 168 --db ledger.db
//!   ledger-runner --seed 12345 --ipc-mode < commands.jsonl

use anyhow::Result;
use riskledger_core::{
    command::{CommandResponse, LedgerCommand},
    config::LedgerConfig,
    engine::LedgerEngine,
    error::ErrorKind,
    store::LedgerStore,
};
use std::env;
use std::io::{self, BufRead, Write};

fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let seed = parse_arg(&args, "--seed", 42u64);
    let ticks = parse_arg(&args, "--ticks", 24u64);
    let ipc_mode = args.iter().any(|a| a == "--ipc-mode");
    let db = string_arg(&args, "--db").unwrap_or(":memory:");
    let data_dir = string_arg(&args, "--data-dir").unwrap_or("./data");

    if !ipc_mode {
        println!("ledger-runner");
        println!("  seed:      {seed}");
        println!("  ticks:     {ticks}");
        println!("  db:        {db}");
        println!("  data_dir:  {data_dir}");
        println!();
    }

    // Workers open their own connections, so :memory: becomes a named
    // shared-memory database they can all reach.
    let run_id = format!("run-{seed}-{}", uuid::Uuid::new_v4().simple());
    let store = if db == ":memory:" {
        LedgerStore::shared_memory(&run_id)?
    } else {
        LedgerStore::open(db)?
    };
    let config = LedgerConfig::load(data_dir)?;
    let mut engine = LedgerEngine::build(run_id, seed, config, store)?;
    log::info!("catalog: {:?}", engine.catalog);

    if ipc_mode {
        run_ipc_loop(&mut engine)?;
    } else {
        engine.run_ticks(ticks)?;
        print_summary(&engine)?;
    }

    Ok(())
}

fn run_ipc_loop(engine: &mut LedgerEngine) -> Result<()> {
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    let mut handle = stdin.lock();
    let mut buffer = String::new();

    loop {
        buffer.clear();
        let bytes_read = handle.read_line(&mut buffer)?;
        if bytes_read == 0 {
            break; // EOF
        }
        if buffer.trim().is_empty() {
            continue;
        }

        let cmd = match LedgerCommand::parse_line(&buffer) {
            Ok(c) => c,
            Err(e) => {
                // Out-of-set values report as Validation; broken JSON as Parse.
                let kind = match e.kind() {
                    ErrorKind::Validation => "Validation".to_string(),
                    _ => "Parse".to_string(),
                };
                let response = CommandResponse::Error {
                    kind,
                    message: e.to_string(),
                };
                writeln!(stdout, "{}", serde_json::to_string(&response)?)?;
                stdout.flush()?;
                continue;
            }
        };

        let quit = matches!(cmd, LedgerCommand::Quit);
        let response = engine.execute(cmd)?;
        writeln!(stdout, "{}", serde_json::to_string(&response)?)?;
        stdout.flush()?;
        if quit || matches!(response, CommandResponse::Bye) {
            break;
        }
    }
    Ok(())
}

fn print_summary(engine: &LedgerEngine) -> Result<()> {
    let summary = engine.summary()?;

    println!("=== RUN SUMMARY ===");
    println!("  run_id:          {}", summary.run_id);
    println!("  final tick:      {}", summary.tick);
    println!("  clock:           {}", summary.now);
    println!("  users:           {}", summary.users);
    println!("  invoices issued: {}", summary.invoices_issued);
    println!("  alerts raised:   {}", summary.alerts_raised);
    println!();
    println!("=== NOTIFICATIONS ===");
    for (status, count) in &summary.notifications {
        println!("  {status:<10} {count}");
    }
    Ok(())
}

fn string_arg<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.windows(2)
        .find(|w| w[0] == flag)
        .map(|w| w[1].as_str())
}

fn parse_arg<T: std::str::FromStr + Copy>(args: &[String], flag: &str, default: T) -> T {
    args.windows(2)
        .find(|w| w[0] == flag)
        .and_then(|w| w[1].parse().ok())
        .unwrap_or(default)
}
