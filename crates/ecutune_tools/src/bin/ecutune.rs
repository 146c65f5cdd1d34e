#![forbid(unsafe_code)]

use std::env;
use std::io::{self, IsTerminal};

use ecutune_kernel_contracts::session::{ApplySessionId, ApplyToken};
use ecutune_os::config::OrchestratorConfig;
use ecutune_tools::workbench_cli::{engine_connected, execute_command, parse_command, Workbench};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

fn main() {
    if let Err(err) = run() {
        eprintln!("{err}");
        std::process::exit(2);
    }
}

fn run() -> Result<(), String> {
    let filter = env::var("RUST_LOG")
        .ok()
        .and_then(|raw| EnvFilter::try_new(raw).ok())
        .unwrap_or_else(|| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(io::stderr),
        )
        .init();

    let mut args: Vec<String> = env::args().skip(1).collect();
    let assume_yes = args.iter().any(|a| a == "--yes");
    args.retain(|a| a != "--yes");
    let command = parse_command(&args)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| e.to_string())?;
    // Monitor tasks need a live runtime context while commands run.
    let _guard = runtime.enter();
    let bench = Workbench::new(OrchestratorConfig::from_env(), runtime.handle().clone())?;

    let mut confirm = |session_id: ApplySessionId, token: &ApplyToken| {
        confirm_token(session_id, token, assume_yes)
    };
    let output = execute_command(&bench, command, &mut confirm)?;
    println!("{output}");
    if !engine_connected(&bench) {
        eprintln!("warning: engine is no longer connected");
    }
    Ok(())
}

fn confirm_token(
    session_id: ApplySessionId,
    token: &ApplyToken,
    assume_yes: bool,
) -> Result<String, String> {
    eprintln!("session {session_id} apply token: {}", token.as_str());
    if assume_yes {
        return Ok(token.as_str().to_string());
    }
    if !io::stdin().is_terminal() {
        return Err("write commands need a terminal to confirm, or --yes".to_string());
    }
    let prompt = format!("Re-enter the apply token to arm session {session_id}:");
    let typed = rpassword::prompt_password(prompt).map_err(|e| e.to_string())?;
    if typed.trim().is_empty() {
        return Err("apply token must not be empty".to_string());
    }
    Ok(typed)
}
