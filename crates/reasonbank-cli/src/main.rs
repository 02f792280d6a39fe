//! `reasonbank-cli` – ReasonBank Command Line Interface
//!
//! This binary is the interactive front end of the memory engine.  It:
//!
//! 1. Checks for `~/.reasonbank/config.toml`; runs a **First-Run Wizard**
//!    when the file is absent.
//! 2. Probes the configured Ollama instance and reports available models.
//! 3. Drops the user into an **interactive REPL** with slash-commands
//!    (`/solve`, `/parallel`, `/sequential`, `/recall`, `/help`, …).
//! 4. Intercepts **Ctrl-C** to cancel in-flight scaling attempts and exit.

mod config;
mod engine;
mod ollama;
mod repl;

use colored::Colorize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use config::{LlmProvider, StoreBackend};

fn main() {
    // RUST_LOG filters, REASONBANK_LOG_FORMAT=json switches to JSON lines and
    // OTEL_EXPORTER_OTLP_ENDPOINT enables span export.  User-facing output
    // still goes through println!.
    let _tracing = reasonbank_runtime::init_tracing("reasonbank");

    print_banner();

    // ── Shared shutdown flag ──────────────────────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();

    // ── Ctrl-C handler ────────────────────────────────────────────────────
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – initiating graceful shutdown …".yellow().bold());
        cancel_clone.cancel();
        println!("{}", "  ✓ In-flight attempts cancelled.".green());
        println!("{}", "  ✓ Exiting ReasonBank.".green());
        shutdown_clone.store(true, Ordering::SeqCst);
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; graceful shutdown on Ctrl-C will not be available");
    }

    // ── First-Run Wizard ──────────────────────────────────────────────────
    let cfg = match config::load() {
        Ok(None) => run_first_run_wizard(),
        Ok(Some(cfg)) => {
            println!(
                "  Config loaded from {}",
                config::config_path().display().to_string().bold()
            );
            cfg
        }
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            config::Config::default()
        }
    };

    // ── Model server discovery ────────────────────────────────────────────
    if cfg.llm_provider == LlmProvider::Ollama {
        print!("\n  Probing Ollama at {} … ", cfg.llm_base_url.dimmed());
        match ollama::fetch_models(&cfg.llm_base_url) {
            Ok(models) => {
                println!("{} ({} model(s) available)", "online".green(), models.len());
                if !ollama::has_model(&models, &cfg.active_model) {
                    println!(
                        "  {} '{}' is not pulled yet.  Run `{}`.",
                        "Warning:".yellow(),
                        cfg.active_model,
                        format!("ollama pull {}", cfg.active_model).bold()
                    );
                }
            }
            Err(_) => {
                println!("{}", "offline".yellow());
                println!(
                    "  {}  Run `{}` to start a local model server.",
                    "No Ollama instance detected.".dimmed(),
                    "ollama serve".bold()
                );
            }
        }
    } else {
        println!("\n  Using hosted endpoint {}", cfg.llm_base_url.dimmed());
    }

    println!();
    println!(
        "  Type {} for a list of commands.\n",
        "/help".bold().cyan()
    );

    // ── Interactive REPL ──────────────────────────────────────────────────
    repl::run(shutdown, cancel);
}

// ─────────────────────────────────────────────────────────────────────────────
// First-Run Wizard
// ─────────────────────────────────────────────────────────────────────────────

fn run_first_run_wizard() -> config::Config {
    println!();
    println!("{}", "  ╔══════════════════════════════════════╗".bold().cyan());
    println!("{}", "  ║     ReasonBank First-Run Wizard      ║".bold().cyan());
    println!("{}", "  ╚══════════════════════════════════════╝".bold().cyan());
    println!();
    println!("  No configuration found.  Let's set up ReasonBank.\n");

    let mut cfg = config::Config::default();

    println!("  Which model provider would you like to use?");
    println!("    1) Local models via Ollama  (default, offline-first)");
    println!("    2) OpenAI-compatible hosted endpoint");
    let choice = prompt_line("  Enter choice [1]: ", "1");
    if choice.trim() == "2" {
        cfg.llm_provider = LlmProvider::OpenAI;
        cfg.llm_base_url = "https://api.openai.com".to_string();
        cfg.active_model = "gpt-4o-mini".to_string();
    }

    cfg.llm_base_url = prompt_line(&format!("  Base URL [{}]: ", cfg.llm_base_url), &cfg.llm_base_url);
    cfg.active_model = prompt_line(&format!("  Model [{}]: ", cfg.active_model), &cfg.active_model);
    if cfg.llm_provider == LlmProvider::OpenAI {
        cfg.api_key = prompt_line("  API key: ", "");
    }

    println!("  Where should memories be kept?");
    println!("    1) SQLite database  (default)");
    println!("    2) JSON file");
    println!("    3) In memory only (lost on exit)");
    cfg.store_backend = match prompt_line("  Enter choice [1]: ", "1").trim() {
        "2" => StoreBackend::Json,
        "3" => StoreBackend::Memory,
        _ => StoreBackend::Sqlite,
    };

    match config::save(&cfg) {
        Ok(()) => println!(
            "\n  {} Config saved to {}\n",
            "✓".green().bold(),
            config::config_path().display().to_string().bold()
        ),
        Err(e) => println!("{}: {}", "Error saving config".red(), e),
    }
    cfg
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#"   ___                          ___            __  "#.bold().cyan());
    println!("{}", r#"  / _ \___ ___ ____ ___  ___   / _ )___ ____  / /__"#.bold().cyan());
    println!("{}", r#" / , _/ -_) _ `(_-</ _ \/ _ \ / _  / _ `/ _ \/  '_/"#.bold().cyan());
    println!("{}", r#"/_/|_|\__/\_,_/___/\___/_//_//____/\_,_/_//_/_/\_\ "#.bold().cyan());
    println!();
    println!("  {} {}",
        "ReasonBank".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Memory that learns from every attempt");
    println!();
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn prompt_line(msg: &str, default: &str) -> String {
    use std::io::{BufRead, Write};
    print!("{}", msg);
    std::io::stdout().flush().ok();
    let mut line = String::new();
    match std::io::stdin().lock().read_line(&mut line) {
        Ok(_) => {
            let t = line.trim().to_string();
            if t.is_empty() { default.to_string() } else { t }
        }
        Err(_) => default.to_string(),
    }
}
