//! REPL – Read-Eval-Print Loop for the ReasonBank interactive shell.
//!
//! Supported slash-commands:
//!   /help                      – show this list
//!   /settings                  – interactively edit `~/.reasonbank/config.toml`
//!   /models                    – list / switch the active model
//!   /stats                     – pool size and engine configuration
//!   /recall <k> <query>        – show the k most relevant memory items
//!   /add <query>               – paste a trajectory and consolidate it
//!   /solve <query>             – retrieve, execute once, consolidate
//!   /parallel <k> <query>      – parallel self-contrast scaling
//!   /sequential <k> <query>    – sequential self-refinement scaling
//!   /quit | /exit              – gracefully exit the CLI

use colored::{ColoredString, Colorize};
use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use reasonbank_runtime::{ExecutorError, MattsEngine};
use reasonbank_types::{BankError, MemoryItem, MemoryRecord, Outcome, ScalingResult};
use tokio_util::sync::CancellationToken;

use crate::config::{self, Config, LlmProvider, StoreBackend};
use crate::{engine, ollama};

/// A parsed slash-command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    Settings,
    Models,
    Stats,
    Recall { k: usize, query: String },
    Add { query: String },
    Solve { query: String },
    Parallel { k: usize, query: String },
    Sequential { k: usize, query: String },
    Quit,
}

/// Parse one input line.  The error is a user-facing message.
pub fn parse_command(line: &str) -> Result<Command, String> {
    let line = line.trim();
    let (name, rest) = line
        .split_once(char::is_whitespace)
        .map(|(n, r)| (n, r.trim()))
        .unwrap_or((line, ""));

    match name {
        "/help" => Ok(Command::Help),
        "/settings" => Ok(Command::Settings),
        "/models" => Ok(Command::Models),
        "/stats" => Ok(Command::Stats),
        "/quit" | "/exit" => Ok(Command::Quit),
        "/recall" => {
            parse_k_and_query(rest, "/recall <k> <query>").map(|(k, query)| Command::Recall { k, query })
        }
        "/parallel" => parse_k_and_query(rest, "/parallel <k> <query>")
            .map(|(k, query)| Command::Parallel { k, query }),
        "/sequential" => parse_k_and_query(rest, "/sequential <k> <query>")
            .map(|(k, query)| Command::Sequential { k, query }),
        "/add" => require_query(rest, "/add <query>").map(|query| Command::Add { query }),
        "/solve" => require_query(rest, "/solve <query>").map(|query| Command::Solve { query }),
        other => Err(format!("Unknown command: '{other}'")),
    }
}

fn require_query(rest: &str, usage: &str) -> Result<String, String> {
    if rest.is_empty() {
        Err(format!("Usage: {usage}"))
    } else {
        Ok(rest.to_string())
    }
}

fn parse_k_and_query(rest: &str, usage: &str) -> Result<(usize, String), String> {
    let (k_raw, query) = rest
        .split_once(char::is_whitespace)
        .ok_or_else(|| format!("Usage: {usage}"))?;
    let k = match k_raw.parse::<usize>() {
        Ok(k) if k >= 1 => k,
        _ => return Err(format!("'{k_raw}' is not a positive integer. Usage: {usage}")),
    };
    Ok((k, require_query(query.trim(), usage)?))
}

/// Read trajectory lines until a blank line or EOF.
fn read_trajectory<R: BufRead>(reader: R) -> String {
    let mut lines = Vec::new();
    for line in reader.lines() {
        let Ok(line) = line else { break };
        if line.trim().is_empty() {
            break;
        }
        lines.push(line);
    }
    lines.join("\n")
}

/// First `max` characters of `text` on one line, with an ellipsis when cut.
fn preview(text: &str, max: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max {
        flat
    } else {
        let cut: String = flat.chars().take(max).collect();
        format!("{cut}…")
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Session
// ─────────────────────────────────────────────────────────────────────────────

/// REPL state: the loaded config, a Tokio runtime and the lazily built
/// engine.  Editing settings drops the engine so the next command rebuilds
/// it.
struct Session {
    cfg: Config,
    runtime: tokio::runtime::Runtime,
    engine: Option<Arc<MattsEngine>>,
    cancel: CancellationToken,
}

impl Session {
    fn engine(&mut self) -> Option<Arc<MattsEngine>> {
        if self.engine.is_none() {
            match engine::build(&self.cfg) {
                Ok(e) => self.engine = Some(Arc::new(e)),
                Err(e) => {
                    println!("{}: {}", "Engine error".red(), e);
                    return None;
                }
            }
        }
        self.engine.clone()
    }

    fn reload(&mut self, cfg: Config) {
        self.cfg = cfg;
        self.engine = None;
    }
}

/// Entry point for the interactive REPL.
///
/// `shutdown` is polled each iteration; when set the REPL exits cleanly.
/// `cancel` fires on Ctrl-C and aborts in-flight scaling attempts.
pub fn run(shutdown: Arc<AtomicBool>, cancel: CancellationToken) {
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("{}: {}", "Failed to start async runtime".red(), e);
            return;
        }
    };
    let mut session = Session {
        cfg: load_config_or_default(),
        runtime,
        engine: None,
        cancel,
    };

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        print!("{} ", "reasonbank>".bold().cyan());
        stdout.flush().ok();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break, // EOF
            Ok(_) => {}
            Err(e) => {
                eprintln!("{}: {}", "Read error".red(), e);
                break;
            }
        }

        if line.trim().is_empty() {
            continue;
        }

        match parse_command(&line) {
            Ok(Command::Help) => cmd_help(),
            Ok(Command::Settings) => cmd_settings(&mut session),
            Ok(Command::Models) => cmd_models(&mut session),
            Ok(Command::Stats) => cmd_stats(&mut session),
            Ok(Command::Recall { k, query }) => cmd_recall(&mut session, k, &query),
            Ok(Command::Add { query }) => cmd_add(&mut session, &query),
            Ok(Command::Solve { query }) => cmd_solve(&mut session, &query),
            Ok(Command::Parallel { k, query }) => cmd_parallel(&mut session, k, &query),
            Ok(Command::Sequential { k, query }) => cmd_sequential(&mut session, k, &query),
            Ok(Command::Quit) => {
                println!("{}", "Goodbye.".green());
                shutdown.store(true, Ordering::SeqCst);
                break;
            }
            Err(msg) => {
                println!(
                    "{} Type {} for available commands.",
                    msg.red(),
                    "/help".bold()
                );
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Command handlers
// ─────────────────────────────────────────────────────────────────────────────

fn cmd_help() {
    println!();
    println!("{}", "ReasonBank Commands".bold().underline());
    println!("  {}                 – edit ~/.reasonbank/config.toml", "/settings".bold().cyan());
    println!("  {}                   – list and switch models", "/models".bold().cyan());
    println!("  {}                    – pool size and engine settings", "/stats".bold().cyan());
    println!("  {}       – show the k most relevant memories", "/recall <k> <query>".bold().cyan());
    println!("  {}             – paste a trajectory (end with a blank line)", "/add <query>".bold().cyan());
    println!("  {}           – retrieve, execute once, learn", "/solve <query>".bold().cyan());
    println!("  {}     – k parallel attempts, self-contrast", "/parallel <k> <query>".bold().cyan());
    println!("  {}   – up to k self-refining attempts", "/sequential <k> <query>".bold().cyan());
    println!("  {}              – exit the CLI", "/quit  /exit".bold().cyan());
    println!();
}

fn cmd_settings(session: &mut Session) {
    let mut cfg = session.cfg.clone();

    println!("{}", "Settings Editor".bold().underline());
    println!("  (press Enter to keep the current value)");

    let provider = prompt_str(
        &format!("  LLM provider  [{}] (ollama / openai): ", cfg.llm_provider),
        &cfg.llm_provider.to_string(),
    );
    cfg.llm_provider = match provider.to_lowercase().as_str() {
        "openai" => LlmProvider::OpenAI,
        _ => LlmProvider::Ollama,
    };

    cfg.llm_base_url = prompt_str(&format!("  LLM base URL  [{}]: ", cfg.llm_base_url), &cfg.llm_base_url);
    cfg.active_model = prompt_str(&format!("  Active model  [{}]: ", cfg.active_model), &cfg.active_model);

    if cfg.llm_provider == LlmProvider::OpenAI {
        let shown = if cfg.api_key.is_empty() { "not set" } else { "set" };
        cfg.api_key = prompt_str(&format!("  API key       [{shown}]: "), &cfg.api_key);
    }

    let backend = prompt_str(
        &format!("  Store backend [{}] (sqlite / json / memory): ", cfg.store_backend),
        &cfg.store_backend.to_string(),
    );
    match backend.parse::<StoreBackend>() {
        Ok(b) => cfg.store_backend = b,
        Err(e) => println!("  {} {}, keeping {}", "Warning:".yellow(), e, cfg.store_backend),
    }

    cfg.retrieve_k = prompt_usize(&format!("  Retrieve k    [{}]: ", cfg.retrieve_k), cfg.retrieve_k);

    match config::save(&cfg) {
        Ok(()) => println!(
            "{} {}",
            "✓ Settings saved to".green(),
            config::config_path().display().to_string().bold()
        ),
        Err(e) => println!("{}: {}", "Error saving config".red(), e),
    }
    session.reload(cfg);
}

fn cmd_models(session: &mut Session) {
    let cfg = session.cfg.clone();

    println!("{}", "Models".bold().underline());
    println!("  Active model    : {}", cfg.active_model.yellow());
    println!("  Embedding       : {} ({})", cfg.embedding_backend.to_string().yellow(), cfg.embedding_model);

    if cfg.llm_provider != LlmProvider::Ollama {
        println!("  Provider: {}", cfg.llm_provider.to_string().yellow());
        println!("  (Hosted model names are set via /settings.)");
        return;
    }

    print!("  Probing Ollama at {} … ", cfg.llm_base_url.dimmed());
    io::stdout().flush().ok();

    match ollama::fetch_models(&cfg.llm_base_url) {
        Ok(models) if models.is_empty() => {
            println!("{}", "no models found".yellow());
            println!("  Run `ollama pull {}` to download a model.", cfg.active_model);
        }
        Ok(models) => {
            println!("{}", "online".green());
            println!("  Available local models:");
            for m in &models {
                let marker = if ollama::has_model(std::slice::from_ref(m), &cfg.active_model) {
                    "▶"
                } else {
                    " "
                };
                println!("    {} {}", marker.green(), m.name.bold());
            }

            let new_model = prompt_str(
                &format!("  Switch to model [{}]: ", cfg.active_model),
                &cfg.active_model,
            );
            if new_model == cfg.active_model {
                return;
            }
            if !ollama::has_model(&models, &new_model) {
                println!("{} '{}'", "Unknown model:".red(), new_model.yellow());
                return;
            }
            let mut new_cfg = cfg;
            new_cfg.active_model = new_model.clone();
            match config::save(&new_cfg) {
                Ok(()) => println!("{} {}", "✓ Active model set to".green(), new_model.bold()),
                Err(e) => println!("{}: {}", "Error saving config".red(), e),
            }
            session.reload(new_cfg);
        }
        Err(e) => {
            println!("{}", "offline".red());
            println!("  {}", e.dimmed());
            println!("  Is Ollama running?  Try: ollama serve");
        }
    }
}

fn cmd_stats(session: &mut Session) {
    let Some(engine) = session.engine() else { return };
    let cfg = &session.cfg;

    println!("{}", "Memory Bank".bold().underline());
    println!("  Store           : {}", cfg.store_backend.to_string().yellow());
    if cfg.store_backend != StoreBackend::Memory {
        println!("  Location        : {}", cfg.resolved_store_path().display());
    }
    match session.runtime.block_on(engine.bank().record_count()) {
        Ok(n) => println!("  Records         : {}", n.to_string().bold()),
        Err(e) => println!("  Records         : {} {}", "unavailable".red(), e),
    }
    println!("  Embedding model : {}", engine.bank().embedder().model_name());
    if let Some(dim) = engine.bank().embedder().dimension() {
        println!("  Dimension       : {dim}");
    }
    println!("  Dedup           : {:?}", cfg.dedup);
    println!("  Retrieve k      : {}", engine.config().prior_k);
    println!("  Branch timeout  : {}s", engine.config().branch_timeout.as_secs());
    println!("  Synthesis       : {}", if engine.config().synthesize { "on" } else { "off" });
}

fn cmd_recall(session: &mut Session, k: usize, query: &str) {
    let Some(engine) = session.engine() else { return };
    match session.runtime.block_on(engine.bank().retrieve_memories(query, k)) {
        Ok(items) if items.is_empty() => println!("  {}", "No memories yet.".dimmed()),
        Ok(items) => print_items(&items),
        Err(e) => println!("{}: {}", "Recall failed".red(), e),
    }
}

fn cmd_add(session: &mut Session, query: &str) {
    let Some(engine) = session.engine() else { return };
    println!("  Paste the trajectory; finish with an empty line.");
    let trajectory = read_trajectory(io::stdin().lock());
    if trajectory.is_empty() {
        println!("  {}", "Empty trajectory, nothing added.".yellow());
        return;
    }
    match session.runtime.block_on(engine.bank().add_experience(&trajectory, query)) {
        Ok(record) => print_record(&record),
        Err(e) => println!("{}: {}", "Consolidation failed".red(), e),
    }
}

fn cmd_solve(session: &mut Session, query: &str) {
    let Some(engine) = session.engine() else { return };
    let retrieve_k = session.cfg.retrieve_k;

    match session.runtime.block_on(solve_once(&engine, query, retrieve_k)) {
        Ok(Ok(record)) => print_record(&record),
        Ok(Err(e)) => println!("{}: {}", "Execution failed".red(), e),
        Err(e) => println!("{}: {}", "Memory engine error".red(), e),
    }
}

/// Retrieve, execute once and consolidate.  The inner error is the
/// executor's; nothing is stored when it fails.
async fn solve_once(
    engine: &MattsEngine,
    query: &str,
    retrieve_k: usize,
) -> Result<Result<MemoryRecord, ExecutorError>, BankError> {
    let prior = if retrieve_k > 0 {
        engine.bank().retrieve_memories(query, retrieve_k).await?
    } else {
        Vec::new()
    };
    if !prior.is_empty() {
        println!("  Using {} prior memory item(s):", prior.len());
        print_items(&prior);
    }
    let trajectory = match engine.execute(query, &prior, None).await {
        Ok(t) => t,
        Err(e) => return Ok(Err(e)),
    };
    println!("{}", "Trajectory".bold().underline());
    println!("{trajectory}");
    let record = engine.bank().add_experience(&trajectory, query).await?;
    Ok(Ok(record))
}

fn cmd_parallel(session: &mut Session, k: usize, query: &str) {
    let Some(engine) = session.engine() else { return };
    println!("  Running {} parallel attempt(s) …", k);
    let cancel = session.cancel.child_token();
    match session
        .runtime
        .block_on(engine.parallel_scaling_with_cancel(query, k, cancel))
    {
        Ok(result) => print_scaling(&result, "Chosen"),
        Err(e) => println!("{}: {}", "Parallel scaling failed".red(), e),
    }
}

fn cmd_sequential(session: &mut Session, k: usize, query: &str) {
    let Some(engine) = session.engine() else { return };
    println!("  Running up to {} sequential attempt(s) …", k);
    let cancel = session.cancel.child_token();
    match session
        .runtime
        .block_on(engine.sequential_scaling_with_cancel(query, k, cancel))
    {
        Ok(result) => print_scaling(&result, "Final"),
        Err(e) => println!("{}: {}", "Sequential scaling failed".red(), e),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Output
// ─────────────────────────────────────────────────────────────────────────────

fn outcome_label(outcome: Outcome) -> ColoredString {
    match outcome {
        Outcome::Success => outcome.as_str().green().bold(),
        Outcome::Failure => outcome.as_str().red().bold(),
        Outcome::Unknown => outcome.as_str().yellow(),
    }
}

fn print_items(items: &[MemoryItem]) {
    for (i, item) in items.iter().enumerate() {
        println!("  {}. {}", i + 1, item.title.bold());
        println!("     {}", item.description.dimmed());
        println!("     {}", preview(&item.content, 160));
    }
}

fn print_record(record: &MemoryRecord) {
    println!("  Outcome : {}", outcome_label(record.outcome));
    if record.items.is_empty() {
        println!("  {}", "No memory items distilled; nothing stored.".dimmed());
    } else {
        println!("  Stored {} item(s) as record {}:", record.items.len(), record.id.to_string().dimmed());
        print_items(&record.items);
    }
}

fn print_scaling(result: &ScalingResult, chosen_label: &str) {
    println!("{}", "Attempts".bold().underline());
    for (i, (trajectory, outcome)) in result.trajectories.iter().zip(&result.outcomes).enumerate() {
        println!("  #{} [{}] {}", i + 1, outcome_label(*outcome), preview(trajectory, 100));
    }
    println!(
        "{} ({})",
        chosen_label.bold().underline(),
        outcome_label(result.chosen_outcome)
    );
    println!("{}", result.chosen_or_final);
    if result.items.is_empty() {
        println!("  {}", "No memory items distilled.".dimmed());
    } else {
        println!("{}", "Learned".bold().underline());
        print_items(&result.items);
    }
    if let Some(answer) = &result.synthesized_answer {
        println!("{}", "Answer".bold().underline());
        println!("{answer}");
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn load_config_or_default() -> Config {
    match config::load() {
        Ok(Some(c)) => c,
        Ok(None) => Config::default(),
        Err(e) => {
            println!("{}: {} – using defaults", "Config error".red(), e);
            Config::default()
        }
    }
}

/// Prompt for a positive integer.  Returns `default` on Enter or bad input.
fn prompt_usize(msg: &str, default: usize) -> usize {
    let raw = prompt_str(msg, &default.to_string());
    match raw.parse::<usize>() {
        Ok(v) if v >= 1 => v,
        _ => {
            println!(
                "  {} '{}' is not a positive integer, keeping {}",
                "Warning:".yellow(),
                raw,
                default
            );
            default
        }
    }
}

/// Prompt for a string value.  Returns `default` when the user presses Enter.
fn prompt_str(msg: &str, default: &str) -> String {
    print!("{}", msg);
    io::stdout().flush().ok();

    let mut line = String::new();
    match io::stdin().lock().read_line(&mut line) {
        Ok(_) => {
            let trimmed = line.trim().to_string();
            if trimmed.is_empty() {
                default.to_string()
            } else {
                trimmed
            }
        }
        Err(_) => default.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── parse_command ────────────────────────────────────────────────────────

    #[test]
    fn bare_commands_parse() {
        assert_eq!(parse_command("/help"), Ok(Command::Help));
        assert_eq!(parse_command("  /stats  "), Ok(Command::Stats));
        assert_eq!(parse_command("/exit"), Ok(Command::Quit));
        assert_eq!(parse_command("/quit\n"), Ok(Command::Quit));
    }

    #[test]
    fn k_and_query_commands_parse() {
        assert_eq!(
            parse_command("/parallel 3 find the cheapest flight"),
            Ok(Command::Parallel {
                k: 3,
                query: "find the cheapest flight".into()
            })
        );
        assert_eq!(
            parse_command("/recall 2   login page"),
            Ok(Command::Recall {
                k: 2,
                query: "login page".into()
            })
        );
        assert_eq!(
            parse_command("/sequential 1 q"),
            Ok(Command::Sequential { k: 1, query: "q".into() })
        );
    }

    #[test]
    fn invalid_k_is_reported() {
        let err = parse_command("/parallel 0 q").unwrap_err();
        assert!(err.contains("positive integer"), "{err}");
        let err = parse_command("/recall many q").unwrap_err();
        assert!(err.contains("'many'"), "{err}");
        assert!(parse_command("/sequential 2").unwrap_err().starts_with("Usage"));
        assert!(parse_command("/parallel").unwrap_err().starts_with("Usage"));
    }

    #[test]
    fn query_commands_require_a_query() {
        assert_eq!(
            parse_command("/solve what is 2+2"),
            Ok(Command::Solve { query: "what is 2+2".into() })
        );
        assert_eq!(parse_command("/add q"), Ok(Command::Add { query: "q".into() }));
        assert!(parse_command("/solve").is_err());
        assert!(parse_command("/add   ").is_err());
    }

    #[test]
    fn unknown_command_is_named() {
        assert_eq!(parse_command("/start"), Err("Unknown command: '/start'".into()));
    }

    // ── helpers ──────────────────────────────────────────────────────────────

    #[test]
    fn read_trajectory_stops_at_blank_line() {
        let input = io::Cursor::new("clicked login\nsaw error\n\nnext command\n");
        assert_eq!(read_trajectory(input), "clicked login\nsaw error");
    }

    #[test]
    fn read_trajectory_accepts_eof() {
        assert_eq!(read_trajectory(io::Cursor::new("one line")), "one line");
        assert_eq!(read_trajectory(io::Cursor::new("")), "");
    }

    #[test]
    fn preview_flattens_and_truncates() {
        assert_eq!(preview("a\n  b", 10), "a b");
        assert_eq!(preview("abcdef", 3), "abc…");
        assert_eq!(preview("héllo", 5), "héllo");
    }
}
