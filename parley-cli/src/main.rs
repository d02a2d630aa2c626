//! parley-cli - operator frontend for a running Parley server
//!
//! # Subcommands
//! - `upload <file>`                          - import a pdf/txt/docx document
//! - `index [--index <name>] [--batch <n>]`   - index pending uploads
//! - `chat -c <id> <message> [--no-stream]`   - ask a question, answer to stdout
//! - `prompt set <text>` / `prompt show`      - manage the answer instruction
//! - `history -c <id> [-n <limit>]`           - print recent turns
//! - `status`                                 - show server health

use std::io::Write;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde::Deserialize;

const DEFAULT_SERVER: &str = "http://127.0.0.1:8080";

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Debug, Parser)]
#[command(name = "parley-cli", version, about = "Parley document assistant CLI")]
struct Cli {
    /// Parley HTTP server URL (overrides PARLEY_HTTP_URL env var)
    #[arg(long, env = "PARLEY_HTTP_URL", default_value = DEFAULT_SERVER)]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Upload a document (pdf, txt or docx)
    Upload {
        file: PathBuf,
    },

    /// Index documents uploaded since the last run
    Index {
        /// Target index (server default when omitted)
        #[arg(long)]
        index: Option<String>,

        /// Maximum number of documents in this run
        #[arg(long)]
        batch: Option<usize>,
    },

    /// Ask a question in a conversation
    Chat {
        #[arg(short = 'c', long, default_value = "cli")]
        conversation: String,

        message: String,

        /// Wait for the whole answer instead of streaming it
        #[arg(long)]
        no_stream: bool,
    },

    /// Show or replace the answer instruction
    Prompt {
        #[command(subcommand)]
        action: PromptAction,
    },

    /// Print the most recent turns of a conversation
    History {
        #[arg(short = 'c', long, default_value = "cli")]
        conversation: String,

        #[arg(short = 'n', long, default_value_t = 20)]
        limit: usize,
    },

    /// Show Parley server status
    Status,
}

#[derive(Debug, Subcommand)]
enum PromptAction {
    /// Store a new instruction revision
    Set { content: String },
    /// Print the instruction currently in effect
    Show,
}

// ============================================================================
// API Response Types
// ============================================================================

/// `{status, data, error, version}` envelope returned by every JSON endpoint.
#[derive(Debug, Deserialize)]
pub struct Envelope {
    pub status: String,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl Envelope {
    pub fn into_data(self) -> Result<serde_json::Value, String> {
        if self.status == "ok" {
            Ok(self.data.unwrap_or(serde_json::Value::Null))
        } else {
            Err(self.error.unwrap_or_else(|| "unknown error".to_string()))
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct Turn {
    pub role: String,
    pub text: String,
    pub created_at: String,
}

#[derive(Debug, Deserialize)]
pub struct FailedDocument {
    pub id: String,
    pub file_name: String,
    pub error: String,
}

#[derive(Debug, Deserialize)]
pub struct BatchReport {
    pub index_name: String,
    pub indexed_ids: Vec<String>,
    pub failed: Vec<FailedDocument>,
}

// ============================================================================
// Formatting
// ============================================================================

pub fn format_turn(turn: &Turn) -> String {
    let speaker = match turn.role.as_str() {
        "user" => "you",
        "assistant" => "bot",
        other => other,
    };
    // RFC 3339 timestamps: keep date and minutes only.
    let when: String = turn.created_at.chars().take(16).collect::<String>().replace('T', " ");
    format!("[{}] {}: {}", when, speaker, turn.text)
}

pub fn format_report(report: &BatchReport) -> String {
    let mut out = format!(
        "Index {}: {} indexed, {} failed",
        report.index_name,
        report.indexed_ids.len(),
        report.failed.len()
    );
    for failed in &report.failed {
        out.push_str(&format!("\n  ✗ {} ({}): {}", failed.file_name, failed.id, failed.error));
    }
    out
}

// ============================================================================
// HTTP Client Calls
// ============================================================================

fn client(timeout_secs: u64) -> anyhow::Result<reqwest::blocking::Client> {
    Ok(reqwest::blocking::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .build()?)
}

/// Decode an envelope response, exiting with the server's message on error.
fn expect_data(resp: reqwest::blocking::Response) -> anyhow::Result<serde_json::Value> {
    let status = resp.status();
    let envelope: Envelope = match resp.json() {
        Ok(e) => e,
        Err(e) => anyhow::bail!("unexpected response (HTTP {}): {}", status, e),
    };
    envelope.into_data().map_err(|e| anyhow::anyhow!("server returned {}: {}", status, e))
}

fn do_upload(server: &str, file: &PathBuf) -> anyhow::Result<()> {
    let form = reqwest::blocking::multipart::Form::new().file("file", file)?;
    let resp = client(120)?
        .post(format!("{}/api/bot/import_data", server))
        .multipart(form)
        .send()?;

    let data = expect_data(resp)?;
    println!(
        "Uploaded {} as {}",
        data["file_name"].as_str().unwrap_or("?"),
        data["id"].as_str().unwrap_or("?")
    );
    Ok(())
}

fn do_index(server: &str, index: Option<String>, batch: Option<usize>) -> anyhow::Result<()> {
    let body = serde_json::json!({ "index_name": index, "batch_size": batch });
    let resp = client(600)?
        .post(format!("{}/api/bot/process_unprocessed", server))
        .json(&body)
        .send()?;

    let report: BatchReport = serde_json::from_value(expect_data(resp)?)?;
    println!("{}", format_report(&report));
    if !report.failed.is_empty() {
        std::process::exit(2);
    }
    Ok(())
}

fn do_chat(server: &str, conversation: &str, message: &str, no_stream: bool) -> anyhow::Result<()> {
    let body = serde_json::json!({ "conversation_id": conversation, "message": message });

    if no_stream {
        let resp = client(300)?
            .post(format!("{}/api/bot/chat", server))
            .json(&body)
            .send()?;
        let data = expect_data(resp)?;
        println!("{}", data["answer"].as_str().unwrap_or_default());
        return Ok(());
    }

    let mut resp = client(300)?
        .post(format!("{}/api/bot/stream_chat", server))
        .json(&body)
        .send()?;

    if !resp.status().is_success() {
        return expect_data(resp).map(|_| ());
    }

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let mut buf = [0u8; 1024];
    loop {
        let n = std::io::Read::read(&mut resp, &mut buf)?;
        if n == 0 {
            break;
        }
        out.write_all(&buf[..n])?;
        out.flush()?;
    }
    writeln!(out)?;
    Ok(())
}

fn do_prompt(server: &str, action: PromptAction) -> anyhow::Result<()> {
    let url = format!("{}/api/bot/custom_prompt", server);
    match action {
        PromptAction::Set { content } => {
            let resp = client(30)?
                .post(&url)
                .json(&serde_json::json!({ "content": content }))
                .send()?;
            let data = expect_data(resp)?;
            println!("Stored revision {}", data["id"].as_str().unwrap_or("?"));
        }
        PromptAction::Show => {
            let data = expect_data(client(30)?.get(&url).send()?)?;
            if data["is_default"].as_bool().unwrap_or(false) {
                println!("(built-in default)");
            }
            println!("{}", data["content"].as_str().unwrap_or_default());
        }
    }
    Ok(())
}

fn do_history(server: &str, conversation: &str, limit: usize) -> anyhow::Result<()> {
    let resp = client(30)?
        .get(format!("{}/api/bot/conversations/{}/history", server, conversation))
        .query(&[("limit", limit)])
        .send()?;

    let data = expect_data(resp)?;
    let turns: Vec<Turn> = serde_json::from_value(data["turns"].clone())?;
    if turns.is_empty() {
        eprintln!("No turns stored for conversation {}", conversation);
    }
    for turn in &turns {
        println!("{}", format_turn(turn));
    }
    Ok(())
}

/// Show the server status by calling GET /health.
fn do_status(server: &str) -> anyhow::Result<()> {
    let url = format!("{}/health", server);
    let resp = client(10)?.get(&url).send();

    match resp {
        Ok(r) if r.status().is_success() => {
            let body: serde_json::Value = r.json().unwrap_or_default();
            println!("Parley server: {}", body["status"].as_str().unwrap_or("unknown"));
            println!("Version:       {}", body["version"].as_str().unwrap_or("?"));
            println!("PostgreSQL:    {}", body["postgresql"].as_str().unwrap_or("?"));
            println!("pgvector:      {}", body["pgvector"].as_str().unwrap_or("?"));
            println!("Sessions:      {}", body["sessions"].as_u64().unwrap_or(0));
            match body["pending_documents"].as_u64() {
                Some(n) => println!("Pending docs:  {}", n),
                None => println!("Pending docs:  ?"),
            }
        }
        Ok(r) => {
            eprintln!("parley-cli: server unhealthy (HTTP {})", r.status());
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("parley-cli: cannot reach {}: {}", url, e);
            std::process::exit(1);
        }
    }

    Ok(())
}

// ============================================================================
// Main
// ============================================================================

fn main() {
    let cli = Cli::parse();
    let server = cli.server.trim_end_matches('/').to_string();

    let result = match cli.command {
        Commands::Upload { file } => do_upload(&server, &file),
        Commands::Index { index, batch } => do_index(&server, index, batch),
        Commands::Chat {
            conversation,
            message,
            no_stream,
        } => do_chat(&server, &conversation, &message, no_stream),
        Commands::Prompt { action } => do_prompt(&server, action),
        Commands::History {
            conversation,
            limit,
        } => do_history(&server, &conversation, limit),
        Commands::Status => do_status(&server),
    };

    if let Err(e) = result {
        eprintln!("parley-cli: {}", e);
        std::process::exit(1);
    }
}

// ============================================================================
// Tests
// ============================================================================
