//! wagate-cli — operator frontend for the wagate HTTP API
//!
//! # Subcommands
//! - `init <phone>`                           — start a pairing flow, print userId + apiKey
//! - `qr <user-id> [--out <file>]`            — fetch the pairing QR code
//! - `logout <user-id>`                       — tear down the user's client
//! - `send <recipient> <message> --api-key K` — send a text message
//! - `status`                                 — show server health

use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use base64::Engine;
use clap::{Parser, Subcommand};
use serde::Deserialize;

const DEFAULT_SERVER: &str = "http://127.0.0.1:3000";

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Debug, Parser)]
#[command(name = "wagate-cli", version, about = "wagate WhatsApp gateway CLI")]
struct Cli {
    /// wagate HTTP server URL (overrides WAGATE_HTTP_URL env var)
    #[arg(long, env = "WAGATE_HTTP_URL", default_value = DEFAULT_SERVER)]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Register a phone number and start pairing
    Init {
        /// Phone number of the WhatsApp account to pair
        phone: String,
    },

    /// Fetch the latest pairing QR code
    Qr {
        user_id: String,

        /// Write the decoded image to this file instead of printing the data URL
        #[arg(short, long)]
        out: Option<String>,
    },

    /// Log a user out and destroy their client
    Logout { user_id: String },

    /// Send a text message through a paired account
    Send {
        /// Recipient phone number (digits, formatting is ignored)
        recipient: String,

        message: String,

        #[arg(long, env = "WAGATE_API_KEY")]
        api_key: String,
    },

    /// Show wagate server status
    Status,
}

// ============================================================================
// API Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResponse {
    pub user_id: String,
    pub api_key: String,
    pub message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QrCodeResponse {
    pub qr_code: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendResponse {
    pub success: bool,
    pub message_id: String,
}

/// Split a `data:<mime>;base64,<payload>` URL into its mime type and bytes.
pub fn decode_data_url(url: &str) -> anyhow::Result<(String, Vec<u8>)> {
    let rest = url
        .strip_prefix("data:")
        .ok_or_else(|| anyhow!("not a data URL"))?;
    let (meta, payload) = rest
        .split_once(',')
        .ok_or_else(|| anyhow!("data URL has no payload"))?;
    let mime = meta
        .strip_suffix(";base64")
        .ok_or_else(|| anyhow!("data URL is not base64 encoded"))?;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(payload)
        .context("invalid base64 payload")?;
    Ok((mime.to_string(), bytes))
}

/// Pull the `error` field out of a failure body, falling back to the raw text.
fn error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v["error"].as_str().map(str::to_string))
        .unwrap_or_else(|| body.to_string())
}

// ============================================================================
// HTTP Client Calls
// ============================================================================

fn client(timeout: Duration) -> anyhow::Result<reqwest::blocking::Client> {
    Ok(reqwest::blocking::Client::builder().timeout(timeout).build()?)
}

/// Check the status and decode the JSON body, or turn the error body into an error.
fn read_json<T: serde::de::DeserializeOwned>(
    resp: reqwest::blocking::Response,
) -> anyhow::Result<T> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().unwrap_or_default();
        bail!("server returned {}: {}", status, error_message(&body));
    }
    resp.json().context("failed to parse server response")
}

fn do_init(server: &str, phone: &str) -> anyhow::Result<()> {
    // Launching a browser can take a while
    let url = format!("{}/api/auth/initialize", server);
    let resp = client(Duration::from_secs(120))?
        .post(&url)
        .json(&serde_json::json!({ "phoneNumber": phone }))
        .send()
        .with_context(|| format!("connection failed to {}", url))?;
    let body: InitializeResponse = read_json(resp)?;

    println!("User ID: {}", body.user_id);
    println!("API key: {}", body.api_key);
    println!("{}", body.message);
    Ok(())
}

fn do_qr(server: &str, user_id: &str, out: Option<&str>) -> anyhow::Result<()> {
    let url = format!("{}/api/auth/qr-code/{}", server, user_id);
    let resp = client(Duration::from_secs(10))?
        .get(&url)
        .send()
        .with_context(|| format!("connection failed to {}", url))?;
    let body: QrCodeResponse = read_json(resp)?;

    match out {
        Some(path) => {
            let (mime, bytes) = decode_data_url(&body.qr_code)?;
            std::fs::write(path, &bytes).with_context(|| format!("cannot write {}", path))?;
            println!("Wrote {} ({} bytes) to {}", mime, bytes.len(), path);
        }
        None => println!("{}", body.qr_code),
    }
    Ok(())
}

fn do_logout(server: &str, user_id: &str) -> anyhow::Result<()> {
    let url = format!("{}/api/auth/logout/{}", server, user_id);
    let resp = client(Duration::from_secs(30))?
        .post(&url)
        .send()
        .with_context(|| format!("connection failed to {}", url))?;
    let body: serde_json::Value = read_json(resp)?;
    println!("{}", body["message"].as_str().unwrap_or("Logged out"));
    Ok(())
}

fn do_send(server: &str, recipient: &str, message: &str, api_key: &str) -> anyhow::Result<()> {
    let url = format!("{}/api/messages/send", server);
    let resp = client(Duration::from_secs(60))?
        .post(&url)
        .header("x-api-key", api_key)
        .json(&serde_json::json!({
            "recipientNumber": recipient,
            "message": message,
        }))
        .send()
        .with_context(|| format!("connection failed to {}", url))?;
    let body: SendResponse = read_json(resp)?;

    if !body.success {
        bail!("server reported failure");
    }
    println!("Sent: {}", body.message_id);
    Ok(())
}

/// Show the server status by calling GET /health.
fn do_status(server: &str) -> anyhow::Result<()> {
    let url = format!("{}/health", server);
    let resp = client(Duration::from_secs(10))?.get(&url).send();

    match resp {
        Ok(r) if r.status().is_success() => {
            let body: serde_json::Value = r.json().unwrap_or_default();
            println!("wagate server: {}", body["status"].as_str().unwrap_or("unknown"));
            println!("Version:       {}", body["version"].as_str().unwrap_or("?"));
            println!("Store:         {}", body["store"].as_str().unwrap_or("?"));
            println!("Live clients:  {}", body["liveClients"].as_u64().unwrap_or(0));
        }
        Ok(r) => {
            let status = r.status();
            eprintln!("wagate-cli: server unhealthy (HTTP {})", status);
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("wagate-cli: cannot reach {}: {}", url, e);
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
        Commands::Init { phone } => do_init(&server, &phone),
        Commands::Qr { user_id, out } => do_qr(&server, &user_id, out.as_deref()),
        Commands::Logout { user_id } => do_logout(&server, &user_id),
        Commands::Send {
            recipient,
            message,
            api_key,
        } => do_send(&server, &recipient, &message, &api_key),
        Commands::Status => do_status(&server),
    };

    if let Err(e) = result {
        eprintln!("wagate-cli: {:#}", e);
        std::process::exit(1);
    }
}

// ============================================================================
// Tests
// ============================================================================
