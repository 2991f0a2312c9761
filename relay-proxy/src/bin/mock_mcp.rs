//! Mock stdio MCP server for integration tests.
//!
//! Reads newline-delimited JSON-RPC requests on stdin and answers each
//! with a result echoing the method name. Flags shape failure modes:
//!
//! - `--exit-after N`: exit silently after answering N requests
//!   (exercises the adapter's restart path);
//! - `--delay-ms MS`: sleep before every response (exercises timeouts).

use std::io::{BufRead, Write};

fn main() {
    let mut exit_after: Option<u64> = None;
    let mut delay_ms: u64 = 0;

    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--exit-after" => {
                exit_after = args.get(i + 1).and_then(|v| v.parse().ok());
                i += 2;
            }
            "--delay-ms" => {
                delay_ms = args.get(i + 1).and_then(|v| v.parse().ok()).unwrap_or(0);
                i += 2;
            }
            _ => i += 1,
        }
    }

    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    let mut answered: u64 = 0;

    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }

        let request: serde_json::Value = match serde_json::from_str(&line) {
            Ok(value) => value,
            Err(_) => continue,
        };

        if delay_ms > 0 {
            std::thread::sleep(std::time::Duration::from_millis(delay_ms));
        }

        let response = serde_json::json!({
            "jsonrpc": "2.0",
            "result": {
                "echo": request.get("method").cloned().unwrap_or_default(),
                "served": answered + 1,
            },
            "id": request.get("id").cloned().unwrap_or(serde_json::Value::Null),
        });

        let mut out = stdout.lock();
        if writeln!(out, "{response}").is_err() {
            break;
        }
        if out.flush().is_err() {
            break;
        }

        answered += 1;
        if exit_after.is_some_and(|n| answered >= n) {
            break;
        }
    }
}
