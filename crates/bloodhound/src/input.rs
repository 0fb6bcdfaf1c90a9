//! Line-based observation source
//!
//! Each non-empty line is `<key> [<path>] [<count>]`:
//! - `example.com` counts one hit for `example.com`
//! - `example.com 12` counts twelve hits
//! - `example.com /blog/post/1` counts one hit in section `/blog`
//! - `example.com /blog/post/1 3` counts three hits in section `/blog`
//!
//! Requests for static files (`/app.css`, `/logo.png`) are skipped entirely.
//! Lines starting with `#` are comments.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use bloodhound_lib::{health::components, Aggregator, HealthRegistry};
use chrono::Utc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, info, warn};

/// Lines between input heartbeats
const HEARTBEAT_EVERY: u64 = 1000;

/// One parsed input line
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub key: String,
    pub section: Option<String>,
    pub value: f64,
}

/// Reduce a request path to its top-level section
///
/// Returns `None` for paths that look like static files.
pub fn normalize_section(path: &str) -> Option<String> {
    let path = path.split(['?', '#']).next().unwrap_or_default();

    if has_file_extension(path) {
        return None;
    }

    let section = path.split('/').nth(1).unwrap_or_default();
    Some(format!("/{}", section))
}

fn has_file_extension(path: &str) -> bool {
    match path.rsplit_once('.') {
        Some((_, ext)) => (1..=5).contains(&ext.len()) && ext.bytes().all(|b| b.is_ascii_alphabetic()),
        None => false,
    }
}

/// Parse one input line; `Ok(None)` for blank lines, comments and skipped paths
pub fn parse_line(line: &str) -> Result<Option<Observation>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }

    let mut tokens = line.split_whitespace();
    let key = match tokens.next() {
        Some(key) => key.to_string(),
        None => return Ok(None),
    };

    let mut section = None;
    let mut value = 1.0;

    if let Some(token) = tokens.next() {
        match token.parse::<f64>() {
            Ok(count) => value = count,
            Err(_) => match normalize_section(token) {
                Some(normalized) => section = Some(normalized),
                None => return Ok(None),
            },
        }
    }

    if let Some(token) = tokens.next() {
        if section.is_none() {
            bail!("unexpected token after count: {:?}", token);
        }
        value = token
            .parse::<f64>()
            .with_context(|| format!("invalid count {:?}", token))?;
    }

    if let Some(extra) = tokens.next() {
        bail!("unexpected trailing token: {:?}", extra);
    }

    Ok(Some(Observation {
        key,
        section,
        value,
    }))
}

/// Feed every line of `reader` into `aggregator` until EOF
///
/// Returns the number of observations accepted.
pub async fn run_reader<R>(
    reader: R,
    aggregator: Arc<Aggregator>,
    health: HealthRegistry,
) -> Result<u64>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut line_number = 0u64;
    let mut accepted = 0u64;

    while let Some(line) = lines.next_line().await.context("Failed to read input")? {
        line_number += 1;

        match parse_line(&line) {
            Ok(Some(observation)) => {
                let fed = match observation.section {
                    Some(ref section) => {
                        aggregator.feed_detail(&observation.key, section, observation.value)
                    }
                    None => aggregator.feed(&observation.key, observation.value),
                };
                if fed {
                    accepted += 1;
                }
            }
            Ok(None) => {
                debug!(line = line_number, "Skipping input line");
            }
            Err(e) => {
                warn!(line = line_number, error = %e, "Malformed input line");
            }
        }

        if line_number % HEARTBEAT_EVERY == 0 {
            health.heartbeat(components::INPUT, Utc::now()).await;
        }
    }

    info!(lines = line_number, accepted = accepted, "Input stream closed");
    Ok(accepted)
}
