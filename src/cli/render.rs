//! Plain text rendering of panes for the terminal.
use std::fmt::Write as _;
use std::io::Write as _;

use anyhow::{Context, Result};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use futures_util::StreamExt;

use crate::backend::ChatBackend;
use crate::compare::{
    Catalog, Comparison, DispatchReport, Registry, Role, Session, SessionStatus, StreamOutcome,
};

pub fn catalog(catalog: &Catalog) -> String {
    let mut out = String::new();
    for entry in catalog.entries() {
        let mut caps = Vec::new();
        if entry.capabilities.text {
            caps.push("text");
        }
        if entry.capabilities.image {
            caps.push("image");
        }
        if entry.capabilities.code {
            caps.push("code");
        }
        let _ = writeln!(
            out,
            "{:<48} {} ({}) [{}]",
            entry.id,
            entry.name,
            entry.provider_name,
            caps.join(", ")
        );
    }
    out
}

pub fn pane(registry: &Registry, index: usize, session: &Session) -> String {
    let name = registry.catalog().display_name(&session.model_id);
    let mut out = format!("── {}. {} ", index + 1, name);
    if session.status != SessionStatus::Idle {
        let _ = write!(out, "({:?}) ", session.status);
    }
    out.push_str("──\n");

    for message in &session.transcript {
        let who = match message.role {
            Role::User => "you",
            Role::Assistant => name,
        };
        let _ = writeln!(out, "{}: {}", who, message.content);
        if message.image.is_some() {
            out.push_str("   [image attached]\n");
        }
    }
    if let Some(error) = &session.last_error {
        let _ = writeln!(out, "! {}", error);
    }
    out
}

pub fn panes(registry: &Registry) -> String {
    if registry.is_empty() {
        return "No models selected\n".to_string();
    }
    registry
        .sessions()
        .enumerate()
        .map(|(i, session)| pane(registry, i, session))
        .collect::<Vec<_>>()
        .join("\n")
}

/// One line summarizing streams that are still running.
pub fn progress(registry: &Registry) -> String {
    registry
        .sessions()
        .filter(|s| s.is_streaming())
        .map(|s| {
            let chars = s
                .transcript
                .last()
                .filter(|m| m.role == Role::Assistant)
                .map(|m| m.content.chars().count())
                .unwrap_or(0);
            format!(
                "{}: {} chars",
                registry.catalog().display_name(&s.model_id),
                chars
            )
        })
        .collect::<Vec<_>>()
        .join(" | ")
}

pub fn report(report: &DispatchReport) -> String {
    let mut out = String::new();
    for session in &report.sessions {
        match &session.outcome {
            StreamOutcome::Completed => {}
            StreamOutcome::Cancelled => {
                let _ = writeln!(out, "{} was cancelled", session.model_id);
            }
            StreamOutcome::Failed(e) => {
                let _ = writeln!(out, "{} failed: {}", session.model_id, e);
            }
        }
    }
    out
}

/// Read an image for a prompt. Data URLs pass through untouched,
/// anything else is treated as a file path.
pub fn load_image(arg: &str) -> Result<String> {
    if arg.starts_with("data:") {
        return Ok(arg.to_string());
    }
    let bytes = std::fs::read(arg).with_context(|| format!("Failed to read image {}", arg))?;
    let extension = std::path::Path::new(arg)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase);
    let mime = match extension.as_deref() {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        _ => "image/png",
    };
    Ok(format!("data:{};base64,{}", mime, STANDARD.encode(bytes)))
}

/// Submit a prompt, keeping a progress line on stderr until every
/// stream has finished.
pub async fn submit<B: ChatBackend + ?Sized>(
    comparison: &Comparison<B>,
    prompt: &str,
    image: Option<&str>,
) -> Result<DispatchReport> {
    let mut updates = comparison.store().updates();
    let submit = comparison.submit(prompt, image);
    tokio::pin!(submit);

    let result = loop {
        tokio::select! {
            result = &mut submit => break result,
            Some(registry) = updates.next() => {
                let line = progress(&registry);
                if !line.is_empty() {
                    eprint!("\r{}", line);
                    let _ = std::io::stderr().flush();
                }
            }
        }
    };
    eprintln!();
    Ok(result?)
}
