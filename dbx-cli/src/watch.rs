//! `dbx watch`: print signals as they arrive.

use std::sync::Arc;

use anyhow::{Context, Result};
use dbx::{Connection, Message, ObjectPath, Value};
use tokio::sync::mpsc;

use crate::{OutputFormat, render};

/// Arguments for `dbx watch`.
#[derive(clap::Args)]
pub struct WatchArgs {
    /// Object path emitting the signal.
    pub path: String,
    /// Interface of the signal.
    pub interface: String,
    /// Signal name.
    pub member: String,
}

/// A received signal, decoded inside the handler.
struct Seen {
    header: String,
    json: serde_json::Value,
    body: Vec<Value>,
}

pub async fn run(conn: &Connection, args: &WatchArgs, format: OutputFormat) -> Result<()> {
    let path = ObjectPath::new(args.path.as_str()).with_context(|| format!("invalid object path {:?}", args.path))?;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let _sub = conn
        .subscribe(
            &path,
            &args.interface,
            &args.member,
            Arc::new(move |msg: &Message| {
                let body = match msg.decoder().get_values() {
                    Ok(body) => body,
                    Err(e) => {
                        tracing::warn!(error = %e, "undecodable signal body");
                        return;
                    }
                };
                let _ = tx.send(Seen {
                    header: render::header(msg),
                    json: render::message_json(msg, &body),
                    body,
                });
            }),
        )
        .await
        .with_context(|| format!("subscribing to {}.{}", args.interface, args.member))?;
    eprintln!("watching {path} {}.{} (Ctrl-C to stop)", args.interface, args.member);

    loop {
        tokio::select! {
            seen = rx.recv() => {
                let Some(seen) = seen else { break };
                print(&seen, format)?;
            }
            res = tokio::signal::ctrl_c() => {
                res.context("waiting for Ctrl-C")?;
                break;
            }
            () = conn.closed() => anyhow::bail!("connection closed"),
        }
    }
    Ok(())
}

fn print(seen: &Seen, format: OutputFormat) -> Result<()> {
    if matches!(format, OutputFormat::Json) {
        println!("{}", serde_json::to_string(&seen.json)?);
        return Ok(());
    }
    println!("{}", seen.header);
    for v in &seen.body {
        println!("  {}", render::value(v));
    }
    Ok(())
}
