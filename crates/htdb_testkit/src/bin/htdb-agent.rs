//! Drives a database from a separate process for multi-process tests.
//!
//! See `htdb_testkit::agent` for the protocol. Diagnostics go to stderr,
//! filtered by `RUST_LOG`.

use htdb_core::{Config, Database, StoreMode};
use htdb_testkit::{AgentReply, WOULD_BLOCK};
use std::io::{self, BufRead, Write};
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

fn reply_for(result: htdb_core::Result<Option<String>>) -> AgentReply {
    match result {
        Ok(value) => AgentReply::Ok(value),
        Err(err) if err.is_would_block() => AgentReply::Err(WOULD_BLOCK.to_string()),
        Err(err) => AgentReply::Err(err.kind().as_str().to_string()),
    }
}

fn done(result: htdb_core::Result<()>) -> htdb_core::Result<Option<String>> {
    result.map(|()| None)
}

fn handle(db: &mut Option<Database>, words: &[&str]) -> htdb_core::Result<Option<String>> {
    if let ["open" | "open-ro", path] = words {
        let config = Config::new().read_only(words[0] == "open-ro");
        *db = Some(Database::open(path, &config)?);
        return Ok(None);
    }
    if matches!(words, ["close"]) {
        return match db.take() {
            Some(handle) => done(handle.close()),
            None => Ok(None),
        };
    }
    let Some(handle) = db.as_mut() else {
        return Err(htdb_core::Error::invalid_argument("no database open"));
    };
    match words {
        ["store", key, value] => {
            done(handle.store(key.as_bytes(), value.as_bytes(), StoreMode::Either))
        }
        ["fetch", key] => {
            let value = handle.fetch(key.as_bytes())?;
            Ok(Some(String::from_utf8_lossy(&value).into_owned()))
        }
        ["delete", key] => done(handle.delete(key.as_bytes())),
        ["start"] => done(handle.transaction_start()),
        ["try-start"] => done(handle.try_transaction_start()),
        ["commit"] => done(handle.transaction_commit()),
        ["cancel"] => done(handle.transaction_cancel()),
        ["lock-all"] => done(handle.lock_all()),
        ["unlock-all"] => done(handle.unlock_all()),
        ["check"] => done(handle.check()),
        _ => Err(htdb_core::Error::invalid_argument(format!(
            "unknown request {:?}",
            words.join(" ")
        ))),
    }
}

fn main() -> io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let stdin = io::stdin();
    let mut stdout = io::stdout().lock();
    let mut db = None;

    for line in stdin.lock().lines() {
        let line = line?;
        let words: Vec<&str> = line.split_whitespace().collect();
        if matches!(words.as_slice(), ["quit"]) {
            writeln!(stdout, "{}", AgentReply::Ok(None).to_line())?;
            stdout.flush()?;
            break;
        }
        let reply = reply_for(handle(&mut db, &words));
        if let AgentReply::Err(kind) = &reply {
            warn!(request = %line, %kind, "request failed");
        } else {
            debug!(request = %line, "request done");
        }
        writeln!(stdout, "{}", reply.to_line())?;
        stdout.flush()?;
    }

    if let Some(db) = db {
        if let Err(err) = db.close() {
            warn!(error = %err, "closing database failed");
        }
    }
    Ok(())
}
