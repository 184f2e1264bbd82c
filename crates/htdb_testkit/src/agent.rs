//! A second process on the same database file.
//!
//! `fcntl` locks belong to a process, so locking behavior between handles
//! can only be observed across processes. [`ExternalAgent`] runs the
//! `htdb-agent` binary and drives it over a line protocol on its standard
//! input and output.
//!
//! Requests are single lines of space-separated words:
//!
//! | request | effect |
//! |---------|--------|
//! | `open <path>` / `open-ro <path>` | open the file, read-write or read-only |
//! | `store <key> <value>` | store, inserting or replacing |
//! | `fetch <key>` | fetch |
//! | `delete <key>` | delete |
//! | `start` / `try-start` | start a transaction, waiting or not |
//! | `commit` / `cancel` | end the transaction |
//! | `lock-all` / `unlock-all` | all-record write lock |
//! | `check` | integrity check |
//! | `close` | close the database |
//! | `quit` | exit |
//!
//! Replies are `ok`, `ok <value>`, `err WOULD_BLOCK` for lock contention,
//! or `err <KIND>` with the error kind's name.

use std::io::{self, BufRead, BufReader, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

/// Reply word for lock contention.
pub const WOULD_BLOCK: &str = "WOULD_BLOCK";

/// A reply from the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentReply {
    /// Success, with the fetched value if there was one.
    Ok(Option<String>),
    /// Failure, with the error kind's name or [`WOULD_BLOCK`].
    Err(String),
}

impl AgentReply {
    /// Parses a reply line.
    pub fn parse(line: &str) -> io::Result<Self> {
        let line = line.trim_end();
        match line.split_once(' ') {
            None if line == "ok" => Ok(Self::Ok(None)),
            Some(("ok", value)) => Ok(Self::Ok(Some(value.to_string()))),
            Some(("err", kind)) => Ok(Self::Err(kind.to_string())),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("malformed agent reply {line:?}"),
            )),
        }
    }

    /// Returns true for a successful reply.
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok(_))
    }

    /// Returns true if the request met lock contention.
    pub fn is_would_block(&self) -> bool {
        matches!(self, Self::Err(kind) if kind == WOULD_BLOCK)
    }

    /// Formats the reply as the agent writes it.
    pub fn to_line(&self) -> String {
        match self {
            Self::Ok(None) => "ok".to_string(),
            Self::Ok(Some(value)) => format!("ok {value}"),
            Self::Err(kind) => format!("err {kind}"),
        }
    }
}

/// A running `htdb-agent` process.
#[derive(Debug)]
pub struct ExternalAgent {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl ExternalAgent {
    /// Starts the agent binary at `program`.
    ///
    /// Integration tests of this crate find it through
    /// `env!("CARGO_BIN_EXE_htdb-agent")`.
    pub fn spawn(program: impl AsRef<Path>) -> io::Result<Self> {
        let mut child = Command::new(program.as_ref())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "agent stdin missing"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "agent stdout missing"))?;
        Ok(Self {
            child,
            stdin,
            stdout: BufReader::new(stdout),
        })
    }

    /// Sends one request and waits for its reply.
    pub fn request(&mut self, request: &str) -> io::Result<AgentReply> {
        writeln!(self.stdin, "{request}")?;
        self.stdin.flush()?;
        let mut line = String::new();
        if self.stdout.read_line(&mut line)? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "agent exited without replying",
            ));
        }
        AgentReply::parse(&line)
    }

    /// Opens `path` in the agent.
    pub fn open(&mut self, path: &Path) -> io::Result<AgentReply> {
        self.request(&format!("open {}", path.display()))
    }

    /// Fetches `key` in the agent.
    pub fn fetch(&mut self, key: &str) -> io::Result<AgentReply> {
        self.request(&format!("fetch {key}"))
    }

    /// Stores `key` in the agent.
    pub fn store(&mut self, key: &str, value: &str) -> io::Result<AgentReply> {
        self.request(&format!("store {key} {value}"))
    }

    /// Tries to start a transaction in the agent without waiting.
    pub fn try_transaction_start(&mut self) -> io::Result<AgentReply> {
        self.request("try-start")
    }

    /// Asks the agent to exit and waits for it.
    pub fn quit(mut self) -> io::Result<()> {
        self.request("quit")?;
        self.child.wait()?;
        Ok(())
    }
}

impl Drop for ExternalAgent {
    fn drop(&mut self) {
        if matches!(self.child.try_wait(), Ok(None)) {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replies_parse() {
        assert_eq!(AgentReply::parse("ok\n").unwrap(), AgentReply::Ok(None));
        assert_eq!(
            AgentReply::parse("ok some value\n").unwrap(),
            AgentReply::Ok(Some("some value".to_string()))
        );
        assert!(AgentReply::parse("err WOULD_BLOCK").unwrap().is_would_block());
        assert!(!AgentReply::parse("err LOCK").unwrap().is_ok());
        assert!(AgentReply::parse("what").is_err());
    }

    #[test]
    fn lines_round_trip() {
        for reply in [
            AgentReply::Ok(None),
            AgentReply::Ok(Some("v".to_string())),
            AgentReply::Err("NO_SUCH_KEY".to_string()),
        ] {
            assert_eq!(AgentReply::parse(&reply.to_line()).unwrap(), reply);
        }
    }
}
