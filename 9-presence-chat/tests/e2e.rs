use std::{path::Path, process::Stdio, time::Duration};

use anyhow::{Context, Result, anyhow};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin, ChildStdout, Command},
    time::timeout,
};

const READ_TIMEOUT: Duration = Duration::from_secs(3);

#[tokio::test]
async fn cli_chat_end_to_end() -> Result<()> {
    let binary = assert_cmd::cargo::cargo_bin!("presence_chat");

    let (mut broker_child, mut broker_stdout) = spawn_broker(&binary).await?;
    let addr = read_broker_addr(&mut broker_stdout).await?;

    // Drain additional broker logs in the background so the pipe never fills.
    let broker_log_task = tokio::spawn(async move {
        drain_stdout(broker_stdout).await;
    });

    let mut alice = spawn_client(&binary, "alice", &addr).await?;
    alice
        .expect_line("*** online: alice")
        .await
        .context("alice sees herself")?;

    let mut bob = spawn_client(&binary, "bob", &addr).await?;

    // Bob learns about alice from her sync response; alice sees bob's join.
    bob.expect_line("*** online: alice, bob")
        .await
        .context("bob roster")?;
    alice
        .expect_line("*** online: alice, bob")
        .await
        .context("alice roster")?;

    // Public message: shown locally for alice, delivered once to bob.
    alice.send_line("Hello from Alice").await?;
    alice.expect_line("<alice> Hello from Alice").await?;
    bob.expect_line("<alice> Hello from Alice").await?;

    // Private message reaches alice only.
    bob.send_line("/msg alice just for you").await?;
    bob.expect_line("[private to alice] just for you").await?;
    alice.expect_line("[private] <bob> just for you").await?;

    // Alice quits; bob's roster shrinks.
    alice.send_line("/quit").await?;
    alice.expect_line("*** leaving chat").await?;
    bob.expect_line("*** online: bob")
        .await
        .context("bob sees alice leave")?;

    bob.send_line("/quit").await?;
    bob.expect_line("*** leaving chat").await?;

    ensure_success(&mut alice.child, "alice client").await?;
    ensure_success(&mut bob.child, "bob client").await?;

    // Broker stays up after clients disconnect; terminate it manually.
    let _ = broker_child.kill().await;
    let _ = broker_child.wait().await;
    let _ = broker_log_task.await;

    Ok(())
}

struct ClientProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl ClientProcess {
    async fn send_line(&mut self, line: &str) -> Result<()> {
        self.stdin
            .write_all(line.as_bytes())
            .await
            .with_context(|| format!("failed to send line '{line}'"))?;
        self.stdin.write_all(b"\n").await?;
        self.stdin.flush().await?;
        Ok(())
    }

    /// Reads until `expected` shows up. Roster updates may interleave with
    /// other output, so intermediate lines are skipped.
    async fn expect_line(&mut self, expected: &str) -> Result<()> {
        let mut seen = Vec::new();
        loop {
            match read_line(&mut self.stdout).await {
                Ok(Some(line)) if line == expected => return Ok(()),
                Ok(Some(line)) => seen.push(line),
                Ok(None) => {
                    return Err(anyhow!(
                        "stream closed waiting for '{expected}', saw {seen:?}"
                    ));
                }
                Err(err) => {
                    return Err(err.context(format!("waiting for '{expected}', saw {seen:?}")));
                }
            }
        }
    }
}

async fn spawn_broker(binary: &Path) -> Result<(Child, BufReader<ChildStdout>)> {
    let mut cmd = Command::new(binary);
    cmd.arg("broker")
        .arg("--listen")
        .arg("127.0.0.1:0")
        .env("RUST_LOG_STYLE", "never")
        .env("NO_COLOR", "1")
        .stdout(Stdio::piped())
        .stderr(Stdio::null());

    let mut child = cmd.spawn().context("failed to spawn broker")?;
    let stdout = child
        .stdout
        .take()
        .context("broker stdout missing after spawn")?;

    Ok((child, BufReader::new(stdout)))
}

async fn read_broker_addr(reader: &mut BufReader<ChildStdout>) -> Result<String> {
    let line = read_line(reader)
        .await?
        .context("broker did not emit listening address")?;
    let trimmed = line.trim();
    let addr = trimmed
        .split_whitespace()
        .last()
        .context("unexpected broker banner format")?;
    if !addr.contains(':') {
        return Err(anyhow!("broker banner missing socket: {trimmed}"));
    }
    Ok(addr.to_string())
}

async fn spawn_client(binary: &Path, username: &str, addr: &str) -> Result<ClientProcess> {
    let mut cmd = Command::new(binary);
    cmd.arg("client")
        .arg("--username")
        .arg(username)
        .arg("--server")
        .arg(addr)
        .env("RUST_LOG", "error")
        .env("RUST_LOG_STYLE", "never")
        .env("NO_COLOR", "1")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null());

    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn client {username}"))?;

    let stdin = child
        .stdin
        .take()
        .context("client stdin missing after spawn")?;
    let stdout = child
        .stdout
        .take()
        .context("client stdout missing after spawn")?;

    let mut process = ClientProcess {
        child,
        stdin,
        stdout: BufReader::new(stdout),
    };

    process
        .expect_line(&format!("*** connected as {username}"))
        .await
        .with_context(|| format!("waiting for welcome banner for {username}"))?;

    Ok(process)
}

async fn read_line(reader: &mut BufReader<ChildStdout>) -> Result<Option<String>> {
    let mut line = String::new();
    let read_future = reader.read_line(&mut line);
    let bytes_io = match timeout(READ_TIMEOUT, read_future).await {
        Ok(result) => result,
        Err(_) => return Err(anyhow!("timed out waiting for line")),
    };
    let byte_count = bytes_io?;
    if byte_count == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
}

async fn drain_stdout(mut reader: BufReader<ChildStdout>) {
    let mut buffer = String::new();
    while reader
        .read_line(&mut buffer)
        .await
        .map(|bytes| {
            let has_data = bytes > 0;
            if has_data {
                buffer.clear();
            }
            has_data
        })
        .unwrap_or(false)
    {}
}

async fn ensure_success(child: &mut Child, name: &str) -> Result<()> {
    let status = child
        .wait()
        .await
        .with_context(|| format!("failed to await {name} process"))?;
    if !status.success() {
        return Err(anyhow!("{name} exited with status {status}"));
    }
    Ok(())
}
