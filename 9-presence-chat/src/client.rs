use anyhow::{Context, Result};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, Stdin},
    select,
    sync::mpsc,
};
use tracing::warn;

use crate::{
    cli::ClientArgs,
    config::SessionConfig,
    event::{ChatEvent, Scope, Username},
    session::ChatSession,
    transport::{TcpTransport, Transport},
};

/// Session callbacks run on delivery tasks; the terminal is driven from the
/// client loop only, so callbacks just forward into this channel.
enum UiEvent {
    Chat(ChatEvent),
    PresenceChanged,
    Disconnected,
}

pub async fn run(args: ClientArgs) -> Result<()> {
    let username = Username::new(&args.username).context("invalid username")?;
    let config = SessionConfig::new(username, args.server.to_string())
        .with_destinations(args.destinations());
    let session = ChatSession::new(TcpTransport::new(), config);
    let mut events = forward_session_events(&session);

    session
        .connect()
        .await
        .with_context(|| format!("failed to connect to {}", args.server))?;
    write_stdout(&format!("*** connected as {}", session.username())).await?;

    let mut input = BufReader::new(tokio::io::stdin()).lines();
    let result = run_client_loop(&session, &mut input, &mut events).await;
    session.close().await;

    result
}

fn forward_session_events<T: Transport>(
    session: &ChatSession<T>,
) -> mpsc::UnboundedReceiver<UiEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    let chat_tx = tx.clone();
    session.on_chat_event(move |event| {
        let _ = chat_tx.send(UiEvent::Chat(event));
    });
    let presence_tx = tx.clone();
    session.on_presence_changed(move || {
        let _ = presence_tx.send(UiEvent::PresenceChanged);
    });
    session.on_disconnected(move || {
        let _ = tx.send(UiEvent::Disconnected);
    });
    rx
}

async fn run_client_loop<T: Transport>(
    session: &ChatSession<T>,
    input: &mut Lines<BufReader<Stdin>>,
    events: &mut mpsc::UnboundedReceiver<UiEvent>,
) -> Result<()> {
    let mut roster = Vec::new();
    loop {
        select! {
            line = input.next_line() => {
                if !handle_stdin_input(line?, session, &roster).await? {
                    break;
                }
            }
            Some(event) = events.recv() => {
                if !render_event(event, session, &mut roster).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                break;
            }
        }
    }
    Ok(())
}

async fn handle_stdin_input<T: Transport>(
    line: Option<String>,
    session: &ChatSession<T>,
    roster: &[String],
) -> Result<bool> {
    let Some(line) = line else {
        return Ok(false);
    };

    let text = line.trim_end();
    if text.trim().is_empty() {
        return Ok(true);
    }

    if text.eq_ignore_ascii_case("/quit") {
        write_stdout("*** leaving chat").await?;
        return Ok(false);
    }

    if text.eq_ignore_ascii_case("/who") {
        write_stdout(&roster_line(roster)).await?;
        return Ok(true);
    }

    if let Some(rest) = text.strip_prefix("/msg ") {
        send_private(session, rest).await?;
        return Ok(true);
    }

    match session.send_public(text).await {
        Ok(()) => write_stdout(&format!("<{}> {text}", session.username())).await?,
        Err(err) => write_stderr(&format!("!!! {err}")).await?,
    }
    Ok(true)
}

async fn send_private<T: Transport>(session: &ChatSession<T>, args: &str) -> io::Result<()> {
    let Some((recipient, text)) = args.trim_start().split_once(char::is_whitespace) else {
        return write_stderr("!!! usage: /msg <user> <text>").await;
    };
    let Ok(recipient) = Username::new(recipient) else {
        return write_stderr("!!! usage: /msg <user> <text>").await;
    };

    match session.send_private(&recipient, text).await {
        Ok(()) => write_stdout(&format!("[private to {recipient}] {text}")).await,
        Err(err) => write_stderr(&format!("!!! {err}")).await,
    }
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

/// Returns `false` once the client should stop.
async fn render_event<T: Transport>(
    event: UiEvent,
    session: &ChatSession<T>,
    roster: &mut Vec<String>,
) -> io::Result<bool> {
    match event {
        UiEvent::Chat(ChatEvent {
            sender,
            text,
            scope: Scope::Public,
        }) => write_stdout(&format!("<{sender}> {text}")).await?,
        UiEvent::Chat(ChatEvent {
            sender,
            text,
            scope: Scope::Private,
        }) => write_stdout(&format!("[private] <{sender}> {text}")).await?,
        UiEvent::PresenceChanged => {
            let current = sorted_roster(session);
            if current != *roster {
                *roster = current;
                write_stdout(&roster_line(roster)).await?;
            }
        }
        UiEvent::Disconnected => {
            write_stdout("*** server closed the connection").await?;
            return Ok(false);
        }
    }
    Ok(true)
}

fn sorted_roster<T: Transport>(session: &ChatSession<T>) -> Vec<String> {
    let mut names: Vec<String> = session
        .online_users()
        .into_iter()
        .map(|user| user.to_string())
        .collect();
    names.sort_by_key(|name| name.to_lowercase());
    names
}

fn roster_line(roster: &[String]) -> String {
    if roster.is_empty() {
        return "*** online: nobody".to_string();
    }
    format!("*** online: {}", roster.join(", "))
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

async fn write_stderr(line: &str) -> io::Result<()> {
    let mut stderr = tokio::io::stderr();
    stderr.write_all(line.as_bytes()).await?;
    stderr.write_all(b"\n").await?;
    stderr.flush().await
}
