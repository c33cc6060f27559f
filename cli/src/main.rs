use clap::Parser;
use kaiwa::ChatObserver;
use kaiwa::ChatSession;
use kaiwa::PeerId;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;
use tokio::io::BufReader;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let session = ChatSession::start(cli.username.as_str().into(), Arc::new(ConsoleObserver)).await?;
    tokio::select! {
        result = chat_input_loop(&session) => result?,
        result = tokio::signal::ctrl_c() => result?,
    }
    session.stop().await;
    Ok(())
}

async fn chat_input_loop(session: &ChatSession) -> std::io::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let body = line.trim();
        if body.is_empty() {
            continue;
        }
        session.send_chat(body).await;
    }
    Ok(())
}

/// Renders core events on the terminal in place of a graphical window.
struct ConsoleObserver;

impl ChatObserver for ConsoleObserver {
    fn on_chat_line(&self, line: String) {
        println!("{}", line);
    }
    fn on_directory_changed(&self, peers: BTreeSet<PeerId>) {
        let names: Vec<_> = peers.iter().map(PeerId::as_str).collect();
        println!("[online: {}]", names.join(", "));
    }
}

#[derive(Parser)]
struct Cli {
    /// Name shown to the other participants.
    username: String,
}
