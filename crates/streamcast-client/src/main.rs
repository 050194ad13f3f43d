//! Line-oriented Streamcast client.
//!
//! Connect, log in (registering first with --register), then type
//! lines to broadcast them; incoming activity is printed to stdout.
//!
//!   streamcast --addr localhost:3780 --username alice --secret pw
//!   streamcast --addr localhost:3780            # anonymous

use streamcast_client::Session;
use streamcast_core::{Message, ANONYMOUS_USERNAME};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("streamcast=info".parse()?))
        .init();

    let args: Vec<String> = std::env::args().collect();
    let addr = parse_arg(&args, "--addr").unwrap_or_else(|| "localhost:3780".to_owned());
    let username = parse_arg(&args, "--username").unwrap_or_else(|| ANONYMOUS_USERNAME.to_owned());
    let secret = parse_arg(&args, "--secret").unwrap_or_default();
    let register = args.iter().any(|a| a == "--register");

    let mut session = Session::connect(&addr).await?;

    if register {
        match session.register(&username, &secret).await? {
            Message::RegisterSuccess { info } => tracing::info!("{info}"),
            Message::RegisterFailed { info } => anyhow::bail!("registration failed: {info}"),
            other => anyhow::bail!("unexpected reply to REGISTER: {other:?}"),
        }
    }

    match session.login(&username, &secret).await? {
        Message::LoginSuccess { info } => tracing::info!("{info}"),
        Message::Redirect { host, port, id } => {
            tracing::info!("redirected to {id} at {host}:{port}");
            session = Session::connect((host.as_str(), port)).await?;
            match session.client_authenticate(&username, &secret, &id).await? {
                Message::LoginSuccess { info } => tracing::info!("{info}"),
                other => anyhow::bail!("redirect login failed: {other:?}"),
            }
        }
        Message::LoginFailed { info } => anyhow::bail!("login failed: {info}"),
        other => anyhow::bail!("unexpected reply to LOGIN: {other:?}"),
    }

    let (mut incoming, mut outgoing) = session.into_split();
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            received = incoming.recv() => match received? {
                Message::ActivityBroadcast { actor, object } => println!("{actor}: {object}"),
                Message::InvalidMessage { info } => tracing::warn!("server: {info}"),
                other => tracing::debug!("ignoring {}", other.command()),
            },
            line = stdin.next_line() => match line? {
                Some(text) if !text.trim().is_empty() => {
                    outgoing.send_activity(&username, &secret, text.trim()).await?;
                }
                Some(_) => {}
                None => {
                    outgoing.logout(&username, &secret).await?;
                    break;
                }
            },
        }
    }

    Ok(())
}

fn parse_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}
