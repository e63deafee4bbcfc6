use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use liquid_link::engine::ChannelState;
use liquid_link::{LinkConfig, PeerRole, SignalingSession};

#[derive(Parser, Debug)]
#[command(
    name = "liquid-link",
    about = "Negotiate a WebRTC data channel through a signaling server",
    version
)]
struct Cli {
    #[arg(
        long,
        global = true,
        env = "LIQUID_SIGNALING_URL",
        help = "Signaling server URL (ws://, wss://, http:// or https://)"
    )]
    server: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the data channel and send the offer.
    Offer(OfferArgs),
    /// Wait for an offer and answer it.
    Answer(AnswerArgs),
}

#[derive(Args, Debug)]
struct OfferArgs {
    #[arg(long, help = "Pairing id shared with the answering side (random when omitted)")]
    request_id: Option<String>,
}

#[derive(Args, Debug)]
struct AnswerArgs {
    #[arg(long, help = "Pairing id printed by the offering side")]
    request_id: String,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let cli = Cli::parse();
    let mut config = LinkConfig::from_env();
    if let Some(server) = cli.server {
        config.signaling_url = Some(server);
    }
    let server = config
        .signaling_url
        .clone()
        .context("no signaling server; pass --server or set LIQUID_SIGNALING_URL")?;

    let (role, request_id) = match cli.command {
        Command::Offer(args) => (
            PeerRole::Offerer,
            args.request_id
                .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string()),
        ),
        Command::Answer(args) => (PeerRole::Answerer, args.request_id),
    };
    eprintln!("request id: {request_id}");

    let ice_servers = config.ice_servers.clone();
    let session = SignalingSession::new(config);
    let mut failures = session.failures();
    session
        .connect_to_peer(
            &request_id,
            role,
            Some(server.as_str()),
            ice_servers,
            |message| println!("{message}"),
            |state| {
                if state == ChannelState::Open {
                    eprintln!("channel open");
                } else {
                    eprintln!("channel {state:?}");
                }
            },
        )
        .await
        .context("failed to start negotiation")?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line.context("reading stdin")? {
                Some(line) => session.send_message(line).await?,
                None => break,
            },
            failure = failures.recv() => {
                if let Ok(failure) = failure {
                    eprintln!("negotiation failed: {failure}");
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    session.stop().await;
    Ok(())
}
