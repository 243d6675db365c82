//! icelink
//!
//! Establishes a direct peer-to-peer session between two endpoints through an
//! out-of-band HTTP signaling exchange and an ICE connectivity agent.
//!
//! Usage:
//!   Initiator:  icelink initiate --listen-port 9000
//!   Responder:  icelink respond --peer 198.51.100.7:9000
//!   Persistent: icelink serve --fragment <UFRAG> --secret <PWD> --listen-port 9000

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use icelink::agent::ice::IceConnector;
use icelink::agent::ConnectivityAgent;
use icelink::config::{self, AgentConfig, Credentials, FileConfig};
use icelink::coordinator::{self, Role};
use icelink::error::SignalError;
use icelink::session::SessionContext;
use icelink::signaling::{self, ServerState};
use icelink::traffic;

#[derive(Parser)]
#[command(name = "icelink")]
#[command(version)]
#[command(about = "Establish a peer-to-peer session via HTTP signaling and ICE")]
struct Args {
    /// Optional TOML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Serve the signaling endpoint, wait for the peer, accept the session
    Initiate {
        /// Local signaling listen port
        #[arg(long, default_value_t = 9000)]
        listen_port: u16,

        /// STUN server(s) for server-reflexive candidates (host:port)
        #[arg(long = "stun-server")]
        stun_servers: Vec<String>,
    },
    /// Publish the local description to the peer, then dial the session
    Respond {
        /// Peer signaling address (host:port)
        #[arg(long)]
        peer: String,

        /// STUN server(s) for server-reflexive candidates (host:port)
        #[arg(long = "stun-server")]
        stun_servers: Vec<String>,
    },
    /// Long-running accept side that re-keys on every signaling exchange
    Serve {
        /// Local signaling listen port
        #[arg(long, default_value_t = 9000)]
        listen_port: u16,

        /// Fixed local session credential, public half
        #[arg(long)]
        fragment: String,

        /// Fixed local session credential, secret half
        #[arg(long)]
        secret: String,

        /// Remote credential (public half) for an accept round before any
        /// signaling exchange has happened
        #[arg(long, requires = "remote_secret")]
        remote_fragment: Option<String>,

        /// Remote credential (secret half) for the initial accept round
        #[arg(long, requires = "remote_fragment")]
        remote_secret: Option<String>,

        /// STUN server(s) for server-reflexive candidates (host:port)
        #[arg(long = "stun-server")]
        stun_servers: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .try_init();

    let args = Args::parse();
    let file_config = match &args.config {
        Some(path) => config::load_file_config(path)?,
        None => FileConfig::default(),
    };

    match args.mode {
        Mode::Initiate {
            listen_port,
            stun_servers,
        } => {
            let agent_config = agent_config(&stun_servers, &file_config, None);
            run_initiate(listen_port, agent_config).await
        }
        Mode::Respond { peer, stun_servers } => {
            let agent_config = agent_config(&stun_servers, &file_config, None);
            run_respond(peer, agent_config).await
        }
        Mode::Serve {
            listen_port,
            fragment,
            secret,
            remote_fragment,
            remote_secret,
            stun_servers,
        } => {
            let credentials = Credentials { fragment, secret };
            let agent_config = agent_config(&stun_servers, &file_config, Some(credentials));
            run_serve(listen_port, remote_fragment.zip(remote_secret), agent_config).await
        }
    }
}

fn agent_config(
    cli_stun_servers: &[String],
    file_config: &FileConfig,
    local_credentials: Option<Credentials>,
) -> AgentConfig {
    AgentConfig {
        stun_servers: config::resolve_stun_servers(
            cli_stun_servers,
            file_config.agent.stun_servers.clone(),
        ),
        local_credentials,
    }
}

async fn bind_signaling_listener(port: u16) -> Result<TcpListener> {
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind signaling listener on {}", addr))
}

async fn run_initiate(listen_port: u16, agent_config: AgentConfig) -> Result<()> {
    log::info!("Running as {}", Role::Initiator);
    let agent: Arc<dyn ConnectivityAgent> = Arc::new(IceConnector::bind(&agent_config).await?);
    let context = SessionContext::new();
    let (handoff_tx, handoff_rx) = signaling::credential_handoff();

    let listener = bind_signaling_listener(listen_port).await?;
    let state = ServerState::new(context.clone(), agent.clone(), handoff_tx);
    tokio::spawn(async move {
        if let Err(err) = signaling::serve(listener, state).await {
            log::error!("Signaling server failed: {}", err);
        }
    });

    let handle = coordinator::run_initiator(agent, context, handoff_rx).await?;
    traffic::run(handle).await?;
    Ok(())
}

async fn run_respond(peer: String, agent_config: AgentConfig) -> Result<()> {
    log::info!("Running as {}", Role::Responder);
    let agent: Arc<dyn ConnectivityAgent> = Arc::new(IceConnector::bind(&agent_config).await?);
    let context = SessionContext::new();

    let (ready_tx, ready_rx) = oneshot::channel();
    tokio::spawn(async move {
        println!("Press Enter when both processes are running");
        let mut line = String::new();
        if BufReader::new(tokio::io::stdin())
            .read_line(&mut line)
            .await
            .is_ok()
        {
            let _ = ready_tx.send(());
        }
    });

    let handle = coordinator::run_responder(agent, context, &peer, ready_rx).await?;
    traffic::run(handle).await?;
    Ok(())
}

async fn run_serve(
    listen_port: u16,
    initial_remote: Option<(String, String)>,
    agent_config: AgentConfig,
) -> Result<()> {
    log::info!("Running as persistent {}", Role::Initiator);
    let agent: Arc<dyn ConnectivityAgent> = Arc::new(IceConnector::bind(&agent_config).await?);
    let context = SessionContext::new();
    let (handoff_tx, mut handoff_rx) = signaling::credential_handoff();

    let _pump = coordinator::initialize(&agent, &context).await?;

    if let Some((fragment, secret)) = initial_remote {
        // Seed the first accept round from the flags; later rounds come from
        // inbound signaling exchanges.
        if handoff_tx.try_send(fragment).is_err() || handoff_tx.try_send(secret).is_err() {
            anyhow::bail!("Failed to seed the initial accept round");
        }
    }

    let listener = bind_signaling_listener(listen_port).await?;
    let state = ServerState::new(context.clone(), agent.clone(), handoff_tx).with_rekey();
    tokio::spawn(async move {
        if let Err(err) = signaling::serve(listener, state).await {
            log::error!("Signaling server failed: {}", err);
        }
    });

    loop {
        match coordinator::next_accept_round(&agent, &mut handoff_rx).await {
            Ok(handle) => {
                if let Err(err) = traffic::run(handle).await {
                    log::warn!("Session ended: {}", err);
                }
            }
            // Session-fatal but process-recoverable: wait for the next
            // signaling exchange to re-key.
            Err(err @ SignalError::Agent(_)) => log::warn!("Accept round failed: {}", err),
            Err(err) => return Err(err).context("signaling hand-off ended"),
        }
    }
}
