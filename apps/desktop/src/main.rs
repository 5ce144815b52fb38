use std::{path::PathBuf, sync::Arc};

use anyhow::{bail, Context, Result};
use clap::Parser;
use client_core::{
    config::{derive_live_url, load_settings},
    ClientDependencies, ClientEvent, Credential, QueryKey, RealtimeClient,
    Topic,
};
use shared::{
    domain::{ChannelId, MessageKind, ServerId},
    protocol::{events, PushEvent},
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser, Debug)]
struct Args {
    /// Overrides `api_url` from client.toml / APP__API_URL.
    #[arg(long)]
    api_url: Option<String>,
    /// Access token to sign in with. Without it the stored session is used.
    #[arg(long, env = "APP__ACCESS_TOKEN")]
    token: Option<String>,
    #[arg(long)]
    session_file: Option<PathBuf>,
    #[arg(long)]
    server: Uuid,
    #[arg(long)]
    channel: Uuid,
    /// Sent once the channel is open.
    #[arg(long)]
    say: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    let mut settings = load_settings();
    if let Some(api_url) = &args.api_url {
        settings.api_url = api_url.trim_end_matches('/').to_string();
        settings.live_url = derive_live_url(api_url)?;
    }
    if let Some(path) = args.session_file.clone() {
        settings.session_file = Some(path);
    }
    let deps = ClientDependencies::from_settings(&settings).context("invalid client settings")?;
    let client = RealtimeClient::new(deps);

    match args.token {
        Some(token) => {
            let profile = client.login(Credential::new(token)).await?;
            println!("signed in as {} ({})", profile.username, profile.user_id);
        }
        None => match client.restore_session().await? {
            Some(user_id) => println!("restored session for {user_id}"),
            None => bail!("no stored session; pass --token"),
        },
    }

    let server_id = ServerId(args.server);
    let channel_id = ChannelId(args.channel);
    spawn_event_printer(&client);

    client.connect().await.context("live connection failed")?;
    client
        .refresh_query(QueryKey::ChannelList(server_id))
        .await
        .context("loading channels")?;
    let history = client.open_channel(server_id, channel_id).await?;
    for cached in &history {
        println!("[{}] {}", cached.message.author_id, cached.message.content);
    }

    client.subscribe(
        Topic::for_channel(events::MESSAGE_CREATED, channel_id),
        |event| {
            if let PushEvent::MessageCreated { message } = event {
                println!("[{}] {}", message.author_id, message.content);
            }
        },
    );

    if let Some(text) = &args.say {
        match client
            .send_channel_message(server_id, channel_id, text, MessageKind::Text)
            .await
        {
            Ok(sent) => info!(message_id = %sent.message_id, "desktop: message sent"),
            Err(err) => warn!("desktop: send failed: {err}"),
        }
    }

    tokio::signal::ctrl_c().await?;
    client.disconnect();
    Ok(())
}

fn spawn_event_printer(client: &Arc<RealtimeClient>) {
    let mut events = client.subscribe_events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ClientEvent::SessionEnded { reason } => {
                    eprintln!("session ended: {reason}");
                    break;
                }
                ClientEvent::LeftServer { server_id } => eprintln!("removed from server {server_id}"),
                other => info!(?other, "desktop: client event"),
            }
        }
    });
}
