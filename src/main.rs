use std::sync::Arc;

use serenity::Client;
use serenity::all::GatewayIntents;
use tokio::sync::RwLock;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

mod config;
mod overlap;
mod report;
mod store;
mod tickets;
mod tracker;
mod voice;

use crate::config::Config;
use crate::store::SessionStore;
use crate::tracker::VoiceTracker;
use crate::voice::Handler;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("madoguchi=info,warn"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer())
        .init();

    let config = Config::from_env()?;
    let store = SessionStore::new(config.storage_path.clone());

    let intents = GatewayIntents::GUILDS | GatewayIntents::GUILD_VOICE_STATES;

    let token = config.discord_token.clone();
    let mut client = Client::builder(&token, intents)
        .event_handler(Handler)
        .type_map_insert::<Config>(Arc::new(config))
        .type_map_insert::<VoiceTracker>(Arc::new(RwLock::new(VoiceTracker::new())))
        .type_map_insert::<SessionStore>(Arc::new(store))
        .await?;

    info!("ボットを起動します...");
    client.start().await?;
    Ok(())
}
