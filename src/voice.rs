use std::sync::Arc;

use chrono::Utc;
use serenity::all::{
    ChannelType, Command, CommandDataOptionValue, CommandInteraction, CommandOptionType,
    CreateCommand, CreateCommandOption, CreateInteractionResponse,
    CreateInteractionResponseMessage, Interaction, Ready,
};
use serenity::async_trait;
use serenity::model::id::{ChannelId, GuildId};
use serenity::model::voice::VoiceState;
use serenity::prelude::*;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::report::{self, LiveEntry, LocationFilter, ReportError};
use crate::store::{SessionRecord, SessionStore};
use crate::tickets;
use crate::tracker::VoiceTracker;

pub struct Handler;

/// 登録するスラッシュコマンドの定義。
fn command_definitions() -> Vec<CreateCommand> {
    vec![
        CreateCommand::new("voicetime")
            .description("指定ユーザーの通話時間を集計します")
            .add_option(
                CreateCommandOption::new(CommandOptionType::User, "user", "集計するユーザー")
                    .required(true),
            )
            .add_option(
                CreateCommandOption::new(
                    CommandOptionType::String,
                    "start_at",
                    "開始（YYYY-MM-DD か YYYY-MM-DD HH:MM）",
                )
                .required(true),
            )
            .add_option(
                CreateCommandOption::new(
                    CommandOptionType::String,
                    "end_at",
                    "終了（YYYY-MM-DD か YYYY-MM-DD HH:MM）",
                )
                .required(true),
            )
            .add_option(
                CreateCommandOption::new(
                    CommandOptionType::Channel,
                    "channel",
                    "対象のボイスチャンネル",
                )
                .channel_types(vec![ChannelType::Voice]),
            )
            .add_option(
                CreateCommandOption::new(CommandOptionType::Channel, "category", "対象のカテゴリ")
                    .channel_types(vec![ChannelType::Category]),
            ),
        tickets::ticket_command(),
    ]
}

#[async_trait]
impl EventHandler for Handler {
    async fn ready(&self, ctx: Context, ready: Ready) {
        info!("{} としてログインしました", ready.user.name);

        for cmd in command_definitions() {
            if let Err(e) = Command::create_global_command(&ctx.http, cmd).await {
                warn!("グローバルコマンドの登録に失敗: {:?}", e);
            }
        }

        // 参加中のギルドにも即時登録（グローバル反映の遅延対策）
        for guild_id in ctx.cache.guilds() {
            for cmd in command_definitions() {
                if let Err(e) = guild_id.create_command(&ctx.http, cmd).await {
                    warn!("ギルドコマンドの登録に失敗 ({}): {:?}", guild_id, e);
                }
            }
        }

        restore_live_sessions(&ctx).await;
    }

    async fn voice_state_update(&self, ctx: Context, old: Option<VoiceState>, new: VoiceState) {
        let Some(guild_id) = new.guild_id else { return };
        let Some(user) = new.member.as_ref().map(|m| &m.user) else {
            return;
        };
        if user.bot {
            return;
        }

        let old_channel = old.as_ref().and_then(|v| v.channel_id);
        let new_channel = new.channel_id;
        if old_channel == new_channel {
            // 同じチャンネル内のミュート切り替え等は対象外
            return;
        }

        let (tracker, store) = {
            let data = ctx.data.read().await;
            (
                data.get::<VoiceTracker>()
                    .expect("VoiceTracker が初期化されていません")
                    .clone(),
                data.get::<SessionStore>()
                    .expect("SessionStore が初期化されていません")
                    .clone(),
            )
        };

        let now = Utc::now();
        let user_id = user.id.get();

        // 退室側: 追跡中のセッションを閉じてレコードにする
        if old_channel.is_some() {
            match tracker.write().await.close(guild_id.get(), user_id) {
                Some(live) => {
                    let category_id =
                        channel_category(&ctx, guild_id, ChannelId::new(live.channel_id));
                    let record = SessionRecord {
                        user_id,
                        channel_id: live.channel_id,
                        category_id,
                        join: live.joined_at,
                        leave: now,
                    };
                    debug!(
                        "セッション終了: guild={} user={} channel={}",
                        guild_id, user_id, live.channel_id
                    );
                    if let Err(e) = store.append(guild_id.get(), record) {
                        warn!("セッションレコードの追記に失敗: {:?}", e);
                    }
                }
                // 追跡外（再起動タイミング等）の退室はレコードを残さない
                None => debug!(
                    "追跡していないセッションの退室: guild={} user={}",
                    guild_id, user_id
                ),
            }
        }

        // 入室側: 新しいセッションを開く
        if let Some(channel_id) = new_channel {
            tracker
                .write()
                .await
                .open(guild_id.get(), user_id, channel_id.get(), now);
            debug!(
                "セッション開始: guild={} user={} channel={}",
                guild_id, user_id, channel_id
            );
        }
    }

    async fn interaction_create(&self, ctx: Context, interaction: Interaction) {
        match interaction {
            Interaction::Command(cmd) => match cmd.data.name.as_str() {
                "voicetime" => handle_voicetime(&ctx, &cmd).await,
                tickets::COMMAND_NAME => tickets::handle_ticket_command(&ctx, &cmd).await,
                _ => {}
            },
            Interaction::Component(comp) => {
                if comp.data.custom_id == tickets::CREATE_BUTTON_ID {
                    tickets::handle_create(&ctx, &comp).await;
                } else if comp.data.custom_id.starts_with(tickets::CLOSE_BUTTON_PREFIX) {
                    tickets::handle_close(&ctx, &comp).await;
                }
            }
            _ => {}
        }
    }
}

/// 起動時にキャッシュ上の在室状況から進行中セッションを復元する。
/// 本来の入室時刻は分からないため復元時刻で代用する。
async fn restore_live_sessions(ctx: &Context) {
    let mut occupants: Vec<(u64, u64, u64)> = Vec::new();
    for guild_id in ctx.cache.guilds() {
        let Some(guild) = ctx.cache.guild(guild_id) else {
            continue;
        };
        for (user_id, voice) in &guild.voice_states {
            let Some(channel_id) = voice.channel_id else {
                continue;
            };
            // メンバーキャッシュに無い場合は bot ではないとみなす
            let is_bot = guild.members.get(user_id).map(|m| m.user.bot).unwrap_or(false);
            if is_bot {
                continue;
            }
            occupants.push((guild_id.get(), user_id.get(), channel_id.get()));
        }
    }

    let tracker = {
        let data = ctx.data.read().await;
        data.get::<VoiceTracker>()
            .expect("VoiceTracker が初期化されていません")
            .clone()
    };
    let restored = tracker
        .write()
        .await
        .restore_from_occupancy(&occupants, Utc::now());
    info!("在室中のセッションを {} 件復元しました", restored);
}

async fn handle_voicetime(ctx: &Context, cmd: &CommandInteraction) {
    let Some(guild_id) = cmd.guild_id else {
        respond(ctx, cmd, "⚠️ サーバー内でのみ使用できます。").await;
        return;
    };

    let (config, tracker, store) = {
        let data = ctx.data.read().await;
        (
            data.get::<Config>()
                .expect("Config が初期化されていません")
                .clone(),
            data.get::<VoiceTracker>()
                .expect("VoiceTracker が初期化されていません")
                .clone(),
            data.get::<SessionStore>()
                .expect("SessionStore が初期化されていません")
                .clone(),
        )
    };

    match build_report(ctx, cmd, guild_id, &config, &tracker, &store).await {
        Ok(text) => respond(ctx, cmd, &text).await,
        Err(e) => respond(ctx, cmd, &e.to_string()).await,
    }
}

/// フィルタと期間の検証が通ってから初めてストアを読む。
async fn build_report(
    ctx: &Context,
    cmd: &CommandInteraction,
    guild_id: GuildId,
    config: &Config,
    tracker: &Arc<RwLock<VoiceTracker>>,
    store: &SessionStore,
) -> Result<String, ReportError> {
    let user_id = user_option(cmd, "user").ok_or(ReportError::MissingOption("user"))?;
    let filter = LocationFilter::from_options(
        channel_option(cmd, "channel"),
        channel_option(cmd, "category"),
    )?;
    let start_raw = str_option(cmd, "start_at").ok_or(ReportError::MissingOption("start_at"))?;
    let end_raw = str_option(cmd, "end_at").ok_or(ReportError::MissingOption("end_at"))?;
    let (start, end) = report::parse_window(start_raw, end_raw, config.report_offset)?;

    let now = Utc::now();
    let doc = store.load();

    let live = {
        let guard = tracker.read().await;
        guard.current(guild_id.get(), user_id).cloned()
    }
    .map(|live| LiveEntry {
        category_id: channel_category(ctx, guild_id, ChannelId::new(live.channel_id)),
        channel_id: live.channel_id,
        joined_at: live.joined_at,
    });

    let result = report::run_report(&doc, guild_id.get(), user_id, filter, start, end, live, now);
    Ok(report::render_report(
        &result,
        user_id,
        start,
        end,
        config.report_offset,
    ))
}

async fn respond(ctx: &Context, cmd: &CommandInteraction, content: &str) {
    let _ = cmd
        .create_response(
            &ctx.http,
            CreateInteractionResponse::Message(
                CreateInteractionResponseMessage::new().content(content),
            ),
        )
        .await;
}

fn str_option<'a>(cmd: &'a CommandInteraction, name: &str) -> Option<&'a str> {
    cmd.data
        .options
        .iter()
        .find(|o| o.name == name)
        .and_then(|o| match &o.value {
            CommandDataOptionValue::String(s) => Some(s.as_str()),
            _ => None,
        })
}

fn user_option(cmd: &CommandInteraction, name: &str) -> Option<u64> {
    cmd.data
        .options
        .iter()
        .find(|o| o.name == name)
        .and_then(|o| match &o.value {
            CommandDataOptionValue::User(id) => Some(id.get()),
            _ => None,
        })
}

fn channel_option(cmd: &CommandInteraction, name: &str) -> Option<u64> {
    cmd.data
        .options
        .iter()
        .find(|o| o.name == name)
        .and_then(|o| match &o.value {
            CommandDataOptionValue::Channel(id) => Some(id.get()),
            _ => None,
        })
}

/// チャンネルの親カテゴリIDをキャッシュから引く。引けなければ None。
fn channel_category(ctx: &Context, guild_id: GuildId, channel_id: ChannelId) -> Option<u64> {
    let guild = ctx.cache.guild(guild_id)?;
    let channel = guild.channels.get(&channel_id)?;
    channel.parent_id.map(|id| id.get())
}
