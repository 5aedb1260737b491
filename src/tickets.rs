use std::time::Duration;

use chrono::{DateTime, Utc};
use serenity::all::{
    ButtonStyle, ChannelId, ChannelType, CommandInteraction, ComponentInteraction,
    CreateActionRow, CreateAttachment, CreateButton, CreateChannel, CreateCommand, CreateEmbed,
    CreateInteractionResponse, CreateInteractionResponseMessage, CreateMessage, GetMessages,
    Message, MessageId, PermissionOverwrite, PermissionOverwriteType, Permissions, RoleId,
    Timestamp,
};
use serenity::prelude::*;
use tracing::warn;

use crate::config::Config;

pub const COMMAND_NAME: &str = "ticket";
pub const CREATE_BUTTON_ID: &str = "create_ticket";
/// 閉じるボタンの custom_id は「接頭辞 + 起票者ID」
pub const CLOSE_BUTTON_PREFIX: &str = "close_ticket:";

/// チケット作成ボタン付きの案内メッセージを送るコマンド。
pub fn ticket_command() -> CreateCommand {
    CreateCommand::new(COMMAND_NAME).description("問い合わせ用チケット作成ボタンを送信します")
}

pub async fn handle_ticket_command(ctx: &Context, cmd: &CommandInteraction) {
    let row = CreateActionRow::Buttons(vec![
        CreateButton::new(CREATE_BUTTON_ID)
            .label("📩 チケットを作成")
            .style(ButtonStyle::Success),
    ]);
    let _ = cmd
        .create_response(
            &ctx.http,
            CreateInteractionResponse::Message(
                CreateInteractionResponseMessage::new()
                    .content("質問や問い合わせは下のボタンからチケットを作成してください。")
                    .components(vec![row]),
            ),
        )
        .await;
}

/// チケットチャンネルを作成する。ボタンを押したチャンネルの親カテゴリ配下に作る。
pub async fn handle_create(ctx: &Context, comp: &ComponentInteraction) {
    let Some(guild_id) = comp.guild_id else { return };

    let config = {
        let data = ctx.data.read().await;
        data.get::<Config>()
            .expect("Config が初期化されていません")
            .clone()
    };

    // カテゴリと連番をキャッシュから決める（ガードは await の前に手放す）
    let plan = {
        let Some(guild) = ctx.cache.guild(guild_id) else {
            return;
        };
        let category_id = guild
            .channels
            .get(&comp.channel_id)
            .and_then(|c| c.parent_id);
        category_id.map(|category_id| {
            let base = guild
                .channels
                .get(&category_id)
                .map(|c| format!("{}-問い合わせ", c.name))
                .unwrap_or_else(|| "問い合わせ".to_string());
            let count = guild
                .channels
                .values()
                .filter(|c| c.parent_id == Some(category_id) && c.name.starts_with(&base))
                .count();
            (category_id, format!("{}-{}", base, count + 1))
        })
    };

    let Some((category_id, channel_name)) = plan else {
        respond_ephemeral(ctx, comp, "⚠️ このチャンネルはカテゴリーに属していません。").await;
        return;
    };

    // @everyone ロールのIDはギルドIDと同じ
    let everyone = RoleId::new(guild_id.get());
    let overwrites = vec![
        PermissionOverwrite {
            allow: Permissions::empty(),
            deny: Permissions::VIEW_CHANNEL,
            kind: PermissionOverwriteType::Role(everyone),
        },
        PermissionOverwrite {
            allow: Permissions::VIEW_CHANNEL | Permissions::SEND_MESSAGES,
            deny: Permissions::empty(),
            kind: PermissionOverwriteType::Member(comp.user.id),
        },
        PermissionOverwrite {
            allow: Permissions::VIEW_CHANNEL | Permissions::SEND_MESSAGES,
            deny: Permissions::empty(),
            kind: PermissionOverwriteType::Role(RoleId::new(config.support_role_id)),
        },
    ];

    let builder = CreateChannel::new(channel_name)
        .kind(ChannelType::Text)
        .category(category_id)
        .topic(format!("{} の問い合わせチケット", comp.user.name))
        .permissions(overwrites);

    let channel = match guild_id.create_channel(&ctx.http, builder).await {
        Ok(channel) => channel,
        Err(e) => {
            warn!("チケットチャンネルの作成に失敗: {:?}", e);
            respond_ephemeral(ctx, comp, "⚠️ チャンネルを作成できませんでした。").await;
            return;
        }
    };

    respond_ephemeral(
        ctx,
        comp,
        &format!("✅ チケットを作成しました: <#{}>", channel.id),
    )
    .await;

    let close_row = CreateActionRow::Buttons(vec![
        CreateButton::new(format!("{}{}", CLOSE_BUTTON_PREFIX, comp.user.id.get()))
            .label("✅ 問い合わせ終了")
            .style(ButtonStyle::Danger),
    ]);
    let _ = channel
        .id
        .send_message(
            &ctx.http,
            CreateMessage::new()
                .content(format!(
                    "<@{}> 問い合わせ内容を送信してください。担当者が対応します。",
                    comp.user.id.get()
                ))
                .components(vec![close_row]),
        )
        .await;
}

/// 履歴を転記してからチケットチャンネルを削除する。
pub async fn handle_close(ctx: &Context, comp: &ComponentInteraction) {
    let config = {
        let data = ctx.data.read().await;
        data.get::<Config>()
            .expect("Config が初期化されていません")
            .clone()
    };

    let opener_id: Option<u64> = comp
        .data
        .custom_id
        .strip_prefix(CLOSE_BUTTON_PREFIX)
        .and_then(|raw| raw.parse().ok());

    respond_ephemeral(ctx, comp, "🗑 5秒後にチャンネルを削除します。ログを送信中...").await;

    let channel_id = comp.channel_id;
    let messages = collect_history(ctx, channel_id).await;

    let mut transcript = String::new();
    for msg in &messages {
        let stamp = DateTime::<Utc>::from_timestamp(msg.timestamp.unix_timestamp(), 0)
            .unwrap_or_default()
            .with_timezone(&config.report_offset)
            .format("%Y/%m/%d %H:%M");
        transcript.push_str(&format!("[{}] {}: {}\n", stamp, msg.author.name, msg.content));
    }

    let channel_name = channel_id
        .name(&ctx.http)
        .await
        .unwrap_or_else(|_| "不明なチャンネル".to_string());

    let description = match opener_id {
        Some(id) => format!("<@{}> の問い合わせチャンネルが終了しました。", id),
        None => "問い合わせチャンネルが終了しました。".to_string(),
    };
    let embed = CreateEmbed::new()
        .title("📩 問い合わせチケットログ")
        .description(description)
        .field("チャンネル名", &channel_name, false)
        .field("メッセージ数", messages.len().to_string(), false)
        .timestamp(Timestamp::now());

    let filename = format!("{}_log.txt", sanitize_filename(&channel_name));
    let attachment = CreateAttachment::bytes(transcript.into_bytes(), filename);

    let log_channel = ChannelId::new(config.log_channel_id);
    if let Err(e) = log_channel
        .send_message(&ctx.http, CreateMessage::new().embed(embed).add_file(attachment))
        .await
    {
        warn!("チケットログの送信に失敗: {:?}", e);
    }

    tokio::time::sleep(Duration::from_secs(5)).await;
    if let Err(e) = channel_id.delete(&ctx.http).await {
        warn!("チケットチャンネルの削除に失敗: {:?}", e);
    }
}

async fn respond_ephemeral(ctx: &Context, comp: &ComponentInteraction, content: &str) {
    let _ = comp
        .create_response(
            &ctx.http,
            CreateInteractionResponse::Message(
                CreateInteractionResponseMessage::new()
                    .content(content)
                    .ephemeral(true),
            ),
        )
        .await;
}

/// チャンネル履歴を古い順で集める。100件ずつ遡る。
async fn collect_history(ctx: &Context, channel_id: ChannelId) -> Vec<Message> {
    const PAGE: u8 = 100;
    const MAX_MESSAGES: usize = 1000;

    let mut collected: Vec<Message> = Vec::new();
    let mut before: Option<MessageId> = None;
    loop {
        let mut request = GetMessages::new().limit(PAGE);
        if let Some(id) = before {
            request = request.before(id);
        }
        let batch = match channel_id.messages(&ctx.http, request).await {
            Ok(batch) => batch,
            Err(e) => {
                warn!("履歴の取得に失敗: {:?}", e);
                break;
            }
        };
        if batch.is_empty() {
            break;
        }
        // 返ってくるのは新しい順。末尾が最古。
        before = batch.last().map(|m| m.id);
        let page_len = batch.len();
        collected.extend(batch);
        if page_len < PAGE as usize || collected.len() >= MAX_MESSAGES {
            break;
        }
    }
    collected.reverse();
    collected
}

/// ファイル名に使えない文字を置き換える。
fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '\\' | '/' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c => c,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_forbidden_characters() {
        assert_eq!(sanitize_filename("a/b\\c:d"), "a_b_c_d");
        assert_eq!(sanitize_filename("サポート-問い合わせ-1"), "サポート-問い合わせ-1");
    }

    #[test]
    fn close_button_id_round_trips_opener() {
        let custom_id = format!("{}{}", CLOSE_BUTTON_PREFIX, 1234u64);
        let parsed: Option<u64> = custom_id
            .strip_prefix(CLOSE_BUTTON_PREFIX)
            .and_then(|raw| raw.parse().ok());
        assert_eq!(parsed, Some(1234));
    }
}
