//! Per-channel requirement table and settings blocks.

use super::{SecretEnv, normalize_allowlist, normalize_guild_ids};
use crate::desired::{ChannelEntry, ChannelKind};
use serde_json::{Map, Value, json};

/// Credentials a channel type cannot run without, each paired with the
/// environment variable it is exported as.
pub fn required_credentials(kind: ChannelKind) -> &'static [(&'static str, &'static str)] {
    match kind {
        ChannelKind::Telegram => &[("bot_token", "TELEGRAM_BOT_TOKEN")],
        ChannelKind::Discord => &[
            ("token", "DISCORD_BOT_TOKEN"),
            ("application_id", "DISCORD_APPLICATION_ID"),
        ],
        ChannelKind::Slack => &[
            ("bot_token", "SLACK_BOT_TOKEN"),
            ("app_token", "SLACK_APP_TOKEN"),
        ],
        ChannelKind::Whatsapp => &[],
    }
}

/// Whether every required credential of the entry is present and non-blank.
pub fn is_complete(entry: &ChannelEntry) -> bool {
    required_credentials(entry.kind)
        .iter()
        .all(|(key, _)| entry.credential(key).is_some())
}

/// Build the settings block for one channel and export its secrets.
///
/// Returns `None` for incomplete entries; nothing is written to `env` then.
pub fn compile_channel(entry: &ChannelEntry, dm_policy: &str, env: &mut SecretEnv) -> Option<Value> {
    if !is_complete(entry) {
        return None;
    }

    for (key, variable) in required_credentials(entry.kind) {
        if let Some(value) = entry.credential(key) {
            env.insert((*variable).to_string(), value.to_string());
        }
    }

    let mut block = Map::new();
    block.insert("enabled".into(), Value::Bool(true));
    block.insert("dmPolicy".into(), Value::String(dm_policy.to_string()));

    let mut allow_from = normalize_allowlist(entry.credentials.get("allow_from"));
    if allow_from.is_empty() && dm_policy == "open" {
        // The runtime refuses an open DM policy without a wildcard allowlist.
        allow_from.push("*".to_string());
    }
    if !allow_from.is_empty() {
        block.insert("allowFrom".into(), json!(allow_from));
    }

    match entry.kind {
        ChannelKind::Telegram => {
            block.insert("botToken".into(), json!(entry.credential("bot_token")));
        }
        ChannelKind::Discord => {
            block.insert("token".into(), json!(entry.credential("token")));
            block.insert(
                "applicationId".into(),
                json!(entry.credential("application_id")),
            );
            if let Some(guilds) = normalize_guild_ids(entry.credentials.get("guild_ids")) {
                block.insert("guilds".into(), Value::Object(guilds));
            }
        }
        ChannelKind::Slack => {
            block.insert("mode".into(), json!("socket"));
            block.insert("botToken".into(), json!(entry.credential("bot_token")));
            block.insert("appToken".into(), json!(entry.credential("app_token")));
            if let Some(channels) = normalize_guild_ids(entry.credentials.get("channel_ids")) {
                block.insert("channels".into(), Value::Object(channels));
            }
        }
        ChannelKind::Whatsapp => {}
    }

    Some(Value::Object(block))
}
