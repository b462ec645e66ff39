//! Desired configuration → runtime config + secret environment.
//!
//! [`compile`] is pure: no I/O, no clock, no randomness. JSON objects are
//! `BTreeMap`-backed so the serialized output is byte-identical for identical
//! input, which lets the synchronizer call it on every rebuild.

pub mod channels;

use crate::desired::DesiredConfiguration;
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;

/// Flat environment handed to the running process.
pub type SecretEnv = BTreeMap<String, String>;

/// Port the runtime gateway listens on inside the instance.
pub const GATEWAY_PORT: u16 = 18789;

/// Environment variable carrying the agent display name.
pub const AGENT_NAME_VAR: &str = "AGENT_NAME";

/// Environment variable carrying the free-text system prompt.
pub const SYSTEM_PROMPT_VAR: &str = "AGENT_SYSTEM_PROMPT";

/// Environment variable carrying the text-to-speech provider key.
pub const TTS_KEY_VAR: &str = "ELEVENLABS_API_KEY";

/// Result of one compiler pass.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledOutput {
    pub config: Value,
    pub env: SecretEnv,
}

impl CompiledOutput {
    /// Canonical serialization of the runtime config.
    pub fn config_json(&self) -> String {
        self.config.to_string()
    }
}

/// Static provider id → API key variable table.
pub fn provider_env_var(provider: &str) -> Option<&'static str> {
    match provider {
        "anthropic" => Some("ANTHROPIC_API_KEY"),
        "openai" => Some("OPENAI_API_KEY"),
        "openrouter" => Some("OPENROUTER_API_KEY"),
        "google" | "gemini" => Some("GEMINI_API_KEY"),
        "groq" => Some("GROQ_API_KEY"),
        "mistral" => Some("MISTRAL_API_KEY"),
        "xai" => Some("XAI_API_KEY"),
        "deepseek" => Some("DEEPSEEK_API_KEY"),
        _ => None,
    }
}

/// Qualify a model id with its provider unless it already carries one.
pub fn qualified_model(provider: &str, model: &str) -> String {
    let model = model.trim();
    if model.contains('/') {
        model.to_string()
    } else {
        format!("{provider}/{model}")
    }
}

/// Map the internal DM policy vocabulary onto the runtime's.
///
/// Anything missing or unknown becomes `pairing`, so an unexpected value
/// never opens the instance to strangers.
pub fn normalize_dm_policy(policy: Option<&str>) -> &'static str {
    match policy.map(|value| value.trim().to_ascii_lowercase()).as_deref() {
        Some("open") => "open",
        Some("closed") | Some("disabled") => "disabled",
        _ => "pairing",
    }
}

/// Accept a list or a comma-separated string; return trimmed, non-empty ids.
pub fn normalize_allowlist(value: Option<&Value>) -> Vec<String> {
    let raw: Vec<String> = match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(text) => Some(text.clone()),
                Value::Number(number) => Some(number.to_string()),
                _ => None,
            })
            .collect(),
        Some(Value::String(text)) => text.split(',').map(str::to_string).collect(),
        Some(Value::Number(number)) => vec![number.to_string()],
        _ => Vec::new(),
    };

    raw.into_iter()
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
        .collect()
}

/// Expand guild or room ids into an id-keyed map. Empty input yields `None`
/// so the field is left out instead of emitted as `{}`.
pub fn normalize_guild_ids(value: Option<&Value>) -> Option<Map<String, Value>> {
    let ids = normalize_allowlist(value);
    if ids.is_empty() {
        return None;
    }
    Some(
        ids.into_iter()
            .map(|id| (id, Value::Object(Map::new())))
            .collect(),
    )
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

/// Compile the desired configuration.
pub fn compile(desired: &DesiredConfiguration) -> CompiledOutput {
    let mut env = SecretEnv::new();

    if let (Some(variable), Some(key)) = (
        provider_env_var(&desired.provider),
        non_blank(Some(desired.api_key.as_str())),
    ) {
        env.insert(variable.to_string(), key.to_string());
    }

    // Identity goes to the environment only. The runtime has no JSON slot for
    // it and writes IDENTITY.md / SOUL.md at boot instead.
    if let Some(name) = non_blank(desired.agent_name.as_deref()) {
        env.insert(AGENT_NAME_VAR.to_string(), name.to_string());
    }
    if let Some(prompt) = non_blank(desired.system_prompt.as_deref()) {
        env.insert(SYSTEM_PROMPT_VAR.to_string(), prompt.to_string());
    }

    let dm_policy = normalize_dm_policy(desired.dm_policy.as_deref());
    let mut channel_blocks = Map::new();
    for entry in &desired.channels {
        if let Some(block) = channels::compile_channel(entry, dm_policy, &mut env) {
            channel_blocks.insert(entry.kind.as_str().to_string(), block);
        }
    }

    let mut config = Map::new();
    config.insert(
        "gateway".into(),
        json!({
            "mode": "local",
            "bind": "lan",
            "port": GATEWAY_PORT,
            "auth": { "mode": "token", "token": desired.gateway_token },
        }),
    );
    config.insert("agents".into(), agents_block(desired));
    if let Some(bindings) = roster_bindings(desired) {
        config.insert("bindings".into(), bindings);
    }
    config.insert(
        "session".into(),
        json!({ "dmScope": desired.session_scope.as_str() }),
    );
    if !channel_blocks.is_empty() {
        config.insert("channels".into(), Value::Object(channel_blocks));
    }

    compile_features(desired, &mut config, &mut env);

    CompiledOutput {
        config: Value::Object(config),
        env,
    }
}

fn agents_block(desired: &DesiredConfiguration) -> Value {
    let mut agents = Map::new();
    agents.insert(
        "defaults".into(),
        json!({
            "workspace": desired.workspace,
            "model": { "primary": qualified_model(&desired.provider, &desired.model) },
            "thinkingDefault": desired.thinking.as_str(),
        }),
    );

    if desired.multi_agent_enabled && !desired.roster.is_empty() {
        let list: Vec<Value> = desired
            .roster
            .iter()
            .map(|agent| {
                json!({
                    "id": agent.id,
                    "name": agent.name,
                    "workspace": format!("{}/{}", desired.workspace.trim_end_matches('/'), agent.id),
                })
            })
            .collect();
        agents.insert("list".into(), Value::Array(list));
    }

    Value::Object(agents)
}

fn roster_bindings(desired: &DesiredConfiguration) -> Option<Value> {
    if !desired.multi_agent_enabled {
        return None;
    }

    let bindings: Vec<Value> = desired
        .roster
        .iter()
        .flat_map(|agent| {
            agent.bindings.iter().map(move |binding| {
                let mut matcher = Map::new();
                matcher.insert("channel".into(), json!(binding.channel));
                if let Some(peer) = &binding.peer {
                    matcher.insert("peer".into(), json!({ "id": peer }));
                }
                json!({ "agentId": agent.id, "match": matcher })
            })
        })
        .collect();

    (!bindings.is_empty()).then_some(Value::Array(bindings))
}

fn compile_features(desired: &DesiredConfiguration, config: &mut Map<String, Value>, env: &mut SecretEnv) {
    let features = &desired.features;
    let mut web = Map::new();

    if features.web_search
        && let Some(key) = non_blank(features.web_search_key.as_deref())
    {
        web.insert(
            "search".into(),
            json!({ "enabled": true, "provider": "brave", "apiKey": key }),
        );
    }

    // Memory and browser automation call back into the control plane over
    // plain HTTP, so they drag web fetch in with them.
    if features.web_fetch || features.memory || features.browser {
        web.insert("fetch".into(), json!({ "enabled": true }));
    }

    if !web.is_empty() {
        config.insert("tools".into(), json!({ "web": web }));
    }

    if features.browser {
        config.insert("browser".into(), json!({ "enabled": true }));
    }

    if features.tts
        && let Some(key) = non_blank(features.tts_key.as_deref())
    {
        env.insert(TTS_KEY_VAR.to_string(), key.to_string());
        config.insert(
            "tts".into(),
            json!({ "enabled": true, "provider": "elevenlabs", "auto": "inbound" }),
        );
    }

    if features.canvas {
        config.insert("canvasHost".into(), json!({ "enabled": true }));
    }

    if features.cron {
        config.insert("cron".into(), json!({ "enabled": true }));
    }

    if features.memory {
        config.insert(
            "memorySearch".into(),
            json!({ "enabled": true, "sources": ["memory", "sessions"] }),
        );
    }
}
