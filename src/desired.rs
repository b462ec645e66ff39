//! Backend-agnostic desired configuration for one instance.
//!
//! This is what the settings surface declares and what the compiler consumes.
//! The enrichment fields at the bottom of [`DesiredConfiguration`] are filled
//! only by the synchronizer and are never persisted as-is.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Free-form credential map of a channel entry. Values are usually strings but
/// allowlists and guild ids may arrive as arrays.
pub type ChannelCredentials = BTreeMap<String, Value>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DesiredConfiguration {
    pub provider: String,
    pub api_key: String,
    pub model: String,
    #[serde(default)]
    pub channels: Vec<ChannelEntry>,
    #[serde(default)]
    pub features: FeatureToggles,
    #[serde(default = "default_workspace")]
    pub workspace: String,
    pub agent_name: Option<String>,
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub thinking: ThinkingLevel,
    #[serde(default)]
    pub session_scope: SessionScope,
    /// Raw policy as stored. Normalized by the compiler, see
    /// [`crate::compiler::normalize_dm_policy`].
    pub dm_policy: Option<String>,
    #[serde(default)]
    pub gateway_token: String,

    /// Memory digest that was prepended to the system prompt.
    #[serde(skip)]
    pub memory_digest: Option<String>,
    #[serde(skip)]
    pub delegation_targets: Vec<DelegationTarget>,
    #[serde(skip)]
    pub multi_agent_enabled: bool,
    #[serde(skip)]
    pub roster: Vec<RosterAgent>,
    #[serde(skip)]
    pub variables: Vec<NamedVariable>,
}

pub(crate) fn default_workspace() -> String {
    "/data/workspace".to_string()
}

/// One messaging channel the instance should connect to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelEntry {
    #[serde(rename = "type")]
    pub kind: ChannelKind,
    #[serde(default)]
    pub credentials: ChannelCredentials,
}

impl ChannelEntry {
    pub fn new(kind: ChannelKind) -> Self {
        Self {
            kind,
            credentials: ChannelCredentials::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.credentials.insert(key.to_string(), value.into());
        self
    }

    /// Trimmed, non-empty string credential.
    pub fn credential(&self, key: &str) -> Option<&str> {
        self.credentials
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    /// Chat-bot channel, needs a bot token.
    Telegram,
    /// Team-chat channel, needs a token and an application id.
    Discord,
    Slack,
    /// Paired by QR code through the bridge, no stored credentials.
    Whatsapp,
}

impl ChannelKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ChannelKind::Telegram => "telegram",
            ChannelKind::Discord => "discord",
            ChannelKind::Slack => "slack",
            ChannelKind::Whatsapp => "whatsapp",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "telegram" => Some(ChannelKind::Telegram),
            "discord" => Some(ChannelKind::Discord),
            "slack" => Some(ChannelKind::Slack),
            "whatsapp" => Some(ChannelKind::Whatsapp),
            _ => None,
        }
    }
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureToggles {
    #[serde(default)]
    pub web_search: bool,
    pub web_search_key: Option<String>,
    #[serde(default)]
    pub web_fetch: bool,
    /// Browser automation.
    #[serde(default)]
    pub browser: bool,
    #[serde(default)]
    pub tts: bool,
    pub tts_key: Option<String>,
    #[serde(default)]
    pub canvas: bool,
    /// Scheduled tasks.
    #[serde(default)]
    pub cron: bool,
    /// Long-term memory.
    #[serde(default)]
    pub memory: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThinkingLevel {
    Off,
    Minimal,
    #[default]
    Low,
    Medium,
    High,
}

impl ThinkingLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            ThinkingLevel::Off => "off",
            ThinkingLevel::Minimal => "minimal",
            ThinkingLevel::Low => "low",
            ThinkingLevel::Medium => "medium",
            ThinkingLevel::High => "high",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "off" => Some(ThinkingLevel::Off),
            "minimal" => Some(ThinkingLevel::Minimal),
            "low" => Some(ThinkingLevel::Low),
            "medium" => Some(ThinkingLevel::Medium),
            "high" => Some(ThinkingLevel::High),
            _ => None,
        }
    }
}

/// How direct-message sessions are shared between peers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionScope {
    /// Every peer shares the main session.
    #[default]
    Main,
    PerPeer,
    PerChannelPeer,
}

impl SessionScope {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionScope::Main => "main",
            SessionScope::PerPeer => "per-peer",
            SessionScope::PerChannelPeer => "per-channel-peer",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "main" => Some(SessionScope::Main),
            "per-peer" => Some(SessionScope::PerPeer),
            "per-channel-peer" => Some(SessionScope::PerChannelPeer),
            _ => None,
        }
    }
}

/// Another instance this one may delegate work to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelegationTarget {
    pub instance_id: String,
    pub name: String,
    pub role: String,
    pub url: Option<String>,
    pub token: String,
}

/// Member of the native multi-agent roster.
///
/// Fields this crate does not interpret (model, emoji, ...) are kept in
/// `extra` so the roster survives every rebuild unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RosterAgent {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub role: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bindings: Vec<RosterBinding>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Routes inbound traffic from a channel (optionally a single peer) to a
/// roster agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RosterBinding {
    pub channel: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Decrypted named secret variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedVariable {
    pub name: String,
    pub value: String,
}
