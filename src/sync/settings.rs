//! Declarative per-user settings file consumed by `berth apply`.

use super::ConfigurationStore;
use crate::desired::{DesiredConfiguration, RosterAgent};
use crate::error::{ConfigError, Result};
use crate::instances::InstanceStore;

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

/// Everything a user slot declares: the desired configuration plus overlay
/// data (roster, variables) and outgoing delegation links.
#[derive(Debug, Clone, Deserialize)]
pub struct SettingsFile {
    #[serde(flatten)]
    pub desired: DesiredConfiguration,
    #[serde(default)]
    pub multi_agent: Option<MultiAgentSettings>,
    /// Plaintext here; sealed before it is stored.
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    #[serde(default)]
    pub links: Vec<LinkSettings>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MultiAgentSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub agents: Vec<RosterAgent>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LinkSettings {
    /// User slot whose instance receives delegated work.
    pub target_user: String,
    #[serde(default = "default_link_role")]
    pub role: String,
}

fn default_link_role() -> String {
    "delegate".to_string()
}

impl SettingsFile {
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|error| ConfigError::Parse(error.to_string()).into())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Load {
            path: path.display().to_string(),
            source: Arc::new(source),
        })?;
        Self::parse(&content)
    }

    /// Persist settings and overlay data. Variables not named in the file are
    /// kept; links are stored separately once the source instance exists.
    pub async fn store(&self, user_id: &str, configs: &ConfigurationStore) -> Result<()> {
        configs.save_settings(user_id, &self.desired).await?;

        let sealed = self
            .variables
            .iter()
            .map(|(name, value)| Ok((name, configs.cipher().encrypt(value)?)))
            .collect::<Result<Vec<_>>>()?;
        configs
            .update_overlay(user_id, |overlay| {
                if let Some(multi_agent) = &self.multi_agent {
                    overlay.multi_agent_enabled = multi_agent.enabled;
                    overlay.agents = multi_agent.agents.clone();
                }
                for (name, value_enc) in sealed {
                    overlay.set_variable(name, value_enc);
                }
            })
            .await
    }

    /// Add the declared links from `source_instance_id`. Targets without a
    /// live instance are skipped. Returns the number of links stored.
    pub async fn store_links(
        &self,
        source_instance_id: &str,
        configs: &ConfigurationStore,
        instances: &InstanceStore,
    ) -> Result<usize> {
        let mut stored = 0;
        for link in &self.links {
            let Some(target) = instances.get_by_user(&link.target_user).await? else {
                tracing::warn!(target_user = %link.target_user, "link target has no instance, skipping");
                continue;
            };
            configs.link(source_instance_id, &target.id, &link.role).await?;
            stored += 1;
        }
        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;
    use crate::desired::{ChannelKind, SessionScope};
    use crate::instances::PortAllocator;
    use crate::secrets::AesGcmCipher;
    use indoc::indoc;

    const FILE: &str = indoc! {r#"
        provider = "anthropic"
        api_key = "sk-ant-secret"
        model = "claude-sonnet-4"
        agent_name = "Ada"
        session_scope = "per-peer"

        [features]
        web_search = true
        memory = true

        [[channels]]
        type = "telegram"
        [channels.credentials]
        bot_token = "123:abc"
        allow_from = ["42", "43"]

        [multi_agent]
        enabled = true
        [[multi_agent.agents]]
        id = "code"
        name = "Coder"
        role = "writes code"

        [variables]
        GITHUB_TOKEN = "ghp_plain"

        [[links]]
        target_user = "bob"
        role = "research"
    "#};

    #[test]
    fn parses_the_full_file() {
        let settings = SettingsFile::parse(FILE).expect("parse");
        assert_eq!(settings.desired.provider, "anthropic");
        assert_eq!(settings.desired.workspace, "/data/workspace");
        assert_eq!(settings.desired.session_scope, SessionScope::PerPeer);
        assert!(settings.desired.features.memory);
        assert_eq!(settings.desired.channels[0].kind, ChannelKind::Telegram);
        assert_eq!(settings.desired.channels[0].credential("bot_token"), Some("123:abc"));
        assert_eq!(settings.multi_agent.as_ref().unwrap().agents[0].id, "code");
        assert_eq!(settings.links[0].role, "research");
    }

    #[test]
    fn missing_provider_is_a_parse_error() {
        let error = SettingsFile::parse("model = \"x\"\napi_key = \"k\"\n").unwrap_err();
        assert!(matches!(error, crate::Error::Config(ConfigError::Parse(_))));
    }

    #[tokio::test]
    async fn store_writes_settings_and_overlay() {
        let db = Db::in_memory().await.expect("db");
        let configs = ConfigurationStore::new(
            db.sqlite.clone(),
            Arc::new(AesGcmCipher::new("test-master-key").unwrap()),
        );
        let instances = InstanceStore::new(db.sqlite, PortAllocator::new(20000, 20010));

        let settings = SettingsFile::parse(FILE).unwrap();
        settings.store("alice", &configs).await.expect("store");

        let overlay = configs.overlay("alice").await.unwrap();
        assert!(overlay.multi_agent_enabled);
        assert_eq!(overlay.agents.len(), 1);
        assert_eq!(overlay.variables[0].name, "GITHUB_TOKEN");

        let source = instances.create("alice", "berth-alice").await.unwrap();
        assert_eq!(settings.store_links(&source.id, &configs, &instances).await.unwrap(), 0);
        instances.create("bob", "berth-bob").await.unwrap();
        assert_eq!(settings.store_links(&source.id, &configs, &instances).await.unwrap(), 1);
    }
}
