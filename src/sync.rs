//! Configuration synchronization: rebuild, compile, persist, apply.
//!
//! Every settings change funnels through [`ConfigSynchronizer`]. A rebuild
//! reconstructs the desired configuration from storage, runs the enrichment
//! steps, compiles, persists the compiled config merged with the overlay and
//! finally pushes it to the active provider.
//!
//! Enrichment steps (memory, delegation, orchestration, variables) are
//! isolated from each other: a failing step is logged and skipped and the
//! rest of the pipeline carries on.

pub mod enrich;
pub mod overlay;
pub mod settings;
pub mod store;

pub use overlay::{META_KEY, MetaOverlay, SealedVariable, extract_overlay, merge_overlay};
pub use settings::SettingsFile;
pub use store::{ConfigurationStore, StoredConfiguration};

use crate::compiler::{CompiledOutput, compile};
use crate::deploy::{DeployOutcome, DeploymentProvider};
use crate::desired::{DesiredConfiguration, NamedVariable};
use crate::error::Result;
use crate::instances::InstanceStore;
use crate::memory::MemoryService;
use enrich::PromptBuilder;

use anyhow::Context as _;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Output of one rebuild, before it is applied.
#[derive(Debug, Clone)]
pub struct Rebuilt {
    pub desired: DesiredConfiguration,
    pub compiled: CompiledOutput,
    /// Live instance of the user slot, if any.
    pub instance_id: Option<String>,
}

pub struct ConfigSynchronizer {
    configs: ConfigurationStore,
    instances: InstanceStore,
    provider: Arc<dyn DeploymentProvider>,
    memory: Option<Arc<dyn MemoryService>>,
    callback_base: Option<String>,
    /// One lock per user slot. Rebuilds for the same user run one at a time.
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl std::fmt::Debug for ConfigSynchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigSynchronizer")
            .field("provider", &self.provider.kind())
            .field("memory", &self.memory.is_some())
            .field("callback_base", &self.callback_base)
            .finish_non_exhaustive()
    }
}

impl ConfigSynchronizer {
    pub fn new(
        configs: ConfigurationStore,
        instances: InstanceStore,
        provider: Arc<dyn DeploymentProvider>,
    ) -> Self {
        Self {
            configs,
            instances,
            provider,
            memory: None,
            callback_base: None,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_memory(mut self, memory: Arc<dyn MemoryService>) -> Self {
        self.memory = Some(memory);
        self
    }

    /// Base URL instances call back to for named variable lookups.
    pub fn with_callback_base(mut self, callback_base: impl Into<String>) -> Self {
        self.callback_base = Some(callback_base.into());
        self
    }

    pub fn configs(&self) -> &ConfigurationStore {
        &self.configs
    }

    pub fn provider(&self) -> &Arc<dyn DeploymentProvider> {
        &self.provider
    }

    /// Rebuild and persist without touching the backend.
    pub async fn rebuild(&self, user_id: &str) -> Result<Rebuilt> {
        let _guard = self.lock_user(user_id).await;
        self.rebuild_locked(user_id).await
    }

    /// Rebuild, persist and push to the running instance.
    ///
    /// Returns the instance the configuration was applied to, or `None` when
    /// the user has no instance yet (the compiled config is still persisted).
    /// A failing push leaves the persisted config in place.
    pub async fn rebuild_and_apply(&self, user_id: &str) -> Result<Option<String>> {
        let _guard = self.lock_user(user_id).await;
        self.apply_locked(user_id).await
    }

    /// Rebuild, persist and deploy a fresh instance for the user slot.
    pub async fn provision(&self, user_id: &str) -> Result<DeployOutcome> {
        let _guard = self.lock_user(user_id).await;
        let rebuilt = self.rebuild_locked(user_id).await?;

        let result = self.provider.deploy(user_id, &rebuilt.desired).await;

        // Deploy replaces the row even when the rollout fails, so follow the
        // slot to whatever instance exists now.
        let current = self.instances.get_by_user(user_id).await?;
        let current_id = current.as_ref().map(|instance| instance.id.clone());
        self.configs
            .set_instance(user_id, current_id.as_deref())
            .await?;
        if let (Some(previous), Some(current)) = (rebuilt.instance_id.as_deref(), current_id.as_deref())
            && previous != current
        {
            self.instances.relink(previous, current).await?;
            tracing::debug!(user_id, previous, current, "agent links moved to new instance");
        }

        result
    }

    /// Replace the gateway token and push the new configuration.
    pub async fn rotate_gateway_token(&self, user_id: &str) -> Result<Option<String>> {
        let _guard = self.lock_user(user_id).await;
        self.configs.rotate_gateway_token(user_id).await?;
        self.apply_locked(user_id).await
    }

    async fn lock_user(&self, user_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks.entry(user_id.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }

    async fn apply_locked(&self, user_id: &str) -> Result<Option<String>> {
        let rebuilt = self.rebuild_locked(user_id).await?;
        let Some(instance_id) = rebuilt.instance_id else {
            tracing::info!(user_id, "no instance to apply to, compiled config persisted only");
            return Ok(None);
        };

        self.provider
            .update_config(&instance_id, &rebuilt.desired)
            .await?;
        tracing::info!(user_id, %instance_id, backend = self.provider.kind(), "configuration applied");
        Ok(Some(instance_id))
    }

    async fn rebuild_locked(&self, user_id: &str) -> Result<Rebuilt> {
        let (mut desired, instance_id) = self.assemble(user_id).await?;
        self.enrich(user_id, instance_id.as_deref(), &mut desired).await;

        let compiled = compile(&desired);
        self.configs.save_compiled(user_id, &compiled.config).await?;

        tracing::debug!(
            user_id,
            channels = desired.channels.len(),
            multi_agent = desired.multi_agent_enabled,
            "configuration rebuilt"
        );
        Ok(Rebuilt {
            desired,
            compiled,
            instance_id,
        })
    }

    /// Declared settings, gateway token and overlay data. Failures here abort
    /// the rebuild.
    async fn assemble(
        &self,
        user_id: &str,
    ) -> Result<(DesiredConfiguration, Option<String>)> {
        let stored = self.configs.require(user_id).await?;
        let gateway_token = self.configs.ensure_gateway_token(user_id).await?;
        let overlay = stored
            .full_config
            .as_ref()
            .map(extract_overlay)
            .transpose()
            .context("failed to read configuration overlay")?
            .unwrap_or_default();

        let mut desired = stored.desired;
        desired.gateway_token = gateway_token;
        desired.multi_agent_enabled = overlay.multi_agent_enabled;
        desired.roster = overlay.agents.clone();
        desired.variables = overlay
            .variables
            .iter()
            .filter_map(|sealed| match self.configs.cipher().decrypt(&sealed.value_enc) {
                Ok(value) => Some(NamedVariable {
                    name: sealed.name.clone(),
                    value,
                }),
                Err(error) => {
                    tracing::warn!(user_id, variable = %sealed.name, %error, "skipping variable that failed to decrypt");
                    None
                }
            })
            .collect();

        let instance_id = self
            .instances
            .get_by_user(user_id)
            .await?
            .map(|instance| instance.id);

        Ok((desired, instance_id))
    }

    async fn enrich(&self, user_id: &str, instance_id: Option<&str>, desired: &mut DesiredConfiguration) {
        let mut prompt = PromptBuilder::new(desired.system_prompt.as_deref());

        if desired.features.memory {
            match self.fetch_memory(user_id).await {
                Ok((digest, instructions)) => {
                    if let Some(digest) = digest {
                        prompt.prepend(enrich::memory_context(&digest));
                        desired.memory_digest = Some(digest);
                    }
                    if let Some(instructions) = instructions {
                        prompt.append(enrich::memory_write_instructions(&instructions));
                    }
                }
                Err(error) => {
                    tracing::warn!(user_id, %error, "memory enrichment failed, continuing without it");
                }
            }
        }

        if !desired.multi_agent_enabled {
            if let Some(instance_id) = instance_id {
                match self.configs.delegation_targets(instance_id).await {
                    Ok(targets) => {
                        if let Some(text) = enrich::delegation_instructions(&targets) {
                            prompt.append(text);
                        }
                        desired.delegation_targets = targets;
                    }
                    Err(error) => {
                        tracing::warn!(user_id, %error, "delegation enrichment failed, continuing without it");
                    }
                }
            }
        } else if let Some(text) = enrich::orchestration_instructions(&desired.roster) {
            prompt.append(text);
        }

        if !desired.variables.is_empty() {
            match self.callback_base.as_deref() {
                Some(base) => {
                    if let Some(text) = enrich::variable_instructions(&desired.variables, base, user_id) {
                        prompt.append(text);
                    }
                }
                None => {
                    tracing::warn!(
                        user_id,
                        variables = desired.variables.len(),
                        "variables stored but no callback base URL configured, skipping lookup instructions"
                    );
                }
            }
        }

        desired.system_prompt = prompt.build();
    }

    async fn fetch_memory(&self, user_id: &str) -> Result<(Option<String>, Option<String>)> {
        let memory = self
            .memory
            .as_ref()
            .context("long-term memory is enabled but no memory service is configured")?;
        let digest = memory.digest(user_id).await?;
        let instructions = memory.write_instructions(user_id).await?;
        Ok((digest, instructions))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;
    use crate::desired::{ChannelEntry, ChannelKind, FeatureToggles, RosterAgent};
    use crate::error::DeployError;
    use crate::instances::{InstanceStatus, PortAllocator, resource_name};
    use crate::secrets::AesGcmCipher;

    use async_trait::async_trait;
    use parking_lot::Mutex as SyncMutex;

    /// Provider that records calls and creates rows like a real backend.
    struct FakeProvider {
        instances: InstanceStore,
        deployed: SyncMutex<Vec<DesiredConfiguration>>,
        updated: SyncMutex<Vec<(String, DesiredConfiguration)>>,
        fail_update: SyncMutex<bool>,
    }

    impl FakeProvider {
        fn new(instances: InstanceStore) -> Self {
            Self {
                instances,
                deployed: SyncMutex::new(Vec::new()),
                updated: SyncMutex::new(Vec::new()),
                fail_update: SyncMutex::new(false),
            }
        }
    }

    #[async_trait]
    impl DeploymentProvider for FakeProvider {
        fn kind(&self) -> &'static str {
            "fake"
        }

        async fn deploy(&self, user_id: &str, desired: &DesiredConfiguration) -> Result<DeployOutcome> {
            self.deployed.lock().push(desired.clone());
            if let Some(existing) = self.instances.get_by_user(user_id).await? {
                self.instances.delete(&existing.id).await?;
            }
            let instance = self.instances.create(user_id, &resource_name(user_id)).await?;
            Ok(DeployOutcome {
                instance_id: instance.id,
                resource_id: None,
                resource_name: instance.container_name,
                port: instance.port,
                access_url: None,
                status: InstanceStatus::Deploying,
            })
        }

        async fn start(&self, _instance_id: &str) -> Result<()> {
            Ok(())
        }

        async fn stop(&self, _instance_id: &str) -> Result<()> {
            Ok(())
        }

        async fn restart(&self, _instance_id: &str) -> Result<()> {
            Ok(())
        }

        async fn destroy(&self, _instance_id: &str) -> Result<()> {
            Ok(())
        }

        async fn redeploy(&self, _instance_id: &str) -> Result<()> {
            Ok(())
        }

        async fn check_health(&self, _instance_id: &str) -> Result<bool> {
            Ok(true)
        }

        async fn get_logs(&self, _instance_id: &str, _tail: usize) -> Result<String> {
            Ok(String::new())
        }

        async fn update_config(&self, instance_id: &str, desired: &DesiredConfiguration) -> Result<()> {
            self.updated
                .lock()
                .push((instance_id.to_string(), desired.clone()));
            if *self.fail_update.lock() {
                return Err(DeployError::ResourceNotFound {
                    name: "berth-alice".into(),
                }
                .into());
            }
            Ok(())
        }

        async fn get_service_url(&self, _instance_id: &str) -> Result<Option<String>> {
            Ok(None)
        }

        async fn get_access_url(&self, _instance_id: &str) -> Result<Option<String>> {
            Ok(None)
        }

        async fn wait_until_ready(&self, _instance_id: &str) -> Result<Option<String>> {
            Ok(None)
        }
    }

    struct FakeMemory {
        fail: bool,
    }

    #[async_trait]
    impl MemoryService for FakeMemory {
        async fn digest(&self, _user_id: &str) -> Result<Option<String>> {
            if self.fail {
                return Err(anyhow::anyhow!("memory service unreachable").into());
            }
            Ok(Some("Prefers short answers.".into()))
        }

        async fn write_instructions(&self, _user_id: &str) -> Result<Option<String>> {
            Ok(Some("Call the memory tool to save facts.".into()))
        }
    }

    /// Memory service that stores a variable while the rebuild waits on it.
    struct WritingMemory {
        configs: ConfigurationStore,
    }

    #[async_trait]
    impl MemoryService for WritingMemory {
        async fn digest(&self, user_id: &str) -> Result<Option<String>> {
            self.configs.set_variable(user_id, "LATE_TOKEN", "late").await?;
            Ok(None)
        }

        async fn write_instructions(&self, _user_id: &str) -> Result<Option<String>> {
            Ok(None)
        }
    }

    struct Harness {
        sync: ConfigSynchronizer,
        provider: Arc<FakeProvider>,
        instances: InstanceStore,
    }

    async fn harness(memory: Option<FakeMemory>) -> Harness {
        let db = Db::in_memory().await.expect("in-memory sqlite should connect");
        let cipher = AesGcmCipher::new("test-master-key").expect("cipher");
        let configs = ConfigurationStore::new(db.sqlite.clone(), Arc::new(cipher));
        let instances = InstanceStore::new(db.sqlite, PortAllocator::new(20000, 20010));
        let provider = Arc::new(FakeProvider::new(instances.clone()));

        let mut sync = ConfigSynchronizer::new(configs, instances.clone(), provider.clone())
            .with_callback_base("https://berth.example/api");
        if let Some(memory) = memory {
            sync = sync.with_memory(Arc::new(memory));
        }
        Harness {
            sync,
            provider,
            instances,
        }
    }

    fn settings(memory: bool) -> DesiredConfiguration {
        DesiredConfiguration {
            provider: "anthropic".into(),
            api_key: "sk-ant-secret".into(),
            model: "claude-sonnet-4".into(),
            channels: vec![ChannelEntry::new(ChannelKind::Telegram).with("bot_token", "123:abc")],
            features: FeatureToggles {
                memory,
                ..Default::default()
            },
            workspace: "/data/workspace".into(),
            system_prompt: Some("Be kind.".into()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn missing_configuration_is_reported() {
        let harness = harness(None).await;
        let error = harness.sync.rebuild("ghost").await.expect_err("no settings");
        assert!(matches!(
            error,
            crate::Error::Deploy(DeployError::ConfigurationNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn memory_digest_wraps_the_prompt() {
        let harness = harness(Some(FakeMemory { fail: false })).await;
        harness.sync.configs().save_settings("alice", &settings(true)).await.unwrap();

        let rebuilt = harness.sync.rebuild("alice").await.expect("rebuild");
        let prompt = rebuilt.desired.system_prompt.expect("prompt");
        let digest = prompt.find("Prefers short answers.").expect("digest");
        let base = prompt.find("Be kind.").expect("base prompt");
        let instructions = prompt.find("Call the memory tool").expect("instructions");
        assert!(digest < base && base < instructions);
        assert_eq!(rebuilt.desired.memory_digest.as_deref(), Some("Prefers short answers."));
    }

    #[tokio::test]
    async fn failing_enrichment_does_not_abort_the_rebuild() {
        let harness = harness(Some(FakeMemory { fail: true })).await;
        let configs = harness.sync.configs();
        configs.save_settings("alice", &settings(true)).await.unwrap();
        configs.set_variable("alice", "GITHUB_TOKEN", "ghp_plain").await.unwrap();

        let rebuilt = harness.sync.rebuild("alice").await.expect("rebuild survives");
        let prompt = rebuilt.desired.system_prompt.expect("prompt");
        assert!(prompt.starts_with("Be kind."));
        assert!(prompt.contains("- GITHUB_TOKEN"), "later steps still run");
        assert!(!prompt.contains("ghp_plain"));
        assert!(rebuilt.desired.memory_digest.is_none());
    }

    #[tokio::test]
    async fn rebuild_is_idempotent_and_keeps_the_token() {
        let harness = harness(None).await;
        harness.sync.configs().save_settings("alice", &settings(false)).await.unwrap();
        harness.sync.provision("alice").await.expect("provision");

        harness.sync.rebuild_and_apply("alice").await.expect("first apply");
        let first_blob = harness.sync.configs().require("alice").await.unwrap().full_config;
        harness.sync.rebuild_and_apply("alice").await.expect("second apply");
        let second_blob = harness.sync.configs().require("alice").await.unwrap().full_config;

        assert_eq!(first_blob, second_blob);
        let updated = harness.provider.updated.lock().clone();
        assert_eq!(updated.len(), 2);
        assert_eq!(updated[0], updated[1]);

        let deployed_token = harness.provider.deployed.lock()[0].gateway_token.clone();
        assert_eq!(deployed_token.len(), 64);
        assert_eq!(updated[0].1.gateway_token, deployed_token);
    }

    #[tokio::test]
    async fn rebuild_preserves_the_overlay() {
        let harness = harness(None).await;
        let configs = harness.sync.configs();
        configs.save_settings("alice", &settings(false)).await.unwrap();

        let mut overlay = MetaOverlay {
            multi_agent_enabled: true,
            agents: vec![RosterAgent {
                id: "code".into(),
                name: "Coder".into(),
                role: "writes code".into(),
                ..Default::default()
            }],
            ..Default::default()
        };
        overlay
            .extra
            .insert("uiState".into(), serde_json::json!({"collapsed": true}));
        configs.save_overlay("alice", &overlay).await.unwrap();

        let rebuilt = harness.sync.rebuild("alice").await.expect("rebuild");
        assert!(rebuilt.desired.multi_agent_enabled);
        assert!(rebuilt.desired.system_prompt.unwrap().contains("Coder (id `code`)"));
        assert!(rebuilt.compiled.config.get(META_KEY).is_none(), "compiler never sees the overlay");

        assert_eq!(configs.overlay("alice").await.unwrap(), overlay);
        let blob = configs.require("alice").await.unwrap().full_config.unwrap();
        assert_eq!(blob["gateway"], rebuilt.compiled.config["gateway"]);
    }

    #[tokio::test]
    async fn overlay_written_during_a_rebuild_survives_it() {
        let harness = harness(None).await;
        let configs = harness.sync.configs().clone();
        configs.save_settings("alice", &settings(true)).await.unwrap();
        configs.set_variable("alice", "GITHUB_TOKEN", "ghp_plain").await.unwrap();
        let sync = harness.sync.with_memory(Arc::new(WritingMemory {
            configs: configs.clone(),
        }));

        sync.rebuild("alice").await.expect("rebuild");

        let names: Vec<String> = configs
            .overlay("alice")
            .await
            .unwrap()
            .variables
            .into_iter()
            .map(|variable| variable.name)
            .collect();
        assert_eq!(names, vec!["GITHUB_TOKEN".to_string(), "LATE_TOKEN".to_string()]);
        let blob = configs.require("alice").await.unwrap().full_config.unwrap();
        assert!(blob.get("gateway").is_some());
    }

    #[tokio::test]
    async fn failed_push_keeps_the_persisted_config() {
        let harness = harness(None).await;
        let configs = harness.sync.configs();
        configs.save_settings("alice", &settings(false)).await.unwrap();
        harness.sync.provision("alice").await.expect("provision");

        let renamed = DesiredConfiguration {
            agent_name: Some("Grace".into()),
            ..settings(false)
        };
        configs.save_settings("alice", &renamed).await.unwrap();
        *harness.provider.fail_update.lock() = true;

        harness
            .sync
            .rebuild_and_apply("alice")
            .await
            .expect_err("push fails");

        let (_, pushed) = harness.provider.updated.lock()[0].clone();
        assert_eq!(pushed.agent_name.as_deref(), Some("Grace"));
        let blob = configs.require("alice").await.unwrap().full_config.unwrap();
        assert_eq!(blob, compile(&pushed).config);
    }

    #[tokio::test]
    async fn channels_reach_the_pushed_configuration() {
        let harness = harness(None).await;
        harness.sync.configs().save_settings("alice", &settings(false)).await.unwrap();
        harness.sync.provision("alice").await.expect("provision");
        harness.sync.rebuild_and_apply("alice").await.expect("apply");

        let (_, pushed) = harness.provider.updated.lock()[0].clone();
        assert_eq!(pushed.channels.len(), 1);
        let compiled = compile(&pushed);
        assert_eq!(compiled.config["channels"]["telegram"]["botToken"], "123:abc");
        assert_eq!(compiled.env["TELEGRAM_BOT_TOKEN"], "123:abc");

        let blob = harness.sync.configs().require("alice").await.unwrap().full_config.unwrap();
        assert_eq!(blob["channels"]["telegram"]["botToken"], "123:abc");
    }

    #[tokio::test]
    async fn apply_without_instance_only_persists() {
        let harness = harness(None).await;
        harness.sync.configs().save_settings("alice", &settings(false)).await.unwrap();

        let applied = harness.sync.rebuild_and_apply("alice").await.expect("apply");
        assert!(applied.is_none());
        assert!(harness.provider.updated.lock().is_empty());
        assert!(harness.sync.configs().require("alice").await.unwrap().full_config.is_some());
    }

    #[tokio::test]
    async fn reprovision_moves_links_to_the_new_instance() {
        let harness = harness(None).await;
        let configs = harness.sync.configs();
        configs.save_settings("alice", &settings(false)).await.unwrap();
        configs.save_settings("bob", &settings(false)).await.unwrap();

        let bob = harness.sync.provision("bob").await.expect("bob");
        harness
            .instances
            .set_urls(&bob.instance_id, Some("http://bob.internal:18789"), None)
            .await
            .unwrap();
        let first = harness.sync.provision("alice").await.expect("alice");
        configs.link(&first.instance_id, &bob.instance_id, "research").await.unwrap();

        let second = harness.sync.provision("alice").await.expect("alice again");
        assert_ne!(first.instance_id, second.instance_id);
        assert_eq!(
            configs.require("alice").await.unwrap().instance_id.as_deref(),
            Some(second.instance_id.as_str())
        );

        let rebuilt = harness.sync.rebuild("alice").await.expect("rebuild");
        assert_eq!(rebuilt.desired.delegation_targets.len(), 1);
        assert!(rebuilt.desired.system_prompt.unwrap().contains("http://bob.internal:18789/v1/chat/completions"));
    }

    #[tokio::test]
    async fn rotation_changes_the_applied_token() {
        let harness = harness(None).await;
        harness.sync.configs().save_settings("alice", &settings(false)).await.unwrap();
        harness.sync.provision("alice").await.expect("provision");
        let before = harness.provider.deployed.lock()[0].gateway_token.clone();

        harness.sync.rotate_gateway_token("alice").await.expect("rotate");
        let updated = harness.provider.updated.lock().clone();
        assert_eq!(updated.len(), 1);
        assert_ne!(updated[0].1.gateway_token, before);
    }
}
