//! Declared settings storage (SQLite): configurations, channels, agent links.
//!
//! Secret columns go through the [`SecretCipher`] on the way in and out, so
//! everything above this layer works with plaintext.

use super::overlay::{MetaOverlay, extract_overlay, merge_overlay};
use crate::desired::{
    ChannelCredentials, ChannelEntry, ChannelKind, DelegationTarget, DesiredConfiguration,
    FeatureToggles, SessionScope, ThinkingLevel,
};
use crate::error::{DeployError, Result};
use crate::secrets::{SecretCipher, generate_gateway_token};

use anyhow::Context as _;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{Row as _, SqlitePool};
use std::sync::Arc;

const CONFIGURATION_COLUMNS: &str = "user_id, instance_id, provider, model, api_key_enc, features, web_search_key_enc, tts_key_enc, workspace, agent_name, system_prompt, thinking, session_scope, dm_policy, gateway_token, full_config, updated_at";

/// One user's stored configuration with secrets already opened.
#[derive(Debug, Clone)]
pub struct StoredConfiguration {
    pub user_id: String,
    pub instance_id: Option<String>,
    /// Declared settings. Enrichment fields are always empty here, and
    /// `gateway_token` is empty until one has been generated.
    pub desired: DesiredConfiguration,
    /// Last persisted compiled config including the overlay.
    pub full_config: Option<Value>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct ConfigurationStore {
    pool: SqlitePool,
    cipher: Arc<dyn SecretCipher>,
}

impl std::fmt::Debug for ConfigurationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigurationStore").finish_non_exhaustive()
    }
}

impl ConfigurationStore {
    pub fn new(pool: SqlitePool, cipher: Arc<dyn SecretCipher>) -> Self {
        Self { pool, cipher }
    }

    pub fn cipher(&self) -> &Arc<dyn SecretCipher> {
        &self.cipher
    }

    /// Upsert declared settings and replace the channel list.
    ///
    /// The gateway token, instance pointer and persisted config blob are left
    /// alone.
    pub async fn save_settings(&self, user_id: &str, desired: &DesiredConfiguration) -> Result<()> {
        let api_key_enc = self.seal_optional(Some(desired.api_key.as_str()))?;
        let web_search_key_enc = self.seal_optional(desired.features.web_search_key.as_deref())?;
        let tts_key_enc = self.seal_optional(desired.features.tts_key.as_deref())?;

        let features = FeatureToggles {
            web_search_key: None,
            tts_key: None,
            ..desired.features.clone()
        };
        let features_json =
            serde_json::to_string(&features).context("failed to serialize feature toggles")?;

        let mut sealed_channels = Vec::with_capacity(desired.channels.len());
        for channel in &desired.channels {
            let credentials = serde_json::to_string(&channel.credentials)
                .context("failed to serialize channel credentials")?;
            sealed_channels.push((channel.kind, self.cipher.encrypt(&credentials)?));
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to open settings transaction")?;

        sqlx::query(
            "INSERT INTO configurations (user_id, provider, model, api_key_enc, features, web_search_key_enc, tts_key_enc, workspace, agent_name, system_prompt, thinking, session_scope, dm_policy) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(user_id) DO UPDATE SET \
                provider = excluded.provider, \
                model = excluded.model, \
                api_key_enc = excluded.api_key_enc, \
                features = excluded.features, \
                web_search_key_enc = excluded.web_search_key_enc, \
                tts_key_enc = excluded.tts_key_enc, \
                workspace = excluded.workspace, \
                agent_name = excluded.agent_name, \
                system_prompt = excluded.system_prompt, \
                thinking = excluded.thinking, \
                session_scope = excluded.session_scope, \
                dm_policy = excluded.dm_policy, \
                updated_at = datetime('now')",
        )
        .bind(user_id)
        .bind(desired.provider.trim())
        .bind(desired.model.trim())
        .bind(api_key_enc)
        .bind(features_json)
        .bind(web_search_key_enc)
        .bind(tts_key_enc)
        .bind(&desired.workspace)
        .bind(desired.agent_name.as_deref())
        .bind(desired.system_prompt.as_deref())
        .bind(desired.thinking.as_str())
        .bind(desired.session_scope.as_str())
        .bind(desired.dm_policy.as_deref())
        .execute(&mut *tx)
        .await
        .context("failed to upsert configuration")?;

        sqlx::query("DELETE FROM channels WHERE user_id = ?")
            .bind(user_id)
            .execute(&mut *tx)
            .await
            .context("failed to clear channels")?;

        for (kind, config_enc) in sealed_channels {
            sqlx::query(
                "INSERT INTO channels (id, user_id, channel_type, config_enc) VALUES (?, ?, ?, ?)",
            )
            .bind(uuid::Uuid::new_v4().to_string())
            .bind(user_id)
            .bind(kind.as_str())
            .bind(config_enc)
            .execute(&mut *tx)
            .await
            .context("failed to insert channel")?;
        }

        tx.commit().await.context("failed to commit settings")?;
        tracing::debug!(user_id, channels = desired.channels.len(), "settings saved");
        Ok(())
    }

    pub async fn load(&self, user_id: &str) -> Result<Option<StoredConfiguration>> {
        let row = sqlx::query(&format!(
            "SELECT {CONFIGURATION_COLUMNS} FROM configurations WHERE user_id = ?"
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch configuration")?;

        let Some(row) = row else {
            return Ok(None);
        };
        let mut stored = self.configuration_from_row(row)?;
        stored.desired.channels = self.channels(user_id).await?;
        Ok(Some(stored))
    }

    /// Like [`load`](Self::load) but a missing row is an error.
    pub async fn require(&self, user_id: &str) -> Result<StoredConfiguration> {
        self.load(user_id).await?.ok_or_else(|| {
            DeployError::ConfigurationNotFound {
                user_id: user_id.to_string(),
            }
            .into()
        })
    }

    pub async fn channels(&self, user_id: &str) -> Result<Vec<ChannelEntry>> {
        let rows = sqlx::query(
            "SELECT channel_type, config_enc FROM channels WHERE user_id = ? ORDER BY created_at ASC, rowid ASC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to list channels")?;

        let mut channels = Vec::with_capacity(rows.len());
        for row in rows {
            let channel_type: String = row
                .try_get("channel_type")
                .context("failed to read channel type")?;
            let Some(kind) = ChannelKind::parse(&channel_type) else {
                tracing::warn!(user_id, %channel_type, "skipping channel of unknown type");
                continue;
            };
            let config_enc: String = row
                .try_get("config_enc")
                .context("failed to read channel config")?;
            let credentials: ChannelCredentials =
                serde_json::from_str(&self.cipher.decrypt(&config_enc)?)
                    .context("failed to parse channel credentials")?;
            channels.push(ChannelEntry { kind, credentials });
        }
        Ok(channels)
    }

    /// Return the stored gateway token, generating and persisting one first
    /// if the slot has none. Once set it only changes through
    /// [`rotate_gateway_token`](Self::rotate_gateway_token).
    pub async fn ensure_gateway_token(&self, user_id: &str) -> Result<String> {
        sqlx::query(
            "UPDATE configurations SET gateway_token = ?, updated_at = datetime('now') \
             WHERE user_id = ? AND (gateway_token IS NULL OR gateway_token = '')",
        )
        .bind(generate_gateway_token())
        .bind(user_id)
        .execute(&self.pool)
        .await
        .context("failed to store gateway token")?;

        let token: Option<Option<String>> =
            sqlx::query_scalar("SELECT gateway_token FROM configurations WHERE user_id = ?")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await
                .context("failed to read gateway token")?;

        token.flatten().ok_or_else(|| {
            DeployError::ConfigurationNotFound {
                user_id: user_id.to_string(),
            }
            .into()
        })
    }

    pub async fn rotate_gateway_token(&self, user_id: &str) -> Result<String> {
        let token = generate_gateway_token();
        let result = sqlx::query(
            "UPDATE configurations SET gateway_token = ?, updated_at = datetime('now') WHERE user_id = ?",
        )
        .bind(&token)
        .bind(user_id)
        .execute(&self.pool)
        .await
        .context("failed to rotate gateway token")?;

        if result.rows_affected() == 0 {
            return Err(DeployError::ConfigurationNotFound {
                user_id: user_id.to_string(),
            }
            .into());
        }
        tracing::info!(user_id, "gateway token rotated");
        Ok(token)
    }

    pub async fn set_instance(&self, user_id: &str, instance_id: Option<&str>) -> Result<()> {
        sqlx::query(
            "UPDATE configurations SET instance_id = ?, updated_at = datetime('now') WHERE user_id = ?",
        )
        .bind(instance_id)
        .bind(user_id)
        .execute(&self.pool)
        .await
        .context("failed to set configuration instance")?;
        Ok(())
    }

    /// Persist a freshly compiled config. The overlay is whatever the row
    /// holds at write time, so overlay updates that land while a rebuild is
    /// in flight survive it.
    pub async fn save_compiled(&self, user_id: &str, compiled: &Value) -> Result<()> {
        let compiled = merge_overlay(compiled, &MetaOverlay::default())?;
        sqlx::query(
            "UPDATE configurations SET full_config = CASE \
                WHEN json_type(full_config, '$._meta') IS NULL THEN ?1 \
                ELSE json_set(?1, '$._meta', json(json_extract(full_config, '$._meta'))) \
             END, updated_at = datetime('now') WHERE user_id = ?2",
        )
        .bind(compiled.to_string())
        .bind(user_id)
        .execute(&self.pool)
        .await
        .context("failed to persist compiled config")?;
        Ok(())
    }

    /// Overlay currently stored inside the persisted config blob.
    pub async fn overlay(&self, user_id: &str) -> Result<MetaOverlay> {
        let stored = self.require(user_id).await?;
        match stored.full_config {
            Some(blob) => Ok(extract_overlay(&blob)?),
            None => Ok(MetaOverlay::default()),
        }
    }

    /// Read-modify-write the overlay in one transaction, leaving the compiled
    /// part of the blob as is.
    pub async fn update_overlay(&self, user_id: &str, update: impl FnOnce(&mut MetaOverlay)) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to open overlay transaction")?;

        let row: Option<(Option<String>,)> =
            sqlx::query_as("SELECT full_config FROM configurations WHERE user_id = ?")
                .bind(user_id)
                .fetch_optional(&mut *tx)
                .await
                .context("failed to read persisted config")?;
        let Some((full_config,)) = row else {
            return Err(DeployError::ConfigurationNotFound {
                user_id: user_id.to_string(),
            }
            .into());
        };
        let blob = match full_config {
            Some(text) => serde_json::from_str::<Value>(&text).context("failed to parse persisted config")?,
            None => Value::Object(serde_json::Map::new()),
        };

        let mut overlay = extract_overlay(&blob)?;
        update(&mut overlay);
        let blob = merge_overlay(&blob, &overlay)?;

        sqlx::query(
            "UPDATE configurations SET full_config = ?, updated_at = datetime('now') WHERE user_id = ?",
        )
        .bind(blob.to_string())
        .bind(user_id)
        .execute(&mut *tx)
        .await
        .context("failed to persist overlay")?;
        tx.commit().await.context("failed to commit overlay")?;
        Ok(())
    }

    /// Replace the overlay wholesale.
    pub async fn save_overlay(&self, user_id: &str, overlay: &MetaOverlay) -> Result<()> {
        self.update_overlay(user_id, |current| *current = overlay.clone())
            .await
    }

    /// Seal a variable value and store it in the overlay under `name`.
    pub async fn set_variable(&self, user_id: &str, name: &str, value: &str) -> Result<()> {
        let value_enc = self.cipher.encrypt(value)?;
        self.update_overlay(user_id, |overlay| overlay.set_variable(name, value_enc))
            .await
    }

    /// Add (or re-role) a delegation edge.
    pub async fn link(&self, source_instance_id: &str, target_instance_id: &str, role: &str) -> Result<()> {
        if source_instance_id == target_instance_id {
            return Err(DeployError::Validation("an instance cannot delegate to itself".into()).into());
        }
        sqlx::query(
            "INSERT INTO agent_links (source_instance_id, target_instance_id, role) VALUES (?, ?, ?) \
             ON CONFLICT(source_instance_id, target_instance_id) DO UPDATE SET role = excluded.role",
        )
        .bind(source_instance_id)
        .bind(target_instance_id)
        .bind(role)
        .execute(&self.pool)
        .await
        .context("failed to store agent link")?;
        Ok(())
    }

    pub async fn unlink(&self, source_instance_id: &str, target_instance_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM agent_links WHERE source_instance_id = ? AND target_instance_id = ?",
        )
        .bind(source_instance_id)
        .bind(target_instance_id)
        .execute(&self.pool)
        .await
        .context("failed to delete agent link")?;
        Ok(result.rows_affected() > 0)
    }

    /// Outgoing delegation edges joined with what the source needs to reach
    /// each target. Edges whose target no longer exists are skipped.
    pub async fn delegation_targets(&self, source_instance_id: &str) -> Result<Vec<DelegationTarget>> {
        let rows = sqlx::query(
            "SELECT l.target_instance_id, l.role, i.user_id, i.service_url, c.agent_name, c.gateway_token \
             FROM agent_links l \
             JOIN instances i ON i.id = l.target_instance_id \
             LEFT JOIN configurations c ON c.user_id = i.user_id \
             WHERE l.source_instance_id = ? \
             ORDER BY l.id ASC",
        )
        .bind(source_instance_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to list delegation targets")?;

        let mut targets = Vec::with_capacity(rows.len());
        for row in rows {
            let instance_id: String = row
                .try_get("target_instance_id")
                .context("failed to read link target")?;
            let Some(token) = row
                .try_get::<Option<String>, _>("gateway_token")
                .ok()
                .flatten()
                .filter(|token| !token.is_empty())
            else {
                tracing::debug!(%instance_id, "delegation target has no gateway token yet");
                continue;
            };
            let user_id: String = row.try_get("user_id").context("failed to read link user")?;
            targets.push(DelegationTarget {
                instance_id,
                name: row
                    .try_get::<Option<String>, _>("agent_name")
                    .ok()
                    .flatten()
                    .unwrap_or(user_id),
                role: row.try_get("role").context("failed to read link role")?,
                url: row.try_get::<Option<String>, _>("service_url").ok().flatten(),
                token,
            });
        }
        Ok(targets)
    }

    fn seal_optional(&self, value: Option<&str>) -> Result<Option<String>> {
        match value.map(str::trim).filter(|value| !value.is_empty()) {
            Some(value) => Ok(Some(self.cipher.encrypt(value)?)),
            None => Ok(None),
        }
    }

    fn open_optional(&self, value: Option<String>) -> Result<Option<String>> {
        value
            .filter(|value| !value.is_empty())
            .map(|value| self.cipher.decrypt(&value))
            .transpose()
    }

    fn configuration_from_row(&self, row: sqlx::sqlite::SqliteRow) -> Result<StoredConfiguration> {
        let features_json: String = row
            .try_get("features")
            .context("failed to read configuration features")?;
        let mut features: FeatureToggles =
            serde_json::from_str(&features_json).context("failed to parse feature toggles")?;
        features.web_search_key =
            self.open_optional(row.try_get::<Option<String>, _>("web_search_key_enc").ok().flatten())?;
        features.tts_key = self.open_optional(row.try_get::<Option<String>, _>("tts_key_enc").ok().flatten())?;

        let thinking_value: String = row
            .try_get("thinking")
            .context("failed to read thinking level")?;
        let scope_value: String = row
            .try_get("session_scope")
            .context("failed to read session scope")?;

        let full_config = row
            .try_get::<Option<String>, _>("full_config")
            .ok()
            .flatten()
            .map(|blob| serde_json::from_str::<Value>(&blob))
            .transpose()
            .context("failed to parse persisted config")?;

        let desired = DesiredConfiguration {
            provider: row.try_get("provider").context("failed to read provider")?,
            api_key: self
                .open_optional(row.try_get::<Option<String>, _>("api_key_enc").ok().flatten())?
                .unwrap_or_default(),
            model: row.try_get("model").context("failed to read model")?,
            channels: Vec::new(),
            features,
            workspace: row.try_get("workspace").context("failed to read workspace")?,
            agent_name: row.try_get::<Option<String>, _>("agent_name").ok().flatten(),
            system_prompt: row
                .try_get::<Option<String>, _>("system_prompt")
                .ok()
                .flatten(),
            thinking: ThinkingLevel::parse(&thinking_value).unwrap_or_default(),
            session_scope: SessionScope::parse(&scope_value).unwrap_or_default(),
            dm_policy: row.try_get::<Option<String>, _>("dm_policy").ok().flatten(),
            gateway_token: row
                .try_get::<Option<String>, _>("gateway_token")
                .ok()
                .flatten()
                .unwrap_or_default(),
            ..Default::default()
        };

        Ok(StoredConfiguration {
            user_id: row.try_get("user_id").context("failed to read user_id")?,
            instance_id: row.try_get::<Option<String>, _>("instance_id").ok().flatten(),
            desired,
            full_config,
            updated_at: row
                .try_get::<chrono::NaiveDateTime, _>("updated_at")
                .map(|value| value.and_utc())
                .context("failed to read configuration updated_at")?,
        })
    }
}
