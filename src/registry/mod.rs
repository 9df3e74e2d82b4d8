//! Agent registry & routing policy (§4.B).
//!
//! Holds the canonical agent record for every platform/name pair and the
//! auto-approval decision used by the mailbox store on every `send`.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use crate::storage::with_timeout;

const ONLINE_WINDOW_SECS: i64 = 5 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AgentCategory {
    Conversational,
    Autonomous,
    Supervised,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NotificationMode {
    Polling,
    Webhook,
    Websocket,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    pub id: String,
    pub platform: String,
    pub name: String,
    pub display_name: String,
    pub capabilities: Vec<String>,
    pub category: AgentCategory,
    pub requires_approval: bool,
    pub auto_approve_on_check: bool,
    pub notification_mode: NotificationMode,
    pub webhook_url: Option<String>,
    pub webhook_secret: Option<String>,
    pub platform_url: Option<String>,
    pub notify_prompt: Option<String>,
    pub is_public: bool,
    pub owner_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_seen: Option<DateTime<Utc>>,
}

impl Agent {
    pub fn is_online(&self) -> bool {
        match self.last_seen {
            Some(ts) => Utc::now() - ts < Duration::seconds(ONLINE_WINDOW_SECS),
            None => false,
        }
    }
}

#[derive(sqlx::FromRow)]
struct AgentRow {
    id: String,
    platform: String,
    name: String,
    display_name: String,
    capabilities: String,
    category: String,
    requires_approval: i64,
    auto_approve_on_check: i64,
    notification_mode: String,
    webhook_url: Option<String>,
    webhook_secret: Option<String>,
    platform_url: Option<String>,
    notify_prompt: Option<String>,
    is_public: i64,
    owner_id: Option<String>,
    created_at: String,
    last_seen: Option<String>,
}

impl TryFrom<AgentRow> for Agent {
    type Error = anyhow::Error;

    fn try_from(r: AgentRow) -> Result<Self> {
        Ok(Agent {
            id: r.id,
            platform: r.platform,
            name: r.name,
            display_name: r.display_name,
            capabilities: serde_json::from_str(&r.capabilities)?,
            category: parse_category(&r.category)?,
            requires_approval: r.requires_approval != 0,
            auto_approve_on_check: r.auto_approve_on_check != 0,
            notification_mode: parse_notification_mode(&r.notification_mode)?,
            webhook_url: r.webhook_url,
            webhook_secret: r.webhook_secret,
            platform_url: r.platform_url,
            notify_prompt: r.notify_prompt,
            is_public: r.is_public != 0,
            owner_id: r.owner_id,
            created_at: DateTime::parse_from_rfc3339(&r.created_at)?.with_timezone(&Utc),
            last_seen: r
                .last_seen
                .map(|s| DateTime::parse_from_rfc3339(&s).map(|d| d.with_timezone(&Utc)))
                .transpose()?,
        })
    }
}

fn parse_category(s: &str) -> Result<AgentCategory> {
    Ok(match s {
        "conversational" => AgentCategory::Conversational,
        "autonomous" => AgentCategory::Autonomous,
        "supervised" => AgentCategory::Supervised,
        other => return Err(anyhow!("unknown agent category '{other}'")),
    })
}

fn category_str(c: AgentCategory) -> &'static str {
    match c {
        AgentCategory::Conversational => "conversational",
        AgentCategory::Autonomous => "autonomous",
        AgentCategory::Supervised => "supervised",
    }
}

fn parse_notification_mode(s: &str) -> Result<NotificationMode> {
    Ok(match s {
        "polling" => NotificationMode::Polling,
        "webhook" => NotificationMode::Webhook,
        "websocket" => NotificationMode::Websocket,
        other => return Err(anyhow!("unknown notification mode '{other}'")),
    })
}

fn notification_mode_str(m: NotificationMode) -> &'static str {
    match m {
        NotificationMode::Polling => "polling",
        NotificationMode::Webhook => "webhook",
        NotificationMode::Websocket => "websocket",
    }
}

/// Fields accepted when creating or replacing an agent record.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSpec {
    pub display_name: Option<String>,
    pub capabilities: Option<Vec<String>>,
    pub category: Option<AgentCategory>,
    pub requires_approval: Option<bool>,
    pub auto_approve_on_check: Option<bool>,
    pub notification_mode: Option<NotificationMode>,
    pub webhook_url: Option<String>,
    pub webhook_secret: Option<String>,
    pub platform_url: Option<String>,
    pub notify_prompt: Option<String>,
    pub is_public: Option<bool>,
    pub owner_id: Option<String>,
}

/// Agent registry, SQLite-backed (§4.B, §6 persisted layout — the
/// registry is canonical, not a cache, unlike the mailbox's JSON snapshot).
#[derive(Clone)]
pub struct AgentRegistry {
    pool: SqlitePool,
}

impl AgentRegistry {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Root platform of an identifier like `cursor/dev` or `cursor`.
    pub fn root_platform(identifier: &str) -> &str {
        identifier.split('/').next().unwrap_or(identifier)
    }

    pub async fn upsert(&self, platform: &str, name: &str, spec: AgentSpec) -> Result<Agent> {
        with_timeout(async {
            let id = format!("{platform}/{name}");
            let existing = self.get(&id).await?;

            let display_name = spec
                .display_name
                .or_else(|| existing.as_ref().map(|a| a.display_name.clone()))
                .unwrap_or_else(|| name.to_string());
            let capabilities = spec
                .capabilities
                .or_else(|| existing.as_ref().map(|a| a.capabilities.clone()))
                .unwrap_or_default();
            let category = spec
                .category
                .or_else(|| existing.as_ref().map(|a| a.category))
                .unwrap_or(AgentCategory::Autonomous);
            let requires_approval = spec
                .requires_approval
                .or_else(|| existing.as_ref().map(|a| a.requires_approval))
                .unwrap_or(false);
            let auto_approve_on_check = spec
                .auto_approve_on_check
                .or_else(|| existing.as_ref().map(|a| a.auto_approve_on_check))
                .unwrap_or(false);
            let notification_mode = spec
                .notification_mode
                .or_else(|| existing.as_ref().map(|a| a.notification_mode))
                .unwrap_or(NotificationMode::Polling);
            let webhook_url = spec
                .webhook_url
                .or_else(|| existing.as_ref().and_then(|a| a.webhook_url.clone()));
            let webhook_secret = spec
                .webhook_secret
                .or_else(|| existing.as_ref().and_then(|a| a.webhook_secret.clone()));
            let platform_url = spec
                .platform_url
                .or_else(|| existing.as_ref().and_then(|a| a.platform_url.clone()));
            let notify_prompt = spec
                .notify_prompt
                .or_else(|| existing.as_ref().and_then(|a| a.notify_prompt.clone()));
            let is_public = spec
                .is_public
                .or_else(|| existing.as_ref().map(|a| a.is_public))
                .unwrap_or(true);
            let owner_id = spec
                .owner_id
                .or_else(|| existing.as_ref().and_then(|a| a.owner_id.clone()));
            let created_at = existing.as_ref().map(|a| a.created_at).unwrap_or_else(Utc::now);
            let last_seen = existing.as_ref().and_then(|a| a.last_seen);

            let capabilities_json = serde_json::to_string(&capabilities)?;

            sqlx::query(
                "INSERT INTO agents
                 (id, platform, name, display_name, capabilities, category, requires_approval,
                  auto_approve_on_check, notification_mode, webhook_url, webhook_secret,
                  platform_url, notify_prompt, is_public, owner_id, created_at, last_seen)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(id) DO UPDATE SET
                   display_name = excluded.display_name,
                   capabilities = excluded.capabilities,
                   category = excluded.category,
                   requires_approval = excluded.requires_approval,
                   auto_approve_on_check = excluded.auto_approve_on_check,
                   notification_mode = excluded.notification_mode,
                   webhook_url = excluded.webhook_url,
                   webhook_secret = excluded.webhook_secret,
                   platform_url = excluded.platform_url,
                   notify_prompt = excluded.notify_prompt,
                   is_public = excluded.is_public,
                   owner_id = excluded.owner_id",
            )
            .bind(&id)
            .bind(platform)
            .bind(name)
            .bind(&display_name)
            .bind(&capabilities_json)
            .bind(category_str(category))
            .bind(requires_approval as i64)
            .bind(auto_approve_on_check as i64)
            .bind(notification_mode_str(notification_mode))
            .bind(&webhook_url)
            .bind(&webhook_secret)
            .bind(&platform_url)
            .bind(&notify_prompt)
            .bind(is_public as i64)
            .bind(&owner_id)
            .bind(created_at.to_rfc3339())
            .bind(last_seen.map(|d| d.to_rfc3339()))
            .execute(&self.pool)
            .await?;

            self.get(&id)
                .await?
                .ok_or_else(|| anyhow!("agent '{id}' vanished after upsert"))
        })
        .await
    }

    pub async fn get(&self, id: &str) -> Result<Option<Agent>> {
        with_timeout(async {
            let row = sqlx::query_as::<_, AgentRow>("SELECT * FROM agents WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
            row.map(TryFrom::try_from).transpose()
        })
        .await
    }

    /// Looks up an agent by its bare platform segment (e.g. `claude`),
    /// the key every policy/notification decision in §4.B/§4.E/§4.F
    /// actually has in hand — `from`/`to` are stamped with only the
    /// platform root resolved (`cursor/dev`, `cursor`), never the full
    /// `platform/name` id. Agent rows are always keyed `platform/name`
    /// (`id`), so this queries the `platform` column instead of
    /// exact-matching `id`. When more than one name is registered under
    /// the same platform, the lowest `id` wins — deterministic and
    /// stable across restarts.
    pub async fn get_by_platform(&self, platform: &str) -> Result<Option<Agent>> {
        with_timeout(async {
            let row = sqlx::query_as::<_, AgentRow>(
                "SELECT * FROM agents WHERE platform = ? ORDER BY id LIMIT 1",
            )
            .bind(platform)
            .fetch_optional(&self.pool)
            .await?;
            row.map(TryFrom::try_from).transpose()
        })
        .await
    }

    pub async fn list(&self) -> Result<Vec<Agent>> {
        with_timeout(async {
            let rows = sqlx::query_as::<_, AgentRow>("SELECT * FROM agents ORDER BY id")
                .fetch_all(&self.pool)
                .await?;
            rows.into_iter().map(TryFrom::try_from).collect()
        })
        .await
    }

    pub async fn delete(&self, id: &str) -> Result<bool> {
        with_timeout(async {
            let result = sqlx::query("DELETE FROM agents WHERE id = ?")
                .bind(id)
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected() > 0)
        })
        .await
    }

    /// Bump `last_seen` to now for the platform root's registered agent,
    /// if one exists. Matches Bridge `ping`/heartbeat updates.
    pub async fn update_last_activity(&self, id: &str) -> Result<()> {
        with_timeout(async {
            sqlx::query("UPDATE agents SET last_seen = ? WHERE id = ?")
                .bind(Utc::now().to_rfc3339())
                .bind(id)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
    }

    pub async fn ping(&self, id: &str) -> Result<Option<Agent>> {
        self.update_last_activity(id).await?;
        self.get(id).await
    }

    /// Auto-approval policy (§4.B): neither registered → approve; a
    /// required-approval destination → hold; a conversational sender →
    /// hold; otherwise approve.
    pub async fn should_auto_approve(&self, from: &str, to: &str) -> Result<bool> {
        let from_root = Self::root_platform(from);
        let to_root = Self::root_platform(to);

        let from_agent = self.get_by_platform(from_root).await?;
        let to_agent = self.get_by_platform(to_root).await?;

        if from_agent.is_none() && to_agent.is_none() {
            return Ok(true);
        }
        if let Some(dest) = &to_agent {
            if dest.requires_approval {
                return Ok(false);
            }
        }
        if let Some(sender) = &from_agent {
            if sender.category == AgentCategory::Conversational {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Seeds the default conversational/autonomous agents (§4.B) if they
    /// are not already present. Idempotent — safe to call on every start
    /// and from the `agents seed` CLI subcommand.
    pub async fn seed_defaults(&self) -> Result<()> {
        const CONVERSATIONAL: &[&str] = &["claude", "gpt", "gemini", "grok", "copilot"];
        const AUTONOMOUS: &[&str] = &["replit", "cursor", "antigravity"];

        for platform in CONVERSATIONAL {
            if self.get_by_platform(platform).await?.is_some() {
                continue;
            }
            self.upsert(
                platform,
                "main",
                AgentSpec {
                    display_name: Some(platform.to_string()),
                    category: Some(AgentCategory::Conversational),
                    requires_approval: Some(true),
                    platform_url: Some(format!("https://{platform}.example.com")),
                    notify_prompt: Some(format!("You have a new message waiting in {platform}.")),
                    ..Default::default()
                },
            )
            .await?;
        }

        for platform in AUTONOMOUS {
            if self.get_by_platform(platform).await?.is_some() {
                continue;
            }
            self.upsert(
                platform,
                "main",
                AgentSpec {
                    display_name: Some(platform.to_string()),
                    category: Some(AgentCategory::Autonomous),
                    requires_approval: Some(false),
                    platform_url: Some(format!("https://{platform}.example.com")),
                    notify_prompt: Some(format!("New task dispatched to {platform}.")),
                    ..Default::default()
                },
            )
            .await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn registry() -> AgentRegistry {
        let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
        for stmt in include_str!("../storage/migrations/001_init.sql").split(';') {
            let stmt = stmt.trim();
            if !stmt.is_empty() {
                sqlx::query(stmt).execute(&pool).await.unwrap();
            }
        }
        AgentRegistry::new(pool)
    }

    #[tokio::test]
    async fn upsert_and_get_roundtrip() {
        let reg = registry().await;
        let agent = reg
            .upsert(
                "cursor",
                "dev",
                AgentSpec {
                    category: Some(AgentCategory::Autonomous),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(agent.id, "cursor/dev");
        assert_eq!(agent.category, AgentCategory::Autonomous);
    }

    #[tokio::test]
    async fn unregistered_pair_auto_approves() {
        let reg = registry().await;
        assert!(reg.should_auto_approve("ghost/one", "ghost/two").await.unwrap());
    }

    #[tokio::test]
    async fn requires_approval_destination_holds() {
        let reg = registry().await;
        reg.upsert(
            "claude",
            "web",
            AgentSpec {
                category: Some(AgentCategory::Conversational),
                requires_approval: Some(true),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        assert!(!reg
            .should_auto_approve("replit/dev", "claude/web")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn conversational_sender_holds() {
        let reg = registry().await;
        reg.upsert(
            "claude",
            "web",
            AgentSpec {
                category: Some(AgentCategory::Conversational),
                requires_approval: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        assert!(!reg
            .should_auto_approve("claude/web", "replit/main")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn autonomous_pair_auto_approves() {
        let reg = registry().await;
        reg.upsert(
            "replit",
            "main",
            AgentSpec {
                category: Some(AgentCategory::Autonomous),
                requires_approval: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        reg.upsert(
            "cursor",
            "dev",
            AgentSpec {
                category: Some(AgentCategory::Autonomous),
                requires_approval: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        assert!(reg
            .should_auto_approve("cursor/dev", "replit/main")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn online_heuristic_uses_five_minute_window() {
        let reg = registry().await;
        let agent = reg.upsert("cursor", "dev", AgentSpec::default()).await.unwrap();
        assert!(!agent.is_online());

        reg.ping("cursor/dev").await.unwrap();
        let agent = reg.get("cursor/dev").await.unwrap().unwrap();
        assert!(agent.is_online());
    }

    #[tokio::test]
    async fn seed_defaults_is_idempotent() {
        let reg = registry().await;
        reg.seed_defaults().await.unwrap();
        let first = reg.list().await.unwrap().len();
        reg.seed_defaults().await.unwrap();
        let second = reg.list().await.unwrap().len();
        assert_eq!(first, second);
        assert_eq!(first, 8);
    }
}
