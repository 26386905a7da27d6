use std::collections::HashMap;

use async_trait::async_trait;
use plume_core::{
    AccountId, AutoproxyMode, ChannelId, GuildId, GuildProxySettings, Member, MemberId,
    MessageId, MessageMapping, ProxyTag, System, SystemAccount, SystemId,
};
use sqlx::{
    postgres::{PgPoolOptions, PgRow},
    PgPool, Row,
};
use tokio::sync::OnceCell;

use super::repository::{Repository, RepositoryError};

const SCHEMA_INIT_LOCK_ID: i64 = 0x504c_554d_4550_5859;

const SCHEMA_STATEMENTS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS systems (
        system_id BIGINT PRIMARY KEY,
        tag TEXT NULL,
        avatar_url TEXT NULL,
        case_sensitive_tags BOOLEAN NOT NULL DEFAULT FALSE,
        latch_timeout_secs BIGINT NULL
    )",
    "CREATE TABLE IF NOT EXISTS accounts (
        account_id BIGINT PRIMARY KEY,
        system_id BIGINT NOT NULL REFERENCES systems(system_id) ON DELETE CASCADE,
        allow_autoproxy BOOLEAN NOT NULL DEFAULT TRUE
    )",
    "CREATE INDEX IF NOT EXISTS idx_accounts_system ON accounts(system_id)",
    "CREATE TABLE IF NOT EXISTS members (
        member_id BIGINT PRIMARY KEY,
        system_id BIGINT NOT NULL REFERENCES systems(system_id) ON DELETE CASCADE,
        name TEXT NOT NULL,
        display_name TEXT NULL,
        avatar_url TEXT NULL,
        color TEXT NULL,
        keep_proxy BOOLEAN NOT NULL DEFAULT FALSE,
        allow_autoproxy BOOLEAN NOT NULL DEFAULT TRUE
    )",
    "CREATE INDEX IF NOT EXISTS idx_members_system ON members(system_id)",
    "CREATE TABLE IF NOT EXISTS member_proxy_tags (
        member_id BIGINT NOT NULL REFERENCES members(member_id) ON DELETE CASCADE,
        position INTEGER NOT NULL,
        prefix TEXT NULL,
        suffix TEXT NULL,
        PRIMARY KEY (member_id, position)
    )",
    "CREATE TABLE IF NOT EXISTS member_guild (
        member_id BIGINT NOT NULL REFERENCES members(member_id) ON DELETE CASCADE,
        guild_id BIGINT NOT NULL,
        display_name TEXT NULL,
        avatar_url TEXT NULL,
        PRIMARY KEY (member_id, guild_id)
    )",
    "CREATE TABLE IF NOT EXISTS system_guild (
        guild_id BIGINT NOT NULL,
        system_id BIGINT NOT NULL REFERENCES systems(system_id) ON DELETE CASCADE,
        proxy_enabled BOOLEAN NOT NULL DEFAULT TRUE,
        autoproxy_mode SMALLINT NOT NULL DEFAULT 1,
        autoproxy_member BIGINT NULL REFERENCES members(member_id) ON DELETE SET NULL,
        tag TEXT NULL,
        tag_enabled BOOLEAN NOT NULL DEFAULT TRUE,
        PRIMARY KEY (guild_id, system_id)
    )",
    "CREATE TABLE IF NOT EXISTS switches (
        switch_id BIGSERIAL PRIMARY KEY,
        system_id BIGINT NOT NULL REFERENCES systems(system_id) ON DELETE CASCADE,
        created_at_unix_ms BIGINT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_switches_system_created
        ON switches(system_id, created_at_unix_ms DESC)",
    "CREATE TABLE IF NOT EXISTS switch_members (
        switch_id BIGINT NOT NULL REFERENCES switches(switch_id) ON DELETE CASCADE,
        position INTEGER NOT NULL,
        member_id BIGINT NOT NULL REFERENCES members(member_id) ON DELETE CASCADE,
        PRIMARY KEY (switch_id, position)
    )",
    "CREATE TABLE IF NOT EXISTS channel_blacklist (
        guild_id BIGINT NOT NULL,
        channel_id BIGINT NOT NULL,
        PRIMARY KEY (guild_id, channel_id)
    )",
    "CREATE TABLE IF NOT EXISTS guild_log_channels (
        guild_id BIGINT PRIMARY KEY,
        channel_id BIGINT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS messages (
        relay_message_id BIGINT PRIMARY KEY,
        original_message_id BIGINT NOT NULL,
        channel_id BIGINT NOT NULL,
        guild_id BIGINT NOT NULL,
        author_account_id BIGINT NOT NULL,
        member_id BIGINT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_messages_original ON messages(original_message_id)",
];

/// Postgres-backed [`Repository`]. The schema is created on first use.
pub struct PgRepository {
    pool: PgPool,
    schema: OnceCell<()>,
}

impl PgRepository {
    /// Build a lazily connecting pool for `database_url`.
    ///
    /// # Errors
    /// Returns an error when the URL cannot be parsed.
    pub fn connect_lazy(database_url: &str) -> Result<Self, RepositoryError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect_lazy(database_url)?;
        Ok(Self {
            pool,
            schema: OnceCell::new(),
        })
    }

    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create tables and indexes once per process, serialized across
    /// processes by an advisory lock.
    ///
    /// # Errors
    /// Returns an error when any DDL statement fails.
    pub async fn ensure_schema(&self) -> Result<(), RepositoryError> {
        self.schema
            .get_or_try_init(|| async {
                let mut tx = self.pool.begin().await?;
                sqlx::query("SELECT pg_advisory_xact_lock($1)")
                    .bind(SCHEMA_INIT_LOCK_ID)
                    .execute(&mut *tx)
                    .await?;
                for statement in SCHEMA_STATEMENTS {
                    sqlx::query(statement).execute(&mut *tx).await?;
                }
                tx.commit().await?;
                tracing::info!(event = "db.schema", outcome = "ready");
                Ok::<(), RepositoryError>(())
            })
            .await?;
        Ok(())
    }
}

#[allow(clippy::cast_possible_wrap)]
const fn db_id(value: u64) -> i64 {
    value as i64
}

#[allow(clippy::cast_sign_loss)]
const fn from_db_id(value: i64) -> u64 {
    value as u64
}

fn system_from_row(row: &PgRow) -> Result<System, RepositoryError> {
    let latch_timeout_secs: Option<i64> = row.try_get("latch_timeout_secs")?;
    Ok(System {
        id: SystemId::new(from_db_id(row.try_get("system_id")?)),
        tag: row.try_get("tag")?,
        avatar_url: row.try_get("avatar_url")?,
        case_sensitive_tags: row.try_get("case_sensitive_tags")?,
        latch_timeout_secs: latch_timeout_secs
            .map(u64::try_from)
            .transpose()
            .map_err(|_| RepositoryError::Corrupt(String::from("negative latch timeout")))?,
    })
}

fn member_from_row(row: &PgRow) -> Result<Member, RepositoryError> {
    Ok(Member {
        id: MemberId::new(from_db_id(row.try_get("member_id")?)),
        system_id: SystemId::new(from_db_id(row.try_get("system_id")?)),
        name: row.try_get("name")?,
        display_name: row.try_get("display_name")?,
        server_name: row.try_get("server_name")?,
        avatar_url: row.try_get("avatar_url")?,
        server_avatar_url: row.try_get("server_avatar_url")?,
        color: row.try_get("color")?,
        proxy_tags: Vec::new(),
        keep_proxy: row.try_get("keep_proxy")?,
        allow_autoproxy: row.try_get("allow_autoproxy")?,
    })
}

#[async_trait]
impl Repository for PgRepository {
    async fn get_system_for_account(
        &self,
        account: AccountId,
    ) -> Result<Option<SystemAccount>, RepositoryError> {
        self.ensure_schema().await?;
        let row = sqlx::query(
            "SELECT s.system_id, s.tag, s.avatar_url, s.case_sensitive_tags, s.latch_timeout_secs,
                    a.allow_autoproxy
             FROM accounts a
             JOIN systems s ON s.system_id = a.system_id
             WHERE a.account_id = $1",
        )
        .bind(db_id(account.get()))
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| -> Result<SystemAccount, RepositoryError> {
            Ok(SystemAccount {
                account_id: account,
                system: system_from_row(&row)?,
                allow_autoproxy: row.try_get("allow_autoproxy")?,
            })
        })
        .transpose()
    }

    async fn get_proxy_members(
        &self,
        account: AccountId,
        guild: GuildId,
    ) -> Result<Vec<Member>, RepositoryError> {
        self.ensure_schema().await?;
        let rows = sqlx::query(
            "SELECT m.member_id, m.system_id, m.name, m.display_name, m.avatar_url, m.color,
                    m.keep_proxy, m.allow_autoproxy,
                    mg.display_name AS server_name, mg.avatar_url AS server_avatar_url
             FROM accounts a
             JOIN members m ON m.system_id = a.system_id
             LEFT JOIN member_guild mg ON mg.member_id = m.member_id AND mg.guild_id = $2
             WHERE a.account_id = $1
             ORDER BY m.member_id",
        )
        .bind(db_id(account.get()))
        .bind(db_id(guild.get()))
        .fetch_all(&self.pool)
        .await?;
        let mut members = rows
            .iter()
            .map(member_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        if members.is_empty() {
            return Ok(members);
        }

        let member_ids: Vec<i64> = members.iter().map(|member| db_id(member.id.get())).collect();
        let tag_rows = sqlx::query(
            "SELECT member_id, prefix, suffix
             FROM member_proxy_tags
             WHERE member_id = ANY($1)
             ORDER BY member_id, position",
        )
        .bind(member_ids)
        .fetch_all(&self.pool)
        .await?;
        let mut tags: HashMap<MemberId, Vec<ProxyTag>> = HashMap::new();
        for row in tag_rows {
            let member_id = MemberId::new(from_db_id(row.try_get("member_id")?));
            let prefix: Option<String> = row.try_get("prefix")?;
            let suffix: Option<String> = row.try_get("suffix")?;
            // Rows with neither side are ignored rather than failing the whole lookup.
            if let Ok(tag) = ProxyTag::new(prefix, suffix) {
                tags.entry(member_id).or_default().push(tag);
            }
        }
        for member in &mut members {
            member.proxy_tags = tags.remove(&member.id).unwrap_or_default();
        }
        Ok(members)
    }

    async fn get_guild_proxy_settings(
        &self,
        guild: GuildId,
        system: SystemId,
    ) -> Result<Option<GuildProxySettings>, RepositoryError> {
        self.ensure_schema().await?;
        let row = sqlx::query(
            "SELECT proxy_enabled, autoproxy_mode, autoproxy_member, tag, tag_enabled
             FROM system_guild
             WHERE guild_id = $1 AND system_id = $2",
        )
        .bind(db_id(guild.get()))
        .bind(db_id(system.get()))
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let mode: i16 = row.try_get("autoproxy_mode")?;
        let autoproxy_member: Option<i64> = row.try_get("autoproxy_member")?;
        Ok(Some(GuildProxySettings {
            guild_id: guild,
            system_id: system,
            proxy_enabled: row.try_get("proxy_enabled")?,
            autoproxy_mode: AutoproxyMode::try_from(mode)
                .map_err(|e| RepositoryError::Corrupt(e.to_string()))?,
            autoproxy_member: autoproxy_member.map(|id| MemberId::new(from_db_id(id))),
            tag: row.try_get("tag")?,
            tag_enabled: row.try_get("tag_enabled")?,
        }))
    }

    async fn get_latest_switch(&self, system: SystemId) -> Result<Vec<MemberId>, RepositoryError> {
        self.ensure_schema().await?;
        let rows = sqlx::query(
            "SELECT sm.member_id
             FROM switch_members sm
             WHERE sm.switch_id = (
                 SELECT switch_id FROM switches
                 WHERE system_id = $1
                 ORDER BY created_at_unix_ms DESC, switch_id DESC
                 LIMIT 1
             )
             ORDER BY sm.position",
        )
        .bind(db_id(system.get()))
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| -> Result<MemberId, RepositoryError> {
                Ok(MemberId::new(from_db_id(row.try_get("member_id")?)))
            })
            .collect()
    }

    async fn save_message_mapping(&self, mapping: &MessageMapping) -> Result<(), RepositoryError> {
        self.ensure_schema().await?;
        sqlx::query(
            "INSERT INTO messages
                (relay_message_id, original_message_id, channel_id, guild_id, author_account_id, member_id)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (relay_message_id) DO NOTHING",
        )
        .bind(db_id(mapping.relay_message_id.get()))
        .bind(db_id(mapping.original_message_id.get()))
        .bind(db_id(mapping.channel_id.get()))
        .bind(db_id(mapping.guild_id.get()))
        .bind(db_id(mapping.author_account_id.get()))
        .bind(db_id(mapping.member_id.get()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_message_mapping(
        &self,
        relay_message: MessageId,
    ) -> Result<(), RepositoryError> {
        self.ensure_schema().await?;
        sqlx::query("DELETE FROM messages WHERE relay_message_id = $1")
            .bind(db_id(relay_message.get()))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn is_channel_blacklisted(
        &self,
        guild: GuildId,
        channel: ChannelId,
    ) -> Result<bool, RepositoryError> {
        self.ensure_schema().await?;
        let row = sqlx::query(
            "SELECT EXISTS (
                 SELECT 1 FROM channel_blacklist WHERE guild_id = $1 AND channel_id = $2
             ) AS blacklisted",
        )
        .bind(db_id(guild.get()))
        .bind(db_id(channel.get()))
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("blacklisted")?)
    }

    async fn get_log_channel(&self, guild: GuildId) -> Result<Option<ChannelId>, RepositoryError> {
        self.ensure_schema().await?;
        let row = sqlx::query("SELECT channel_id FROM guild_log_channels WHERE guild_id = $1")
            .bind(db_id(guild.get()))
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| -> Result<ChannelId, RepositoryError> {
            let channel: i64 = row.try_get("channel_id")?;
            Ok(ChannelId::new(from_db_id(channel)))
        })
        .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::{db_id, from_db_id, PgRepository, SCHEMA_STATEMENTS};

    #[test]
    fn snowflakes_survive_bigint_storage() {
        let id = 1_234_567_890_123_456_789_u64;
        assert_eq!(from_db_id(db_id(id)), id);
    }

    #[test]
    fn schema_statements_are_idempotent() {
        assert!(SCHEMA_STATEMENTS
            .iter()
            .all(|statement| statement.contains("IF NOT EXISTS")));
    }

    #[tokio::test]
    async fn rejects_malformed_database_url() {
        assert!(PgRepository::connect_lazy("not a url").is_err());
    }
}
