use std::{
    collections::{HashMap, HashSet},
    sync::atomic::{AtomicUsize, Ordering},
};

use async_trait::async_trait;
use plume_core::{
    AccountId, ChannelId, GuildId, GuildProxySettings, Member, MemberId, MessageId,
    MessageMapping, System, SystemAccount, SystemId,
};
use tokio::sync::RwLock;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RepositoryError {
    #[error("database failure: {0}")]
    Database(String),
    #[error("stored record is invalid: {0}")]
    Corrupt(String),
}

impl From<sqlx::Error> for RepositoryError {
    fn from(value: sqlx::Error) -> Self {
        Self::Database(value.to_string())
    }
}

/// Storage operations the proxy pipeline needs.
#[async_trait]
pub trait Repository: Send + Sync {
    async fn get_system_for_account(
        &self,
        account: AccountId,
    ) -> Result<Option<SystemAccount>, RepositoryError>;

    /// Members of the account's system, with guild overrides applied.
    async fn get_proxy_members(
        &self,
        account: AccountId,
        guild: GuildId,
    ) -> Result<Vec<Member>, RepositoryError>;

    async fn get_guild_proxy_settings(
        &self,
        guild: GuildId,
        system: SystemId,
    ) -> Result<Option<GuildProxySettings>, RepositoryError>;

    /// Members of the most recent switch, first fronter first.
    async fn get_latest_switch(&self, system: SystemId) -> Result<Vec<MemberId>, RepositoryError>;

    async fn save_message_mapping(&self, mapping: &MessageMapping) -> Result<(), RepositoryError>;

    async fn delete_message_mapping(&self, relay_message: MessageId)
        -> Result<(), RepositoryError>;

    async fn is_channel_blacklisted(
        &self,
        guild: GuildId,
        channel: ChannelId,
    ) -> Result<bool, RepositoryError>;

    async fn get_log_channel(&self, guild: GuildId) -> Result<Option<ChannelId>, RepositoryError>;
}

#[derive(Debug, Clone, Default)]
struct MemberGuildOverride {
    name: Option<String>,
    avatar_url: Option<String>,
}

#[derive(Default)]
struct Store {
    systems: HashMap<SystemId, System>,
    accounts: HashMap<AccountId, (SystemId, bool)>,
    members: HashMap<MemberId, Member>,
    member_guild: HashMap<(MemberId, GuildId), MemberGuildOverride>,
    guild_settings: HashMap<(GuildId, SystemId), GuildProxySettings>,
    switches: HashMap<SystemId, Vec<Vec<MemberId>>>,
    blacklist: HashSet<(GuildId, ChannelId)>,
    log_channels: HashMap<GuildId, ChannelId>,
    mappings: HashMap<MessageId, MessageMapping>,
}

/// Process-local repository used without a database and in tests.
#[derive(Default)]
pub struct InMemoryRepository {
    store: RwLock<Store>,
    system_lookups: AtomicUsize,
}

impl InMemoryRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn upsert_system(&self, system: System) {
        self.store.write().await.systems.insert(system.id, system);
    }

    pub async fn link_account(&self, account: AccountId, system: SystemId, allow_autoproxy: bool) {
        self.store
            .write()
            .await
            .accounts
            .insert(account, (system, allow_autoproxy));
    }

    pub async fn upsert_member(&self, member: Member) {
        self.store.write().await.members.insert(member.id, member);
    }

    pub async fn set_member_guild_override(
        &self,
        member: MemberId,
        guild: GuildId,
        name: Option<String>,
        avatar_url: Option<String>,
    ) {
        self.store
            .write()
            .await
            .member_guild
            .insert((member, guild), MemberGuildOverride { name, avatar_url });
    }

    pub async fn set_guild_settings(&self, settings: GuildProxySettings) {
        self.store
            .write()
            .await
            .guild_settings
            .insert((settings.guild_id, settings.system_id), settings);
    }

    pub async fn record_switch(&self, system: SystemId, fronters: Vec<MemberId>) {
        self.store
            .write()
            .await
            .switches
            .entry(system)
            .or_default()
            .push(fronters);
    }

    pub async fn blacklist_channel(&self, guild: GuildId, channel: ChannelId) {
        self.store.write().await.blacklist.insert((guild, channel));
    }

    pub async fn set_log_channel(&self, guild: GuildId, channel: ChannelId) {
        self.store.write().await.log_channels.insert(guild, channel);
    }

    pub async fn message_mapping(&self, relay_message: MessageId) -> Option<MessageMapping> {
        self.store.read().await.mappings.get(&relay_message).cloned()
    }

    pub async fn message_mapping_count(&self) -> usize {
        self.store.read().await.mappings.len()
    }

    /// How many times a system was looked up by account.
    pub fn system_lookup_count(&self) -> usize {
        self.system_lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn get_system_for_account(
        &self,
        account: AccountId,
    ) -> Result<Option<SystemAccount>, RepositoryError> {
        self.system_lookups.fetch_add(1, Ordering::SeqCst);
        let store = self.store.read().await;
        let Some((system_id, allow_autoproxy)) = store.accounts.get(&account).copied() else {
            return Ok(None);
        };
        let system = store.systems.get(&system_id).cloned().ok_or_else(|| {
            RepositoryError::Corrupt(format!("account {account} links missing system"))
        })?;
        Ok(Some(SystemAccount {
            account_id: account,
            system,
            allow_autoproxy,
        }))
    }

    async fn get_proxy_members(
        &self,
        account: AccountId,
        guild: GuildId,
    ) -> Result<Vec<Member>, RepositoryError> {
        let store = self.store.read().await;
        let Some((system_id, _)) = store.accounts.get(&account).copied() else {
            return Ok(Vec::new());
        };
        let mut members: Vec<Member> = store
            .members
            .values()
            .filter(|member| member.system_id == system_id)
            .map(|member| {
                let overrides = store
                    .member_guild
                    .get(&(member.id, guild))
                    .cloned()
                    .unwrap_or_default();
                Member {
                    server_name: overrides.name,
                    server_avatar_url: overrides.avatar_url,
                    ..member.clone()
                }
            })
            .collect();
        members.sort_by_key(|member| member.id);
        Ok(members)
    }

    async fn get_guild_proxy_settings(
        &self,
        guild: GuildId,
        system: SystemId,
    ) -> Result<Option<GuildProxySettings>, RepositoryError> {
        Ok(self
            .store
            .read()
            .await
            .guild_settings
            .get(&(guild, system))
            .cloned())
    }

    async fn get_latest_switch(&self, system: SystemId) -> Result<Vec<MemberId>, RepositoryError> {
        Ok(self
            .store
            .read()
            .await
            .switches
            .get(&system)
            .and_then(|history| history.last())
            .cloned()
            .unwrap_or_default())
    }

    async fn save_message_mapping(&self, mapping: &MessageMapping) -> Result<(), RepositoryError> {
        self.store
            .write()
            .await
            .mappings
            .entry(mapping.relay_message_id)
            .or_insert_with(|| mapping.clone());
        Ok(())
    }

    async fn delete_message_mapping(
        &self,
        relay_message: MessageId,
    ) -> Result<(), RepositoryError> {
        self.store.write().await.mappings.remove(&relay_message);
        Ok(())
    }

    async fn is_channel_blacklisted(
        &self,
        guild: GuildId,
        channel: ChannelId,
    ) -> Result<bool, RepositoryError> {
        Ok(self
            .store
            .read()
            .await
            .blacklist
            .contains(&(guild, channel)))
    }

    async fn get_log_channel(&self, guild: GuildId) -> Result<Option<ChannelId>, RepositoryError> {
        Ok(self.store.read().await.log_channels.get(&guild).copied())
    }
}

#[cfg(test)]
mod tests {
    use plume_core::{
        AccountId, ChannelId, GuildId, Member, MemberId, MessageId, MessageMapping, System,
        SystemId,
    };

    use super::{InMemoryRepository, Repository};

    fn system() -> System {
        System {
            id: SystemId::new(1),
            tag: None,
            avatar_url: None,
            case_sensitive_tags: false,
            latch_timeout_secs: None,
        }
    }

    fn member(id: u64) -> Member {
        Member {
            id: MemberId::new(id),
            system_id: SystemId::new(1),
            name: format!("m{id}"),
            display_name: None,
            server_name: None,
            avatar_url: None,
            server_avatar_url: None,
            color: None,
            proxy_tags: Vec::new(),
            keep_proxy: false,
            allow_autoproxy: true,
        }
    }

    #[tokio::test]
    async fn unknown_account_has_no_system() {
        let repo = InMemoryRepository::new();
        assert!(repo
            .get_system_for_account(AccountId::new(5))
            .await
            .unwrap()
            .is_none());
        assert_eq!(repo.system_lookup_count(), 1);
    }

    #[tokio::test]
    async fn proxy_members_apply_guild_overrides() {
        let repo = InMemoryRepository::new();
        repo.upsert_system(system()).await;
        repo.link_account(AccountId::new(9), SystemId::new(1), true)
            .await;
        repo.upsert_member(member(2)).await;
        repo.upsert_member(member(1)).await;
        repo.set_member_guild_override(
            MemberId::new(2),
            GuildId::new(7),
            Some(String::from("Guild Name")),
            None,
        )
        .await;

        let members = repo
            .get_proxy_members(AccountId::new(9), GuildId::new(7))
            .await
            .unwrap();
        assert_eq!(members.len(), 2);
        assert_eq!(members[0].id, MemberId::new(1));
        assert_eq!(members[1].server_name.as_deref(), Some("Guild Name"));

        let elsewhere = repo
            .get_proxy_members(AccountId::new(9), GuildId::new(8))
            .await
            .unwrap();
        assert!(elsewhere.iter().all(|member| member.server_name.is_none()));
    }

    #[tokio::test]
    async fn latest_switch_is_the_last_recorded() {
        let repo = InMemoryRepository::new();
        assert!(repo
            .get_latest_switch(SystemId::new(1))
            .await
            .unwrap()
            .is_empty());
        repo.record_switch(SystemId::new(1), vec![MemberId::new(1)])
            .await;
        repo.record_switch(SystemId::new(1), vec![MemberId::new(2), MemberId::new(1)])
            .await;
        assert_eq!(
            repo.get_latest_switch(SystemId::new(1)).await.unwrap(),
            vec![MemberId::new(2), MemberId::new(1)]
        );
    }

    #[tokio::test]
    async fn mappings_are_saved_once_and_deleted() {
        let repo = InMemoryRepository::new();
        let mapping = MessageMapping {
            original_message_id: MessageId::new(1),
            relay_message_id: MessageId::new(2),
            channel_id: ChannelId::new(3),
            guild_id: GuildId::new(4),
            author_account_id: AccountId::new(5),
            member_id: MemberId::new(6),
        };
        repo.save_message_mapping(&mapping).await.unwrap();
        repo.save_message_mapping(&mapping).await.unwrap();
        assert_eq!(repo.message_mapping_count().await, 1);
        repo.delete_message_mapping(MessageId::new(2)).await.unwrap();
        assert!(repo.message_mapping(MessageId::new(2)).await.is_none());
    }
}
