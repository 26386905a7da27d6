use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, PoisonError, RwLock,
    },
};

use plume_core::{AccountId, GuildId, GuildProxySettings, Member, System, SystemId};

use super::{
    clock::Clock,
    expiry::{ExpiringCache, Expiry},
    metrics::ProxyMetrics,
    repository::{Repository, RepositoryError},
};

/// Expiry policies for the three kinds of cached entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemberCachePolicy {
    pub candidates: Expiry,
    /// Accounts without a system: idle longer, capped sooner.
    pub no_system: Expiry,
    pub guild_settings: Expiry,
}

/// Everything the pipeline needs to proxy for one account in one guild.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyCandidates {
    pub system: Option<System>,
    pub account_allows_autoproxy: bool,
    pub members: Vec<Member>,
}

impl ProxyCandidates {
    fn no_system() -> Self {
        Self {
            system: None,
            account_allows_autoproxy: false,
            members: Vec::new(),
        }
    }
}

pub struct MemberCache {
    repo: Arc<dyn Repository>,
    policy: MemberCachePolicy,
    candidates: ExpiringCache<(AccountId, GuildId), Arc<ProxyCandidates>>,
    settings: ExpiringCache<(GuildId, SystemId), Arc<GuildProxySettings>>,
    system_accounts: RwLock<HashMap<SystemId, HashSet<AccountId>>>,
    /// Bumped by every invalidation; a fill that started before the bump is discarded.
    generation: AtomicU64,
    metrics: Arc<ProxyMetrics>,
}

impl MemberCache {
    pub(crate) fn new(
        repo: Arc<dyn Repository>,
        clock: Arc<dyn Clock>,
        policy: MemberCachePolicy,
        metrics: Arc<ProxyMetrics>,
    ) -> Self {
        Self {
            repo,
            policy,
            candidates: ExpiringCache::new(clock.clone()),
            settings: ExpiringCache::new(clock),
            system_accounts: RwLock::new(HashMap::new()),
            generation: AtomicU64::new(0),
            metrics,
        }
    }

    /// Candidate members for `account` speaking in `guild`.
    ///
    /// # Errors
    /// Returns [`RepositoryError`] when a cache miss cannot be filled.
    pub async fn candidates_for(
        &self,
        account: AccountId,
        guild: GuildId,
    ) -> Result<Arc<ProxyCandidates>, RepositoryError> {
        let key = (account, guild);
        if let Some(found) = self.candidates.get(&key) {
            self.metrics.record_cache_lookup("candidates", true);
            return Ok(found);
        }
        self.metrics.record_cache_lookup("candidates", false);

        let generation = self.generation.load(Ordering::Acquire);
        let (value, expiry) = match self.repo.get_system_for_account(account).await? {
            None => (Arc::new(ProxyCandidates::no_system()), self.policy.no_system),
            Some(linked) => {
                let members = self.repo.get_proxy_members(account, guild).await?;
                self.remember_account(linked.system.id, account);
                let candidates = ProxyCandidates {
                    system: Some(linked.system),
                    account_allows_autoproxy: linked.allow_autoproxy,
                    members,
                };
                (Arc::new(candidates), self.policy.candidates)
            }
        };

        if self.generation.load(Ordering::Acquire) == generation {
            self.candidates.insert(key, value.clone(), expiry);
        }
        Ok(value)
    }

    /// Per-guild settings for `system`, falling back to the unconfigured defaults.
    ///
    /// # Errors
    /// Returns [`RepositoryError`] when a cache miss cannot be filled.
    pub async fn guild_settings_for(
        &self,
        guild: GuildId,
        system: SystemId,
    ) -> Result<Arc<GuildProxySettings>, RepositoryError> {
        let key = (guild, system);
        if let Some(found) = self.settings.get(&key) {
            self.metrics.record_cache_lookup("guild_settings", true);
            return Ok(found);
        }
        self.metrics.record_cache_lookup("guild_settings", false);

        let generation = self.generation.load(Ordering::Acquire);
        let settings = self
            .repo
            .get_guild_proxy_settings(guild, system)
            .await?
            .unwrap_or_else(|| GuildProxySettings::unconfigured(guild, system));
        let value = Arc::new(settings);
        if self.generation.load(Ordering::Acquire) == generation {
            self.settings
                .insert(key, value.clone(), self.policy.guild_settings);
        }
        Ok(value)
    }

    /// Forget everything cached for `account`.
    pub fn invalidate(&self, account: AccountId) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.candidates
            .retain(|(cached_account, _), _| *cached_account != account);
        tracing::debug!(event = "cache.invalidate", scope = "account", account_id = %account);
    }

    /// Forget everything cached for `system` and for every account linked to it.
    pub fn invalidate_system(&self, system: SystemId) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        let accounts = self
            .system_accounts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&system)
            .unwrap_or_default();
        self.candidates.retain(|(account, _), value| {
            !accounts.contains(account)
                && value.system.as_ref().map(|cached| cached.id) != Some(system)
        });
        self.settings
            .retain(|(_, cached_system), _| *cached_system != system);
        tracing::debug!(
            event = "cache.invalidate",
            scope = "system",
            system_id = %system,
            accounts = accounts.len()
        );
    }

    pub fn invalidate_guild_settings(&self, guild: GuildId, system: SystemId) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.settings.remove(&(guild, system));
    }

    /// Drop expired entries and unlink accounts that no longer have any.
    pub(crate) fn purge_expired(&self) -> usize {
        let purged = self.candidates.purge_expired() + self.settings.purge_expired();
        if purged > 0 {
            let mut live = HashSet::new();
            self.candidates.retain(|(account, _), _| {
                live.insert(*account);
                true
            });
            self.system_accounts
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .retain(|_, accounts| {
                    accounts.retain(|account| live.contains(account));
                    !accounts.is_empty()
                });
        }
        purged
    }

    fn remember_account(&self, system: SystemId, account: AccountId) {
        self.system_accounts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(system)
            .or_default()
            .insert(account);
    }
}
