use std::env;

use plume_core::{
    AccountId, AutoproxyMode, ChannelId, GuildId, MemberId, MessageId, MessageMapping, SystemId,
};
use plume_server::{PgRepository, Repository};
use ulid::Ulid;

fn postgres_url() -> Option<String> {
    env::var("PLUME_TEST_DATABASE_URL").ok()
}

/// Random id base so parallel runs against one database do not collide.
fn id_base() -> u64 {
    u64::try_from(Ulid::new().random() & 0x0000_ffff_ffff_ff00).unwrap()
}

fn db(value: u64) -> i64 {
    i64::try_from(value).unwrap()
}

struct Seed {
    account: AccountId,
    system: SystemId,
    alice: MemberId,
    bob: MemberId,
    guild: GuildId,
    channel: ChannelId,
}

async fn seed(repo: &PgRepository) -> Seed {
    let base = id_base();
    let seed = Seed {
        account: AccountId::new(base + 1),
        system: SystemId::new(base + 2),
        alice: MemberId::new(base + 3),
        bob: MemberId::new(base + 4),
        guild: GuildId::new(base + 5),
        channel: ChannelId::new(base + 6),
    };
    repo.ensure_schema().await.unwrap();
    let pool = repo.pool();

    sqlx::query("INSERT INTO systems (system_id, tag, latch_timeout_secs) VALUES ($1, $2, $3)")
        .bind(db(seed.system.get()))
        .bind("| sys")
        .bind(60_i64)
        .execute(pool)
        .await
        .unwrap();
    sqlx::query("INSERT INTO accounts (account_id, system_id, allow_autoproxy) VALUES ($1, $2, FALSE)")
        .bind(db(seed.account.get()))
        .bind(db(seed.system.get()))
        .execute(pool)
        .await
        .unwrap();
    for (member, name) in [(seed.alice, "Alice"), (seed.bob, "Bob")] {
        sqlx::query("INSERT INTO members (member_id, system_id, name) VALUES ($1, $2, $3)")
            .bind(db(member.get()))
            .bind(db(seed.system.get()))
            .bind(name)
            .execute(pool)
            .await
            .unwrap();
    }
    sqlx::query(
        "INSERT INTO member_proxy_tags (member_id, position, prefix, suffix)
         VALUES ($1, 0, '[', ']'), ($1, 1, 'a:', NULL), ($1, 2, NULL, NULL)",
    )
    .bind(db(seed.alice.get()))
    .execute(pool)
    .await
    .unwrap();
    sqlx::query(
        "INSERT INTO member_guild (member_id, guild_id, display_name, avatar_url)
         VALUES ($1, $2, 'Ally', 'https://cdn.example/ally.png')",
    )
    .bind(db(seed.alice.get()))
    .bind(db(seed.guild.get()))
    .execute(pool)
    .await
    .unwrap();
    seed
}

#[tokio::test]
async fn postgres_backed_member_lookup_applies_guild_overrides() {
    let Some(database_url) = postgres_url() else {
        eprintln!("skipping postgres-backed test: PLUME_TEST_DATABASE_URL is unset");
        return;
    };
    let repo = PgRepository::connect_lazy(&database_url).unwrap();
    let seed = seed(&repo).await;

    let linked = repo
        .get_system_for_account(seed.account)
        .await
        .unwrap()
        .expect("account should be linked");
    assert_eq!(linked.system.id, seed.system);
    assert_eq!(linked.system.tag.as_deref(), Some("| sys"));
    assert_eq!(linked.system.latch_timeout_secs, Some(60));
    assert!(!linked.allow_autoproxy);

    let members = repo
        .get_proxy_members(seed.account, seed.guild)
        .await
        .unwrap();
    assert_eq!(members.len(), 2);
    let alice = &members[0];
    assert_eq!(alice.id, seed.alice);
    assert_eq!(alice.server_name.as_deref(), Some("Ally"));
    assert_eq!(alice.proxy_tags.len(), 2);
    assert_eq!(alice.proxy_tags[0].proxy_string(), "[text]");
    assert!(members[1].proxy_tags.is_empty());

    let elsewhere = repo
        .get_proxy_members(seed.account, GuildId::new(seed.guild.get() + 100))
        .await
        .unwrap();
    assert_eq!(elsewhere[0].server_name, None);
}

#[tokio::test]
async fn postgres_backed_settings_switches_and_mappings() {
    let Some(database_url) = postgres_url() else {
        eprintln!("skipping postgres-backed test: PLUME_TEST_DATABASE_URL is unset");
        return;
    };
    let repo = PgRepository::connect_lazy(&database_url).unwrap();
    let seed = seed(&repo).await;
    let pool = repo.pool();

    assert_eq!(
        repo.get_guild_proxy_settings(seed.guild, seed.system)
            .await
            .unwrap(),
        None
    );
    sqlx::query(
        "INSERT INTO system_guild (guild_id, system_id, autoproxy_mode, autoproxy_member)
         VALUES ($1, $2, $3, $4)",
    )
    .bind(db(seed.guild.get()))
    .bind(db(seed.system.get()))
    .bind(AutoproxyMode::Member.as_i16())
    .bind(db(seed.bob.get()))
    .execute(pool)
    .await
    .unwrap();
    let settings = repo
        .get_guild_proxy_settings(seed.guild, seed.system)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(settings.autoproxy_mode, AutoproxyMode::Member);
    assert_eq!(settings.autoproxy_member, Some(seed.bob));
    assert!(settings.proxy_enabled);

    assert!(repo.get_latest_switch(seed.system).await.unwrap().is_empty());
    for (created_at, fronters) in [(1_i64, [seed.alice, seed.bob]), (2, [seed.bob, seed.alice])] {
        let switch_id: i64 = sqlx::query_scalar(
            "INSERT INTO switches (system_id, created_at_unix_ms) VALUES ($1, $2)
             RETURNING switch_id",
        )
        .bind(db(seed.system.get()))
        .bind(created_at)
        .fetch_one(pool)
        .await
        .unwrap();
        for (position, member) in (0_i32..).zip(fronters) {
            sqlx::query(
                "INSERT INTO switch_members (switch_id, position, member_id) VALUES ($1, $2, $3)",
            )
            .bind(switch_id)
            .bind(position)
            .bind(db(member.get()))
            .execute(pool)
            .await
            .unwrap();
        }
    }
    assert_eq!(
        repo.get_latest_switch(seed.system).await.unwrap(),
        vec![seed.bob, seed.alice]
    );

    assert!(!repo
        .is_channel_blacklisted(seed.guild, seed.channel)
        .await
        .unwrap());
    sqlx::query("INSERT INTO channel_blacklist (guild_id, channel_id) VALUES ($1, $2)")
        .bind(db(seed.guild.get()))
        .bind(db(seed.channel.get()))
        .execute(pool)
        .await
        .unwrap();
    assert!(repo
        .is_channel_blacklisted(seed.guild, seed.channel)
        .await
        .unwrap());
    assert_eq!(repo.get_log_channel(seed.guild).await.unwrap(), None);

    let mapping = MessageMapping {
        original_message_id: MessageId::new(seed.channel.get() + 10),
        relay_message_id: MessageId::new(seed.channel.get() + 11),
        channel_id: seed.channel,
        guild_id: seed.guild,
        author_account_id: seed.account,
        member_id: seed.alice,
    };
    repo.save_message_mapping(&mapping).await.unwrap();
    repo.save_message_mapping(&mapping).await.unwrap();
    let stored: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE relay_message_id = $1")
        .bind(db(mapping.relay_message_id.get()))
        .fetch_one(pool)
        .await
        .unwrap();
    assert_eq!(stored, 1);

    repo.delete_message_mapping(mapping.relay_message_id)
        .await
        .unwrap();
    let stored: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE relay_message_id = $1")
        .bind(db(mapping.relay_message_id.get()))
        .fetch_one(pool)
        .await
        .unwrap();
    assert_eq!(stored, 0);
}
