use std::borrow::Cow;

use crate::{DomainError, GuildProxySettings, Member, System};

/// Largest message body the relay API accepts.
pub const MAX_RELAY_CONTENT_CHARS: usize = 2000;
/// Largest username the relay API accepts.
pub const MAX_RELAY_USERNAME_CHARS: usize = 80;

const ZERO_WIDTH_SPACE: char = '\u{200b}';
const HAIR_SPACE: char = '\u{200a}';
const BROAD_MENTIONS: [&str; 2] = ["@everyone", "@here"];
const RESERVED_USERNAME: &str = "clyde";

/// Name shown on a relayed message: the member's name plus the system tag.
///
/// The member name is the guild override, then the display name, then the
/// plain name. The tag is the guild tag, then the system tag, and is left
/// out entirely when the guild disabled tags.
#[must_use]
pub fn compose_display_name(
    member: &Member,
    system: &System,
    settings: &GuildProxySettings,
) -> String {
    let name = member
        .server_name
        .as_deref()
        .or(member.display_name.as_deref())
        .unwrap_or(&member.name);
    let tag = settings
        .tag_enabled
        .then(|| settings.tag.as_deref().or(system.tag.as_deref()))
        .flatten()
        .filter(|tag| !tag.is_empty());

    match tag {
        Some(tag) => format!("{name} {tag}"),
        None => name.to_owned(),
    }
}

#[must_use]
pub fn resolve_avatar_url<'a>(member: &'a Member, system: &'a System) -> Option<&'a str> {
    member
        .server_avatar_url
        .as_deref()
        .or(member.avatar_url.as_deref())
        .or(system.avatar_url.as_deref())
}

/// # Errors
/// Returns [`DomainError::DisplayNameTooShort`] or
/// [`DomainError::DisplayNameTooLong`] when `name` is outside `min..=max` chars.
pub fn validate_display_name(name: &str, min: usize, max: usize) -> Result<(), DomainError> {
    let actual = name.chars().count();
    if actual < min {
        return Err(DomainError::DisplayNameTooShort { min, actual });
    }
    if actual > max {
        return Err(DomainError::DisplayNameTooLong { max, actual });
    }
    Ok(())
}

/// # Errors
/// Returns [`DomainError::ContentTooLong`] when `content` exceeds `max` chars.
pub fn validate_content_length(content: &str, max: usize) -> Result<(), DomainError> {
    let actual = content.chars().count();
    if actual > max {
        return Err(DomainError::ContentTooLong { max, actual });
    }
    Ok(())
}

/// Breaks `@everyone` and `@here` so they no longer ping.
#[must_use]
pub fn neutralize_broad_mentions(content: &str) -> Cow<'_, str> {
    if !BROAD_MENTIONS
        .iter()
        .any(|mention| content.contains(mention))
    {
        return Cow::Borrowed(content);
    }

    let mut output = content.to_owned();
    for mention in BROAD_MENTIONS {
        let word = &mention[1..];
        output = output.replace(mention, &format!("@{ZERO_WIDTH_SPACE}{word}"));
    }
    Cow::Owned(output)
}

/// Username accepted by the relay API: reserved words broken up, length capped.
#[must_use]
pub fn relay_username(name: &str) -> String {
    let mut output = String::with_capacity(name.len());
    for (index, c) in name.char_indices() {
        output.push(c);
        let starts_reserved = name[index..]
            .chars()
            .take(RESERVED_USERNAME.len())
            .flat_map(char::to_lowercase)
            .eq(RESERVED_USERNAME.chars());
        if starts_reserved {
            output.push(HAIR_SPACE);
        }
    }
    truncate_chars(&mut output, MAX_RELAY_USERNAME_CHARS);
    output
}

/// Cuts `value` down to at most `max` chars.
pub fn truncate_chars(value: &mut String, max: usize) {
    if let Some((index, _)) = value.char_indices().nth(max) {
        value.truncate(index);
    }
}

#[cfg(test)]
mod tests {
    use super::{
        compose_display_name, neutralize_broad_mentions, relay_username, resolve_avatar_url,
        truncate_chars, validate_content_length, validate_display_name,
    };
    use crate::{DomainError, GuildId, GuildProxySettings, Member, MemberId, System, SystemId};

    fn member() -> Member {
        Member {
            id: MemberId::new(7),
            system_id: SystemId::new(1),
            name: String::from("Alex"),
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

    fn system(tag: Option<&str>) -> System {
        System {
            id: SystemId::new(1),
            tag: tag.map(str::to_owned),
            avatar_url: Some(String::from("https://cdn.example/system.png")),
            case_sensitive_tags: false,
            latch_timeout_secs: None,
        }
    }

    #[test]
    fn display_name_prefers_guild_override_then_display_name() {
        let settings = GuildProxySettings::unconfigured(GuildId::new(1), SystemId::new(1));
        let mut member = member();
        assert_eq!(
            compose_display_name(&member, &system(None), &settings),
            "Alex"
        );
        member.display_name = Some(String::from("Alexandra"));
        assert_eq!(
            compose_display_name(&member, &system(None), &settings),
            "Alexandra"
        );
        member.server_name = Some(String::from("Lex"));
        assert_eq!(
            compose_display_name(&member, &system(None), &settings),
            "Lex"
        );
    }

    #[test]
    fn display_name_appends_guild_or_system_tag() {
        let mut settings = GuildProxySettings::unconfigured(GuildId::new(1), SystemId::new(1));
        assert_eq!(
            compose_display_name(&member(), &system(Some("|sys")), &settings),
            "Alex |sys"
        );
        settings.tag = Some(String::from("[guild]"));
        assert_eq!(
            compose_display_name(&member(), &system(Some("|sys")), &settings),
            "Alex [guild]"
        );
        settings.tag_enabled = false;
        assert_eq!(
            compose_display_name(&member(), &system(Some("|sys")), &settings),
            "Alex"
        );
    }

    #[test]
    fn avatar_falls_back_to_system() {
        let mut member = member();
        assert_eq!(
            resolve_avatar_url(&member, &system(None)),
            Some("https://cdn.example/system.png")
        );
        member.avatar_url = Some(String::from("https://cdn.example/member.png"));
        member.server_avatar_url = Some(String::from("https://cdn.example/guild.png"));
        assert_eq!(
            resolve_avatar_url(&member, &system(None)),
            Some("https://cdn.example/guild.png")
        );
    }

    #[test]
    fn display_name_bounds_count_chars() {
        assert!(validate_display_name("éé", 2, 32).is_ok());
        assert_eq!(
            validate_display_name("A", 2, 32).unwrap_err(),
            DomainError::DisplayNameTooShort { min: 2, actual: 1 }
        );
        assert_eq!(
            validate_display_name(&"x".repeat(33), 2, 32).unwrap_err(),
            DomainError::DisplayNameTooLong {
                max: 32,
                actual: 33
            }
        );
    }

    #[test]
    fn content_length_limit_is_inclusive() {
        assert!(validate_content_length(&"a".repeat(2000), 2000).is_ok());
        assert!(validate_content_length(&"a".repeat(2001), 2000).is_err());
    }

    #[test]
    fn broad_mentions_are_neutralized() {
        assert_eq!(
            neutralize_broad_mentions("hi @everyone and @here"),
            "hi @\u{200b}everyone and @\u{200b}here"
        );
        assert_eq!(neutralize_broad_mentions("hi @someone"), "hi @someone");
    }

    #[test]
    fn reserved_username_gets_hair_space() {
        assert_eq!(relay_username("Clyde Bot"), "C\u{200a}lyde Bot");
        assert_eq!(relay_username("not clyde"), "not c\u{200a}lyde");
        assert_eq!(relay_username(&"n".repeat(100)).chars().count(), 80);
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let mut value = String::from("ééé");
        truncate_chars(&mut value, 2);
        assert_eq!(value, "éé");
    }
}
