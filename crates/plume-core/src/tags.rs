use crate::{Member, ProxyTag};

const MENTION_MIN_DIGITS: usize = 17;
const MENTION_MAX_DIGITS: usize = 19;
const VARIATION_SELECTOR_16: &str = "\u{fe0f}";

/// Result of matching a message against a system's proxy tags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagMatch<'a> {
    pub member: &'a Member,
    pub tag: &'a ProxyTag,
    /// Mention token that preceded the tagged text, without the separating space.
    pub leading_mention: Option<&'a str>,
    /// Text between prefix and suffix, untrimmed.
    pub inner: &'a str,
}

impl TagMatch<'_> {
    /// Text to relay with the tags stripped.
    #[must_use]
    pub fn stripped_content(&self) -> String {
        self.with_mention(self.inner)
    }

    /// Text to relay with the tags kept in place.
    #[must_use]
    pub fn tagged_content(&self) -> String {
        self.with_mention(&format!(
            "{}{}{}",
            self.tag.prefix(),
            self.inner,
            self.tag.suffix()
        ))
    }

    #[must_use]
    pub fn is_blank(&self) -> bool {
        self.inner.trim().is_empty()
    }

    fn with_mention(&self, body: &str) -> String {
        match self.leading_mention {
            Some(mention) => format!("{mention} {body}"),
            None => body.to_owned(),
        }
    }
}

/// Finds the most specific proxy tag matching `content`.
///
/// Tags are ranked by prefix plus suffix length, longest first; ties keep
/// member order. A leading mention followed by a space is set aside before
/// matching and reattached by [`TagMatch::stripped_content`].
#[must_use]
pub fn match_proxy_tags<'a>(
    content: &'a str,
    members: &'a [Member],
    case_sensitive: bool,
) -> Option<TagMatch<'a>> {
    let mut candidates: Vec<(&Member, &ProxyTag)> = members
        .iter()
        .flat_map(|member| member.proxy_tags.iter().map(move |tag| (member, tag)))
        .filter(|(_, tag)| !tag.is_empty())
        .collect();
    candidates.sort_by(|(_, a), (_, b)| b.specificity().cmp(&a.specificity()));

    if let Some((mention, rest)) = split_leading_mention(content) {
        if let Some(found) = first_match(rest, &candidates, case_sensitive) {
            return Some(TagMatch {
                leading_mention: Some(mention),
                ..found
            });
        }
    }
    first_match(content, &candidates, case_sensitive)
}

fn first_match<'a>(
    text: &'a str,
    candidates: &[(&'a Member, &'a ProxyTag)],
    case_sensitive: bool,
) -> Option<TagMatch<'a>> {
    candidates.iter().find_map(|&(member, tag)| {
        let inner = match_tag(text, tag, case_sensitive)?;
        if inner.trim() == VARIATION_SELECTOR_16 {
            return None;
        }
        Some(TagMatch {
            member,
            tag,
            leading_mention: None,
            inner,
        })
    })
}

fn match_tag<'a>(text: &'a str, tag: &ProxyTag, case_sensitive: bool) -> Option<&'a str> {
    let (prefix, suffix) = (tag.prefix(), tag.suffix());

    // Spaced tags sent with no text, e.g. "a: " typed as "a:".
    let bare = format!("{}{}", prefix.trim_end(), suffix.trim_start());
    if !bare.is_empty() && text_eq(text.trim(), &bare, case_sensitive) {
        return Some("");
    }

    if text.chars().count() < prefix.chars().count() + suffix.chars().count() {
        return None;
    }
    let rest = strip_prefix(text, prefix, case_sensitive)?;
    strip_suffix(rest, suffix, case_sensitive)
}

fn text_eq(a: &str, b: &str, case_sensitive: bool) -> bool {
    if case_sensitive {
        a == b
    } else {
        a.chars()
            .flat_map(char::to_lowercase)
            .eq(b.chars().flat_map(char::to_lowercase))
    }
}

fn strip_prefix<'a>(text: &'a str, prefix: &str, case_sensitive: bool) -> Option<&'a str> {
    if case_sensitive {
        return text.strip_prefix(prefix);
    }
    let wanted = prefix.chars().count();
    let split = text
        .char_indices()
        .nth(wanted)
        .map_or(text.len(), |(index, _)| index);
    let (head, rest) = text.split_at(split);
    (head.chars().count() == wanted && text_eq(head, prefix, false)).then_some(rest)
}

fn strip_suffix<'a>(text: &'a str, suffix: &str, case_sensitive: bool) -> Option<&'a str> {
    if case_sensitive {
        return text.strip_suffix(suffix);
    }
    let wanted = suffix.chars().count();
    if wanted == 0 {
        return Some(text);
    }
    let split = text.char_indices().rev().nth(wanted - 1)?.0;
    let (rest, tail) = text.split_at(split);
    text_eq(tail, suffix, false).then_some(rest)
}

/// Splits `<@id> rest`, `<@!id> rest` or `@name rest` into mention and rest.
fn split_leading_mention(content: &str) -> Option<(&str, &str)> {
    let (mention, rest) = content.split_once(' ')?;
    if rest.is_empty() {
        return None;
    }
    (is_id_mention(mention) || is_name_mention(mention)).then_some((mention, rest))
}

fn is_id_mention(token: &str) -> bool {
    let Some(body) = token
        .strip_prefix("<@")
        .and_then(|value| value.strip_suffix('>'))
    else {
        return false;
    };
    let digits = body.strip_prefix('!').unwrap_or(body);
    (MENTION_MIN_DIGITS..=MENTION_MAX_DIGITS).contains(&digits.len())
        && digits.bytes().all(|b| b.is_ascii_digit())
}

fn is_name_mention(token: &str) -> bool {
    token.strip_prefix('@').is_some_and(|name| {
        !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_alphanumeric() || matches!(c, '_' | '.' | '-'))
    })
}
