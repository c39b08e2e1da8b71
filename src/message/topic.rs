//! Topic expression parsing and matching.
//!
//! A raw expression is `key/segment.segment?opt=v&opt=v`. `/` divides the
//! access key from the topic, `.` divides topic segments, `?` begins the
//! option list and `&` divides options. A `*` segment is a single-level
//! wildcard and a trailing `...` matches all children. Each concrete segment
//! is reduced to a 32-bit hash salted with the contract id, so identical
//! segment strings in different contracts produce distinct routing keys.

use std::hash::Hasher;
use std::time::Duration;

use bytes::Bytes;
use twox_hash::XxHash32;

/// Depth sentinel for a `...` subscription; the tail length is unbounded.
pub const DEPTH_ALL: u8 = 23;

const KEY_SEPARATOR: u8 = b'/';
const TOPIC_SEPARATOR: u8 = b'.';
const OPTIONS_SEPARATOR: u8 = b'?';
const OPTION_DELIMITER: u8 = b'&';
const CHILDREN_ALL: &[u8] = b"...";

/// Classification of a parsed expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TopicKind {
    #[default]
    Invalid,
    Static,
    Wildcard,
}

/// One level of a parsed topic: the salted segment hash plus the number of
/// `*` levels consumed immediately before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Part {
    pub query: u32,
    pub wildchars: u8,
}

/// The `last` option: either a message count or a look-back window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Last {
    Count(u64),
    Window(Duration),
}

/// A parsed topic expression.
#[derive(Debug, Clone, Default)]
pub struct Topic {
    /// Access key portion, before the first `/`.
    pub key: Bytes,
    /// Topic portion with options and any trailing `...` removed.
    pub topic: Bytes,
    /// Raw option bytes after `?`.
    pub topic_options: Bytes,
    pub parts: Vec<Part>,
    pub depth: u8,
    pub options: Vec<(String, String)>,
    pub kind: TopicKind,
}

/// Compute the salted routing hash of one topic segment.
pub fn hash_with_salt(segment: &[u8], contract: u32) -> u32 {
    let mut hasher = XxHash32::with_seed(contract);
    hasher.write(segment);
    hasher.finish() as u32
}

/// Split a raw expression into key, topic and option bytes. Segment hashing
/// is deferred to [`Topic::parse`] since it needs the contract salt.
pub fn parse_key(text: &[u8]) -> Topic {
    let mut topic = Topic::default();

    let Some(slash) = text.iter().position(|&b| b == KEY_SEPARATOR) else {
        return topic;
    };
    let (key, rest) = (&text[..slash], &text[slash + 1..]);
    if key.is_empty() || rest.is_empty() {
        return topic;
    }
    topic.key = Bytes::copy_from_slice(key);

    match rest.iter().position(|&b| b == OPTIONS_SEPARATOR) {
        Some(q) => {
            if q == 0 {
                return topic;
            }
            topic.topic = Bytes::copy_from_slice(&rest[..q]);
            topic.topic_options = Bytes::copy_from_slice(&rest[q + 1..]);
        }
        None => topic.topic = Bytes::copy_from_slice(rest),
    }
    topic
}

impl Topic {
    pub fn is_valid(&self) -> bool {
        self.kind != TopicKind::Invalid
    }

    /// Whether the subscription accepts an arbitrary tail (`...`).
    pub fn open_tail(&self) -> bool {
        self.depth >= DEPTH_ALL
    }

    /// Hash the topic segments with the contract salt. `wildcard` permits
    /// `*` and `...`; a publish path parses static and treats them literally.
    pub fn parse(&mut self, contract: u32, wildcard: bool) {
        if self.topic.is_empty() {
            self.kind = TopicKind::Invalid;
            return;
        }
        self.parse_options();
        if wildcard {
            self.parse_wildcard(contract);
        } else {
            self.parse_static(contract);
        }
    }

    fn parse_static(&mut self, contract: u32) {
        self.parts = segments(&self.topic)
            .map(|seg| Part {
                query: hash_with_salt(seg, contract),
                wildchars: 0,
            })
            .collect();
        self.depth = self.parts.len() as u8;
        self.kind = TopicKind::Static;
    }

    fn parse_wildcard(&mut self, contract: u32) {
        self.kind = TopicKind::Static;
        self.depth = 0;
        if self.topic.ends_with(CHILDREN_ALL) {
            let trimmed = self.topic.len() - CHILDREN_ALL.len();
            let trimmed = self.topic[..trimmed]
                .iter()
                .rposition(|&b| b != TOPIC_SEPARATOR)
                .map_or(0, |i| i + 1);
            self.topic = self.topic.slice(..trimmed);
            self.kind = TopicKind::Wildcard;
            self.depth = DEPTH_ALL;
        }

        let mut wildchars = 0u8;
        for seg in segments(&self.topic) {
            self.depth += 1;
            if seg == b"*" {
                self.kind = TopicKind::Wildcard;
                wildchars += 1;
                continue;
            }
            self.parts.push(Part {
                query: hash_with_salt(seg, contract),
                wildchars,
            });
            wildchars = 0;
        }
        if wildchars > 0 {
            if let Some(last) = self.parts.last_mut() {
                last.wildchars = wildchars;
            }
        }
    }

    fn parse_options(&mut self) {
        if self.topic_options.is_empty() {
            return;
        }
        for pair in self.topic_options.split(|&b| b == OPTION_DELIMITER) {
            let Some(eq) = pair.iter().position(|&b| b == b'=') else {
                continue;
            };
            let (k, v) = (&pair[..eq], &pair[eq + 1..]);
            if k.is_empty() || v.is_empty() {
                continue;
            }
            let (Ok(k), Ok(v)) = (std::str::from_utf8(k), std::str::from_utf8(v)) else {
                continue;
            };
            self.options.push((k.to_owned(), v.to_owned()));
        }
    }

    fn option(&self, name: &str) -> Option<&str> {
        self.options
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Time-to-live option: integer seconds or a duration string.
    pub fn ttl(&self) -> Option<Duration> {
        let value = self.option("ttl")?;
        if let Ok(secs) = value.parse::<u64>() {
            return Some(Duration::from_secs(secs));
        }
        humantime::parse_duration(value).ok()
    }

    /// History option: integer message count or a look-back window.
    pub fn last(&self) -> Option<Last> {
        let value = self.option("last")?;
        if let Ok(count) = value.parse::<u64>() {
            return Some(Last::Count(count));
        }
        humantime::parse_duration(value).ok().map(Last::Window)
    }

    /// Whether this subscription accepts the given static topic. Static
    /// subscriptions require hash-equal part sequences; wildcard ones agree
    /// part-by-part skipping the indicated levels, with `...` accepting any
    /// remaining tail.
    pub fn matches(&self, topic: &Topic) -> bool {
        let mut at = 0usize;
        for part in &self.parts {
            at += part.wildchars as usize;
            match topic.parts.get(at) {
                Some(other) if other.query == part.query => at += 1,
                _ => return false,
            }
        }
        self.open_tail() || at == topic.parts.len()
    }
}

fn segments(topic: &[u8]) -> impl Iterator<Item = &[u8]> {
    topic
        .split(|&b| b == TOPIC_SEPARATOR)
        .filter(|seg| !seg.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &[u8], contract: u32, wildcard: bool) -> Topic {
        let mut topic = parse_key(text);
        if !topic.topic.is_empty() {
            topic.parse(contract, wildcard);
        }
        topic
    }

    #[test]
    fn missing_key_or_topic_is_invalid() {
        assert!(!parse(b"nokey", 1, false).is_valid());
        assert!(!parse(b"key/", 1, false).is_valid());
        assert!(!parse(b"/topic", 1, false).is_valid());
        assert!(!parse(b"key/?ttl=3m", 1, false).is_valid());
    }

    #[test]
    fn static_topic_parses_parts_and_depth() {
        let topic = parse(b"AbYANcEEZDcdY/unit8.b.b1?ttl=3m", 7, false);
        assert_eq!(topic.kind, TopicKind::Static);
        assert_eq!(topic.depth, 3);
        assert_eq!(topic.parts.len(), 3);
        assert_eq!(&topic.topic[..], b"unit8.b.b1");
        assert_eq!(&topic.key[..], b"AbYANcEEZDcdY");
        assert_eq!(topic.ttl(), Some(Duration::from_secs(180)));
    }

    #[test]
    fn salt_separates_contracts() {
        let a = parse(b"k/unit8.b", 1, false);
        let b = parse(b"k/unit8.b", 2, false);
        assert_ne!(a.parts[0].query, b.parts[0].query);
    }

    #[test]
    fn parser_is_idempotent() {
        let once = parse(b"key/a.b.c?ttl=90", 9, true);
        let again = parse(&[&once.key[..], b"/", &once.topic[..]].concat(), 9, true);
        assert_eq!(once.parts, again.parts);
        assert_eq!(once.depth, again.depth);
    }

    #[test]
    fn children_all_sets_sentinel_depth() {
        let topic = parse(b"AYAAMACRZDCHK/...", 3, true);
        assert_eq!(topic.kind, TopicKind::Wildcard);
        assert!(topic.open_tail());
        assert!(topic.parts.is_empty());

        let scoped = parse(b"AYAAMACRZDCHK/a.b...", 3, true);
        assert_eq!(scoped.kind, TopicKind::Wildcard);
        assert_eq!(scoped.depth, DEPTH_ALL + 2);
        assert_eq!(scoped.parts.len(), 2);
    }

    #[test]
    fn single_level_wildcard_marks_following_part() {
        let topic = parse(b"k/a.*.b", 5, true);
        assert_eq!(topic.kind, TopicKind::Wildcard);
        assert_eq!(topic.parts.len(), 2);
        assert_eq!(topic.parts[0].wildchars, 0);
        assert_eq!(topic.parts[1].wildchars, 1);

        let double = parse(b"k/a.*.*.b", 5, true);
        assert_eq!(double.parts[1].wildchars, 2);
    }

    #[test]
    fn match_law() {
        let contract = 11;
        let published = parse(b"k/unit8.b.b1", contract, false);

        let exact = parse(b"k/unit8.b.b1", contract, true);
        assert!(exact.matches(&published));

        let all = parse(b"k/...", contract, true);
        assert!(all.matches(&published));

        let scoped = parse(b"k/unit8...", contract, true);
        assert!(scoped.matches(&published));

        let skipping = parse(b"k/unit8.*.b1", contract, true);
        assert!(skipping.matches(&published));

        let other = parse(b"k/unit9.b.b1", contract, true);
        assert!(!other.matches(&published));

        let shorter = parse(b"k/unit8.b", contract, true);
        assert!(!shorter.matches(&published));

        let deeper = parse(b"k/unit8.b.b1.x", contract, true);
        assert!(!deeper.matches(&published));
    }

    #[test]
    fn wildcard_prefix_requires_matching_tail() {
        let contract = 2;
        let sub = parse(b"k/a.b...", contract, true);
        assert!(sub.matches(&parse(b"k/a.b.c.d", contract, false)));
        assert!(sub.matches(&parse(b"k/a.b", contract, false)));
        assert!(!sub.matches(&parse(b"k/a.c.d", contract, false)));
    }

    #[test]
    fn malformed_options_are_skipped() {
        let topic = parse(b"k/a.b?bogus&ttl=3m&=x&last=30", 1, false);
        assert_eq!(topic.options.len(), 2);
        assert_eq!(topic.ttl(), Some(Duration::from_secs(180)));
        assert_eq!(topic.last(), Some(Last::Count(30)));

        let window = parse(b"k/a.b?last=2h", 1, false);
        assert_eq!(
            window.last(),
            Some(Last::Window(Duration::from_secs(7200)))
        );
    }
}
