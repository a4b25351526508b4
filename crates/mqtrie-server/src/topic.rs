//! Topic strings, parsing and SSID projection.
//!
//! Topic grammar:
//!
//! ```text
//! topic    := (segment_list | "#") ("?" query)?
//! segment_list := segment ("/" segment)*
//! segment  := IDENT | "+" | "#"
//! IDENT    := [-_0-9a-zA-Z]+
//! query    := kv ("&" kv)*
//! kv       := IDENT ("=" IDENT)?
//! ```
//!
//! The multi-level wildcard `#` must be the final segment. The query string
//! carries subscription options; a key without a value defaults to the empty
//! string, and the last occurrence of a duplicate key wins.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::{BrokerError, Result};
use crate::hash;

/// The single-level wildcard segment.
pub const SINGLE_WILDCARD: &str = "+";
/// The multi-level wildcard segment.
pub const MULTI_WILDCARD: &str = "#";

/// Sentinel SSID word for the single-level wildcard.
pub static SINGLE_WILDCARD_HASH: LazyLock<u64> =
    LazyLock::new(|| hash::sum64(SINGLE_WILDCARD.as_bytes()));
/// Sentinel SSID word for the multi-level wildcard.
pub static MULTI_WILDCARD_HASH: LazyLock<u64> =
    LazyLock::new(|| hash::sum64(MULTI_WILDCARD.as_bytes()));

static IDENT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[\-_0-9a-zA-Z]+$").unwrap());

/// Subscription ID: one stable hash word per topic segment.
pub type Ssid = Vec<u64>;

/// One segment of a parsed topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Part {
    Name(String),
    SingleWildcard,
    MultiWildcard,
}

/// Classification of a parsed topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicKind {
    /// No wildcard segments; the only kind allowed for publish.
    Static,
    /// Contains `+` or `#`; only allowed for subscribe.
    Wildcard,
}

/// A parsed topic: ordered segments plus subscription options.
#[derive(Debug, Clone)]
pub struct Topic {
    kind: TopicKind,
    topic_name: String,
    parts: Vec<Part>,
    options: HashMap<String, String>,
}

impl Topic {
    pub fn kind(&self) -> TopicKind {
        self.kind
    }

    pub fn topic_name(&self) -> &str {
        &self.topic_name
    }

    pub fn parts(&self) -> &[Part] {
        &self.parts
    }

    pub fn options(&self) -> &HashMap<String, String> {
        &self.options
    }

    /// Project the topic onto its SSID. Deterministic and pure: wildcards map
    /// to their sentinel words, every other segment to its stable hash.
    pub fn to_ssid(&self) -> Ssid {
        self.parts
            .iter()
            .map(|part| match part {
                Part::Name(name) => hash::sum64(name.as_bytes()),
                Part::SingleWildcard => *SINGLE_WILDCARD_HASH,
                Part::MultiWildcard => *MULTI_WILDCARD_HASH,
            })
            .collect()
    }
}

/// Parser for a topic string.
pub struct Parser<'a> {
    src: &'a str,
    parts: Vec<Part>,
    options: HashMap<String, String>,
}

impl<'a> Parser<'a> {
    pub fn new(src: &'a str) -> Self {
        Self {
            src,
            parts: Vec::new(),
            options: HashMap::new(),
        }
    }

    /// Parse the topic string into a `Topic`.
    pub fn parse(mut self) -> Result<Topic> {
        if self.src.is_empty() {
            return Err(BrokerError::InvalidTopic(
                "unexpected empty topic string".into(),
            ));
        }

        let texts: Vec<&str> = self.src.split('?').collect();
        if texts.len() > 2 {
            return Err(BrokerError::InvalidTopic(
                "too many '?' in topic string".into(),
            ));
        }

        self.scan_parts(texts[0])?;
        if let Some(opts) = texts.get(1) {
            self.scan_options(opts)?;
        }

        let kind = if self
            .parts
            .iter()
            .any(|p| !matches!(p, Part::Name(_)))
        {
            TopicKind::Wildcard
        } else {
            TopicKind::Static
        };

        Ok(Topic {
            kind,
            topic_name: texts[0].to_string(),
            parts: self.parts,
            options: self.options,
        })
    }

    fn scan_parts(&mut self, parts_txt: &str) -> Result<()> {
        let segments: Vec<&str> = parts_txt.split('/').collect();
        let last = segments.len() - 1;

        for (i, segment) in segments.iter().enumerate() {
            match *segment {
                SINGLE_WILDCARD => self.parts.push(Part::SingleWildcard),
                MULTI_WILDCARD => {
                    if i != last {
                        return Err(BrokerError::InvalidTopic(
                            "'#' must be the final segment".into(),
                        ));
                    }
                    self.parts.push(Part::MultiWildcard);
                }
                _ => {
                    if !IDENT.is_match(segment) {
                        return Err(BrokerError::InvalidTopic(format!(
                            "invalid identifier '{}'",
                            segment
                        )));
                    }
                    self.parts.push(Part::Name(segment.to_string()));
                }
            }
        }

        Ok(())
    }

    fn scan_options(&mut self, opts_txt: &str) -> Result<()> {
        for opt in opts_txt.split('&') {
            let kv: Vec<&str> = opt.split('=').collect();
            if kv.len() > 2 {
                return Err(BrokerError::InvalidTopic(format!(
                    "too many '=' in '{}'",
                    opt
                )));
            }

            for v in &kv {
                if !IDENT.is_match(v) {
                    return Err(BrokerError::InvalidTopic(format!(
                        "invalid character(s) in '{}'",
                        v
                    )));
                }
            }

            let key = kv[0].to_string();
            let value = kv.get(1).copied().unwrap_or("").to_string();
            self.options.insert(key, value);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(src: &str) -> Result<Topic> {
        Parser::new(src).parse()
    }

    #[test]
    fn test_parse_static() {
        let topic = parse("hello/mqtt/zqtt").unwrap();
        assert_eq!(topic.kind(), TopicKind::Static);
        assert_eq!(topic.topic_name(), "hello/mqtt/zqtt");
        assert_eq!(
            topic.parts(),
            &[
                Part::Name("hello".into()),
                Part::Name("mqtt".into()),
                Part::Name("zqtt".into()),
            ]
        );
        assert!(topic.options().is_empty());
    }

    #[test]
    fn test_parse_wildcards() {
        let topic = parse("hello/+/zqtt").unwrap();
        assert_eq!(topic.kind(), TopicKind::Wildcard);
        assert_eq!(topic.parts()[1], Part::SingleWildcard);

        let topic = parse("hello/mqtt/#").unwrap();
        assert_eq!(topic.kind(), TopicKind::Wildcard);
        assert_eq!(topic.parts()[2], Part::MultiWildcard);

        let topic = parse("#").unwrap();
        assert_eq!(topic.kind(), TopicKind::Wildcard);
        assert_eq!(topic.parts(), &[Part::MultiWildcard]);

        let topic = parse("+").unwrap();
        assert_eq!(topic.kind(), TopicKind::Wildcard);
    }

    #[test]
    fn test_parse_options() {
        let topic = parse("a/b?ttl=30&sync").unwrap();
        assert_eq!(topic.topic_name(), "a/b");
        assert_eq!(topic.options().get("ttl").map(String::as_str), Some("30"));
        assert_eq!(topic.options().get("sync").map(String::as_str), Some(""));
    }

    #[test]
    fn test_parse_duplicate_option_last_wins() {
        let topic = parse("a?k=1&k=2").unwrap();
        assert_eq!(topic.options().get("k").map(String::as_str), Some("2"));
    }

    #[test]
    fn test_parse_rejects_invalid() {
        assert!(parse("").is_err());
        assert!(parse("a/b?x=1?y=2").is_err());
        assert!(parse("a?k=1=2").is_err());
        assert!(parse("a?k==").is_err());
        assert!(parse("hello/#/world").is_err());
        assert!(parse("#/a").is_err());
        assert!(parse("a//b").is_err());
        assert!(parse("a/b/").is_err());
        assert!(parse("/a").is_err());
        assert!(parse("a.b/c").is_err());
        assert!(parse("a b").is_err());
        assert!(parse("a?k!=v").is_err());
        assert!(parse("?k=v").is_err());
    }

    #[test]
    fn test_identifier_charset() {
        assert!(parse("a-b_c/D9").is_ok());
        assert!(parse("-_-").is_ok());
    }

    #[test]
    fn test_to_ssid() {
        let topic = parse("hello/+/zqtt/#").unwrap();
        let ssid = topic.to_ssid();
        assert_eq!(ssid.len(), topic.parts().len());
        assert_eq!(ssid[0], hash::sum64(b"hello"));
        assert_eq!(ssid[1], *SINGLE_WILDCARD_HASH);
        assert_eq!(ssid[2], hash::sum64(b"zqtt"));
        assert_eq!(ssid[3], *MULTI_WILDCARD_HASH);
    }

    #[test]
    fn test_ssid_deterministic() {
        let a = parse("x/y/z").unwrap().to_ssid();
        let b = parse("x/y/z").unwrap().to_ssid();
        assert_eq!(a, b);
    }

    #[test]
    fn test_parts_roundtrip() {
        // Re-serializing parts with '/' reproduces the path portion.
        for src in ["hello/mqtt/zqtt", "a/+/b", "hello/#", "#", "+"] {
            let topic = parse(src).unwrap();
            let joined: Vec<&str> = topic
                .parts()
                .iter()
                .map(|p| match p {
                    Part::Name(n) => n.as_str(),
                    Part::SingleWildcard => SINGLE_WILDCARD,
                    Part::MultiWildcard => MULTI_WILDCARD,
                })
                .collect();
            assert_eq!(joined.join("/"), src);
        }
    }
}
