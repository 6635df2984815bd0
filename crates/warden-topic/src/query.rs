//! `key=value&key=value` command strings and their escaping rules.

use std::collections::BTreeMap;

use crate::TopicError;

/// Field every callback must echo so the host can authenticate it.
pub const FIELD_COMMS_KEY: &str = "serviceCommsKey";
/// Field selecting the operation.
pub const FIELD_COMMAND: &str = "command";

/// Reserved command verbs, host to process.
pub mod host_verbs {
    pub const HARD_REBOOT: &str = "hard_reboot";
    pub const GRACEFUL_SHUTDOWN: &str = "graceful_shutdown";
    pub const WORLD_ANNOUNCE: &str = "announce";
    pub const LIST_CUSTOM_COMMANDS: &str = "list_custom_commands";
    pub const API_COMPAT_ACK: &str = "api_compat";
    pub const PLAYER_COUNT: &str = "player_count";
}

/// Reserved callback verbs, process to host.
pub mod callback_verbs {
    pub const KILL_ME: &str = "kill_me";
    pub const IRC_BROADCAST: &str = "irc_broadcast";
    pub const ADMIN_RELAY: &str = "admin_relay";
    pub const WORLD_REBOOTED: &str = "world_rebooted";
    pub const API_VERSION: &str = "api_version";
}

/// Escape a value for embedding in a command string. The characters
/// `%`, `&`, `=`, `'`, `"` are percent-encoded; everything else passes
/// through untouched.
pub fn escape_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '%' => out.push_str("%25"),
            '&' => out.push_str("%26"),
            '=' => out.push_str("%3d"),
            '\'' => out.push_str("%27"),
            '"' => out.push_str("%22"),
            other => out.push(other),
        }
    }
    out
}

/// Reverse of [`escape_value`]. Unknown or dangling escapes are a
/// protocol error.
pub fn unescape_value(value: &str) -> Result<String, TopicError> {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = bytes
                .get(i + 1..i + 3)
                .ok_or(TopicError::BadEscape)
                .and_then(|h| {
                    std::str::from_utf8(h)
                        .ok()
                        .and_then(|h| u8::from_str_radix(h, 16).ok())
                        .ok_or(TopicError::BadEscape)
                })?;
            out.push(hex);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).map_err(|_| TopicError::InvalidUtf8)
}

/// Ordered builder for an outbound command string.
#[derive(Debug, Clone)]
pub struct TopicQuery {
    pairs: Vec<(String, String)>,
}

impl TopicQuery {
    pub fn new(verb: &str) -> Self {
        Self {
            pairs: vec![(FIELD_COMMAND.to_string(), verb.to_string())],
        }
    }

    pub fn push(mut self, key: &str, value: &str) -> Self {
        self.pairs.push((key.to_string(), value.to_string()));
        self
    }

    pub fn comms_key(self, key: &str) -> Self {
        self.push(FIELD_COMMS_KEY, key)
    }

    /// Render to the wire string. Keys are restricted identifiers and
    /// pass through as-is; values are escaped.
    pub fn encode(&self) -> String {
        self.pairs
            .iter()
            .map(|(k, v)| format!("{k}={}", escape_value(v)))
            .collect::<Vec<_>>()
            .join("&")
    }

    /// Attach the comms key to an already-encoded command string,
    /// unless the caller supplied one themselves.
    pub fn append_comms_key(command: &str, key: &str) -> String {
        if command
            .split('&')
            .any(|part| part.split_once('=').map(|(k, _)| k) == Some(FIELD_COMMS_KEY))
        {
            return command.to_string();
        }
        format!("{command}&{FIELD_COMMS_KEY}={}", escape_value(key))
    }
}

/// Parse a received command string into its fields, unescaping values.
/// A field without `=` maps to the empty string.
pub fn parse_query(raw: &str) -> Result<BTreeMap<String, String>, TopicError> {
    let mut out = BTreeMap::new();
    for part in raw.split('&') {
        if part.is_empty() {
            continue;
        }
        match part.split_once('=') {
            Some((k, v)) => {
                out.insert(k.to_string(), unescape_value(v)?);
            }
            None => {
                out.insert(part.to_string(), String::new());
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_round_trip() {
        let raw = "say \"hi\" & don't panic, 100%=ok";
        let escaped = escape_value(raw);
        assert!(!escaped.contains('"'));
        assert!(!escaped.contains('\''));
        assert!(!escaped.contains('&'));
        assert!(escaped.matches('=').count() == 0);
        assert_eq!(unescape_value(&escaped).unwrap(), raw);
    }

    #[test]
    fn query_encodes_in_order() {
        let q = TopicQuery::new(host_verbs::WORLD_ANNOUNCE)
            .push("message", "a&b")
            .comms_key("k");
        assert_eq!(q.encode(), "command=announce&message=a%26b&serviceCommsKey=k");
    }

    #[test]
    fn parse_query_unescapes_values() {
        let fields = parse_query("command=admin_relay&message=a%26b%3dc&flag").unwrap();
        assert_eq!(fields.get("command").unwrap(), "admin_relay");
        assert_eq!(fields.get("message").unwrap(), "a&b=c");
        assert_eq!(fields.get("flag").unwrap(), "");
    }

    #[test]
    fn dangling_escape_is_error() {
        assert!(matches!(
            unescape_value("abc%2").unwrap_err(),
            TopicError::BadEscape
        ));
        assert!(matches!(
            unescape_value("abc%zz").unwrap_err(),
            TopicError::BadEscape
        ));
    }
}
