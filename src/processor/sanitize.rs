//! Deep redaction of sensitive values in event payloads.
//!
//! The walker replaces the entire subtree under any key that looks sensitive,
//! not just scalar leaves, and optionally scrubs well-known secret shapes out
//! of free-text string leaves (prompts, tool output). Depth is capped so a
//! pathological payload always terminates.

use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde_json::{Map, Value};

pub const REDACTED: &str = "[REDACTED]";
pub const DEPTH_EXCEEDED: &str = "[MAX_DEPTH]";
pub const DEFAULT_MAX_DEPTH: usize = 32;

/// Key fragments matched case-insensitively anywhere in a key.
pub const SENSITIVE_KEY_FRAGMENTS: &[&str] = &[
    "password",
    "secret",
    "token",
    "api_key",
    "apikey",
    "auth",
    "credential",
    "private_key",
];

static OPENAI_KEY_REGEX: LazyLock<Regex> = LazyLock::new(|| compile_regex(r"sk-[A-Za-z0-9_\-]{20,}"));

static AWS_ACCESS_KEY_ID_REGEX: LazyLock<Regex> =
    LazyLock::new(|| compile_regex(r"\bAKIA[0-9A-Z]{16}\b"));

static BEARER_TOKEN_REGEX: LazyLock<Regex> =
    LazyLock::new(|| compile_regex(r"(?i)\bBearer\s+[A-Za-z0-9.\-_]{16,}"));

static SECRET_ASSIGNMENT_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    compile_regex(r#"(?i)\b(api[\-_]?key|token|secret|password)\b(\s*[:=]\s*)(["']?)[^\s"']{8,}"#)
});

type KeyPredicate = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Generic tree walker parameterized by a sensitive-key predicate and a depth
/// cap.
#[derive(Clone)]
pub struct Sanitizer {
    is_sensitive: KeyPredicate,
    max_depth: usize,
    redact_inline_secrets: bool,
}

impl std::fmt::Debug for Sanitizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sanitizer")
            .field("max_depth", &self.max_depth)
            .field("redact_inline_secrets", &self.redact_inline_secrets)
            .finish_non_exhaustive()
    }
}

impl Default for Sanitizer {
    fn default() -> Self {
        Self::new(is_sensitive_key)
    }
}

impl Sanitizer {
    pub fn new(predicate: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        Self {
            is_sensitive: Arc::new(predicate),
            max_depth: DEFAULT_MAX_DEPTH,
            redact_inline_secrets: true,
        }
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn with_inline_secret_redaction(mut self, enabled: bool) -> Self {
        self.redact_inline_secrets = enabled;
        self
    }

    pub fn sanitize(&self, value: &Value) -> Value {
        self.walk(value, 0)
    }

    fn walk(&self, value: &Value, depth: usize) -> Value {
        if depth > self.max_depth {
            return Value::String(DEPTH_EXCEEDED.to_string());
        }
        match value {
            Value::Object(map) => {
                let mut out = Map::with_capacity(map.len());
                for (key, child) in map {
                    let sanitized = if (self.is_sensitive)(key) {
                        Value::String(REDACTED.to_string())
                    } else {
                        self.walk(child, depth + 1)
                    };
                    out.insert(key.clone(), sanitized);
                }
                Value::Object(out)
            }
            Value::Array(items) => {
                Value::Array(items.iter().map(|item| self.walk(item, depth + 1)).collect())
            }
            Value::String(s) if self.redact_inline_secrets => Value::String(redact_secrets(s)),
            other => other.clone(),
        }
    }
}

/// Sanitize with the default key set and depth cap.
pub fn sanitize(value: &Value) -> Value {
    static DEFAULT: LazyLock<Sanitizer> = LazyLock::new(Sanitizer::default);
    DEFAULT.sanitize(value)
}

pub fn is_sensitive_key(key: &str) -> bool {
    let lowered = key.to_ascii_lowercase();
    SENSITIVE_KEY_FRAGMENTS
        .iter()
        .any(|fragment| lowered.contains(fragment))
}

/// Scrub well-known secret shapes out of free text.
pub fn redact_secrets(input: &str) -> String {
    let redacted = OPENAI_KEY_REGEX.replace_all(input, REDACTED);
    let redacted = AWS_ACCESS_KEY_ID_REGEX.replace_all(&redacted, REDACTED);
    let redacted = BEARER_TOKEN_REGEX.replace_all(&redacted, "Bearer [REDACTED]");
    let redacted = SECRET_ASSIGNMENT_REGEX.replace_all(&redacted, "${1}${2}${3}[REDACTED]");

    redacted.into_owned()
}

fn compile_regex(pattern: &str) -> Regex {
    match Regex::new(pattern) {
        Ok(regex) => regex,
        // Covered by the `patterns_compile` test.
        Err(err) => panic!("invalid regex pattern `{pattern}`: {err}"),
    }
}
