//! Cache key construction.
//!
//! Keys are colon-delimited: a namespace prefix, positional components in call
//! order, then named components sorted by name. The prefix scheme doubles as
//! the invalidation schema, so prefixes here must stay stable.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use sha2::{Digest, Sha256};

/// Keys longer than this are replaced by `<prefix>:hash:<sha256>`.
pub const MAX_KEY_LENGTH: usize = 250;

const HASH_SUFFIX_LEN: usize = ":hash:".len() + 64;

pub const USER_PREFIX: &str = "user";
pub const PROJECT_PREFIX: &str = "project";
pub const ANNOTATION_PREFIX: &str = "annotation";
pub const LABEL_PREFIX: &str = "label";
pub const QUERY_PREFIX: &str = "query";
pub const BATCH_PREFIX: &str = "batch";
pub const STATS_KEY: &str = "cache:stats";
pub const HEALTH_PROBE_PREFIX: &str = "health_check";

/// Entity types with a reserved key prefix and a default TTL band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    User,
    Project,
    Annotation,
    Label,
    Query,
}

impl EntityKind {
    pub const ALL: [EntityKind; 5] = [
        EntityKind::User,
        EntityKind::Project,
        EntityKind::Annotation,
        EntityKind::Label,
        EntityKind::Query,
    ];

    pub fn prefix(self) -> &'static str {
        match self {
            EntityKind::User => USER_PREFIX,
            EntityKind::Project => PROJECT_PREFIX,
            EntityKind::Annotation => ANNOTATION_PREFIX,
            EntityKind::Label => LABEL_PREFIX,
            EntityKind::Query => QUERY_PREFIX,
        }
    }

    /// Default TTL, shorter for more volatile entities.
    pub fn default_ttl(self) -> Duration {
        match self {
            EntityKind::Query => Duration::from_secs(10 * 60),
            EntityKind::Annotation => Duration::from_secs(15 * 60),
            EntityKind::Project => Duration::from_secs(30 * 60),
            EntityKind::User => Duration::from_secs(60 * 60),
            EntityKind::Label => Duration::from_secs(2 * 60 * 60),
        }
    }

    /// Parse a reserved prefix back into its entity kind.
    pub fn from_prefix(prefix: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.prefix() == prefix)
    }

    /// Key of a single entity, e.g. `user:123`.
    pub fn key(self, id: impl fmt::Display) -> String {
        CacheKey::builder(self.prefix()).arg(id).build()
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// Deterministic key generation.
pub struct CacheKey;

impl CacheKey {
    /// Build a key from a prefix, positional components and named components.
    ///
    /// Named components are sorted by name, so their order at the call site
    /// does not matter.
    pub fn generate(
        prefix: &str,
        positional: &[&dyn fmt::Display],
        named: &[(&str, &dyn fmt::Display)],
    ) -> String {
        let mut builder = Self::builder(prefix);
        for arg in positional {
            builder = builder.arg(arg);
        }
        for (name, value) in named {
            builder = builder.param(name, value);
        }
        builder.build()
    }

    pub fn builder(prefix: &str) -> KeyBuilder {
        KeyBuilder {
            prefix: prefix.to_string(),
            positional: Vec::new(),
            named: BTreeMap::new(),
        }
    }

    /// Glob pattern over a namespace, e.g. `user:*`.
    pub fn pattern(prefix: &str, suffix: &str) -> String {
        format!("{prefix}:{suffix}")
    }

    /// Glob pattern matching every key under a namespace.
    pub fn prefix_pattern(prefix: &str) -> String {
        Self::pattern(prefix, "*")
    }

    /// Join components, replacing over-long keys with a hashed form.
    ///
    /// The hashed form keeps as much of the prefix as fits in
    /// [`MAX_KEY_LENGTH`]; the digest always covers the full key.
    pub fn from_components(prefix: &str, components: &[String]) -> String {
        let mut key = String::with_capacity(prefix.len() + components.len() * 8);
        key.push_str(prefix);
        for component in components {
            key.push(':');
            key.push_str(component);
        }

        if key.len() > MAX_KEY_LENGTH {
            let digest = Sha256::digest(key.as_bytes());
            let prefix = truncate_at_char_boundary(prefix, MAX_KEY_LENGTH - HASH_SUFFIX_LEN);
            return format!("{prefix}:hash:{}", hex::encode(digest.as_slice()));
        }
        key
    }
}

fn truncate_at_char_boundary(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Incremental key construction.
#[derive(Debug, Clone)]
pub struct KeyBuilder {
    prefix: String,
    positional: Vec<String>,
    named: BTreeMap<String, String>,
}

impl KeyBuilder {
    pub fn arg(mut self, value: impl fmt::Display) -> Self {
        self.positional.push(value.to_string());
        self
    }

    pub fn param(mut self, name: &str, value: impl fmt::Display) -> Self {
        self.named.insert(name.to_string(), value.to_string());
        self
    }

    pub fn params(mut self, params: &QueryParams) -> Self {
        for (name, value) in &params.0 {
            self.named.insert(name.clone(), value.clone());
        }
        self
    }

    pub fn build(self) -> String {
        let mut components = self.positional;
        components.extend(
            self.named
                .into_iter()
                .map(|(name, value)| format!("{name}:{value}")),
        );
        CacheKey::from_components(&self.prefix, &components)
    }
}

/// Named parameters of a cached query, kept sorted by name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryParams(BTreeMap<String, String>);

impl QueryParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: impl fmt::Display) -> Self {
        self.0.insert(name.to_string(), value.to_string());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Arguments of a memoized function, flattened into key components.
pub trait KeyArgs {
    fn key_components(&self) -> Vec<String>;
}

macro_rules! display_key_args {
    ($($ty:ty),* $(,)?) => {
        $(impl KeyArgs for $ty {
            fn key_components(&self) -> Vec<String> {
                vec![self.to_string()]
            }
        })*
    };
}

display_key_args!(
    String, &str, bool, char, i8, i16, i32, i64, isize, u8, u16, u32, u64, usize,
    uuid::Uuid,
);

impl KeyArgs for () {
    fn key_components(&self) -> Vec<String> {
        Vec::new()
    }
}

impl KeyArgs for QueryParams {
    fn key_components(&self) -> Vec<String> {
        self.0
            .iter()
            .map(|(name, value)| format!("{name}:{value}"))
            .collect()
    }
}

impl<A: KeyArgs, B: KeyArgs> KeyArgs for (A, B) {
    fn key_components(&self) -> Vec<String> {
        let mut parts = self.0.key_components();
        parts.extend(self.1.key_components());
        parts
    }
}

impl<A: KeyArgs, B: KeyArgs, C: KeyArgs> KeyArgs for (A, B, C) {
    fn key_components(&self) -> Vec<String> {
        let mut parts = self.0.key_components();
        parts.extend(self.1.key_components());
        parts.extend(self.2.key_components());
        parts
    }
}
