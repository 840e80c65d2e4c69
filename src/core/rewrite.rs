//! URL rewriting: ordered regex / prefix / strip-prefix transformations.

use std::{collections::HashMap, sync::RwLock};

use regex::Regex;

use crate::core::model::{RewriteKind, RewriteRule};

/// Lazily compiled regex cache with a read-through-write-back discipline.
///
/// Patterns that fail to compile are cached as `None` so a bad rule is
/// reported once and skipped afterwards, never re-compiled per request.
#[derive(Default)]
pub struct RegexCache {
    cache: RwLock<HashMap<String, Option<Regex>>>,
}

impl RegexCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, pattern: &str) -> Option<Regex> {
        if let Some(cached) = self
            .cache
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(pattern)
        {
            return cached.clone();
        }

        let compiled = match Regex::new(pattern) {
            Ok(re) => Some(re),
            Err(e) => {
                tracing::warn!(pattern, error = %e, "regex failed to compile, rule skipped");
                None
            }
        };
        self.cache
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(pattern.to_string(), compiled.clone());
        compiled
    }
}

/// Applies a route's rewrite rules to the request path, in order.
#[derive(Default)]
pub struct UrlRewriter {
    cache: RegexCache,
}

impl UrlRewriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&self, path: &str, rules: &[RewriteRule]) -> String {
        let mut path = path.to_string();
        for rule in rules {
            path = self.apply_rule(&path, rule);
        }
        path
    }

    fn apply_rule(&self, path: &str, rule: &RewriteRule) -> String {
        match rule.kind {
            RewriteKind::Regex => match self.cache.get(&rule.pattern) {
                Some(re) => re.replace_all(path, rule.replacement.as_str()).into_owned(),
                None => path.to_string(),
            },
            RewriteKind::Prefix => match path.strip_prefix(rule.pattern.as_str()) {
                Some(rest) => format!("{}{rest}", rule.replacement),
                None => path.to_string(),
            },
            RewriteKind::StripPrefix => strip_prefix(path, &rule.pattern),
        }
    }
}

/// Remove a leading prefix, always yielding a path that starts with `/`.
pub fn strip_prefix(path: &str, prefix: &str) -> String {
    match path.strip_prefix(prefix) {
        Some(rest) if rest.is_empty() => "/".to_string(),
        Some(rest) if rest.starts_with('/') => rest.to_string(),
        Some(rest) => format!("/{rest}"),
        None => path.to_string(),
    }
}
