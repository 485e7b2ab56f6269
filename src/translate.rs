//! Log line translation.
//!
//! A [`RuleTable`] is an immutable, compiled snapshot of the rule file. The
//! [`Translator`] publishes snapshots through an atomic pointer swap, so relay
//! tasks can translate concurrently while a reload replaces the table: each
//! call sees either the old table or the new one, never a mix.
//!
//! Rules are tried in file order and the first match wins. In a template,
//! `$N` is replaced by capture group `N` (`$0` is the whole match). A group
//! that exists but did not participate expands to nothing; an index beyond
//! the pattern's groups is left in the output literally.

use std::sync::Arc;

use anyhow::Result;
use arc_swap::ArcSwap;
use regex::{Captures, Regex};

use crate::rules::{RawRule, RuleFile};

/// One compiled pattern/template pair.
#[derive(Debug, Clone)]
pub struct Rule {
    pattern: Regex,
    template: String,
}

impl Rule {
    pub fn compile(raw: &RawRule) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(&raw.pattern)?,
            template: raw.template.clone(),
        })
    }

    fn apply(&self, line: &str) -> Option<String> {
        let caps = self.pattern.captures(line)?;
        Some(expand_template(&self.template, &caps))
    }
}

/// An ordered, immutable set of compiled rules.
#[derive(Debug, Clone, Default)]
pub struct RuleTable {
    rules: Vec<Rule>,
}

impl RuleTable {
    /// Compiles rules in order, skipping any whose pattern does not compile.
    pub fn compile(raw: &[RawRule]) -> Self {
        let rules = raw
            .iter()
            .filter_map(|rule| match Rule::compile(rule) {
                Ok(compiled) => Some(compiled),
                Err(err) => {
                    tracing::warn!(pattern = %rule.pattern, error = %err, "skipping malformed translation rule");
                    None
                }
            })
            .collect();
        Self { rules }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Rewrites `line` with the first matching rule, or returns it unchanged.
    pub fn translate(&self, line: &str) -> String {
        self.rules
            .iter()
            .find_map(|rule| rule.apply(line))
            .unwrap_or_else(|| line.to_string())
    }
}

/// Shared, hot-swappable translation entry point.
#[derive(Debug)]
pub struct Translator {
    table: ArcSwap<RuleTable>,
}

impl Translator {
    pub fn new(table: RuleTable) -> Self {
        Self {
            table: ArcSwap::from_pointee(table),
        }
    }

    pub fn from_file(file: &RuleFile) -> Result<Self> {
        Ok(Self::new(RuleTable::compile(&file.load()?)))
    }

    pub fn translate(&self, line: &str) -> String {
        self.table.load().translate(line)
    }

    /// The table currently in effect.
    pub fn snapshot(&self) -> Arc<RuleTable> {
        self.table.load_full()
    }

    /// Publishes a new table in one step.
    pub fn replace(&self, table: RuleTable) {
        self.table.store(Arc::new(table));
    }

    /// Recompiles the rule file and swaps it in.
    ///
    /// On a read error the current table stays in effect.
    pub fn reload(&self, file: &RuleFile) -> Result<usize> {
        let table = RuleTable::compile(&file.load()?);
        let count = table.len();
        self.replace(table);
        tracing::debug!(rules = count, path = %file.path().display(), "translation rules reloaded");
        Ok(count)
    }
}

fn expand_template(template: &str, caps: &Captures<'_>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];
        let digits = after.bytes().take_while(|b| b.is_ascii_digit()).count();
        if digits == 0 {
            out.push('$');
            rest = after;
            continue;
        }
        match after[..digits].parse::<usize>() {
            Ok(index) if index < caps.len() => {
                out.push_str(caps.get(index).map_or("", |m| m.as_str()));
            }
            _ => out.push_str(&rest[pos..pos + 1 + digits]),
        }
        rest = &after[digits..];
    }
    out.push_str(rest);
    out
}
