//! Per-package access rules keyed by name masks.
//!
//! Masks use glob syntax: `*` matches within one path segment, so
//! `@corp/*` covers every package of the `@corp` scope, and `**` matches
//! every name. The first rule whose mask matches a package wins.

use crate::error::Result;
use glob::{MatchOptions, Pattern};

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Who may perform an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    All,
    Authenticated,
    Nobody,
}

impl Access {
    pub fn allows(self, authenticated: bool) -> bool {
        match self {
            Access::All => true,
            Access::Authenticated => authenticated,
            Access::Nobody => false,
        }
    }
}

/// Access rule for every package whose name matches `pattern`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageAccess {
    pub pattern: String,
    pub access: Access,
    pub publish: Access,
    /// Uplink consulted for names this registry does not hold.
    pub proxy: Option<String>,
}

impl PackageAccess {
    /// Anyone may read and publish; nothing is fetched from upstream.
    pub fn open(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            access: Access::All,
            publish: Access::All,
            proxy: None,
        }
    }

    pub fn with_proxy(mut self, uplink: impl Into<String>) -> Self {
        self.proxy = Some(uplink.into());
        self
    }
}

/// Compiled, ordered rule list.
#[derive(Debug, Clone)]
pub struct AccessRules {
    rules: Vec<(Pattern, PackageAccess)>,
}

impl AccessRules {
    pub fn compile(rules: &[PackageAccess]) -> Result<Self> {
        let rules = rules
            .iter()
            .map(|rule| Ok((Pattern::new(&rule.pattern)?, rule.clone())))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rules })
    }

    /// The first rule matching `package`, if any.
    pub fn lookup(&self, package: &str) -> Option<&PackageAccess> {
        self.rules
            .iter()
            .find(|(pattern, _)| pattern.matches_with(package, MATCH_OPTIONS))
            .map(|(_, rule)| rule)
    }
}
