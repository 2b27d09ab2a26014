//! Derivation of [`AccessDescriptor`]s.
//!
//! The owner is the first of:
//!
//! 1. the owner reported by the file store's share API,
//! 2. the owner taken from the notification path (`files/{owner}/...`),
//! 3. the first configured owner rule whose glob matches the path,
//! 4. `access.default_owner`.
//!
//! Users and groups are the union of the store's shares and every group rule
//! whose glob matches. Globs are case-insensitive and `*` crosses `/`.

use anyhow::{Context, Result};
use globset::{GlobBuilder, GlobMatcher, GlobSet, GlobSetBuilder};

use crate::config::AccessConfig;
use crate::filestore::Shares;
use crate::models::AccessDescriptor;

pub struct AccessPolicy {
    default_owner: String,
    owner_rules: Vec<(GlobMatcher, String)>,
    group_set: GlobSet,
    /// Group for each pattern in `group_set`, by index.
    group_names: Vec<String>,
}

impl AccessPolicy {
    pub fn from_config(config: &AccessConfig) -> Result<Self> {
        let owner_rules = config
            .owner_rules
            .iter()
            .map(|r| Ok((build_glob(&r.pattern)?.compile_matcher(), r.owner.clone())))
            .collect::<Result<Vec<_>>>()?;

        let mut builder = GlobSetBuilder::new();
        let mut group_names = Vec::with_capacity(config.group_rules.len());
        for rule in &config.group_rules {
            builder.add(build_glob(&rule.pattern)?);
            group_names.push(rule.group.clone());
        }

        Ok(Self {
            default_owner: config.default_owner.clone(),
            owner_rules,
            group_set: builder.build()?,
            group_names,
        })
    }

    /// Deterministic descriptor for a resolved path.
    pub fn derive(&self, path: &str, owner_hint: Option<&str>, shares: &Shares) -> AccessDescriptor {
        let path = path.trim_start_matches('/');

        let owner = shares
            .owner
            .as_deref()
            .or(owner_hint.filter(|o| !o.is_empty()))
            .or_else(|| {
                self.owner_rules
                    .iter()
                    .find(|(glob, _)| glob.is_match(path))
                    .map(|(_, owner)| owner.as_str())
            })
            .unwrap_or(&self.default_owner);

        let mut descriptor = AccessDescriptor::owned_by(owner);
        descriptor.allowed_users.extend(shares.users.iter().cloned());
        descriptor.allowed_groups.extend(shares.groups.iter().cloned());
        for i in self.group_set.matches(path) {
            descriptor.allowed_groups.insert(self.group_names[i].clone());
        }
        descriptor
    }
}

fn build_glob(pattern: &str) -> Result<globset::Glob> {
    GlobBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .with_context(|| format!("Invalid access rule pattern: '{}'", pattern))
}
