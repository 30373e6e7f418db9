//! Static set of identities allowed to publish, loaded once at startup.

use std::{
    collections::{HashMap, HashSet},
    fs,
    path::Path,
};

use anyhow::{Context, Result};

use crate::identity::Identity;

/// Identities read from a JSON object such as
///
/// ```json
/// { "npub1...": true, "npub1...": false }
/// ```
///
/// Keys are trimmed; only entries set to `true` are members.
#[derive(Debug, Default, Clone)]
pub struct WhitelistSet {
    members: HashSet<Identity>,
}

impl WhitelistSet {
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)
            .with_context(|| format!("reading whitelist {}", path.display()))?;
        Self::from_json(&data).with_context(|| format!("loading whitelist {}", path.display()))
    }

    pub fn from_json(data: &str) -> Result<Self> {
        let entries: HashMap<String, bool> =
            serde_json::from_str(data).context("whitelist must be a JSON object of booleans")?;
        let mut members = HashSet::new();
        for (key, allowed) in entries {
            let id = Identity::from_npub(key.trim())
                .with_context(|| format!("invalid whitelist key {key:?}"))?;
            if allowed {
                members.insert(id);
            }
        }
        Ok(Self { members })
    }

    pub fn contains(&self, id: &Identity) -> bool {
        self.members.contains(id)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

impl FromIterator<Identity> for WhitelistSet {
    fn from_iter<I: IntoIterator<Item = Identity>>(iter: I) -> Self {
        Self {
            members: iter.into_iter().collect(),
        }
    }
}
