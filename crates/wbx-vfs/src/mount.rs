use std::collections::BTreeMap;

use crate::error::MountError;
use crate::path::is_within;

/// What happens to a subtree's content across sessions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MountPolicy {
    /// Lives and dies with the session.
    None,
    /// Mirrored into the durable store by pull/push.
    Durable,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MountRecord {
    pub prefix: String,
    pub policy: MountPolicy,
}

/// Path prefix → persistence policy. At most one durable mount exists.
#[derive(Debug, Default)]
pub(crate) struct MountTable {
    records: BTreeMap<String, MountPolicy>,
}

impl MountTable {
    pub(crate) fn mount(&mut self, prefix: &str, policy: MountPolicy) -> Result<(), MountError> {
        if self.records.contains_key(prefix) {
            return Err(MountError::AlreadyMounted {
                path: prefix.to_string(),
            });
        }
        if policy == MountPolicy::Durable
            && let Some(existing) = self.durable_prefix()
        {
            return Err(MountError::DurableInUse {
                existing: existing.to_string(),
                requested: prefix.to_string(),
            });
        }
        self.records.insert(prefix.to_string(), policy);
        Ok(())
    }

    pub(crate) fn durable_prefix(&self) -> Option<&str> {
        self.records
            .iter()
            .find(|(_, policy)| **policy == MountPolicy::Durable)
            .map(|(prefix, _)| prefix.as_str())
    }

    /// Policy of the innermost mount covering `path`.
    pub(crate) fn policy_for(&self, path: &str) -> MountPolicy {
        self.records
            .iter()
            .filter(|(prefix, _)| is_within(prefix, path))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, policy)| *policy)
            .unwrap_or(MountPolicy::None)
    }

    pub(crate) fn records(&self) -> Vec<MountRecord> {
        self.records
            .iter()
            .map(|(prefix, policy)| MountRecord {
                prefix: prefix.clone(),
                policy: *policy,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_durable_mount() {
        let mut table = MountTable::default();
        table.mount("/cache", MountPolicy::Durable).unwrap();
        assert!(matches!(
            table.mount("/cache", MountPolicy::Durable),
            Err(MountError::AlreadyMounted { .. })
        ));
        assert!(matches!(
            table.mount("/other", MountPolicy::Durable),
            Err(MountError::DurableInUse { .. })
        ));
        assert!(matches!(
            table.mount("/cache/inner", MountPolicy::Durable),
            Err(MountError::DurableInUse { .. })
        ));
        assert_eq!(table.durable_prefix(), Some("/cache"));
    }

    #[test]
    fn policy_lookup_by_prefix() {
        let mut table = MountTable::default();
        table.mount("/cache", MountPolicy::Durable).unwrap();
        assert_eq!(table.policy_for("/cache/abc"), MountPolicy::Durable);
        assert_eq!(table.policy_for("/cache"), MountPolicy::Durable);
        assert_eq!(table.policy_for("/cached"), MountPolicy::None);
        assert_eq!(table.records().len(), 1);
    }
}
