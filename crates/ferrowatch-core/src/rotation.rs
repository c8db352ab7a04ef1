//! Round-robin credential selection for shared resources.

use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::sync::Mutex;

use tracing::warn;

/// API key of one participant. `Debug` never prints the secret.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    owner: String,
    secret: String,
}

impl Credential {
    pub fn new(owner: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            secret: secret.into(),
        }
    }

    /// Who the call is attributed to.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }
}

impl Debug for Credential {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("owner", &self.owner)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Remembers the last index handed out per resource.
#[derive(Debug, Default)]
pub struct CredentialRotator {
    last_used: Mutex<HashMap<String, usize>>,
}

impl CredentialRotator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next credential for `resource`, cycling through `eligible`.
    ///
    /// The first call for a resource returns `eligible[0]`. Returns `None` when
    /// `eligible` is empty; the caller skips the resource this cycle.
    pub fn next<'a, C>(&self, resource: &str, eligible: &'a [C]) -> Option<&'a C> {
        if eligible.is_empty() {
            warn!(resource, "no eligible credentials, skipping resource this cycle");
            return None;
        }

        let mut last_used = self
            .last_used
            .lock()
            .expect("rotation state lock is not poisoned");
        let index = match last_used.get(resource) {
            Some(last) => (last + 1) % eligible.len(),
            None => 0,
        };
        last_used.insert(resource.to_owned(), index);

        eligible.get(index)
    }

    pub fn last_used_index(&self, resource: &str) -> Option<usize> {
        self.last_used
            .lock()
            .expect("rotation state lock is not poisoned")
            .get(resource)
            .copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(count: usize) -> Vec<Credential> {
        (0..count)
            .map(|i| Credential::new(format!("member-{i}"), format!("key-{i}")))
            .collect()
    }

    #[test]
    fn visits_every_credential_once_before_repeating() {
        let rotator = CredentialRotator::new();
        let eligible = keys(3);

        let owners: Vec<&str> = (0..6)
            .filter_map(|_| rotator.next("faction:9", &eligible))
            .map(Credential::owner)
            .collect();

        assert_eq!(
            owners,
            ["member-0", "member-1", "member-2", "member-0", "member-1", "member-2"]
        );
    }

    #[test]
    fn resources_rotate_independently() {
        let rotator = CredentialRotator::new();
        let eligible = keys(2);

        rotator.next("faction:1", &eligible);
        let other = rotator.next("faction:2", &eligible).expect("non-empty");

        assert_eq!(other.owner(), "member-0");
        assert_eq!(rotator.last_used_index("faction:1"), Some(0));
    }

    #[test]
    fn shrinking_list_keeps_index_in_range() {
        let rotator = CredentialRotator::new();
        rotator.next("faction:1", &keys(5));
        rotator.next("faction:1", &keys(5));
        rotator.next("faction:1", &keys(5));

        let shrunk = keys(2);
        let picked = rotator.next("faction:1", &shrunk).expect("non-empty");
        assert_eq!(picked.owner(), "member-1");
        assert_eq!(rotator.last_used_index("faction:1"), Some(1));
    }

    #[test]
    fn empty_list_yields_none() {
        let rotator = CredentialRotator::new();
        let empty: Vec<Credential> = Vec::new();

        assert!(rotator.next("faction:1", &empty).is_none());
        assert_eq!(rotator.last_used_index("faction:1"), None);
    }

    #[test]
    fn debug_redacts_secret() {
        let rendered = format!("{:?}", Credential::new("alice", "s3cr3t"));
        assert!(rendered.contains("alice"));
        assert!(!rendered.contains("s3cr3t"));
    }
}
