//! Permission hashing for cheap drift detection.
//!
//! Two independently computed snapshots of the same logical capability set
//! must hash identically, regardless of input order or duplicates, so that a
//! single string comparison answers "has anything changed?".

use sha2::{Digest, Sha256};

/// Generate a SHA256 permission hash over a capability set.
///
/// The capabilities are sorted and deduplicated before hashing, which makes
/// the digest order-independent and stable across processes. Each one is
/// prefixed with its byte length, so no two distinct sets share an encoding
/// whatever characters the capability names contain.
///
/// # Example
///
/// ```rust
/// use authz::hashing::permission_hash;
///
/// let a = permission_hash(["billing.read", "clients.read"]);
/// let b = permission_hash(["clients.read", "billing.read", "billing.read"]);
/// assert_eq!(a, b);
/// assert_eq!(a.len(), 64);
/// ```
pub fn permission_hash<I, S>(capabilities: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut sorted: Vec<String> = capabilities
        .into_iter()
        .map(|c| c.as_ref().to_owned())
        .collect();
    sorted.sort();
    sorted.dedup();

    let mut hasher = Sha256::new();
    for capability in &sorted {
        hasher.update((capability.len() as u64).to_be_bytes());
        hasher.update(capability.as_bytes());
    }

    hex::encode(hasher.finalize())
}

/// Compare two stored hashes. An empty hash never matches anything, since it
/// means the hash was never computed.
pub fn hashes_match(a: &str, b: &str) -> bool {
    !a.is_empty() && a == b
}
