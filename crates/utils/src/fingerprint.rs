use std::path::Path;

use sha2::{Digest, Sha256};

/// Stable fingerprint of a workspace set: lowercase hex SHA-256 of the
/// newline-joined, lexicographically sorted absolute workspace paths.
/// Distinct workspace combinations never share task history.
pub fn workspace_fingerprint<P: AsRef<Path>>(workspaces: &[P]) -> String {
    let mut paths: Vec<String> = workspaces
        .iter()
        .map(|p| p.as_ref().to_string_lossy().into_owned())
        .collect();
    paths.sort();

    let mut hasher = Sha256::new();
    hasher.update(paths.join("\n").as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    #[test]
    fn test_fingerprint_order_independent() {
        let a = [PathBuf::from("/b/repo"), PathBuf::from("/a/repo")];
        let b = [PathBuf::from("/a/repo"), PathBuf::from("/b/repo")];
        assert_eq!(workspace_fingerprint(&a), workspace_fingerprint(&b));
    }

    #[test]
    fn test_fingerprint_distinguishes_sets() {
        let a = [PathBuf::from("/a/repo")];
        let b = [PathBuf::from("/a/repo"), PathBuf::from("/b/repo")];
        assert_ne!(workspace_fingerprint(&a), workspace_fingerprint(&b));
    }

    #[test]
    fn test_fingerprint_is_lowercase_hex() {
        let fp = workspace_fingerprint(&[PathBuf::from("/x")]);
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }
}
