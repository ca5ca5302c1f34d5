use sha2::{Digest, Sha256};

use crate::model::ContextVersion;

/// Content hash deciding which context versions build identically.
pub trait Fingerprinter: Send + Sync {
    fn fingerprint(&self, context_version: &ContextVersion) -> String;
}

/// SHA-256 over the build instructions and the sorted `(repo, commit)` pairs.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256Fingerprinter;

impl Fingerprinter for Sha256Fingerprinter {
    fn fingerprint(&self, context_version: &ContextVersion) -> String {
        let mut refs: Vec<(&str, &str)> = context_version
            .app_code_versions
            .iter()
            .map(|acv| (acv.lower_repo.as_str(), acv.commit.as_deref().unwrap_or("")))
            .collect();
        refs.sort_unstable();

        let mut hasher = Sha256::new();
        hasher.update(context_version.build_instructions.as_bytes());
        for (repo, commit) in refs {
            hasher.update([0u8]);
            hasher.update(repo.as_bytes());
            hasher.update([0u8]);
            hasher.update(commit.as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}
