//! Filesystem configuration.

/// Tunables carried by every filesystem handle.
#[derive(Debug, Clone)]
pub struct FsConfig {
    /// Content-addressed deduplication of representations across revisions.
    pub rep_sharing_allowed: bool,
    /// Length of the linear part of a delta chain near HEAD.
    pub max_linear_deltification: u32,
    /// Ceiling on predecessor hops when picking a delta base; beyond it a
    /// fresh delta chain is started.
    pub max_deltification_walk: u32,
    /// Revisions per shard directory. Fixed at repository creation.
    pub max_files_per_dir: u32,
    /// Re-open and re-read the new revision just before bumping `current`.
    pub verify_before_commit: bool,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            rep_sharing_allowed: true,
            max_linear_deltification: 16,
            max_deltification_walk: 1023,
            max_files_per_dir: 1000,
            verify_before_commit: false,
        }
    }
}

impl FsConfig {
    #[must_use]
    pub fn rep_sharing(mut self, allowed: bool) -> Self {
        self.rep_sharing_allowed = allowed;
        self
    }

    #[must_use]
    pub fn max_linear_deltification(mut self, limit: u32) -> Self {
        self.max_linear_deltification = limit;
        self
    }

    #[must_use]
    pub fn max_deltification_walk(mut self, limit: u32) -> Self {
        self.max_deltification_walk = limit;
        self
    }

    #[must_use]
    pub fn verify_before_commit(mut self, verify: bool) -> Self {
        self.verify_before_commit = verify;
        self
    }
}
