//! Test support utilities for the storage workspace.
//!
//! [`TestEnv`] wraps a temporary directory and the environment file
//! inside it, so tests can create, drop and reopen environments
//! without repeating path plumbing. The directory is removed when the
//! `TestEnv` is dropped.

use common::{DbResult, EnvOptions};
use env::Environment;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// An environment file in its own scratch directory.
pub struct TestEnv {
    _dir: TempDir,
    path: PathBuf,
}

impl TestEnv {
    /// Create the scratch directory and the environment inside it.
    pub fn create(opts: EnvOptions) -> (Self, Environment) {
        let dir = tempfile::tempdir().expect("create scratch directory");
        let path = dir.path().join("env.db");
        let environment = Environment::create(&path, opts).expect("create environment");
        (Self { _dir: dir, path }, environment)
    }

    /// Reopen the environment, e.g. after `close()` or a simulated
    /// crash (dropping the `Environment` without closing it).
    pub fn open(&self, opts: EnvOptions) -> DbResult<Environment> {
        Environment::open(&self.path, opts)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Options with small pages so cache and rotation limits are easy
    /// to hit.
    pub fn small_pages() -> EnvOptions {
        EnvOptions::builder()
            .page_size(1024)
            .cache_size(100 * 1024)
            .build()
    }

    /// Small pages plus write-ahead logging.
    pub fn recovery() -> EnvOptions {
        EnvOptions::builder()
            .page_size(1024)
            .cache_size(100 * 1024)
            .enable_recovery(true)
            .enable_transactions(true)
            .build()
    }
}
