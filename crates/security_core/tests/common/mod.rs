//! Shared test setup

#![allow(dead_code)]

use ideaforge_security_core::config::{MasterSecret, SecurityConfig};
use ideaforge_security_core::encryption::key_derivation::{KdfParams, MIN_PBKDF2_ITERATIONS};
use ideaforge_security_core::error::SecurityResult;
use std::path::Path;

pub const MASTER_PASSWORD: &str = "integration-test master password";

/// Default configuration under `dir` with the cheapest accepted KDF settings
pub fn test_config(dir: &Path) -> SecurityConfig {
    let mut config = SecurityConfig::with_data_dir(dir);
    config.keys.master_kdf = KdfParams {
        iterations: MIN_PBKDF2_ITERATIONS,
        ..KdfParams::default()
    };
    config.crypto.kdf = config.keys.master_kdf.clone();
    config
}

pub fn master_secret() -> SecurityResult<MasterSecret> {
    MasterSecret::new(MASTER_PASSWORD)
}

/// Lines of a stream file, empty when it does not exist yet
pub fn read_lines(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .map(|content| content.lines().map(str::to_string).collect())
        .unwrap_or_default()
}
