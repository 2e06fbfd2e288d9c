//! Secret resolution.
//!
//! Credentials such as the Redis password are never read straight from a
//! config struct. Callers go through a [`SecretResolver`], which lets a
//! deployment swap plain env vars for mounted secret files without touching
//! the code that consumes them. Values come back as [`SecretString`] so they
//! stay out of `Debug` output and logs.

use crate::ConfigError;
use std::path::{Path, PathBuf};

pub use secrecy::{ExposeSecret, SecretString};

/// Resolves named secrets.
///
/// `Ok(None)` means the secret is simply not configured; errors are reserved
/// for a source that exists but cannot be read.
pub trait SecretResolver: Send + Sync {
    fn resolve(&self, name: &str) -> Result<Option<SecretString>, ConfigError>;
}

/// Reads secrets from environment variables of the same name.
#[derive(Debug, Default, Clone)]
pub struct EnvSecretResolver;

impl SecretResolver for EnvSecretResolver {
    fn resolve(&self, name: &str) -> Result<Option<SecretString>, ConfigError> {
        match std::env::var(name) {
            Ok(value) if !value.is_empty() => Ok(Some(SecretString::from(value))),
            _ => Ok(None),
        }
    }
}

/// Reads secrets from files in a directory, one file per secret
/// (Docker/Kubernetes style mounts such as `/run/secrets/REDIS_PASSWORD`).
#[derive(Debug, Clone)]
pub struct FileSecretResolver {
    dir: PathBuf,
}

impl FileSecretResolver {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl SecretResolver for FileSecretResolver {
    fn resolve(&self, name: &str) -> Result<Option<SecretString>, ConfigError> {
        let path = self.dir.join(name);
        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                // Mounted secrets usually carry a trailing newline
                let value = contents.trim_end_matches(['\r', '\n']);
                if value.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(SecretString::from(value.to_string())))
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ConfigError::Secret {
                name: name.to_string(),
                details: format!("{}: {}", path.display(), e),
            }),
        }
    }
}

/// Tries each resolver in order and returns the first secret found.
pub struct ChainedSecretResolver {
    resolvers: Vec<Box<dyn SecretResolver>>,
}

impl ChainedSecretResolver {
    pub fn new(resolvers: Vec<Box<dyn SecretResolver>>) -> Self {
        Self { resolvers }
    }
}

impl SecretResolver for ChainedSecretResolver {
    fn resolve(&self, name: &str) -> Result<Option<SecretString>, ConfigError> {
        for resolver in &self.resolvers {
            if let Some(secret) = resolver.resolve(name)? {
                return Ok(Some(secret));
            }
        }
        Ok(None)
    }
}
