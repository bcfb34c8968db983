use crate::credentials::{CredentialValidator, Credentials};
use crate::error::ValidationError;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// A database of locally defined users for authentication.
#[derive(Debug, Clone, Default)]
pub struct LocalUsers {
    users: Arc<RwLock<HashMap<String, String>>>,
}

impl LocalUsers {
    /// Creates a new, empty local user database.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads users from a file at the given path.
    ///
    /// The file should be in the format `username:password` per line.
    /// Lines starting with # are treated as comments and ignored.
    pub fn load<P: AsRef<Path>>(&self, path: P) -> io::Result<usize> {
        let path = path.as_ref();
        info!("Loading local users from {}", path.display());

        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let mut loaded = HashMap::new();

        for (lineno, line) in reader.lines().enumerate() {
            let line = line?;
            let line = line.trim_end();
            if line.starts_with('#') || line.trim().is_empty() {
                continue;
            }

            match line.split_once(':') {
                Some((username, password)) if !username.is_empty() => {
                    loaded.insert(username.to_string(), password.to_string());
                }
                _ => warn!("Malformed line {} in local users file", lineno + 1),
            }
        }

        let count = loaded.len();
        *self.users.write() = loaded;
        info!("Loaded {} local users.", count);
        Ok(count)
    }

    /// Checks if a user exists and verifies their password.
    pub fn verify_password(&self, username: &str, password: &str) -> bool {
        self.users
            .read()
            .get(username)
            .map_or(false, |stored_password| stored_password == password)
    }

    pub fn len(&self) -> usize {
        self.users.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.read().is_empty()
    }
}

#[async_trait]
impl CredentialValidator for LocalUsers {
    async fn validate(&self, credentials: &Credentials) -> Result<(), ValidationError> {
        if credentials.username.is_empty() {
            return Err(ValidationError::MissingField("username"));
        }
        if credentials.password.is_empty() {
            return Err(ValidationError::MissingField("password"));
        }
        if self.verify_password(&credentials.username, &credentials.password) {
            Ok(())
        } else {
            Err(ValidationError::Rejected)
        }
    }
}
