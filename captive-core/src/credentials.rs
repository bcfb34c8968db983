use crate::error::ValidationError;
use async_trait::async_trait;
use serde::Deserialize;
use std::fmt;

/// Fields submitted through the portal form.
#[derive(Deserialize, Clone, Default)]
pub struct Credentials {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Credentials {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Decides whether a submission earns a grant.
#[async_trait]
pub trait CredentialValidator: Send + Sync {
    async fn validate(&self, credentials: &Credentials) -> Result<(), ValidationError>;
}

/// Accepts any submission that names a user.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

#[async_trait]
impl CredentialValidator for AcceptAll {
    async fn validate(&self, credentials: &Credentials) -> Result<(), ValidationError> {
        if credentials.username.trim().is_empty() {
            return Err(ValidationError::MissingField("username"));
        }
        Ok(())
    }
}
