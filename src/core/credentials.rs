//! Per-request authentication material.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Login and password carried in a packet's auth field.
///
/// Both fields ride the wire behind a one-byte length prefix, so each is
/// limited to 255 bytes.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawCredentials", into = "RawCredentials")]
pub struct Credentials {
    login: String,
    password: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CredentialsError {
    #[error("login cannot be empty")]
    EmptyLogin,
    #[error("{field} exceeds 255 bytes")]
    TooLong { field: &'static str },
}

impl Credentials {
    pub fn new(
        login: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<Self, CredentialsError> {
        let login = login.into();
        let password = password.into();
        if login.is_empty() {
            return Err(CredentialsError::EmptyLogin);
        }
        if login.len() > u8::MAX as usize {
            return Err(CredentialsError::TooLong { field: "login" });
        }
        if password.len() > u8::MAX as usize {
            return Err(CredentialsError::TooLong { field: "password" });
        }
        Ok(Self { login, password })
    }

    pub fn login(&self) -> &str {
        &self.login
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

// Keep the password out of debug output and logs.
impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("login", &self.login)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Serialize, Deserialize)]
struct RawCredentials {
    login: String,
    password: String,
}

impl TryFrom<RawCredentials> for Credentials {
    type Error = CredentialsError;

    fn try_from(raw: RawCredentials) -> Result<Self, Self::Error> {
        Credentials::new(raw.login, raw.password)
    }
}

impl From<Credentials> for RawCredentials {
    fn from(creds: Credentials) -> Self {
        RawCredentials {
            login: creds.login,
            password: creds.password,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credentials_enforce_length_limits() {
        assert!(Credentials::new("admin", "changeit").is_ok());
        assert_eq!(
            Credentials::new("", "pw"),
            Err(CredentialsError::EmptyLogin)
        );
        let long = "x".repeat(256);
        assert_eq!(
            Credentials::new(long.clone(), "pw"),
            Err(CredentialsError::TooLong { field: "login" })
        );
        assert_eq!(
            Credentials::new("admin", long),
            Err(CredentialsError::TooLong { field: "password" })
        );
    }

    #[test]
    fn debug_redacts_password() {
        let creds = Credentials::new("admin", "hunter2").unwrap();
        let rendered = format!("{creds:?}");
        assert!(!rendered.contains("hunter2"));
    }
}
