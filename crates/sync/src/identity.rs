//! Identity resolution for authenticated sessions.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use comanda_core::{Email, IdentityKeys, UserId};

/// Errors resolving identity keys from a session.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    /// The session carries no usable account id.
    #[error("Session has no user id")]
    MissingUserId,
}

/// An authenticated session as reported by the authentication provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthSession {
    /// Provider-issued account id.
    pub user_id: String,
    /// Contact email on the account, if any.
    #[serde(default)]
    pub email: Option<String>,
}

impl AuthSession {
    #[must_use]
    pub fn new(user_id: impl Into<String>, email: Option<&str>) -> Self {
        Self {
            user_id: user_id.into(),
            email: email.map(str::to_owned),
        }
    }
}

/// Resolve the identity keys that may label a session's records.
///
/// The account id is required. An email that is missing, blank or malformed
/// yields no secondary key, since it could not match any stored record.
///
/// # Errors
///
/// Returns [`IdentityError::MissingUserId`] if the account id is blank.
pub fn resolve(session: &AuthSession) -> Result<IdentityKeys, IdentityError> {
    let user_id = session.user_id.trim();
    if user_id.is_empty() {
        return Err(IdentityError::MissingUserId);
    }

    let secondary = match session.email.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(raw) => match Email::parse(raw) {
            Ok(email) => Some(email),
            Err(err) => {
                warn!(user_id, error = %err, "Ignoring malformed session email");
                None
            }
        },
    };

    Ok(IdentityKeys::new(UserId::new(user_id), secondary))
}
