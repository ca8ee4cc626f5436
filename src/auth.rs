//! # Connection Authentication
//!
//! Credential checks for the bridge's client-facing side. Lookup failures and
//! malformed records all resolve to a deny decision; authentication never
//! surfaces as a transport error, so a failed check closes the session the
//! same way on every path.

use serde::{Deserialize, Serialize};

/// How a stored credential is meant to be compared
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CredentialKind {
    /// Username and password both compared byte-exact
    Basic,
    /// Username is the whole secret; the presented password must be empty
    AccessToken,
}

/// One stored credential record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub kind: CredentialKind,
    pub username: String,
    pub password: String,
}

/// Outcome of a credential check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthDecision {
    Allow,
    Deny { reason: &'static str },
}

impl AuthDecision {
    /// Whether the connection may proceed
    pub fn is_allowed(&self) -> bool {
        matches!(self, AuthDecision::Allow)
    }
}

/// Check presented credentials against a stored record
///
/// `record` is the stored credential found for the presented username, or
/// `None` when no such user exists. Unknown users and kind mismatches deny
/// rather than error.
pub fn validate_credentials(
    record: Option<&CredentialRecord>,
    username: &str,
    password: &str,
) -> AuthDecision {
    let record = match record {
        Some(r) => r,
        None => return AuthDecision::Deny { reason: "unknown user" },
    };

    if record.username != username {
        return AuthDecision::Deny { reason: "username mismatch" };
    }

    match record.kind {
        CredentialKind::Basic => {
            if record.password.as_bytes() == password.as_bytes() {
                AuthDecision::Allow
            } else {
                AuthDecision::Deny { reason: "bad password" }
            }
        }
        CredentialKind::AccessToken => {
            if password.is_empty() {
                AuthDecision::Allow
            } else {
                AuthDecision::Deny { reason: "token login must present an empty password" }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn basic() -> CredentialRecord {
        CredentialRecord {
            kind: CredentialKind::Basic,
            username: "operator".to_string(),
            password: "s3cret".to_string(),
        }
    }

    fn token() -> CredentialRecord {
        CredentialRecord {
            kind: CredentialKind::AccessToken,
            username: "tok-8f2a".to_string(),
            password: String::new(),
        }
    }

    #[test]
    fn test_basic_credentials() {
        let record = basic();
        assert!(validate_credentials(Some(&record), "operator", "s3cret").is_allowed());
        assert!(!validate_credentials(Some(&record), "operator", "S3CRET").is_allowed());
        assert!(!validate_credentials(Some(&record), "operator", "").is_allowed());
    }

    #[test]
    fn test_access_token() {
        let record = token();
        assert!(validate_credentials(Some(&record), "tok-8f2a", "").is_allowed());
        // A token login presenting any password is denied
        assert!(!validate_credentials(Some(&record), "tok-8f2a", "tok-8f2a").is_allowed());
    }

    #[test]
    fn test_unknown_user_denied() {
        assert_eq!(
            validate_credentials(None, "ghost", "whatever"),
            AuthDecision::Deny { reason: "unknown user" }
        );
    }
}
