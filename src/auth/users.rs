//! Users file and Basic authentication
//!
//! The users file holds one user per line:
//!
//! ```text
//! # username:bcrypt-hash:roles
//! admin:$2b$12$...:admin
//! ops:$2b$12$...:multi
//! guest:$2b$12$...:
//! ```
//!
//! Roles are comma separated, `admin` and `multi` are recognised.

use super::Identity;
use crate::error::{DeckhandError, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::collections::HashMap;
use std::path::Path;
use tracing::warn;

#[derive(Debug, Clone)]
struct User {
    identity: Identity,
    password_hash: String,
}

/// Known users
#[derive(Debug, Clone, Default)]
pub struct UserStore {
    users: HashMap<String, User>,
}

impl UserStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a users file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            DeckhandError::InvalidConfig(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::parse(&content)
    }

    /// Parse users file content
    pub fn parse(content: &str) -> Result<Self> {
        let mut store = Self::new();

        for (number, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let mut parts = line.splitn(3, ':');
            let (username, hash) = match (parts.next(), parts.next()) {
                (Some(username), Some(hash)) if !username.is_empty() && !hash.is_empty() => {
                    (username, hash)
                }
                _ => {
                    return Err(DeckhandError::InvalidConfig(format!(
                        "Invalid user on line {}",
                        number + 1
                    )))
                }
            };

            let mut admin = false;
            let mut multi_app = false;
            for role in parts.next().unwrap_or_default().split(',').map(str::trim) {
                match role {
                    "" => {}
                    "admin" => admin = true,
                    "multi" => multi_app = true,
                    other => warn!(user = %username, role = %other, "Unknown role ignored"),
                }
            }

            store.insert(Identity::new(username, admin, multi_app), hash.to_string());
        }

        Ok(store)
    }

    /// Add a user with an already hashed password
    pub fn insert(&mut self, identity: Identity, password_hash: String) {
        self.users.insert(
            identity.username.clone(),
            User {
                identity,
                password_hash,
            },
        );
    }

    /// Number of users
    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    /// Check a username and password
    pub fn verify(&self, username: &str, password: &str) -> Option<Identity> {
        let user = self.users.get(username)?;
        bcrypt::verify(password, &user.password_hash)
            .unwrap_or(false)
            .then(|| user.identity.clone())
    }

    /// Authenticate an `Authorization: Basic ...` header value
    pub fn authenticate(&self, header: Option<&str>) -> Result<Identity> {
        let header =
            header.ok_or_else(|| DeckhandError::Unauthorized("Missing credentials".to_string()))?;
        let (username, password) = parse_basic(header)?;

        self.verify(&username, &password)
            .ok_or_else(|| DeckhandError::Unauthorized("Invalid credentials".to_string()))
    }
}

/// Decode a Basic authorization value into username and password
fn parse_basic(header: &str) -> Result<(String, String)> {
    let invalid = || DeckhandError::Unauthorized("Invalid authorization header".to_string());

    let (scheme, encoded) = header.trim().split_once(' ').ok_or_else(invalid)?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return Err(invalid());
    }

    let decoded = STANDARD.decode(encoded.trim()).map_err(|_| invalid())?;
    let credentials = String::from_utf8(decoded).map_err(|_| invalid())?;
    let (username, password) = credentials.split_once(':').ok_or_else(invalid)?;

    Ok((username.to_string(), password.to_string()))
}

/// Hash a password for the users file
pub fn hash_password(password: &str, cost: u32) -> Result<String> {
    bcrypt::hash(password, cost)
        .map_err(|e| DeckhandError::InvalidConfig(format!("Failed to hash password: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn basic(username: &str, password: &str) -> String {
        format!("Basic {}", STANDARD.encode(format!("{}:{}", username, password)))
    }

    fn store() -> UserStore {
        let content = format!(
            "# users\nadmin:{}:admin\n\nops:{}:multi\nguest:{}:\n",
            hash_password("secret", 4).unwrap(),
            hash_password("ops", 4).unwrap(),
            hash_password("guest", 4).unwrap(),
        );
        UserStore::parse(&content).unwrap()
    }

    #[test]
    fn test_parse_roles() {
        let store = store();
        assert_eq!(store.len(), 3);

        let admin = store.verify("admin", "secret").unwrap();
        assert!(admin.is_admin());
        assert!(!admin.is_multi_app());

        let ops = store.verify("ops", "ops").unwrap();
        assert!(ops.is_multi_app());
        assert!(!ops.is_admin());

        let guest = store.verify("guest", "guest").unwrap();
        assert!(!guest.is_admin() && !guest.is_multi_app());
    }

    #[test]
    fn test_parse_invalid_line() {
        assert!(UserStore::parse("admin").is_err());
        assert!(UserStore::parse(":hash:admin").is_err());
    }

    #[test]
    fn test_authenticate() {
        let store = store();

        let identity = store.authenticate(Some(&basic("admin", "secret"))).unwrap();
        assert_eq!(identity.username, "admin");

        assert!(matches!(
            store.authenticate(Some(&basic("admin", "wrong"))),
            Err(DeckhandError::Unauthorized(_))
        ));
        assert!(store.authenticate(Some(&basic("nobody", "secret"))).is_err());
        assert!(store.authenticate(None).is_err());
        assert!(store.authenticate(Some("Bearer token")).is_err());
        assert!(store.authenticate(Some("Basic !!!")).is_err());
    }

    #[test]
    fn test_password_with_colon() {
        let mut store = UserStore::new();
        store.insert(
            Identity::new("admin", true, false),
            hash_password("a:b", 4).unwrap(),
        );

        assert!(store.authenticate(Some(&basic("admin", "a:b"))).is_ok());
    }

    #[test]
    fn test_load_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "admin:{}:admin", hash_password("secret", 4).unwrap()).unwrap();

        let store = UserStore::load(file.path()).unwrap();
        assert!(store.verify("admin", "secret").is_some());
        assert!(UserStore::load(Path::new("/nonexistent/users")).is_err());
    }
}
