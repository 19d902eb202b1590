//! Read-only subscriber directory.
//!
//! The daemon never owns user accounts; it consumes a directory through the
//! [`UserDirectory`] trait.  The built-in implementation is an in-memory map
//! loaded from a TOML file at boot, so lookups are safe to run on the event
//! loop.  A database-backed directory replaces this behind the same trait.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use tv_proto::commands::AuthInfo;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DirectoryError {
    #[error("user not found")]
    NotFound,
    #[error("wrong password")]
    WrongPassword,
}

/// What the directory knows about one subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserInfo {
    pub user_id: String,
    pub channels: Vec<String>,
    pub devices: Vec<String>,
    pub banned: bool,
}

impl UserInfo {
    pub fn has_device(&self, device_id: &str) -> bool {
        self.devices.iter().any(|d| d == device_id)
    }
}

pub trait UserDirectory {
    fn find_user(&self, auth: &AuthInfo) -> Result<UserInfo, DirectoryError>;
}

// ---------------------------------------------------------------------------
// In-memory directory
// ---------------------------------------------------------------------------

struct StoredUser {
    password: String,
    info: UserInfo,
}

/// Map-backed directory keyed by login.
#[derive(Default)]
pub struct InMemoryDirectory {
    users: HashMap<String, StoredUser>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        InMemoryDirectory::default()
    }

    pub fn add_user(&mut self, login: &str, password: &str, info: UserInfo) {
        self.users.insert(
            login.to_owned(),
            StoredUser {
                password: password.to_owned(),
                info,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

impl UserDirectory for InMemoryDirectory {
    fn find_user(&self, auth: &AuthInfo) -> Result<UserInfo, DirectoryError> {
        let stored = self.users.get(&auth.login).ok_or(DirectoryError::NotFound)?;
        if stored.password != auth.password {
            return Err(DirectoryError::WrongPassword);
        }
        Ok(stored.info.clone())
    }
}

// ---------------------------------------------------------------------------
// TOML loading
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("reading users file: {0}")]
    Io(#[from] std::io::Error),
    #[error("parsing users file: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Deserialize)]
struct RawUsersFile {
    #[serde(default)]
    users: Vec<RawUser>,
}

#[derive(Deserialize)]
struct RawUser {
    login: String,
    password: String,
    user_id: String,
    #[serde(default)]
    channels: Vec<String>,
    #[serde(default)]
    devices: Vec<String>,
    #[serde(default)]
    banned: bool,
}

/// Load the directory from a `[[users]]` TOML file.
pub fn load_directory(path: &Path) -> Result<InMemoryDirectory, LoadError> {
    let text = std::fs::read_to_string(path)?;
    load_directory_from_str(&text)
}

pub fn load_directory_from_str(text: &str) -> Result<InMemoryDirectory, LoadError> {
    let raw: RawUsersFile = toml::from_str(text)?;
    let mut directory = InMemoryDirectory::new();
    for user in raw.users {
        directory.add_user(
            &user.login,
            &user.password,
            UserInfo {
                user_id: user.user_id,
                channels: user.channels,
                devices: user.devices,
                banned: user.banned,
            },
        );
    }
    Ok(directory)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth(login: &str, password: &str) -> AuthInfo {
        AuthInfo {
            login: login.to_owned(),
            password: password.to_owned(),
            device_id: "d1".to_owned(),
        }
    }

    #[test]
    fn lookup_checks_password() {
        let mut dir = InMemoryDirectory::new();
        dir.add_user(
            "u",
            "p",
            UserInfo {
                user_id: "uid-1".to_owned(),
                channels: vec!["A".to_owned()],
                devices: vec!["d1".to_owned()],
                banned: false,
            },
        );

        assert_eq!(dir.find_user(&auth("u", "p")).unwrap().user_id, "uid-1");
        assert_eq!(
            dir.find_user(&auth("u", "wrong")),
            Err(DirectoryError::WrongPassword)
        );
        assert_eq!(
            dir.find_user(&auth("nobody", "p")),
            Err(DirectoryError::NotFound)
        );
    }

    #[test]
    fn loads_users_from_toml() {
        let text = r#"
            [[users]]
            login = "u"
            password = "p"
            user_id = "uid-1"
            channels = ["A", "B"]
            devices = ["d1"]

            [[users]]
            login = "banned"
            password = "p"
            user_id = "uid-2"
            banned = true
        "#;
        let dir = load_directory_from_str(text).unwrap();
        assert_eq!(dir.len(), 2);

        let user = dir.find_user(&auth("u", "p")).unwrap();
        assert_eq!(user.channels, vec!["A", "B"]);
        assert!(user.has_device("d1"));
        assert!(!user.has_device("d2"));

        let banned = dir.find_user(&auth("banned", "p")).unwrap();
        assert!(banned.banned);
    }
}
