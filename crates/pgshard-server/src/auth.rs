use crate::config::Config;
use anyhow::{anyhow, Result};
use argon2::Argon2;
use password_hash::{PasswordHash, PasswordVerifier};
use std::collections::HashMap;

#[derive(Debug, Clone)]
struct Credential {
    password_hash: Option<String>,
    password_plain: Option<String>,
}

impl Credential {
    fn is_open(&self) -> bool {
        self.password_hash.is_none() && self.password_plain.is_none()
    }
}

/// Client logins, keyed by (database, user).
#[derive(Debug, Clone)]
pub struct AuthManager {
    users: HashMap<(String, String), Credential>,
    admin_database: String,
}

#[derive(Debug, Clone)]
pub struct UserContext {
    pub username: String,
    pub database: String,
    pub is_admin: bool,
}

impl AuthManager {
    pub fn new(config: &Config) -> Self {
        let mut users = HashMap::new();
        users.insert(
            (config.admin.database.clone(), config.admin.user.clone()),
            Credential {
                password_hash: config.admin.password_hash.clone(),
                password_plain: config.admin.password_plain.clone(),
            },
        );
        for cluster in &config.clusters {
            users.insert(
                (cluster.name.clone(), cluster.user.clone()),
                Credential {
                    password_hash: cluster.password_hash.clone(),
                    password_plain: cluster.password_plain.clone(),
                },
            );
        }
        Self {
            users,
            admin_database: config.admin.database.clone(),
        }
    }

    /// Does this login have to send a password?
    pub fn requires_password(&self, database: &str, username: &str) -> Result<bool> {
        let credential = self.credential(database, username)?;
        Ok(!credential.is_open())
    }

    pub fn authenticate(&self, database: &str, username: &str, password: Option<&str>) -> Result<UserContext> {
        let credential = self.credential(database, username)?;
        if let Some(hash) = &credential.password_hash {
            let parsed = PasswordHash::new(hash).map_err(|e| anyhow!("invalid password hash: {e}"))?;
            Argon2::default()
                .verify_password(password.unwrap_or_default().as_bytes(), &parsed)
                .map_err(|_| invalid_password(username))?;
        } else if let Some(plain) = &credential.password_plain {
            if password != Some(plain.as_str()) {
                return Err(invalid_password(username));
            }
        }
        Ok(UserContext {
            username: username.to_string(),
            database: database.to_string(),
            is_admin: database == self.admin_database,
        })
    }

    fn credential(&self, database: &str, username: &str) -> Result<&Credential> {
        self.users
            .get(&(database.to_string(), username.to_string()))
            .ok_or_else(|| {
                anyhow!("no such database \"{database}\" for user \"{username}\"")
            })
    }
}

fn invalid_password(username: &str) -> anyhow::Error {
    anyhow!("password authentication failed for user \"{username}\"")
}
