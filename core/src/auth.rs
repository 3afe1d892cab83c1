use std::fmt::Write;

use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use rand::Rng;

use crate::error::{Error, Result};
use crate::models::{NewUser, UpdateUser, validate_max_len, validate_password};

/// Token keys are 20 random bytes, hex encoded.
pub const TOKEN_BYTES: usize = 20;

/// The one message every failed login gets, whatever the cause.
pub const BAD_CREDENTIALS: &str = "Unable to authenticate with provided credentials.";

/// A validated signup with its password already hashed.
///
/// Hashing is slow on purpose, so this is built before the database is
/// locked and then handed to [`crate::db::Database::register`].
#[derive(Debug, Clone)]
pub struct HashedUser {
    pub email: String,
    pub name: String,
    pub password_hash: String,
}

impl HashedUser {
    pub fn prepare(new_user: &NewUser) -> Result<Self> {
        let email = normalize_email(&new_user.email)?;
        validate_password(&new_user.password)?;
        validate_max_len("name", &new_user.name)?;
        Ok(Self {
            email,
            name: new_user.name.clone(),
            password_hash: hash_password(&new_user.password)?,
        })
    }
}

/// A validated profile update. `None` fields are left alone.
#[derive(Debug, Clone, Default)]
pub struct ProfileChanges {
    pub email: Option<String>,
    pub name: Option<String>,
    pub password_hash: Option<String>,
}

impl ProfileChanges {
    pub fn prepare(update: &UpdateUser) -> Result<Self> {
        let email = update.email.as_deref().map(normalize_email).transpose()?;
        if let Some(name) = &update.name {
            validate_max_len("name", name)?;
        }
        if let Some(password) = &update.password {
            validate_password(password)?;
        }
        Ok(Self {
            email,
            name: update.name.clone(),
            password_hash: update.password.as_deref().map(hash_password).transpose()?,
        })
    }
}

/// What a login check needs from the store: an active account's id and hash.
#[derive(Debug, Clone)]
pub struct LoginCredentials {
    pub user_id: i64,
    pub password_hash: String,
}

impl LoginCredentials {
    /// The account id if `password` matches. Runs the full Argon2 verify.
    #[must_use]
    pub fn verify(&self, password: &str) -> Option<i64> {
        verify_password(password, &self.password_hash).then_some(self.user_id)
    }
}

/// Lowercase the domain part of an email address, keeping the local part as typed.
pub fn normalize_email(email: &str) -> Result<String> {
    let email = email.trim();
    if email.is_empty() {
        return Err(Error::validation("email is required"));
    }
    let (local, domain) = email
        .rsplit_once('@')
        .filter(|(local, domain)| !local.is_empty() && !domain.is_empty())
        .ok_or_else(|| Error::validation("enter a valid email address"))?;
    if email.chars().any(char::is_whitespace) {
        return Err(Error::validation("enter a valid email address"));
    }
    Ok(format!("{local}@{}", domain.to_lowercase()))
}

pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| Error::PasswordHash(e.to_string()))
}

/// Check a password against a stored PHC string. A malformed hash never matches.
#[must_use]
pub fn verify_password(password: &str, password_hash: &str) -> bool {
    PasswordHash::new(password_hash).is_ok_and(|parsed| {
        Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok()
    })
}

#[must_use]
pub fn generate_token() -> String {
    let bytes: [u8; TOKEN_BYTES] = rand::rng().random();
    bytes
        .iter()
        .fold(String::with_capacity(TOKEN_BYTES * 2), |mut acc, b| {
            let _ = write!(acc, "{b:02x}");
            acc
        })
}
