use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use secrecy::{ExposeSecret, Secret};

/// Presented or new secret. Never printed.
#[derive(Clone)]
pub struct Password(Secret<String>);

impl Password {
    pub fn new(password: impl Into<String>) -> Self {
        Self(Secret::new(password.into()))
    }

    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }
}

impl std::fmt::Debug for Password {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Password([REDACTED])")
    }
}

/// PHC-formatted Argon2 hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswordHashString(String);

impl PasswordHashString {
    pub fn new(hash: String) -> Self {
        Self(hash)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

/// Argon2id with default parameters and a fresh salt.
pub fn hash_password(password: &Password) -> Result<PasswordHashString, anyhow::Error> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.expose().as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("Failed to hash password: {}", e))?
        .to_string();
    Ok(PasswordHashString::new(hash))
}

/// `Ok(false)` on mismatch; `Err` only when the stored hash is unusable.
pub fn verify_password(
    password: &Password,
    password_hash: &PasswordHashString,
) -> Result<bool, anyhow::Error> {
    let parsed = PasswordHash::new(password_hash.as_str())
        .map_err(|e| anyhow::anyhow!("Invalid password hash format: {}", e))?;
    match Argon2::default().verify_password(password.expose().as_bytes(), &parsed) {
        Ok(()) => Ok(true),
        Err(argon2::password_hash::Error::Password) => Ok(false),
        Err(e) => Err(anyhow::anyhow!("Password verification failed: {}", e)),
    }
}
