//! Password policy checks against a tenant's `password` settings.

use thiserror::Error;

use crate::models::PasswordSettings;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyError {
    #[error("Password must be at least {min_length} characters (got {actual_length})")]
    TooShort {
        min_length: usize,
        actual_length: usize,
    },
    #[error("Password must be at most {max_length} characters")]
    TooLong { max_length: usize },
    #[error("Password must contain at least one uppercase letter")]
    MissingUppercase,
    #[error("Password must contain at least one number")]
    MissingNumber,
    #[error("Password must contain at least one special character")]
    MissingSpecial,
}

#[derive(Debug, Clone)]
pub struct PasswordPolicy<'a> {
    settings: &'a PasswordSettings,
}

impl<'a> PasswordPolicy<'a> {
    pub fn new(settings: &'a PasswordSettings) -> Self {
        Self { settings }
    }

    /// First violation, if any.
    pub fn validate(&self, password: &str) -> Result<(), PolicyError> {
        match self.violations(password).into_iter().next() {
            Some(violation) => Err(violation),
            None => Ok(()),
        }
    }

    /// Every violation, for showing all of them at once.
    pub fn violations(&self, password: &str) -> Vec<PolicyError> {
        let s = self.settings;
        let length = password.chars().count();
        let mut errors = Vec::new();

        if length < s.min_length {
            errors.push(PolicyError::TooShort {
                min_length: s.min_length,
                actual_length: length,
            });
        }
        if length > s.max_length {
            errors.push(PolicyError::TooLong {
                max_length: s.max_length,
            });
        }
        if s.require_uppercase && !password.chars().any(char::is_uppercase) {
            errors.push(PolicyError::MissingUppercase);
        }
        if s.require_number && !password.chars().any(|c| c.is_ascii_digit()) {
            errors.push(PolicyError::MissingNumber);
        }
        if s.require_special && !password.chars().any(|c| c.is_ascii_punctuation()) {
            errors.push(PolicyError::MissingSpecial);
        }
        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strict() -> PasswordSettings {
        PasswordSettings {
            min_length: 10,
            max_length: 64,
            require_uppercase: true,
            require_number: true,
            require_special: true,
        }
    }

    #[test]
    fn test_compliant_password() {
        let settings = strict();
        assert!(PasswordPolicy::new(&settings).validate("Tr0ub4dor&3x").is_ok());
    }

    #[test]
    fn test_first_violation_reported() {
        let settings = strict();
        assert_eq!(
            PasswordPolicy::new(&settings).validate("short"),
            Err(PolicyError::TooShort {
                min_length: 10,
                actual_length: 5
            })
        );
    }

    #[test]
    fn test_all_violations_reported() {
        let settings = strict();
        let errors = PasswordPolicy::new(&settings).violations("lowercaseonly");
        assert_eq!(
            errors,
            vec![
                PolicyError::MissingUppercase,
                PolicyError::MissingNumber,
                PolicyError::MissingSpecial
            ]
        );
    }

    #[test]
    fn test_length_counts_characters_not_bytes() {
        let settings = PasswordSettings {
            min_length: 8,
            require_uppercase: false,
            require_number: false,
            ..strict()
        };
        // Eight characters, more than eight bytes.
        assert!(PasswordPolicy::new(&settings).validate("ééééééé!").is_ok());
    }

    #[test]
    fn test_too_long() {
        let settings = PasswordSettings {
            max_length: 12,
            ..strict()
        };
        assert!(matches!(
            PasswordPolicy::new(&settings).validate("Aa1!Aa1!Aa1!Aa1!"),
            Err(PolicyError::TooLong { max_length: 12 })
        ));
    }
}
