use lazy_static::lazy_static;
use regex::Regex;

use crate::auth::dto::{FieldError, RegisterRequest};

const MIN_LEN: usize = 3;

pub(crate) fn is_valid_email(email: &str) -> bool {
    lazy_static! {
        static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    }
    EMAIL_RE.is_match(email)
}

pub(crate) fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Field errors for a registration request, or `None` when it is acceptable.
pub fn validate_register(input: &RegisterRequest) -> Option<Vec<FieldError>> {
    let mut errors = Vec::new();

    if !is_valid_email(&input.email) {
        errors.push(FieldError::new("email", "invalid email"));
    }
    if input.username.chars().count() < MIN_LEN {
        errors.push(FieldError::new("username", "length must be greater than 2"));
    } else if input.username.contains('@') {
        errors.push(FieldError::new("username", "cannot include an @"));
    }
    if input.password.chars().count() < MIN_LEN {
        errors.push(FieldError::new("password", "length must be greater than 2"));
    }

    (!errors.is_empty()).then_some(errors)
}

pub fn validate_new_password(password: &str) -> Option<FieldError> {
    (password.chars().count() < MIN_LEN)
        .then(|| FieldError::new("newPassword", "length must be greater than 2"))
}
