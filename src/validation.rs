use lazy_static::lazy_static;
use regex::Regex;

use crate::error::{AppError, FieldError};

pub const MIN_PASSWORD_LEN: usize = 6;
pub const MAX_MESSAGE_CHARS: usize = 4000;

pub(crate) fn is_valid_email(email: &str) -> bool {
    lazy_static! {
        static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    }
    EMAIL_RE.is_match(email.trim())
}

fn finish(errors: Vec<FieldError>) -> Result<(), AppError> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(AppError::Validation(errors))
    }
}

pub fn validate_signup(email: &str, password: &str, confirm: &str) -> Result<(), AppError> {
    let mut errors = Vec::new();
    if !is_valid_email(email) {
        errors.push(FieldError {
            field: "email",
            message: "Please provide a valid email",
        });
    }
    if password.chars().count() < MIN_PASSWORD_LEN {
        errors.push(FieldError {
            field: "password",
            message: "Password must be at least 6 characters long",
        });
    }
    if confirm != password {
        errors.push(FieldError {
            field: "confirmPassword",
            message: "Passwords do not match",
        });
    }
    finish(errors)
}

pub fn validate_login(email: &str, password: &str) -> Result<(), AppError> {
    let mut errors = Vec::new();
    if !is_valid_email(email) {
        errors.push(FieldError {
            field: "email",
            message: "Please provide a valid email",
        });
    }
    if password.is_empty() {
        errors.push(FieldError {
            field: "password",
            message: "Password is required",
        });
    }
    finish(errors)
}

pub fn validate_assertion(assertion: &str) -> Result<(), AppError> {
    if assertion.trim().is_empty() {
        return finish(vec![FieldError {
            field: "assertion",
            message: "Identity token is required",
        }]);
    }
    Ok(())
}

pub fn validate_chat_message(message: &str) -> Result<(), AppError> {
    let trimmed = message.trim();
    if trimmed.is_empty() {
        return finish(vec![FieldError {
            field: "message",
            message: "Message cannot be empty",
        }]);
    }
    if trimmed.chars().count() > MAX_MESSAGE_CHARS {
        return finish(vec![FieldError {
            field: "message",
            message: "Message is too long (max 4000 characters)",
        }]);
    }
    Ok(())
}
