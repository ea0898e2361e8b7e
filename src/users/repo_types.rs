use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

/// How an account was created.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Local,
    Google,
    External,
}

impl Provider {
    pub fn as_str(self) -> &'static str {
        match self {
            Provider::Local => "local",
            Provider::Google => "google",
            Provider::External => "external",
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown provider: {0}")]
pub struct ProviderParseError(String);

impl TryFrom<String> for Provider {
    type Error = ProviderParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "local" => Ok(Provider::Local),
            "google" => Ok(Provider::Google),
            "external" => Ok(Provider::External),
            _ => Err(ProviderParseError(value)),
        }
    }
}

/// User record in the database.
#[derive(Debug, Clone, FromRow)]
pub struct User {
    pub id: Uuid,
    pub email: String,                       // normalized
    pub password_hash: Option<String>,       // Argon2 PHC string, never serialized
    pub external_subject_id: Option<String>, // identity provider uid
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
    #[sqlx(try_from = "String")]
    pub provider: Provider,
    pub created_at: OffsetDateTime,
    pub last_login_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Everything needed to insert a row in one statement.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: String,
    pub password_hash: Option<String>,
    pub external_subject_id: Option<String>,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
    pub provider: Provider,
}

/// Profile metadata an identity provider may supply.
#[derive(Debug, Clone, Default)]
pub struct ProfileUpdate {
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
}

/// Public part of the user returned to the client.
#[derive(Debug, Clone, Serialize)]
pub struct PublicUser {
    pub id: Uuid,
    pub email: String,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
    pub provider: Provider,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_login_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl From<User> for PublicUser {
    fn from(u: User) -> Self {
        Self {
            id: u.id,
            email: u.email,
            display_name: u.display_name,
            avatar_url: u.avatar_url,
            provider: u.provider,
            created_at: u.created_at,
            last_login_at: u.last_login_at,
            updated_at: u.updated_at,
        }
    }
}

pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}
