use serde::{Deserialize, Serialize};

use crate::users::repo_types::{ProfileUpdate, PublicUser};

/// Request body for user registration.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignupRequest {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub confirm_password: String,
}

/// Request body for login.
#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
}

/// Request body for every external-provider endpoint.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalAuthRequest {
    #[serde(default, alias = "firebaseToken")]
    pub assertion: String,
    #[serde(default, alias = "user")]
    pub profile_hints: Option<ProfileHints>,
}

/// Client-side profile data, used only where the verified token has none.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileHints {
    pub display_name: Option<String>,
    #[serde(alias = "photoURL")]
    pub avatar_url: Option<String>,
}

impl From<Option<ProfileHints>> for ProfileUpdate {
    fn from(hints: Option<ProfileHints>) -> Self {
        let hints = hints.unwrap_or_default();
        Self {
            display_name: hints.display_name.filter(|s| !s.trim().is_empty()),
            avatar_url: hints.avatar_url.filter(|s| !s.trim().is_empty()),
        }
    }
}

/// Response returned after signup, login or external sign-in.
#[derive(Debug, Serialize)]
pub struct AuthResponse {
    pub message: &'static str,
    pub token: String,
    pub user: PublicUser,
}

/// Response for GET /auth/me.
#[derive(Debug, Serialize)]
pub struct MeResponse {
    pub user: PublicUser,
}
