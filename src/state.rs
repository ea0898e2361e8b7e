use std::sync::Arc;

use jsonwebtoken::{Algorithm, DecodingKey};

use crate::{
    auth::{
        identity::{FirebaseVerifier, IdentityVerifier},
        jwt::JwtKeys,
    },
    chat::services::ChatClient,
    config::AppConfig,
    db,
    users::{repo::PgUserRepository, services::UserService},
};

const STATIC_KID: &str = "local";

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub users: UserService,
    pub tokens: JwtKeys,
    pub identity: Arc<dyn IdentityVerifier>,
    pub chat: ChatClient,
}

impl AppState {
    pub async fn init() -> anyhow::Result<Self> {
        let config = Arc::new(AppConfig::from_env()?);

        let pool = db::connect(&config.database).await?;
        db::migrate(&pool).await?;

        let identity = match &config.identity_static_secret {
            Some(secret) => {
                tracing::warn!("using static identity key; do not enable in production");
                Arc::new(FirebaseVerifier::new_with_static_key(
                    &config.firebase_project_id,
                    STATIC_KID,
                    Algorithm::HS256,
                    DecodingKey::from_secret(secret.as_bytes()),
                )?) as Arc<dyn IdentityVerifier>
            }
            None => Arc::new(FirebaseVerifier::new(&config.firebase_project_id)?)
                as Arc<dyn IdentityVerifier>,
        };

        Self::from_parts(
            config,
            UserService::new(Arc::new(PgUserRepository::new(pool))),
            identity,
        )
    }

    pub fn from_parts(
        config: Arc<AppConfig>,
        users: UserService,
        identity: Arc<dyn IdentityVerifier>,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            tokens: JwtKeys::new(&config.jwt),
            chat: ChatClient::new(&config.chat, &config.frontend_url)?,
            config,
            users,
            identity,
        })
    }

    /// State backed by the in-memory store and a verifier that trusts
    /// assertions of the form `subject:email`.
    #[cfg(test)]
    pub fn for_tests() -> Self {
        use crate::auth::identity::{ExternalIdentity, VerificationError};
        use crate::users::memory::MemoryUserRepository;
        use async_trait::async_trait;

        struct FakeVerifier;
        #[async_trait]
        impl IdentityVerifier for FakeVerifier {
            async fn verify(
                &self,
                assertion: &str,
            ) -> Result<ExternalIdentity, VerificationError> {
                let (subject, email) = assertion
                    .split_once(':')
                    .ok_or_else(|| VerificationError::Untrusted("unsigned".into()))?;
                Ok(ExternalIdentity {
                    subject_id: subject.to_string(),
                    email: email.to_string(),
                    display_name: None,
                    avatar_url: None,
                    sign_in_provider: None,
                })
            }
        }

        Self::from_parts(
            Arc::new(AppConfig::test_default()),
            UserService::new(Arc::new(MemoryUserRepository::new())),
            Arc::new(FakeVerifier),
        )
        .expect("test state")
    }
}
