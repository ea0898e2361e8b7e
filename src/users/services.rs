use std::sync::Arc;

use time::OffsetDateTime;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    auth::{
        identity::ExternalIdentity,
        password::{hash_password, verify_dummy, verify_password},
    },
    error::AppError,
    users::{
        repo::{RepoError, UserRepository},
        repo_types::{normalize_email, NewUser, ProfileUpdate, Provider, User},
    },
};

/// Whether an external sign-in may create a missing account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternalAuthMode {
    SignInOrCreate,
    SignInOnly,
}

/// Input for an account created through an identity provider.
#[derive(Debug, Clone)]
pub struct NewExternalUser {
    pub email: String,
    pub subject_id: String,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
    pub provider: Provider,
}

/// User lifecycle on top of the credential store.
#[derive(Clone)]
pub struct UserService {
    repo: Arc<dyn UserRepository>,
}

impl UserService {
    pub fn new(repo: Arc<dyn UserRepository>) -> Self {
        Self { repo }
    }

    pub async fn create_local(&self, email: &str, password: &str) -> Result<User, AppError> {
        let email = normalize_email(email);
        let password_hash = hash_password(password)?;
        let user = self
            .repo
            .insert(NewUser {
                email,
                password_hash: Some(password_hash),
                external_subject_id: None,
                display_name: None,
                avatar_url: None,
                provider: Provider::Local,
            })
            .await?;
        info!(user_id = %user.id, email = %user.email, "local user created");
        Ok(user)
    }

    pub async fn create_external(&self, new: NewExternalUser) -> Result<User, AppError> {
        let user = self
            .repo
            .insert(NewUser {
                email: normalize_email(&new.email),
                password_hash: None,
                external_subject_id: Some(new.subject_id),
                display_name: new.display_name,
                avatar_url: new.avatar_url,
                provider: new.provider,
            })
            .await?;
        info!(user_id = %user.id, email = %user.email, provider = user.provider.as_str(), "external user created");
        Ok(user)
    }

    pub async fn find_by_email(&self, email: &str) -> Result<Option<User>, AppError> {
        Ok(self.repo.find_by_email(&normalize_email(email)).await?)
    }

    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, AppError> {
        Ok(self.repo.find_by_id(id).await?)
    }

    pub async fn find_by_external_subject_id(
        &self,
        subject_id: &str,
    ) -> Result<Option<User>, AppError> {
        Ok(self.repo.find_by_external_subject(subject_id).await?)
    }

    /// Unknown email, external-only account and wrong password all yield
    /// the same `InvalidCredentials`.
    pub async fn authenticate_local(&self, email: &str, password: &str) -> Result<User, AppError> {
        let Some(user) = self.find_by_email(email).await? else {
            debug!("login for unknown email");
            verify_dummy(password);
            return Err(AppError::InvalidCredentials);
        };
        let Some(hash) = user.password_hash.as_deref() else {
            debug!(user_id = %user.id, "login for account without password");
            verify_dummy(password);
            return Err(AppError::InvalidCredentials);
        };
        if !verify_password(password, hash) {
            warn!(user_id = %user.id, "login invalid password");
            return Err(AppError::InvalidCredentials);
        }
        self.record_login(user).await
    }

    /// Attaches `subject_id` only when the row has none yet.
    pub async fn link_external_identity(
        &self,
        user_id: Uuid,
        subject_id: &str,
        profile: &ProfileUpdate,
    ) -> Result<User, AppError> {
        match self.repo.link_external(user_id, subject_id, profile).await {
            Ok(Some(user)) => {
                info!(user_id = %user.id, "external identity linked");
                return Ok(user);
            }
            Ok(None) => {}
            Err(RepoError::DuplicateSubject) => {
                warn!(user_id = %user_id, "external subject already belongs to another user");
            }
            Err(e) => return Err(e.into()),
        }

        let user = self
            .find_by_id(user_id)
            .await?
            .ok_or_else(|| AppError::NotFound("User not found".into()))?;
        if user.external_subject_id.as_deref() != Some(subject_id) {
            warn!(user_id = %user.id, "user already linked to a different external subject");
        }
        Ok(user)
    }

    pub async fn touch_login(&self, user_id: Uuid) -> Result<OffsetDateTime, AppError> {
        self.repo
            .touch_login(user_id)
            .await?
            .ok_or_else(|| AppError::NotFound("User not found".into()))
    }

    /// Resolves an external sign-in to a single user, joining on email.
    /// Returns the user and whether it was created by this call.
    pub async fn resolve_external(
        &self,
        identity: &ExternalIdentity,
        hints: ProfileUpdate,
        provider: Provider,
        mode: ExternalAuthMode,
    ) -> Result<(User, bool), AppError> {
        let profile = ProfileUpdate {
            display_name: identity.display_name.clone().or(hints.display_name),
            avatar_url: identity.avatar_url.clone().or(hints.avatar_url),
        };

        if let Some(user) = self.find_by_email(&identity.email).await? {
            return Ok((self.sign_in_linked(user, identity, &profile).await?, false));
        }

        // Email changed at the provider since the account was created.
        if let Some(user) = self.find_by_external_subject_id(&identity.subject_id).await? {
            return Ok((self.record_login(user).await?, false));
        }

        if mode == ExternalAuthMode::SignInOnly {
            return Err(AppError::NotFound(
                "User not found. Please sign up first.".into(),
            ));
        }

        let created = self
            .create_external(NewExternalUser {
                email: identity.email.clone(),
                subject_id: identity.subject_id.clone(),
                display_name: profile.display_name.clone(),
                avatar_url: profile.avatar_url.clone(),
                provider,
            })
            .await;

        match created {
            Ok(user) => Ok((user, true)),
            Err(AppError::DuplicateEmail) => {
                // Lost a concurrent first sign-in for the same email.
                let user = self.find_by_email(&identity.email).await?.ok_or_else(|| {
                    AppError::Internal(anyhow::anyhow!("user vanished after duplicate insert"))
                })?;
                Ok((self.sign_in_linked(user, identity, &profile).await?, false))
            }
            Err(e) => Err(e),
        }
    }

    async fn sign_in_linked(
        &self,
        user: User,
        identity: &ExternalIdentity,
        profile: &ProfileUpdate,
    ) -> Result<User, AppError> {
        let user = if user.external_subject_id.is_none() {
            self.link_external_identity(user.id, &identity.subject_id, profile)
                .await?
        } else {
            user
        };
        self.record_login(user).await
    }

    async fn record_login(&self, mut user: User) -> Result<User, AppError> {
        let at = self.touch_login(user.id).await?;
        user.last_login_at = at;
        user.updated_at = at;
        Ok(user)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Instant;

    use async_trait::async_trait;

    use super::*;
    use crate::users::memory::MemoryUserRepository;

    fn service() -> UserService {
        UserService::new(Arc::new(MemoryUserRepository::new()))
    }

    fn identity(subject: &str, email: &str) -> ExternalIdentity {
        ExternalIdentity {
            subject_id: subject.into(),
            email: email.into(),
            display_name: Some("Bob".into()),
            avatar_url: None,
            sign_in_provider: Some("password".into()),
        }
    }

    #[tokio::test]
    async fn create_then_authenticate_returns_same_user() {
        let svc = service();
        let created = svc.create_local("alice@example.com", "secret1").await.unwrap();
        assert_eq!(created.provider, Provider::Local);
        assert!(created.password_hash.is_some());

        let authed = svc
            .authenticate_local("alice@example.com", "secret1")
            .await
            .unwrap();
        assert_eq!(authed.id, created.id);
        assert!(authed.last_login_at >= created.last_login_at);
    }

    #[tokio::test]
    async fn email_is_normalized_on_write_and_lookup() {
        let svc = service();
        let created = svc.create_local("  Alice@Example.com ", "secret1").await.unwrap();
        assert_eq!(created.email, "alice@example.com");
        let found = svc.find_by_email("ALICE@example.COM").await.unwrap().unwrap();
        assert_eq!(found.id, created.id);
        assert_eq!(svc.find_by_id(created.id).await.unwrap().unwrap().id, created.id);
    }

    #[tokio::test]
    async fn duplicate_normalized_email_is_rejected() {
        let svc = service();
        svc.create_local("alice@example.com", "secret1").await.unwrap();
        let err = svc
            .create_local(" ALICE@example.com", "other-password")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::DuplicateEmail));
    }

    #[tokio::test]
    async fn wrong_password_and_unknown_email_look_the_same() {
        let svc = service();
        svc.create_local("alice@example.com", "secret1").await.unwrap();

        let wrong = svc
            .authenticate_local("alice@example.com", "secret2")
            .await
            .unwrap_err();
        let missing = svc
            .authenticate_local("nobody@example.com", "secret1")
            .await
            .unwrap_err();
        assert!(matches!(wrong, AppError::InvalidCredentials));
        assert!(matches!(missing, AppError::InvalidCredentials));
        assert_eq!(wrong.to_string(), missing.to_string());
    }

    #[tokio::test]
    async fn external_only_account_cannot_password_login() {
        let svc = service();
        svc.resolve_external(
            &identity("uid-1", "bob@example.com"),
            ProfileUpdate::default(),
            Provider::External,
            ExternalAuthMode::SignInOrCreate,
        )
        .await
        .unwrap();
        let err = svc
            .authenticate_local("bob@example.com", "")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidCredentials));
    }

    #[tokio::test]
    async fn external_login_with_new_email_creates_external_row() {
        let svc = service();
        let (user, created) = svc
            .resolve_external(
                &identity("uid-1", "bob@example.com"),
                ProfileUpdate::default(),
                Provider::External,
                ExternalAuthMode::SignInOrCreate,
            )
            .await
            .unwrap();
        assert!(created);
        assert_eq!(user.provider, Provider::External);
        assert!(user.password_hash.is_none());
        assert_eq!(user.external_subject_id.as_deref(), Some("uid-1"));
        assert_eq!(user.display_name.as_deref(), Some("Bob"));
    }

    #[tokio::test]
    async fn external_login_with_local_email_links_in_place() {
        let svc = service();
        let local = svc.create_local("carol@example.com", "secret1").await.unwrap();
        let (user, created) = svc
            .resolve_external(
                &identity("uid-9", "Carol@Example.com"),
                ProfileUpdate::default(),
                Provider::Google,
                ExternalAuthMode::SignInOrCreate,
            )
            .await
            .unwrap();
        assert!(!created);
        assert_eq!(user.id, local.id);
        assert_eq!(user.provider, Provider::Local);
        assert_eq!(user.external_subject_id.as_deref(), Some("uid-9"));
        assert!(user.password_hash.is_some());

        // Password login keeps working after the link.
        let authed = svc
            .authenticate_local("carol@example.com", "secret1")
            .await
            .unwrap();
        assert_eq!(authed.id, local.id);
    }

    #[tokio::test]
    async fn second_subject_for_same_email_returns_original_row() {
        let svc = service();
        let (first, _) = svc
            .resolve_external(
                &identity("uid-1", "bob@example.com"),
                ProfileUpdate::default(),
                Provider::External,
                ExternalAuthMode::SignInOrCreate,
            )
            .await
            .unwrap();
        let (second, created) = svc
            .resolve_external(
                &identity("uid-2", "bob@example.com"),
                ProfileUpdate::default(),
                Provider::External,
                ExternalAuthMode::SignInOrCreate,
            )
            .await
            .unwrap();
        assert!(!created);
        assert_eq!(second.id, first.id);
        assert_eq!(second.external_subject_id.as_deref(), Some("uid-1"));
    }

    #[tokio::test]
    async fn subject_lookup_covers_changed_email() {
        let svc = service();
        let (first, _) = svc
            .resolve_external(
                &identity("uid-1", "old@example.com"),
                ProfileUpdate::default(),
                Provider::External,
                ExternalAuthMode::SignInOrCreate,
            )
            .await
            .unwrap();
        let (again, created) = svc
            .resolve_external(
                &identity("uid-1", "new@example.com"),
                ProfileUpdate::default(),
                Provider::External,
                ExternalAuthMode::SignInOnly,
            )
            .await
            .unwrap();
        assert!(!created);
        assert_eq!(again.id, first.id);
    }

    #[tokio::test]
    async fn sign_in_only_does_not_create() {
        let svc = service();
        let err = svc
            .resolve_external(
                &identity("uid-1", "dave@example.com"),
                ProfileUpdate::default(),
                Provider::External,
                ExternalAuthMode::SignInOnly,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
        assert!(svc.find_by_email("dave@example.com").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn profile_hints_fill_missing_claims() {
        let svc = service();
        let mut id = identity("uid-1", "erin@example.com");
        id.display_name = None;
        let (user, _) = svc
            .resolve_external(
                &id,
                ProfileUpdate {
                    display_name: Some("Erin".into()),
                    avatar_url: Some("https://example.com/erin.png".into()),
                },
                Provider::Google,
                ExternalAuthMode::SignInOrCreate,
            )
            .await
            .unwrap();
        assert_eq!(user.provider, Provider::Google);
        assert_eq!(user.display_name.as_deref(), Some("Erin"));
        assert_eq!(user.avatar_url.as_deref(), Some("https://example.com/erin.png"));
    }

    #[tokio::test]
    async fn link_is_idempotent_for_same_subject() {
        let svc = service();
        let local = svc.create_local("frank@example.com", "secret1").await.unwrap();
        let profile = ProfileUpdate::default();
        let once = svc
            .link_external_identity(local.id, "uid-f", &profile)
            .await
            .unwrap();
        let twice = svc
            .link_external_identity(local.id, "uid-f", &profile)
            .await
            .unwrap();
        assert_eq!(once.external_subject_id.as_deref(), Some("uid-f"));
        assert_eq!(twice.external_subject_id.as_deref(), Some("uid-f"));
        assert_eq!(
            svc.find_by_external_subject_id("uid-f").await.unwrap().unwrap().id,
            local.id
        );
    }

    #[tokio::test]
    async fn link_never_overwrites_existing_subject() {
        let svc = service();
        let local = svc.create_local("gina@example.com", "secret1").await.unwrap();
        let profile = ProfileUpdate::default();
        svc.link_external_identity(local.id, "uid-a", &profile)
            .await
            .unwrap();
        let user = svc
            .link_external_identity(local.id, "uid-b", &profile)
            .await
            .unwrap();
        assert_eq!(user.external_subject_id.as_deref(), Some("uid-a"));
    }

    #[tokio::test]
    async fn touch_login_advances_timestamps() {
        let svc = service();
        let user = svc.create_local("hank@example.com", "secret1").await.unwrap();
        let at = svc.touch_login(user.id).await.unwrap();
        assert!(at >= user.last_login_at);
        let reloaded = svc.find_by_id(user.id).await.unwrap().unwrap();
        assert_eq!(reloaded.last_login_at, at);
        assert_eq!(reloaded.updated_at, at);
        assert_eq!(reloaded.created_at, user.created_at);
    }

    #[tokio::test]
    async fn touch_login_for_missing_user_is_not_found() {
        let err = service().touch_login(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    /// Delegates to the in-memory store, except that the next email lookup
    /// can be made to miss, as if another request inserted the row just after.
    struct LateEmailRepository {
        inner: MemoryUserRepository,
        miss_next_email_lookup: AtomicBool,
    }

    #[async_trait]
    impl UserRepository for LateEmailRepository {
        async fn insert(&self, new: NewUser) -> Result<User, RepoError> {
            self.inner.insert(new).await
        }

        async fn find_by_email(&self, email: &str) -> Result<Option<User>, RepoError> {
            if self.miss_next_email_lookup.swap(false, Ordering::SeqCst) {
                return Ok(None);
            }
            self.inner.find_by_email(email).await
        }

        async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, RepoError> {
            self.inner.find_by_id(id).await
        }

        async fn find_by_external_subject(
            &self,
            subject_id: &str,
        ) -> Result<Option<User>, RepoError> {
            self.inner.find_by_external_subject(subject_id).await
        }

        async fn link_external(
            &self,
            id: Uuid,
            subject_id: &str,
            profile: &ProfileUpdate,
        ) -> Result<Option<User>, RepoError> {
            self.inner.link_external(id, subject_id, profile).await
        }

        async fn touch_login(&self, id: Uuid) -> Result<Option<OffsetDateTime>, RepoError> {
            self.inner.touch_login(id).await
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_signups_with_one_email_create_one_row() {
        let svc = service();
        let a = tokio::spawn({
            let svc = svc.clone();
            async move { svc.create_local("hana@example.com", "secret1").await }
        });
        let b = tokio::spawn({
            let svc = svc.clone();
            async move { svc.create_local("HANA@example.com", "secret2").await }
        });
        let (a, b) = (a.await.unwrap(), b.await.unwrap());

        let results = [a, b];
        let created: Vec<&User> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
        let duplicates = results
            .iter()
            .filter(|r| matches!(r, Err(AppError::DuplicateEmail)))
            .count();
        assert_eq!(created.len(), 1);
        assert_eq!(duplicates, 1);

        let stored = svc.find_by_email("hana@example.com").await.unwrap().unwrap();
        assert_eq!(stored.id, created[0].id);
    }

    #[tokio::test]
    async fn external_insert_losing_race_signs_in_existing_row() {
        let repo = Arc::new(LateEmailRepository {
            inner: MemoryUserRepository::new(),
            miss_next_email_lookup: AtomicBool::new(false),
        });
        let svc = UserService::new(repo.clone());
        let local = svc.create_local("gina@example.com", "secret1").await.unwrap();

        repo.miss_next_email_lookup.store(true, Ordering::SeqCst);
        let (user, created) = svc
            .resolve_external(
                &identity("uid-g", "gina@example.com"),
                ProfileUpdate::default(),
                Provider::External,
                ExternalAuthMode::SignInOrCreate,
            )
            .await
            .unwrap();

        assert!(!created);
        assert_eq!(user.id, local.id);
        assert_eq!(user.external_subject_id.as_deref(), Some("uid-g"));
        let by_subject = svc.find_by_external_subject_id("uid-g").await.unwrap().unwrap();
        assert_eq!(by_subject.id, local.id);
    }

    #[tokio::test]
    async fn unknown_email_pays_for_a_password_check() {
        let svc = service();
        svc.create_local("ivan@example.com", "secret1").await.unwrap();
        // Warm both paths.
        let _ = svc.authenticate_local("nobody@example.com", "secret1").await;
        let _ = svc.authenticate_local("ivan@example.com", "wrong-one").await;

        let started = Instant::now();
        let _ = svc.authenticate_local("ivan@example.com", "wrong-two").await;
        let wrong_password = started.elapsed();

        let started = Instant::now();
        let _ = svc.authenticate_local("nobody@example.com", "secret1").await;
        let unknown_email = started.elapsed();

        assert!(
            unknown_email * 4 >= wrong_password,
            "unknown email took {unknown_email:?}, wrong password took {wrong_password:?}"
        );
    }
}
