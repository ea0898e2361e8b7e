use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::users::repo_types::{NewUser, ProfileUpdate, User};

const EMAIL_CONSTRAINT: &str = "users_email_key";
const SUBJECT_CONSTRAINT: &str = "users_external_subject_id_key";

const USER_COLUMNS: &str = "id, email, password_hash, external_subject_id, display_name, \
     avatar_url, provider, created_at, last_login_at, updated_at";

#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    #[error("email already registered")]
    DuplicateEmail,
    #[error("external subject already linked")]
    DuplicateSubject,
    #[error("credential store unavailable: {0}")]
    Unavailable(#[source] sqlx::Error),
    #[error("credential store error: {0}")]
    Other(#[source] sqlx::Error),
}

impl From<sqlx::Error> for RepoError {
    fn from(e: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &e {
            if db.is_unique_violation() {
                match db.constraint() {
                    Some(EMAIL_CONSTRAINT) => return RepoError::DuplicateEmail,
                    Some(SUBJECT_CONSTRAINT) => return RepoError::DuplicateSubject,
                    _ => {}
                }
            }
        }
        match e {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                RepoError::Unavailable(e)
            }
            other => RepoError::Other(other),
        }
    }
}

/// Credential store. Every method is a single atomic statement.
#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn insert(&self, new: NewUser) -> Result<User, RepoError>;
    async fn find_by_email(&self, email: &str) -> Result<Option<User>, RepoError>;
    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, RepoError>;
    async fn find_by_external_subject(&self, subject_id: &str)
        -> Result<Option<User>, RepoError>;
    /// Sets the subject only while it is NULL. Returns `None` when nothing was updated.
    async fn link_external(
        &self,
        id: Uuid,
        subject_id: &str,
        profile: &ProfileUpdate,
    ) -> Result<Option<User>, RepoError>;
    /// Returns the new `last_login_at`, or `None` when the user does not exist.
    async fn touch_login(&self, id: Uuid) -> Result<Option<OffsetDateTime>, RepoError>;
}

#[derive(Clone)]
pub struct PgUserRepository {
    db: PgPool,
}

impl PgUserRepository {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl UserRepository for PgUserRepository {
    async fn insert(&self, new: NewUser) -> Result<User, RepoError> {
        let sql = format!(
            r#"
            INSERT INTO users (id, email, password_hash, external_subject_id,
                               display_name, avatar_url, provider)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING {USER_COLUMNS}
            "#
        );
        let user = sqlx::query_as::<_, User>(&sql)
            .bind(Uuid::new_v4())
            .bind(&new.email)
            .bind(&new.password_hash)
            .bind(&new.external_subject_id)
            .bind(&new.display_name)
            .bind(&new.avatar_url)
            .bind(new.provider.as_str())
            .fetch_one(&self.db)
            .await?;
        Ok(user)
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<User>, RepoError> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE email = $1");
        let user = sqlx::query_as::<_, User>(&sql)
            .bind(email)
            .fetch_optional(&self.db)
            .await?;
        Ok(user)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, RepoError> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1");
        let user = sqlx::query_as::<_, User>(&sql)
            .bind(id)
            .fetch_optional(&self.db)
            .await?;
        Ok(user)
    }

    async fn find_by_external_subject(
        &self,
        subject_id: &str,
    ) -> Result<Option<User>, RepoError> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE external_subject_id = $1");
        let user = sqlx::query_as::<_, User>(&sql)
            .bind(subject_id)
            .fetch_optional(&self.db)
            .await?;
        Ok(user)
    }

    async fn link_external(
        &self,
        id: Uuid,
        subject_id: &str,
        profile: &ProfileUpdate,
    ) -> Result<Option<User>, RepoError> {
        let sql = format!(
            r#"
            UPDATE users
               SET external_subject_id = $2,
                   display_name = COALESCE(display_name, $3),
                   avatar_url = COALESCE(avatar_url, $4),
                   updated_at = now()
             WHERE id = $1 AND external_subject_id IS NULL
            RETURNING {USER_COLUMNS}
            "#
        );
        let user = sqlx::query_as::<_, User>(&sql)
            .bind(id)
            .bind(subject_id)
            .bind(&profile.display_name)
            .bind(&profile.avatar_url)
            .fetch_optional(&self.db)
            .await?;
        Ok(user)
    }

    async fn touch_login(&self, id: Uuid) -> Result<Option<OffsetDateTime>, RepoError> {
        let at = sqlx::query_scalar::<_, OffsetDateTime>(
            r#"
            UPDATE users
               SET last_login_at = now(), updated_at = now()
             WHERE id = $1
            RETURNING last_login_at
            "#,
        )
        .bind(id)
        .fetch_optional(&self.db)
        .await?;
        Ok(at)
    }
}
