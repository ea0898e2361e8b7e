//! In-memory credential store used by tests. Mirrors the uniqueness
//! constraints of the `users` table.

use std::sync::Mutex;

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::users::{
    repo::{RepoError, UserRepository},
    repo_types::{NewUser, ProfileUpdate, User},
};

#[derive(Default)]
pub struct MemoryUserRepository {
    rows: Mutex<Vec<User>>,
}

impl MemoryUserRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UserRepository for MemoryUserRepository {
    async fn insert(&self, new: NewUser) -> Result<User, RepoError> {
        let mut rows = self.rows.lock().unwrap();
        if rows.iter().any(|u| u.email == new.email) {
            return Err(RepoError::DuplicateEmail);
        }
        if let Some(subject) = &new.external_subject_id {
            if rows
                .iter()
                .any(|u| u.external_subject_id.as_deref() == Some(subject.as_str()))
            {
                return Err(RepoError::DuplicateSubject);
            }
        }
        let now = OffsetDateTime::now_utc();
        let user = User {
            id: Uuid::new_v4(),
            email: new.email,
            password_hash: new.password_hash,
            external_subject_id: new.external_subject_id,
            display_name: new.display_name,
            avatar_url: new.avatar_url,
            provider: new.provider,
            created_at: now,
            last_login_at: now,
            updated_at: now,
        };
        rows.push(user.clone());
        Ok(user)
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<User>, RepoError> {
        let rows = self.rows.lock().unwrap();
        Ok(rows.iter().find(|u| u.email == email).cloned())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, RepoError> {
        let rows = self.rows.lock().unwrap();
        Ok(rows.iter().find(|u| u.id == id).cloned())
    }

    async fn find_by_external_subject(
        &self,
        subject_id: &str,
    ) -> Result<Option<User>, RepoError> {
        let rows = self.rows.lock().unwrap();
        Ok(rows
            .iter()
            .find(|u| u.external_subject_id.as_deref() == Some(subject_id))
            .cloned())
    }

    async fn link_external(
        &self,
        id: Uuid,
        subject_id: &str,
        profile: &ProfileUpdate,
    ) -> Result<Option<User>, RepoError> {
        let mut rows = self.rows.lock().unwrap();
        let Some(idx) = rows
            .iter()
            .position(|u| u.id == id && u.external_subject_id.is_none())
        else {
            return Ok(None);
        };
        if rows
            .iter()
            .any(|u| u.external_subject_id.as_deref() == Some(subject_id))
        {
            return Err(RepoError::DuplicateSubject);
        }
        let user = &mut rows[idx];
        user.external_subject_id = Some(subject_id.to_string());
        if user.display_name.is_none() {
            user.display_name = profile.display_name.clone();
        }
        if user.avatar_url.is_none() {
            user.avatar_url = profile.avatar_url.clone();
        }
        user.updated_at = OffsetDateTime::now_utc();
        Ok(Some(user.clone()))
    }

    async fn touch_login(&self, id: Uuid) -> Result<Option<OffsetDateTime>, RepoError> {
        let mut rows = self.rows.lock().unwrap();
        let Some(user) = rows.iter_mut().find(|u| u.id == id) else {
            return Ok(None);
        };
        let now = OffsetDateTime::now_utc();
        user.last_login_at = now;
        user.updated_at = now;
        Ok(Some(now))
    }
}
