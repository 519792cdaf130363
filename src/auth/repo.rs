use anyhow::Context;
use async_trait::async_trait;
use sqlx::PgPool;
use thiserror::Error;

use crate::auth::repo_types::{NewUser, User};

#[derive(Debug, Error)]
pub enum CreateUserError {
    /// Username or email already taken.
    #[error("user already exists")]
    Conflict,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Credential store.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find_by_email(&self, email: &str) -> anyhow::Result<Option<User>>;
    async fn find_by_username(&self, username: &str) -> anyhow::Result<Option<User>>;
    async fn find_by_id(&self, id: i32) -> anyhow::Result<Option<User>>;
    async fn insert(&self, user: NewUser) -> Result<User, CreateUserError>;
    async fn update_password_hash(&self, id: i32, password_hash: &str) -> anyhow::Result<()>;
}

const USER_COLUMNS: &str = "id, username, email, password_hash, created_at, updated_at";

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().is_some_and(|code| code == "23505"),
        _ => false,
    }
}

#[derive(Clone)]
pub struct PgUserStore {
    db: PgPool,
}

impl PgUserStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    async fn find_one(&self, column: &str, value: &str) -> anyhow::Result<Option<User>> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE {column} = $1");
        let user = sqlx::query_as::<_, User>(&sql)
            .bind(value)
            .fetch_optional(&self.db)
            .await
            .with_context(|| format!("find user by {column}"))?;
        Ok(user)
    }
}

#[async_trait]
impl UserStore for PgUserStore {
    async fn find_by_email(&self, email: &str) -> anyhow::Result<Option<User>> {
        self.find_one("email", email).await
    }

    async fn find_by_username(&self, username: &str) -> anyhow::Result<Option<User>> {
        self.find_one("username", username).await
    }

    async fn find_by_id(&self, id: i32) -> anyhow::Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.db)
        .await
        .context("find user by id")?;
        Ok(user)
    }

    async fn insert(&self, user: NewUser) -> Result<User, CreateUserError> {
        let res = sqlx::query_as::<_, User>(&format!(
            r#"
            INSERT INTO users (username, email, password_hash)
            VALUES ($1, $2, $3)
            RETURNING {USER_COLUMNS}
            "#
        ))
        .bind(&user.username)
        .bind(&user.email)
        .bind(&user.password_hash)
        .fetch_one(&self.db)
        .await;

        match res {
            Ok(u) => Ok(u),
            Err(e) if is_unique_violation(&e) => Err(CreateUserError::Conflict),
            Err(e) => Err(anyhow::Error::new(e).context("insert user").into()),
        }
    }

    async fn update_password_hash(&self, id: i32, password_hash: &str) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            UPDATE users
            SET password_hash = $2, updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(password_hash)
        .execute(&self.db)
        .await
        .context("update password hash")?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use time::OffsetDateTime;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Mutex;

    /// In-memory store enforcing the same uniqueness rules as the table.
    #[derive(Default)]
    pub struct MemoryUserStore {
        users: Mutex<Vec<User>>,
        fail_next_update: AtomicBool,
    }

    #[async_trait]
    impl UserStore for MemoryUserStore {
        async fn find_by_email(&self, email: &str) -> anyhow::Result<Option<User>> {
            Ok(self.users.lock().await.iter().find(|u| u.email == email).cloned())
        }

        async fn find_by_username(&self, username: &str) -> anyhow::Result<Option<User>> {
            Ok(self
                .users
                .lock()
                .await
                .iter()
                .find(|u| u.username == username)
                .cloned())
        }

        async fn find_by_id(&self, id: i32) -> anyhow::Result<Option<User>> {
            Ok(self.users.lock().await.iter().find(|u| u.id == id).cloned())
        }

        async fn insert(&self, user: NewUser) -> Result<User, CreateUserError> {
            let mut users = self.users.lock().await;
            if users
                .iter()
                .any(|u| u.username == user.username || u.email == user.email)
            {
                return Err(CreateUserError::Conflict);
            }
            let now = OffsetDateTime::now_utc();
            let created = User {
                id: users.len() as i32 + 1,
                username: user.username,
                email: user.email,
                password_hash: user.password_hash,
                created_at: now,
                updated_at: now,
            };
            users.push(created.clone());
            Ok(created)
        }

        async fn update_password_hash(&self, id: i32, password_hash: &str) -> anyhow::Result<()> {
            if self.fail_next_update.swap(false, Ordering::SeqCst) {
                anyhow::bail!("update failed");
            }
            let mut users = self.users.lock().await;
            let user = users
                .iter_mut()
                .find(|u| u.id == id)
                .ok_or_else(|| anyhow::anyhow!("user {id} not found"))?;
            user.password_hash = password_hash.to_string();
            user.updated_at = OffsetDateTime::now_utc();
            Ok(())
        }
    }

    impl MemoryUserStore {
        pub async fn remove(&self, id: i32) {
            self.users.lock().await.retain(|u| u.id != id);
        }

        /// Makes the next `update_password_hash` call fail.
        pub fn fail_next_update(&self) {
            self.fail_next_update.store(true, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_user(name: &str) -> NewUser {
        NewUser {
            username: name.into(),
            email: format!("{name}@example.com"),
            password_hash: "$argon2id$placeholder".into(),
        }
    }

    #[test]
    fn non_database_errors_are_not_unique_violations() {
        assert!(!is_unique_violation(&sqlx::Error::RowNotFound));
        assert!(!is_unique_violation(&sqlx::Error::PoolTimedOut));
    }

    #[tokio::test]
    async fn pg_store_classifies_duplicates_when_database_available() {
        let Ok(url) = std::env::var("DATABASE_URL") else {
            return;
        };
        let Ok(db) = PgPool::connect(&url).await else {
            return;
        };
        sqlx::migrate!("./migrations").run(&db).await.unwrap();
        let store = PgUserStore::new(db);
        let name = format!("u{}", &uuid::Uuid::new_v4().simple().to_string()[..12]);

        let created = store.insert(new_user(&name)).await.unwrap();
        assert_eq!(created.username, name);
        assert!(matches!(
            store.insert(new_user(&name)).await,
            Err(CreateUserError::Conflict)
        ));

        store.update_password_hash(created.id, "$argon2id$other").await.unwrap();
        let reloaded = store.find_by_id(created.id).await.unwrap().unwrap();
        assert_eq!(reloaded.password_hash, "$argon2id$other");
        assert!(reloaded.updated_at >= created.updated_at);
        assert!(store
            .find_by_email(&format!("{name}@example.com"))
            .await
            .unwrap()
            .is_some());
    }
}
