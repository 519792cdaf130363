use std::{sync::Arc, time::Duration};

use thiserror::Error;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::{
    auth::{
        dto::{FieldError, RegisterRequest},
        password::{hash_password, verify_password},
        repo::{CreateUserError, UserStore},
        repo_types::{NewUser, User},
        validation::{normalize_email, validate_new_password, validate_register},
    },
    cache::SessionCache,
    mail::Mailer,
    session::{RequestContext, SessionStore},
};

pub const FORGOT_PASSWORD_PREFIX: &str = "forgot-password:";

#[derive(Debug, Error)]
pub enum AuthError {
    /// Rejected input; returned to the client as data.
    #[error("request rejected")]
    Fields(Vec<FieldError>),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl AuthError {
    fn field(field: &str, message: &str) -> Self {
        Self::Fields(vec![FieldError::new(field, message)])
    }
}

impl From<crate::auth::password::PasswordError> for AuthError {
    fn from(e: crate::auth::password::PasswordError) -> Self {
        Self::Internal(e.into())
    }
}

#[derive(Debug, Clone)]
pub struct AuthSettings {
    pub forgot_password_ttl: Duration,
    pub frontend_url: String,
}

pub struct AuthService {
    users: Arc<dyn UserStore>,
    sessions: SessionStore,
    cache: Arc<dyn SessionCache>,
    mailer: Arc<dyn Mailer>,
    settings: AuthSettings,
}

impl AuthService {
    pub fn new(
        users: Arc<dyn UserStore>,
        sessions: SessionStore,
        cache: Arc<dyn SessionCache>,
        mailer: Arc<dyn Mailer>,
        settings: AuthSettings,
    ) -> Self {
        Self {
            users,
            sessions,
            cache,
            mailer,
            settings,
        }
    }

    #[instrument(skip(self, ctx, input), fields(username = %input.username))]
    pub async fn register(
        &self,
        ctx: &mut RequestContext,
        mut input: RegisterRequest,
    ) -> Result<User, AuthError> {
        input.username = input.username.trim().to_string();
        input.email = normalize_email(&input.email);

        if let Some(errors) = validate_register(&input) {
            warn!(count = errors.len(), "registration rejected by validation");
            return Err(AuthError::Fields(errors));
        }

        let password_hash = hash_password(&input.password)?;
        let user = match self
            .users
            .insert(NewUser {
                username: input.username,
                email: input.email,
                password_hash,
            })
            .await
        {
            Ok(u) => u,
            Err(CreateUserError::Conflict) => {
                warn!("username or email already registered");
                return Err(AuthError::field("username", "username already taken"));
            }
            Err(CreateUserError::Other(e)) => return Err(e.into()),
        };

        self.sessions.establish(&mut ctx.session, user.id).await?;
        info!(user_id = user.id, "user registered");
        Ok(user)
    }

    #[instrument(skip(self, ctx, password))]
    pub async fn login(
        &self,
        ctx: &mut RequestContext,
        username_or_email: &str,
        password: &str,
    ) -> Result<User, AuthError> {
        let lookup = username_or_email.trim();
        let found = if lookup.contains('@') {
            self.users.find_by_email(&normalize_email(lookup)).await?
        } else {
            self.users.find_by_username(lookup).await?
        };
        let Some(user) = found else {
            warn!("login for unknown user");
            return Err(AuthError::field("usernameOrEmail", "username doesn't exist"));
        };

        if !verify_password(&user.password_hash, password)? {
            warn!(user_id = user.id, "login invalid password");
            return Err(AuthError::field("password", "password is not valid"));
        }

        self.sessions.establish(&mut ctx.session, user.id).await?;
        info!(user_id = user.id, "user logged in");
        Ok(user)
    }

    /// The session's user, or `None` when the request is anonymous.
    #[instrument(skip(self, ctx))]
    pub async fn me(&self, ctx: &RequestContext) -> anyhow::Result<Option<User>> {
        let Some(user_id) = ctx.session.user_id() else {
            return Ok(None);
        };
        self.users.find_by_id(user_id).await
    }

    /// False only when the session entry could not be deleted.
    #[instrument(skip(self, ctx))]
    pub async fn logout(&self, ctx: &mut RequestContext) -> bool {
        let user_id = ctx.session.user_id();
        let had_session = ctx.session.id().is_some();
        match self.sessions.destroy(&mut ctx.session).await {
            Ok(()) => {
                info!(user_id = ?user_id, had_session, "user logged out");
                true
            }
            Err(e) => {
                error!(error = %e, "session destroy failed");
                false
            }
        }
    }

    /// Always true so the answer does not reveal which emails are registered.
    #[instrument(skip(self, email))]
    pub async fn forgot_password(&self, email: &str) -> anyhow::Result<bool> {
        let email = normalize_email(email);
        let Some(user) = self.users.find_by_email(&email).await? else {
            info!("password reset requested for unknown email");
            return Ok(true);
        };

        let token = Uuid::new_v4().to_string();
        self.cache
            .set(
                &format!("{FORGOT_PASSWORD_PREFIX}{token}"),
                &user.id.to_string(),
                self.settings.forgot_password_ttl,
            )
            .await?;

        let link = format!(
            "{}/change-password/{token}",
            self.settings.frontend_url.trim_end_matches('/')
        );
        let html = format!(r#"<a href="{link}">reset password</a>"#);
        if let Err(e) = self.mailer.send(&user.email, &html).await {
            error!(error = %e, user_id = user.id, "reset email not sent");
        } else {
            info!(user_id = user.id, "reset email sent");
        }
        Ok(true)
    }

    #[instrument(skip(self, ctx, token, new_password))]
    pub async fn reset_password(
        &self,
        ctx: &mut RequestContext,
        token: &str,
        new_password: &str,
    ) -> Result<User, AuthError> {
        if let Some(err) = validate_new_password(new_password) {
            return Err(AuthError::Fields(vec![err]));
        }

        let key = format!("{FORGOT_PASSWORD_PREFIX}{token}");
        let Some(raw_user_id) = self.cache.get(&key).await? else {
            return Err(AuthError::field("token", "token expired"));
        };
        let Ok(user_id) = raw_user_id.parse::<i32>() else {
            warn!("reset token maps to an unreadable user id");
            return Err(AuthError::field("token", "user no longer exists"));
        };
        let Some(user) = self.users.find_by_id(user_id).await? else {
            return Err(AuthError::field("token", "user no longer exists"));
        };

        let password_hash = hash_password(new_password)?;

        // Whoever takes the entry owns the token.
        let Some((raw_user_id, ttl_left)) = self.cache.take(&key).await? else {
            warn!(user_id, "reset token consumed concurrently");
            return Err(AuthError::field("token", "token expired"));
        };

        if let Err(e) = self
            .users
            .update_password_hash(user.id, &password_hash)
            .await
        {
            if let Err(restore) = self.cache.set(&key, &raw_user_id, ttl_left).await {
                error!(error = %restore, user_id, "reset token could not be restored");
            }
            return Err(e.into());
        }
        let user = self
            .users
            .find_by_id(user.id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("user {} vanished during password reset", user.id))?;

        self.sessions.establish(&mut ctx.session, user.id).await?;
        info!(user_id = user.id, "password reset");
        Ok(user)
    }
}
