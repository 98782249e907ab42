//! A user pool with salted password hashes and opaque, clock-bound session tokens.

use super::{Expire, IdSequence, Store};
use crate::clock::{SimEnv, TimestampMs, duration_ms};
use crate::helpers::content_hash;
use crate::testing::Resettable;
use crate::traits::{AuthIO, AuthTokens, CloudError, CloudResult, ResourceId, SignUp, TokenClaims, User};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::{debug, info};

pub const MIN_PASSWORD_LEN: usize = 8;
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(60 * 60);
pub const REFRESH_TOKEN_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

#[derive(Debug)]
struct StoredUser {
    user: User,
    salt: String,
    password_hash: String,
}

#[derive(Debug, Clone)]
struct Session {
    username: String,
    issued_at: TimestampMs,
    expires_at: TimestampMs,
    refresh_token: String,
    refresh_expires_at: TimestampMs,
}

#[derive(Debug, Default)]
pub struct AuthState {
    users: BTreeMap<String, StoredUser>,
    /// Keyed by access token.
    sessions: HashMap<String, Session>,
    /// Refresh token to access token.
    refresh_index: HashMap<String, String>,
    counter: IdSequence,
}

impl AuthState {
    fn user_mut(&mut self, username: &str) -> CloudResult<&mut StoredUser> {
        self.users
            .get_mut(username)
            .ok_or_else(|| CloudError::not_found(user_id(username)))
    }

    fn revoke_user_sessions(&mut self, username: &str) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, s| s.username != username);
        let sessions = &self.sessions;
        self.refresh_index.retain(|_, access| sessions.contains_key(access));
        before - self.sessions.len()
    }

    fn issue(&mut self, username: &str, now: TimestampMs, ttl: Duration) -> AuthTokens {
        let n = self.counter.next_number();
        let access_token = content_hash(format!("access:{username}:{n}:{now}").as_bytes());
        let refresh_token = content_hash(format!("refresh:{username}:{n}:{now}").as_bytes());
        let expires_at = now + duration_ms(ttl);
        self.sessions.insert(
            access_token.clone(),
            Session {
                username: username.to_string(),
                issued_at: now,
                expires_at,
                refresh_token: refresh_token.clone(),
                refresh_expires_at: now + duration_ms(REFRESH_TOKEN_TTL),
            },
        );
        self.refresh_index
            .insert(refresh_token.clone(), access_token.clone());
        AuthTokens {
            access_token,
            refresh_token,
            expires_at,
        }
    }
}

impl Expire for AuthState {
    fn expire(&mut self, now: TimestampMs) {
        let before = self.sessions.len();
        self.sessions.retain(|_, s| s.refresh_expires_at > now);
        if self.sessions.len() < before {
            let sessions = &self.sessions;
            self.refresh_index.retain(|_, access| sessions.contains_key(access));
            debug!(expired = before - self.sessions.len(), "sessions expired");
        }
    }
}

fn user_id(username: &str) -> ResourceId {
    ResourceId::new("user", username)
}

fn hash_password(salt: &str, password: &str) -> String {
    content_hash(format!("{salt}{password}").as_bytes())
}

fn bad_credentials() -> CloudError {
    CloudError::validation("incorrect username or password")
}

fn validate_username(username: &str) -> CloudResult<()> {
    if username.is_empty() || username.len() > 128 || username.chars().any(char::is_whitespace) {
        return Err(CloudError::validation(
            "username must be 1 to 128 characters without whitespace",
        ));
    }
    Ok(())
}

// ============================================================================
// FakeAuthIO
// ============================================================================

#[derive(Clone)]
pub struct FakeAuthIO {
    store: Store<AuthState>,
    env: SimEnv,
    token_ttl: Duration,
}

impl FakeAuthIO {
    #[must_use]
    pub fn new() -> Self {
        Self::with_env(SimEnv::default())
    }

    #[must_use]
    pub fn with_env(env: SimEnv) -> Self {
        Self::with_store(Store::default(), env)
    }

    #[must_use]
    pub fn with_store(store: Store<AuthState>, env: SimEnv) -> Self {
        store.register_sweeper(&env);
        Self {
            store,
            env,
            token_ttl: DEFAULT_TOKEN_TTL,
        }
    }

    /// Lifetime of access tokens issued from now on.
    #[must_use]
    pub fn with_token_ttl(mut self, ttl: Duration) -> Self {
        self.token_ttl = ttl;
        self
    }

    #[must_use]
    pub fn store(&self) -> Store<AuthState> {
        self.store.clone()
    }
}

impl Default for FakeAuthIO {
    fn default() -> Self {
        Self::new()
    }
}

impl Resettable for FakeAuthIO {
    fn reset(&self) {
        *self.store.lock() = AuthState::default();
    }
}

impl AuthIO for FakeAuthIO {
    fn sign_up(&self, request: SignUp) -> CloudResult<User> {
        validate_username(&request.username)?;
        if request.password.chars().count() < MIN_PASSWORD_LEN {
            return Err(CloudError::validation(format!(
                "password must be at least {MIN_PASSWORD_LEN} characters"
            )));
        }
        let now = self.env.enter("auth.sign_up")?;
        let mut state = self.store.lock_at(now);
        if state.users.contains_key(&request.username) {
            return Err(CloudError::already_exists(user_id(&request.username)));
        }

        let n = state.counter.next_number();
        let salt = content_hash(format!("salt:{}:{n}:{now}", request.username).as_bytes())[..16].to_string();
        let user = User {
            username: request.username.clone(),
            attributes: request.attributes,
            enabled: true,
            created_at: now,
        };
        state.users.insert(
            request.username,
            StoredUser {
                user: user.clone(),
                password_hash: hash_password(&salt, &request.password),
                salt,
            },
        );
        info!(username = %user.username, "user signed up");
        Ok(user)
    }

    fn sign_in(&self, username: &str, password: &str) -> CloudResult<AuthTokens> {
        let now = self.env.enter("auth.sign_in")?;
        let mut state = self.store.lock_at(now);
        let stored = state.users.get(username).ok_or_else(bad_credentials)?;
        if hash_password(&stored.salt, password) != stored.password_hash {
            return Err(bad_credentials());
        }
        if !stored.user.enabled {
            return Err(CloudError::validation(format!("user {username} is disabled")));
        }
        let tokens = state.issue(username, now, self.token_ttl);
        debug!(username, "user signed in");
        Ok(tokens)
    }

    fn verify_token(&self, access_token: &str) -> CloudResult<TokenClaims> {
        let now = self.env.enter("auth.verify_token")?;
        let state = self.store.lock_at(now);
        let session = state
            .sessions
            .get(access_token)
            .ok_or_else(|| CloudError::validation("unknown or revoked access token"))?;
        if now >= session.expires_at {
            return Err(CloudError::validation("access token has expired"));
        }
        Ok(TokenClaims {
            username: session.username.clone(),
            issued_at: session.issued_at,
            expires_at: session.expires_at,
        })
    }

    fn refresh(&self, refresh_token: &str) -> CloudResult<AuthTokens> {
        let now = self.env.enter("auth.refresh")?;
        let mut state = self.store.lock_at(now);
        let access = state
            .refresh_index
            .remove(refresh_token)
            .ok_or_else(|| CloudError::validation("unknown or revoked refresh token"))?;
        let session = state
            .sessions
            .remove(&access)
            .ok_or_else(|| CloudError::validation("unknown or revoked refresh token"))?;

        let enabled = state
            .users
            .get(&session.username)
            .is_some_and(|u| u.user.enabled);
        if !enabled {
            return Err(CloudError::validation(format!(
                "user {} is disabled or deleted",
                session.username
            )));
        }
        let tokens = state.issue(&session.username, now, self.token_ttl);
        debug!(username = %session.username, "tokens refreshed");
        Ok(tokens)
    }

    fn sign_out(&self, access_token: &str) -> CloudResult<()> {
        let now = self.env.enter("auth.sign_out")?;
        let mut state = self.store.lock_at(now);
        let session = state
            .sessions
            .remove(access_token)
            .ok_or_else(|| CloudError::validation("unknown or revoked access token"))?;
        state.refresh_index.remove(&session.refresh_token);
        debug!(username = %session.username, "user signed out");
        Ok(())
    }

    fn get_user(&self, username: &str) -> CloudResult<User> {
        let now = self.env.enter("auth.get_user")?;
        let mut state = self.store.lock_at(now);
        Ok(state.user_mut(username)?.user.clone())
    }

    fn update_user_attributes(
        &self,
        username: &str,
        attributes: BTreeMap<String, String>,
    ) -> CloudResult<User> {
        let now = self.env.enter("auth.update_user_attributes")?;
        let mut state = self.store.lock_at(now);
        let stored = state.user_mut(username)?;
        stored.user.attributes.extend(attributes);
        debug!(username, "user attributes updated");
        Ok(stored.user.clone())
    }

    fn set_user_enabled(&self, username: &str, enabled: bool) -> CloudResult<User> {
        let now = self.env.enter("auth.set_user_enabled")?;
        let mut state = self.store.lock_at(now);
        let stored = state.user_mut(username)?;
        stored.user.enabled = enabled;
        let user = stored.user.clone();
        if !enabled {
            let revoked = state.revoke_user_sessions(username);
            info!(username, revoked, "user disabled");
        } else {
            info!(username, "user enabled");
        }
        Ok(user)
    }

    fn delete_user(&self, username: &str) -> CloudResult<()> {
        let now = self.env.enter("auth.delete_user")?;
        let mut state = self.store.lock_at(now);
        state
            .users
            .remove(username)
            .ok_or_else(|| CloudError::not_found(user_id(username)))?;
        state.revoke_user_sessions(username);
        info!(username, "user deleted");
        Ok(())
    }

    fn list_users(&self) -> CloudResult<Vec<User>> {
        let now = self.env.enter("auth.list_users")?;
        let state = self.store.lock_at(now);
        Ok(state.users.values().map(|u| u.user.clone()).collect())
    }
}
