use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;

use crate::model::Identity;

/// Who is asking. `None` means the caller is not signed in.
pub trait IdentityProvider: Send + Sync {
    fn current_requester(&self) -> Option<Identity>;
}

impl IdentityProvider for Option<Identity> {
    fn current_requester(&self) -> Option<Identity> {
        self.clone()
    }
}

impl IdentityProvider for Identity {
    fn current_requester(&self) -> Option<Identity> {
        Some(self.clone())
    }
}

/// Identity of one wire session: the startup `user`, unless it is the
/// shared anonymous login or blank.
#[derive(Debug, Clone)]
pub struct SessionIdentity {
    user: Option<String>,
    anonymous_user: String,
}

impl SessionIdentity {
    pub fn new(user: Option<String>, anonymous_user: impl Into<String>) -> Self {
        Self {
            user,
            anonymous_user: anonymous_user.into(),
        }
    }
}

impl IdentityProvider for SessionIdentity {
    fn current_requester(&self) -> Option<Identity> {
        let user = self.user.as_deref()?.trim();
        if user.is_empty() || user == self.anonymous_user {
            return None;
        }
        Some(Identity::new(user))
    }
}

/// Shared-password check for the pgwire startup handshake.
#[derive(Debug)]
pub struct FleetAuthSource {
    password: String,
}

impl FleetAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for FleetAuthSource {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}
