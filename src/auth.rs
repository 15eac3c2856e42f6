use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;

/// Store-server credentials: one shared cleartext password, any user name.
/// The database name picks the tenant, not the credential.
#[derive(Debug)]
pub struct SlotgateAuthSource {
    password: Vec<u8>,
}

impl SlotgateAuthSource {
    pub fn new(password: String) -> Self {
        Self {
            password: password.into_bytes(),
        }
    }
}

#[async_trait]
impl AuthSource for SlotgateAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        tracing::debug!(
            user = login.user().unwrap_or("-"),
            database = login.database().unwrap_or("default"),
            "store login"
        );
        Ok(Password::new(None, self.password.clone()))
    }
}
