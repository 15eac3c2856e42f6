use axum::http::HeaderMap;
use axum::http::header::COOKIE;

use crate::model::{Token, ValidationError};

pub const TOKEN_COOKIE: &str = "slot_token";

/// Thirty days.
const TOKEN_MAX_AGE_SECONDS: u32 = 30 * 24 * 60 * 60;

/// Raw value of the first `name` cookie across every `Cookie` header.
pub fn cookie_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|header| header.split(';'))
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| key.trim() == name)
        .map(|(_, value)| value.trim().trim_matches('"'))
}

/// The caller's token. `MissingToken` when no cookie was sent, `MalformedToken` when one was
/// sent but does not parse.
pub fn read_token(headers: &HeaderMap) -> Result<Token, ValidationError> {
    match cookie_value(headers, TOKEN_COOKIE) {
        Some(raw) => Token::parse(raw),
        None => Err(ValidationError::MissingToken),
    }
}

/// `Set-Cookie` value binding `token` to this client.
pub fn token_cookie(token: &Token, secure: bool) -> String {
    let mut cookie = format!(
        "{TOKEN_COOKIE}={token}; Path=/; Max-Age={TOKEN_MAX_AGE_SECONDS}; HttpOnly; SameSite=Lax"
    );
    if secure {
        cookie.push_str("; Secure");
    }
    cookie
}
