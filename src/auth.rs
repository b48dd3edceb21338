use rocket::http::Status;
use rocket::request::{FromRequest, Outcome, Request};
use sha2::{Digest, Sha256};

use crate::config::Config;

/// Proof that the request carried the shared secret, either as a `token`
/// cookie or an `Authorization: Bearer` header. Only `/login` skips it.
pub struct ApiToken;

fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

/// Digest comparison keeps the check independent of the token length.
pub fn verify_secret(config: &Config, presented: &str) -> bool {
    !config.secret.is_empty() && hash_token(presented) == hash_token(&config.secret)
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for ApiToken {
    type Error = ();

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let config = match req.rocket().state::<Config>() {
            Some(config) => config,
            None => return Outcome::Error((Status::InternalServerError, ())),
        };

        // 1. token cookie
        if let Some(cookie) = req.cookies().get("token") {
            if verify_secret(config, cookie.value()) {
                return Outcome::Success(ApiToken);
            }
            return Outcome::Error((Status::Unauthorized, ()));
        }

        // 2. Authorization: Bearer <token>
        if let Some(auth) = req.headers().get_one("Authorization") {
            if let Some(token) = auth.strip_prefix("Bearer ") {
                if verify_secret(config, token.trim()) {
                    return Outcome::Success(ApiToken);
                }
            }
        }

        Outcome::Error((Status::Unauthorized, ()))
    }
}
