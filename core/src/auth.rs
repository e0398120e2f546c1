//! Credential signers attached to every resolved request.
//!
//! The connection treats credentials as opaque: it only asks them to
//! authorize a request that is otherwise fully built.

use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::http::HttpRequest;

/// Something that can sign or authorize an outgoing request.
pub trait Credentials: fmt::Debug + Send + Sync {
    fn authorize(&self, request: &mut HttpRequest);
}

/// HTTP Basic authentication.
#[derive(Clone)]
pub struct BasicAuth {
    username: String,
    password: String,
}

impl BasicAuth {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }
}

impl fmt::Debug for BasicAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BasicAuth")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

impl Credentials for BasicAuth {
    fn authorize(&self, request: &mut HttpRequest) {
        let token = STANDARD.encode(format!("{}:{}", self.username, self.password));
        request.headers.insert("Authorization", format!("Basic {token}"));
    }
}

/// Bearer token authentication.
#[derive(Clone)]
pub struct BearerToken(String);

impl BearerToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BearerToken(***)")
    }
}

impl Credentials for BearerToken {
    fn authorize(&self, request: &mut HttpRequest) {
        request.headers.insert("Authorization", format!("Bearer {}", self.0));
    }
}
