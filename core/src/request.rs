//! Request descriptors and their resolution into ready-to-send requests.
//!
//! # Design
//! A `Request` is an immutable description of one API call: method, path
//! relative to one of the service roots, body, headers and query parameters.
//! It carries no address. `Request::build` resolves it against a base URL and
//! credentials at send time, so the same descriptor can be replayed against
//! different connections. Building is pure: no network, no shared state.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use serde_json::Value;

use crate::auth::Credentials;
use crate::error::ApiError;
use crate::http::{Headers, HttpMethod, HttpRequest};

/// Path prefix of the REST API.
pub const API_ROOT: &str = "/pulp/api/v2/";

/// Path prefix of static content served next to the API.
pub const STATIC_ROOT: &str = "/pulp/static/";

const JSON_CONTENT_TYPE: &str = "application/json";

static STACKED_SLASHES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([^:])//+").expect("stacked-slash pattern is valid"));

/// Which service root a descriptor resolves under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathRoot {
    Api,
    Static,
}

impl PathRoot {
    pub fn prefix(self) -> &'static str {
        match self {
            PathRoot::Api => API_ROOT,
            PathRoot::Static => STATIC_ROOT,
        }
    }
}

/// Request payload before encoding.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    /// Structured data; encoded as JSON when the content type says so.
    Json(Value),
    /// Sent exactly as given.
    Raw(String),
}

/// Description of one API call, independent of any connection.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    method: HttpMethod,
    path: String,
    root: PathRoot,
    body: Option<RequestBody>,
    headers: Headers,
    params: Vec<(String, String)>,
}

impl Request {
    /// Request under the API root with a JSON content type.
    pub fn new(method: HttpMethod, path: impl Into<String>) -> Self {
        let mut headers = Headers::new();
        headers.insert("content-type", JSON_CONTENT_TYPE);
        Self {
            method,
            path: path.into(),
            root: PathRoot::Api,
            body: None,
            headers,
            params: Vec::new(),
        }
    }

    /// Request under the static content root.
    pub fn static_resource(method: HttpMethod, path: impl Into<String>) -> Self {
        Self {
            root: PathRoot::Static,
            ..Self::new(method, path)
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(HttpMethod::Post, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(HttpMethod::Put, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(HttpMethod::Delete, path)
    }

    /// Attach a serializable body.
    pub fn json<T: Serialize>(self, body: &T) -> Result<Self, ApiError> {
        let value = serde_json::to_value(body).map_err(|e| ApiError::Serialization(e.to_string()))?;
        Ok(self.json_value(value))
    }

    pub fn json_value(mut self, body: Value) -> Self {
        self.body = Some(RequestBody::Json(body));
        self
    }

    pub fn raw_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(RequestBody::Raw(body.into()));
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }

    pub fn method(&self) -> HttpMethod {
        self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn root(&self) -> PathRoot {
        self.root
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn params(&self) -> &[(String, String)] {
        &self.params
    }

    pub fn body(&self) -> Option<&RequestBody> {
        self.body.as_ref()
    }

    /// Resolve against `base_url` and sign with `credentials`.
    pub fn build(&self, base_url: &str, credentials: Option<&dyn Credentials>) -> Result<HttpRequest, ApiError> {
        let mut url = normalize_url(&format!("{base_url}/{}/{}", self.root.prefix(), self.path));
        if self.root == PathRoot::Static {
            url.truncate(url.trim_end_matches('/').len());
        }
        if !self.params.is_empty() {
            let query = url::form_urlencoded::Serializer::new(String::new())
                .extend_pairs(&self.params)
                .finish();
            url.push(if url.contains('?') { '&' } else { '?' });
            url.push_str(&query);
        }

        let mut headers = self.headers.clone();
        if !headers.contains("content-type") {
            headers.insert("content-type", JSON_CONTENT_TYPE);
        }
        let body = self.encode_body(&headers)?;

        let mut request = HttpRequest {
            method: self.method,
            url,
            headers,
            body,
        };
        if let Some(credentials) = credentials {
            credentials.authorize(&mut request);
        }
        Ok(request)
    }

    fn encode_body(&self, headers: &Headers) -> Result<Option<String>, ApiError> {
        let json = headers.get("content-type").is_some_and(is_json_content_type);
        match &self.body {
            None => Ok(None),
            Some(RequestBody::Raw(raw)) => Ok(Some(raw.clone())),
            Some(RequestBody::Json(Value::String(text))) if !json => Ok(Some(text.clone())),
            Some(RequestBody::Json(value)) => serde_json::to_string(value)
                .map(Some)
                .map_err(|e| ApiError::Serialization(e.to_string())),
        }
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.root {
            PathRoot::Api => "Request",
            PathRoot::Static => "StaticRequest",
        };
        write!(f, "{kind}({}, {:?}", self.method, self.path)?;
        match &self.body {
            Some(RequestBody::Json(value)) => write!(f, ", data={value}")?,
            Some(RequestBody::Raw(raw)) => write!(f, ", data={raw:?}")?,
            None => {}
        }
        write!(f, ", headers={:?})", self.headers.iter().collect::<Vec<_>>())
    }
}

fn is_json_content_type(value: &str) -> bool {
    value
        .split(';')
        .next()
        .is_some_and(|mime| mime.trim().eq_ignore_ascii_case(JSON_CONTENT_TYPE))
}

/// Collapse runs of `/` except the one following a scheme's `:`.
pub fn normalize_url(url: &str) -> String {
    STACKED_SLASHES.replace_all(url, "$1/").into_owned()
}

/// Turn an API href (absolute URL or rooted path) into a path relative to
/// the API root, suitable for `Request::get`.
pub fn api_relative(href: &str) -> &str {
    match href.find(API_ROOT) {
        Some(index) => &href[index + API_ROOT.len()..],
        None => href.trim_start_matches('/'),
    }
}
