//! Human-readable renderings of requests and responses, used in error
//! messages and debug logs.

use crate::http::{HttpRequest, HttpResponse};

/// Render method, URL, body and headers of a resolved request.
pub fn format_request(request: &HttpRequest) -> String {
    let headers: Vec<(&str, &str)> = request
        .headers
        .iter()
        .map(|(name, value)| {
            if name.eq_ignore_ascii_case("authorization") {
                (name, "***")
            } else {
                (name, value)
            }
        })
        .collect();
    format!(
        ">request:\n>m {}\n>p {}\n>b {}\n>h {:?}\n",
        request.method,
        request.url,
        request.body.as_deref().unwrap_or("None"),
        headers
    )
}

/// Render status, URL and body of a response; JSON bodies are pretty-printed.
pub fn format_response(response: &HttpResponse) -> String {
    let text = serde_json::from_str::<serde_json::Value>(&response.body)
        .ok()
        .and_then(|value| serde_json::to_string_pretty(&value).ok())
        .unwrap_or_else(|| response.body.clone());
    format!(">response:\n>c {}\n>u {}\n>t\n{}\n", response.status, response.url, text)
}

/// A status (and optionally body text) a response is expected to carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedResponse {
    pub status: u16,
    pub text: Option<String>,
}

impl ExpectedResponse {
    pub fn status(status: u16) -> Self {
        Self { status, text: None }
    }

    pub fn with_text(status: u16, text: impl Into<String>) -> Self {
        Self {
            status,
            text: Some(text.into()),
        }
    }

    pub fn matches(&self, response: &HttpResponse) -> bool {
        self.status == response.status && self.text.as_ref().is_none_or(|text| *text == response.body)
    }
}

impl PartialEq<HttpResponse> for ExpectedResponse {
    fn eq(&self, other: &HttpResponse) -> bool {
        self.matches(other)
    }
}
