use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize)]
pub struct CreatePostRequest<'a> {
    pub text: &'a str,
}

/// Loosely-typed: the Platform's success envelope is `{"data":{"id":"..."}}`.
#[derive(Debug, Deserialize, Default)]
pub struct CreatePostResponse {
    pub data: Option<CreatePostData>,
}

#[derive(Debug, Deserialize)]
pub struct CreatePostData {
    pub id: String,
}

/// Loosely-typed error envelope: `message`, `detail`, `title`, or `errors[].message`, plus `error`.
#[derive(Debug, Deserialize, Default)]
pub struct PlatformErrorBody {
    pub message: Option<String>,
    pub detail: Option<String>,
    pub title: Option<String>,
    pub error: Option<String>,
    #[serde(default)]
    pub errors: Vec<PlatformErrorItem>,
}

#[derive(Debug, Deserialize)]
pub struct PlatformErrorItem {
    pub message: Option<String>,
}

impl PlatformErrorBody {
    /// Prefer `message`, else `detail`, else `title`, else the first `errors[].message`.
    pub fn best_message(&self) -> Option<String> {
        self.message
            .clone()
            .or_else(|| self.detail.clone())
            .or_else(|| self.title.clone())
            .or_else(|| self.errors.first().and_then(|e| e.message.clone()))
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct TokenRefreshResponse {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub expires_in: Option<i64>,
}
