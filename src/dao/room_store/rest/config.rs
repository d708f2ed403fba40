use uuid::Uuid;

use crate::dao::models::AuthUser;

use super::error::{RestDaoError, RestResult};

/// Runtime configuration describing how to reach the REST backend.
#[derive(Debug, Clone)]
pub struct RestConfig {
    /// Project URL, without the `rest/v1` prefix.
    pub base_url: String,
    /// Public API key sent with every request.
    pub api_key: String,
    /// Bearer token of the signed-in user; the API key is used when absent.
    pub access_token: Option<String>,
    /// User the token belongs to.
    pub user: Option<AuthUser>,
}

impl RestConfig {
    /// Construct a configuration from explicit base URL and API key.
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            access_token: None,
            user: None,
        }
    }

    /// Attach the signed-in user's bearer token.
    pub fn with_session(mut self, access_token: impl Into<String>, user: AuthUser) -> Self {
        self.access_token = Some(access_token.into());
        self.user = Some(user);
        self
    }

    /// Build a configuration by reading the expected environment variables.
    pub fn from_env() -> RestResult<Self> {
        let base_url = std::env::var("BINGO_REST_URL").map_err(|_| RestDaoError::MissingEnvVar {
            var: "BINGO_REST_URL",
        })?;
        let api_key = std::env::var("BINGO_REST_API_KEY").map_err(|_| {
            RestDaoError::MissingEnvVar {
                var: "BINGO_REST_API_KEY",
            }
        })?;

        let mut config = Self::new(base_url, api_key);

        if let (Ok(token), Ok(user_id), Ok(email)) = (
            std::env::var("BINGO_REST_ACCESS_TOKEN"),
            std::env::var("BINGO_REST_USER_ID"),
            std::env::var("BINGO_REST_USER_EMAIL"),
        ) {
            let id = Uuid::parse_str(&user_id).map_err(|_| RestDaoError::InvalidEnvVar {
                var: "BINGO_REST_USER_ID",
            })?;
            config = config.with_session(token, AuthUser { id, email });
        }

        Ok(config)
    }
}
