use md5::{Digest, Md5};

const BEARER_PREFIX: &str = "Bearer ";

/// Shared-secret check guarding `POST /notify`.
///
/// Submitters derive the token from the relay's client id and secret plus
/// the batch `date`; this deters casual forgery and is not a MAC.
#[derive(Clone)]
pub struct SubmissionTokens {
    client_id: String,
    client_secret: String,
}

impl SubmissionTokens {
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        }
    }

    /// Lowercase hex MD5 of client id, client secret and date, in that order
    /// and without separators.
    pub fn expected_token(&self, date: &str) -> String {
        let mut hasher = Md5::new();
        hasher.update(self.client_id.as_bytes());
        hasher.update(self.client_secret.as_bytes());
        hasher.update(date.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    pub fn validate(&self, authorization: Option<&str>, date: &str) -> bool {
        match authorization {
            Some(header) => header
                .strip_prefix(BEARER_PREFIX)
                .is_some_and(|token| token == self.expected_token(date)),
            None => false,
        }
    }

    pub fn bearer(&self, date: &str) -> String {
        format!("{BEARER_PREFIX}{}", self.expected_token(date))
    }
}
