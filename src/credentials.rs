//! Client credentials
use base64::{engine::general_purpose, Engine};

/// HTTP Basic credential material for a caster account.
///
/// Both fields may be empty; the Authorization header is only sent when at
/// least one of them is not.
#[derive(Clone, Default, PartialEq, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NtripCredentials {
    pub user: String,
    pub password: String,
}

impl NtripCredentials {
    pub fn new(user: &str, password: &str) -> Self {
        Self {
            user: user.to_string(),
            password: password.to_string(),
        }
    }

    /// True when neither a user nor a password was given; no Authorization
    /// header is produced in that case.
    pub fn is_empty(&self) -> bool {
        self.user.is_empty() && self.password.is_empty()
    }

    /// Base64 of `user:password` with the standard alphabet and `=` padding.
    pub fn encode(&self) -> String {
        general_purpose::STANDARD.encode(format!("{}:{}", self.user, self.password))
    }

    /// Exact number of bytes [`encode`](Self::encode) produces.
    ///
    /// Request builders writing into bounded protocol buffers check this
    /// before committing to the header.
    pub fn encoded_len(&self) -> usize {
        (self.user.len() + 1 + self.password.len()).div_ceil(3) * 4
    }

    /// Full `Authorization` header value.
    pub fn header_value(&self) -> String {
        format!("Basic {}", self.encode())
    }
}
