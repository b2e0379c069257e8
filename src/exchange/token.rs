//! Request tokens.
//!
//! A token correlates one `request_files` with its `send_files` response.
//! Only the most recently issued token is valid, and it is consumed by the
//! first response that presents it.

use std::collections::BTreeSet;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Token(String);

impl Token {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The request a token was issued for.
#[derive(Debug, Clone)]
pub struct OutstandingRequest {
    pub token: Token,
    pub identifiers: BTreeSet<String>,
}

/// Outcome of presenting a token.
#[derive(Debug)]
pub enum TokenCheck {
    /// Token matches the outstanding request, which is now consumed
    Accepted(OutstandingRequest),
    /// Token does not match the outstanding request (or was already used)
    Stale,
    /// No request is outstanding
    NoneOutstanding,
}

#[derive(Debug, Default)]
pub struct TokenTracker {
    outstanding: Option<OutstandingRequest>,
}

impl TokenTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a fresh token for `identifiers`, invalidating any earlier one.
    pub fn issue<I, S>(&mut self, identifiers: I) -> Token
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let token = Token::generate();
        if let Some(previous) = self.outstanding.take() {
            tracing::debug!("Superseding outstanding request token {}", previous.token);
        }
        self.outstanding = Some(OutstandingRequest {
            token: token.clone(),
            identifiers: identifiers.into_iter().map(Into::into).collect(),
        });
        token
    }

    pub fn check(&mut self, presented: &str) -> TokenCheck {
        match self.outstanding.take() {
            Some(request) if request.token.as_str() == presented => TokenCheck::Accepted(request),
            Some(request) => {
                self.outstanding = Some(request);
                TokenCheck::Stale
            }
            None => TokenCheck::NoneOutstanding,
        }
    }

    pub fn has_outstanding(&self) -> bool {
        self.outstanding.is_some()
    }
}
