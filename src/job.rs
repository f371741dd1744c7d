//! The job record carried as a message body.

use crate::error::Result;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// A unit of work: application payload plus the number of prior failed attempts.
///
/// On the wire the payload's fields are flattened next to `retries`, e.g.
/// `{"email":"ada@example.com","name":"Ada","retries":0}`. A body without
/// `retries` decodes with `retries = 0`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job<P> {
    #[serde(flatten)]
    pub payload: P,
    #[serde(default)]
    pub retries: u32,
}

impl<P> Job<P> {
    /// A job that has never been attempted.
    pub fn new(payload: P) -> Self {
        Self { payload, retries: 0 }
    }

    /// The same job with its retry counter bumped by one. Saturates at `u32::MAX`.
    pub fn next_attempt(mut self) -> Self {
        self.retries = self.retries.saturating_add(1);
        self
    }

    /// 1-based attempt number, for logging. Saturates at `u32::MAX`.
    pub fn attempt(&self) -> u32 {
        self.retries.saturating_add(1)
    }
}

impl<P: Serialize> Job<P> {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

impl<P: DeserializeOwned> Job<P> {
    pub fn decode(body: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(body)?)
    }
}

/// Payload for the registration email task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationEmail {
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl RegistrationEmail {
    pub fn new(email: impl Into<String>) -> Self {
        Self { email: email.into(), name: None }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}
