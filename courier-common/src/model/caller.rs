use serde::{Deserialize, Serialize};

/// Who is asking for a delivery; used to pick a rate-limit tier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerIdentity {
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub first_party: bool,
    #[serde(default)]
    pub trusted: bool,
    #[serde(default)]
    pub privileged: bool,
}

impl CallerIdentity {
    /// The engine itself, e.g. a digest flush.
    #[must_use]
    pub fn internal(service: &str) -> Self {
        Self {
            client_id: Some(service.to_string()),
            first_party: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn anonymous(ip: impl Into<String>) -> Self {
        Self {
            ip: Some(ip.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope)
    }
}
