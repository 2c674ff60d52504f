use std::collections::BTreeMap;
use std::fmt;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

pub const REDACTED: &str = "********";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CredentialError {
    #[error("credential for {0} is not configured")]
    Missing(String),
    #[error("credential for {0} is empty")]
    Blank(String),
    #[error("credential key '{0}' is not recognised")]
    InvalidKey(String),
    #[error("credentials blob is not a JSON object: {0}")]
    MalformedBlob(String),
}

/// What a stored secret unlocks: an LLM provider or a specific agent tool.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CapabilityId {
    Provider(String),
    Tool(String),
}

impl CapabilityId {
    pub fn provider(name: &str) -> Self {
        CapabilityId::Provider(normalize(name))
    }

    pub fn tool(name: &str) -> Self {
        CapabilityId::Tool(normalize(name))
    }

    /// Accepts `provider:<name>` / `tool:<name>`, and the flat legacy form
    /// where provider keys end in `_api_key` and everything else is a tool.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        if let Some(rest) = raw.strip_prefix("provider:") {
            return non_empty(rest).map(CapabilityId::Provider);
        }
        if let Some(rest) = raw.strip_prefix("tool:") {
            return non_empty(rest).map(CapabilityId::Tool);
        }
        if let Some(rest) = raw.strip_suffix("_api_key") {
            return non_empty(rest).map(CapabilityId::Provider);
        }
        non_empty(raw).map(CapabilityId::Tool)
    }

    pub fn name(&self) -> &str {
        match self {
            CapabilityId::Provider(name) | CapabilityId::Tool(name) => name,
        }
    }

    pub fn as_key(&self) -> String {
        match self {
            CapabilityId::Provider(name) => format!("provider:{name}"),
            CapabilityId::Tool(name) => format!("tool:{name}"),
        }
    }
}

impl fmt::Display for CapabilityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_key())
    }
}

impl Serialize for CapabilityId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.as_key())
    }
}

impl<'de> Deserialize<'de> for CapabilityId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        CapabilityId::parse(&raw)
            .ok_or_else(|| de::Error::custom(format!("invalid capability id '{raw}'")))
    }
}

fn normalize(name: &str) -> String {
    name.trim().to_lowercase()
}

fn non_empty(name: &str) -> Option<String> {
    let normalized = normalize(name);
    (!normalized.is_empty()).then_some(normalized)
}

/// Opaque secret value. Never printed or serialized in clear.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretHandle(String);

impl SecretHandle {
    pub fn new(value: impl Into<String>) -> Self {
        SecretHandle(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_redacted_placeholder(&self) -> bool {
        self.0 == REDACTED
    }
}

impl fmt::Debug for SecretHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretHandle({REDACTED})")
    }
}

impl Serialize for SecretHandle {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(REDACTED)
    }
}

impl<'de> Deserialize<'de> for SecretHandle {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(SecretHandle)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CredentialMap(BTreeMap<CapabilityId, SecretHandle>);

impl CredentialMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: CapabilityId, secret: SecretHandle) -> Option<SecretHandle> {
        self.0.insert(id, secret)
    }

    pub fn get(&self, id: &CapabilityId) -> Option<&SecretHandle> {
        self.0.get(id)
    }

    pub fn remove(&mut self, id: &CapabilityId) -> Option<SecretHandle> {
        self.0.remove(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&CapabilityId, &SecretHandle)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Fetches a credential at the point a tool consumes it. This is the only
    /// place well-formedness is checked.
    pub fn require(&self, id: &CapabilityId) -> Result<&str, CredentialError> {
        let secret = self
            .0
            .get(id)
            .ok_or_else(|| CredentialError::Missing(id.as_key()))?;
        let trimmed = secret.expose().trim();
        if trimmed.is_empty() {
            return Err(CredentialError::Blank(id.as_key()));
        }
        Ok(trimmed)
    }

    /// Admin forms send back the redacted placeholder for secrets they did
    /// not touch; keep the stored value for those.
    pub fn restore_redacted(&mut self, previous: &CredentialMap) {
        let untouched: Vec<CapabilityId> = self
            .0
            .iter()
            .filter(|(_, secret)| secret.is_redacted_placeholder())
            .map(|(id, _)| id.clone())
            .collect();
        for id in untouched {
            match previous.get(&id) {
                Some(existing) => {
                    self.0.insert(id, existing.clone());
                }
                None => {
                    self.0.remove(&id);
                }
            }
        }
    }

    pub fn to_blob(&self) -> String {
        let mut obj = Map::new();
        for (id, secret) in &self.0 {
            obj.insert(id.as_key(), Value::String(secret.expose().to_string()));
        }
        Value::Object(obj).to_string()
    }

    pub fn from_blob(blob: &str) -> Result<Self, CredentialError> {
        if blob.trim().is_empty() {
            return Ok(Self::default());
        }
        let value: Value = serde_json::from_str(blob)
            .map_err(|err| CredentialError::MalformedBlob(err.to_string()))?;
        let Some(obj) = value.as_object() else {
            return Err(CredentialError::MalformedBlob("expected object".into()));
        };

        let mut out = BTreeMap::new();
        for (key, value) in obj {
            let id =
                CapabilityId::parse(key).ok_or_else(|| CredentialError::InvalidKey(key.clone()))?;
            if let Some(secret) = value.as_str() {
                out.insert(id, SecretHandle::new(secret));
            }
        }
        Ok(CredentialMap(out))
    }
}

impl FromIterator<(CapabilityId, SecretHandle)> for CredentialMap {
    fn from_iter<T: IntoIterator<Item = (CapabilityId, SecretHandle)>>(iter: T) -> Self {
        CredentialMap(iter.into_iter().collect())
    }
}
