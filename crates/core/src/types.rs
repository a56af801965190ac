use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Anything stored in a dedup collection exposes a stable identity.
pub trait Identified {
    fn id(&self) -> &str;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct User {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub picture: String,
    #[serde(default)]
    pub idp: String,
    #[serde(default)]
    pub iat: i64,
    #[serde(default)]
    pub mfa: bool,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Payload of the session endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    #[serde(default)]
    pub user: Option<User>,
    #[serde(default)]
    pub expires: Option<String>,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub auth_provider: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Model {
    #[serde(default)]
    pub slug: String,
    #[serde(default)]
    pub max_tokens: u64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub enabled_tools: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Category {
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub human_category_name: String,
    #[serde(default)]
    pub subscription_level: String,
    #[serde(default)]
    pub default_model: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Payload of the catalog endpoint: the models the account may use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Catalog {
    #[serde(default)]
    pub models: Vec<Model>,
    #[serde(default)]
    pub categories: Vec<Category>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Payload of the account endpoint, kept opaque.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct Account(pub Map<String, Value>);

impl Account {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }
}

/// One entry of the history list; identity is `id`, everything else is
/// carried verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryItem {
    pub id: String,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl HistoryItem {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            payload: Map::new(),
        }
    }

    pub fn with(mut self, key: &str, value: Value) -> Self {
        self.payload.insert(key.to_string(), value);
        self
    }
}

impl Identified for HistoryItem {
    fn id(&self) -> &str {
        &self.id
    }
}

/// Envelope returned by the history-list endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryPage {
    pub items: Vec<HistoryItem>,
    #[serde(default)]
    pub total: Option<u64>,
    #[serde(default)]
    pub limit: Option<u64>,
    #[serde(default)]
    pub offset: Option<u64>,
}
