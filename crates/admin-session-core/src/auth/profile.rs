use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Role value that grants access to the admin dashboard
pub const ADMIN_ROLE: &str = "admin";

/// The stored user record. Unstructured: any JSON object is accepted and
/// round-trips unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserProfile {
    fields: Map<String, Value>,
}

impl UserProfile {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self { fields }
    }

    /// Parse a stored profile; `None` unless it is a JSON object.
    pub fn from_json(json: &str) -> Option<Self> {
        serde_json::from_str(json).ok()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn user_id(&self) -> Option<i64> {
        self.fields.get("user_id").and_then(Value::as_i64)
    }

    pub fn name(&self) -> Option<&str> {
        self.str_field("name")
    }

    pub fn email(&self) -> Option<&str> {
        self.str_field("email")
    }

    pub fn role(&self) -> Option<&str> {
        self.str_field("role")
    }

    pub fn is_admin(&self) -> bool {
        self.role() == Some(ADMIN_ROLE)
    }

    fn str_field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }
}
