use std::collections::HashMap;

use serde_json::Value;

pub type PersonId = i64;

/// A stored person as seen through one of its distinct ids.
#[derive(Debug, Clone, PartialEq)]
pub struct Person {
    pub id: PersonId,
    pub properties: HashMap<String, Value>,
}

impl Person {
    /// Builds a person from the stored properties column, which may be null or not an object.
    pub fn from_stored(id: PersonId, properties: Option<Value>) -> Self {
        let properties = match properties {
            Some(Value::Object(map)) => map.into_iter().collect(),
            _ => HashMap::new(),
        };
        Person { id, properties }
    }
}
