use serde::{Deserialize, Serialize};

use crate::KeyValue;

/// List of environment variables passed to the container.
///
/// Internally stored as a list of key–value pairs and serialized as a transparent array wrapper.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskEnv(pub Vec<KeyValue>);

impl TaskEnv {
    /// Create an empty environment.
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check if the environment is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over all key–value pairs.
    pub fn iter(&self) -> impl Iterator<Item = &KeyValue> {
        self.0.iter()
    }

    /// Get the value for a key, returning the last matching entry.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .rev()
            .find(|kv| kv.key() == key)
            .map(|kv| kv.value())
    }

    /// Append a key–value pair to the environment.
    ///
    /// Later entries override earlier ones when queried via [`TaskEnv::get`].
    pub fn push<K, V>(&mut self, key: K, value: V)
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.0.push(KeyValue::new(key, value));
    }

    /// Render as `KEY=VALUE` strings, the form container runtimes accept.
    ///
    /// Overridden keys are emitted once, with their last value, in first-seen order.
    pub fn to_vars(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::with_capacity(self.0.len());
        let mut seen: Vec<&str> = Vec::with_capacity(self.0.len());
        for kv in &self.0 {
            if seen.contains(&kv.key()) {
                continue;
            }
            seen.push(kv.key());
            // `get` resolves to the last entry for this key.
            let value = self.get(kv.key()).unwrap_or(kv.value());
            out.push(format!("{}={}", kv.key(), value));
        }
        out
    }
}

impl<K, V> FromIterator<(K, V)> for TaskEnv
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| KeyValue::new(k, v)).collect())
    }
}
