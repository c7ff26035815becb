use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Positional and keyword arguments bound to a deferred call, or handed
/// back from `resume` to the suspended side.
///
/// ```
/// use etude_core::Args;
///
/// let args = Args::new().arg(1).kwarg("b", "ABC");
/// assert_eq!(args.get(0), Some(&1.into()));
/// assert_eq!(args.kw("b").and_then(|v| v.as_str()), Some("ABC"));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Args {
    positional: Vec<Value>,
    keyword: BTreeMap<String, Value>,
}

impl Args {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.positional.push(value.into());
        self
    }

    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.keyword.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.positional.get(index)
    }

    pub fn kw(&self, name: &str) -> Option<&Value> {
        self.keyword.get(name)
    }

    /// Keyword lookup falling back to a default, like a defaulted parameter.
    pub fn kw_or<'a>(&'a self, name: &str, default: &'a Value) -> &'a Value {
        self.keyword.get(name).unwrap_or(default)
    }

    pub fn positional(&self) -> &[Value] {
        &self.positional
    }

    pub fn keyword(&self) -> &BTreeMap<String, Value> {
        &self.keyword
    }

    pub fn len(&self) -> usize {
        self.positional.len() + self.keyword.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positional.is_empty() && self.keyword.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builder_keeps_order_and_names() {
        let args = Args::new().arg(1).arg("two").kwarg("c", true).kwarg("b", "ABC");
        assert_eq!(args.positional(), &[json!(1), json!("two")]);
        assert_eq!(args.kw("b"), Some(&json!("ABC")));
        assert_eq!(args.kw("c"), Some(&json!(true)));
        assert_eq!(args.len(), 4);
    }

    #[test]
    fn test_keyword_default() {
        let args = Args::new().arg(1);
        let fallback = json!("test");
        assert_eq!(args.kw_or("b", &fallback), &json!("test"));
        assert!(Args::new().is_empty());
    }
}
