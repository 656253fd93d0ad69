// Last.fm request parameters and signing
// https://www.last.fm/api/authspec#_8-signing-calls

use std::collections::BTreeMap;

/// Parameters that never take part in the signature
const UNSIGNED: [&str; 2] = ["format", "api_sig"];

/// Parameters of one API call.
///
/// Keys are kept in a `BTreeMap`, so iteration is already in the byte order
/// the signature needs. List parameters are flattened into `name[i]` keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestParams {
    params: BTreeMap<String, String>,
}

impl RequestParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.params.insert(key.into(), value.into());
    }

    /// Insert only when a value is present
    pub fn insert_opt(&mut self, key: impl Into<String>, value: Option<impl Into<String>>) {
        if let Some(value) = value {
            self.insert(key, value);
        }
    }

    /// Insert `name[0]`, `name[1]`, ... keeping each value at its index.
    /// Missing values are skipped rather than sent empty.
    pub fn insert_list<I, V>(&mut self, name: &str, values: I)
    where
        I: IntoIterator<Item = Option<V>>,
        V: Into<String>,
    {
        for (i, value) in values.into_iter().enumerate() {
            if let Some(value) = value {
                self.insert(format!("{}[{}]", name, i), value);
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// MD5 over `k1v1k2v2...` plus the secret, as lowercase hex
    pub fn signature(&self, secret: &str) -> String {
        let mut material = String::new();
        for (key, value) in &self.params {
            if UNSIGNED.contains(&key.as_str()) {
                continue;
            }
            material.push_str(key);
            material.push_str(value);
        }
        material.push_str(secret);
        format!("{:x}", md5::compute(material.as_bytes()))
    }

    /// Final wire pairs: signed parameters, then `api_sig`, then `format=json`.
    pub fn into_signed(mut self, secret: &str) -> Vec<(String, String)> {
        for key in UNSIGNED {
            self.params.remove(key);
        }
        let signature = self.signature(secret);
        let mut pairs: Vec<(String, String)> = self.params.into_iter().collect();
        pairs.push(("api_sig".to_string(), signature));
        pairs.push(("format".to_string(), "json".to_string()));
        pairs
    }
}
