//! Header list view shared by requests and responses.
//!
//! [`Headers`] is a thin layer over [`http::HeaderMap`] exposing the Fetch
//! vocabulary (`append`, `set`, `get`, `has`, `delete`). Names are
//! case-insensitive and stored lowercase; a name may carry several values.

use http::header::{HeaderMap, HeaderName, HeaderValue};

use crate::errors::Result;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Headers {
    map: HeaderMap,
}

fn parse_name(name: &str) -> Result<HeaderName> {
    Ok(HeaderName::from_bytes(name.as_bytes())?)
}

fn parse_value(value: &str) -> Result<HeaderValue> {
    // Leading and trailing HTTP whitespace is not part of a header value
    Ok(HeaderValue::from_str(value.trim_matches(|c| matches!(c, ' ' | '\t' | '\r' | '\n')))?)
}

fn value_to_string(value: &HeaderValue) -> String {
    String::from_utf8_lossy(value.as_bytes()).into_owned()
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a header list from name/value pairs, keeping duplicates.
    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut headers = Headers::new();
        for (name, value) in pairs {
            headers.append(name.as_ref(), value.as_ref())?;
        }
        Ok(headers)
    }

    /// Adds a value, keeping existing values of the same name.
    pub fn append(&mut self, name: &str, value: &str) -> Result<()> {
        self.map.append(parse_name(name)?, parse_value(value)?);
        Ok(())
    }

    /// Replaces all values of `name` with `value`.
    pub fn set(&mut self, name: &str, value: &str) -> Result<()> {
        self.map.insert(parse_name(name)?, parse_value(value)?);
        Ok(())
    }

    /// Returns all values of `name` combined with `, `.
    pub fn get(&self, name: &str) -> Option<String> {
        let values = self.get_all(name);
        if values.is_empty() {
            None
        } else {
            Some(values.join(", "))
        }
    }

    pub fn get_all(&self, name: &str) -> Vec<String> {
        match parse_name(name) {
            Ok(name) => self.map.get_all(name).iter().map(value_to_string).collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn has(&self, name: &str) -> bool {
        parse_name(name).map(|n| self.map.contains_key(n)).unwrap_or(false)
    }

    pub fn delete(&mut self, name: &str) {
        if let Ok(name) = parse_name(name) {
            self.map.remove(name);
        }
    }

    /// Iterates over `(name, combined value)` pairs sorted by name.
    pub fn iter(&self) -> impl Iterator<Item = (String, String)> + '_ {
        let mut names: Vec<&HeaderName> = self.map.keys().collect();
        names.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        names.into_iter().map(move |name| {
            let joined = self
                .map
                .get_all(name)
                .iter()
                .map(value_to_string)
                .collect::<Vec<_>>()
                .join(", ");
            (name.as_str().to_string(), joined)
        })
    }

    /// Number of distinct header names.
    pub fn len(&self) -> usize {
        self.map.keys_len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn as_header_map(&self) -> &HeaderMap {
        &self.map
    }

    pub fn into_header_map(self) -> HeaderMap {
        self.map
    }
}

impl From<HeaderMap> for Headers {
    fn from(map: HeaderMap) -> Self {
        Self { map }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_case_insensitive() {
        let mut h = Headers::new();
        h.append("Content-Type", "text/plain").unwrap();
        assert!(h.has("content-type"));
        assert_eq!(h.get("CONTENT-TYPE").as_deref(), Some("text/plain"));
    }

    #[test]
    fn append_keeps_duplicates_and_set_replaces_them() {
        let mut h = Headers::new();
        h.append("x-a", "1").unwrap();
        h.append("x-a", "2").unwrap();
        assert_eq!(h.get("x-a").as_deref(), Some("1, 2"));
        assert_eq!(h.get_all("x-a"), vec!["1", "2"]);

        h.set("x-a", "3").unwrap();
        assert_eq!(h.get_all("x-a"), vec!["3"]);
    }

    #[test]
    fn values_are_trimmed_and_invalid_input_rejected() {
        let mut h = Headers::new();
        h.set("accept", "  */*\t").unwrap();
        assert_eq!(h.get("accept").as_deref(), Some("*/*"));

        assert!(h.append("bad name", "x").unwrap_err().is_type_error());
        assert!(h.append("x-ok", "line\nbreak").is_err());
        assert!(!h.has("bad name"));
    }

    #[test]
    fn iteration_is_sorted_and_combined() {
        let h = Headers::from_pairs([("b", "2"), ("a", "1"), ("b", "3")]).unwrap();
        let pairs: Vec<_> = h.iter().collect();
        assert_eq!(
            pairs,
            vec![("a".to_string(), "1".to_string()), ("b".to_string(), "2, 3".to_string())]
        );
        assert_eq!(h.len(), 2);
    }

    #[test]
    fn delete_removes_every_value() {
        let mut h = Headers::from_pairs([("x", "1"), ("x", "2")]).unwrap();
        h.delete("X");
        assert!(!h.has("x"));
        assert!(h.is_empty());
    }
}
