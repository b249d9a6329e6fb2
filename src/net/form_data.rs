//! `multipart/form-data` entry lists.
//!
//! A [`FormData`] is an ordered list of `(name, value)` entries where a value
//! is either text or a [`File`]. Duplicated names are allowed; `set` collapses
//! them back into a single entry.

use bytes::{BufMut, Bytes, BytesMut};

/// Name given to binary entries appended without a filename.
pub const DEFAULT_BLOB_NAME: &str = "blob";

/// An in-memory file attached to a form entry.
#[derive(Debug, Clone, PartialEq)]
pub struct File {
    pub name: String,
    /// Empty when unknown; serialised as `application/octet-stream`
    pub content_type: String,
    pub bytes: Bytes,
}

impl File {
    pub fn new(name: impl Into<String>, content_type: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            content_type: content_type.into(),
            bytes: bytes.into(),
        }
    }

    /// A nameless binary value; it is called `blob` once stored in a form.
    pub fn blob(content_type: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self::new(DEFAULT_BLOB_NAME, content_type, bytes)
    }

    pub fn size(&self) -> usize {
        self.bytes.len()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FormValue {
    Text(String),
    File(File),
}

impl FormValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FormValue::Text(s) => Some(s),
            FormValue::File(_) => None,
        }
    }

    pub fn as_file(&self) -> Option<&File> {
        match self {
            FormValue::File(f) => Some(f),
            FormValue::Text(_) => None,
        }
    }
}

impl From<&str> for FormValue {
    fn from(s: &str) -> Self {
        FormValue::Text(s.to_string())
    }
}

impl From<String> for FormValue {
    fn from(s: String) -> Self {
        FormValue::Text(s)
    }
}

impl From<File> for FormValue {
    fn from(f: File) -> Self {
        FormValue::File(f)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FormEntry {
    pub name: String,
    pub value: FormValue,
}

fn make_entry(name: &str, value: FormValue, filename: Option<&str>) -> FormEntry {
    let value = match (value, filename) {
        (FormValue::File(mut file), Some(filename)) if !filename.is_empty() => {
            file.name = filename.to_string();
            FormValue::File(file)
        }
        (value, _) => value,
    };
    FormEntry {
        name: name.to_string(),
        value,
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FormData {
    entries: Vec<FormEntry>,
}

impl FormData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a text entry.
    pub fn append(&mut self, name: &str, value: impl Into<FormValue>) {
        self.entries.push(make_entry(name, value.into(), None));
    }

    /// Appends a file entry, renaming the file when `filename` is given.
    pub fn append_file(&mut self, name: &str, file: File, filename: Option<&str>) {
        self.entries.push(make_entry(name, FormValue::File(file), filename));
    }

    /// Replaces the first entry named `name` and removes every other one.
    /// Appends when there is no such entry.
    pub fn set(&mut self, name: &str, value: impl Into<FormValue>) {
        self.set_entry(make_entry(name, value.into(), None));
    }

    pub fn set_file(&mut self, name: &str, file: File, filename: Option<&str>) {
        self.set_entry(make_entry(name, FormValue::File(file), filename));
    }

    fn set_entry(&mut self, entry: FormEntry) {
        let Some(first) = self.entries.iter().position(|e| e.name == entry.name) else {
            self.entries.push(entry);
            return;
        };

        let mut idx = 0usize;
        self.entries.retain(|e| {
            let keep = idx == first || e.name != entry.name;
            idx += 1;
            keep
        });
        self.entries[first] = entry;
    }

    /// Removes every entry named `name`.
    pub fn delete(&mut self, name: &str) {
        self.entries.retain(|e| e.name != name);
    }

    /// First value stored under `name`.
    pub fn get(&self, name: &str) -> Option<&FormValue> {
        self.entries.iter().find(|e| e.name == name).map(|e| &e.value)
    }

    /// All values stored under `name`, in list order.
    pub fn get_all(&self, name: &str) -> Vec<&FormValue> {
        self.entries
            .iter()
            .filter(|e| e.name == name)
            .map(|e| &e.value)
            .collect()
    }

    pub fn has(&self, name: &str) -> bool {
        self.entries.iter().any(|e| e.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FormValue)> {
        self.entries.iter().map(|e| (e.name.as_str(), &e.value))
    }

    /// `(name, value)` pairs in list order; same as [`FormData::iter`].
    pub fn entries(&self) -> impl Iterator<Item = (&str, &FormValue)> {
        self.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.name.as_str())
    }

    pub fn values(&self) -> impl Iterator<Item = &FormValue> {
        self.entries.iter().map(|e| &e.value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serialises the entries as a `multipart/form-data` payload.
    pub fn to_multipart(&self, boundary: &str) -> Bytes {
        let mut buf = BytesMut::new();
        for entry in &self.entries {
            buf.put_slice(b"--");
            buf.put_slice(boundary.as_bytes());
            buf.put_slice(b"\r\n");
            buf.put_slice(b"Content-Disposition: form-data; name=\"");
            buf.put_slice(escape_name(&entry.name).as_bytes());
            buf.put_slice(b"\"");
            match &entry.value {
                FormValue::Text(text) => {
                    buf.put_slice(b"\r\n\r\n");
                    buf.put_slice(normalize_newlines(text).as_bytes());
                }
                FormValue::File(file) => {
                    buf.put_slice(b"; filename=\"");
                    buf.put_slice(escape_name(&file.name).as_bytes());
                    buf.put_slice(b"\"\r\nContent-Type: ");
                    let content_type = if file.content_type.is_empty() {
                        "application/octet-stream"
                    } else {
                        file.content_type.as_str()
                    };
                    buf.put_slice(content_type.as_bytes());
                    buf.put_slice(b"\r\n\r\n");
                    buf.put_slice(&file.bytes);
                }
            }
            buf.put_slice(b"\r\n");
        }
        buf.put_slice(b"--");
        buf.put_slice(boundary.as_bytes());
        buf.put_slice(b"--\r\n");
        buf.freeze()
    }
}

fn escape_name(name: &str) -> String {
    name.replace('\n', "%0A").replace('\r', "%0D").replace('"', "%22")
}

fn normalize_newlines(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "\n").replace('\n', "\r\n")
}

impl<'a> IntoIterator for &'a FormData {
    type Item = (&'a str, &'a FormValue);
    type IntoIter = Box<dyn Iterator<Item = (&'a str, &'a FormValue)> + 'a>;

    fn into_iter(self) -> Self::IntoIter {
        Box::new(self.iter())
    }
}
