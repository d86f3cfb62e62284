/// Ordered header collection.
///
/// Names keep the case they were received or inserted with; lookups are
/// case-insensitive. A name that appears more than once holds its values as
/// an ordered list at the position of its first occurrence and is written
/// back out as repeated lines.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<HeaderEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct HeaderEntry {
    name: String,
    values: Vec<String>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a value, accumulating under an existing name if present.
    pub fn add(&mut self, name: &str, value: &str) {
        match self.position(name) {
            Some(i) => self.entries[i].values.push(value.to_string()),
            None => self.entries.push(HeaderEntry {
                name: name.to_string(),
                values: vec![value.to_string()],
            }),
        }
    }

    /// Replace every value of `name` with a single value.
    pub fn set(&mut self, name: &str, value: &str) {
        match self.position(name) {
            Some(i) => self.entries[i].values = vec![value.to_string()],
            None => self.add(name, value),
        }
    }

    /// First value stored under `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.position(name)
            .and_then(|i| self.entries[i].values.first())
            .map(String::as_str)
    }

    /// All values stored under `name`, in arrival order.
    pub fn get_all(&self, name: &str) -> &[String] {
        match self.position(name) {
            Some(i) => &self.entries[i].values,
            None => &[],
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    /// Remove `name` entirely. Returns whether anything was removed.
    pub fn remove(&mut self, name: &str) -> bool {
        match self.position(name) {
            Some(i) => {
                self.entries.remove(i);
                true
            }
            None => false,
        }
    }

    /// Whether any value of `name` contains `token` as a comma-separated,
    /// case-insensitive element (e.g. `Connection: keep-alive, close`).
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.get_all(name)
            .iter()
            .flat_map(|v| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    }

    /// Extend the most recently added value (obsolete line folding).
    pub(crate) fn continue_last(&mut self, text: &str) -> bool {
        let Some(last) = self.entries.last_mut().and_then(|e| e.values.last_mut()) else {
            return false;
        };
        last.push(' ');
        last.push_str(text);
        true
    }

    /// Every (name, value) pair in serialization order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .flat_map(|e| e.values.iter().map(move |v| (e.name.as_str(), v.as_str())))
    }

    /// Number of distinct header names.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.name.eq_ignore_ascii_case(name))
    }
}
