use std::collections::HashMap;

/// The credential table a mail node authenticates clients against.
///
/// Lookups are plain equality on a fixed, in-memory table; there is no
/// hashing and no way to change a password while the node is running.
#[derive(Clone, Debug, Default)]
pub struct Users(HashMap<String, String>);

impl Users {
    pub fn new() -> Self {
        Self::default()
    }

    /// A small fixed table (`u1`/`p1` through `u4`/`p4`), handy for demos
    /// and tests.
    pub fn demo() -> Self {
        (1..=4).map(|n| (format!("u{n}"), format!("p{n}"))).collect()
    }

    /// Add a user, replacing any existing password for the same id.
    pub fn insert(&mut self, id: impl Into<String>, password: impl Into<String>) {
        self.0.insert(id.into(), password.into());
    }

    /// Builder-style [`insert`][Users::insert].
    pub fn with_user(mut self, id: impl Into<String>, password: impl Into<String>) -> Self {
        self.insert(id, password);
        self
    }

    /// Check a credential pair against the table.
    pub fn verify(&self, id: &str, password: &str) -> bool {
        self.0.get(id).map_or(false, |expected| expected == password)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Users {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(
            iter.into_iter()
                .map(|(id, password)| (id.into(), password.into()))
                .collect(),
        )
    }
}
