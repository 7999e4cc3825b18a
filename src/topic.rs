use std::fmt;

use serde::{Deserialize, Serialize};

/// Final topic element that marks a publication as local-only: the network
/// endpoint dispatches it to its own subscribers but never forwards it to
/// the broker.
pub const LOCAL_SUFFIX: &str = "*local";

/// A hierarchical topic: an ordered sequence of short strings.
///
/// The empty sequence is the root. Subscribing to a topic also receives
/// every publication on topics below it, so a subscriber on `("a", "b")`
/// sees `("a", "b", "c")`.
///
/// Conversions encode the accepted shorthands: a bare string is a length-1
/// topic, `None` is the root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Topic(Vec<String>);

impl Topic {
    pub const fn root() -> Self {
        Topic(Vec::new())
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn elements(&self) -> &[String] {
        &self.0
    }

    /// The topic with the last element dropped, or `None` at the root.
    pub fn parent(&self) -> Option<Topic> {
        let (_, prefix) = self.0.split_last()?;
        Some(Topic(prefix.to_vec()))
    }

    /// True when the final element is [`LOCAL_SUFFIX`].
    pub fn is_local(&self) -> bool {
        self.0.last().map(String::as_str) == Some(LOCAL_SUFFIX)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            return f.write_str("/");
        }
        for element in &self.0 {
            write!(f, "/{element}")?;
        }
        Ok(())
    }
}

impl From<&str> for Topic {
    fn from(value: &str) -> Self {
        Topic(vec![value.to_owned()])
    }
}

impl From<String> for Topic {
    fn from(value: String) -> Self {
        Topic(vec![value])
    }
}

impl From<Vec<String>> for Topic {
    fn from(value: Vec<String>) -> Self {
        Topic(value)
    }
}

impl From<&[&str]> for Topic {
    fn from(value: &[&str]) -> Self {
        value.iter().copied().collect()
    }
}

impl<const N: usize> From<[&str; N]> for Topic {
    fn from(value: [&str; N]) -> Self {
        value.into_iter().collect()
    }
}

impl From<()> for Topic {
    fn from(_: ()) -> Self {
        Topic::root()
    }
}

impl<T: Into<Topic>> From<Option<T>> for Topic {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(topic) => topic.into(),
            None => Topic::root(),
        }
    }
}

impl FromIterator<String> for Topic {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        Topic(iter.into_iter().collect())
    }
}

impl<'a> FromIterator<&'a str> for Topic {
    fn from_iter<I: IntoIterator<Item = &'a str>>(iter: I) -> Self {
        Topic(iter.into_iter().map(str::to_owned).collect())
    }
}
