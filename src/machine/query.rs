use std::fmt;

/// Read request understood by every [`DiskKv`](super::DiskKv) machine.
#[derive(Clone, PartialEq, Eq)]
pub enum Query {
    /// The value stored under a single key.
    Point(Vec<u8>),
    /// Values with `start <= key < end`, in key order. Only history-style machines answer it.
    Range { start: Vec<u8>, end: Vec<u8> },
    /// Every user value, in key order, as a JSON array.
    Wildcard,
    /// Number of user keys, as a JSON number.
    Count,
}

impl Query {
    pub fn id(id: u64) -> Query {
        Query::Point(id.to_be_bytes().to_vec())
    }

    pub fn key<K: AsRef<[u8]>>(key: K) -> Query {
        Query::Point(key.as_ref().to_vec())
    }

    pub fn range(start: u64, end: u64) -> Query {
        Query::Range {
            start: start.to_be_bytes().to_vec(),
            end: end.to_be_bytes().to_vec(),
        }
    }
}

impl fmt::Debug for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Query::Point(key) => write!(f, "Point({})", display_key(key)),
            Query::Range { start, end } => {
                write!(f, "Range({}..{})", display_key(start), display_key(end))
            }
            Query::Wildcard => write!(f, "Wildcard"),
            Query::Count => write!(f, "Count"),
        }
    }
}

fn display_key(key: &[u8]) -> String {
    match <[u8; 8]>::try_from(key) {
        Ok(bytes) => u64::from_be_bytes(bytes).to_string(),
        Err(_) => String::from_utf8_lossy(key).into_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_shows_ids() {
        assert_eq!(format!("{:?}", Query::id(42)), "Point(42)");
        assert_eq!(format!("{:?}", Query::key("root@localhost")), "Point(root@localhost)");
    }
}
