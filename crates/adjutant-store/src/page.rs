//! Cursor pagination, newest first.

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use serde::{Deserialize, Serialize};

use crate::StoreError;

/// Default page size.
pub const DEFAULT_LIMIT: u32 = 50;

/// Largest page a caller may ask for.
pub const MAX_LIMIT: u32 = 200;

/// Position after the last row of a page.
///
/// Rows are ordered by `(created_at, id)` descending; the next page starts
/// strictly below this key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor {
    pub created_at_ms: i64,
    pub id: String,
}

impl Cursor {
    /// Opaque string form handed to clients.
    #[must_use]
    pub fn encode(&self) -> String {
        URL_SAFE_NO_PAD.encode(format!("{}:{}", self.created_at_ms, self.id))
    }

    /// Parse a string produced by [`Cursor::encode`].
    ///
    /// # Errors
    /// Returns `InvalidCursor` for anything that is not a cursor.
    pub fn decode(raw: &str) -> Result<Self, StoreError> {
        let invalid = || StoreError::InvalidCursor(raw.to_string());
        let bytes = URL_SAFE_NO_PAD.decode(raw).map_err(|_| invalid())?;
        let text = String::from_utf8(bytes).map_err(|_| invalid())?;
        let (ms, id) = text.split_once(':').ok_or_else(invalid)?;
        if id.is_empty() {
            return Err(invalid());
        }
        Ok(Self {
            created_at_ms: ms.parse().map_err(|_| invalid())?,
            id: id.to_string(),
        })
    }
}

/// Page request as received from callers.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PageRequest {
    pub cursor: Option<String>,
    pub limit: Option<u32>,
}

impl PageRequest {
    /// First page of `limit` rows.
    #[must_use]
    pub const fn first(limit: u32) -> Self {
        Self {
            cursor: None,
            limit: Some(limit),
        }
    }

    /// Page following `cursor`.
    #[must_use]
    pub fn after(cursor: impl Into<String>, limit: u32) -> Self {
        Self {
            cursor: Some(cursor.into()),
            limit: Some(limit),
        }
    }

    /// Effective page size.
    #[must_use]
    pub fn limit(&self) -> u32 {
        self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
    }

    pub(crate) fn cursor(&self) -> Result<Option<Cursor>, StoreError> {
        self.cursor
            .as_deref()
            .filter(|c| !c.is_empty())
            .map(Cursor::decode)
            .transpose()
    }
}

/// One page of results.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Present when more rows follow.
    pub next_cursor: Option<String>,
}

impl<T> Page<T> {
    /// Build a page from `limit + 1` fetched rows.
    pub(crate) fn from_overfetch(mut rows: Vec<T>, limit: u32, key: impl Fn(&T) -> Cursor) -> Self {
        let limit = limit as usize;
        let has_more = rows.len() > limit;
        rows.truncate(limit);
        let next_cursor = if has_more {
            rows.last().map(|last| key(last).encode())
        } else {
            None
        };
        Self {
            items: rows,
            next_cursor,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_survives_encoding() {
        let cursor = Cursor {
            created_at_ms: 1_700_000_000_123,
            id: "6f1c-uuid".to_string(),
        };
        assert_eq!(Cursor::decode(&cursor.encode()).unwrap(), cursor);
    }

    #[test]
    fn garbage_cursor_is_rejected() {
        assert!(matches!(Cursor::decode("%%%"), Err(StoreError::InvalidCursor(_))));
        let no_sep = URL_SAFE_NO_PAD.encode("12345");
        assert!(Cursor::decode(&no_sep).is_err());
        let bad_ms = URL_SAFE_NO_PAD.encode("abc:id");
        assert!(Cursor::decode(&bad_ms).is_err());
    }

    #[test]
    fn limit_is_clamped() {
        assert_eq!(PageRequest::default().limit(), DEFAULT_LIMIT);
        assert_eq!(PageRequest::first(0).limit(), 1);
        assert_eq!(PageRequest::first(10_000).limit(), MAX_LIMIT);
    }

    #[test]
    fn overfetch_sets_next_cursor() {
        let key = |n: &i64| Cursor {
            created_at_ms: *n,
            id: n.to_string(),
        };
        let page = Page::from_overfetch(vec![5, 4, 3], 2, key);
        assert_eq!(page.items, vec![5, 4]);
        assert_eq!(Cursor::decode(page.next_cursor.as_deref().unwrap()).unwrap().created_at_ms, 4);

        let last = Page::from_overfetch(vec![2, 1], 2, key);
        assert!(last.next_cursor.is_none());
    }
}
