use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::{IntoParams, ToSchema};

/// Immutable predicate fixed for the lifetime of a tail session.
///
/// `search` is matched case-insensitively against several record fields with
/// OR semantics; `conversation_id` narrows conversation tails to one thread.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
pub struct TailFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    search: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    conversation_id: Option<String>,
}

impl TailFilter {
    #[must_use]
    pub fn new(search: Option<String>, conversation_id: Option<String>) -> Self {
        let normalize = |value: Option<String>| {
            value
                .map(|raw| raw.trim().to_string())
                .filter(|trimmed| !trimmed.is_empty())
        };
        Self {
            search: normalize(search),
            conversation_id: normalize(conversation_id),
        }
    }

    #[must_use]
    pub fn search(&self) -> Option<&str> {
        self.search.as_deref()
    }

    #[must_use]
    pub fn conversation_id(&self) -> Option<&str> {
        self.conversation_id.as_deref()
    }

    /// True when any of `fields` contains the search term, ignoring case.
    /// An absent search term matches everything.
    pub fn matches_any<'a, I>(&self, fields: I) -> bool
    where
        I: IntoIterator<Item = &'a str>,
    {
        let Some(term) = self.search.as_deref() else {
            return true;
        };
        let needle = term.to_lowercase();
        fields
            .into_iter()
            .any(|field| field.to_lowercase().contains(&needle))
    }

    /// True when the scope is unset or equals `conversation_id`.
    #[must_use]
    pub fn in_scope(&self, conversation_id: &str) -> bool {
        self.conversation_id
            .as_deref()
            .is_none_or(|scope| scope == conversation_id)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PageError {
    #[error("page must be at least 1")]
    InvalidPage,
    #[error("limit must be between 1 and {max}")]
    InvalidLimit { max: u32 },
}

/// Raw query parameters accepted by the tail endpoints.
#[derive(Debug, Clone, Default, Serialize, Deserialize, IntoParams, ToSchema)]
#[into_params(parameter_in = Query)]
pub struct TailQuery {
    /// Free text, case-insensitive, matched against several fields.
    pub search: Option<String>,
    /// 1-based page of the backlog.
    pub page: Option<u32>,
    /// Records per page.
    pub limit: Option<u32>,
    /// Snapshot mode: fetch the entire matching set.
    #[serde(default)]
    pub all: bool,
    /// Restrict a conversation tail to one conversation.
    pub conversation_id: Option<String>,
}

/// Validated pagination window for the backlog fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct PageRequest {
    pub page: u32,
    pub limit: u32,
    pub all: bool,
}

impl PageRequest {
    pub fn new(page: u32, limit: u32, all: bool, max_limit: u32) -> Result<Self, PageError> {
        if page == 0 {
            return Err(PageError::InvalidPage);
        }
        if !all && (limit == 0 || limit > max_limit) {
            return Err(PageError::InvalidLimit { max: max_limit });
        }
        Ok(Self { page, limit, all })
    }

    #[must_use]
    pub fn skip(&self) -> u64 {
        if self.all {
            0
        } else {
            u64::from(self.page - 1) * u64::from(self.limit)
        }
    }
}

impl TailQuery {
    /// Split the raw query into the session filter and its page window.
    pub fn resolve(
        &self,
        default_limit: u32,
        max_limit: u32,
    ) -> Result<(TailFilter, PageRequest), PageError> {
        let page = PageRequest::new(
            self.page.unwrap_or(1),
            self.limit.unwrap_or(default_limit),
            self.all,
            max_limit,
        )?;
        let filter = TailFilter::new(self.search.clone(), self.conversation_id.clone());
        Ok((filter, page))
    }
}
