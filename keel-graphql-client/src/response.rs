//! GraphQL response types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{GraphQLError, Result};

/// Result payload of a single GraphQL operation: `{ data?, errors? }`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct GraphQLResponse<T = Value> {
    /// The data returned by the query/mutation.
    #[serde(default)]
    pub data: Option<T>,
    /// Errors returned by the server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<GraphQLResponseError>>,
    /// Extensions (tracing, cost info, etc.).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Value>,
}

impl<T> GraphQLResponse<T> {
    /// Response carrying only data.
    pub fn from_data(data: T) -> Self {
        Self {
            data: Some(data),
            errors: None,
            extensions: None,
        }
    }

    /// Response carrying only errors.
    pub fn from_errors(errors: Vec<GraphQLResponseError>) -> Self {
        Self {
            data: None,
            errors: Some(errors),
            extensions: None,
        }
    }

    /// Check if the response has errors.
    pub fn has_errors(&self) -> bool {
        self.errors.as_ref().is_some_and(|e| !e.is_empty())
    }

    /// Get the data, failing with [`GraphQLError::Validation`] when the server
    /// reported errors.
    pub fn into_result(self) -> Result<T> {
        if let Some(errors) = self.errors
            && !errors.is_empty()
        {
            return Err(GraphQLError::Validation(errors));
        }
        self.data.ok_or(GraphQLError::EmptyResponse)
    }
}

/// A GraphQL error from the server.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct GraphQLResponseError {
    /// Error message.
    pub message: String,
    /// Locations in the query where the error occurred.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locations: Option<Vec<ErrorLocation>>,
    /// Path to the field that caused the error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<Vec<PathSegment>>,
    /// Additional error extensions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Value>,
}

impl GraphQLResponseError {
    /// Error with just a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            locations: None,
            path: None,
            extensions: None,
        }
    }
}

impl std::fmt::Display for GraphQLResponseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(path) = &self.path
            && !path.is_empty()
        {
            write!(f, " (path: {})", format_path(path))?;
        }
        if let Some(locations) = &self.locations
            && !locations.is_empty()
        {
            write!(f, " at ")?;
            for (i, loc) in locations.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}:{}", loc.line, loc.column)?;
            }
        }
        Ok(())
    }
}

/// Location in the GraphQL document.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ErrorLocation {
    /// Line number (1-indexed).
    pub line: u32,
    /// Column number (1-indexed).
    pub column: u32,
}

/// Path segment in a GraphQL error.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum PathSegment {
    /// Field name.
    Field(String),
    /// List index.
    Index(usize),
}

impl std::fmt::Display for PathSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Field(name) => write!(f, "{}", name),
            Self::Index(idx) => write!(f, "[{}]", idx),
        }
    }
}

/// Format a path as `user.posts.[0].title`.
pub fn format_path(path: &[PathSegment]) -> String {
    path.iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>()
        .join(".")
}
