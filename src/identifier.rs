use std::fmt;

use crate::error::ToolError;

/// Longest identifier MySQL accepts for tables and columns.
pub const MAX_IDENTIFIER_LEN: usize = 64;

/// Validates that an identifier (table name, database name) contains only ASCII letters,
/// digits or underscores. Identifiers cannot be bound as parameters in statements such as
/// `SHOW INDEX FROM`, so this check is what keeps them from carrying SQL.
pub fn is_valid_identifier(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_IDENTIFIER_LEN
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// A table or schema name that passed the allow-list.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identifier(String);

impl Identifier {
    /// Validates `value` as the argument named `param`.
    pub fn parse(param: &str, value: &str) -> Result<Self, ToolError> {
        if is_valid_identifier(value) {
            Ok(Identifier(value.to_string()))
        } else {
            Err(ToolError::invalid_argument(
                param,
                format!(
                    "'{value}' is not a valid identifier: use 1-{MAX_IDENTIFIER_LEN} letters, digits or underscores"
                ),
            ))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Backtick-quoted form for splicing into a statement.
    pub fn quoted(&self) -> String {
        format!("`{}`", self.0)
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_valid_identifier() {
        assert!(is_valid_identifier("users"));
        assert!(is_valid_identifier("my_table_123"));
        assert!(is_valid_identifier("_hidden"));
        assert!(is_valid_identifier("CamelCase"));
        assert!(is_valid_identifier("123"));

        assert!(!is_valid_identifier(""));
        assert!(!is_valid_identifier("users; DROP TABLE users"));
        assert!(!is_valid_identifier("users; DROP TABLE x"));
        assert!(!is_valid_identifier("users--"));
        assert!(!is_valid_identifier("table with spaces"));
        assert!(!is_valid_identifier("table-with-dashes"));
        assert!(!is_valid_identifier("`users`"));
        assert!(!is_valid_identifier("tàble"));
        assert!(!is_valid_identifier(&"a".repeat(MAX_IDENTIFIER_LEN + 1)));
    }

    #[test]
    fn test_parse_names_offending_parameter() {
        match Identifier::parse("table", "orders' OR '1'='1") {
            Err(ToolError::InvalidArgument { param, .. }) => assert_eq!(param, "table"),
            other => panic!("expected InvalidArgument, got {other:?}"),
        }
    }

    #[test]
    fn test_quoted() {
        let id = Identifier::parse("table", "orders").unwrap();
        assert_eq!(id.quoted(), "`orders`");
        assert_eq!(id.to_string(), "orders");
    }
}
