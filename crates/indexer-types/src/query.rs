//! Delete query construction.
//!
//! Delete queries are opaque strings to the pipeline. Built-in handlers use
//! quoted term queries so paths containing `:` or `/` survive query parsing.

use crate::document::FIELD_ID;

/// Quote a term: wrap in `"` and backslash-escape `\` and `"`.
pub fn quote_term(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for c in value.chars() {
        if c == '"' || c == '\\' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}

/// `field:"value"`
pub fn term_query(field: &str, value: &str) -> String {
    format!("{}:{}", field, quote_term(value))
}

/// Query matching the document whose id is `id`.
pub fn id_query(id: &str) -> String {
    term_query(FIELD_ID, id)
}
