//! redb table definitions for the result store.

use redb::TableDefinition;

/// Result envelopes keyed by `{registry}/{probe}/{start}`, JSON-encoded.
pub const RESULTS: TableDefinition<&str, &[u8]> = TableDefinition::new("results");
