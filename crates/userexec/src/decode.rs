//! Decoding of subprocess output into rows.

use userexec_protocol::Row;

use crate::error::DecodeError;

/// Parse `raw` as a JSON array of string-keyed, string-valued records.
///
/// Decoding is all or nothing: any malformed record fails the whole output.
pub fn decode(raw: &[u8]) -> Result<Vec<Row>, DecodeError> {
    serde_json::from_slice(raw).map_err(|source| DecodeError {
        bytes: raw.len(),
        source,
    })
}
