//! Request encoding into relay URL query strings.

use regex::Regex;
use serde::Serialize;
use std::sync::OnceLock;

use crate::{Error, Result};

/// Indexed keys as emitted percent-encoded by the query serializer.
fn indexed_key_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"%5B([0-9]+)%5D=").expect("indexed key pattern is valid"))
}

/// Encode a request value into the query string expected by the relay.
///
/// Fields appear in declaration order. Array fields come out as
/// `command[0]=sh&command[1]=-c`: the relay does not accept the
/// percent-encoded `command%5B0%5D=` form, so it is rewritten after
/// serialization.
pub fn encode_query<R: Serialize>(request: &R) -> Result<String> {
    let raw = serde_qs::to_string(request).map_err(|e| Error::Encoding(e.to_string()))?;
    Ok(indexed_key_pattern().replace_all(&raw, "[${1}]=").into_owned())
}
