//! Header provider pipeline.
//!
//! Providers contribute outgoing HTTP headers and run before every attempt
//! and every reconnect, in tier order: global, then rpc-level, then
//! operation-level. Within a tier they run in registration order, later
//! values replacing earlier ones for the same name. A provider error aborts
//! the call with no retry.

use crate::error::{category, Error, Result};
use http::header::{HeaderMap, HeaderName, HeaderValue};
use std::sync::Arc;

/// A callable producing headers for one attempt.
///
/// Dynamic providers (auth tokens, trace ids) are re-invoked per attempt so
/// a refreshed value always wins.
pub type HeaderProvider = Arc<dyn Fn() -> Result<Vec<(String, String)>> + Send + Sync>;

/// Fixed headers as a provider.
pub fn static_provider(headers: Vec<(String, String)>) -> HeaderProvider {
    Arc::new(move || Ok(headers.clone()))
}

/// Run one provider tier and merge its headers into `out`.
pub(crate) fn apply(out: &mut HeaderMap, providers: &[HeaderProvider]) -> Result<()> {
    for provider in providers {
        for (name, value) in provider()? {
            let header_name = HeaderName::try_from(name.as_str()).map_err(|e| {
                Error::new(format!("invalid header name {name:?}: {e}"))
                    .with_category(category::CLIENT)
            })?;
            let header_value = HeaderValue::try_from(value.as_str()).map_err(|e| {
                Error::new(format!("invalid value for header {name}: {e}"))
                    .with_category(category::CLIENT)
            })?;
            out.insert(header_name, header_value);
        }
    }
    Ok(())
}
