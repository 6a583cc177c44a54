//! The single wire envelope exchanged between client and server.
//!
//! Every response body -- a procedure reply or one SSE event -- is one
//! `{ok, output, error}` record. Exactly one of `output` / `error` is
//! meaningful: decoders reject payloads where `ok = true` but `output` is
//! absent, or `ok = false` but the error message is empty.
//!
//! The type parameter exists for typing only; on the wire `output` is an
//! opaque JSON value until a typed wrapper decodes it.

use crate::error::{category, Error, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

/// Response envelope, parameterised over the output type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T = Value> {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub output: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<Error>,
}

impl<T> Envelope<T> {
    /// Successful envelope carrying an output value.
    pub fn success(output: T) -> Self {
        Self {
            ok: true,
            output: Some(output),
            error: None,
        }
    }

    /// Failure envelope carrying a structured error.
    pub fn failure(error: Error) -> Self {
        Self {
            ok: false,
            output: None,
            error: Some(error),
        }
    }

    /// Check the `ok`/`output`/`error` coherence rules.
    pub fn validate(&self) -> Result<()> {
        if self.ok {
            if self.output.is_none() {
                return Err(Error::new("envelope marked ok without output")
                    .with_category(category::PROTOCOL));
            }
        } else {
            match &self.error {
                Some(e) if !e.message.is_empty() => {}
                _ => {
                    return Err(Error::new("envelope error is missing a message")
                        .with_category(category::PROTOCOL));
                }
            }
        }
        Ok(())
    }

    /// Collapse into a `Result`, consuming the envelope.
    pub fn into_result(self) -> Result<T> {
        if self.ok {
            match self.output {
                Some(v) => Ok(v),
                None => Err(Error::new("envelope marked ok without output")
                    .with_category(category::PROTOCOL)),
            }
        } else {
            match self.error {
                Some(e) => Err(e),
                None => Err(Error::new("envelope error is missing a message")
                    .with_category(category::PROTOCOL)),
            }
        }
    }
}

/// Decode and validate an envelope from raw response bytes.
///
/// Both parse failures and coherence violations surface as `ProtocolError`.
pub fn decode(bytes: &[u8]) -> Result<Envelope<Value>> {
    let env: Envelope<Value> = serde_json::from_slice(bytes).map_err(|e| {
        Error::new(format!("invalid response envelope: {e}")).with_category(category::PROTOCOL)
    })?;
    env.validate()?;
    Ok(env)
}

/// Decode the opaque output blob into the expected type.
///
/// This is the final step a typed generated wrapper performs; `op` names the
/// operation for the error message.
pub fn decode_output<T: DeserializeOwned>(op: &str, output: Value) -> Result<T> {
    serde_json::from_value(output)
        .map_err(|e| Error::new(format!("failed to decode {op} output: {e}")))
}
