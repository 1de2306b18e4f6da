use serde::{de::DeserializeOwned, Serialize};

/// Payload codec used by the typed helpers. Errors are plain strings so they
/// can flow into `OrchestrationError::Failed` or a terminal side-effect error.
pub trait Codec {
    fn encode<T: Serialize>(v: &T) -> Result<String, String>;
    fn decode<T: DeserializeOwned>(s: &str) -> Result<T, String>;
}

pub struct Json;

impl Codec for Json {
    fn encode<T: Serialize>(v: &T) -> Result<String, String> {
        serde_json::to_string(v).map_err(|e| format!("encode: {e}"))
    }

    fn decode<T: DeserializeOwned>(s: &str) -> Result<T, String> {
        serde_json::from_str(s).map_err(|e| format!("decode: {e}"))
    }
}
