use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::AppError;
use crate::AppResult;

/// Application payload codec: how a value becomes frame payload bytes and
/// back.
///
/// `Vec<u8>` is carried raw; `String` and `serde_json::Value` travel as
/// canonical JSON text. For arbitrary serde types, wrap them in [`Json`].
pub trait Payload: Sized + Send + Sync + 'static {
    fn encode(&self) -> AppResult<Vec<u8>>;
    fn decode(bytes: &[u8]) -> AppResult<Self>;
}

impl Payload for Vec<u8> {
    fn encode(&self) -> AppResult<Vec<u8>> {
        Ok(self.clone())
    }

    fn decode(bytes: &[u8]) -> AppResult<Self> {
        Ok(bytes.to_vec())
    }
}

impl Payload for String {
    fn encode(&self) -> AppResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    fn decode(bytes: &[u8]) -> AppResult<Self> {
        serde_json::from_slice(bytes).map_err(|_| AppError::InvalidMessagePayload)
    }
}

impl Payload for serde_json::Value {
    fn encode(&self) -> AppResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    fn decode(bytes: &[u8]) -> AppResult<Self> {
        serde_json::from_slice(bytes).map_err(|_| AppError::InvalidMessagePayload)
    }
}

/// JSON adapter for any serde-capable type.
#[derive(Debug, Clone, PartialEq)]
pub struct Json<T>(pub T);

impl<T> Payload for Json<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn encode(&self) -> AppResult<Vec<u8>> {
        Ok(serde_json::to_vec(&self.0)?)
    }

    fn decode(bytes: &[u8]) -> AppResult<Self> {
        serde_json::from_slice(bytes)
            .map(Json)
            .map_err(|_| AppError::InvalidMessagePayload)
    }
}
