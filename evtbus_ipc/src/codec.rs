//! Record (de)serialization hooks and the per-run type descriptor

use crate::error::{IpcError, IpcResult};
use crate::framing::ByteOrder;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use tracing::debug;

/// Type descriptor sent once per run ahead of the first event
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StreamerInfo {
    /// Fully qualified record type name
    pub type_name: String,
    /// Bumped whenever the record layout changes
    pub schema_version: u32,
    /// Byte order of the sending host
    pub byte_order: ByteOrder,
}

impl StreamerInfo {
    /// JSON payload for a `StreamerInfo` frame
    pub fn to_payload(&self) -> IpcResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse a `StreamerInfo` frame payload. Garbage is a corrupt frame.
    pub fn from_payload(payload: &[u8]) -> IpcResult<Self> {
        serde_json::from_slice(payload)
            .map_err(|e| IpcError::corrupt(format!("unreadable streamer descriptor: {e}")))
    }
}

/// Turns the caller's records into payload bytes and back.
///
/// The transport never looks inside a payload; it only calls these hooks
/// once per event.
pub trait RecordCodec<T> {
    /// Descriptor announcing the record type to consumers
    fn descriptor(&self) -> StreamerInfo;

    /// Check a descriptor received from the producer side.
    fn accept_descriptor(&mut self, info: &StreamerInfo) -> IpcResult<()>;

    /// Encode one record
    fn serialize_record(&self, record: &T) -> IpcResult<Vec<u8>>;

    /// Decode one record
    fn deserialize_record(&self, bytes: &[u8]) -> IpcResult<T>;
}

/// Default codec: bincode with its fixed little-endian integer encoding
#[derive(Debug, Clone)]
pub struct BincodeCodec<T> {
    schema_version: u32,
    _record: PhantomData<fn() -> T>,
}

impl<T> BincodeCodec<T> {
    /// Codec for schema version 1
    pub fn new() -> Self {
        Self::with_schema_version(1)
    }

    /// Codec for an explicit schema version
    pub fn with_schema_version(schema_version: u32) -> Self {
        Self {
            schema_version,
            _record: PhantomData,
        }
    }
}

impl<T> Default for BincodeCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> RecordCodec<T> for BincodeCodec<T>
where
    T: Serialize + DeserializeOwned,
{
    fn descriptor(&self) -> StreamerInfo {
        StreamerInfo {
            type_name: std::any::type_name::<T>().to_string(),
            schema_version: self.schema_version,
            byte_order: ByteOrder::native(),
        }
    }

    fn accept_descriptor(&mut self, info: &StreamerInfo) -> IpcResult<()> {
        let expected = self.descriptor();
        if info.type_name != expected.type_name || info.schema_version != expected.schema_version {
            return Err(IpcError::corrupt(format!(
                "descriptor for {} v{} does not match {} v{}",
                info.type_name, info.schema_version, expected.type_name, expected.schema_version
            )));
        }
        if info.byte_order != expected.byte_order {
            debug!(
                remote = ?info.byte_order,
                local = ?expected.byte_order,
                "peer has different native byte order; wire format is little-endian"
            );
        }
        Ok(())
    }

    fn serialize_record(&self, record: &T) -> IpcResult<Vec<u8>> {
        Ok(bincode::serialize(record)?)
    }

    fn deserialize_record(&self, bytes: &[u8]) -> IpcResult<T> {
        Ok(bincode::deserialize(bytes)?)
    }
}
