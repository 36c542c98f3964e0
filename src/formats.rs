//! Payload encodings. Both ends of a connection must agree on one; nothing
//! on the wire says which is in use.
//!
//! JSON is the default feature since payloads stay readable in captures.
//! MessagePack is smaller and keeps every `i64` exact.

use serde::{Deserialize, Serialize};
use std::io;
use std::io::Write;

/// Encodes call and reply payloads. Failures surface as
/// [`RpcError::SerdeError`](crate::RpcError::SerdeError).
pub trait SerdeFormat: Send + Sync + Clone + 'static {
    fn serialize_to_writer<W, T>(&self, writer: W, value: &T) -> io::Result<()>
    where
        W: Write,
        T: ?Sized + Serialize;

    fn deserialize_from_slice<'a, T>(&self, v: &'a [u8]) -> io::Result<T>
    where
        T: Deserialize<'a>;
}

/// `serde_json`, one compact document per payload.
#[cfg(feature = "format_json")]
#[derive(Clone, Copy, Default, Debug)]
pub struct JsonFormat;

#[cfg(feature = "format_json")]
impl SerdeFormat for JsonFormat {
    fn serialize_to_writer<W, T>(&self, writer: W, value: &T) -> io::Result<()>
    where
        W: Write,
        T: ?Sized + Serialize,
    {
        Ok(serde_json::to_writer(writer, value)?)
    }

    fn deserialize_from_slice<'a, T>(&self, v: &'a [u8]) -> io::Result<T>
    where
        T: Deserialize<'a>,
    {
        Ok(serde_json::from_slice(v)?)
    }
}

/// `rmp-serde` with structs encoded as arrays.
#[cfg(feature = "format_message_pack")]
#[derive(Clone, Copy, Default, Debug)]
pub struct MessagePackFormat;

#[cfg(feature = "format_message_pack")]
impl SerdeFormat for MessagePackFormat {
    fn serialize_to_writer<W, T>(&self, mut writer: W, value: &T) -> io::Result<()>
    where
        W: Write,
        T: ?Sized + Serialize,
    {
        rmp_serde::encode::write(&mut writer, value).map_err(io::Error::other)
    }

    fn deserialize_from_slice<'a, T>(&self, v: &'a [u8]) -> io::Result<T>
    where
        T: Deserialize<'a>,
    {
        rmp_serde::from_slice(v).map_err(io::Error::other)
    }
}
