//! JSON packager using `serde_json`.
//!
//! JSON text never contains raw control characters (they are escaped
//! inside strings), so packed messages can travel inside an STX/ETX frame
//! without colliding with the line's delimiters.
//!
//! # Example
//!
//! ```
//! use visa1_link::codec::{JsonPackager, Packager};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize, PartialEq, Debug)]
//! struct Auth {
//!     mti: String,
//!     pan: String,
//! }
//!
//! let packager = JsonPackager::<Auth>::new();
//! let msg = Auth { mti: "0100".into(), pan: "4300000000000001".into() };
//! let packed = packager.pack(&msg).unwrap();
//! assert_eq!(packager.unpack(&packed).unwrap(), msg);
//! ```

use std::marker::PhantomData;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::Packager;
use crate::error::Result;

/// Packager for any serde message type, encoded as compact JSON.
pub struct JsonPackager<T> {
    _message: PhantomData<fn() -> T>,
}

impl<T> JsonPackager<T> {
    /// Create a packager for `T`.
    pub fn new() -> Self {
        Self {
            _message: PhantomData,
        }
    }
}

impl<T> Default for JsonPackager<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Packager for JsonPackager<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    type Message = T;

    fn pack(&self, message: &T) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(message)?))
    }

    fn unpack(&self, payload: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(payload)?)
    }
}
