use std::any::Any;

use log::*;
use serde::{de::DeserializeOwned, Serialize};

/// A schema-shaped value carried in the data region of a frame.
///
/// The runtime only moves bytes; requests and responses implement this to
/// plug their serialization in. Every `serde` type gets it for free via
/// MessagePack below, which is what the service glue is expected to use.
pub trait Body: Any + Send {
    /// Append the encoded value to `out`.
    fn encode(&self, out: &mut Vec<u8>) -> bool;

    /// Replace `self` with the value decoded from `buf`.
    fn decode(&mut self, buf: &[u8]) -> bool;

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;

    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

impl<T> Body for T
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    #[inline(always)]
    fn encode(&self, out: &mut Vec<u8>) -> bool {
        match rmp_serde::encode::write_named(out, self) {
            Ok(_) => true,
            Err(e) => {
                error!("body encode error: {:?}", e);
                false
            }
        }
    }

    #[inline(always)]
    fn decode(&mut self, buf: &[u8]) -> bool {
        match rmp_serde::decode::from_slice::<T>(buf) {
            Ok(v) => {
                *self = v;
                true
            }
            Err(e) => {
                warn!("body decode error: {:?}", e);
                false
            }
        }
    }

    #[inline(always)]
    fn as_any(&self) -> &dyn Any {
        self
    }

    #[inline(always)]
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    #[inline(always)]
    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

impl dyn Body {
    /// Recover the concrete response type after a completion fired.
    #[inline]
    pub fn downcast<T: Any>(self: Box<Self>) -> Option<Box<T>> {
        self.into_any().downcast::<T>().ok()
    }
}
