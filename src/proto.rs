use std::fmt;
use std::mem::size_of;

use serde_derive::{Deserialize, Serialize};
use zerocopy::byteorder::{BigEndian, U16, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

/// Frame header:
///
/// Fixed len of FrameHead = 11B, all fields network order
/// | 4B      | 4B   | 2B   | 1B   |
/// | payload | data | meta | comp |
///
/// The body is `payload` bytes; after decompression it holds `meta` bytes
/// of meta followed by `data` bytes of application data.
#[derive(FromZeroes, FromBytes, AsBytes, Unaligned, Clone, Copy, PartialEq)]
#[repr(C)]
pub struct FrameHead {
    pub payload: U32<BigEndian>,
    pub data: U32<BigEndian>,
    pub meta: U16<BigEndian>,
    pub comp: u8,
}

pub const FRAME_HEAD_LEN: usize = size_of::<FrameHead>();

/// Field bounds. Data and payload stay below i32::MAX so either side can
/// hold sizes in a signed int without surprises.
pub const MAX_META_LEN: u32 = 65535;
pub const MAX_DATA_LEN: u32 = 2147483647 - 65535;
pub const MAX_PAYLOAD_LEN: u32 = 2147483647;

impl FrameHead {
    #[inline(always)]
    pub fn new(payload: usize, data: usize, meta: usize, comp: u8) -> Self {
        Self {
            payload: U32::new(payload as u32),
            data: U32::new(data as u32),
            meta: U16::new(meta as u16),
            comp,
        }
    }

    /// Validate an incoming header. A violation is fatal for the
    /// connection.
    #[inline]
    pub fn check(&self) -> bool {
        if self.meta.get() as u32 > MAX_META_LEN {
            return false;
        }
        if self.data.get() > MAX_DATA_LEN {
            return false;
        }
        if self.payload.get() > MAX_PAYLOAD_LEN {
            return false;
        }
        true
    }
}

impl fmt::Debug for FrameHead {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[payload:{}, data:{}, meta:{}, comp:{}]",
            self.payload.get(),
            self.data.get(),
            self.meta.get(),
            self.comp,
        )
    }
}

/// Schema-encoded descriptor carried in the meta region of every frame.
///
/// Requests fill `service`/`method`; responses echo `seq` and may carry an
/// error `code`. A cancel notification sets `cancel` and carries no data.
#[derive(Serialize, Deserialize, Default, Clone, PartialEq)]
pub struct Meta {
    #[serde(rename = "s")]
    pub seq: u64,
    #[serde(rename = "sv", default, skip_serializing_if = "String::is_empty")]
    pub service: String,
    #[serde(rename = "m", default, skip_serializing_if = "String::is_empty")]
    pub method: String,
    #[serde(rename = "z", default)]
    pub compression: u8,
    #[serde(rename = "x", default)]
    pub cancel: bool,
    #[serde(rename = "c", default)]
    pub code: u32,
    #[serde(rename = "e", default, skip_serializing_if = "String::is_empty")]
    pub error_text: String,
}

impl Meta {
    /// Append the encoded meta to `out`, returning the number of bytes
    /// written.
    #[inline]
    pub fn encode(&self, out: &mut Vec<u8>) -> Result<usize, ()> {
        let before = out.len();
        match rmp_serde::encode::write_named(out, self) {
            Ok(_) => Ok(out.len() - before),
            Err(e) => {
                log::error!("{} meta encode error: {:?}", self, e);
                Err(())
            }
        }
    }

    #[inline]
    pub fn decode(buf: &[u8]) -> Result<Meta, ()> {
        match rmp_serde::decode::from_slice::<Meta>(buf) {
            Ok(m) => Ok(m),
            Err(e) => {
                log::warn!("meta decode error: {:?}", e);
                Err(())
            }
        }
    }
}

impl fmt::Display for Meta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.cancel {
            return write!(f, "[seq:{} cancel]", self.seq);
        }
        if self.method.is_empty() {
            write!(f, "[seq:{}, code:{}]", self.seq, self.code)
        } else {
            write!(f, "[seq:{}, {}.{}]", self.seq, self.service, self.method)
        }
    }
}

impl fmt::Debug for Meta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
