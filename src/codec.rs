use std::cell::RefCell;
use std::rc::{Rc, Weak};

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use log::*;

/// Frames smaller than this are always sent identity, whatever the caller
/// asked for. The frame then records compression id 0.
pub const COMPRESS_THRESHOLD: usize = 256;

/// Compression algorithm selector, the id byte of the frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CompressKind {
    None = 0,
    Deflate = 1,
    Lz4 = 2,
    Snappy = 3,
}

impl CompressKind {
    /// Decode the compression id of an incoming frame. An unknown id is a
    /// protocol violation and fails the connection.
    #[inline]
    pub fn from_wire(v: u8) -> Option<CompressKind> {
        match v {
            0 => Some(CompressKind::None),
            1 => Some(CompressKind::Deflate),
            2 => Some(CompressKind::Lz4),
            3 => Some(CompressKind::Snappy),
            _ => None,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum SqueezeErr {
    /// Destination slice cannot hold the result; grow it and retry.
    BufferTooSmall,
    /// The input bytes are not valid for the selected algorithm.
    InvalidInput,
}

/// Per-thread compression context: the algorithm entry points plus a
/// growable staging buffer.
///
/// The staging buffer doubles on demand and is never shrunk; it serves as
/// the uncompressed side of both directions (serializer output on send,
/// decompression target on receive).
pub struct Codec {
    stage: Vec<u8>,
}

impl Codec {
    pub fn new() -> Self {
        Self { stage: Vec::new() }
    }

    /// Clear and expose the staging buffer as an appendable vector; the
    /// send path serializes the flat body here before compression.
    pub fn stage_vec(&mut self) -> &mut Vec<u8> {
        self.stage.clear();
        &mut self.stage
    }

    /// The bytes left by the last `stage_vec` pass.
    #[inline(always)]
    pub fn staged(&self) -> &[u8] {
        &self.stage
    }

    /// Grow (if needed) and expose at least `len` bytes of staging space.
    pub fn stage(&mut self, len: usize) -> &mut [u8] {
        if self.stage.len() < len {
            let mut cap = self.stage.len();
            if cap == 0 {
                cap = 4096;
            }
            while cap < len {
                cap *= 2;
            }
            self.stage.resize(cap, 0);
        }
        &mut self.stage[..]
    }

    /// Compress `input` into `output`, returning the number of bytes
    /// written. `kind` must not be `None`.
    pub fn compress(kind: CompressKind, input: &[u8], output: &mut [u8]) -> Result<usize, SqueezeErr> {
        match kind {
            CompressKind::Deflate => Self::deflate_compress(input, output),
            CompressKind::Lz4 => Self::lz4_compress(input, output),
            CompressKind::Snappy => Self::snappy_compress(input, output),
            CompressKind::None => {
                if output.len() < input.len() {
                    return Err(SqueezeErr::BufferTooSmall);
                }
                output[..input.len()].copy_from_slice(input);
                Ok(input.len())
            }
        }
    }

    /// Decompress `input` into `output`. `output` is expected to hold the
    /// full decoded size already (the header told us).
    pub fn decompress(
        kind: CompressKind, input: &[u8], output: &mut [u8],
    ) -> Result<usize, SqueezeErr> {
        match kind {
            CompressKind::Deflate => Self::deflate_decompress(input, output),
            CompressKind::Lz4 => Self::lz4_decompress(input, output),
            CompressKind::Snappy => Self::snappy_decompress(input, output),
            CompressKind::None => {
                if output.len() < input.len() {
                    return Err(SqueezeErr::BufferTooSmall);
                }
                output[..input.len()].copy_from_slice(input);
                Ok(input.len())
            }
        }
    }

    #[inline]
    fn deflate_compress(input: &[u8], output: &mut [u8]) -> Result<usize, SqueezeErr> {
        // zlib format, best-speed preset
        let mut c = Compress::new(Compression::fast(), true);
        match c.compress(input, output, FlushCompress::Finish) {
            Ok(Status::StreamEnd) => Ok(c.total_out() as usize),
            Ok(_) => Err(SqueezeErr::BufferTooSmall),
            Err(e) => {
                warn!("deflate compress error: {:?}", e);
                Err(SqueezeErr::InvalidInput)
            }
        }
    }

    #[inline]
    fn deflate_decompress(input: &[u8], output: &mut [u8]) -> Result<usize, SqueezeErr> {
        let mut d = Decompress::new(true);
        match d.decompress(input, output, FlushDecompress::Finish) {
            Ok(Status::StreamEnd) => Ok(d.total_out() as usize),
            Ok(_) => Err(SqueezeErr::BufferTooSmall),
            Err(_) => Err(SqueezeErr::InvalidInput),
        }
    }

    #[inline]
    fn lz4_compress(input: &[u8], output: &mut [u8]) -> Result<usize, SqueezeErr> {
        if lz4_flex::block::get_maximum_output_size(input.len()) > output.len() {
            return Err(SqueezeErr::BufferTooSmall);
        }
        match lz4_flex::block::compress_into(input, output) {
            Ok(n) => Ok(n),
            Err(_) => Err(SqueezeErr::BufferTooSmall),
        }
    }

    #[inline]
    fn lz4_decompress(input: &[u8], output: &mut [u8]) -> Result<usize, SqueezeErr> {
        match lz4_flex::block::decompress_into(input, output) {
            Ok(n) => Ok(n),
            Err(_) => Err(SqueezeErr::InvalidInput),
        }
    }

    #[inline]
    fn snappy_compress(input: &[u8], output: &mut [u8]) -> Result<usize, SqueezeErr> {
        if snap::raw::max_compress_len(input.len()) > output.len() {
            return Err(SqueezeErr::BufferTooSmall);
        }
        match snap::raw::Encoder::new().compress(input, output) {
            Ok(n) => Ok(n),
            Err(e) => {
                warn!("snappy compress error: {:?}", e);
                Err(SqueezeErr::InvalidInput)
            }
        }
    }

    #[inline]
    fn snappy_decompress(input: &[u8], output: &mut [u8]) -> Result<usize, SqueezeErr> {
        match snap::raw::decompress_len(input) {
            Err(_) => return Err(SqueezeErr::InvalidInput),
            Ok(n) => {
                if n > output.len() {
                    return Err(SqueezeErr::BufferTooSmall);
                }
            }
        }
        match snap::raw::Decoder::new().decompress(input, output) {
            Ok(n) => Ok(n),
            Err(_) => Err(SqueezeErr::InvalidInput),
        }
    }
}

thread_local! {
    static LOCAL_CODEC: RefCell<Weak<RefCell<Codec>>> = RefCell::new(Weak::new());
}

/// Reference-counted handle to the codec of the current thread.
///
/// The first acquisition on a thread allocates the codec; channels and
/// workers created on the same thread share it. The codec is freed when the
/// last handle on that thread is dropped.
pub struct CodecHandle {
    inner: Rc<RefCell<Codec>>,
}

impl CodecHandle {
    pub fn acquire() -> Self {
        LOCAL_CODEC.with(|slot| {
            let mut weak = slot.borrow_mut();
            if let Some(inner) = weak.upgrade() {
                return Self { inner };
            }
            let inner = Rc::new(RefCell::new(Codec::new()));
            *weak = Rc::downgrade(&inner);
            Self { inner }
        })
    }

    #[inline(always)]
    pub fn get(&self) -> std::cell::RefMut<'_, Codec> {
        self.inner.borrow_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(len: usize) -> Vec<u8> {
        // compressible but not trivial
        (0..len).map(|i| ((i / 7) % 251) as u8).collect()
    }

    #[test]
    fn test_roundtrip_all_kinds() {
        for kind in [CompressKind::None, CompressKind::Deflate, CompressKind::Lz4, CompressKind::Snappy] {
            for len in [0usize, 1, 255, 256, 4096, 70000] {
                let input = sample(len);
                let mut out = vec![0u8; len * 2 + 1024];
                let n = Codec::compress(kind, &input, &mut out).expect("compress");
                let mut back = vec![0u8; len];
                let m = Codec::decompress(kind, &out[..n], &mut back).expect("decompress");
                assert_eq!(m, len, "kind {:?} len {}", kind, len);
                assert_eq!(&back[..m], &input[..], "kind {:?} len {}", kind, len);
            }
        }
    }

    #[test]
    fn test_buffer_too_small() {
        let input = sample(4096);
        let mut out = vec![0u8; 8];
        for kind in [CompressKind::Lz4, CompressKind::Snappy, CompressKind::Deflate] {
            assert_eq!(Codec::compress(kind, &input, &mut out), Err(SqueezeErr::BufferTooSmall));
        }
        // caller grows and retries
        let mut out = vec![0u8; 8192];
        assert!(Codec::compress(CompressKind::Lz4, &input, &mut out).is_ok());
    }

    #[test]
    fn test_invalid_input() {
        let garbage = [0xffu8; 64];
        let mut out = vec![0u8; 1024];
        assert_eq!(
            Codec::decompress(CompressKind::Deflate, &garbage, &mut out),
            Err(SqueezeErr::InvalidInput)
        );
        assert_eq!(
            Codec::decompress(CompressKind::Snappy, &garbage, &mut out),
            Err(SqueezeErr::InvalidInput)
        );
    }

    #[test]
    fn test_stage_grows_and_keeps() {
        let mut c = Codec::new();
        assert_eq!(c.stage(100).len(), 4096);
        assert!(c.stage(5000).len() >= 8192);
        // never shrinks
        assert!(c.stage(1).len() >= 8192);
    }

    #[test]
    fn test_kind_from_wire() {
        assert_eq!(CompressKind::from_wire(0), Some(CompressKind::None));
        assert_eq!(CompressKind::from_wire(3), Some(CompressKind::Snappy));
        assert_eq!(CompressKind::from_wire(9), None);
    }

    #[test]
    fn test_handle_shared_per_thread() {
        let a = CodecHandle::acquire();
        let b = CodecHandle::acquire();
        assert!(Rc::ptr_eq(&a.inner, &b.inner));
        drop(a);
        drop(b);
        let c = CodecHandle::acquire();
        let _ = c.get().stage(16);
    }
}
