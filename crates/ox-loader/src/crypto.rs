//! Verification, decryption and LZX codec service used by the XEX loader
//!
//! The algorithms live outside the emulator core; the loader only knows
//! when to call them.

use ox_core::error::LoaderError;

/// Black-box crypto and codec service
pub trait XexCrypto: Send + Sync {
    /// Check the RSA signature over the header block
    fn verify_header(&self, _header: &[u8], _signature: &[u8]) -> bool {
        true
    }

    /// Decrypt an image body in place with the (still wrapped) image key
    fn decrypt_image(&self, image_key: &[u8; 16], data: &mut [u8]) -> Result<(), LoaderError>;

    /// Decompress an LZX-compressed image body into `out_len` bytes
    fn decompress_lzx(
        &self,
        window_size: u32,
        data: &[u8],
        out_len: usize,
    ) -> Result<Vec<u8>, LoaderError>;

    /// Apply an LZX delta block: `old` is the reference data, the result
    /// is written into `out`
    fn apply_lzx_delta(
        &self,
        window_size: u32,
        old: &[u8],
        delta: &[u8],
        out: &mut [u8],
    ) -> Result<(), LoaderError>;
}

/// Service used when no crypto provider is installed.
///
/// Unencrypted images with no or basic compression load fine; anything
/// needing decryption or LZX fails cleanly.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullCrypto;

impl XexCrypto for NullCrypto {
    fn decrypt_image(&self, _image_key: &[u8; 16], _data: &mut [u8]) -> Result<(), LoaderError> {
        Err(LoaderError::DecryptionFailed(
            "no crypto provider installed".into(),
        ))
    }

    fn decompress_lzx(
        &self,
        _window_size: u32,
        _data: &[u8],
        _out_len: usize,
    ) -> Result<Vec<u8>, LoaderError> {
        Err(LoaderError::DecryptionFailed(
            "LZX decompression requires a codec provider".into(),
        ))
    }

    fn apply_lzx_delta(
        &self,
        _window_size: u32,
        _old: &[u8],
        _delta: &[u8],
        _out: &mut [u8],
    ) -> Result<(), LoaderError> {
        Err(LoaderError::PatchFailed(
            "LZX delta requires a codec provider".into(),
        ))
    }
}
