//! Delta patch (XEXP) application

use crate::crypto::XexCrypto;
use crate::xex::{parse_delta_records, CompressionType, DeltaRecord};
use crate::xex_module::XexModule;
use ox_core::error::LoaderError;
use tracing::{debug, info};

/// LZX window used when the patch does not declare one
const DEFAULT_DELTA_WINDOW: u32 = 0x8000;

impl XexModule {
    /// Whether `self`, a patch, can be applied to `base`.
    ///
    /// The patch must carry a delta descriptor whose source version is the
    /// base's version, and when both sides carry execution info the title
    /// ids must agree. Patches never apply to other patches.
    pub fn is_patch_applicable(&self, base: &XexModule) -> bool {
        if !self.is_patch() || base.is_patch() {
            return false;
        }
        let Some(descriptor) = self.delta_descriptor() else {
            return false;
        };

        let base_info = base.execution_info();
        let base_version = base_info.map(|info| info.version.0).unwrap_or(0);
        if descriptor.source_version.0 != base_version {
            debug!(
                "{} patches version {} but {} is {}",
                self.name(),
                descriptor.source_version,
                base.name(),
                crate::xex::XexVersion(base_version)
            );
            return false;
        }

        match (self.execution_info(), base_info) {
            (Some(own), Some(base)) => own.title_id == base.title_id,
            _ => true,
        }
    }

    /// Apply this patch to `base` in place. `base` must not be linked yet;
    /// its cached entry point and stack size are re-read when it is.
    pub fn apply_patch(&self, base: &mut XexModule) -> Result<(), LoaderError> {
        if !self.is_patch_applicable(base) {
            return Err(LoaderError::PatchNotApplicable(format!(
                "{} does not apply to {}",
                self.name(),
                base.name()
            )));
        }
        if base.loaded() {
            return Err(LoaderError::InvalidStage(format!(
                "{} is already linked",
                base.name()
            )));
        }
        let descriptor = self.delta_descriptor().ok_or_else(|| {
            LoaderError::PatchFailed(format!("{} has no delta descriptor", self.name()))
        })?;

        let window = match self.format_info().map(|f| &f.compression) {
            Some(CompressionType::Normal { window_size }) => *window_size,
            _ => DEFAULT_DELTA_WINDOW,
        };
        let crypto = self.crypto().clone();

        // Header delta
        if descriptor.size_of_target_headers != 0 {
            let old_header = base.header_bytes().to_vec();
            let mut new_header = vec![0u8; descriptor.size_of_target_headers as usize];

            let src = descriptor.delta_headers_source_offset as usize;
            let len = descriptor.delta_headers_source_size as usize;
            let dst = descriptor.delta_headers_target_offset as usize;
            let source = old_header.get(src..src + len).ok_or_else(|| {
                LoaderError::PatchFailed(format!(
                    "header source range 0x{:x}+0x{:x} outside base headers",
                    src, len
                ))
            })?;
            new_header
                .get_mut(dst..dst + len)
                .ok_or_else(|| {
                    LoaderError::PatchFailed(format!(
                        "header target range 0x{:x}+0x{:x} outside new headers",
                        dst, len
                    ))
                })?
                .copy_from_slice(source);

            apply_delta_records(
                &descriptor.header_records,
                &old_header,
                &mut new_header,
                0,
                window,
                crypto.as_ref(),
            )?;
            base.replace_headers(new_header)?;
            debug!(
                "Rewrote {} headers to 0x{:x} bytes",
                base.name(),
                descriptor.size_of_target_headers
            );
        }

        // Image delta
        let records = parse_delta_records(self.image())?;
        if !records.is_empty() {
            let old_image = std::mem::take(base.image_mut());
            let mut new_image = old_image.clone();
            new_image.resize(base.image_size() as usize, 0);
            let result = apply_delta_records(
                &records,
                &old_image,
                &mut new_image,
                base.base_address(),
                window,
                crypto.as_ref(),
            );
            match result {
                Ok(()) => *base.image_mut() = new_image,
                Err(err) => {
                    *base.image_mut() = old_image;
                    return Err(err);
                }
            }
        }

        info!(
            "Applied patch {} to {} ({} -> {})",
            self.name(),
            base.name(),
            descriptor.source_version,
            descriptor.target_version
        );
        Ok(())
    }
}

/// Apply delta records. Record addresses are relative to `base`.
pub fn apply_delta_records(
    records: &[DeltaRecord],
    old: &[u8],
    new: &mut [u8],
    base: u32,
    window: u32,
    crypto: &dyn XexCrypto,
) -> Result<(), LoaderError> {
    for record in records {
        let len = record.uncompressed_len as usize;
        let new_offset = record.new_address.wrapping_sub(base) as usize;
        let old_offset = record.old_address.wrapping_sub(base) as usize;

        let target = new
            .get_mut(new_offset..new_offset.saturating_add(len))
            .ok_or_else(|| {
                LoaderError::PatchFailed(format!(
                    "delta target 0x{:08X}+0x{:x} out of range",
                    record.new_address, len
                ))
            })?;

        match record.compressed_len {
            0 => target.fill(0),
            1 => {
                let source = old
                    .get(old_offset..old_offset.saturating_add(len))
                    .ok_or_else(|| {
                        LoaderError::PatchFailed(format!(
                            "delta source 0x{:08X}+0x{:x} out of range",
                            record.old_address, len
                        ))
                    })?;
                target.copy_from_slice(source);
            }
            _ => {
                let reference = old
                    .get(old_offset..old_offset.saturating_add(len))
                    .unwrap_or_default();
                crypto.apply_lzx_delta(window, reference, &record.data, target)?;
            }
        }
    }
    Ok(())
}
