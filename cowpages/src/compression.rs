// SPDX-License-Identifier: MPL-2.0

//! The interface to the page compressor.
//!
//! The engine consumes compression as a collaborator: it hands pages to a
//! [`VmCompressor`], stores the resulting opaque references in page list
//! slots, and turns references back into pages on access. The compressor
//! owns the compressed bytes and a small metadata sidecar per reference,
//! which the engine uses to store the share count of compressed content.

use alloc::sync::Arc;

use spin::Mutex;

use crate::page::VmPage;

static ACTIVE_COMPRESSOR: Mutex<Option<Arc<dyn VmCompressor>>> = Mutex::new(None);

/// Installs the process-wide compressor instance used to release and
/// decompress references outside of an explicit reclamation call.
pub fn set_active_compressor(compressor: Option<Arc<dyn VmCompressor>>) {
    *ACTIVE_COMPRESSOR.lock() = compressor;
}

/// The process-wide compressor, if one is installed.
pub fn active_compressor() -> Option<Arc<dyn VmCompressor>> {
    ACTIVE_COMPRESSOR.lock().clone()
}

/// An opaque handle to compressed content, owned by the compressor.
///
/// While a compression is in flight the slot holds a *temporary* reference
/// which the compressor can distinguish from a final one.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct CompressedRef(pub u64);

/// The outcome of a compression attempt.
pub enum CompressionResult {
    /// The content compressed well; the slot should hold this reference.
    Reference(CompressedRef),
    /// The content did not compress; the original page is handed back.
    Fail { src_page: Arc<VmPage> },
    /// The content was all zeros; no storage is needed at all.
    Zero,
}

/// A compressor instance armed for one page at a time.
///
/// The protocol is: `arm`, then `start` with the page to compress (the
/// returned temporary reference is installed in the page list slot while
/// the node lock is dropped), then `compress`, then reconcile via
/// `take_compression_result`, and `finalize` to release the slot.
pub trait VmCompressor: Send + Sync {
    /// Readies a compression slot.
    fn arm(&self) -> crate::error::Result<()>;

    /// Begins compressing `page`, which stays alive until the result is
    /// taken. Returns the temporary reference standing in for the page.
    fn start(&self, page: Arc<VmPage>, metadata: u32) -> CompressedRef;

    /// Runs the compression. May be cancelled by a concurrent
    /// [`VmCompressor::free_reference`] of the temporary reference.
    fn compress(&self);

    /// Takes the result of the last `compress`.
    fn take_compression_result(&self) -> CompressionResult;

    /// Releases the compression slot.
    fn finalize(&self);

    /// Whether `reference` is a temporary reference of an in-flight
    /// compression rather than a final one.
    fn is_temp_reference(&self, reference: CompressedRef) -> bool;

    /// Reads the metadata sidecar of a reference.
    fn metadata(&self, reference: CompressedRef) -> u32;

    /// Writes the metadata sidecar of a reference.
    fn set_metadata(&self, reference: CompressedRef, value: u32);

    /// Decompresses `reference` into `page`, leaving the reference free.
    fn decompress(&self, reference: CompressedRef, page: &VmPage);

    /// Transfers a compressed entry back to page form without
    /// decompressing, if the compressor still holds the uncompressed page.
    fn move_reference(&self, reference: CompressedRef) -> Option<(Arc<VmPage>, u32)>;

    /// Releases a reference and its storage.
    fn free_reference(&self, reference: CompressedRef);
}
