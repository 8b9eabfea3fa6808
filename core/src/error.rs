//! Error taxonomy (`spec.md` §7), one kind per distinct recovery policy.

use thiserror::Error;

/// Errors the core can surface. Storage errors propagate through the
/// cancellable call that triggered them; format/invariant errors surface to
/// the embedder's UI layer for user action. Nothing here is retried
/// internally beyond what's documented on the variant.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Block-device read/write returned an error. The caller has already
    /// retried up to `retries` times before giving up.
    #[error("transient storage error after {retries} retries")]
    TransientStorage { retries: u8 },

    /// `BlockDevice::connected()` went false mid-operation.
    #[error("media absent")]
    MediaAbsent,

    /// A format handler's `open` rejected the file, or geometry failed a
    /// sanity check (cylinder/side/sector-size bounds).
    #[error("invalid image format: {reason}")]
    FormatInvalid { reason: String },

    /// A ring's consumer caught its producer (read side starved).
    #[error("ring underrun")]
    RingUnderrun,

    /// A ring's producer outran its consumer (write side flooded); excess
    /// bitcells were discarded and the write record marked lost.
    #[error("ring overrun")]
    RingOverrun,

    /// A decoded sector's CRC did not match. The sector is skipped; other
    /// sectors in the same write record still land.
    #[error("CRC failure on sector {sector}")]
    CrcFailure { sector: u8 },

    /// The write decoder never found the expected sync pattern within the
    /// format's word budget; the write record completed short.
    #[error("bitstream desync")]
    BitstreamDesync,

    /// The write pipeline's fixed-capacity queue is full.
    #[error("write pipeline full")]
    WritePipelineFull,
}

pub type CoreResult<T> = Result<T, CoreError>;
