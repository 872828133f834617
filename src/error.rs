//! Class-4 recoverable errors (spec §7). Classes 1–2 are not represented
//! here — they abort via `panic!` at the point of detection. Class 3
//! (transient GPU conditions) is `swapchain::AcquireOutcome`, not an error
//! type at all.

/// User-side data error: logged as a warning and the operation is skipped,
/// leaving the resource valid and unchanged.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceWarning {
    NullUploadData,
    SubresourceOutOfRange,
    UploadSizeOverflow,
    DownloadSizeOverflow,
}

impl std::fmt::Display for ResourceWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            Self::NullUploadData => "upload data was empty",
            Self::SubresourceOutOfRange => "subresource range exceeds the texture's total extent",
            Self::UploadSizeOverflow => "upload would write past the end of the destination buffer",
            Self::DownloadSizeOverflow => "download would read past the end of the source buffer",
        };
        write!(f, "{msg}")
    }
}

impl std::error::Error for ResourceWarning {}
