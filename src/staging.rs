//! The staging-upload ring is an explicit external collaborator (spec §1,
//! "Deliberately OUT OF SCOPE"). This module only defines the boundary
//! `ResourceManager` calls into; no implementation ships here.

use crate::command::SubmitToken;
use crate::resource::{BufferPayload, TexturePayload, TextureUploadRegion};

/// Implemented by whatever owns the staging buffer ring. `ResourceManager`
/// calls into this for every upload/download/mipmap-generation request; it
/// never touches staging memory itself.
pub trait StagingUploader {
    fn upload_buffer(&mut self, dst: &BufferPayload, data: &[u8], offset: u64) -> SubmitToken;
    fn upload_texture(&mut self, dst: &TexturePayload, data: &[u8], region: TextureUploadRegion) -> SubmitToken;
    fn generate_mipmaps(&mut self, dst: &TexturePayload) -> SubmitToken;
    fn download_buffer(&mut self, src: &BufferPayload, out: &mut [u8], offset: u64) -> SubmitToken;
}
