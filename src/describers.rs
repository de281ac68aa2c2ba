//! Preprocessing describers: the child-job handlers that turn non-text
//! attachments into text before generation. Each describer is stateless and
//! safe to retry; a describer that exhausts its budget emits a fallback
//! output instead of failing its flow.

pub(crate) mod audio;
pub(crate) mod image;

pub(crate) use audio::{AudioDescriber, AudioJobOutput};
pub(crate) use image::{ImageDescriber, ImageJobOutput};
