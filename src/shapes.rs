//! External personality-data exchange with the shapes service: paged
//! scraping imports, file exports, rotating-credential session handling,
//! and retryable/non-retryable error classification.

pub(crate) mod client;
pub(crate) mod export;
pub(crate) mod format;
pub(crate) mod import;

mod error;

pub(crate) use error::ExchangeError;
pub(crate) use export::ShapesExportHandler;
pub(crate) use import::ShapesImportHandler;
