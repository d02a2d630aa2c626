//! Document ingestion for Parley.
//!
//! Uploads are validated, extracted to text and stored unprocessed
//! (`upload`). A separate batch step (`batch`) claims unprocessed documents,
//! splits them (`splitter`), embeds and indexes the chunks, and flags each
//! document processed once its chunks are durable.

pub mod batch;
pub mod extract;
pub mod splitter;
pub mod upload;

pub use batch::{BatchReport, FailedDocument, Indexer};
pub use extract::{extract_text, DocumentFormat};
pub use splitter::RecursiveSplitter;
pub use upload::Uploader;
