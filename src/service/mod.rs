pub mod backup;
pub mod downloader;
pub mod metadata;
pub mod recorder;
pub mod selector;
pub mod sync;
