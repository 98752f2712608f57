//! Container and filesystem formats found in Android firmware.
//!
//! - `filesystem` - magic-byte sniffing of partition images
//! - `apex` - APEX / compressed APEX payload unwrapping
//! - `archive` - zip member extraction for jars and apks

pub mod apex;
pub mod archive;
pub mod filesystem;

pub use apex::{ApexContainerType, ApexPayloadExtractor};
pub use archive::ArchiveExtractor;
pub use filesystem::{FilesystemKind, FormatSniffer};
