//! Binary log consumption: decoded entries, the reader seam, and the
//! streamer worker that turns raw row events into an ordered entry stream.

pub mod entry;
pub mod reader;
pub mod streamer;

pub use entry::{BinlogEntry, DmlEvent, DmlKind};
pub use reader::{BinlogReader, RowImage, RowsEvent};
pub use streamer::{BinlogStreamer, StreamEvent};
