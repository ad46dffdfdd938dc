//! Line framing for subprocess output streams.
//!
//! Both subprocess protocols are line-oriented text arriving over pipes in
//! arbitrary chunks. This module reassembles those chunks into lines.
//!
//! - **line**: `LineCodec` (tokio-util `Decoder`) and `LineFramer` (push API)

pub mod line;

pub use line::{LineCodec, LineFramer, trim_line_end};
