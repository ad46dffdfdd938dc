//! CGI bridge to the git HTTP backend.
//!
//! - **bridge**: `CgiBridge` - spawn a helper per request, stream its response
//! - **codec**: header block then pass-through body
//! - **env**: CGI meta-variables

pub mod bridge;
pub mod codec;
pub mod env;

pub use bridge::{
    BodyStream, CgiBridge, CgiConfig, CgiError, CgiRequest, CgiResponse, parse_status,
};
pub use codec::{CgiCodec, CgiFrame, CgiHeaders};
pub use env::split_target;
