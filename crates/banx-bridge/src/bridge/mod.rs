//! IPC bridge for parent-worker communication.
//!
//! This module provides the wire protocol and codec for communication between
//! the worker channel (parent) and the computation worker subprocess.
//!
//! # Architecture
//!
//! - **protocol**: Message types (WorkerRequest/WorkerResponse, MsgId)
//! - **codec**: JSON-lines framing codec for AsyncRead/AsyncWrite

pub mod codec;
pub mod protocol;
