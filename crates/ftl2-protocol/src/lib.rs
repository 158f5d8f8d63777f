//! Gate wire contract for FTL2.
//!
//! A gate is a long-lived process on a target host that executes bundled
//! modules. The controller and the gate exchange length-prefixed JSON frames
//! over the gate's stdin/stdout. This crate is the shared vocabulary: the
//! frame codec and the typed messages. It has no opinion about transports;
//! anything that can produce an `AsyncRead`/`AsyncWrite` pair can speak it.

pub mod frame;
pub mod message;

pub use frame::{read_frame, write_frame, FrameError, MAX_FRAME_LEN};
pub use message::{EventKind, GateRequest, GateResponse, RequestId};
