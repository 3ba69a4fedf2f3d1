//! Control protocol binding the dispatcher to the worker's executor pool.

pub mod codec;
pub mod message;

pub use self::codec::{FrameTransport, decode, encode, framed};
pub use self::message::{
    ControlMessage, ExecuteRequest, RunnerStatus, STATUS_RATE_LIMITED, WorkerMessage,
};
