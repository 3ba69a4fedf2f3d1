//! Newline-delimited JSON framing over a byte stream.
//!
//! `Framed<_, LinesCodec>` を使うので、1 接続 1 writer であればフレームが
//! 混ざることはありません（writer は呼び出し側で 1 タスクに集約する）。

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LinesCodec};

use crate::error::Result;

/// Frames longer than this are dropped by the codec.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

pub type FrameTransport<S> = Framed<S, LinesCodec>;

pub fn framed<S: AsyncRead + AsyncWrite>(stream: S) -> FrameTransport<S> {
    Framed::new(stream, LinesCodec::new_with_max_length(MAX_FRAME_LEN))
}

pub fn encode<T: Serialize>(frame: &T) -> Result<String> {
    Ok(serde_json::to_string(frame)?)
}

pub fn decode<T: DeserializeOwned>(line: &str) -> Result<T> {
    Ok(serde_json::from_str(line.trim())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ControlMessage, WorkerMessage};
    use crate::domain::TaskId;
    use futures::{SinkExt, StreamExt};

    #[tokio::test]
    async fn frames_survive_a_duplex_pipe() {
        let (a, b) = tokio::io::duplex(4096);
        let mut left = framed(a);
        let mut right = framed(b);

        let msg = ControlMessage::KillTask { task_id: TaskId::new(8) };
        left.send(encode(&msg).unwrap()).await.unwrap();

        let line = right.next().await.unwrap().unwrap();
        assert_eq!(decode::<ControlMessage>(&line).unwrap(), msg);
    }

    #[test]
    fn malformed_frames_are_errors_not_panics() {
        assert!(decode::<WorkerMessage>("{\"type\":\"NOPE\"}").is_err());
        assert!(decode::<WorkerMessage>("not json").is_err());
    }
}
