/// Utility functions and helpers
use crate::error::HubError;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_serde::formats::Json;
use tokio_util::codec::LengthDelimitedCodec;

/// Largest frame accepted on hub and agent channels
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// A length-delimited JSON connection reading `In` and writing `Out`
pub type JsonFramed<C, In, Out> = tokio_serde::Framed<
    tokio_util::codec::Framed<C, LengthDelimitedCodec>,
    In,
    Out,
    Json<In, Out>,
>;

pub fn length_delimited_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

/// Wrap a byte stream in typed JSON framing
pub fn json_framed<C, In, Out>(conn: C) -> JsonFramed<C, In, Out>
where
    C: AsyncRead + AsyncWrite,
{
    tokio_serde::Framed::new(
        tokio_util::codec::Framed::new(conn, length_delimited_codec()),
        Json::default(),
    )
}

/// Classify an error from a framed connection. Frames that do not parse,
/// or exceed the length limit, are protocol errors.
pub fn frame_error(err: io::Error) -> HubError {
    match err.kind() {
        io::ErrorKind::InvalidData | io::ErrorKind::UnexpectedEof => {
            HubError::protocol(format!("malformed frame: {}", err))
        }
        _ => HubError::Io(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::HubReply;
    use bytes::Bytes;
    use futures::{SinkExt, StreamExt};

    #[tokio::test]
    async fn test_frames_over_duplex() {
        let (a, b) = tokio::io::duplex(1024);
        let mut writer = json_framed::<_, HubReply, HubReply>(a);
        let mut reader = json_framed::<_, HubReply, HubReply>(b);

        writer
            .send(HubReply::Stdout { text: "hello".into() })
            .await
            .unwrap();
        writer.send(HubReply::Done).await.unwrap();

        assert_eq!(
            reader.next().await.unwrap().unwrap(),
            HubReply::Stdout { text: "hello".into() }
        );
        assert!(reader.next().await.unwrap().unwrap().is_terminal());
    }

    #[tokio::test]
    async fn test_garbage_frame_is_protocol_error() {
        let (a, b) = tokio::io::duplex(1024);
        let mut raw = tokio_util::codec::Framed::new(a, length_delimited_codec());
        let mut reader = json_framed::<_, HubReply, HubReply>(b);

        raw.send(Bytes::from_static(b"not json")).await.unwrap();

        let err = reader.next().await.unwrap().unwrap_err();
        assert!(matches!(frame_error(err), HubError::Protocol(_)));
    }

    #[test]
    fn test_transport_errors_stay_io() {
        let err = frame_error(io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed"));
        assert!(matches!(err, HubError::Io(_)));
    }
}
