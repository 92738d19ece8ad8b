use std::{
    convert::Infallible,
    pin::Pin,
    task::{Context, Poll},
};

use hyper::body::{Body, Bytes, Frame};
use tokio::sync::mpsc;
use tracing::trace;

/// A request body fed chunk by chunk through a channel. The body ends when
/// every sender has been dropped.
#[derive(Debug)]
pub struct ChannelBody {
    chunks: mpsc::Receiver<Bytes>,
}

impl ChannelBody {
    /// Creates a body and the sender feeding it. At most `depth` chunks are
    /// buffered.
    pub fn channel(depth: usize) -> (mpsc::Sender<Bytes>, Self) {
        let (tx, chunks) = mpsc::channel(depth.max(1));
        (tx, Self { chunks })
    }
}

impl Body for ChannelBody {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        self.chunks.poll_recv(cx).map(|chunk| {
            chunk.map(|chunk| {
                trace!(len = chunk.len(), "request body chunk");
                Ok(Frame::data(chunk))
            })
        })
    }
}
