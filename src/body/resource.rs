//! A response body backed by a file.

use std::fmt;
use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures_core::Stream;
use futures_util::ready;
use tokio::fs::File;
use tokio::io::{AsyncRead, ReadBuf};

const CHUNK_SIZE: usize = 8192;

/// Streams a file in fixed-size chunks.
///
/// The file is opened lazily when the stream is first polled, so
/// configuring a resource body never blocks.
#[must_use = "streams do nothing unless polled"]
pub struct ResourceBody {
    state: State,
}

enum State {
    Opening(Pin<Box<dyn Future<Output = io::Result<File>> + Send>>),
    Reading(File),
    Done,
}

impl ResourceBody {
    /// Opens the file at `path` when first polled.
    pub fn open(path: PathBuf) -> ResourceBody {
        ResourceBody {
            state: State::Opening(Box::pin(File::open(path))),
        }
    }
}

impl Stream for ResourceBody {
    type Item = crate::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            match self.state {
                State::Opening(ref mut fut) => match ready!(fut.as_mut().poll(cx)) {
                    Ok(file) => self.state = State::Reading(file),
                    Err(err) => {
                        self.state = State::Done;
                        return Poll::Ready(Some(Err(crate::Error::new_body(err))));
                    }
                },
                State::Reading(ref mut file) => {
                    let mut buf = BytesMut::zeroed(CHUNK_SIZE);
                    let mut read_buf = ReadBuf::new(&mut buf);
                    match ready!(Pin::new(file).poll_read(cx, &mut read_buf)) {
                        Ok(()) => {
                            let n = read_buf.filled().len();
                            if n == 0 {
                                self.state = State::Done;
                                return Poll::Ready(None);
                            }
                            buf.truncate(n);
                            return Poll::Ready(Some(Ok(buf.freeze())));
                        }
                        Err(err) => {
                            self.state = State::Done;
                            return Poll::Ready(Some(Err(crate::Error::new_body(err))));
                        }
                    }
                }
                State::Done => return Poll::Ready(None),
            }
        }
    }
}

impl fmt::Debug for ResourceBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state {
            State::Opening(_) => "Opening",
            State::Reading(_) => "Reading",
            State::Done => "Done",
        };
        f.debug_struct("ResourceBody").field("state", &state).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use std::error::Error as _;

    #[tokio::test]
    async fn streams_file_contents() {
        let dir = std::env::temp_dir().join("estuary-resource-test");
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join("hello.txt");
        tokio::fs::write(&path, b"hello resource").await.unwrap();

        let mut body = ResourceBody::open(path);
        let mut collected = Vec::new();
        while let Some(chunk) = body.next().await {
            collected.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(collected, b"hello resource");
    }

    #[tokio::test]
    async fn missing_file_errors() {
        let mut body = ResourceBody::open(PathBuf::from("/definitely/not/here"));
        let err = body.next().await.unwrap().unwrap_err();
        assert!(err.source().is_some());
    }
}
