pub mod display;

use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::*;

use crate::source::{Source, SourceId};

pub use display::DisplayBuffer;

#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    pub source_id: SourceId,
    pub captured_at: DateTime<Utc>,
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl Frame {
    pub fn new(source_id: impl Into<SourceId>, width: u32, height: u32, data: Vec<u8>) -> Self {
        Self {
            source_id: source_id.into(),
            captured_at: Utc::now(),
            width,
            height,
            data,
        }
    }

    pub fn empty(source_id: impl Into<SourceId>) -> Self {
        Self::new(source_id, 0, 0, vec![])
    }
}

/// Where frames come from. Decoding and transport live behind this trait.
#[async_trait]
pub trait FrameSource: Send + Sync {
    /// One read attempt. `Ok(None)` means the source answered but had no frame ready.
    async fn read_frame(&self, source: &Source) -> Result<Option<Frame>>;
}

/// Burst-reads up to `attempts` frames and keeps the last one, so a stale
/// buffered frame is never the one we count on.
#[instrument(level = "trace", skip(frame_source, source), fields(source_id = %source.id))]
pub async fn acquire(
    frame_source: &dyn FrameSource,
    source: &Source,
    attempts: u32,
    retry_delay: Duration,
) -> Result<Frame> {
    let mut last_frame = None;
    let mut last_error = None;

    for _ in 0..attempts.max(1) {
        match frame_source.read_frame(source).await {
            Ok(Some(frame)) => {
                last_frame = Some(frame);
                continue;
            }
            Ok(None) => (),
            Err(error) => {
                trace!("Read attempt failed: {error:#}");
                // A source that refuses the connection will not come back within this burst
                if last_frame.is_none() {
                    return Err(error.context(format!("Connection to {:?} failed", source.name)));
                }
                last_error = Some(error);
            }
        }

        tokio::time::sleep(retry_delay).await;
    }

    last_frame.ok_or_else(|| match last_error {
        Some(error) => error.context(format!("No frame from {:?}", source.name)),
        None => anyhow!(
            "No frame from {:?} after {attempts} attempts",
            source.name
        ),
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    struct Scripted {
        calls: AtomicU32,
        script: Vec<Option<bool>>,
    }

    #[async_trait]
    impl FrameSource for Scripted {
        async fn read_frame(&self, source: &Source) -> Result<Option<Frame>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
            match self.script.get(call).copied().flatten() {
                Some(true) => Ok(Some(Frame::new(&source.id, 1, 1, vec![call as u8]))),
                Some(false) => Err(anyhow!("unreachable")),
                None => Ok(None),
            }
        }
    }

    fn source() -> Source {
        Source::new("cam", "Cam", "rtsp://cam")
    }

    #[tokio::test]
    async fn keeps_the_last_frame_of_the_burst() {
        let frame_source = Scripted {
            calls: AtomicU32::new(0),
            script: vec![Some(true), None, Some(true), None],
        };

        let frame = acquire(&frame_source, &source(), 4, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(frame.data, vec![2]);
        assert_eq!(frame_source.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn no_frame_is_a_failure() {
        let frame_source = Scripted {
            calls: AtomicU32::new(0),
            script: vec![],
        };

        assert!(acquire(&frame_source, &source(), 3, Duration::ZERO)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn refused_connection_gives_up_immediately() {
        let frame_source = Scripted {
            calls: AtomicU32::new(0),
            script: vec![Some(false), Some(true)],
        };

        assert!(acquire(&frame_source, &source(), 10, Duration::ZERO)
            .await
            .is_err());
        assert_eq!(frame_source.calls.load(Ordering::SeqCst), 1);
    }
}
