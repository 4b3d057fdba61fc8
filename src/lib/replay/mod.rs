//! Recorded detections played back as if they came from a camera.
//!
//! A source endpoint names a file with one JSON array per line; each line is
//! one frame. Entries are either already classified,
//! `{"box": {"x1": 0, "y1": 0, "x2": 10, "y2": 10}, "class": "car", "confidence": 0.9}`,
//! or raw model output with a COCO class id,
//! `{"box": [0, 0, 10, 10], "class_id": 2, "confidence": 0.9}`.

use std::{collections::HashMap, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::*;

use crate::{
    detection::{BoundingBox, Detection, Detector, VehicleClass},
    frame::{Frame, FrameSource},
    source::{Source, SourceId},
};

#[derive(Debug)]
struct Cursor {
    lines: Vec<String>,
    position: usize,
}

/// Unopened until the first read of its source.
type SharedCursor = Arc<Mutex<Option<Cursor>>>;

/// Hands out one recorded line per read. Each source has its own cursor, so
/// opening one recording never stalls reads of another.
#[derive(Debug, Default)]
pub struct ReplayFrameSource {
    cursors: Mutex<HashMap<SourceId, SharedCursor>>,
    looping: bool,
}

impl ReplayFrameSource {
    pub fn new(looping: bool) -> Self {
        Self {
            cursors: Default::default(),
            looping,
        }
    }

    pub fn recording_path(source: &Source) -> PathBuf {
        let endpoint = source.endpoint.trim();
        let path = endpoint
            .strip_prefix("replay://")
            .or_else(|| endpoint.strip_prefix("file://"))
            .unwrap_or(endpoint);

        match shellexpand::full(path) {
            Ok(expanded) => PathBuf::from(expanded.as_ref()),
            Err(_) => PathBuf::from(path),
        }
    }

    async fn open(source: &Source) -> Result<Cursor> {
        let path = Self::recording_path(source);
        let content = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to open recording {path:?}"))?;

        let lines: Vec<String> = content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(String::from)
            .collect();

        debug!("Opened recording {path:?} with {} frames", lines.len());

        Ok(Cursor { lines, position: 0 })
    }
}

#[async_trait]
impl FrameSource for ReplayFrameSource {
    async fn read_frame(&self, source: &Source) -> Result<Option<Frame>> {
        let shared = self
            .cursors
            .lock()
            .await
            .entry(source.id.clone())
            .or_default()
            .clone();
        let mut slot = shared.lock().await;

        if slot.is_none() {
            *slot = Some(Self::open(source).await?);
        }
        let Some(cursor) = slot.as_mut() else {
            return Ok(None);
        };

        if cursor.position >= cursor.lines.len() {
            if !self.looping || cursor.lines.is_empty() {
                return Ok(None);
            }
            cursor.position = 0;
        }

        let line = cursor.lines[cursor.position].clone();
        cursor.position += 1;

        Ok(Some(Frame::new(&source.id, 0, 0, line.into_bytes())))
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RecordedDetection {
    Classified(Detection),
    Raw {
        #[serde(rename = "box")]
        bbox: [i32; 4],
        class_id: u32,
        confidence: f32,
    },
}

impl RecordedDetection {
    fn into_detection(self) -> Option<Detection> {
        match self {
            RecordedDetection::Classified(detection) => Some(detection),
            RecordedDetection::Raw {
                bbox: [x1, y1, x2, y2],
                class_id,
                confidence,
            } => VehicleClass::from_coco_id(class_id).map(|class| {
                Detection::new(BoundingBox::new(x1, y1, x2, y2), class, confidence)
            }),
        }
    }
}

/// Reads the detections a `ReplayFrameSource` frame carries.
#[derive(Debug, Default)]
pub struct ReplayDetector;

#[async_trait]
impl Detector for ReplayDetector {
    async fn detect(&self, frame: &Frame) -> Result<Vec<Detection>> {
        let recorded: Vec<RecordedDetection> = serde_json::from_slice(&frame.data)
            .with_context(|| format!("Malformed recorded frame from {:?}", frame.source_id))?;

        Ok(recorded
            .into_iter()
            .filter_map(RecordedDetection::into_detection)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recording(lines: &[&str]) -> (tempfile::TempDir, Source) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cam.jsonl");
        std::fs::write(&path, lines.join("\n")).unwrap();
        let source = Source::new("cam", "Cam", format!("replay://{}", path.display()));
        (dir, source)
    }

    #[tokio::test]
    async fn reads_lines_in_order_then_runs_dry() {
        let (_dir, source) = recording(&["[]", "", "[]"]);
        let frames = ReplayFrameSource::new(false);

        assert!(frames.read_frame(&source).await.unwrap().is_some());
        assert!(frames.read_frame(&source).await.unwrap().is_some());
        assert!(frames.read_frame(&source).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn looping_starts_over() {
        let (_dir, source) = recording(&["[1]", "[2]"]);
        let frames = ReplayFrameSource::new(true);

        let mut seen = vec![];
        for _ in 0..3 {
            let frame = frames.read_frame(&source).await.unwrap().unwrap();
            seen.push(String::from_utf8(frame.data).unwrap());
        }
        assert_eq!(seen, vec!["[1]", "[2]", "[1]"]);
    }

    #[tokio::test]
    async fn missing_recording_is_a_connection_failure() {
        let frames = ReplayFrameSource::new(true);
        let source = Source::new("cam", "Cam", "replay:///does/not/exist.jsonl");
        assert!(frames.read_frame(&source).await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn a_stalled_recording_does_not_block_other_sources() {
        let dir = tempfile::tempdir().unwrap();
        // Opening a fifo blocks until something opens its other end
        let fifo = dir.path().join("stalled.jsonl");
        let status = std::process::Command::new("mkfifo")
            .arg(&fifo)
            .status()
            .unwrap();
        assert!(status.success());
        let stalled = Source::new("stalled", "Stalled", format!("replay://{}", fifo.display()));
        let (_ready_dir, ready) = recording(&["[]"]);

        let frames = Arc::new(ReplayFrameSource::new(false));
        let waiting = tokio::spawn({
            let frames = frames.clone();
            async move { frames.read_frame(&stalled).await }
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let frame = tokio::time::timeout(
            std::time::Duration::from_secs(1),
            frames.read_frame(&ready),
        )
        .await
        .expect("read of a ready recording waited on a stalled one")
        .unwrap();
        assert!(frame.is_some());

        // Closing the writer end hands the stalled read an empty recording
        drop(std::fs::OpenOptions::new().write(true).open(&fifo).unwrap());
        assert!(waiting.await.unwrap().unwrap().is_none());
    }

    #[tokio::test]
    async fn detector_accepts_both_formats() {
        let line = r#"[
            {"box": {"x1": 0, "y1": 0, "x2": 10, "y2": 10}, "class": "car", "confidence": 0.9},
            {"box": [5, 5, 20, 20], "class_id": 3, "confidence": 0.4},
            {"box": [5, 5, 20, 20], "class_id": 0, "confidence": 0.99}
        ]"#;
        let frame = Frame::new("cam", 0, 0, line.as_bytes().to_vec());

        let detections = ReplayDetector.detect(&frame).await.unwrap();
        assert_eq!(detections.len(), 2);
        assert_eq!(detections[0].class, VehicleClass::Car);
        assert_eq!(detections[1].class, VehicleClass::Motorcycle);
        assert_eq!(detections[1].bbox, BoundingBox::new(5, 5, 20, 20));
    }

    #[tokio::test]
    async fn malformed_frame_is_an_error() {
        let frame = Frame::new("cam", 0, 0, b"not json".to_vec());
        assert!(ReplayDetector.detect(&frame).await.is_err());
    }
}
