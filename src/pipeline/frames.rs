//! Frame plumbing: the bounded channel between producers and the response
//! stream, and the tag filter applied to sub-streams under the hybrid
//! scene.

use tokio::sync::mpsc;

use crate::models::Frame;

/// Sending side of a frame stream. `send` returns false once the receiver
/// is gone (client disconnected); producers must stop at that point.
#[derive(Clone)]
pub struct FrameSink {
    tx: mpsc::Sender<Frame>,
}

impl FrameSink {
    pub fn new(tx: mpsc::Sender<Frame>) -> Self {
        FrameSink { tx }
    }

    pub async fn send(&self, frame: Frame) -> bool {
        self.tx.send(frame).await.is_ok()
    }

    pub async fn think(&self, content: impl Into<String>) -> bool {
        self.send(Frame::think(content)).await
    }

    pub async fn data(&self, content: impl Into<String>) -> bool {
        self.send(Frame::data(content)).await
    }

    pub async fn knowledge(&self, content: impl Into<String>) -> bool {
        self.send(Frame::knowledge(content)).await
    }

    pub async fn error(&self, content: impl Into<String>) -> bool {
        self.send(Frame::error(content)).await
    }
}

pub fn frame_channel(capacity: usize) -> (FrameSink, mpsc::Receiver<Frame>) {
    let (tx, rx) = mpsc::channel(capacity);
    (FrameSink::new(tx), rx)
}

// ---------------------------------------------------------------------------
// Sub-stream filtering
// ---------------------------------------------------------------------------

/// Filter applied by the orchestrator to an inner component's frames.
///
/// The `<think>`/`<data>` markers arrive as dedicated frames; a frame
/// carrying a marker flips the corresponding state and is itself never
/// forwarded (except in `Forward` and `DropPreamble` modes, which do not
/// interpret tags).
pub enum StreamFilter {
    /// Pass everything through untouched (plain scene dispatch).
    Forward,
    /// Drop the inner `<think>…</think>` block, forward the rest without
    /// tag frames (hybrid scene, graph branch).
    DropThinkBlock { in_think: bool },
    /// Forward everything except tag frames while collecting the text
    /// inside `<data>…</data>` (hybrid scene, hybrid branch).
    CaptureData { in_think: bool, in_data: bool, captured: String },
    /// Drop frames repeating the orchestrator's own think preamble
    /// (hybrid scene, text/none branches).
    DropPreamble { marker: String },
}

impl StreamFilter {
    pub fn forward() -> Self {
        StreamFilter::Forward
    }

    pub fn drop_think_block() -> Self {
        StreamFilter::DropThinkBlock { in_think: false }
    }

    pub fn capture_data() -> Self {
        StreamFilter::CaptureData { in_think: false, in_data: false, captured: String::new() }
    }

    pub fn drop_preamble(marker: impl Into<String>) -> Self {
        StreamFilter::DropPreamble { marker: marker.into() }
    }

    /// Returns the frame to forward, or None when it is filtered out.
    pub fn apply(&mut self, frame: Frame) -> Option<Frame> {
        match self {
            StreamFilter::Forward => Some(frame),

            StreamFilter::DropThinkBlock { in_think } => {
                let content = frame.content.as_str();
                if content.contains("<think>") {
                    *in_think = true;
                    return None;
                }
                if content.contains("</think>") {
                    *in_think = false;
                    return None;
                }
                if content.contains("<data>") || content.contains("</data>") {
                    return None;
                }
                if *in_think {
                    None
                } else {
                    Some(frame)
                }
            }

            StreamFilter::CaptureData { in_think, in_data, captured } => {
                let content = frame.content.as_str();
                if content.contains("<think>") {
                    *in_think = true;
                    return None;
                }
                if content.contains("</think>") {
                    *in_think = false;
                    return None;
                }
                if content.contains("<data>") {
                    *in_data = true;
                    return None;
                }
                if content.contains("</data>") {
                    *in_data = false;
                    return None;
                }
                if *in_data {
                    captured.push_str(content);
                }
                Some(frame)
            }

            StreamFilter::DropPreamble { marker } => {
                if frame.content.contains(marker.as_str()) {
                    None
                } else {
                    Some(frame)
                }
            }
        }
    }

    /// Text collected inside the inner `<data>` block, if this filter
    /// captures it.
    pub fn captured(&self) -> &str {
        match self {
            StreamFilter::CaptureData { captured, .. } => captured.as_str(),
            _ => "",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames(contents: &[&str]) -> Vec<Frame> {
        contents.iter().map(|c| Frame::think(*c)).collect()
    }

    #[test]
    fn forward_passes_everything() {
        let mut filter = StreamFilter::forward();
        for frame in frames(&["<think>\n", "inner", "</think>\n"]) {
            assert!(filter.apply(frame).is_some());
        }
    }

    #[test]
    fn drop_think_block_strips_inner_reasoning() {
        let mut filter = StreamFilter::drop_think_block();
        let input = frames(&[
            "<think>\n",
            "意图分析：第一步",
            "意图分析：第二步",
            "\nCypher生成完成。\n</think>\n",
            "<data>\n",
            "河北单位建设了3个网络",
            "\n</data>\n",
        ]);

        let forwarded: Vec<String> = input
            .into_iter()
            .filter_map(|f| filter.apply(f))
            .map(|f| f.content)
            .collect();

        assert_eq!(forwarded, vec!["河北单位建设了3个网络".to_string()]);
    }

    #[test]
    fn capture_data_collects_and_forwards() {
        let mut filter = StreamFilter::capture_data();
        let input = frames(&[
            "<think>\n",
            "推理内容",
            "</think>\n",
            "<data>\n",
            "业务信息A",
            "业务信息B",
            "\n</data>\n",
            "<knowledge>\n检索到2条相关信息\n</knowledge>\n",
        ]);

        let forwarded: Vec<String> = input
            .into_iter()
            .filter_map(|f| filter.apply(f))
            .map(|f| f.content)
            .collect();

        assert_eq!(filter.captured(), "业务信息A业务信息B");
        // Tag frames gone; reasoning, data text and knowledge forwarded.
        assert_eq!(
            forwarded,
            vec![
                "推理内容".to_string(),
                "业务信息A".to_string(),
                "业务信息B".to_string(),
                "<knowledge>\n检索到2条相关信息\n</knowledge>\n".to_string(),
            ]
        );
    }

    #[test]
    fn drop_preamble_only_drops_marker_frames() {
        let marker = "<think>开始对用户的提问进行深入解析...\n";
        let mut filter = StreamFilter::drop_preamble(marker);

        assert!(filter.apply(Frame::think(marker)).is_none());
        assert!(filter.apply(Frame::think("其他思考")).is_some());
        assert!(filter.apply(Frame::data("<data>\n")).is_some());
    }

    #[tokio::test]
    async fn sink_reports_closed_receiver() {
        let (sink, rx) = frame_channel(4);
        assert!(sink.think("alive").await);
        drop(rx);
        assert!(!sink.think("dead").await);
    }
}
