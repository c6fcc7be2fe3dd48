use petgraph::stable_graph::NodeIndex;

use crate::buffer::AudioBuffer;
use crate::graph::AudioGraph;
use crate::nodes::{AudioNode, Param, RenderInfo};

/// Owns the signal graph and the sample-accurate audio clock.
///
/// The clock only moves when a block is rendered, so every timestamp handed to
/// a node (`start`, `stop`, parameter writes) resolves to an exact frame.
pub struct AudioContext {
    sample_rate: u32,
    frame: u64,
    pub graph: AudioGraph,
}

impl AudioContext {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate: sample_rate.max(1),
            frame: 0,
            graph: AudioGraph::new(),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Frames rendered so far.
    pub fn current_frame(&self) -> u64 {
        self.frame
    }

    /// Audio clock in seconds.
    pub fn current_time(&self) -> f64 {
        self.frame as f64 / self.sample_rate as f64
    }

    /// Nearest context frame for a time in seconds. Negative times map to 0.
    pub fn frame_at(&self, seconds: f64) -> u64 {
        (seconds * self.sample_rate as f64).round().max(0.0) as u64
    }

    pub fn destination(&self) -> NodeIndex {
        self.graph.destination()
    }

    pub fn add_node(&mut self, node: Box<dyn AudioNode>) -> NodeIndex {
        self.graph.add_node(node)
    }

    /// Write a parameter, effective from the current audio-clock frame.
    pub fn set_param(&mut self, node: NodeIndex, param: Param, value: f32) {
        let at = self.frame;
        if let Some(n) = self.graph.node_mut(node) {
            n.set_param(param, value, at);
        }
    }

    pub fn param(&self, node: NodeIndex, param: Param) -> Option<f32> {
        self.graph.node(node).and_then(|n| n.param(param))
    }

    pub fn start_at(&mut self, node: NodeIndex, when: f64) {
        let at = self.frame_at(when);
        if let Some(n) = self.graph.node_mut(node) {
            n.start(at);
        }
    }

    pub fn stop_at(&mut self, node: NodeIndex, when: f64) {
        let at = self.frame_at(when);
        if let Some(n) = self.graph.node_mut(node) {
            n.stop(at);
        }
    }

    /// Render into an interleaved device buffer with `channels` channels.
    ///
    /// Mono devices get the average of left and right; channels past the
    /// second are written as silence.
    pub fn render(&mut self, out: &mut [f32], channels: usize) {
        let channels = channels.max(1);
        let frames = out.len() / channels;
        let info = RenderInfo {
            start_frame: self.frame,
            sample_rate: self.sample_rate as f32,
        };
        let block = self.graph.process(frames, &info);

        for (i, frame) in out.chunks_exact_mut(channels).enumerate() {
            let (l, r) = (block.left[i], block.right[i]);
            if channels == 1 {
                frame[0] = (l + r) * 0.5;
                continue;
            }
            frame[0] = l;
            frame[1] = r;
            for s in frame.iter_mut().skip(2) {
                *s = 0.0;
            }
        }
        self.frame += frames as u64;
    }

    /// Render `frames` frames of stereo output, in blocks of `block_size`.
    pub fn render_offline(&mut self, frames: usize, block_size: usize) -> AudioBuffer {
        let block_size = block_size.max(1);
        let mut interleaved = vec![0.0f32; frames * 2];
        for chunk in interleaved.chunks_mut(block_size * 2) {
            self.render(chunk, 2);
        }
        AudioBuffer::from_interleaved(&interleaved, 2, self.sample_rate)
    }
}
