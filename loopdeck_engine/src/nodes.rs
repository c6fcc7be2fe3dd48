use std::collections::VecDeque;
use std::f64::consts::PI;
use std::sync::Arc;

use loopdeck_shared::{HIGH_PASS_OPEN_HZ, LOW_PASS_OPEN_HZ};

use crate::buffer::AudioBuffer;

/// Timing of the block being rendered.
#[derive(Debug, Clone, Copy)]
pub struct RenderInfo {
    /// Context frame of the first sample in the block.
    pub start_frame: u64,
    pub sample_rate: f32,
}

/// Planar stereo scratch buffer. Every bus in the graph is stereo.
#[derive(Debug, Clone, Default)]
pub struct StereoBlock {
    pub left: Vec<f32>,
    pub right: Vec<f32>,
}

impl StereoBlock {
    pub fn new(frames: usize) -> Self {
        Self {
            left: vec![0.0; frames],
            right: vec![0.0; frames],
        }
    }

    pub fn len(&self) -> usize {
        self.left.len()
    }

    pub fn is_empty(&self) -> bool {
        self.left.is_empty()
    }

    /// Resize to `frames` and zero (keeps capacity).
    pub fn prepare(&mut self, frames: usize) {
        self.left.resize(frames, 0.0);
        self.right.resize(frames, 0.0);
        self.left.fill(0.0);
        self.right.fill(0.0);
    }

    pub fn accumulate(&mut self, other: &StereoBlock) {
        for (d, s) in self.left.iter_mut().zip(&other.left) {
            *d += s;
        }
        for (d, s) in self.right.iter_mut().zip(&other.right) {
            *d += s;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Param {
    Gain,
    Pan,
    Frequency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Source,
    Gain,
    Panner,
    LowPass,
    HighPass,
    Destination,
}

pub trait AudioNode: Send {
    /// Render one block. `input` is the sum of every connected upstream node.
    fn process(&mut self, input: &StereoBlock, output: &mut StereoBlock, info: &RenderInfo);

    fn kind(&self) -> NodeKind;

    /// Schedule a parameter change at an absolute context frame.
    fn set_param(&mut self, _param: Param, _value: f32, _at_frame: u64) {}

    /// Value the parameter settles on once every scheduled change has applied.
    fn param(&self, _param: Param) -> Option<f32> {
        None
    }

    fn start(&mut self, _at_frame: u64) {}

    /// Request a stop. Stopping a source that already ended does nothing.
    fn stop(&mut self, _at_frame: u64) {}

    fn is_finished(&self) -> bool {
        false
    }
}

/// Parameter with step automation keyed by context frame.
#[derive(Debug, Clone)]
pub struct AudioParam {
    value: f32,
    events: VecDeque<(u64, f32)>,
}

impl AudioParam {
    pub fn new(value: f32) -> Self {
        Self {
            value,
            events: VecDeque::new(),
        }
    }

    /// Writes at the same frame replace each other; the latest one wins.
    pub fn set_value_at_frame(&mut self, value: f32, frame: u64) {
        match self.events.binary_search_by_key(&frame, |&(f, _)| f) {
            Ok(idx) => self.events[idx].1 = value,
            Err(idx) => self.events.insert(idx, (frame, value)),
        }
    }

    /// Applies every event due at or before `frame` and returns the value in effect.
    #[inline]
    pub fn advance(&mut self, frame: u64) -> f32 {
        while let Some(&(at, v)) = self.events.front() {
            if at > frame {
                break;
            }
            self.value = v;
            self.events.pop_front();
        }
        self.value
    }

    pub fn value(&self) -> f32 {
        self.value
    }

    pub fn final_value(&self) -> f32 {
        self.events.back().map_or(self.value, |&(_, v)| v)
    }
}

pub struct GainNode {
    pub gain: AudioParam,
}

impl GainNode {
    pub fn new(gain: f32) -> Self {
        Self {
            gain: AudioParam::new(gain),
        }
    }
}

impl AudioNode for GainNode {
    fn process(&mut self, input: &StereoBlock, output: &mut StereoBlock, info: &RenderInfo) {
        for i in 0..output.len() {
            let g = self.gain.advance(info.start_frame + i as u64);
            output.left[i] = input.left[i] * g;
            output.right[i] = input.right[i] * g;
        }
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Gain
    }

    fn set_param(&mut self, param: Param, value: f32, at_frame: u64) {
        if param == Param::Gain {
            self.gain.set_value_at_frame(value.max(0.0), at_frame);
        }
    }

    fn param(&self, param: Param) -> Option<f32> {
        (param == Param::Gain).then(|| self.gain.final_value())
    }
}

/// Equal-power stereo panner. Centre (0) passes the signal through untouched.
pub struct StereoPannerNode {
    pub pan: AudioParam,
}

impl StereoPannerNode {
    pub fn new(pan: f32) -> Self {
        Self {
            pan: AudioParam::new(pan),
        }
    }
}

impl AudioNode for StereoPannerNode {
    fn process(&mut self, input: &StereoBlock, output: &mut StereoBlock, info: &RenderInfo) {
        for i in 0..output.len() {
            let pan = self.pan.advance(info.start_frame + i as u64).clamp(-1.0, 1.0);
            let (l, r) = (input.left[i], input.right[i]);
            if pan <= 0.0 {
                let x = (pan + 1.0) * std::f32::consts::FRAC_PI_2;
                output.left[i] = l + r * x.cos();
                output.right[i] = r * x.sin();
            } else {
                let x = pan * std::f32::consts::FRAC_PI_2;
                output.left[i] = l * x.cos();
                output.right[i] = r + l * x.sin();
            }
        }
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Panner
    }

    fn set_param(&mut self, param: Param, value: f32, at_frame: u64) {
        if param == Param::Pan {
            self.pan.set_value_at_frame(value.clamp(-1.0, 1.0), at_frame);
        }
    }

    fn param(&self, param: Param) -> Option<f32> {
        (param == Param::Pan).then(|| self.pan.final_value())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterType {
    LowPass,
    HighPass,
}

/// RBJ cookbook biquad, Direct Form II Transposed, one state pair per channel.
pub struct BiquadFilterNode {
    pub filter_type: FilterType,
    pub frequency: AudioParam,
    q: f64,
    b0: f64,
    b1: f64,
    b2: f64,
    a1: f64,
    a2: f64,
    z: [[f64; 2]; 2],
    coeff_freq: f32,
    coeff_rate: f32,
}

impl BiquadFilterNode {
    pub fn new(filter_type: FilterType, frequency: f32) -> Self {
        Self {
            filter_type,
            frequency: AudioParam::new(frequency),
            q: std::f64::consts::FRAC_1_SQRT_2,
            b0: 1.0,
            b1: 0.0,
            b2: 0.0,
            a1: 0.0,
            a2: 0.0,
            z: [[0.0; 2]; 2],
            coeff_freq: f32::NAN,
            coeff_rate: 0.0,
        }
    }

    /// Filter with a cutoff that leaves the signal untouched.
    pub fn open(filter_type: FilterType) -> Self {
        let freq = match filter_type {
            FilterType::LowPass => LOW_PASS_OPEN_HZ,
            FilterType::HighPass => HIGH_PASS_OPEN_HZ,
        };
        Self::new(filter_type, freq)
    }

    /// Open cutoffs, and any cutoff at or past Nyquist, leave the signal untouched.
    fn is_open(&self, freq: f32, sample_rate: f32) -> bool {
        let nyquist = sample_rate * 0.5;
        match self.filter_type {
            FilterType::LowPass => freq >= LOW_PASS_OPEN_HZ || freq >= nyquist,
            FilterType::HighPass => freq <= HIGH_PASS_OPEN_HZ || freq >= nyquist,
        }
    }

    fn update_coefficients(&mut self, freq: f32, sample_rate: f32) {
        self.coeff_freq = freq;
        self.coeff_rate = sample_rate;

        if self.is_open(freq, sample_rate) {
            (self.b0, self.b1, self.b2, self.a1, self.a2) = (1.0, 0.0, 0.0, 0.0, 0.0);
            return;
        }

        // Keeps w0 inside (0, pi) so alpha stays positive and the poles stable.
        let nyquist = sample_rate as f64 * 0.5;
        let freq = (freq as f64).clamp(1e-3, nyquist * (1.0 - 1e-6));
        let w0 = 2.0 * PI * freq / sample_rate as f64;
        let cos_w0 = w0.cos();
        let alpha = w0.sin() / (2.0 * self.q);
        let a0 = 1.0 + alpha;
        let a1 = -2.0 * cos_w0;
        let a2 = 1.0 - alpha;

        let (b0, b1, b2) = match self.filter_type {
            FilterType::LowPass => {
                let b1 = 1.0 - cos_w0;
                (b1 / 2.0, b1, b1 / 2.0)
            }
            FilterType::HighPass => {
                let b0 = (1.0 + cos_w0) / 2.0;
                (b0, -(1.0 + cos_w0), b0)
            }
        };

        self.b0 = b0 / a0;
        self.b1 = b1 / a0;
        self.b2 = b2 / a0;
        self.a1 = a1 / a0;
        self.a2 = a2 / a0;
    }

    #[inline]
    fn tick(&mut self, ch: usize, x: f32) -> f32 {
        let x = x as f64;
        let [z1, z2] = self.z[ch];
        let y = self.b0 * x + z1;
        if !y.is_finite() {
            self.z[ch] = [0.0; 2];
            return 0.0;
        }
        self.z[ch] = [self.b1 * x - self.a1 * y + z2, self.b2 * x - self.a2 * y];
        y as f32
    }
}

impl AudioNode for BiquadFilterNode {
    fn process(&mut self, input: &StereoBlock, output: &mut StereoBlock, info: &RenderInfo) {
        for i in 0..output.len() {
            let freq = self.frequency.advance(info.start_frame + i as u64);
            if freq != self.coeff_freq || info.sample_rate != self.coeff_rate {
                self.update_coefficients(freq, info.sample_rate);
            }
            output.left[i] = self.tick(0, input.left[i]);
            output.right[i] = self.tick(1, input.right[i]);
        }
    }

    fn kind(&self) -> NodeKind {
        match self.filter_type {
            FilterType::LowPass => NodeKind::LowPass,
            FilterType::HighPass => NodeKind::HighPass,
        }
    }

    fn set_param(&mut self, param: Param, value: f32, at_frame: u64) {
        if param == Param::Frequency {
            // NaN maps to 0 here.
            self.frequency.set_value_at_frame(value.max(0.0), at_frame);
        }
    }

    fn param(&self, param: Param) -> Option<f32> {
        (param == Param::Frequency).then(|| self.frequency.final_value())
    }
}

/// Plays a shared buffer once, or repeats it natively when `looping` is set.
pub struct BufferSourceNode {
    buffer: Arc<AudioBuffer>,
    looping: bool,
    /// Read position at the start frame, in buffer frames.
    offset: f64,
    start_frame: Option<u64>,
    stop_frame: Option<u64>,
    started: bool,
    finished: bool,
}

impl BufferSourceNode {
    pub fn new(buffer: Arc<AudioBuffer>, looping: bool) -> Self {
        Self {
            buffer,
            looping,
            offset: 0.0,
            start_frame: None,
            stop_frame: None,
            started: false,
            finished: false,
        }
    }

    /// Begin `seconds` into the buffer instead of at its first frame.
    pub fn with_offset(mut self, seconds: f64) -> Self {
        self.offset = (seconds * self.buffer.sample_rate as f64).max(0.0);
        self
    }

    pub fn start_frame(&self) -> Option<u64> {
        self.start_frame
    }

    #[inline]
    fn read(&self, channel: usize, pos: f64) -> f32 {
        let data = &self.buffer.channels[channel];
        let len = data.len();
        let idx = pos.floor() as usize;
        let frac = (pos - idx as f64) as f32;
        let a = data[idx];
        if frac == 0.0 {
            return a;
        }
        let b = match data.get(idx + 1) {
            Some(&b) => b,
            None if self.looping => data[0],
            None => 0.0,
        };
        debug_assert!(idx < len);
        a * (1.0 - frac) + b * frac
    }
}

impl AudioNode for BufferSourceNode {
    fn process(&mut self, _input: &StereoBlock, output: &mut StereoBlock, info: &RenderInfo) {
        let Some(start) = self.start_frame else {
            return;
        };
        if self.finished {
            return;
        }

        let len = self.buffer.frames();
        if len == 0 || self.buffer.sample_rate == 0 {
            self.finished = true;
            return;
        }

        // A start time already in the past plays immediately.
        let start = if !self.started && start < info.start_frame {
            self.start_frame = Some(info.start_frame);
            info.start_frame
        } else {
            start
        };

        let ratio = self.buffer.sample_rate as f64 / info.sample_rate as f64;
        let len_f = len as f64;
        let right_ch = if self.buffer.channel_count() > 1 { 1 } else { 0 };

        for i in 0..output.len() {
            let frame = info.start_frame + i as u64;
            if let Some(stop) = self.stop_frame {
                if frame >= stop {
                    self.finished = true;
                    break;
                }
            }
            if frame < start {
                continue;
            }
            self.started = true;

            let mut pos = (frame - start) as f64 * ratio + self.offset;
            if self.looping {
                pos %= len_f;
            } else if pos >= len_f {
                self.finished = true;
                break;
            }

            output.left[i] = self.read(0, pos);
            output.right[i] = self.read(right_ch, pos);
        }
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Source
    }

    fn start(&mut self, at_frame: u64) {
        if self.start_frame.is_none() {
            self.start_frame = Some(at_frame);
        }
    }

    fn stop(&mut self, at_frame: u64) {
        if self.finished {
            return;
        }
        let at = self.stop_frame.map_or(at_frame, |s| s.min(at_frame));
        self.stop_frame = Some(at);
    }

    fn is_finished(&self) -> bool {
        self.finished
    }
}

/// Sink at the end of every track chain.
pub struct DestinationNode;

impl AudioNode for DestinationNode {
    fn process(&mut self, input: &StereoBlock, output: &mut StereoBlock, _info: &RenderInfo) {
        output.left.copy_from_slice(&input.left);
        output.right.copy_from_slice(&input.right);
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Destination
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn info(start_frame: u64) -> RenderInfo {
        RenderInfo {
            start_frame,
            sample_rate: 100.0,
        }
    }

    fn dc(frames: usize, v: f32) -> StereoBlock {
        StereoBlock {
            left: vec![v; frames],
            right: vec![v; frames],
        }
    }

    #[test]
    fn param_last_write_at_same_frame_wins() {
        let mut p = AudioParam::new(1.0);
        p.set_value_at_frame(0.2, 10);
        p.set_value_at_frame(0.7, 10);
        assert_eq!(p.advance(9), 1.0);
        assert_eq!(p.advance(10), 0.7);
        assert_eq!(p.final_value(), 0.7);
    }

    #[test]
    fn gain_applies_from_its_timestamp() {
        let mut node = GainNode::new(1.0);
        node.set_param(Param::Gain, 0.5, 4);
        let mut out = StereoBlock::new(8);
        node.process(&dc(8, 1.0), &mut out, &info(0));
        assert_eq!(&out.left[..4], &[1.0; 4]);
        assert_eq!(&out.left[4..], &[0.5; 4]);
    }

    #[test]
    fn centre_pan_is_identity_and_hard_left_moves_everything_left() {
        let mut node = StereoPannerNode::new(0.0);
        let input = StereoBlock {
            left: vec![0.3],
            right: vec![0.6],
        };
        let mut out = StereoBlock::new(1);
        node.process(&input, &mut out, &info(0));
        assert_relative_eq!(out.left[0], 0.3, epsilon = 1e-6);
        assert_relative_eq!(out.right[0], 0.6, epsilon = 1e-6);

        node.set_param(Param::Pan, -1.0, 1);
        node.process(&input, &mut out, &info(1));
        assert_relative_eq!(out.left[0], 0.9, epsilon = 1e-6);
        assert_relative_eq!(out.right[0], 0.0, epsilon = 1e-6);
    }

    #[test]
    fn open_filters_pass_signal_through() {
        for ty in [FilterType::LowPass, FilterType::HighPass] {
            let mut node = BiquadFilterNode::open(ty);
            let input = StereoBlock {
                left: vec![0.5, -0.25, 1.0, 0.0],
                right: vec![0.1, 0.2, 0.3, 0.4],
            };
            let mut out = StereoBlock::new(4);
            node.process(&input, &mut out, &info(0));
            assert_eq!(out.left, input.left);
            assert_eq!(out.right, input.right);
        }
    }

    #[test]
    fn low_pass_settles_on_dc_and_high_pass_removes_it() {
        let rate = RenderInfo {
            start_frame: 0,
            sample_rate: 48_000.0,
        };
        let mut lp = BiquadFilterNode::new(FilterType::LowPass, 1_000.0);
        let mut hp = BiquadFilterNode::new(FilterType::HighPass, 1_000.0);
        let input = dc(4_800, 1.0);
        let mut out = StereoBlock::new(4_800);

        lp.process(&input, &mut out, &rate);
        assert_relative_eq!(*out.left.last().unwrap(), 1.0, epsilon = 1e-3);
        hp.process(&input, &mut out, &rate);
        assert_relative_eq!(*out.left.last().unwrap(), 0.0, epsilon = 1e-3);
    }

    #[test]
    fn cutoffs_near_or_past_nyquist_stay_finite() {
        let rate = RenderInfo {
            start_frame: 0,
            sample_rate: 16_000.0,
        };
        let input = StereoBlock {
            left: (0..4_000).map(|i| if i % 7 < 3 { 0.8 } else { -0.6 }).collect(),
            right: vec![0.5; 4_000],
        };
        let mut out = StereoBlock::new(4_000);

        // Past Nyquist: both filters pass the signal through.
        for ty in [FilterType::LowPass, FilterType::HighPass] {
            let mut node = BiquadFilterNode::new(ty, 12_000.0);
            node.process(&input, &mut out, &rate);
            assert_eq!(out.left, input.left, "{ty:?}");
        }

        for hz in [7_999.0, 7_500.0, 1_000.0, 0.0] {
            let mut hp = BiquadFilterNode::new(FilterType::HighPass, hz);
            let mut lp = BiquadFilterNode::new(FilterType::LowPass, hz);
            hp.process(&input, &mut out, &rate);
            assert!(out.left.iter().chain(&out.right).all(|s| s.is_finite() && s.abs() < 10.0), "hp {hz}");
            lp.process(&input, &mut out, &rate);
            assert!(out.left.iter().chain(&out.right).all(|s| s.is_finite() && s.abs() < 10.0), "lp {hz}");
        }
    }

    #[test]
    fn filter_recovers_after_non_finite_input() {
        let mut lp = BiquadFilterNode::new(FilterType::LowPass, 10.0);
        let mut out = StereoBlock::new(3);
        lp.process(&dc(3, f32::NAN), &mut out, &info(0));
        assert_eq!(out.left, vec![0.0; 3]);

        let mut out = StereoBlock::new(200);
        lp.process(&dc(200, 1.0), &mut out, &info(3));
        assert!(out.left.iter().all(|s| s.is_finite()));
    }

    #[test]
    fn param_queue_drains_in_frame_order() {
        let mut p = AudioParam::new(0.0);
        p.set_value_at_frame(3.0, 30);
        p.set_value_at_frame(1.0, 10);
        p.set_value_at_frame(2.0, 20);
        assert_eq!(p.advance(25), 2.0);
        assert_eq!(p.final_value(), 3.0);
        assert_eq!(p.advance(30), 3.0);
        assert_eq!(p.final_value(), 3.0);
    }

    #[test]
    fn one_shot_source_starts_on_its_frame_and_finishes() {
        let buf = Arc::new(AudioBuffer::new(vec![vec![1.0, 2.0, 3.0]], 100));
        let mut src = BufferSourceNode::new(buf, false);
        src.start(2);
        let mut out = StereoBlock::new(8);
        src.process(&StereoBlock::new(8), &mut out, &info(0));
        assert_eq!(out.left, vec![0.0, 0.0, 1.0, 2.0, 3.0, 0.0, 0.0, 0.0]);
        assert_eq!(out.right, out.left);
        assert!(src.is_finished());

        // Stopping an ended source is a no-op.
        src.stop(100);
        assert!(src.is_finished());
    }

    #[test]
    fn looping_source_repeats_until_stopped() {
        let buf = Arc::new(AudioBuffer::new(vec![vec![1.0, 2.0]], 100));
        let mut src = BufferSourceNode::new(buf, true);
        src.start(0);
        src.stop(5);
        let mut out = StereoBlock::new(7);
        src.process(&StereoBlock::new(7), &mut out, &info(0));
        assert_eq!(out.left, vec![1.0, 2.0, 1.0, 2.0, 1.0, 0.0, 0.0]);
        assert!(src.is_finished());
    }

    #[test]
    fn looping_source_can_start_mid_buffer() {
        let buf = Arc::new(AudioBuffer::new(vec![vec![1.0, 2.0, 3.0, 4.0]], 4));
        let mut src = BufferSourceNode::new(buf, true).with_offset(0.75);
        src.start(0);
        let mut out = StereoBlock::new(6);
        let rate = RenderInfo {
            start_frame: 0,
            sample_rate: 4.0,
        };
        src.process(&StereoBlock::new(6), &mut out, &rate);
        assert_eq!(out.left, vec![4.0, 1.0, 2.0, 3.0, 4.0, 1.0]);
    }

    #[test]
    fn late_start_plays_immediately() {
        let buf = Arc::new(AudioBuffer::new(vec![vec![0.5, 0.25]], 100));
        let mut src = BufferSourceNode::new(buf, false);
        src.start(3);
        let mut out = StereoBlock::new(2);
        src.process(&StereoBlock::new(2), &mut out, &info(10));
        assert_eq!(out.left, vec![0.5, 0.25]);
        assert_eq!(src.start_frame(), Some(10));
    }
}
