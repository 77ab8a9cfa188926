use ringbuf::{
    HeapRb,
    traits::{Consumer, Observer, Producer, Split},
};

/// Interleaved stereo PCM frame.
pub type AudioFrame = [i16; 2];

/// Creates the lock-free single-producer/single-consumer pipe carrying engine
/// audio to the host. `capacity` is in frames.
pub fn channel(capacity: usize) -> (AudioSink, AudioSource) {
    let rb = HeapRb::<AudioFrame>::new(capacity.max(1));
    let (producer, consumer) = rb.split();
    (
        AudioSink {
            producer,
            dropped: 0,
        },
        AudioSource { consumer },
    )
}

/// Engine-side end of the audio pipe.
pub struct AudioSink {
    producer: ringbuf::HeapProd<AudioFrame>,
    dropped: u64,
}

impl AudioSink {
    /// Queues frames; when the pipe is full the newest frames are dropped
    /// rather than blocking the engine.
    pub fn push(&mut self, frames: &[AudioFrame]) -> usize {
        let pushed = self.producer.push_slice(frames);
        self.dropped += (frames.len() - pushed) as u64;
        pushed
    }

    /// Frames dropped so far because the host fell behind.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

/// Host-side end of the audio pipe.
pub struct AudioSource {
    consumer: ringbuf::HeapCons<AudioFrame>,
}

impl AudioSource {
    pub fn available(&self) -> usize {
        self.consumer.occupied_len()
    }

    /// Moves up to `count` frames into `out`, returning how many were moved.
    pub fn take(&mut self, count: usize, out: &mut Vec<AudioFrame>) -> usize {
        let start = out.len();
        out.resize(start + count, [0, 0]);
        let popped = self.consumer.pop_slice(&mut out[start..]);
        out.truncate(start + popped);
        popped
    }

    pub fn clear(&mut self) {
        self.consumer.clear();
    }
}

/// Per-refresh audio sample budget with carry of missed samples.
///
/// Each refresh needs `sample_rate * frame_time` frames. When the engine
/// produced fewer, the shortfall is owed and added to the next refresh's need,
/// except while timing is unreliable (warm-up, tampered frame time,
/// fast-forward) where owing samples would only build latency.
#[derive(Debug, Clone)]
pub struct AudioBudget {
    sample_rate: f64,
    capacity: usize,
    missed: usize,
}

impl AudioBudget {
    pub fn new(sample_rate: f64, capacity: usize) -> Self {
        Self {
            sample_rate,
            capacity,
            missed: 0,
        }
    }

    #[inline]
    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    #[inline]
    pub fn missed(&self) -> usize {
        self.missed
    }

    /// Frames to hand to the host for a refresh lasting `frame_secs`.
    pub fn plan(&mut self, frame_secs: f64, available: usize, relaxed: bool) -> usize {
        let need = if frame_secs.is_finite() && frame_secs > 0.0 {
            (self.sample_rate * frame_secs).round() as usize
        } else {
            0
        };
        let wanted = need + self.missed;
        let samples = wanted.min(self.capacity).min(available);
        self.missed = if relaxed { 0 } else { wanted - samples };
        samples
    }

    pub fn reset(&mut self) {
        self.missed = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shortfall_carries_forward() {
        let mut budget = AudioBudget::new(48_000.0, 4096);
        let frame = 1.0 / 60.0;
        assert_eq!(budget.plan(frame, 500, false), 500);
        assert_eq!(budget.missed(), 300);
        assert_eq!(budget.plan(frame, 2_000, false), 1_100);
        assert_eq!(budget.missed(), 0);
    }

    #[test]
    fn relaxed_frames_forget_the_debt() {
        let mut budget = AudioBudget::new(48_000.0, 4096);
        assert_eq!(budget.plan(1.0 / 60.0, 0, true), 0);
        assert_eq!(budget.missed(), 0);
    }

    #[test]
    fn capacity_caps_the_budget() {
        let mut budget = AudioBudget::new(48_000.0, 512);
        assert_eq!(budget.plan(1.0 / 30.0, 10_000, false), 512);
        assert_eq!(budget.missed(), 1_600 - 512);
        assert_eq!(budget.plan(0.0, 10_000, false), 512);
    }

    #[test]
    fn pipe_moves_frames_in_order() {
        let (mut sink, mut source) = channel(4);
        assert_eq!(sink.push(&[[1, 1], [2, 2], [3, 3], [4, 4], [5, 5]]), 4);
        assert_eq!(sink.dropped(), 1);
        assert_eq!(source.available(), 4);
        let mut out = Vec::new();
        assert_eq!(source.take(3, &mut out), 3);
        assert_eq!(out, vec![[1, 1], [2, 2], [3, 3]]);
        assert_eq!(source.take(8, &mut out), 1);
        assert_eq!(out.len(), 4);
        sink.push(&[[9, 9]]);
        source.clear();
        assert_eq!(source.available(), 0);
    }
}
