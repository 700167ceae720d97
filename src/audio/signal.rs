//! 测试信号生成
//!
//! 生产者命令行用它产生交织的 f32 样本，不依赖任何音频输入

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::format::StreamFormat;

/// 信号类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum SignalKind {
    /// 正弦波，所有声道同相
    Sine,
    /// 均匀分布白噪声
    Noise,
    /// 全零
    Silence,
}

/// 交织样本生成器
pub struct SignalGenerator {
    kind: SignalKind,
    format: StreamFormat,
    amplitude: f32,
    /// 每个样本的相位增量（弧度）
    phase_step: f64,
    phase: f64,
    rng: StdRng,
}

impl SignalGenerator {
    pub fn new(kind: SignalKind, format: StreamFormat, frequency: f32, amplitude: f32) -> Self {
        let phase_step = if format.sample_rate > 0 {
            std::f64::consts::TAU * frequency as f64 / format.sample_rate as f64
        } else {
            0.0
        };

        Self {
            kind,
            format,
            amplitude: amplitude.clamp(0.0, 1.0),
            phase_step,
            phase: 0.0,
            // 固定种子：同样的参数得到同样的样本序列
            rng: StdRng::seed_from_u64(0x5eed),
        }
    }

    pub fn kind(&self) -> SignalKind {
        self.kind
    }

    /// 填满一个交织缓冲区
    ///
    /// `output.len()` 应为声道数的整数倍，尾部不足一帧的样本置零
    pub fn fill(&mut self, output: &mut [f32]) {
        let channels = self.format.samples_per_frame();
        if channels == 0 {
            output.fill(0.0);
            return;
        }

        let mut frames = output.chunks_exact_mut(channels);
        match self.kind {
            SignalKind::Sine => {
                for frame in &mut frames {
                    let value = (self.phase.sin() as f32) * self.amplitude;
                    frame.fill(value);
                    self.phase = (self.phase + self.phase_step) % std::f64::consts::TAU;
                }
            }
            SignalKind::Noise => {
                for frame in &mut frames {
                    for sample in frame {
                        *sample = self.rng.gen_range(-1.0f32..=1.0) * self.amplitude;
                    }
                }
            }
            SignalKind::Silence => {
                for frame in &mut frames {
                    frame.fill(0.0);
                }
            }
        }
        frames.into_remainder().fill(0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sine_is_bounded_and_in_phase() {
        let format = StreamFormat::new(48000, 2);
        let mut gen = SignalGenerator::new(SignalKind::Sine, format, 1000.0, 0.5);

        let mut buf = vec![0.0f32; 480 * 2];
        gen.fill(&mut buf);

        for frame in buf.chunks_exact(2) {
            assert_eq!(frame[0], frame[1]);
            assert!(frame[0].abs() <= 0.5 + f32::EPSILON);
        }
        // 1 kHz @ 48 kHz：第 12 帧是四分之一周期，接近峰值
        assert!((buf[12 * 2] - 0.5).abs() < 1e-3);
    }

    #[test]
    fn test_sine_phase_continues_across_calls() {
        let format = StreamFormat::new(48000, 1);
        let mut whole = SignalGenerator::new(SignalKind::Sine, format, 440.0, 1.0);
        let mut split = SignalGenerator::new(SignalKind::Sine, format, 440.0, 1.0);

        let mut a = vec![0.0f32; 256];
        whole.fill(&mut a);

        let mut b = vec![0.0f32; 256];
        split.fill(&mut b[..100]);
        split.fill(&mut b[100..]);

        for (x, y) in a.iter().zip(&b) {
            assert!((x - y).abs() < 1e-5);
        }
    }

    #[test]
    fn test_noise_is_deterministic_and_bounded() {
        let format = StreamFormat::new(48000, 2);
        let mut a = SignalGenerator::new(SignalKind::Noise, format, 0.0, 0.25);
        let mut b = SignalGenerator::new(SignalKind::Noise, format, 0.0, 0.25);

        let mut buf_a = vec![0.0f32; 1024];
        let mut buf_b = vec![0.0f32; 1024];
        a.fill(&mut buf_a);
        b.fill(&mut buf_b);

        assert_eq!(buf_a, buf_b);
        assert!(buf_a.iter().all(|s| s.abs() <= 0.25));
        assert!(buf_a.iter().any(|&s| s != 0.0));
    }

    #[test]
    fn test_silence_and_partial_tail() {
        let format = StreamFormat::new(48000, 2);
        let mut gen = SignalGenerator::new(SignalKind::Sine, format, 1000.0, 1.0);
        let mut buf = vec![7.0f32; 5];
        gen.fill(&mut buf);
        assert_eq!(buf[4], 0.0);

        let mut gen = SignalGenerator::new(SignalKind::Silence, format, 1000.0, 1.0);
        let mut buf = vec![7.0f32; 64];
        gen.fill(&mut buf);
        assert!(buf.iter().all(|&s| s == 0.0));
    }
}
