//! shm-audio-bridge - 共享内存音频桥的命令行工具
//!
//! - produce: 作为生产者创建共享段并按实时节奏写入测试信号
//! - consume: 模拟宿主回调，按实时节奏读取
//! - inspect / unlink: 查看或删除共享段

use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{ensure, Context};
use clap::{Args, Parser, Subcommand};

use shm_audio_bridge::audio::consumer::DEFAULT_STALE_AFTER_CYCLES;
use shm_audio_bridge::audio::timing::Pacer;
use shm_audio_bridge::audio::{
    ConsumerConfig, ConsumerRole, CycleOutcome, ProducerConfig, ProducerRole, SignalGenerator,
    SignalKind, StreamFormat,
};
use shm_audio_bridge::shm::layout::{
    DEFAULT_CAPACITY_FRAMES, DEFAULT_CHANNELS, DEFAULT_SAMPLE_RATE, DEFAULT_SEGMENT_NAME,
};
use shm_audio_bridge::shm::{
    ConnectionState, RingError, RingLayout, SegmentError, SegmentName, SharedRegion,
    SharedSegment,
};

/// 状态行刷新间隔
const STATUS_INTERVAL: Duration = Duration::from_millis(100);

/// Shared-memory audio bridge - lock-free SPSC audio transport between processes
#[derive(Parser)]
#[command(name = "shm-audio-bridge")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Show verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// 共享段参数（两端必须一致）
#[derive(Args, Debug, Clone)]
struct SegmentArgs {
    /// Shared memory segment name (must start with '/')
    #[arg(short, long, default_value = DEFAULT_SEGMENT_NAME)]
    name: String,

    /// Ring buffer capacity in frames
    #[arg(long, default_value_t = DEFAULT_CAPACITY_FRAMES)]
    frames: u32,

    /// Interleaved channel count
    #[arg(long, default_value_t = DEFAULT_CHANNELS)]
    channels: u32,

    /// Sample rate in Hz
    #[arg(long, default_value_t = DEFAULT_SAMPLE_RATE)]
    sample_rate: u32,
}

impl SegmentArgs {
    fn segment_name(&self) -> anyhow::Result<SegmentName> {
        SegmentName::new(&self.name).with_context(|| format!("bad segment name '{}'", self.name))
    }

    fn layout(&self) -> anyhow::Result<RingLayout> {
        let layout = RingLayout::new(self.frames, self.channels, self.sample_rate);
        ensure!(layout.is_valid(), "invalid ring layout: {}", layout);
        ensure!(
            self.channels <= u16::MAX as u32,
            "too many channels: {}",
            self.channels
        );
        Ok(layout)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Create the segment and stream a test signal into it
    Produce {
        #[command(flatten)]
        segment: SegmentArgs,

        /// Frames written per chunk
        #[arg(long, default_value_t = 256)]
        chunk_frames: u32,

        /// Test signal
        #[arg(long, value_enum, default_value_t = SignalKind::Sine)]
        signal: SignalKind,

        /// Sine frequency in Hz
        #[arg(long, default_value_t = 440.0)]
        frequency: f32,

        /// Peak amplitude (0.0 - 1.0)
        #[arg(long, default_value_t = 0.25)]
        amplitude: f32,

        /// Lock the mapping into RAM (mlock)
        #[arg(long)]
        lock_memory: bool,

        /// Remove the segment when stopping
        #[arg(long)]
        unlink_on_exit: bool,
    },

    /// Simulate the real-time host callback reading from the segment
    Consume {
        #[command(flatten)]
        segment: SegmentArgs,

        /// Frames requested per callback
        #[arg(long, default_value_t = 512)]
        callback_frames: u32,

        /// Frozen-producer threshold in callbacks (0 disables)
        #[arg(long, default_value_t = DEFAULT_STALE_AFTER_CYCLES)]
        stale_after: u32,

        /// Drop buffered audio every time the segment is (re)connected
        #[arg(long)]
        discard_backlog: bool,

        /// Stop after this many seconds
        #[arg(short, long)]
        duration: Option<u64>,
    },

    /// Print the segment header
    Inspect {
        #[command(flatten)]
        segment: SegmentArgs,
    },

    /// Remove the named segment
    Unlink {
        /// Shared memory segment name
        #[arg(short, long, default_value = DEFAULT_SEGMENT_NAME)]
        name: String,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // 初始化日志
    if cli.verbose {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    }

    match cli.command {
        Commands::Produce {
            segment,
            chunk_frames,
            signal,
            frequency,
            amplitude,
            lock_memory,
            unlink_on_exit,
        } => {
            let options = ProduceOptions {
                chunk_frames,
                signal,
                frequency,
                amplitude,
                lock_memory,
                unlink_on_exit,
            };
            produce(&segment, &options)?;
        }
        Commands::Consume {
            segment,
            callback_frames,
            stale_after,
            discard_backlog,
            duration,
        } => {
            let config = ConsumerConfig {
                stale_after_cycles: stale_after,
                discard_backlog_on_connect: discard_backlog,
            };
            consume(&segment, callback_frames, config, duration.map(Duration::from_secs))?;
        }
        Commands::Inspect { segment } => {
            inspect(&segment)?;
        }
        Commands::Unlink { name } => {
            let name = SegmentName::new(&name).with_context(|| format!("bad segment name '{}'", name))?;
            match SharedSegment::unlink(&name) {
                Ok(()) => println!("Removed {}", name),
                Err(SegmentError::NotFound) => println!("{} does not exist", name),
                Err(e) => return Err(e).with_context(|| format!("failed to remove {}", name)),
            }
        }
    }

    Ok(())
}

/// 安装 Ctrl+C 处理，返回运行标志
fn install_ctrlc() -> anyhow::Result<Arc<AtomicBool>> {
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;
    Ok(running)
}

struct ProduceOptions {
    chunk_frames: u32,
    signal: SignalKind,
    frequency: f32,
    amplitude: f32,
    lock_memory: bool,
    unlink_on_exit: bool,
}

/// 生产者模式
fn produce(segment: &SegmentArgs, options: &ProduceOptions) -> anyhow::Result<()> {
    let layout = segment.layout()?;
    let config = ProducerConfig {
        segment_name: segment.segment_name()?,
        layout,
        lock_memory: options.lock_memory,
    };
    ensure!(
        options.chunk_frames > 0 && options.chunk_frames <= layout.capacity_frames,
        "chunk size must be between 1 and {} frames",
        layout.capacity_frames
    );

    let mut producer = ProducerRole::create(&config)
        .with_context(|| format!("failed to create shared memory segment {}", config.segment_name))?;
    let running = install_ctrlc()?;

    let format = StreamFormat::from(layout);
    let mut generator =
        SignalGenerator::new(options.signal, format, options.frequency, options.amplitude);
    let mut chunk = vec![0.0f32; format.samples_for_frames(options.chunk_frames as usize)];
    let mut pacer = Pacer::new(format.period(options.chunk_frames as usize));

    let action = if producer.region().created() { "Created" } else { "Reusing" };
    println!("{} {} ({})", action, config.segment_name, layout);
    if producer.region().is_memory_locked() {
        println!("Memory locked.");
    }
    println!(
        "Producing {:?} in {}-frame chunks every {:.2} ms. Press Ctrl+C to stop.\n",
        generator.kind(),
        options.chunk_frames,
        pacer.period().as_secs_f64() * 1000.0
    );

    producer.start();
    let mut last_status = Instant::now();
    let mut late_cycles = 0u64;

    while running.load(Ordering::SeqCst) {
        generator.fill(&mut chunk);
        match producer.push(&chunk) {
            Ok(()) | Err(RingError::CapacityExceeded { .. }) => {}
            Err(e) => return Err(e).context("write to ring buffer failed"),
        }

        if last_status.elapsed() >= STATUS_INTERVAL {
            let ring = producer.region().ring();
            let stats = producer.stats();
            print!(
                "\r  Buffer: {:5.1}%  |  Written: {} frames  |  Dropped: {} chunks  |  Late: {}  ",
                ring.fill_ratio() * 100.0,
                stats.frames_written(),
                stats.chunks_dropped(),
                late_cycles
            );
            io::stdout().flush()?;
            last_status = Instant::now();
        }

        if pacer.wait() {
            late_cycles += 1;
        }
    }

    producer.stop();
    println!("\n\n{}", producer.stats().report());

    if options.unlink_on_exit {
        drop(producer);
        SharedSegment::unlink(&config.segment_name)
            .with_context(|| format!("failed to remove {}", config.segment_name))?;
        println!("Removed {}", config.segment_name);
    }

    Ok(())
}

/// 消费者模式（模拟宿主 IO 回调）
fn consume(
    segment: &SegmentArgs,
    callback_frames: u32,
    config: ConsumerConfig,
    duration: Option<Duration>,
) -> anyhow::Result<()> {
    let layout = segment.layout()?;
    let name = segment.segment_name()?;
    ensure!(callback_frames > 0, "callback size must be at least 1 frame");

    let running = install_ctrlc()?;
    let mut consumer = ConsumerRole::connect(name.clone(), layout, config);

    let format = StreamFormat::from(layout);
    let mut buffer = vec![0.0f32; format.samples_for_frames(callback_frames as usize)];
    let mut pacer = Pacer::new(format.period(callback_frames as usize));
    let started = Instant::now();

    println!("Consuming {} ({})", name, layout);
    println!(
        "{} frames per callback every {:.2} ms. Press Ctrl+C to stop.\n",
        callback_frames,
        pacer.period().as_secs_f64() * 1000.0
    );

    let mut last_status = Instant::now();

    while running.load(Ordering::SeqCst) {
        if duration.is_some_and(|limit| started.elapsed() >= limit) {
            break;
        }

        let outcome = consumer.render(&mut buffer);

        if last_status.elapsed() >= STATUS_INTERVAL {
            let peak = if outcome.is_silent() {
                0.0
            } else {
                buffer.iter().fold(0.0f32, |acc, s| acc.max(s.abs()))
            };
            let stats = consumer.stats();
            let state = match consumer.connector().state() {
                ConnectionState::Connected => "connected",
                ConnectionState::Disconnected => "waiting",
            };
            print!(
                "\r  {:<9} | {:<12} | Peak: {:.3}  |  Underruns: {}  |  Stale: {}  ",
                state,
                outcome_label(outcome),
                peak,
                stats.underrun_count(),
                stats.stale_events()
            );
            io::stdout().flush()?;
            last_status = Instant::now();
        }

        pacer.wait();
    }

    println!("\n");
    if let Some(err) = consumer.connector().last_error() {
        println!("Last connection error: {}\n", err);
    }
    println!(
        "{}",
        consumer.stats().report(callback_frames, layout.sample_rate)
    );

    Ok(())
}

fn outcome_label(outcome: CycleOutcome) -> &'static str {
    match outcome {
        CycleOutcome::Delivered => "delivered",
        CycleOutcome::Underrun => "underrun",
        CycleOutcome::Inactive => "inactive",
        CycleOutcome::Disconnected => "disconnected",
        CycleOutcome::Stale => "stale",
        CycleOutcome::Busy => "busy",
    }
}

/// 打印段头部
fn inspect(segment: &SegmentArgs) -> anyhow::Result<()> {
    let layout = segment.layout()?;
    let name = segment.segment_name()?;

    let mapped = SharedSegment::open_existing(&name, layout)
        .with_context(|| format!("failed to open {}", name))?;
    let ring = mapped.ring();

    let write = ring.write_index();
    let read = ring.read_index();

    println!("=== {} ===\n", name);
    println!("Layout:       {}", layout);
    println!("Size:         {} bytes", mapped.len());
    println!("Active:       {}", ring.is_active());
    println!("Write index:  {}", write);
    println!("Read index:   {}", read);
    println!(
        "Buffered:     {} frames ({:.1}%)",
        ring.available_to_read(),
        ring.fill_ratio() * 100.0
    );
    println!("Free:         {} frames", ring.available_to_write());
    if write < read || write - read > ring.capacity_frames() {
        println!("\nWarning: counters are inconsistent (write - read outside 0..={})", ring.capacity_frames());
    }

    Ok(())
}
