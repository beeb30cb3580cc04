use std::collections::HashSet;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use image::codecs::jpeg::JpegEncoder;
use tracing::debug;

use crate::bitstream::Bitstream;
use crate::contract::{
    AccelerationMode, Codec, EncodeParams, FrameAllocRequest, ImplType,
    ImplementationDescription, IoPattern, QueryOutcome, SubmitStatus, SyncPoint, SyncStatus,
    align16,
};
use crate::pipeline::{
    CompletionRx, CompletionTx, InFlightCredits, QueueRecvError, QueueStats, completion_queue,
};
use crate::surface::{FrameSurface, SurfaceLockGuard};
use crate::transform::{Nv12Frame, nv12_to_rgb_image};
use crate::{BackendError, VideoEncoder};

pub const CPU_IMPLEMENTATION_NAME: &str = "hw-jpeg cpu";

#[derive(Debug, Clone, Default)]
pub struct CpuEncoderOptions {
    pub report_metrics: Option<bool>,
}

fn should_report_metrics(options: &CpuEncoderOptions) -> bool {
    options.report_metrics.unwrap_or_else(|| {
        std::env::var("HW_JPEG_REPORT_METRICS")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    })
}

#[must_use]
pub fn cpu_implementation() -> ImplementationDescription {
    ImplementationDescription {
        name: CPU_IMPLEMENTATION_NAME.to_string(),
        version: env!("CARGO_PKG_VERSION"),
        impl_type: ImplType::Software,
        accel_mode: AccelerationMode::Na,
        codecs: vec![Codec::Jpeg],
        path: None,
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct JobTiming {
    convert: Duration,
    encode: Duration,
}

struct EncodeJob {
    sync: SyncPoint,
    frame: Nv12Frame,
    quality: u8,
    lock: SurfaceLockGuard,
}

type JobOutput = (Result<Vec<u8>, BackendError>, JobTiming);

struct RunningWorker {
    jobs_tx: Option<mpsc::Sender<EncodeJob>>,
    results_rx: Option<CompletionRx<SyncPoint, JobOutput>>,
    handle: Option<JoinHandle<()>>,
}

impl RunningWorker {
    fn spawn(queue_capacity: usize) -> Result<Self, BackendError> {
        let (jobs_tx, jobs_rx) = mpsc::channel::<EncodeJob>();
        let (results_tx, results_rx) = completion_queue(queue_capacity);
        let handle = thread::Builder::new()
            .name("hw-jpeg-cpu".to_string())
            .spawn(move || run_worker(jobs_rx, results_tx))
            .map_err(|err| BackendError::Backend(format!("failed to spawn encode worker: {err}")))?;
        Ok(Self {
            jobs_tx: Some(jobs_tx),
            results_rx: Some(results_rx),
            handle: Some(handle),
        })
    }

    fn submit(&self, job: EncodeJob) -> Result<(), BackendError> {
        let Some(tx) = &self.jobs_tx else {
            return Err(BackendError::DeviceLost("encode worker is shut down".to_string()));
        };
        tx.send(job)
            .map_err(|_| BackendError::DeviceLost("encode worker exited".to_string()))
    }

    /// Waits up to `wait` for `sync`; `Ok(None)` while the job is still running.
    fn wait_for(
        &mut self,
        sync: SyncPoint,
        wait: Duration,
    ) -> Result<Option<JobOutput>, BackendError> {
        let Some(results) = self.results_rx.as_mut() else {
            return Err(BackendError::DeviceLost("encode worker is shut down".to_string()));
        };
        results
            .wait_for(&sync, wait)
            .map_err(|QueueRecvError::Disconnected| {
                BackendError::DeviceLost("encode worker exited".to_string())
            })
    }

    fn queue_stats(&self) -> QueueStats {
        self.results_rx
            .as_ref()
            .map(CompletionRx::stats)
            .unwrap_or_default()
    }
}

impl Drop for RunningWorker {
    fn drop(&mut self) {
        let _ = self.jobs_tx.take();
        let _ = self.results_rx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run_worker(jobs: mpsc::Receiver<EncodeJob>, results: CompletionTx<SyncPoint, JobOutput>) {
    for job in jobs {
        let EncodeJob {
            sync,
            frame,
            quality,
            lock,
        } = job;
        let mut timing = JobTiming::default();
        let result = encode_timed(&frame, quality, &mut timing);
        drop(lock);
        if results.complete(sync, (result, timing)).is_err() {
            break;
        }
    }
}

fn encode_timed(
    frame: &Nv12Frame,
    quality: u8,
    timing: &mut JobTiming,
) -> Result<Vec<u8>, BackendError> {
    let convert_start = Instant::now();
    let image = nv12_to_rgb_image(frame.planes())?;
    timing.convert = convert_start.elapsed();

    let encode_start = Instant::now();
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, quality)
        .encode_image(&image)
        .map_err(|err| BackendError::Backend(format!("jpeg encode failed: {err}")))?;
    timing.encode = encode_start.elapsed();
    Ok(out)
}

/// Encodes one compact NV12 frame to a baseline JPEG.
pub fn encode_nv12_to_jpeg(frame: &Nv12Frame, quality: u8) -> Result<Vec<u8>, BackendError> {
    encode_timed(frame, quality, &mut JobTiming::default())
}

/// Parameters the CPU runtime can never substitute.
fn check_fixed(
    description: &ImplementationDescription,
    params: &EncodeParams,
) -> Result<(), BackendError> {
    if !description.codecs.contains(&params.codec) {
        return Err(BackendError::UnsupportedCodec(params.codec));
    }
    let info = &params.frame_info;
    if info.crop_w == 0 || info.crop_h == 0 {
        return Err(BackendError::InvalidInput(format!(
            "crop size must be positive, got {}x{}",
            info.crop_w, info.crop_h
        )));
    }
    if info.crop_x != 0 || info.crop_y != 0 {
        return Err(BackendError::UnsupportedConfig(
            "crop offsets are not supported".to_string(),
        ));
    }
    if info.frame_rate.denominator == 0 || info.frame_rate.numerator == 0 {
        return Err(BackendError::InvalidInput(format!(
            "invalid frame rate {}",
            info.frame_rate
        )));
    }
    if params.io_pattern != IoPattern::SystemMemory {
        return Err(BackendError::UnsupportedConfig(
            "only system-memory input surfaces are supported".to_string(),
        ));
    }
    Ok(())
}

fn dimension_is_valid(allocated: u16, crop: u16) -> bool {
    allocated % 16 == 0 && allocated >= crop
}

/// Parameters init and reset accept without adjustment.
fn check_strict(
    description: &ImplementationDescription,
    params: &EncodeParams,
) -> Result<(), BackendError> {
    check_fixed(description, params)?;
    let info = &params.frame_info;
    if !(1..=100).contains(&params.quality) {
        return Err(BackendError::InvalidInput(format!(
            "quality must be within 1..=100, got {}",
            params.quality
        )));
    }
    if !dimension_is_valid(info.width, info.crop_w) || !dimension_is_valid(info.height, info.crop_h)
    {
        return Err(BackendError::InvalidInput(format!(
            "allocation size {}x{} does not cover crop {}x{} at 16-pixel alignment",
            info.width, info.height, info.crop_w, info.crop_h
        )));
    }
    if !params.interleaved {
        return Err(BackendError::UnsupportedConfig(
            "only interleaved scans are supported".to_string(),
        ));
    }
    Ok(())
}

fn buffer_size_kb(params: &EncodeParams) -> u32 {
    let info = &params.frame_info;
    let worst_case = usize::from(info.crop_w) * usize::from(info.crop_h) * 3 + 4096;
    u32::try_from(worst_case.div_ceil(1024)).unwrap_or(u32::MAX)
}

pub struct CpuEncoderAdapter {
    description: ImplementationDescription,
    report_metrics: bool,
    params: Option<EncodeParams>,
    worker: Option<RunningWorker>,
    credits: InFlightCredits,
    outstanding: HashSet<SyncPoint>,
    next_sync: u64,
}

impl CpuEncoderAdapter {
    #[must_use]
    pub fn new() -> Self {
        Self::with_options(CpuEncoderOptions::default())
    }

    #[must_use]
    pub fn with_options(options: CpuEncoderOptions) -> Self {
        Self {
            description: cpu_implementation(),
            report_metrics: should_report_metrics(&options),
            params: None,
            worker: None,
            credits: InFlightCredits::new(1),
            outstanding: HashSet::new(),
            next_sync: 1,
        }
    }
}

impl Default for CpuEncoderAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl VideoEncoder for CpuEncoderAdapter {
    fn implementation(&self) -> &ImplementationDescription {
        &self.description
    }

    fn query(&self, params: &mut EncodeParams) -> Result<QueryOutcome, BackendError> {
        check_fixed(&self.description, params)?;
        let mut outcome = QueryOutcome::Exact;
        if !(1..=100).contains(&params.quality) {
            params.quality = params.quality.clamp(1, 100);
            outcome = QueryOutcome::Adjusted;
        }
        let info = &mut params.frame_info;
        if !dimension_is_valid(info.width, info.crop_w) {
            info.width = align16(info.crop_w);
            outcome = QueryOutcome::Adjusted;
        }
        if !dimension_is_valid(info.height, info.crop_h) {
            info.height = align16(info.crop_h);
            outcome = QueryOutcome::Adjusted;
        }
        if !params.interleaved {
            params.interleaved = true;
            outcome = QueryOutcome::Adjusted;
        }
        params.buffer_size_kb = buffer_size_kb(params);
        Ok(outcome)
    }

    fn init(&mut self, params: &EncodeParams) -> Result<(), BackendError> {
        if self.params.is_some() {
            return Err(BackendError::Backend(
                "encoder is already initialized".to_string(),
            ));
        }
        check_strict(&self.description, params)?;
        let depth = usize::from(params.async_depth.max(1));
        self.worker = Some(RunningWorker::spawn(depth)?);
        self.credits = InFlightCredits::new(depth);
        let mut params = params.clone();
        params.buffer_size_kb = buffer_size_kb(&params);
        debug!(%params, "cpu encoder initialized");
        self.params = Some(params);
        Ok(())
    }

    fn query_io_surf(&self, params: &EncodeParams) -> Result<FrameAllocRequest, BackendError> {
        check_fixed(&self.description, params)?;
        let depth = params.async_depth.max(1);
        Ok(FrameAllocRequest {
            num_frame_min: depth,
            num_frame_suggested: depth.saturating_add(1),
            info: params.frame_info,
        })
    }

    fn get_video_param(&self) -> Result<EncodeParams, BackendError> {
        self.params.clone().ok_or(BackendError::NotInitialized)
    }

    fn reset(&mut self, params: &EncodeParams) -> Result<(), BackendError> {
        let Some(current) = self.params.as_mut() else {
            return Err(BackendError::NotInitialized);
        };
        check_strict(&self.description, params)?;
        if params.async_depth.max(1) != current.async_depth.max(1) {
            return Err(BackendError::UnsupportedConfig(
                "async depth cannot change on reset".to_string(),
            ));
        }
        *current = params.clone();
        current.buffer_size_kb = buffer_size_kb(current);
        debug!(params = %current, "cpu encoder reset");
        Ok(())
    }

    fn encode_frame_async(
        &mut self,
        surface: Option<&FrameSurface<'_>>,
    ) -> Result<SubmitStatus, BackendError> {
        let (Some(params), Some(worker)) = (self.params.as_ref(), self.worker.as_ref()) else {
            return Err(BackendError::NotInitialized);
        };
        // Every submission is handed out with its sync point, so there is
        // never anything left to flush.
        let Some(surface) = surface else {
            return Ok(SubmitStatus::MoreData);
        };

        let info = surface.info();
        if info.crop_w != params.frame_info.crop_w || info.crop_h != params.frame_info.crop_h {
            return Err(BackendError::InvalidInput(format!(
                "surface {}x{} does not match encoder {}x{}",
                info.crop_w, info.crop_h, params.frame_info.crop_w, params.frame_info.crop_h
            )));
        }
        if !self.credits.try_acquire() {
            let (used, capacity) = self.credits.snapshot();
            return Err(BackendError::TemporaryBackpressure(format!(
                "{used}/{capacity} submissions awaiting sync"
            )));
        }

        let sync = SyncPoint(self.next_sync);
        let job = EncodeJob {
            sync,
            frame: Nv12Frame::from_surface(surface),
            quality: u8::try_from(params.quality.min(100)).unwrap_or(100),
            lock: surface.lock(),
        };
        if let Err(err) = worker.submit(job) {
            self.credits.release();
            return Err(err);
        }
        self.next_sync += 1;
        self.outstanding.insert(sync);
        Ok(SubmitStatus::Queued(Some(sync)))
    }

    fn sync_operation(
        &mut self,
        sync: SyncPoint,
        bitstream: &mut Bitstream,
        wait: Duration,
    ) -> Result<SyncStatus, BackendError> {
        if !self.outstanding.contains(&sync) {
            return Err(BackendError::InvalidInput(format!("unknown sync point {sync}")));
        }
        let Some(worker) = self.worker.as_mut() else {
            return Err(BackendError::NotInitialized);
        };
        let Some((result, timing)) = worker.wait_for(sync, wait)? else {
            return Ok(SyncStatus::InExecution);
        };
        let queue = worker.queue_stats();
        self.outstanding.remove(&sync);
        self.credits.release();

        if self.report_metrics {
            debug!(
                %sync,
                convert_ms = timing.convert.as_secs_f64() * 1_000.0,
                encode_ms = timing.encode.as_secs_f64() * 1_000.0,
                queue_depth = queue.depth,
                queue_peak = queue.peak_depth,
                parked = queue.parked,
                "cpu encode metrics"
            );
        }

        let payload = result?;
        bitstream.append(&payload)?;
        Ok(SyncStatus::Done)
    }

    fn close(&mut self) -> Result<(), BackendError> {
        self.worker = None;
        self.params = None;
        self.outstanding.clear();
        self.credits = InFlightCredits::new(1);
        Ok(())
    }
}
