//! Encode loop that drives one session from a raw NV12 file to numbered JPEG
//! files.
//!
//! Everything the loop touches lives in [`EncodeContext`]; its fields are
//! declared in release order, so every exit path tears down the session
//! before the buffers it may still reference.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use std::{fmt, fmt::Display};

use tracing::{debug, error, info, trace, warn};

use crate::{
    AcceleratorHandle, Backend, BackendError, BackendKind, Bitstream, Codec,
    DEFAULT_BITSTREAM_CAPACITY, EncodeParams, EncodeSession, FrameAllocRequest, FrameInfo,
    QueryOutcome, SubmitStatus, SurfacePool, SyncPoint, SyncStatus,
};

pub const DEFAULT_FRAME_RATE: u32 = 25;
pub const DEFAULT_QUALITY: u16 = 90;
pub const DEFAULT_MAX_FRAMES: u32 = 3;

#[must_use]
pub fn output_file_name(index: u32) -> String {
    format!("frame{index}.jpg")
}

/// Bounded polling used while a submission is still executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncPolicy {
    pub wait: Duration,
    pub max_attempts: u32,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            wait: Duration::from_millis(100),
            max_attempts: 50,
        }
    }
}

/// Switches geometry (and optionally the input) once `after_frames` frames
/// have been written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolutionChange {
    pub after_frames: u32,
    pub width: u16,
    pub height: u16,
    pub input: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct EncodeOptions {
    pub input: PathBuf,
    pub width: u16,
    pub height: u16,
    pub frame_rate: u32,
    pub quality: u16,
    pub output_dir: PathBuf,
    pub backend: Backend,
    pub bitstream_capacity: usize,
    /// Stop after this many written frames; `None` runs until the input drains.
    pub max_frames: Option<u32>,
    pub resolution_change: Option<ResolutionChange>,
    pub sync: SyncPolicy,
}

impl EncodeOptions {
    #[must_use]
    pub fn new(input: impl Into<PathBuf>, width: u16, height: u16) -> Self {
        Self {
            input: input.into(),
            width,
            height,
            frame_rate: DEFAULT_FRAME_RATE,
            quality: DEFAULT_QUALITY,
            output_dir: PathBuf::from("."),
            backend: BackendKind::Auto,
            bitstream_capacity: DEFAULT_BITSTREAM_CAPACITY,
            max_frames: Some(DEFAULT_MAX_FRAMES),
            resolution_change: None,
            sync: SyncPolicy::default(),
        }
    }
}

impl Display for EncodeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "EncodeOptions(input={}, size={}x{}, fps={}, quality={}, backend={:?}, max_frames={:?})",
            self.input.display(),
            self.width,
            self.height,
            self.frame_rate,
            self.quality,
            self.backend,
            self.max_frames
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The input ended and the runtime had nothing left to flush.
    Drained,
    FrameLimit,
    /// The runtime returned a status the loop has no policy for.
    UnknownStatus,
    /// Flushing after the end of input made no progress for
    /// `SyncPolicy::max_attempts` submissions in a row.
    FlushStalled,
}

#[derive(Debug, Clone)]
pub struct EncodeSummary {
    pub frames_written: u32,
    pub outputs: Vec<PathBuf>,
    pub stop_reason: StopReason,
    pub frame_info: FrameInfo,
    pub surface_pool_size: usize,
    pub resets: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
    #[error("{context}: {source}")]
    Backend {
        context: &'static str,
        #[source]
        source: BackendError,
    },
    #[error("no free surface in a pool of {pool_size}")]
    NoFreeSurface { pool_size: usize },
    #[error("{sync} still executing after {attempts} sync attempts")]
    SyncTimeout { sync: SyncPoint, attempts: u32 },
    #[error("the reset procedure failed for {width}x{height}")]
    ResetFailed { width: u16, height: u16 },
}

fn backend_err(context: &'static str) -> impl FnOnce(BackendError) -> DriverError {
    move |source| DriverError::Backend { context, source }
}

fn open_source(path: &Path) -> Result<Box<dyn Read>, DriverError> {
    let file = File::open(path).map_err(|source| DriverError::Io {
        context: format!("could not open input file {}", path.display()),
        source,
    })?;
    Ok(Box::new(BufReader::new(file)))
}

/// Opens the input, selects an implementation and runs the encode loop.
pub fn run(options: &EncodeOptions) -> Result<EncodeSummary, DriverError> {
    let source = open_source(&options.input)?;
    let session = EncodeSession::new(options.backend, Codec::Jpeg)
        .map_err(backend_err("cannot create session"))?;
    run_with_session(session, source, options)
}

/// Runs the encode loop on an already created session.
pub fn run_with_session(
    session: EncodeSession,
    source: Box<dyn Read>,
    options: &EncodeOptions,
) -> Result<EncodeSummary, DriverError> {
    let mut context = EncodeContext::new(session, source, options)?;
    let stop_reason = context.run_loop()?;
    context.finish(stop_reason)
}

/// Applies a new crop size to `params` and resets the encoder with it.
///
/// Failures are logged and reported as `false`; cleanup is up to the caller.
pub fn reset_for_new_resolution(
    session: &mut EncodeSession,
    params: &mut EncodeParams,
    width: u16,
    height: u16,
) -> bool {
    params.set_resolution(width, height);

    match session.get_video_param() {
        Ok(current) => debug!(%current, "parameters selected by encoder before reset"),
        Err(err) => {
            error!(%err, "get parameter failed");
            return false;
        }
    }

    let tick = Instant::now();
    if let Err(err) = session.reset(params) {
        error!(%err, "encode reset failed");
        return false;
    }
    info!(
        "reset time: {:.3}ms",
        tick.elapsed().as_secs_f64() * 1_000.0
    );
    true
}

pub struct EncodeContext {
    session: EncodeSession,
    bitstream: Bitstream,
    pool: SurfacePool,
    source: Box<dyn Read>,
    accel: Option<AcceleratorHandle>,
    params: EncodeParams,
    request: FrameAllocRequest,
    options: EncodeOptions,
    frames_written: u32,
    outputs: Vec<PathBuf>,
    resets: u32,
}

impl EncodeContext {
    pub fn new(
        mut session: EncodeSession,
        source: Box<dyn Read>,
        options: &EncodeOptions,
    ) -> Result<Self, DriverError> {
        info!(implementation = %session.implementation(), "implementation details");

        let accel = AcceleratorHandle::open(session.implementation().accel_mode)
            .map_err(backend_err("failed to initialize accelerator"))?;
        if let Some(handle) = &accel {
            session
                .set_accelerator_handle(handle)
                .map_err(backend_err("failed to set accelerator handle"))?;
        }

        let mut params = EncodeParams::jpeg(
            options.width,
            options.height,
            options.frame_rate,
            options.quality,
        );
        if session
            .query(&mut params)
            .map_err(backend_err("encode query failed"))?
            == QueryOutcome::Adjusted
        {
            info!(%params, "incompatible parameters replaced by closest supported match");
        }

        let tick = Instant::now();
        session
            .init(&params)
            .map_err(backend_err("encode init failed"))?;
        info!(
            "initialization time: {:.3}ms",
            tick.elapsed().as_secs_f64() * 1_000.0
        );

        let request = session
            .query_io_surf(&params)
            .map_err(backend_err("query io surf failed"))?;
        let bitstream = Bitstream::with_capacity(options.bitstream_capacity);
        let pool = SurfacePool::allocate(params.frame_info, request.num_frame_suggested);
        debug!(
            surfaces = pool.len(),
            minimum = request.num_frame_min,
            bitstream_capacity = bitstream.max_length(),
            "buffers allocated"
        );

        Ok(Self {
            session,
            bitstream,
            pool,
            source,
            accel,
            params,
            request,
            options: options.clone(),
            frames_written: 0,
            outputs: Vec::new(),
            resets: 0,
        })
    }

    pub fn frames_written(&self) -> u32 {
        self.frames_written
    }

    pub fn params(&self) -> &EncodeParams {
        &self.params
    }

    pub fn run_loop(&mut self) -> Result<StopReason, DriverError> {
        let mut draining = false;
        let mut stalled_flushes = 0_u32;
        loop {
            let submitted = if draining {
                self.session.encode_frame_async(None)
            } else {
                let pool_size = self.pool.len();
                let mut surface = self
                    .pool
                    .find_free()
                    .and_then(|index| self.pool.surface_mut(index))
                    .ok_or(DriverError::NoFreeSurface { pool_size })?;
                let have_frame =
                    surface
                        .read_raw_frame(&mut self.source)
                        .map_err(|source| DriverError::Io {
                            context: "failed to read input frame".to_string(),
                            source,
                        })?;
                if have_frame {
                    self.session.encode_frame_async(Some(&surface))
                } else {
                    debug!("end of input, draining");
                    draining = true;
                    self.session.encode_frame_async(None)
                }
            };

            let stalled = match submitted {
                Ok(SubmitStatus::Queued(Some(sync))) => {
                    if let Some(reason) = self.complete(sync)? {
                        return Ok(reason);
                    }
                    false
                }
                Ok(SubmitStatus::Queued(None)) => true,
                Ok(SubmitStatus::MoreData) => {
                    if draining {
                        return Ok(StopReason::Drained);
                    }
                    false
                }
                Err(BackendError::NotEnoughBuffer { needed, available }) => {
                    warn!(needed, available, "output buffer too small, frame dropped");
                    true
                }
                Err(BackendError::DeviceLost(detail)) => {
                    warn!(%detail, "device lost, session needs cleanup");
                    true
                }
                Err(BackendError::TemporaryBackpressure(detail)) => {
                    warn!(%detail, "device busy, submission should back off");
                    true
                }
                Err(err) => {
                    error!(%err, "unknown status");
                    return Ok(StopReason::UnknownStatus);
                }
            };

            if draining {
                stalled_flushes = if stalled { stalled_flushes + 1 } else { 0 };
                if stalled_flushes >= self.options.sync.max_attempts.max(1) {
                    warn!(stalled_flushes, "flush makes no progress, giving up on draining");
                    return Ok(StopReason::FlushStalled);
                }
            }
        }
    }

    fn complete(&mut self, sync: SyncPoint) -> Result<Option<StopReason>, DriverError> {
        if !self.synchronize(sync)? {
            return Ok(None);
        }
        self.write_output()?;

        if let Some(change) = self.options.resolution_change.clone() {
            if change.after_frames == self.frames_written {
                self.apply_resolution_change(&change)?;
            }
        }
        if self
            .options
            .max_frames
            .is_some_and(|limit| self.frames_written >= limit)
        {
            return Ok(Some(StopReason::FrameLimit));
        }
        Ok(None)
    }

    /// Polls `sync` until it completes; `false` means the frame was dropped.
    fn synchronize(&mut self, sync: SyncPoint) -> Result<bool, DriverError> {
        let policy = self.options.sync;
        let attempts = policy.max_attempts.max(1);
        for attempt in 1..=attempts {
            match self
                .session
                .sync_operation(sync, &mut self.bitstream, policy.wait)
            {
                Ok(SyncStatus::Done) => return Ok(true),
                Ok(SyncStatus::InExecution) => trace!(%sync, attempt, "still executing"),
                Err(BackendError::NotEnoughBuffer { needed, available }) => {
                    warn!(%sync, needed, available, "encoded frame exceeds output buffer, dropped");
                    self.bitstream.clear();
                    return Ok(false);
                }
                Err(source) => {
                    return Err(DriverError::Backend {
                        context: "sync operation failed",
                        source,
                    });
                }
            }
        }
        Err(DriverError::SyncTimeout { sync, attempts })
    }

    fn write_output(&mut self) -> Result<(), DriverError> {
        let path = self
            .options
            .output_dir
            .join(output_file_name(self.frames_written + 1));
        let io_err = |context: &str, path: &Path| {
            let context = format!("{context} {}", path.display());
            move |source| DriverError::Io { context, source }
        };
        let mut sink = File::create(&path).map_err(io_err("could not create output file", &path))?;
        let bytes = self
            .bitstream
            .write_to(&mut sink)
            .map_err(io_err("could not write output file", &path))?;
        self.frames_written += 1;
        debug!(path = %path.display(), bytes, frame = self.frames_written, "frame written");
        self.outputs.push(path);
        Ok(())
    }

    fn apply_resolution_change(&mut self, change: &ResolutionChange) -> Result<(), DriverError> {
        if let Some(input) = &change.input {
            self.source = open_source(input)?;
        }
        if !reset_for_new_resolution(
            &mut self.session,
            &mut self.params,
            change.width,
            change.height,
        ) {
            return Err(DriverError::ResetFailed {
                width: change.width,
                height: change.height,
            });
        }
        self.request = self
            .session
            .query_io_surf(&self.params)
            .map_err(backend_err("query io surf failed"))?;
        self.pool = SurfacePool::allocate(self.params.frame_info, self.request.num_frame_suggested);
        self.resets += 1;
        info!(
            frame = %self.params.frame_info,
            surfaces = self.pool.len(),
            "surface pool reallocated after reset"
        );
        Ok(())
    }

    pub fn finish(mut self, stop_reason: StopReason) -> Result<EncodeSummary, DriverError> {
        info!(?stop_reason, "Encoded {} frames", self.frames_written);
        self.session
            .close()
            .map_err(backend_err("encode close failed"))?;
        if let Some(handle) = &self.accel {
            debug!(path = %handle.path().display(), "releasing accelerator handle");
        }
        Ok(EncodeSummary {
            frames_written: self.frames_written,
            outputs: std::mem::take(&mut self.outputs),
            stop_reason,
            frame_info: self.params.frame_info,
            surface_pool_size: self.pool.len(),
            resets: self.resets,
        })
    }
}
