use std::time::Duration;

use tracing::{debug, info};

mod accel;
mod bitstream;
mod contract;
mod cpu_backend;
pub mod driver;
mod pipeline;
mod surface;
mod transform;

pub use accel::{AcceleratorHandle, DEFAULT_RENDER_NODE};
pub use bitstream::{Bitstream, DEFAULT_BITSTREAM_CAPACITY};
pub use contract::{
    AccelerationMode, BackendError, ChromaFormat, Codec, EncodeParams, FourCc, FrameAllocRequest,
    FrameInfo, FrameRate, ImplType, ImplementationDescription, IoPattern, QueryOutcome,
    SubmitStatus, SyncPoint, SyncStatus, VideoEncoder, align16, chroma_row_bytes,
};
pub use cpu_backend::{
    CPU_IMPLEMENTATION_NAME, CpuEncoderAdapter, CpuEncoderOptions, cpu_implementation,
    encode_nv12_to_jpeg,
};
pub use surface::{FrameSurface, SurfaceLock, SurfaceLockGuard, SurfacePool};
pub use transform::{Nv12Frame, Nv12Planes, nv12_test_pattern, nv12_to_rgb_image};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    #[default]
    Auto,
    Software,
    Hardware,
}

impl BackendKind {
    fn accepts(self, impl_type: ImplType) -> bool {
        match self {
            BackendKind::Auto => true,
            BackendKind::Software => impl_type == ImplType::Software,
            BackendKind::Hardware => impl_type == ImplType::Hardware,
        }
    }
}

pub type Backend = BackendKind;

/// Implementations compiled into this build, in discovery order.
#[must_use]
pub fn available_implementations() -> Vec<ImplementationDescription> {
    vec![cpu_implementation()]
}

fn preferred_impl_order() -> [ImplType; 2] {
    [ImplType::Hardware, ImplType::Software]
}

fn resolve_implementation(
    requested: BackendKind,
    codec: Codec,
) -> Result<ImplementationDescription, BackendError> {
    let available = available_implementations();
    for impl_type in preferred_impl_order() {
        if !requested.accepts(impl_type) {
            continue;
        }
        if let Some(found) = available
            .iter()
            .find(|desc| desc.impl_type == impl_type && desc.codecs.contains(&codec))
        {
            return Ok(found.clone());
        }
    }
    let detail = available
        .iter()
        .map(|desc| format!("{} ({})", desc.name, desc.impl_type))
        .collect::<Vec<_>>()
        .join("; ");
    Err(BackendError::UnsupportedConfig(format!(
        "no implementations meet selection criteria (backend={requested:?}, codec={codec}); available: {detail}"
    )))
}

fn build_encoder_inner(
    description: &ImplementationDescription,
) -> Result<Box<dyn VideoEncoder>, BackendError> {
    match description.impl_type {
        ImplType::Software => Ok(Box::new(CpuEncoderAdapter::new())),
        ImplType::Hardware => Err(BackendError::UnsupportedConfig(format!(
            "no runtime is bundled for hardware implementation {}",
            description.name
        ))),
    }
}

/// An encode session bound to one implementation.
///
/// The underlying runtime is closed exactly once, either through
/// [`EncodeSession::close`] or when the session is dropped.
pub struct EncodeSession {
    encoder_inner: Box<dyn VideoEncoder>,
    closed: bool,
}

impl EncodeSession {
    /// Selects an implementation for `codec` and opens a session on it.
    pub fn new(backend: Backend, codec: Codec) -> Result<Self, BackendError> {
        let selected = resolve_implementation(backend, codec)?;
        info!(%selected, "implementation selected");
        Ok(Self::from_encoder(build_encoder_inner(&selected)?))
    }

    pub fn from_encoder(encoder_inner: Box<dyn VideoEncoder>) -> Self {
        Self {
            encoder_inner,
            closed: false,
        }
    }

    pub fn implementation(&self) -> &ImplementationDescription {
        self.encoder_inner.implementation()
    }

    pub fn set_accelerator_handle(&mut self, handle: &AcceleratorHandle) -> Result<(), BackendError> {
        self.encoder_inner.set_accelerator_handle(handle)
    }

    pub fn query(&self, params: &mut EncodeParams) -> Result<QueryOutcome, BackendError> {
        let outcome = self.encoder_inner.query(params)?;
        if outcome == QueryOutcome::Adjusted {
            debug!(%params, "encode parameters adjusted by implementation");
        }
        Ok(outcome)
    }

    pub fn init(&mut self, params: &EncodeParams) -> Result<(), BackendError> {
        self.encoder_inner.init(params)
    }

    pub fn query_io_surf(&self, params: &EncodeParams) -> Result<FrameAllocRequest, BackendError> {
        self.encoder_inner.query_io_surf(params)
    }

    pub fn get_video_param(&self) -> Result<EncodeParams, BackendError> {
        self.encoder_inner.get_video_param()
    }

    pub fn reset(&mut self, params: &EncodeParams) -> Result<(), BackendError> {
        self.encoder_inner.reset(params)
    }

    pub fn encode_frame_async(
        &mut self,
        surface: Option<&FrameSurface<'_>>,
    ) -> Result<SubmitStatus, BackendError> {
        self.encoder_inner.encode_frame_async(surface)
    }

    pub fn sync_operation(
        &mut self,
        sync: SyncPoint,
        bitstream: &mut Bitstream,
        wait: Duration,
    ) -> Result<SyncStatus, BackendError> {
        self.encoder_inner.sync_operation(sync, bitstream, wait)
    }

    pub fn close(&mut self) -> Result<(), BackendError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.encoder_inner.close()
    }
}

impl Drop for EncodeSession {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            debug!(%err, "encode session close failed during drop");
        }
    }
}
