use std::path::PathBuf;
use std::time::Duration;
use std::{fmt, fmt::Display};

use crate::accel::AcceleratorHandle;
use crate::bitstream::Bitstream;
use crate::surface::FrameSurface;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Jpeg,
}

impl Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Jpeg => f.write_str("jpeg"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FourCc {
    Nv12,
}

impl Display for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nv12 => f.write_str("NV12"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChromaFormat {
    Yuv420,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoPattern {
    SystemMemory,
    VideoMemory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImplType {
    Software,
    Hardware,
}

impl Display for ImplType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Software => f.write_str("SW"),
            Self::Hardware => f.write_str("HW"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccelerationMode {
    Na,
    Vaapi,
}

impl Display for AccelerationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Na => f.write_str("NA"),
            Self::Vaapi => f.write_str("VAAPI"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImplementationDescription {
    pub name: String,
    pub version: &'static str,
    pub impl_type: ImplType,
    pub accel_mode: AccelerationMode,
    pub codecs: Vec<Codec>,
    pub path: Option<PathBuf>,
}

impl Display for ImplementationDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "implementation={} version={} type={} accel={} codecs=[",
            self.name, self.version, self.impl_type, self.accel_mode
        )?;
        for (i, codec) in self.codecs.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{codec}")?;
        }
        f.write_str("]")?;
        match &self.path {
            Some(path) => write!(f, " path={}", path.display()),
            None => f.write_str(" path=builtin"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRate {
    pub numerator: u32,
    pub denominator: u32,
}

impl Display for FrameRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.numerator, self.denominator)
    }
}

/// Rounds `value` up to the next multiple of 16.
#[must_use]
pub fn align16(value: u16) -> u16 {
    let aligned = (u32::from(value) + 15) & !15;
    u16::try_from(aligned).unwrap_or(u16::MAX & !15)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    pub fourcc: FourCc,
    pub chroma_format: ChromaFormat,
    pub frame_rate: FrameRate,
    pub crop_x: u16,
    pub crop_y: u16,
    pub crop_w: u16,
    pub crop_h: u16,
    /// Allocation width; a multiple of 16 covering `crop_w`.
    pub width: u16,
    /// Allocation height; a multiple of 16 covering `crop_h`.
    pub height: u16,
}

impl FrameInfo {
    #[must_use]
    pub fn nv12(width: u16, height: u16, frame_rate: u32) -> Self {
        let mut info = Self {
            fourcc: FourCc::Nv12,
            chroma_format: ChromaFormat::Yuv420,
            frame_rate: FrameRate {
                numerator: frame_rate,
                denominator: 1,
            },
            crop_x: 0,
            crop_y: 0,
            crop_w: 0,
            crop_h: 0,
            width: 0,
            height: 0,
        };
        info.set_crop(width, height);
        info
    }

    pub fn set_crop(&mut self, width: u16, height: u16) {
        self.crop_w = width;
        self.crop_h = height;
        self.width = align16(width);
        self.height = align16(height);
    }

    #[must_use]
    pub fn pitch(&self) -> usize {
        usize::from(self.width)
    }

    /// Bytes one surface of this geometry occupies (luma plane plus interleaved chroma).
    #[must_use]
    pub fn surface_size(&self) -> usize {
        let luma = self.pitch() * usize::from(self.height);
        luma + luma / 2
    }

    /// Bytes of one tightly packed NV12 frame of the crop size, as stored in raw input files.
    #[must_use]
    pub fn raw_frame_size(&self) -> usize {
        let width = usize::from(self.crop_w);
        let height = usize::from(self.crop_h);
        width * height + chroma_row_bytes(width) * height.div_ceil(2)
    }
}

impl Display for FrameInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}x{} (alloc {}x{}) @ {}fps",
            self.fourcc, self.crop_w, self.crop_h, self.width, self.height, self.frame_rate
        )
    }
}

/// Bytes in one interleaved UV row for a frame `width` pixels wide.
#[must_use]
pub fn chroma_row_bytes(width: usize) -> usize {
    (width + 1) & !1
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodeParams {
    pub codec: Codec,
    pub frame_info: FrameInfo,
    pub interleaved: bool,
    pub quality: u16,
    pub restart_interval: u16,
    pub io_pattern: IoPattern,
    pub async_depth: u16,
    /// Worst-case size of one encoded frame, reported by the runtime.
    pub buffer_size_kb: u32,
}

impl EncodeParams {
    #[must_use]
    pub fn jpeg(width: u16, height: u16, frame_rate: u32, quality: u16) -> Self {
        Self {
            codec: Codec::Jpeg,
            frame_info: FrameInfo::nv12(width, height, frame_rate),
            interleaved: true,
            quality,
            restart_interval: 0,
            io_pattern: IoPattern::SystemMemory,
            async_depth: 1,
            buffer_size_kb: 0,
        }
    }

    pub fn set_resolution(&mut self, width: u16, height: u16) {
        self.frame_info.set_crop(width, height);
    }
}

impl Display for EncodeParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "EncodeParams(codec={}, frame={}, quality={}, interleaved={}, async_depth={})",
            self.codec, self.frame_info, self.quality, self.interleaved, self.async_depth
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameAllocRequest {
    pub num_frame_min: u16,
    pub num_frame_suggested: u16,
    pub info: FrameInfo,
}

/// Opaque token identifying one submission until it is synchronized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SyncPoint(pub(crate) u64);

impl SyncPoint {
    #[must_use]
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl Display for SyncPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sync#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryOutcome {
    Exact,
    /// Some fields were unsupported and have been replaced by the closest match.
    Adjusted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitStatus {
    Queued(Option<SyncPoint>),
    MoreData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Done,
    InExecution,
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("unsupported codec: {0}")]
    UnsupportedCodec(Codec),
    #[error("unsupported config: {0}")]
    UnsupportedConfig(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("encoder is not initialized")]
    NotInitialized,
    #[error("bitstream buffer too small: need {needed} bytes, have {available}")]
    NotEnoughBuffer { needed: usize, available: usize },
    #[error("temporary backpressure: {0}")]
    TemporaryBackpressure(String),
    #[error("device lost: {0}")]
    DeviceLost(String),
    #[error("backend error: {0}")]
    Backend(String),
}

pub trait VideoEncoder {
    fn implementation(&self) -> &ImplementationDescription;

    fn set_accelerator_handle(&mut self, _handle: &AcceleratorHandle) -> Result<(), BackendError> {
        Err(BackendError::UnsupportedConfig(
            "accelerator handles are not used by this implementation".to_string(),
        ))
    }

    /// Checks `params`, rewriting unsupported fields in place.
    fn query(&self, params: &mut EncodeParams) -> Result<QueryOutcome, BackendError>;

    fn init(&mut self, params: &EncodeParams) -> Result<(), BackendError>;

    fn query_io_surf(&self, params: &EncodeParams) -> Result<FrameAllocRequest, BackendError>;

    fn get_video_param(&self) -> Result<EncodeParams, BackendError>;

    fn reset(&mut self, params: &EncodeParams) -> Result<(), BackendError>;

    /// `None` asks the encoder to flush buffered work.
    fn encode_frame_async(
        &mut self,
        surface: Option<&FrameSurface<'_>>,
    ) -> Result<SubmitStatus, BackendError>;

    fn sync_operation(
        &mut self,
        sync: SyncPoint,
        bitstream: &mut Bitstream,
        wait: Duration,
    ) -> Result<SyncStatus, BackendError>;

    fn close(&mut self) -> Result<(), BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align16_rounds_up() {
        assert_eq!(align16(0), 0);
        assert_eq!(align16(1), 16);
        assert_eq!(align16(240), 240);
        assert_eq!(align16(241), 256);
        assert_eq!(align16(u16::MAX), u16::MAX & !15);
    }

    #[test]
    fn set_resolution_updates_crop_and_alignment() {
        let mut params = EncodeParams::jpeg(320, 240, 25, 90);
        params.set_resolution(650, 481);
        assert_eq!(params.frame_info.crop_w, 650);
        assert_eq!(params.frame_info.crop_h, 481);
        assert_eq!(params.frame_info.width, 656);
        assert_eq!(params.frame_info.height, 496);
    }

    #[test]
    fn raw_frame_size_matches_nv12_layout() {
        let info = FrameInfo::nv12(320, 240, 25);
        assert_eq!(info.raw_frame_size(), 320 * 240 * 3 / 2);
        let odd = FrameInfo::nv12(5, 3, 25);
        assert_eq!(odd.raw_frame_size(), 15 + 6 * 2);
    }

    #[test]
    fn implementation_description_is_printable() {
        let description = ImplementationDescription {
            name: "cpu".to_string(),
            version: "0.1.0",
            impl_type: ImplType::Software,
            accel_mode: AccelerationMode::Na,
            codecs: vec![Codec::Jpeg],
            path: None,
        };
        assert_eq!(
            description.to_string(),
            "implementation=cpu version=0.1.0 type=SW accel=NA codecs=[jpeg] path=builtin"
        );
    }
}
