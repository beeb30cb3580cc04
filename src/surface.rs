use std::io::{self, Read};
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};

use crate::contract::{FrameInfo, chroma_row_bytes};
use crate::transform::Nv12Planes;

/// Lock counter shared between the application and the runtime.
///
/// A surface with a non-zero count is still referenced by a submission and
/// must not be refilled.
#[derive(Debug, Clone, Default)]
pub struct SurfaceLock(Arc<AtomicU16>);

impl SurfaceLock {
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.0.load(Ordering::Acquire) > 0
    }

    #[must_use]
    pub fn acquire(&self) -> SurfaceLockGuard {
        self.0.fetch_add(1, Ordering::AcqRel);
        SurfaceLockGuard(Arc::clone(&self.0))
    }
}

/// Releases one lock reference when dropped. Runtimes keep this alive until
/// the submission that took it has completed.
#[derive(Debug)]
pub struct SurfaceLockGuard(Arc<AtomicU16>);

impl Drop for SurfaceLockGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

#[derive(Debug)]
struct SurfaceSlot {
    offset: usize,
    lock: SurfaceLock,
}

/// Externally allocated system-memory surfaces sharing one pixel buffer.
#[derive(Debug)]
pub struct SurfacePool {
    info: FrameInfo,
    surface_size: usize,
    buffer: Vec<u8>,
    slots: Vec<SurfaceSlot>,
}

impl SurfacePool {
    #[must_use]
    pub fn allocate(info: FrameInfo, count: u16) -> Self {
        let surface_size = info.surface_size();
        let count = usize::from(count);
        let slots = (0..count)
            .map(|index| SurfaceSlot {
                offset: index * surface_size,
                lock: SurfaceLock::default(),
            })
            .collect();
        Self {
            info,
            surface_size,
            buffer: vec![0_u8; surface_size * count],
            slots,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    #[must_use]
    pub fn info(&self) -> &FrameInfo {
        &self.info
    }

    /// First surface the runtime does not hold a lock on.
    #[must_use]
    pub fn find_free(&self) -> Option<usize> {
        self.slots.iter().position(|slot| !slot.lock.is_locked())
    }

    #[must_use]
    pub fn is_locked(&self, index: usize) -> bool {
        self.slots
            .get(index)
            .is_some_and(|slot| slot.lock.is_locked())
    }

    pub fn surface_mut(&mut self, index: usize) -> Option<FrameSurface<'_>> {
        let slot = self.slots.get(index)?;
        let start = slot.offset;
        Some(FrameSurface {
            info: self.info,
            data: &mut self.buffer[start..start + self.surface_size],
            lock: &slot.lock,
        })
    }
}

/// One frame of the pool: geometry, backing memory, and its lock.
#[derive(Debug)]
pub struct FrameSurface<'a> {
    info: FrameInfo,
    data: &'a mut [u8],
    lock: &'a SurfaceLock,
}

impl FrameSurface<'_> {
    #[must_use]
    pub fn info(&self) -> &FrameInfo {
        &self.info
    }

    #[must_use]
    pub fn pitch(&self) -> usize {
        self.info.pitch()
    }

    #[must_use]
    pub fn data(&self) -> &[u8] {
        self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        self.data
    }

    /// Offset of the interleaved UV plane inside [`Self::data`].
    #[must_use]
    pub fn chroma_offset(&self) -> usize {
        self.pitch() * usize::from(self.info.height)
    }

    /// Crop-sized view of both planes at the surface pitch.
    #[must_use]
    pub fn planes(&self) -> Nv12Planes<'_> {
        let (luma, chroma) = self.data.split_at(self.chroma_offset());
        Nv12Planes {
            width: usize::from(self.info.crop_w),
            height: usize::from(self.info.crop_h),
            pitch: self.pitch(),
            luma,
            chroma,
        }
    }

    #[must_use]
    pub fn lock(&self) -> SurfaceLockGuard {
        self.lock.acquire()
    }

    /// Fills the surface with one tightly packed NV12 frame of the crop size.
    ///
    /// Returns `Ok(false)` when the source ends before a whole frame is
    /// available; a partial frame is never reported as read.
    pub fn read_raw_frame<R: Read>(&mut self, source: &mut R) -> io::Result<bool> {
        let width = usize::from(self.info.crop_w);
        let height = usize::from(self.info.crop_h);
        let pitch = self.pitch();
        let chroma_offset = self.chroma_offset();
        let uv_bytes = chroma_row_bytes(width);

        for row in 0..height {
            let start = row * pitch;
            if !read_full(source, &mut self.data[start..start + width])? {
                return Ok(false);
            }
        }
        for row in 0..height.div_ceil(2) {
            let start = chroma_offset + row * pitch;
            if !read_full(source, &mut self.data[start..start + uv_bytes])? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

fn read_full<R: Read>(source: &mut R, buf: &mut [u8]) -> io::Result<bool> {
    match source.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(err) => Err(err),
    }
}
