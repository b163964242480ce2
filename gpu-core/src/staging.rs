use crate::device::Device;
use crate::handles::Handle;
use crate::types::*;
use anyhow::ensure;

/// Host-visible upload ring. Stages bytes on the host side and records
/// transfer commands from the ring into destination buffers or images.
///
/// Allocations wrap around the ring; a span can therefore cover up to two
/// segments. Staged data is valid until the end of the current frame, the
/// whole ring is reclaimed every frame by `restore_all`.
pub struct StagingBuffer {
    buffer: Handle<Buffer>,
    size: u64,
    head: u64,
    used: u64,
}

impl StagingBuffer {
    pub fn new(device: &dyn Device, size: u64) -> anyhow::Result<Self> {
        let buffer = device.create_buffer(&BufferDesc {
            size,
            usage: BufferUsage::TRANSFER_SOURCE,
            memory_usage: MemoryUsage::HostVisible,
            debug_label: "upload staging ring",
        })?;

        Ok(Self {
            buffer,
            size,
            head: 0,
            used: 0,
        })
    }

    pub fn buffer(&self) -> Handle<Buffer> {
        self.buffer
    }

    /// Reserves space without writing; the caller fills it through
    /// [`StagingBuffer::copy_to`].
    pub fn stage_allocate(&mut self, device: &dyn Device, size: u64) -> anyhow::Result<StagingBufferSpan> {
        let _ = device;
        ensure!(size <= self.size - self.used, "out of staging memory");

        let first_len = (self.size - self.head).min(size);
        let second_len = size - first_len;

        let span = StagingBufferSpan {
            segments: [
                StagingSegment {
                    begin: self.head,
                    end: self.head + first_len,
                },
                StagingSegment {
                    begin: 0,
                    end: second_len,
                },
            ],
        };

        self.head = (self.head + size) % self.size;
        self.used += size;

        Ok(span)
    }

    /// Stages `data` into the ring and returns the span it landed in.
    pub fn stage(&mut self, device: &dyn Device, data: &[u8]) -> anyhow::Result<StagingBufferSpan> {
        let span = self.stage_allocate(device, data.len() as u64)?;
        self.copy_to(device, &span, 0, data)?;
        Ok(span)
    }

    /// Stages image data; the first segment is aligned so no texel straddles
    /// the wrap-around point.
    pub fn stage_image(
        &mut self,
        device: &dyn Device,
        data: &[u8],
        texel_size: u32,
    ) -> anyhow::Result<StagingBufferSpan> {
        let size = data.len() as u64;
        ensure!(texel_size > 0 && size % u64::from(texel_size) == 0);

        let remaining = self.size - self.head;
        let misalignment = remaining % u64::from(texel_size);

        if misalignment != 0 && size > remaining {
            // Waste the tail so the split happens on a texel boundary.
            ensure!(misalignment <= self.size - self.used, "out of staging memory");
            self.head = (self.head + misalignment) % self.size;
            self.used += misalignment;
        }

        let span = self.stage_allocate(device, size)?;
        self.copy_to(device, &span, 0, data)?;
        Ok(span)
    }

    /// Host-side copy of caller bytes into an already staged span, starting
    /// `offset` bytes into the span.
    pub fn copy_to(
        &self,
        device: &dyn Device,
        span: &StagingBufferSpan,
        offset: u64,
        data: &[u8],
    ) -> anyhow::Result<()> {
        ensure!(offset + data.len() as u64 <= span.total_size());

        let mut src = data;
        let mut skip = offset;

        for segment in &span.segments {
            if src.is_empty() {
                break;
            }

            let segment_len = segment.len();

            if skip >= segment_len {
                skip -= segment_len;
                continue;
            }

            let writable = (segment_len - skip).min(src.len() as u64) as usize;
            device.write_buffer(self.buffer, segment.begin + skip, &src[..writable])?;
            src = &src[writable..];
            skip = 0;
        }

        Ok(())
    }

    /// Records the transfer of a staged span into `dst_buffer` at
    /// `dst_offset`.
    pub fn upload(
        &self,
        device: &dyn Device,
        cmd: CommandBuffer,
        span: &StagingBufferSpan,
        dst_buffer: Handle<Buffer>,
        dst_offset: u64,
    ) {
        let mut written = 0;

        for segment in &span.segments {
            if segment.is_empty() {
                continue;
            }

            device.cmd_copy_buffer(
                cmd,
                BufferRange {
                    buffer: self.buffer,
                    offset: segment.begin,
                    size: segment.len(),
                },
                BufferRange {
                    buffer: dst_buffer,
                    offset: dst_offset + written,
                    size: segment.len(),
                },
            );

            written += segment.len();
        }
    }

    /// Records the transfer of staged texel data into a whole image.
    pub fn upload_image(
        &self,
        device: &dyn Device,
        cmd: CommandBuffer,
        span: &StagingBufferSpan,
        dst: Handle<Image>,
    ) {
        for segment in &span.segments {
            if !segment.is_empty() {
                device.cmd_copy_buffer_to_image(cmd, self.buffer, segment.begin, dst);
            }
        }
    }

    /// Reclaims the whole ring; staged spans from earlier frames become
    /// invalid.
    pub fn restore_all(&mut self) {
        self.head = 0;
        self.used = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockDevice;

    #[test]
    fn wrap_around_produces_two_segments() {
        let device = MockDevice::new();
        let mut staging = StagingBuffer::new(&device, 64).unwrap();

        staging.stage(&device, &[0u8; 48]).unwrap();
        let span = staging.stage(&device, &[7u8; 32]).unwrap();

        assert_eq!(span.segments[0], StagingSegment { begin: 48, end: 64 });
        assert_eq!(span.segments[1], StagingSegment { begin: 0, end: 16 });
        assert_eq!(span.total_size(), 32);
    }

    #[test]
    fn exhaustion_is_an_error() {
        let device = MockDevice::new();
        let mut staging = StagingBuffer::new(&device, 16).unwrap();

        staging.stage(&device, &[0u8; 12]).unwrap();
        assert!(staging.stage(&device, &[0u8; 8]).is_err());

        staging.restore_all();
        assert!(staging.stage(&device, &[0u8; 16]).is_ok());
    }

    #[test]
    fn staged_bytes_land_in_ring_memory() {
        let device = MockDevice::new();
        let mut staging = StagingBuffer::new(&device, 32).unwrap();

        let span = staging.stage(&device, &[1, 2, 3, 4]).unwrap();

        let mut readback = [0u8; 4];
        device
            .read_buffer(staging.buffer(), span.segments[0].begin, &mut readback)
            .unwrap();
        assert_eq!(readback, [1, 2, 3, 4]);
    }
}
