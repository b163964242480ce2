use gpu_core::{self as gpu, Device, Handle};
use std::collections::VecDeque;
use std::sync::mpsc;

/// Future side of an asynchronous GPU readback. Fulfilled by the frame
/// graph's post-frame reaping loop once the producing submit has finished;
/// safe to observe from any thread.
pub struct AsyncDownload {
    receiver: Option<mpsc::Receiver<Vec<u8>>>,
}

impl AsyncDownload {
    pub(crate) fn new(receiver: mpsc::Receiver<Vec<u8>>) -> Self {
        Self {
            receiver: Some(receiver),
        }
    }

    pub(crate) fn invalid() -> Self {
        Self { receiver: None }
    }

    pub fn is_valid(&self) -> bool {
        self.receiver.is_some()
    }

    /// Non-blocking poll; `None` while the download is still in flight.
    pub fn try_get(&mut self) -> Option<Vec<u8>> {
        self.receiver.as_ref().and_then(|r| r.try_recv().ok())
    }

    /// Blocks until fulfilled. Returns an empty byte vector when the
    /// download failed or was never recorded.
    pub fn wait(self) -> Vec<u8> {
        match self.receiver {
            Some(receiver) => receiver.recv().unwrap_or_default(),
            None => Vec::new(),
        }
    }
}

impl Default for AsyncDownload {
    fn default() -> Self {
        Self::invalid()
    }
}

struct FrameSpan {
    submit_index: u64,
    bytes: u64,
}

/// Host-visible download ring, divided into two segments per allocation to
/// handle wrap-around. Bytes become host-readable only once the submit that
/// recorded the transfer has finished; reclamation is frame-granular.
pub struct DownloadStaging {
    buffer: Handle<gpu::Buffer>,
    size: u64,
    head: u64,
    used: u64,
    current_frame_bytes: u64,
    current_submit: u64,
    in_flight: VecDeque<FrameSpan>,
}

impl DownloadStaging {
    pub fn new(device: &dyn Device, size: u64) -> anyhow::Result<Self> {
        let buffer = device.create_buffer(&gpu::BufferDesc {
            size,
            usage: gpu::BufferUsage::TRANSFER_DESTINATION,
            memory_usage: gpu::MemoryUsage::HostVisible,
            debug_label: "download staging ring",
        })?;

        Ok(Self {
            buffer,
            size,
            head: 0,
            used: 0,
            current_frame_bytes: 0,
            current_submit: 0,
            in_flight: VecDeque::new(),
        })
    }

    pub fn begin_frame(&mut self, submit_index: u64) {
        self.current_submit = submit_index;
        self.current_frame_bytes = 0;
    }

    pub fn end_frame(&mut self) {
        if self.current_frame_bytes > 0 {
            self.in_flight.push_back(FrameSpan {
                submit_index: self.current_submit,
                bytes: self.current_frame_bytes,
            });
            self.current_frame_bytes = 0;
        }
    }

    /// Reclaims the bytes of every frame whose submit is `<= last_finished`.
    pub fn notify_finished_frames(&mut self, last_finished: u64) {
        while let Some(front) = self.in_flight.front() {
            if front.submit_index > last_finished {
                break;
            }
            self.used -= front.bytes;
            self.in_flight.pop_front();
        }
    }

    /// Fails when the oldest un-acknowledged frame still owns the target
    /// bytes.
    pub fn stage_allocate(&mut self, size: u64) -> anyhow::Result<gpu::StagingBufferSpan> {
        anyhow::ensure!(
            size <= self.size - self.used,
            "download staging exhausted: {} bytes requested, {} available",
            size,
            self.size - self.used
        );

        let first_len = (self.size - self.head).min(size);
        let second_len = size - first_len;

        let span = gpu::StagingBufferSpan {
            segments: [
                gpu::StagingSegment {
                    begin: self.head,
                    end: self.head + first_len,
                },
                gpu::StagingSegment {
                    begin: 0,
                    end: second_len,
                },
            ],
        };

        self.head = (self.head + size) % self.size;
        self.used += size;
        self.current_frame_bytes += size;

        Ok(span)
    }

    /// Records the transfer of `source` into the staged span.
    pub fn download(
        &self,
        device: &dyn Device,
        cmd: gpu::CommandBuffer,
        source: gpu::BufferRange,
        source_offset: u64,
        span: &gpu::StagingBufferSpan,
    ) {
        let mut read = 0;

        for segment in &span.segments {
            if segment.is_empty() {
                continue;
            }

            device.cmd_copy_buffer(
                cmd,
                gpu::BufferRange {
                    buffer: source.buffer,
                    offset: source.offset + source_offset + read,
                    size: segment.len(),
                },
                gpu::BufferRange {
                    buffer: self.buffer,
                    offset: segment.begin,
                    size: segment.len(),
                },
            );

            read += segment.len();
        }
    }

    pub fn invalidate_memory_ranges(&self, device: &dyn Device) -> anyhow::Result<()> {
        device.invalidate_mapped_ranges(self.buffer)
    }

    /// Host-side copy out of a completed staged span, starting `offset`
    /// bytes into the span.
    pub fn copy_from(
        &self,
        device: &dyn Device,
        destination: &mut [u8],
        span: &gpu::StagingBufferSpan,
        offset: u64,
    ) -> anyhow::Result<()> {
        anyhow::ensure!(offset + destination.len() as u64 <= span.total_size());

        let mut dst = destination;
        let mut skip = offset;

        for segment in &span.segments {
            if dst.is_empty() {
                break;
            }

            let segment_len = segment.len();
            if skip >= segment_len {
                skip -= segment_len;
                continue;
            }

            let readable = (segment_len - skip).min(dst.len() as u64) as usize;
            let (chunk, rest) = dst.split_at_mut(readable);
            device.read_buffer(self.buffer, segment.begin + skip, chunk)?;
            dst = rest;
            skip = 0;
        }

        Ok(())
    }
}

/// A download recorded during execute, waiting for its submit to finish.
pub(crate) struct PendingDownload {
    pub submit_index: u64,
    pub span: gpu::StagingBufferSpan,
    pub sender: mpsc::Sender<Vec<u8>>,
    pub receiver: Option<mpsc::Receiver<Vec<u8>>>,
}

impl PendingDownload {
    pub fn new(submit_index: u64, span: gpu::StagingBufferSpan) -> Self {
        let (sender, receiver) = mpsc::channel();
        Self {
            submit_index,
            span,
            sender,
            receiver: Some(receiver),
        }
    }

    pub fn take_future(&mut self) -> AsyncDownload {
        match self.receiver.take() {
            Some(receiver) => AsyncDownload::new(receiver),
            None => AsyncDownload::invalid(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpu_core::mock::MockDevice;

    #[test]
    fn allocation_fails_until_frames_are_acknowledged() {
        let device = MockDevice::new();
        let mut staging = DownloadStaging::new(&device, 64).unwrap();

        staging.begin_frame(1);
        staging.stage_allocate(48).unwrap();
        staging.end_frame();

        staging.begin_frame(2);
        assert!(staging.stage_allocate(32).is_err());

        staging.notify_finished_frames(1);
        let span = staging.stage_allocate(32).unwrap();
        // Wrapped: two segments.
        assert_eq!(span.segments[0].len(), 16);
        assert_eq!(span.segments[1].len(), 16);
    }

    #[test]
    fn download_round_trips_bytes() {
        let device = MockDevice::new();
        let mut staging = DownloadStaging::new(&device, 1024).unwrap();

        let source = device
            .create_buffer(&gpu::BufferDesc {
                size: 32,
                usage: gpu::BufferUsage::TRANSFER_SOURCE,
                memory_usage: gpu::MemoryUsage::HostVisible,
                debug_label: "src",
            })
            .unwrap();
        let payload: Vec<u8> = (0..32).collect();
        device.write_buffer(source, 0, &payload).unwrap();

        staging.begin_frame(1);
        let span = staging.stage_allocate(32).unwrap();
        staging.download(
            &device,
            gpu::CommandBuffer(0),
            gpu::BufferRange {
                buffer: source,
                offset: 0,
                size: 32,
            },
            0,
            &span,
        );
        staging.end_frame();

        let mut out = vec![0u8; 32];
        staging.copy_from(&device, &mut out, &span, 0).unwrap();
        assert_eq!(out, payload);
    }
}
