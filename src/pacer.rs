// Frame pacing
//
// Per logical frame:
//   wait fence(slot) → acquire → record-or-reuse → submit → present
//   → slot = (slot + 1) % frames_in_flight
//
// The fence wait is the only point where the CPU blocks on the GPU.
// Everything that touches Vulkan sits behind `FrameBackend`, so the state
// machine here can be driven by a scripted backend in tests.

use crate::backend::swapchain::{Acquire, Present, SurfaceStatus};
use crate::error::{GpuError, Result};

/// The GPU side of a frame, as seen by the pacer.
pub trait FrameBackend {
    /// Number of presentable images currently alive.
    fn image_count(&self) -> usize;

    /// Re-query the surface. Called once per frame before anything else.
    fn poll_surface(&mut self) -> Result<SurfaceStatus>;

    /// Wait idle and rebuild everything sized by the surface.
    fn recreate(&mut self) -> Result<SurfaceStatus>;

    /// Block until `slot`'s previous submission has completed.
    fn wait_for_slot(&mut self, slot: usize) -> Result<()>;

    /// Acquire the next presentable image, signalling `slot`'s
    /// image-available semaphore.
    fn acquire(&mut self, slot: usize) -> Result<Acquire>;

    /// Unsignal `slot`'s fence ahead of the submit that re-signals it.
    fn reset_slot(&mut self, slot: usize) -> Result<()>;

    /// CPU-side per-frame work for `image_index`: uniform writes and
    /// re-recording stale command buffers. Runs after both the slot's
    /// and the image's previous work completed.
    fn prepare_image(&mut self, slot: usize, image_index: u32) -> Result<()>;

    /// Submit render and copy work, signalling `slot`'s fence.
    fn submit(&mut self, slot: usize, image_index: u32) -> Result<()>;

    fn present(&mut self, slot: usize, image_index: u32) -> Result<Present>;
}

/// What one call to `FramePacer::run_frame` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Presented { slot: usize, image_index: u32 },
    /// Surface minimized; nothing submitted.
    Skipped,
    /// Acquire found the swapchain out of date; rebuilt, nothing submitted.
    Recreated,
}

/// Round-robin frame slot scheduler.
#[derive(Debug)]
pub struct FramePacer {
    frames_in_flight: usize,
    slot: usize,
    /// Slot whose submission last used each presentable image.
    image_owners: Vec<Option<usize>>,
    needs_recreate: bool,
    minimized: bool,
}

impl FramePacer {
    pub fn new(frames_in_flight: usize) -> Result<Self> {
        if frames_in_flight == 0 {
            return Err(GpuError::InvalidConfig(
                "frames in flight must be at least 1".into(),
            ));
        }
        Ok(Self {
            frames_in_flight,
            slot: 0,
            image_owners: Vec::new(),
            needs_recreate: false,
            minimized: false,
        })
    }

    pub fn frames_in_flight(&self) -> usize {
        self.frames_in_flight
    }

    /// Slot the next frame will use.
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn is_minimized(&self) -> bool {
        self.minimized
    }

    /// Rebuild surface-sized resources before the next acquire.
    pub fn request_recreate(&mut self) {
        self.needs_recreate = true;
    }

    pub fn needs_recreate(&self) -> bool {
        self.needs_recreate
    }

    /// Drive one frame through the backend.
    pub fn run_frame<B: FrameBackend + ?Sized>(&mut self, backend: &mut B) -> Result<FrameOutcome> {
        match backend.poll_surface()? {
            SurfaceStatus::Minimized => {
                if !self.minimized {
                    log::debug!("Surface minimized; pausing submission");
                }
                self.minimized = true;
                return Ok(FrameOutcome::Skipped);
            }
            SurfaceStatus::Restored => {
                log::debug!("Surface restored");
                self.minimized = false;
                self.needs_recreate = true;
            }
            SurfaceStatus::Ready => self.minimized = false,
        }

        if self.needs_recreate && self.recreate(backend)? == SurfaceStatus::Minimized {
            return Ok(FrameOutcome::Skipped);
        }

        let slot = self.slot;
        backend.wait_for_slot(slot)?;

        let image_index = match backend.acquire(slot)? {
            Acquire::Image { index, suboptimal } => {
                if suboptimal {
                    self.needs_recreate = true;
                }
                index
            }
            Acquire::OutOfDate => {
                log::debug!("Swapchain out of date on acquire");
                self.recreate(backend)?;
                return Ok(FrameOutcome::Recreated);
            }
        };

        // A different slot may still be rendering into this image
        let image = image_index as usize;
        if self.image_owners.len() != backend.image_count() {
            self.image_owners = vec![None; backend.image_count()];
        }
        let owner = self
            .image_owners
            .get(image)
            .copied()
            .ok_or_else(|| GpuError::InvalidState(format!("acquired unknown image {image}")))?;
        if let Some(owner) = owner {
            if owner != slot {
                backend.wait_for_slot(owner)?;
            }
        }
        self.image_owners[image] = Some(slot);

        backend.reset_slot(slot)?;
        backend.prepare_image(slot, image_index)?;
        backend.submit(slot, image_index)?;

        match backend.present(slot, image_index)? {
            Present::Done => {}
            Present::Suboptimal | Present::OutOfDate => {
                log::debug!("Present reported a stale swapchain");
                self.needs_recreate = true;
            }
        }

        self.slot = (slot + 1) % self.frames_in_flight;
        Ok(FrameOutcome::Presented { slot, image_index })
    }

    fn recreate<B: FrameBackend + ?Sized>(&mut self, backend: &mut B) -> Result<SurfaceStatus> {
        let status = backend.recreate()?;
        self.needs_recreate = status == SurfaceStatus::Minimized;
        self.minimized = status == SurfaceStatus::Minimized;
        self.image_owners = vec![None; backend.image_count()];
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::{Condvar, Mutex};
    use std::collections::VecDeque;
    use std::sync::{mpsc, Arc};
    use std::thread;
    use std::time::Duration;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Event {
        Recreate,
        Wait(usize),
        Acquire(usize),
        Reset(usize),
        Prepare(usize, u32),
        Submit(usize, u32),
        Present(usize, u32),
    }

    /// CPU stand-in for a VkFence.
    struct MockFence {
        signaled: Mutex<bool>,
        cond: Condvar,
    }

    impl MockFence {
        fn signaled() -> Self {
            Self {
                signaled: Mutex::new(true),
                cond: Condvar::new(),
            }
        }

        fn wait(&self) {
            let mut signaled = self.signaled.lock();
            while !*signaled {
                self.cond.wait(&mut signaled);
            }
        }

        fn signal(&self) {
            *self.signaled.lock() = true;
            self.cond.notify_all();
        }

        fn reset(&self) {
            *self.signaled.lock() = false;
        }
    }

    struct MockBackend {
        fences: Arc<Vec<MockFence>>,
        /// Signal the fence as soon as work is submitted.
        instant_gpu: bool,
        image_count: usize,
        next_image: u32,
        acquires: VecDeque<Acquire>,
        presents: VecDeque<Present>,
        surface: VecDeque<SurfaceStatus>,
        events: Vec<Event>,
    }

    impl MockBackend {
        fn new(frames_in_flight: usize, image_count: usize) -> Self {
            Self {
                fences: Arc::new((0..frames_in_flight).map(|_| MockFence::signaled()).collect()),
                instant_gpu: true,
                image_count,
                next_image: 0,
                acquires: VecDeque::new(),
                presents: VecDeque::new(),
                surface: VecDeque::new(),
                events: Vec::new(),
            }
        }

        fn submitted(&self) -> usize {
            self.events
                .iter()
                .filter(|e| matches!(e, Event::Submit(..)))
                .count()
        }
    }

    impl FrameBackend for MockBackend {
        fn image_count(&self) -> usize {
            self.image_count
        }

        fn poll_surface(&mut self) -> Result<SurfaceStatus> {
            Ok(self.surface.pop_front().unwrap_or(SurfaceStatus::Ready))
        }

        fn recreate(&mut self) -> Result<SurfaceStatus> {
            self.events.push(Event::Recreate);
            for fence in self.fences.iter() {
                fence.wait();
            }
            self.next_image = 0;
            Ok(SurfaceStatus::Ready)
        }

        fn wait_for_slot(&mut self, slot: usize) -> Result<()> {
            self.events.push(Event::Wait(slot));
            self.fences[slot].wait();
            Ok(())
        }

        fn acquire(&mut self, slot: usize) -> Result<Acquire> {
            self.events.push(Event::Acquire(slot));
            if let Some(scripted) = self.acquires.pop_front() {
                return Ok(scripted);
            }
            let index = self.next_image;
            self.next_image = (self.next_image + 1) % self.image_count as u32;
            Ok(Acquire::Image {
                index,
                suboptimal: false,
            })
        }

        fn reset_slot(&mut self, slot: usize) -> Result<()> {
            self.events.push(Event::Reset(slot));
            self.fences[slot].reset();
            Ok(())
        }

        fn prepare_image(&mut self, slot: usize, image_index: u32) -> Result<()> {
            self.events.push(Event::Prepare(slot, image_index));
            Ok(())
        }

        fn submit(&mut self, slot: usize, image_index: u32) -> Result<()> {
            self.events.push(Event::Submit(slot, image_index));
            if self.instant_gpu {
                self.fences[slot].signal();
            }
            Ok(())
        }

        fn present(&mut self, slot: usize, image_index: u32) -> Result<Present> {
            self.events.push(Event::Present(slot, image_index));
            Ok(self.presents.pop_front().unwrap_or(Present::Done))
        }
    }

    fn presented(outcome: FrameOutcome) -> (usize, u32) {
        match outcome {
            FrameOutcome::Presented { slot, image_index } => (slot, image_index),
            other => panic!("expected a presented frame, got {other:?}"),
        }
    }

    #[test]
    fn zero_frames_in_flight_is_rejected() {
        assert!(matches!(FramePacer::new(0), Err(GpuError::InvalidConfig(_))));
    }

    #[test]
    fn slots_advance_round_robin() {
        let mut backend = MockBackend::new(2, 3);
        let mut pacer = FramePacer::new(2).unwrap();

        let frames: Vec<_> = (0..5)
            .map(|_| presented(pacer.run_frame(&mut backend).unwrap()))
            .collect();
        assert_eq!(frames, vec![(0, 0), (1, 1), (0, 2), (1, 0), (0, 1)]);
        assert_eq!(pacer.slot(), 1);
    }

    #[test]
    fn frame_steps_run_in_order() {
        let mut backend = MockBackend::new(2, 3);
        let mut pacer = FramePacer::new(2).unwrap();
        pacer.run_frame(&mut backend).unwrap();

        assert_eq!(
            backend.events,
            vec![
                Event::Wait(0),
                Event::Acquire(0),
                Event::Reset(0),
                Event::Prepare(0, 0),
                Event::Submit(0, 0),
                Event::Present(0, 0),
            ]
        );
    }

    #[test]
    fn reusing_a_slot_blocks_until_its_fence_signals() {
        let mut backend = MockBackend::new(2, 3);
        backend.instant_gpu = false;
        let fences = backend.fences.clone();

        let (tx, rx) = mpsc::channel();
        let worker = thread::spawn(move || {
            let mut pacer = FramePacer::new(2).unwrap();
            for _ in 0..3 {
                let outcome = pacer.run_frame(&mut backend).unwrap();
                tx.send(outcome).unwrap();
            }
        });

        // Both slots start signalled, so two frames go through
        let first = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let second = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(presented(first).0, 0);
        assert_eq!(presented(second).0, 1);

        // The third frame needs slot 0 again and must wait for the GPU
        assert!(matches!(
            rx.recv_timeout(Duration::from_millis(200)),
            Err(mpsc::RecvTimeoutError::Timeout)
        ));

        fences[0].signal();
        let third = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(presented(third), (0, 2));

        worker.join().unwrap();
    }

    #[test]
    fn image_held_by_another_slot_is_waited_for() {
        let mut backend = MockBackend::new(2, 2);
        backend.acquires = VecDeque::from(vec![
            Acquire::Image {
                index: 1,
                suboptimal: false,
            },
            Acquire::Image {
                index: 1,
                suboptimal: false,
            },
        ]);
        let mut pacer = FramePacer::new(2).unwrap();

        pacer.run_frame(&mut backend).unwrap();
        backend.events.clear();
        assert_eq!(presented(pacer.run_frame(&mut backend).unwrap()), (1, 1));

        // Slot 1 waits on itself, then on slot 0 which last drew image 1
        assert_eq!(
            &backend.events[..3],
            &[Event::Wait(1), Event::Acquire(1), Event::Wait(0)]
        );
    }

    #[test]
    fn out_of_date_acquire_recreates_without_submitting() {
        let mut backend = MockBackend::new(2, 3);
        backend.acquires = VecDeque::from(vec![Acquire::OutOfDate]);
        let mut pacer = FramePacer::new(2).unwrap();

        assert_eq!(pacer.run_frame(&mut backend).unwrap(), FrameOutcome::Recreated);
        assert!(backend.events.contains(&Event::Recreate));
        assert_eq!(backend.submitted(), 0);
        assert_eq!(pacer.slot(), 0);

        // Next frame proceeds normally on the same slot
        assert_eq!(presented(pacer.run_frame(&mut backend).unwrap()).0, 0);
    }

    #[test]
    fn suboptimal_present_recreates_before_next_acquire() {
        let mut backend = MockBackend::new(2, 3);
        backend.presents = VecDeque::from(vec![Present::Suboptimal]);
        let mut pacer = FramePacer::new(2).unwrap();

        pacer.run_frame(&mut backend).unwrap();
        assert!(pacer.needs_recreate());
        backend.events.clear();

        pacer.run_frame(&mut backend).unwrap();
        assert_eq!(backend.events[0], Event::Recreate);
        assert!(!pacer.needs_recreate());
    }

    #[test]
    fn suboptimal_acquire_still_presents_then_recreates() {
        let mut backend = MockBackend::new(2, 3);
        backend.acquires = VecDeque::from(vec![Acquire::Image {
            index: 0,
            suboptimal: true,
        }]);
        let mut pacer = FramePacer::new(2).unwrap();

        assert_eq!(presented(pacer.run_frame(&mut backend).unwrap()), (0, 0));
        assert!(pacer.needs_recreate());
    }

    #[test]
    fn minimized_surface_skips_until_restored() {
        let mut backend = MockBackend::new(2, 3);
        backend.surface = VecDeque::from(vec![
            SurfaceStatus::Minimized,
            SurfaceStatus::Minimized,
            SurfaceStatus::Restored,
        ]);
        let mut pacer = FramePacer::new(2).unwrap();

        assert_eq!(pacer.run_frame(&mut backend).unwrap(), FrameOutcome::Skipped);
        assert!(pacer.is_minimized());
        assert_eq!(pacer.run_frame(&mut backend).unwrap(), FrameOutcome::Skipped);
        assert!(backend.events.is_empty());

        assert_eq!(presented(pacer.run_frame(&mut backend).unwrap()).0, 0);
        assert!(!pacer.is_minimized());
        assert_eq!(backend.events[0], Event::Recreate);
        assert_eq!(backend.submitted(), 1);
    }

    #[test]
    fn explicit_recreate_request_is_honoured() {
        let mut backend = MockBackend::new(3, 3);
        let mut pacer = FramePacer::new(3).unwrap();
        pacer.request_recreate();

        pacer.run_frame(&mut backend).unwrap();
        assert_eq!(backend.events[0], Event::Recreate);
    }
}
