//! Capture device boundary and the scoped frame borrow.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Jpeg,
    Rgb565,
    Yuv422,
    Grayscale,
    Other(u32),
}

impl PixelFormat {
    pub fn mime_type(&self) -> Option<&'static str> {
        match self {
            PixelFormat::Jpeg => Some("image/jpeg"),
            _ => None,
        }
    }
}

/// Where the driver placed the frame buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameLocation {
    Internal,
    External,
}

impl fmt::Display for FrameLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameLocation::Internal => f.write_str("DRAM"),
            FrameLocation::External => f.write_str("PSRAM"),
        }
    }
}

/// A frame buffer owned by the driver.
pub trait RawFrame {
    fn data(&self) -> &[u8];
    fn format(&self) -> PixelFormat;
    fn location(&self) -> FrameLocation;
}

/// The camera driver. Implementations serialize acquire/release internally.
pub trait CaptureSource: Send + Sync {
    type Frame: RawFrame;

    fn is_ready(&self) -> bool;

    /// Borrow the next frame, `None` when the driver has nothing to give.
    fn acquire(&self) -> Option<Self::Frame>;

    /// Hand a frame back. Called exactly once per acquired frame.
    fn release(&self, frame: Self::Frame);
}

/// A borrowed frame that goes back to its source when dropped.
pub struct FrameGuard<'a, C: CaptureSource + ?Sized> {
    source: &'a C,
    frame: Option<C::Frame>,
}

impl<'a, C: CaptureSource + ?Sized> FrameGuard<'a, C> {
    pub fn acquire(source: &'a C) -> Option<Self> {
        source.acquire().map(|frame| Self { source, frame: Some(frame) })
    }

    fn frame(&self) -> &C::Frame {
        // Only `Drop` takes the frame out.
        match self.frame.as_ref() {
            Some(frame) => frame,
            None => unreachable!("frame guard used after release"),
        }
    }

    pub fn data(&self) -> &[u8] {
        self.frame().data()
    }

    pub fn len(&self) -> usize {
        self.data().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data().is_empty()
    }

    pub fn format(&self) -> PixelFormat {
        self.frame().format()
    }

    pub fn location(&self) -> FrameLocation {
        self.frame().location()
    }
}

impl<C: CaptureSource + ?Sized> Drop for FrameGuard<'_, C> {
    fn drop(&mut self) {
        if let Some(frame) = self.frame.take() {
            self.source.release(frame);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Frame(Vec<u8>);

    impl RawFrame for Frame {
        fn data(&self) -> &[u8] {
            &self.0
        }
        fn format(&self) -> PixelFormat {
            PixelFormat::Jpeg
        }
        fn location(&self) -> FrameLocation {
            FrameLocation::External
        }
    }

    #[derive(Default)]
    struct Source {
        acquired: AtomicUsize,
        released: AtomicUsize,
    }

    impl CaptureSource for Source {
        type Frame = Frame;

        fn is_ready(&self) -> bool {
            true
        }

        fn acquire(&self) -> Option<Frame> {
            self.acquired.fetch_add(1, Ordering::SeqCst);
            Some(Frame(vec![0xFF, 0xD8, 0xFF, 0xD9]))
        }

        fn release(&self, _frame: Frame) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let source = Source::default();
        {
            let guard = FrameGuard::acquire(&source).unwrap();
            assert_eq!(guard.len(), 4);
            assert_eq!(guard.format().mime_type(), Some("image/jpeg"));
            assert_eq!(guard.location().to_string(), "PSRAM");
            assert_eq!(source.released.load(Ordering::SeqCst), 0);
        }
        assert_eq!(source.acquired.load(Ordering::SeqCst), 1);
        assert_eq!(source.released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_guard_releases_on_early_return() {
        fn bail_out(source: &Source) -> Result<(), ()> {
            let guard = FrameGuard::acquire(source).ok_or(())?;
            if guard.len() > 2 {
                return Err(());
            }
            Ok(())
        }

        let source = Source::default();
        assert!(bail_out(&source).is_err());
        assert_eq!(source.released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_only_jpeg_has_mime_type() {
        assert_eq!(PixelFormat::Rgb565.mime_type(), None);
        assert_eq!(PixelFormat::Other(9).mime_type(), None);
    }
}
