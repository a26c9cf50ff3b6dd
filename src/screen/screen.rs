//! Screen stream: turns a (possibly repeated)
//! sequence of [`DisplayFrame`]s into a de-duplicated sequence of
//! [`ParsedScreen`]s, with alert screens either dropped (observer mode) or
//! collected and auto-dismissed (active mode).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::display::locale::TitleContext;
use crate::display::{parse_screen, DisplayFrame, ParsedScreen};
use crate::{Error, Result};

/// How a [`ScreenStream`] handles alert screens.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AlertMode {
    /// Alerts are dropped; nothing else about the stream changes.
    Observer,
    /// Consecutive alert screens are collected; once a non-alert screen
    /// follows, [`DismissAlert::dismiss_alert`] is invoked (simulating a
    /// CHECK press) and the collected alerts are surfaced to the caller as
    /// [`Error::AlertSeen`].
    Active,
}

/// Simulates pressing CHECK to clear the pump's current alert screen.
#[async_trait]
pub trait DismissAlert: Send + Sync {
    async fn dismiss_alert(&self) -> Result<()>;
}

/// Per-pump lease enforcing that at most one active-mode
/// stream may run at a time; concurrent active streams could both try to
/// dismiss the same alert, which is forbidden.
#[derive(Clone, Debug, Default)]
pub struct ActiveStreamGuard(Arc<AtomicBool>);

impl ActiveStreamGuard {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn acquire(&self) -> Result<ActiveLease> {
        if self.0.swap(true, Ordering::SeqCst) {
            Err(Error::Protocol(
                "an active-mode screen stream is already running for this pump".into(),
            ))
        } else {
            Ok(ActiveLease(self.0.clone()))
        }
    }
}

struct ActiveLease(Arc<AtomicBool>);

impl Drop for ActiveLease {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Transforms raw display frames into deduplicated parsed screens for one
/// pump connection.
pub struct ScreenStream<D> {
    mode: AlertMode,
    dismiss: D,
    _lease: Option<ActiveLease>,
    prev_frame: Option<Arc<DisplayFrame>>,
    prev_parsed: Option<ParsedScreen>,
    pending_alerts: Vec<ParsedScreen>,
}

impl<D: DismissAlert> ScreenStream<D> {
    /// Builds a stream in `mode`; acquires `guard` for the lifetime of the
    /// stream when `mode` is [`AlertMode::Active`].
    pub fn new(mode: AlertMode, dismiss: D, guard: &ActiveStreamGuard) -> Result<Self> {
        let lease = match mode {
            AlertMode::Active => Some(guard.acquire()?),
            AlertMode::Observer => None,
        };
        Ok(Self {
            mode,
            dismiss,
            _lease: lease,
            prev_frame: None,
            prev_parsed: None,
            pending_alerts: Vec::new(),
        })
    }

    /// Feeds one raw display frame. `title_context` is forwarded to
    /// [`parse_screen`] to disambiguate a title the locale table maps to
    /// more than one meaning; pass `None` when not mid-navigation toward
    /// a specific field. Returns `Ok(None)` for a duplicate or a frame
    /// absorbed into a pending alert batch, `Ok(Some(screen))` for a
    /// fresh non-alert screen, and [`Error::AlertSeen`] once a batch of
    /// alerts has just been dismissed -- the caller must treat the
    /// in-flight RT operation as aborted and re-check pump state.
    pub async fn feed(
        &mut self,
        frame: Arc<DisplayFrame>,
        title_context: Option<TitleContext>,
    ) -> Result<Option<ParsedScreen>> {
        // Stage 1: cheap reference-identity passthrough, before parsing.
        if let Some(prev) = &self.prev_frame {
            if Arc::ptr_eq(prev, &frame) {
                return Ok(None);
            }
        }

        let parsed = parse_screen(&frame, title_context)?;

        // Stage 2: parsed-value equality, falling back to full bitmap
        // equality only when both sides failed to recognize the screen;
        // two distinct unrecognized screens must not collapse just
        // because neither was understood.
        let is_dup = match (&self.prev_parsed, &parsed) {
            (Some(ParsedScreen::Unrecognized), ParsedScreen::Unrecognized) => {
                self.prev_frame.as_deref() == Some(frame.as_ref())
            }
            (Some(prev), cur) => prev == cur,
            (None, _) => false,
        };
        self.prev_frame = Some(Arc::clone(&frame));
        self.prev_parsed = Some(parsed.clone());
        if is_dup {
            return Ok(None);
        }

        let is_alert = matches!(parsed, ParsedScreen::AlertWarning(_) | ParsedScreen::AlertError(_));
        match self.mode {
            AlertMode::Observer => {
                if is_alert {
                    debug!(?parsed, "alert screen ignored in observer mode");
                    Ok(None)
                } else {
                    Ok(Some(parsed))
                }
            }
            AlertMode::Active => {
                if is_alert {
                    self.pending_alerts.push(parsed);
                    Ok(None)
                } else if self.pending_alerts.is_empty() {
                    Ok(Some(parsed))
                } else {
                    let contents = std::mem::take(&mut self.pending_alerts);
                    self.dismiss.dismiss_alert().await?;
                    warn!(count = contents.len(), "dismissed pending alert screens");
                    Err(Error::AlertSeen { contents })
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::display::glyphs::{template_for, GlyphKind, SymbolId};
    use std::sync::atomic::AtomicU32;

    #[derive(Default)]
    struct CountingDismiss(AtomicU32);

    #[async_trait]
    impl DismissAlert for CountingDismiss {
        async fn dismiss_alert(&self) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn frame_with(kinds: &[GlyphKind]) -> Arc<DisplayFrame> {
        let mut frame = DisplayFrame::blank();
        let mut x = 0;
        for &kind in kinds {
            let t = template_for(kind);
            frame.stamp(&t, x, 0);
            x += t.width;
        }
        Arc::new(frame)
    }

    fn warning(code: u8) -> Arc<DisplayFrame> {
        frame_with(&[
            GlyphKind::LargeSymbol(SymbolId::Warning),
            GlyphKind::LargeChar('W'),
            GlyphKind::LargeDigit(code),
            GlyphKind::SmallSymbol(SymbolId::Check),
        ])
    }

    fn menu_standard_bolus() -> Arc<DisplayFrame> {
        frame_with(&[GlyphKind::LargeSymbol(SymbolId::MenuStandardBolus)])
    }

    #[tokio::test]
    async fn identical_arc_is_a_cheap_duplicate() {
        let mut s = ScreenStream::new(AlertMode::Observer, CountingDismiss::default(), &ActiveStreamGuard::new()).unwrap();
        let f = menu_standard_bolus();
        assert!(s.feed(f.clone(), None).await.unwrap().is_some());
        assert!(s.feed(f, None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn distinct_frames_with_equal_parsed_value_dedup() {
        let mut s = ScreenStream::new(AlertMode::Observer, CountingDismiss::default(), &ActiveStreamGuard::new()).unwrap();
        let a = menu_standard_bolus();
        let b = menu_standard_bolus(); // distinct Arc, same bitmap & parse
        assert!(s.feed(a, None).await.unwrap().is_some());
        assert!(s.feed(b, None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unrecognized_frames_fall_back_to_bitmap_equality() {
        let mut s = ScreenStream::new(AlertMode::Observer, CountingDismiss::default(), &ActiveStreamGuard::new()).unwrap();
        let blank_a = Arc::new(DisplayFrame::blank());
        let blank_b = Arc::new(DisplayFrame::blank());
        let mut different = DisplayFrame::blank();
        different.set(0, 0, true);
        let different = Arc::new(different);

        assert_eq!(s.feed(blank_a, None).await.unwrap(), Some(ParsedScreen::Unrecognized));
        assert!(s.feed(blank_b, None).await.unwrap().is_none(), "equal bitmaps dedup");
        assert_eq!(s.feed(different, None).await.unwrap(), Some(ParsedScreen::Unrecognized));
    }

    #[tokio::test]
    async fn observer_mode_drops_alerts() {
        let mut s = ScreenStream::new(AlertMode::Observer, CountingDismiss::default(), &ActiveStreamGuard::new()).unwrap();
        assert!(s.feed(warning(1), None).await.unwrap().is_none());
        assert!(s.feed(menu_standard_bolus(), None).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn active_mode_dismisses_and_surfaces_alert_seen() {
        let guard = ActiveStreamGuard::new();
        let mut s = ScreenStream::new(AlertMode::Active, CountingDismiss::default(), &guard).unwrap();
        assert!(s.feed(warning(1), None).await.unwrap().is_none());
        assert!(s.feed(warning(2), None).await.unwrap().is_none());
        let err = s.feed(menu_standard_bolus(), None).await.unwrap_err();
        match err {
            Error::AlertSeen { contents } => assert_eq!(contents.len(), 2),
            other => panic!("expected AlertSeen, got {other:?}"),
        }
        assert_eq!(s.dismiss.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn second_active_stream_is_rejected_while_first_is_alive() {
        let guard = ActiveStreamGuard::new();
        let _first = ScreenStream::new(AlertMode::Active, CountingDismiss::default(), &guard).unwrap();
        assert!(ScreenStream::new(AlertMode::Active, CountingDismiss::default(), &guard).is_err());
    }

    #[tokio::test]
    async fn active_stream_releases_guard_on_drop() {
        let guard = ActiveStreamGuard::new();
        {
            let _s = ScreenStream::new(AlertMode::Active, CountingDismiss::default(), &guard).unwrap();
        }
        assert!(ScreenStream::new(AlertMode::Active, CountingDismiss::default(), &guard).is_ok());
    }
}
