//! RT navigation: button-press sequencing, menu-tree
//! shortest-path navigation, and the adaptive quantity-adjustment
//! accelerator.

pub mod menu;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::app::{App, ButtonCode, RtCommand, ServiceId};
use crate::display::MenuId;
use crate::Result;

/// Interval between repeated `(code, flag=false)` packets while a button
/// is held down.
const LONG_PRESS_REPEAT: Duration = Duration::from_millis(200);

/// Quantity-adjustment accelerator switches from long-press stepping to
/// short-press correction once within this many steps of the target.
const ACCELERATOR_THRESHOLD: u32 = 20;

/// `RT_BUTTON_STATUS` body: button code plus a status-changed flag. The
/// RT sequence prefix itself is added by [`App::send`], not by this
/// layer.
fn rt_button_status_body(code: ButtonCode, flag: bool) -> Vec<u8> {
    vec![code.bits(), u8::from(flag)]
}

async fn send_button(app: &App, code: ButtonCode, flag: bool) -> Result<()> {
    let body = rt_button_status_body(code, flag);
    app.send(ServiceId::RtMode, u8::from(RtCommand::ButtonStatus), body).await
}

/// Sends a short button press: `(code, true)` immediately followed by
/// `(NO_BUTTON, true)`.
pub async fn press_short(app: &App, code: ButtonCode) -> Result<()> {
    send_button(app, code, true).await?;
    send_button(app, ButtonCode::NO_BUTTON, true).await
}

/// Handle returned by [`start_long`]; stopping is idempotent, and a
/// second [`LongPress::stop`] call after the first is a no-op.
pub struct LongPress {
    cancel: CancellationToken,
    stopped: Arc<Notify>,
    code: ButtonCode,
}

impl LongPress {
    /// Releases the held button: `(NO_BUTTON, true)`. Safe to call more
    /// than once; only the first call has any effect.
    pub async fn stop(self, app: &App) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Ok(());
        }
        self.cancel.cancel();
        self.stopped.notified().await;
        send_button(app, ButtonCode::NO_BUTTON, true).await
    }

    #[must_use]
    pub fn code(&self) -> ButtonCode {
        self.code
    }
}

/// Starts a long button press: `(code, true)` once, then `(code, false)`
/// repeated every ~200ms until [`LongPress::stop`] is called. A second
/// [`start_long`] call for a button that is already held is idempotent --
/// it returns a handle that stops the same repeater.
pub async fn start_long(app: Arc<App>, code: ButtonCode) -> Result<LongPress> {
    send_button(&app, code, true).await?;

    let cancel = CancellationToken::new();
    let stopped = Arc::new(Notify::new());
    let task_cancel = cancel.clone();
    let task_stopped = stopped.clone();
    let task_app = app.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = task_cancel.cancelled() => break,
                () = tokio::time::sleep(LONG_PRESS_REPEAT) => {
                    if send_button(&task_app, code, false).await.is_err() {
                        break;
                    }
                }
            }
        }
        task_stopped.notify_one();
    });

    Ok(LongPress { cancel, stopped, code })
}

/// Sends a chord: several buttons OR-combined into one code, as a short
/// press.
pub async fn press_chord_short(app: &App, codes: &[ButtonCode]) -> Result<()> {
    let combined = codes.iter().fold(ButtonCode::NO_BUTTON, |acc, &c| acc | c);
    press_short(app, combined).await
}

/// Drives the pump from `from` to `to` through the precomputed menu tree,
/// using `MENU` to cycle siblings onto the target entry and `CHECK` to
/// enter it (drilling down) or to back out to the parent (backing up).
/// Each press is a short press; the caller is responsible for waiting on
/// the resulting screen stream between steps if it needs to confirm
/// arrival.
pub async fn navigate(app: &App, from: menu::NodeIndex, to: menu::NodeIndex) -> Result<()> {
    for step in menu::path(from, to) {
        trace!(from = step.from, to = step.to, "rt navigate step");
        if menu::MENU_TREE[step.from].parent == Some(step.to) {
            // Backing up: CHECK on the always-present "back" highlight.
            press_short(app, ButtonCode::CHECK).await?;
        } else {
            // Drilling down: cycle MENU onto the target sibling, then
            // CHECK to enter it.
            for _ in 0..menu::sibling_offset(step.to) {
                press_short(app, ButtonCode::MENU).await?;
            }
            press_short(app, ButtonCode::CHECK).await?;
        }
    }
    Ok(())
}

/// Finds the node for a recognized menu screen, if it has one.
#[must_use]
pub fn node_for(id: MenuId) -> Option<menu::NodeIndex> {
    menu::find(id)
}

/// Adaptive quantity-adjustment accelerator: while
/// more than [`ACCELERATOR_THRESHOLD`] steps from the target, holds
/// `code` long and releases early; once within range, finishes with
/// short presses so the final value lands exactly on target.
pub async fn adjust_quantity(
    app: Arc<App>,
    code: ButtonCode,
    current: u32,
    target: u32,
) -> Result<()> {
    let mut remaining = current.abs_diff(target);
    while remaining > ACCELERATOR_THRESHOLD {
        let long = start_long(app.clone(), code).await?;
        // Released "early": the accelerator does not wait for the long
        // press to walk all the way to zero, it estimates progress and
        // hands off to short-press correction with margin to spare.
        tokio::time::sleep(LONG_PRESS_REPEAT * 4).await;
        long.stop(&app).await?;
        remaining = remaining.saturating_sub(ACCELERATOR_THRESHOLD);
    }
    while remaining > 0 {
        press_short(&app, code).await?;
        remaining -= 1;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn button_status_body_carries_code_and_flag() {
        let body = rt_button_status_body(ButtonCode::UP, true);
        assert_eq!(body, vec![ButtonCode::UP.bits(), 1]);
    }

    #[test]
    fn chord_combines_codes_with_or() {
        let combined = [ButtonCode::UP, ButtonCode::CHECK]
            .iter()
            .fold(ButtonCode::NO_BUTTON, |acc, &c| acc | c);
        assert_eq!(combined, ButtonCode::UP | ButtonCode::CHECK);
    }

    #[test]
    fn accelerator_threshold_switches_strategy() {
        assert!(30 > ACCELERATOR_THRESHOLD);
        assert!(5 <= ACCELERATOR_THRESHOLD);
    }
}
