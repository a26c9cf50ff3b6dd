//! Pump controller: connect/disconnect lifecycle,
//! mode switching, and the high-level operations (bolus, TBR, basal
//! profile, history, status) built on top of the transport, application,
//! display, screen, and RT-navigation layers. Each long operation exposes
//! a progress reporter via [`OpHandle`].

pub mod progress;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::app::{App, ButtonCode, CmdCommand, CtrlCommand, RtCommand, ServiceId};
use crate::bt::{BluetoothProvider, PinCallback};
use crate::display::locale::TitleContext;
use crate::display::{DisplayFrame, MainScreen, MenuId, ParsedScreen};
use crate::rt::{self, menu};
use crate::screen::{ActiveStreamGuard, AlertMode, DismissAlert, ScreenStream};
use crate::store::{Addr, InvariantPumpData, PumpStore, TbrKind, TbrSnapshot};
use crate::transport::{pairing, Transport, TransportConfig};
use crate::{Error, Result};

pub use progress::{ProgressReporter, ProgressStage, ProgressUpdate, StageKind};

/// Policy knobs for a [`PumpController`], with sensible defaults.
/// The core never reads these from the environment or a config file
/// itself: the embedding application owns that and constructs this
/// struct however it likes.
#[derive(Clone, Copy, Debug)]
pub struct PumpConfig {
    pub ack_timeout: Duration,
    pub max_retries: u8,
    pub keep_alive_interval: Duration,
    pub mac_failure_threshold: u32,
    pub mac_failure_window: Duration,
    /// Ceiling on a single bolus, in tenth-IU units; `deliver_bolus`
    /// rejects anything larger before it ever reaches the wire.
    pub max_bolus_tenth_iu: u32,
    /// How long a CMD/CTRL round trip waits for its typed response once
    /// the transport has already ACKed delivery.
    pub response_timeout: Duration,
    /// RFCOMM channel number the Bluetooth provider should use; the
    /// provider (an external collaborator) is free to ignore this
    /// and use SDP discovery instead.
    pub rfcomm_channel: u8,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_millis(1500),
            max_retries: 3,
            keep_alive_interval: Duration::from_secs(1),
            mac_failure_threshold: 3,
            mac_failure_window: Duration::from_secs(1),
            max_bolus_tenth_iu: 250 * 10,
            response_timeout: Duration::from_secs(5),
            rfcomm_channel: 1,
        }
    }
}

impl PumpConfig {
    fn transport_config(self) -> TransportConfig {
        TransportConfig {
            ack_timeout: self.ack_timeout,
            max_retries: self.max_retries,
            mac_failure_threshold: self.mac_failure_threshold,
            mac_failure_window: self.mac_failure_window,
        }
    }
}

/// Which service is currently activated on the pump connection.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ControllerMode {
    Rt,
    Cmd,
}

impl ControllerMode {
    const fn service(self) -> ServiceId {
        match self {
            Self::Rt => ServiceId::RtMode,
            Self::Cmd => ServiceId::CommandMode,
        }
    }
}

/// `CMD_READ_PUMP_STATUS` response.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PumpStatus {
    pub battery_percent: u8,
    pub reservoir_tenth_iu: u32,
    pub active_basal_profile: u8,
    pub suspended: bool,
}

/// `CMD_READ_ERROR_WARNING_STATUS` response.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ErrorWarningStatus {
    pub warnings_pending: u8,
    pub errors_pending: u8,
}

/// `CMD_READ_DATETIME` response.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PumpDateTime {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

/// One decoded history record: TDD/bolus/TBR event kinds implied by
/// `fetchTddHistory`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HistoryEvent {
    Bolus { timestamp: i64, amount_tenth_iu: u32 },
    Tbr { timestamp: i64, percentage: u16, duration_minutes: u16 },
    Tdd { timestamp: i64, total_tenth_iu: u32 },
}

const HISTORY_RECORD_LEN: usize = 1 + 8 + 8;

impl HistoryEvent {
    fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HISTORY_RECORD_LEN {
            return Err(Error::Protocol("history record too short".into()));
        }
        let kind = bytes[0];
        let mut ts_bytes = [0u8; 8];
        ts_bytes.copy_from_slice(&bytes[1..9]);
        let timestamp = i64::from_le_bytes(ts_bytes);
        let data = &bytes[9..17];
        Ok(match kind {
            0 => Self::Bolus {
                timestamp,
                amount_tenth_iu: u32::from_le_bytes(data[0..4].try_into().unwrap()),
            },
            1 => Self::Tbr {
                timestamp,
                percentage: u16::from_le_bytes(data[0..2].try_into().unwrap()),
                duration_minutes: u16::from_le_bytes(data[2..4].try_into().unwrap()),
            },
            2 => Self::Tdd {
                timestamp,
                total_tenth_iu: u32::from_le_bytes(data[0..4].try_into().unwrap()),
            },
            other => return Err(Error::Protocol(format!("unknown history record kind {other}"))),
        })
    }
}

/// Reason code accompanying `CMD_DELIVER_BOLUS`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BolusReason {
    Standard,
    Correction,
    Meal,
}

/// `CMD_GET_BOLUS_STATUS` response.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BolusStatus {
    pub delivered_tenth_iu: u32,
    pub requested_tenth_iu: u32,
    pub active: bool,
}

/// [`pair`](PumpController::pair) progress stages.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PairStage {
    Scanning,
    OpeningSocket,
    ExchangingKeys,
    RequestingId,
    Registering,
    Finished,
    Aborted,
}

impl ProgressStage for PairStage {
    fn ordinal(self) -> usize {
        match self {
            Self::Scanning => 0,
            Self::OpeningSocket => 1,
            Self::ExchangingKeys => 2,
            Self::RequestingId => 3,
            Self::Registering | Self::Finished | Self::Aborted => 4,
        }
    }
    fn total(self) -> usize {
        5
    }
    fn kind(self) -> StageKind {
        match self {
            Self::Finished => StageKind::Finished,
            Self::Aborted => StageKind::Aborted,
            _ => StageKind::Normal,
        }
    }
}

/// [`connect`](PumpController::connect) progress stages.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectStage {
    OpeningSocket,
    Binding,
    ActivatingService,
    Finished,
    Aborted,
}

impl ProgressStage for ConnectStage {
    fn ordinal(self) -> usize {
        match self {
            Self::OpeningSocket => 0,
            Self::Binding => 1,
            Self::ActivatingService | Self::Finished | Self::Aborted => 2,
        }
    }
    fn total(self) -> usize {
        3
    }
    fn kind(self) -> StageKind {
        match self {
            Self::Finished => StageKind::Finished,
            Self::Aborted => StageKind::Aborted,
            _ => StageKind::Normal,
        }
    }
}

/// [`deliver_bolus`](PumpController::deliver_bolus) progress stages.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BolusStage {
    Validating,
    Requesting,
    Delivering,
    Finished,
    Aborted,
}

impl ProgressStage for BolusStage {
    fn ordinal(self) -> usize {
        match self {
            Self::Validating => 0,
            Self::Requesting => 1,
            Self::Delivering | Self::Finished | Self::Aborted => 2,
        }
    }
    fn total(self) -> usize {
        3
    }
    fn kind(self) -> StageKind {
        match self {
            Self::Finished => StageKind::Finished,
            Self::Aborted => StageKind::Aborted,
            _ => StageKind::Normal,
        }
    }
}

/// [`set_tbr`](PumpController::set_tbr) progress stages.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TbrStage {
    NavigatingToPercentage,
    AdjustingPercentage,
    NavigatingToDuration,
    AdjustingDuration,
    Confirming,
    Verifying,
    Finished,
    Aborted,
}

impl ProgressStage for TbrStage {
    fn ordinal(self) -> usize {
        match self {
            Self::NavigatingToPercentage => 0,
            Self::AdjustingPercentage => 1,
            Self::NavigatingToDuration => 2,
            Self::AdjustingDuration => 3,
            Self::Confirming => 4,
            Self::Verifying | Self::Finished | Self::Aborted => 5,
        }
    }
    fn total(self) -> usize {
        6
    }
    fn kind(self) -> StageKind {
        match self {
            Self::Finished => StageKind::Finished,
            Self::Aborted => StageKind::Aborted,
            _ => StageKind::Normal,
        }
    }
}

/// [`set_basal_profile`](PumpController::set_basal_profile) progress
/// stages. `AdjustingHour` carries the 0-based hour index so the reader
/// can show "7 / 24" without a separate accessor.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BasalProfileStage {
    Navigating,
    AdjustingHour(u8),
    Confirming,
    Verifying,
    Finished,
    Aborted,
}

impl ProgressStage for BasalProfileStage {
    fn ordinal(self) -> usize {
        match self {
            Self::Navigating => 0,
            Self::AdjustingHour(h) => 1 + usize::from(h),
            Self::Confirming => 25,
            Self::Verifying | Self::Finished | Self::Aborted => 26,
        }
    }
    fn total(self) -> usize {
        27
    }
    fn kind(self) -> StageKind {
        match self {
            Self::Finished => StageKind::Finished,
            Self::Aborted => StageKind::Aborted,
            _ => StageKind::Normal,
        }
    }
}

/// [`set_time_and_date`](PumpController::set_time_and_date) progress
/// stages.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TimeAndDateStage {
    Navigating,
    AdjustingHour,
    AdjustingMinute,
    AdjustingYear,
    AdjustingMonth,
    AdjustingDay,
    Confirming,
    Finished,
    Aborted,
}

impl ProgressStage for TimeAndDateStage {
    fn ordinal(self) -> usize {
        match self {
            Self::Navigating => 0,
            Self::AdjustingHour => 1,
            Self::AdjustingMinute => 2,
            Self::AdjustingYear => 3,
            Self::AdjustingMonth => 4,
            Self::AdjustingDay => 5,
            Self::Confirming => 6,
            Self::Finished | Self::Aborted => 7,
        }
    }
    fn total(self) -> usize {
        8
    }
    fn kind(self) -> StageKind {
        match self {
            Self::Finished => StageKind::Finished,
            Self::Aborted => StageKind::Aborted,
            _ => StageKind::Normal,
        }
    }
}

/// [`fetch_tdd_history`](PumpController::fetch_tdd_history) progress
/// stages.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HistoryStage {
    RequestingBlock(u32),
    Finished,
    Aborted,
}

impl ProgressStage for HistoryStage {
    fn ordinal(self) -> usize {
        match self {
            Self::RequestingBlock(n) => n as usize,
            Self::Finished | Self::Aborted => 1,
        }
    }
    fn total(self) -> usize {
        match self {
            Self::RequestingBlock(n) => (n + 1).max(1) as usize,
            _ => 1,
        }
    }
    fn kind(self) -> StageKind {
        match self {
            Self::Finished => StageKind::Finished,
            Self::Aborted => StageKind::Aborted,
            _ => StageKind::Normal,
        }
    }
}

/// Handle to a spawned long operation: a live progress receiver plus a
/// cancellation token and the eventual result. Dropping the handle without calling [`OpHandle::cancel`] or
/// [`OpHandle::join`] lets the operation run to completion in the
/// background.
pub struct OpHandle<S: ProgressStage, T> {
    pub progress: watch::Receiver<ProgressUpdate<S>>,
    cancel: CancellationToken,
    handle: tokio::task::JoinHandle<Result<T>>,
}

impl<S: ProgressStage, T: Send + 'static> OpHandle<S, T> {
    /// Requests cooperative cancellation. The
    /// operation observes this at its next suspension point and performs
    /// its own rollback before returning [`Error::Cancelled`].
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Awaits the operation's outcome.
    pub async fn join(self) -> Result<T> {
        match self.handle.await {
            Ok(r) => r,
            Err(e) => Err(Error::Protocol(format!("operation task panicked: {e}"))),
        }
    }
}

/// Races `fut` against cancellation, so every suspension point inside a
/// long operation can be made cooperatively cancellable with one line
///.
async fn cancellable<T>(
    token: &CancellationToken,
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        () = token.cancelled() => Err(Error::Cancelled),
        r = fut => r,
    }
}

/// Presses CHECK to dismiss the pump's current alert screen, used as the
/// [`DismissAlert`] implementation for every RT-driving operation below.
struct AppDismiss(Arc<App>);

#[async_trait::async_trait]
impl DismissAlert for AppDismiss {
    async fn dismiss_alert(&self) -> Result<()> {
        rt::press_short(&self.0, ButtonCode::CHECK).await
    }
}

/// Pulls the next freshly parsed, non-duplicate RT screen, decoding
/// `RT_DISPLAY` application packets into [`DisplayFrame`]s as they
/// arrive. Propagates [`Error::AlertSeen`] once a pending alert batch has
/// just been auto-dismissed; the caller must treat the in-flight
/// RT operation as aborted.
async fn next_screen(
    stream: &mut ScreenStream<AppDismiss>,
    rx: &mut mpsc::UnboundedReceiver<crate::app::AppPacket>,
    title_context: Option<TitleContext>,
) -> Result<ParsedScreen> {
    loop {
        let packet = rx
            .recv()
            .await
            .ok_or_else(|| Error::Protocol("RT display stream closed".into()))?;
        let frame = DisplayFrame::from_packed_bits(&packet.body)?;
        if let Some(screen) = stream.feed(Arc::new(frame), title_context).await? {
            return Ok(screen);
        }
    }
}

/// Drives one pump: pairing, connection lifecycle, mode switching, and
/// every high-level operation. Owns the RFCOMM
/// socket indirectly through the [`Transport`] it constructs on
/// [`connect`](Self::connect); the persistent store and Bluetooth
/// provider are shared, narrow external collaborators.
pub struct PumpController {
    addr: Addr,
    bt: Arc<dyn BluetoothProvider>,
    store: Arc<dyn PumpStore>,
    config: PumpConfig,
    transport: crate::AsyncMutex<Option<Arc<Transport>>>,
    app: crate::AsyncMutex<Option<Arc<App>>>,
    mode: crate::SyncMutex<Option<ControllerMode>>,
    keep_alive: crate::SyncMutex<Option<CancellationToken>>,
    alert_guard: ActiveStreamGuard,
    status_tx: watch::Sender<Option<PumpStatus>>,
    /// Serializes same-address high-level operations; the
    /// store itself allows concurrent access across distinct pumps.
    op_lock: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for PumpController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PumpController").field("addr", &self.addr).finish_non_exhaustive()
    }
}

impl PumpController {
    #[must_use]
    pub fn new(
        addr: Addr,
        bt: Arc<dyn BluetoothProvider>,
        store: Arc<dyn PumpStore>,
        config: PumpConfig,
    ) -> Arc<Self> {
        let (status_tx, _rx) = watch::channel(None);
        Arc::new(Self {
            addr,
            bt,
            store,
            config,
            transport: crate::AsyncMutex::new(None),
            app: crate::AsyncMutex::new(None),
            mode: crate::SyncMutex::new(None),
            keep_alive: crate::SyncMutex::new(None),
            alert_guard: ActiveStreamGuard::new(),
            status_tx,
            op_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// The latest known pump status as a watchable stream.
    #[must_use]
    pub fn status_flow(&self) -> watch::Receiver<Option<PumpStatus>> {
        self.status_tx.subscribe()
    }

    #[must_use]
    pub fn current_mode(&self) -> Option<ControllerMode> {
        *self.mode.lock()
    }

    async fn app_handle(&self) -> Result<Arc<App>> {
        self.app.lock().await.clone().ok_or(Error::Protocol("not connected".into()))
    }

    /// Drives the pairing handshake over a fresh RFCOMM connection,
    /// wrapping Bluetooth connect/unpair around it, and commits the
    /// resulting [`InvariantPumpData`] to the store atomically on
    /// success. On any failure the store
    /// entry and the OS-level Bluetooth pairing are both rolled back.
    #[instrument(skip(self, pin_cb), fields(pump.addr = %self.addr))]
    pub fn pair(
        self: Arc<Self>,
        friendly_name: &str,
        pin_cb: Arc<dyn PinCallback>,
    ) -> OpHandle<PairStage, ()> {
        let this = self;
        let friendly_name = friendly_name.to_string();
        let (reporter, rx) = ProgressReporter::new(PairStage::Scanning);
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            this.run_pair(friendly_name, pin_cb, reporter, task_cancel).await
        });
        OpHandle { progress: rx, cancel, handle }
    }

    async fn run_pair(
        self: Arc<Self>,
        friendly_name: String,
        pin_cb: Arc<dyn PinCallback>,
        reporter: Arc<ProgressReporter<PairStage>>,
        cancel: CancellationToken,
    ) -> Result<()> {
        reporter.set_stage(PairStage::Scanning);
        let mut found = None;
        let this_addr = self.addr;
        self.bt
            .scan_for_combo(10, &mut |addr, name| {
                if addr == this_addr || name == friendly_name.as_str() {
                    found = Some(addr);
                }
            })
            .await?;
        let addr = found.unwrap_or(self.addr);

        reporter.set_stage(PairStage::OpeningSocket);
        let mut socket = match cancellable(&cancel, self.bt.connect_rfcomm(addr)).await {
            Ok(s) => s,
            Err(e) => {
                reporter.set_stage(PairStage::Aborted);
                return Err(e);
            }
        };

        reporter.set_stage(PairStage::ExchangingKeys);
        let result = cancellable(&cancel, pairing::pair(&mut *socket, addr, pin_cb.as_ref())).await;
        let _ = socket.close().await;

        let invariant = match result {
            Ok(i) => i,
            Err(e) => {
                reporter.set_stage(PairStage::Aborted);
                let _ = self.store.delete(addr);
                let _ = self.bt.unpair(addr).await;
                return Err(e);
            }
        };
        reporter.set_stage(PairStage::RequestingId);
        reporter.set_stage(PairStage::Registering);
        if let Err(e) = self.commit_pairing(addr, invariant) {
            reporter.set_stage(PairStage::Aborted);
            let _ = self.bt.unpair(addr).await;
            return Err(e);
        }
        reporter.set_stage(PairStage::Finished);
        info!(%addr, "pairing complete");
        Ok(())
    }

    fn commit_pairing(&self, addr: Addr, invariant: InvariantPumpData) -> Result<()> {
        if self.store.has(addr)? {
            self.store.delete(addr)?;
        }
        self.store.create(addr, invariant)
    }

    /// Opens the RFCOMM connection, runs the transport and application
    /// workers, and performs `CTRL_CONNECT` + `CTRL_BIND` +
    /// `CTRL_ACTIVATE_SERVICE`; starts the RT keep-alive loop when
    /// `initial_mode` is [`ControllerMode::Rt`].
    #[instrument(skip(self), fields(pump.addr = %self.addr))]
    pub fn connect(self: Arc<Self>, initial_mode: ControllerMode) -> OpHandle<ConnectStage, ()> {
        let this = self;
        let (reporter, rx) = ProgressReporter::new(ConnectStage::OpeningSocket);
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let handle = tokio::spawn(async move { this.run_connect(initial_mode, reporter, task_cancel).await });
        OpHandle { progress: rx, cancel, handle }
    }

    async fn run_connect(
        self: Arc<Self>,
        initial_mode: ControllerMode,
        reporter: Arc<ProgressReporter<ConnectStage>>,
        cancel: CancellationToken,
    ) -> Result<()> {
        if !self.store.has(self.addr)? {
            reporter.set_stage(ConnectStage::Aborted);
            return Err(Error::UnknownPump);
        }
        reporter.set_stage(ConnectStage::OpeningSocket);
        let socket = match cancellable(&cancel, self.bt.connect_rfcomm(self.addr)).await {
            Ok(s) => s,
            Err(e) => {
                reporter.set_stage(ConnectStage::Aborted);
                return Err(e);
            }
        };
        let transport = Transport::new(self.addr, Arc::clone(&self.store), socket, self.config.transport_config());
        tokio::spawn(Arc::clone(&transport).run());
        let app = App::new(Arc::clone(&transport));
        tokio::spawn(Arc::clone(&app).run());
        *self.transport.lock().await = Some(Arc::clone(&transport));
        *self.app.lock().await = Some(Arc::clone(&app));

        reporter.set_stage(ConnectStage::Binding);
        if let Err(e) = cancellable(&cancel, self.ctrl_roundtrip(&app, CtrlCommand::Connect, vec![], CtrlCommand::ConnectResponse)).await
            .and(cancellable(&cancel, self.ctrl_roundtrip(&app, CtrlCommand::Bind, vec![], CtrlCommand::BindResponse)).await)
        {
            reporter.set_stage(ConnectStage::Aborted);
            self.teardown().await;
            return Err(e);
        }

        reporter.set_stage(ConnectStage::ActivatingService);
        if let Err(e) = cancellable(&cancel, self.activate(&app, initial_mode)).await {
            reporter.set_stage(ConnectStage::Aborted);
            self.teardown().await;
            return Err(e);
        }
        *self.mode.lock() = Some(initial_mode);

        if initial_mode == ControllerMode::Rt {
            self.start_keep_alive(Arc::clone(&app));
        }
        reporter.set_stage(ConnectStage::Finished);
        info!(pump.addr = %self.addr, ?initial_mode, "connected");
        Ok(())
    }

    async fn activate(&self, app: &App, mode: ControllerMode) -> Result<()> {
        self.ctrl_roundtrip(
            app,
            CtrlCommand::ActivateService,
            vec![u8::from(mode.service())],
            CtrlCommand::ActivateServiceResponse,
        )
        .await
        .map(drop)
    }

    fn start_keep_alive(&self, app: Arc<App>) {
        let cancel = CancellationToken::new();
        let interval = self.config.keep_alive_interval;
        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = task_cancel.cancelled() => return,
                    () = tokio::time::sleep(interval) => {
                        if app.send(ServiceId::RtMode, u8::from(RtCommand::KeepAlive), vec![]).await.is_err() {
                            warn!("RT keep-alive send failed, stopping loop");
                            return;
                        }
                    }
                }
            }
        });
        *self.keep_alive.lock() = Some(cancel);
    }

    fn stop_keep_alive(&self) {
        if let Some(cancel) = self.keep_alive.lock().take() {
            cancel.cancel();
        }
    }

    async fn teardown(&self) {
        self.stop_keep_alive();
        if let Some(transport) = self.transport.lock().await.take() {
            transport.cancellation_token().cancel();
        }
        *self.app.lock().await = None;
        *self.mode.lock() = None;
    }

    /// Deactivates services, sends `CTRL_DISCONNECT`, stops the workers,
    /// and closes the RFCOMM connection. Idempotent.
    #[instrument(skip(self), fields(pump.addr = %self.addr))]
    pub async fn disconnect(&self) -> Result<()> {
        let Some(app) = self.app.lock().await.clone() else {
            return Ok(());
        };
        self.stop_keep_alive();
        let _ = self.ctrl_roundtrip(&app, CtrlCommand::DeactivateAllServices, vec![], CtrlCommand::DeactivateAllServicesResponse).await;
        let _ = app.send(ServiceId::PairingControl, u8::from(CtrlCommand::Disconnect), vec![]).await;
        if let Some(transport) = self.transport.lock().await.take() {
            transport.cancellation_token().cancel();
        }
        *self.app.lock().await = None;
        *self.mode.lock() = None;
        Ok(())
    }

    /// Deactivates the current service and activates `new_mode`; tears
    /// down the transport if either step fails.
    #[instrument(skip(self), fields(pump.addr = %self.addr))]
    pub async fn switch_mode(&self, new_mode: ControllerMode) -> Result<()> {
        let app = self.app_handle().await?;
        let current = *self.mode.lock();
        if current == Some(new_mode) {
            return Ok(());
        }
        self.stop_keep_alive();
        if let Err(e) = self
            .ctrl_roundtrip(&app, CtrlCommand::DeactivateAllServices, vec![], CtrlCommand::DeactivateAllServicesResponse)
            .await
            .and(self.activate(&app, new_mode).await)
        {
            self.teardown().await;
            return Err(e);
        }
        *self.mode.lock() = Some(new_mode);
        if new_mode == ControllerMode::Rt {
            self.start_keep_alive(app);
        }
        Ok(())
    }

    /// Unpairs: deletes the store entry and the OS-level Bluetooth
    /// pairing. Disconnects first if still connected.
    #[instrument(skip(self), fields(pump.addr = %self.addr))]
    pub async fn unpair(&self) -> Result<()> {
        self.disconnect().await?;
        self.store.delete(self.addr)?;
        self.bt.unpair(self.addr).await
    }

    async fn ctrl_roundtrip(
        &self,
        app: &App,
        command: CtrlCommand,
        body: Vec<u8>,
        expect: CtrlCommand,
    ) -> Result<Vec<u8>> {
        let mut rx = app.subscribe(ServiceId::PairingControl, u8::from(expect));
        app.send(ServiceId::PairingControl, u8::from(command), body).await?;
        match tokio::time::timeout(self.config.response_timeout, rx.recv()).await {
            Ok(Some(packet)) => Ok(packet.body),
            Ok(None) => Err(Error::Protocol("control response channel closed".into())),
            Err(_) => Err(Error::Protocol(format!("timed out waiting for {expect}"))),
        }
    }

    async fn cmd_roundtrip(&self, app: &App, command: CmdCommand, body: Vec<u8>, expect: CmdCommand) -> Result<Vec<u8>> {
        let mut rx = app.subscribe(ServiceId::CommandMode, u8::from(expect));
        app.send(ServiceId::CommandMode, u8::from(command), body).await?;
        match tokio::time::timeout(self.config.response_timeout, rx.recv()).await {
            Ok(Some(packet)) => Ok(packet.body),
            Ok(None) => Err(Error::Protocol("command response channel closed".into())),
            Err(_) => Err(Error::Protocol(format!("timed out waiting for {expect}"))),
        }
    }

    /// `CMD_READ_DATETIME`.
    pub async fn read_cmd_datetime(&self) -> Result<PumpDateTime> {
        let app = self.app_handle().await?;
        let body = self.cmd_roundtrip(&app, CmdCommand::ReadDateTime, vec![], CmdCommand::ReadDateTimeResponse).await?;
        if body.len() < 7 {
            return Err(Error::Protocol("READ_DATETIME response too short".into()));
        }
        Ok(PumpDateTime {
            year: u16::from_le_bytes([body[0], body[1]]),
            month: body[2],
            day: body[3],
            hour: body[4],
            minute: body[5],
            second: body[6],
        })
    }

    /// `CMD_READ_PUMP_STATUS`.
    pub async fn read_cmd_pump_status(&self) -> Result<PumpStatus> {
        let app = self.app_handle().await?;
        let body = self.cmd_roundtrip(&app, CmdCommand::ReadPumpStatus, vec![], CmdCommand::ReadPumpStatusResponse).await?;
        if body.len() < 7 {
            return Err(Error::Protocol("READ_PUMP_STATUS response too short".into()));
        }
        Ok(PumpStatus {
            battery_percent: body[0],
            reservoir_tenth_iu: u32::from_le_bytes(body[1..5].try_into().unwrap()),
            active_basal_profile: body[5],
            suspended: body[6] != 0,
        })
    }

    /// `CMD_READ_ERROR_WARNING_STATUS`.
    pub async fn read_cmd_error_warning_status(&self) -> Result<ErrorWarningStatus> {
        let app = self.app_handle().await?;
        let body = self
            .cmd_roundtrip(&app, CmdCommand::ReadErrorWarningStatus, vec![], CmdCommand::ReadErrorWarningStatusResponse)
            .await?;
        if body.len() < 2 {
            return Err(Error::Protocol("READ_ERROR_WARNING_STATUS response too short".into()));
        }
        Ok(ErrorWarningStatus { warnings_pending: body[0], errors_pending: body[1] })
    }

    /// Re-reads pump status and republishes it on [`Self::status_flow`].
    pub async fn update_status(&self) -> Result<PumpStatus> {
        let status = self.read_cmd_pump_status().await?;
        let _ = self.status_tx.send(Some(status));
        Ok(status)
    }

    /// Pages through `CMD_READ_HISTORY_BLOCK`/`CMD_CONFIRM_HISTORY_BLOCK`
    /// until the pump reports the last block, confirming each as it is
    /// consumed, bounded by `max_requests` (must be at least 10).
    pub async fn get_cmd_history_delta(&self, max_requests: u32) -> Result<Vec<HistoryEvent>> {
        if max_requests < 10 {
            return Err(Error::Protocol("max_requests must be at least 10".into()));
        }
        let app = self.app_handle().await?;
        let mut events = Vec::new();
        for block_index in 0..max_requests {
            let body = self
                .cmd_roundtrip(
                    &app,
                    CmdCommand::ReadHistoryBlock,
                    block_index.to_le_bytes().to_vec(),
                    CmdCommand::ReadHistoryBlockResponse,
                )
                .await?;
            if body.is_empty() {
                return Err(Error::Protocol("READ_HISTORY_BLOCK response empty".into()));
            }
            let more = body[0] != 0;
            let count = usize::from(*body.get(1).unwrap_or(&0));
            let records = &body[2..];
            for i in 0..count {
                let start = i * HISTORY_RECORD_LEN;
                let end = start + HISTORY_RECORD_LEN;
                let chunk = records.get(start..end).ok_or_else(|| Error::Protocol("history block truncated".into()))?;
                events.push(HistoryEvent::decode(chunk)?);
            }
            app.send(ServiceId::CommandMode, u8::from(CmdCommand::ConfirmHistoryBlock), block_index.to_le_bytes().to_vec()).await?;
            if !more {
                break;
            }
        }
        Ok(events)
    }

    /// Convenience wrapper over [`Self::get_cmd_history_delta`] that
    /// reports progress per requested block.
    pub fn fetch_tdd_history(self: Arc<Self>, max_requests: u32) -> OpHandle<HistoryStage, Vec<HistoryEvent>> {
        let this = self;
        let (reporter, rx) = ProgressReporter::new(HistoryStage::RequestingBlock(0));
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            let result = cancellable(&task_cancel, this.get_cmd_history_delta(max_requests.max(10))).await;
            reporter.set_stage(if result.is_ok() { HistoryStage::Finished } else { HistoryStage::Aborted });
            result
        });
        OpHandle { progress: rx, cancel, handle }
    }

    /// `CMD_GET_BOLUS_STATUS`.
    pub async fn get_cmd_bolus_status(&self, bolus_id: u16) -> Result<BolusStatus> {
        let app = self.app_handle().await?;
        let body = self
            .cmd_roundtrip(&app, CmdCommand::GetBolusStatus, bolus_id.to_le_bytes().to_vec(), CmdCommand::GetBolusStatusResponse)
            .await?;
        if body.len() < 9 {
            return Err(Error::Protocol("GET_BOLUS_STATUS response too short".into()));
        }
        Ok(BolusStatus {
            delivered_tenth_iu: u32::from_le_bytes(body[0..4].try_into().unwrap()),
            requested_tenth_iu: u32::from_le_bytes(body[4..8].try_into().unwrap()),
            active: body[8] != 0,
        })
    }

    /// Issues `CMD_DELIVER_BOLUS` and returns the pump-assigned bolus id.
    pub async fn deliver_cmd_bolus(&self, tenth_iu: u32, reason: BolusReason) -> Result<u16> {
        let app = self.app_handle().await?;
        let mut body = tenth_iu.to_le_bytes().to_vec();
        body.push(bolus_reason_byte(reason));
        let resp = self.cmd_roundtrip(&app, CmdCommand::DeliverBolus, body, CmdCommand::DeliverBolusResponse).await?;
        if resp.len() < 3 || resp[0] == 0 {
            return Err(Error::Protocol("pump rejected bolus request".into()));
        }
        Ok(u16::from_le_bytes([resp[1], resp[2]]))
    }

    /// Convenience wrapper issuing a [`BolusReason::Standard`] bolus.
    pub async fn deliver_cmd_standard_bolus(&self, tenth_iu: u32) -> Result<u16> {
        self.deliver_cmd_bolus(tenth_iu, BolusReason::Standard).await
    }

    /// `CMD_CANCEL_BOLUS`.
    pub async fn cancel_cmd_bolus(&self, bolus_id: u16) -> Result<()> {
        let app = self.app_handle().await?;
        let resp = self
            .cmd_roundtrip(&app, CmdCommand::CancelBolus, bolus_id.to_le_bytes().to_vec(), CmdCommand::CancelBolusResponse)
            .await?;
        if resp.first() == Some(&0) {
            return Err(Error::Protocol("pump rejected bolus cancellation".into()));
        }
        Ok(())
    }

    /// Validates against `max_bolus_tenth_iu`, issues `CMD_DELIVER_BOLUS`,
    /// and polls `CMD_GET_BOLUS_STATUS` at >=1 Hz reporting progress;
    /// issues `CMD_CANCEL_BOLUS` before returning on cancellation
    ///.
    #[instrument(skip(self), fields(pump.addr = %self.addr))]
    pub fn deliver_bolus(self: Arc<Self>, tenth_iu: u32, reason: BolusReason) -> OpHandle<BolusStage, ()> {
        let this = self;
        let (reporter, rx) = ProgressReporter::new(BolusStage::Validating);
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let handle = tokio::spawn(async move { this.run_deliver_bolus(tenth_iu, reason, reporter, task_cancel).await });
        OpHandle { progress: rx, cancel, handle }
    }

    async fn run_deliver_bolus(
        self: Arc<Self>,
        tenth_iu: u32,
        reason: BolusReason,
        reporter: Arc<ProgressReporter<BolusStage>>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let _lock = self.op_lock.lock().await;
        reporter.set_stage(BolusStage::Validating);
        if tenth_iu == 0 || tenth_iu > self.config.max_bolus_tenth_iu {
            reporter.set_stage(BolusStage::Aborted);
            return Err(Error::Protocol(format!(
                "bolus {tenth_iu} tenth-IU exceeds configured maximum {}",
                self.config.max_bolus_tenth_iu
            )));
        }

        reporter.set_stage(BolusStage::Requesting);
        let bolus_id = match cancellable(&cancel, self.deliver_cmd_bolus(tenth_iu, reason)).await {
            Ok(id) => id,
            Err(e) => {
                reporter.set_stage(BolusStage::Aborted);
                if !matches!(e, Error::Cancelled) {
                    let _ = self.disconnect().await;
                }
                return Err(e);
            }
        };

        reporter.set_stage(BolusStage::Delivering);
        const MAX_CONSECUTIVE_PARSE_FAILURES: u32 = 5;
        let mut consecutive_parse_failures = 0u32;
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    reporter.set_stage(BolusStage::Aborted);
                    let _ = self.cancel_cmd_bolus(bolus_id).await;
                    return Err(Error::Cancelled);
                }
                () = tokio::time::sleep(Duration::from_millis(900)) => {}
            }
            match self.get_cmd_bolus_status(bolus_id).await {
                Ok(status) if !status.active => {
                    reporter.set_stage(BolusStage::Finished);
                    return Ok(());
                }
                Ok(_) => {
                    consecutive_parse_failures = 0;
                    debug!(bolus_id, "bolus still delivering");
                }
                Err(Error::FrameParse(_)) if consecutive_parse_failures < MAX_CONSECUTIVE_PARSE_FAILURES => {
                    consecutive_parse_failures += 1;
                    warn!(bolus_id, consecutive_parse_failures, "transient status parse error, retrying");
                }
                Err(e) => {
                    reporter.set_stage(BolusStage::Aborted);
                    let _ = self.disconnect().await;
                    return Err(e);
                }
            }
        }
    }

    /// Navigates RT to the TBR screens, adjusts percentage and duration
    /// to target, confirms, and verifies the resulting main screen
    /// reflects the new TBR state.
    #[instrument(skip(self), fields(pump.addr = %self.addr))]
    pub fn set_tbr(self: Arc<Self>, percentage: u16, duration_min: u16, kind: TbrKind) -> OpHandle<TbrStage, ()> {
        let this = self;
        let (reporter, rx) = ProgressReporter::new(TbrStage::NavigatingToPercentage);
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let handle = tokio::spawn(async move { this.run_set_tbr(percentage, duration_min, kind, reporter, task_cancel).await });
        OpHandle { progress: rx, cancel, handle }
    }

    async fn run_set_tbr(
        self: Arc<Self>,
        percentage: u16,
        duration_min: u16,
        kind: TbrKind,
        reporter: Arc<ProgressReporter<TbrStage>>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let _lock = self.op_lock.lock().await;
        if percentage > 500 || percentage % 10 != 0 {
            reporter.set_stage(TbrStage::Aborted);
            return Err(Error::Protocol(format!("invalid TBR percentage {percentage}")));
        }
        let is_cancel = percentage == 100 && duration_min == 0;
        if !is_cancel && (duration_min == 0 || duration_min % 15 != 0 || duration_min > 1440) {
            reporter.set_stage(TbrStage::Aborted);
            return Err(Error::Protocol(format!("invalid TBR duration {duration_min}")));
        }

        let result = self.run_set_tbr_inner(percentage, duration_min, &reporter, &cancel).await;
        match &result {
            Ok(()) => {
                reporter.set_stage(TbrStage::Finished);
                let snapshot = if is_cancel {
                    None
                } else {
                    Some(TbrSnapshot { timestamp: 0, percentage, duration_minutes: duration_min, kind })
                };
                let _ = self.store.set_tbr(self.addr, snapshot);
            }
            Err(Error::Cancelled) => {
                reporter.set_stage(TbrStage::Aborted);
                if let Ok(app) = self.app_handle().await {
                    let _ = rt::navigate(&app, menu::find(MenuId::Tbr).unwrap_or(menu::ROOT), menu::ROOT).await;
                }
            }
            Err(_) => {
                reporter.set_stage(TbrStage::Aborted);
                let _ = self.disconnect().await;
            }
        }
        result
    }

    async fn run_set_tbr_inner(
        &self,
        percentage: u16,
        duration_min: u16,
        reporter: &ProgressReporter<TbrStage>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let app = self.app_handle().await?;
        let tbr_node = menu::find(MenuId::Tbr).ok_or_else(|| Error::Protocol("TBR menu node missing".into()))?;

        reporter.set_stage(TbrStage::NavigatingToPercentage);
        cancellable(cancel, rt::navigate(&app, menu::ROOT, tbr_node)).await?;

        let mut rx = app.subscribe(ServiceId::RtMode, u8::from(RtCommand::Display));
        let mut stream = ScreenStream::new(AlertMode::Active, AppDismiss(Arc::clone(&app)), &self.alert_guard)?;

        reporter.set_stage(TbrStage::AdjustingPercentage);
        let current_pct = match cancellable(cancel, next_screen(&mut stream, &mut rx, None)).await? {
            ParsedScreen::TbrPercentage(p) => u32::from(p.unwrap_or(100)),
            other => return Err(Error::Protocol(format!("expected TBR percentage screen, got {other:?}"))),
        };
        let target_pct = u32::from(percentage) / 10;
        let pct_dir = direction(current_pct / 10, target_pct);
        cancellable(cancel, rt::adjust_quantity(Arc::clone(&app), pct_dir, current_pct / 10, target_pct)).await?;
        cancellable(cancel, rt::press_short(&app, ButtonCode::CHECK)).await?;

        reporter.set_stage(TbrStage::NavigatingToDuration);
        let current_dur = match cancellable(cancel, next_screen(&mut stream, &mut rx, None)).await? {
            ParsedScreen::TbrDuration { hours, minutes } => u32::from(hours) * 60 + u32::from(minutes),
            other => return Err(Error::Protocol(format!("expected TBR duration screen, got {other:?}"))),
        };
        reporter.set_stage(TbrStage::AdjustingDuration);
        let target_dur = u32::from(duration_min) / 15;
        let dur_dir = direction(current_dur / 15, target_dur);
        cancellable(cancel, rt::adjust_quantity(Arc::clone(&app), dur_dir, current_dur / 15, target_dur)).await?;

        reporter.set_stage(TbrStage::Confirming);
        cancellable(cancel, rt::press_short(&app, ButtonCode::CHECK)).await?;

        reporter.set_stage(TbrStage::Verifying);
        let expect_active = !(percentage == 100 && duration_min == 0);
        loop {
            match cancellable(cancel, next_screen(&mut stream, &mut rx, None)).await? {
                ParsedScreen::Main(MainScreen::Tbr) if expect_active => return Ok(()),
                ParsedScreen::Main(MainScreen::Normal) if !expect_active => return Ok(()),
                ParsedScreen::Main(_) => return Err(Error::Protocol("TBR did not take effect as expected".into())),
                _ => {}
            }
        }
    }

    /// Navigates to the basal-profile-programming menu, adjusts each of
    /// the 24 hourly factors, confirms, and verifies the basal-rate-total
    /// screen.
    ///
    /// # Panics
    /// Never: `factors` is fixed-size at compile time.
    #[instrument(skip(self, factors), fields(pump.addr = %self.addr))]
    pub fn set_basal_profile(self: Arc<Self>, factors: [u32; 24]) -> OpHandle<BasalProfileStage, ()> {
        let this = self;
        let (reporter, rx) = ProgressReporter::new(BasalProfileStage::Navigating);
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let handle = tokio::spawn(async move { this.run_set_basal_profile(factors, reporter, task_cancel).await });
        OpHandle { progress: rx, cancel, handle }
    }

    async fn run_set_basal_profile(
        self: Arc<Self>,
        factors: [u32; 24],
        reporter: Arc<ProgressReporter<BasalProfileStage>>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let _lock = self.op_lock.lock().await;
        let result = self.run_set_basal_profile_inner(factors, &reporter, &cancel).await;
        match &result {
            Ok(()) => reporter.set_stage(BasalProfileStage::Finished),
            Err(Error::Cancelled) => {
                reporter.set_stage(BasalProfileStage::Aborted);
                if let Ok(app) = self.app_handle().await {
                    let profile_node = menu::find(MenuId::BasalRateProfile(1)).unwrap_or(menu::ROOT);
                    let _ = rt::navigate(&app, profile_node, menu::ROOT).await;
                }
            }
            Err(_) => {
                reporter.set_stage(BasalProfileStage::Aborted);
                let _ = self.disconnect().await;
            }
        }
        result
    }

    async fn run_set_basal_profile_inner(
        &self,
        factors: [u32; 24],
        reporter: &ProgressReporter<BasalProfileStage>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let app = self.app_handle().await?;
        let profile_node = menu::find(MenuId::BasalRateProfile(1)).ok_or_else(|| Error::Protocol("basal profile menu node missing".into()))?;

        reporter.set_stage(BasalProfileStage::Navigating);
        cancellable(cancel, rt::navigate(&app, menu::ROOT, profile_node)).await?;

        let mut rx = app.subscribe(ServiceId::RtMode, u8::from(RtCommand::Display));
        let mut stream = ScreenStream::new(AlertMode::Active, AppDismiss(Arc::clone(&app)), &self.alert_guard)?;

        for (hour, &target_units) in factors.iter().enumerate() {
            reporter.set_stage(BasalProfileStage::AdjustingHour(hour as u8));
            let current_units = match cancellable(cancel, next_screen(&mut stream, &mut rx, None)).await? {
                ParsedScreen::BasalRateFactorSetting { units, .. } => units,
                other => return Err(Error::Protocol(format!("expected basal factor screen, got {other:?}"))),
            };
            let target = target_units / 10;
            let dir = direction(current_units / 10, target);
            cancellable(cancel, rt::adjust_quantity(Arc::clone(&app), dir, current_units / 10, target)).await?;
            cancellable(cancel, rt::press_short(&app, ButtonCode::CHECK)).await?;
        }

        reporter.set_stage(BasalProfileStage::Confirming);
        cancellable(cancel, rt::press_short(&app, ButtonCode::CHECK)).await?;

        reporter.set_stage(BasalProfileStage::Verifying);
        let expected_total: u32 = factors.iter().sum();
        loop {
            match cancellable(cancel, next_screen(&mut stream, &mut rx, None)).await? {
                ParsedScreen::BasalRateTotal(total) if total == expected_total => return Ok(()),
                ParsedScreen::BasalRateTotal(total) => {
                    return Err(Error::Protocol(format!("basal total {total} did not match expected {expected_total}")))
                }
                _ => {}
            }
        }
    }

    /// Navigates to the time-and-date menu and adjusts hour, minute,
    /// year, month, and day in turn, confirming each field before moving
    /// to the next. Each field's screen title is ambiguous across
    /// locales (`"MIN"` resolves to either minute or month), so every
    /// read supplies the matching [`TitleContext`] to disambiguate it.
    #[instrument(skip(self), fields(pump.addr = %self.addr))]
    pub fn set_time_and_date(
        self: Arc<Self>,
        hour: u8,
        minute: u8,
        year: u16,
        month: u8,
        day: u8,
    ) -> OpHandle<TimeAndDateStage, ()> {
        let this = self;
        let (reporter, rx) = ProgressReporter::new(TimeAndDateStage::Navigating);
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            this.run_set_time_and_date(hour, minute, year, month, day, reporter, task_cancel).await
        });
        OpHandle { progress: rx, cancel, handle }
    }

    async fn run_set_time_and_date(
        self: Arc<Self>,
        hour: u8,
        minute: u8,
        year: u16,
        month: u8,
        day: u8,
        reporter: Arc<ProgressReporter<TimeAndDateStage>>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let _lock = self.op_lock.lock().await;
        let result = self
            .run_set_time_and_date_inner(hour, minute, year, month, day, &reporter, &cancel)
            .await;
        match &result {
            Ok(()) => reporter.set_stage(TimeAndDateStage::Finished),
            Err(Error::Cancelled) => {
                reporter.set_stage(TimeAndDateStage::Aborted);
                if let Ok(app) = self.app_handle().await {
                    let time_node = menu::find(MenuId::Time).unwrap_or(menu::ROOT);
                    let _ = rt::navigate(&app, time_node, menu::ROOT).await;
                }
            }
            Err(_) => {
                reporter.set_stage(TimeAndDateStage::Aborted);
                let _ = self.disconnect().await;
            }
        }
        result
    }

    async fn run_set_time_and_date_inner(
        &self,
        hour: u8,
        minute: u8,
        year: u16,
        month: u8,
        day: u8,
        reporter: &ProgressReporter<TimeAndDateStage>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let app = self.app_handle().await?;
        let time_node = menu::find(MenuId::Time).ok_or_else(|| Error::Protocol("time menu node missing".into()))?;

        reporter.set_stage(TimeAndDateStage::Navigating);
        cancellable(cancel, rt::navigate(&app, menu::ROOT, time_node)).await?;

        let mut rx = app.subscribe(ServiceId::RtMode, u8::from(RtCommand::Display));
        let mut stream = ScreenStream::new(AlertMode::Active, AppDismiss(Arc::clone(&app)), &self.alert_guard)?;

        reporter.set_stage(TimeAndDateStage::AdjustingHour);
        let current_hour = match cancellable(cancel, next_screen(&mut stream, &mut rx, Some(TitleContext::SettingHour))).await? {
            ParsedScreen::TimeAndDateHour(h) => u32::from(h),
            other => return Err(Error::Protocol(format!("expected hour screen, got {other:?}"))),
        };
        let dir = direction(current_hour, u32::from(hour));
        cancellable(cancel, rt::adjust_quantity(Arc::clone(&app), dir, current_hour, u32::from(hour))).await?;
        cancellable(cancel, rt::press_short(&app, ButtonCode::CHECK)).await?;

        reporter.set_stage(TimeAndDateStage::AdjustingMinute);
        let current_minute = match cancellable(cancel, next_screen(&mut stream, &mut rx, Some(TitleContext::SettingMinute))).await? {
            ParsedScreen::TimeAndDateMinute(m) => u32::from(m),
            other => return Err(Error::Protocol(format!("expected minute screen, got {other:?}"))),
        };
        let dir = direction(current_minute, u32::from(minute));
        cancellable(cancel, rt::adjust_quantity(Arc::clone(&app), dir, current_minute, u32::from(minute))).await?;
        cancellable(cancel, rt::press_short(&app, ButtonCode::CHECK)).await?;

        reporter.set_stage(TimeAndDateStage::AdjustingYear);
        let current_year = match cancellable(cancel, next_screen(&mut stream, &mut rx, Some(TitleContext::SettingYear))).await? {
            ParsedScreen::TimeAndDateYear(y) => u32::from(y),
            other => return Err(Error::Protocol(format!("expected year screen, got {other:?}"))),
        };
        let dir = direction(current_year, u32::from(year));
        cancellable(cancel, rt::adjust_quantity(Arc::clone(&app), dir, current_year, u32::from(year))).await?;
        cancellable(cancel, rt::press_short(&app, ButtonCode::CHECK)).await?;

        reporter.set_stage(TimeAndDateStage::AdjustingMonth);
        let current_month = match cancellable(cancel, next_screen(&mut stream, &mut rx, Some(TitleContext::SettingMonth))).await? {
            ParsedScreen::TimeAndDateMonth(m) => u32::from(m),
            other => return Err(Error::Protocol(format!("expected month screen, got {other:?}"))),
        };
        let dir = direction(current_month, u32::from(month));
        cancellable(cancel, rt::adjust_quantity(Arc::clone(&app), dir, current_month, u32::from(month))).await?;
        cancellable(cancel, rt::press_short(&app, ButtonCode::CHECK)).await?;

        reporter.set_stage(TimeAndDateStage::AdjustingDay);
        let current_day = match cancellable(cancel, next_screen(&mut stream, &mut rx, Some(TitleContext::SettingDay))).await? {
            ParsedScreen::TimeAndDateDay(d) => u32::from(d),
            other => return Err(Error::Protocol(format!("expected day screen, got {other:?}"))),
        };
        let dir = direction(current_day, u32::from(day));
        cancellable(cancel, rt::adjust_quantity(Arc::clone(&app), dir, current_day, u32::from(day))).await?;

        reporter.set_stage(TimeAndDateStage::Confirming);
        cancellable(cancel, rt::press_short(&app, ButtonCode::CHECK)).await?;
        cancellable(cancel, rt::navigate(&app, time_node, menu::ROOT)).await?;
        Ok(())
    }
}

/// Picks the button direction that moves `current` toward `target`;
/// `UP` when they're already equal, since [`rt::adjust_quantity`] is a
/// no-op in that case regardless of which direction is passed.
fn direction(current: u32, target: u32) -> ButtonCode {
    match target.cmp(&current) {
        std::cmp::Ordering::Less => ButtonCode::DOWN,
        std::cmp::Ordering::Equal | std::cmp::Ordering::Greater => ButtonCode::UP,
    }
}

/// `CMD_DELIVER_BOLUS`'s single-byte reason-code encoding.
const fn bolus_reason_byte(reason: BolusReason) -> u8 {
    match reason {
        BolusReason::Standard => 0,
        BolusReason::Correction => 1,
        BolusReason::Meal => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pump_config_defaults_match_spec_constants() {
        let cfg = PumpConfig::default();
        assert_eq!(cfg.ack_timeout, Duration::from_millis(1500));
        assert_eq!(cfg.max_retries, 3);
        assert_eq!(cfg.keep_alive_interval, Duration::from_secs(1));
        assert_eq!(cfg.mac_failure_threshold, 3);
    }

    #[test]
    fn history_event_round_trips_bolus() {
        let mut bytes = vec![0u8; HISTORY_RECORD_LEN];
        bytes[0] = 0;
        bytes[1..9].copy_from_slice(&42i64.to_le_bytes());
        bytes[9..13].copy_from_slice(&375u32.to_le_bytes());
        let event = HistoryEvent::decode(&bytes).unwrap();
        assert_eq!(event, HistoryEvent::Bolus { timestamp: 42, amount_tenth_iu: 375 });
    }

    #[test]
    fn history_event_round_trips_tbr() {
        let mut bytes = vec![0u8; HISTORY_RECORD_LEN];
        bytes[0] = 1;
        bytes[1..9].copy_from_slice(&7i64.to_le_bytes());
        bytes[9..11].copy_from_slice(&150u16.to_le_bytes());
        bytes[11..13].copy_from_slice(&30u16.to_le_bytes());
        let event = HistoryEvent::decode(&bytes).unwrap();
        assert_eq!(event, HistoryEvent::Tbr { timestamp: 7, percentage: 150, duration_minutes: 30 });
    }

    #[test]
    fn history_event_rejects_unknown_kind() {
        let mut bytes = vec![0u8; HISTORY_RECORD_LEN];
        bytes[0] = 9;
        assert!(HistoryEvent::decode(&bytes).is_err());
    }

    #[test]
    fn progress_stage_ordinals_are_monotonic_with_hour_index() {
        assert!(BasalProfileStage::AdjustingHour(0).ordinal() < BasalProfileStage::AdjustingHour(23).ordinal());
        assert!(BasalProfileStage::AdjustingHour(23).ordinal() < BasalProfileStage::Confirming.ordinal());
    }
}
