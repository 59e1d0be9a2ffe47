//! Per-controller GATT session.
//!
//! Each discovered controller gets one session which owns the full
//! connection lifecycle: the connect/retry handshake, characteristic
//! binding, notification decoding and the watchdog that revives a silent
//! stream. The session's background worker is the only place blocking GATT
//! sequences run; notification handling stays on the decode-fuse-publish
//! fast path.

use std::future::Future;
use std::sync::Mutex as StdMutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use bluest::{Adapter, Characteristic, ConnectionEvent, Device};
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, sleep};
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::commands::{CommandExecutor, GattCommandSender};
use crate::core::bluetooth::constants::{
    CONNECT_RETRY_DELAY, DATA_STALE_AFTER, KICKSTART_COOLDOWN, UUID_CONTROLLER_NOTIFY_CHAR,
    UUID_CONTROLLER_SERVICE, UUID_CONTROLLER_WRITE_CHAR, WATCHDOG_TICK,
};
use crate::core::bluetooth::decoder;
use crate::core::controller::{Controller, ControllerAddress, TrackingSnapshot};
use crate::core::fusion::OrientationFilter;
use crate::transmit::SnapshotSender;

/// Connection bookkeeping shared between the session worker and the
/// asynchronous GATT callbacks.
///
/// Each flag has a single logical owner per transition: the worker raises
/// `connecting`, the connect sequence alone raises `connected`, and either
/// the watchdog or the link watcher may lower `connected` (idempotent,
/// last-write-wins).
pub(crate) struct SessionState {
    connected: AtomicBool,
    want_connected: AtomicBool,
    connecting: AtomicBool,
    last_data: StdMutex<Option<Instant>>,
    last_kickstart: StdMutex<Option<Instant>>,
}

impl SessionState {
    pub(crate) fn new() -> Self {
        Self {
            connected: AtomicBool::new(false),
            want_connected: AtomicBool::new(false),
            connecting: AtomicBool::new(false),
            last_data: StdMutex::new(None),
            last_kickstart: StdMutex::new(None),
        }
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub(crate) fn want_connect(&self) {
        self.want_connected.store(true, Ordering::SeqCst);
    }

    pub(crate) fn should_connect(&self) -> bool {
        !self.connected.load(Ordering::SeqCst)
            && self.want_connected.load(Ordering::SeqCst)
            && !self.connecting.load(Ordering::SeqCst)
    }

    /// A connected controller whose stream went stale needs a kickstart,
    /// rate-limited by the cooldown.
    pub(crate) fn should_kickstart(&self, stale_after: Duration, cooldown: Duration) -> bool {
        if !self.connected.load(Ordering::SeqCst) {
            return false;
        }
        let stale = self
            .last_data
            .lock()
            .unwrap()
            .is_none_or(|at| at.elapsed() > stale_after);
        let cooled = self
            .last_kickstart
            .lock()
            .unwrap()
            .is_none_or(|at| at.elapsed() > cooldown);
        stale && cooled
    }

    pub(crate) fn mark_connected(&self) {
        self.connected.store(true, Ordering::SeqCst);
        self.mark_data_received();
    }

    pub(crate) fn mark_data_received(&self) {
        *self.last_data.lock().unwrap() = Some(Instant::now());
    }

    pub(crate) fn mark_kickstarted(&self) {
        *self.last_kickstart.lock().unwrap() = Some(Instant::now());
    }

    #[cfg(test)]
    pub(crate) fn last_data_received(&self) -> Option<Instant> {
        *self.last_data.lock().unwrap()
    }

    /// Lowers the connected flag, reporting whether this call was the one
    /// that lowered it. Makes concurrent disconnect signals idempotent.
    pub(crate) fn begin_disconnect(&self) -> bool {
        self.connected.swap(false, Ordering::SeqCst)
    }
}

/// GATT resources owned exclusively by a connected session
struct GattHandles {
    notify_char: Characteristic,
    write_char: Characteristic,
    link_cancel: CancellationToken,
    notify_task: JoinHandle<()>,
    events_task: JoinHandle<()>,
}

impl GattHandles {
    fn release(self) {
        self.link_cancel.cancel();
        self.notify_task.abort();
        self.events_task.abort();
        drop(self.notify_char);
    }
}

struct SessionInner {
    address: ControllerAddress,
    display_name: String,
    adapter: Adapter,
    device: Device,
    state: SessionState,
    /// Process-wide serialization of radio-level connect sequences
    radio_lock: Arc<Mutex<()>>,
    handles: Mutex<Option<GattHandles>>,
    fusion: StdMutex<OrientationFilter>,
    latest: StdMutex<TrackingSnapshot>,
    snapshots: SnapshotSender,
    cancel: CancellationToken,
}

/// One tracked Gear VR controller.
///
/// Construction spawns the session's watchdog worker; [`Controller::initialize`]
/// flags the intent to connect and the worker does the rest.
pub struct GearVrController {
    inner: Arc<SessionInner>,
    watchdog: StdMutex<Option<JoinHandle<()>>>,
}

impl GearVrController {
    pub fn new(
        adapter: Adapter,
        device: Device,
        display_name: String,
        address: ControllerAddress,
        radio_lock: Arc<Mutex<()>>,
        snapshots: SnapshotSender,
    ) -> Self {
        let inner = Arc::new(SessionInner {
            address,
            display_name,
            adapter,
            device,
            state: SessionState::new(),
            radio_lock,
            handles: Mutex::new(None),
            fusion: StdMutex::new(OrientationFilter::new()),
            latest: StdMutex::new(TrackingSnapshot::default()),
            snapshots,
            cancel: CancellationToken::new(),
        });

        let watchdog = tokio::spawn(inner.clone().watchdog_loop());

        Self {
            inner,
            watchdog: StdMutex::new(Some(watchdog)),
        }
    }
}

#[async_trait]
impl Controller for GearVrController {
    fn address(&self) -> ControllerAddress {
        self.inner.address
    }

    fn display_name(&self) -> &str {
        &self.inner.display_name
    }

    fn is_connected(&self) -> bool {
        self.inner.state.is_connected()
    }

    fn latest_snapshot(&self) -> TrackingSnapshot {
        *self.inner.latest.lock().unwrap()
    }

    fn initialize(&self) {
        info!("[{}] Initialized - will connect", self.inner.display_name);
        self.inner.state.want_connect();
    }

    async fn shutdown(&self) {
        self.inner
            .state
            .want_connected
            .store(false, Ordering::SeqCst);
        self.inner.cancel.cancel();

        let watchdog = self.watchdog.lock().unwrap().take();
        if let Some(watchdog) = watchdog {
            if let Err(e) = watchdog.await {
                if !e.is_cancelled() {
                    error!("[{}] Watchdog ended abnormally: {e}", self.inner.display_name);
                }
            }
        }

        self.inner.disconnect().await;
    }
}

impl SessionInner {
    /// Long-lived per-session worker: drives connect/retry while the
    /// session wants a connection, and revives a connected-but-silent
    /// stream with a kickstart.
    async fn watchdog_loop(self: Arc<Self>) {
        debug!("[{}] Watchdog started", self.display_name);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = sleep(WATCHDOG_TICK) => {}
            }

            if self.state.should_connect() {
                self.connect_until_ready().await;
            }

            if self.state.should_kickstart(DATA_STALE_AFTER, KICKSTART_COOLDOWN) {
                self.kickstart_stream().await;
            }
        }

        debug!("[{}] Watchdog stopped", self.display_name);
    }

    /// Connect sequence: serialized process-wide, retried with a fixed
    /// back-off until it succeeds or the session is torn down.
    async fn connect_until_ready(self: &Arc<Self>) {
        if self.state.connecting.swap(true, Ordering::SeqCst) {
            // an attempt is already in flight
            return;
        }

        let _radio = self.radio_lock.lock().await;

        info!("[{}] Trying to connect until success", self.display_name);
        let this = self.clone();
        let connected = retry_with_backoff(&self.cancel, CONNECT_RETRY_DELAY, move || {
            let this = this.clone();
            async move {
                this.try_connect()
                    .await
                    .inspect_err(|e| warn!("[{}] Connection attempt failed: {e:#}", this.display_name))
            }
        })
        .await;

        if connected {
            self.state.mark_connected();
            info!("[{}] -> Connected", self.display_name);
        }
        self.state.connecting.store(false, Ordering::SeqCst);
    }

    /// One connect attempt: fresh link, service and characteristic
    /// resolution, subscription, kickstart. Any failure leaves no bound
    /// resources behind.
    async fn try_connect(self: &Arc<Self>) -> Result<()> {
        self.release_gatt().await;

        if !self.device.is_connected().await {
            info!("[{}] Opening link to {}", self.display_name, self.address);
            self.adapter.connect_device(&self.device).await?;
        }

        let link_cancel = self.cancel.child_token();
        let events_task = tokio::spawn(Self::watch_link(self.clone(), link_cancel.clone()));

        match self.bind_and_start(&link_cancel).await {
            Ok((notify_char, write_char, notify_task)) => {
                *self.handles.lock().await = Some(GattHandles {
                    notify_char,
                    write_char,
                    link_cancel,
                    notify_task,
                    events_task,
                });
                Ok(())
            }
            Err(e) => {
                link_cancel.cancel();
                events_task.abort();
                Err(e)
            }
        }
    }

    /// Resolves the controller service and characteristics, subscribes and
    /// kickstarts the stream.
    async fn bind_and_start(
        self: &Arc<Self>,
        link_cancel: &CancellationToken,
    ) -> Result<(Characteristic, Characteristic, JoinHandle<()>)> {
        let services = self.device.services().await?;
        let service = services
            .iter()
            .find(|s| s.uuid() == UUID_CONTROLLER_SERVICE)
            .ok_or_else(|| anyhow!("controller service {UUID_CONTROLLER_SERVICE} not found"))?
            .clone();

        let mut notify_char = None;
        let mut write_char = None;
        for characteristic in service.characteristics().await? {
            let uuid = characteristic.uuid();
            if uuid == UUID_CONTROLLER_NOTIFY_CHAR {
                notify_char = Some(characteristic);
            } else if uuid == UUID_CONTROLLER_WRITE_CHAR {
                write_char = Some(characteristic);
            }
        }
        let notify_char = notify_char
            .ok_or_else(|| anyhow!("notify characteristic {UUID_CONTROLLER_NOTIFY_CHAR} not found"))?;
        let write_char = write_char
            .ok_or_else(|| anyhow!("write characteristic {UUID_CONTROLLER_WRITE_CHAR} not found"))?;

        let notify_task = self
            .subscribe_notifications(notify_char.clone(), link_cancel.clone())
            .await?;

        let executor = CommandExecutor::new(GattCommandSender::new(write_char.clone()));
        if let Err(e) = executor.kickstart().await {
            notify_task.abort();
            return Err(e);
        }
        self.state.mark_kickstarted();

        Ok((notify_char, write_char, notify_task))
    }

    /// Subscribes to the notify characteristic and spawns the task that
    /// drains its stream. Subscription failures surface to the connect
    /// attempt; stream processing failures only end the task.
    async fn subscribe_notifications(
        self: &Arc<Self>,
        notify_char: Characteristic,
        cancel: CancellationToken,
    ) -> Result<JoinHandle<()>> {
        let (ready_tx, ready_rx) = oneshot::channel::<Result<(), bluest::Error>>();
        let inner = self.clone();

        let task = tokio::spawn(async move {
            let mut notifications = match notify_char.notify().await {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    stream
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };

            info!("[{}] Listening for telemetry notifications", inner.display_name);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    result = notifications.next() => match result {
                        Some(Ok(value)) => inner.handle_notification(&value),
                        Some(Err(e)) => {
                            error!("[{}] Notification stream error: {e}", inner.display_name);
                            break;
                        }
                        None => {
                            info!("[{}] Notification stream ended", inner.display_name);
                            break;
                        }
                    }
                }
            }
        });

        ready_rx
            .await
            .map_err(|_| anyhow!("notification task exited before subscribing"))??;
        Ok(task)
    }

    /// Watches the link for status changes reported by the BLE stack.
    async fn watch_link(inner: Arc<Self>, cancel: CancellationToken) {
        let mut events = match inner.adapter.device_connection_events(&inner.device).await {
            Ok(events) => events,
            Err(e) => {
                warn!("[{}] Could not watch connection events: {e}", inner.display_name);
                return;
            }
        };

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.next() => match event {
                    Some(ConnectionEvent::Connected) => {
                        debug!("[{}] Link reported up", inner.display_name);
                    }
                    Some(ConnectionEvent::Disconnected) => {
                        warn!("[{}] Link reported down", inner.display_name);
                        // drops mid-handshake are the connect sequence's own
                        // failure to notice; established sessions clean up here.
                        // Cleanup runs on its own task: releasing the handles
                        // aborts this watcher.
                        if !inner.state.connecting.load(Ordering::SeqCst)
                            && inner.state.is_connected()
                        {
                            let session = inner.clone();
                            tokio::spawn(async move { session.disconnect().await });
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    /// Telemetry fast path, invoked once per notification.
    fn handle_notification(&self, data: &[u8]) {
        self.state.mark_data_received();
        // data flowing means we are connected even if the handshake's own
        // bookkeeping has not caught up yet
        self.state.connected.store(true, Ordering::SeqCst);

        let telemetry = match decoder::decode(data) {
            Ok(telemetry) => telemetry,
            Err(e) => {
                debug!("[{}] Dropping notification: {e}", self.display_name);
                return;
            }
        };

        let quaternion = self
            .fusion
            .lock()
            .unwrap()
            .update(&telemetry.sample.gyro, &telemetry.sample.accel);

        let snapshot = TrackingSnapshot {
            quaternion,
            touchpad_x: telemetry.touchpad_x,
            touchpad_y: telemetry.touchpad_y,
            touchpad_pressed: telemetry.touchpad_pressed,
            buttons: telemetry.buttons,
        };

        *self.latest.lock().unwrap() = snapshot;
        self.snapshots.publish(&self.display_name, snapshot);
    }

    /// Re-issues the kickstart pair to a controller that stopped streaming
    /// without dropping the link.
    async fn kickstart_stream(&self) {
        let write_char = self
            .handles
            .lock()
            .await
            .as_ref()
            .map(|h| h.write_char.clone());

        if let Some(write_char) = write_char {
            info!("[{}] Stream went silent - kickstarting", self.display_name);
            let executor = CommandExecutor::new(GattCommandSender::new(write_char));
            if let Err(e) = executor.kickstart().await {
                warn!("[{}] Kickstart failed: {e:#}", self.display_name);
            }
        }

        self.state.mark_kickstarted();
    }

    /// Drops any previously bound GATT resources without touching the
    /// peripheral. Used at the top of every connect attempt.
    async fn release_gatt(&self) {
        if let Some(handles) = self.handles.lock().await.take() {
            debug!("[{}] Releasing previous GATT handles", self.display_name);
            handles.release();
        }
    }

    /// Disconnect path shared by explicit teardown and link-drop events:
    /// best-effort power-off, then release everything. Safe to call twice.
    async fn disconnect(&self) {
        let was_connected = self.state.begin_disconnect();
        let handles = self.handles.lock().await.take();

        let Some(handles) = handles else {
            return;
        };

        if was_connected {
            let executor = CommandExecutor::new(GattCommandSender::new(handles.write_char.clone()));
            if let Err(e) = executor.power_off().await {
                debug!(
                    "[{}] Power-off on disconnect failed (ignored): {e:#}",
                    self.display_name
                );
            }
        }

        handles.release();

        if let Err(e) = self.adapter.disconnect_device(&self.device).await {
            debug!("[{}] Releasing link failed: {e}", self.display_name);
        }
        info!("[{}] Disconnected", self.display_name);
    }
}

/// Runs `attempt` until it succeeds, waiting `delay` between failures.
/// Returns false if cancelled first; cancellation is honored between
/// attempts so teardown stays prompt.
pub(crate) async fn retry_with_backoff<F, Fut>(
    cancel: &CancellationToken,
    delay: Duration,
    mut attempt: F,
) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    loop {
        if cancel.is_cancelled() {
            return false;
        }

        if attempt().await.is_ok() {
            return true;
        }

        tokio::select! {
            _ = cancel.cancelled() => return false,
            _ = sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use tokio::time::advance;

    #[tokio::test]
    async fn idle_session_does_not_want_a_connection() {
        let state = SessionState::new();
        assert!(!state.should_connect());

        state.want_connect();
        assert!(state.should_connect());
    }

    #[tokio::test]
    async fn connecting_flag_suppresses_further_attempts() {
        let state = SessionState::new();
        state.want_connect();
        assert!(!state.connecting.swap(true, Ordering::SeqCst));
        assert!(!state.should_connect());

        state.connecting.store(false, Ordering::SeqCst);
        assert!(state.should_connect());
    }

    #[tokio::test(start_paused = true)]
    async fn kickstart_needs_stale_data_and_cooled_down_kickstart() {
        let state = SessionState::new();

        // not connected: never kickstart
        assert!(!state.should_kickstart(DATA_STALE_AFTER, KICKSTART_COOLDOWN));

        state.mark_connected();
        assert!(!state.should_kickstart(DATA_STALE_AFTER, KICKSTART_COOLDOWN));

        // data goes stale
        advance(Duration::from_millis(250)).await;
        assert!(state.should_kickstart(DATA_STALE_AFTER, KICKSTART_COOLDOWN));

        // a kickstart starts the cooldown
        state.mark_kickstarted();
        assert!(!state.should_kickstart(DATA_STALE_AFTER, KICKSTART_COOLDOWN));

        advance(Duration::from_millis(3100)).await;
        assert!(state.should_kickstart(DATA_STALE_AFTER, KICKSTART_COOLDOWN));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_attempts_retry_until_success() {
        let cancel = CancellationToken::new();
        let attempts = Arc::new(AtomicU32::new(0));

        let counter = attempts.clone();
        let connected = retry_with_backoff(&cancel, CONNECT_RETRY_DELAY, move || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 3 {
                    Err(anyhow!("radio said no"))
                } else {
                    Ok(())
                }
            }
        })
        .await;

        assert!(connected);
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_stop_when_cancelled() {
        let cancel = CancellationToken::new();
        let attempts = Arc::new(AtomicU32::new(0));

        let counter = attempts.clone();
        let stop = cancel.clone();
        let connected = retry_with_backoff(&cancel, CONNECT_RETRY_DELAY, move || {
            let counter = counter.clone();
            let stop = stop.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 1 {
                    stop.cancel();
                }
                Err(anyhow!("still failing"))
            }
        })
        .await;

        assert!(!connected);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn connect_success_records_data_time() {
        let state = SessionState::new();
        state.want_connect();

        let before = Instant::now();
        state.mark_connected();

        assert!(state.is_connected());
        assert!(!state.should_connect());
        let at = state.last_data_received().expect("data time set");
        assert!(at >= before);
    }

    #[tokio::test]
    async fn double_disconnect_only_reports_connected_once() {
        let state = SessionState::new();
        state.mark_connected();

        assert!(state.begin_disconnect());
        assert!(!state.begin_disconnect());
        assert!(!state.is_connected());
    }
}
