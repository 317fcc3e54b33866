use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep, timeout, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::session::Control;
use super::{poll_reports, Response, StationSnapshot, StationState};
use crate::core::{Error, Result, StationAddress};
use crate::protocol::{
    Command, Failsafe, MeterReport, Report, Rfid, StateReport, StationInfo,
};

/// How long `set_charging_power` waits for an enabled station to start charging
const CHARGING_START_TIMEOUT: Duration = Duration::from_secs(10);

/// Highest charging power accepted by `set_charging_power`, in kW
const MAX_CHARGING_POWER: f64 = 44.0;

/// Handle to a station session
///
/// Cheap to clone; every clone talks to the same session task.
#[derive(Debug, Clone)]
pub struct Station {
    address: StationAddress,
    control: mpsc::Sender<Control>,
    snapshot: watch::Receiver<StationSnapshot>,
    cancel: CancellationToken,
    fast_poll_interval: Duration,
}

impl Station {
    pub(super) fn new(
        address: StationAddress,
        control: mpsc::Sender<Control>,
        snapshot: watch::Receiver<StationSnapshot>,
        cancel: CancellationToken,
        fast_poll_interval: Duration,
    ) -> Self {
        Station {
            address,
            control,
            snapshot,
            cancel,
            fast_poll_interval,
        }
    }

    pub fn address(&self) -> StationAddress {
        self.address
    }

    /// Latest published view of the session
    pub fn snapshot(&self) -> StationSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Receiver that changes whenever the session publishes
    pub fn watch(&self) -> watch::Receiver<StationSnapshot> {
        self.snapshot.clone()
    }

    pub fn state(&self) -> StationState {
        self.snapshot.borrow().state
    }

    pub fn info(&self) -> Option<StationInfo> {
        self.snapshot.borrow().info.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.control.is_closed()
    }

    pub(crate) fn close(&self) {
        self.cancel.cancel();
    }

    /// Waits until a published snapshot satisfies `predicate`
    pub async fn wait_for<F>(&self, within: Duration, mut predicate: F) -> Option<StationSnapshot>
    where
        F: FnMut(&StationSnapshot) -> bool,
    {
        let mut rx = self.snapshot.clone();
        let found = match timeout(within, rx.wait_for(|snapshot| predicate(snapshot))).await {
            Ok(Ok(snapshot)) => Some(snapshot.clone()),
            _ => None,
        };
        found
    }

    fn closed(&self) -> Error {
        Error::cancelled(format!("session for {} is closed", self.address))
    }

    fn check_supported(&self, command: &Command) -> Result<()> {
        let snapshot = self.snapshot.borrow();
        match &snapshot.info {
            Some(info) if !info.supports(command) => Err(Error::unsupported(format!(
                "`{}` is not available on {} {}",
                command.keyword(),
                info.manufacturer,
                info.model
            ))),
            _ => Ok(()),
        }
    }

    /// Queues a command and waits for its resolution
    ///
    /// Parameters and model support are checked before anything is queued.
    pub async fn send(&self, command: Command) -> Result<Response> {
        command.validate()?;
        self.check_supported(&command)?;
        if self.cancel.is_cancelled() {
            return Err(self.closed());
        }

        let (reply, outcome) = oneshot::channel();
        self.control
            .send(Control::Submit {
                command,
                reply: Some(reply),
            })
            .await
            .map_err(|_| self.closed())?;
        outcome.await.map_err(|_| self.closed())?
    }

    /// Queues a command nobody waits for
    pub(crate) fn submit_detached(&self, command: Command) -> Result<()> {
        self.control
            .try_send(Control::Submit {
                command,
                reply: None,
            })
            .map_err(|_| Error::transport(format!("control queue of {} unavailable", self.address)))
    }

    /// Registers a callback run after every report, push update or state change
    pub async fn subscribe<F>(&self, callback: F) -> Result<()>
    where
        F: Fn(&StationSnapshot) + Send + Sync + 'static,
    {
        self.control
            .send(Control::Subscribe(Arc::new(callback)))
            .await
            .map_err(|_| self.closed())
    }

    /// Switches periodic data polling on or off
    pub async fn set_polling(&self, enabled: bool) -> Result<()> {
        self.control
            .send(Control::SetPolling(enabled))
            .await
            .map_err(|_| self.closed())
    }

    async fn command(&self, command: Command) -> Result<()> {
        self.send(command).await.map(|_| ())
    }

    /// Requests a report and returns it
    pub async fn report(&self, number: u16) -> Result<Report> {
        match self.send(Command::report(number)?).await? {
            Response::Report(report) => Ok(report),
            other => Err(Error::invalid_state(format!(
                "report {} answered with {:?}",
                number, other
            ))),
        }
    }

    pub async fn state_report(&self) -> Result<StateReport> {
        match self.report(2).await? {
            Report::State(report) => Ok(report),
            other => Err(Error::invalid_state(format!("expected report 2, got {}", other.number()))),
        }
    }

    pub async fn meter_report(&self) -> Result<MeterReport> {
        match self.report(3).await? {
            Report::Meter(report) => Ok(report),
            other => Err(Error::invalid_state(format!("expected report 3, got {}", other.number()))),
        }
    }

    /// Firmware text as answered to `i`
    pub async fn identify(&self) -> Result<String> {
        match self.send(Command::Identify).await? {
            Response::Identity(firmware) => Ok(firmware),
            other => Err(Error::invalid_state(format!("`i` answered with {:?}", other))),
        }
    }

    /// Requests report 2, plus 3 and 100 where the model has them
    pub async fn request_data(&self) -> Result<()> {
        for number in poll_reports(self.info().as_ref()) {
            self.command(Command::Report(number)).await?;
        }
        Ok(())
    }

    pub async fn set_ena(&self, enabled: bool) -> Result<()> {
        self.command(Command::Enable(enabled)).await
    }

    pub async fn enable(&self) -> Result<()> {
        self.set_ena(true).await
    }

    /// `ena 0`; the session then holds further commands for the disable quiet period
    pub async fn disable(&self) -> Result<()> {
        self.set_ena(false).await
    }

    /// Permanent current limit in A; 0 stops charging
    pub async fn set_current(&self, amps: f64) -> Result<()> {
        self.command(Command::set_current(amps)?).await
    }

    /// Current limit applied after `delay_secs`; P20 stations get a permanent `curr` instead
    pub async fn set_current_timed(&self, amps: f64, delay_secs: u32) -> Result<()> {
        if let Some(info) = self.info() {
            if !info.supports_current_timer() {
                warn!("{} does not support currtime, delay ignored", info.model);
                return self.set_current(amps).await;
            }
        }
        self.command(Command::set_current_timed(amps, delay_secs)?).await
    }

    /// Energy limit in kWh; 0 removes it
    pub async fn set_energy(&self, kwh: f64) -> Result<()> {
        self.command(Command::set_energy(kwh)?).await
    }

    /// Output X1: 0, 1, or 10 to 150 pulses per kWh
    pub async fn set_output(&self, value: u8) -> Result<()> {
        self.command(Command::SetOutput(value)).await
    }

    pub async fn set_failsafe(&self, timeout_secs: u32, fallback_amps: f64, persist: bool) -> Result<()> {
        self.command(Command::failsafe(timeout_secs, fallback_amps, persist)?)
            .await
    }

    pub async fn disable_failsafe(&self, persist: bool) -> Result<()> {
        self.command(Command::SetFailsafe(Failsafe::disabled(persist)))
            .await
    }

    /// Enables the station, then authorizes charging, optionally for an RFID tag
    pub async fn start(&self, rfid: Option<Rfid>) -> Result<()> {
        let command = Command::Start(rfid);
        command.validate()?;
        self.check_supported(&command)?;
        self.set_ena(true).await?;
        self.command(command).await
    }

    pub async fn stop(&self, tag: Option<String>) -> Result<()> {
        self.command(Command::Stop(tag)).await
    }

    /// Shows a text on the display for `min_secs` to `max_secs`
    pub async fn display(&self, text: &str, min_secs: u32, max_secs: u32) -> Result<()> {
        self.command(Command::display(text, min_secs, max_secs)?)
            .await
    }

    /// Unlocks the socket; the station must be disabled first
    pub async fn unlock(&self) -> Result<()> {
        self.command(Command::Unlock).await
    }

    /// Phase switch source: 0 none, 1 OCPP, 2 REST, 3 Modbus, 4 UDP
    pub async fn x2src(&self, source: u8) -> Result<()> {
        self.command(Command::X2Source(source)).await
    }

    /// Phase switch output: `true` for three phases
    pub async fn x2(&self, three_phases: bool) -> Result<()> {
        self.command(Command::X2(three_phases)).await
    }

    /// Limits charging to `kw`, derived from the measured phases and voltage
    ///
    /// Returns `Ok(false)` when the station is not in a state that allows it
    /// (not authorized, not charging, current out of range).
    pub async fn set_charging_power(
        &self,
        kw: f64,
        round_up: bool,
        stop_below_6a: bool,
    ) -> Result<bool> {
        let info = self
            .info()
            .ok_or_else(|| Error::unsupported("set_charging_power needs the station model"))?;
        if !info.meter_integrated {
            return Err(Error::unsupported(format!(
                "{} {} has no integrated meter",
                info.manufacturer, info.model
            )));
        }
        if !kw.is_finite() || !(0.0..=MAX_CHARGING_POWER).contains(&kw) {
            return Err(Error::validation("power", format!("{} kW is not between 0 and 44 kW", kw)));
        }
        if kw == 0.0 {
            self.set_ena(false).await?;
            return Ok(true);
        }

        let mut state = self.state_report().await?;
        if state.authorization_required() {
            warn!("{} is not authorized, authorize charging first", self.address);
            return Ok(false);
        }

        if !state.is_charging() {
            info!("Charging at {} is authorized but stopped, enabling", self.address);
            self.set_ena(true).await?;
            let deadline = Instant::now() + CHARGING_START_TIMEOUT;
            loop {
                sleep(self.fast_poll_interval).await;
                state = self.state_report().await?;
                if state.is_charging() {
                    break;
                }
                if Instant::now() >= deadline {
                    warn!("{} did not start charging, giving up", self.address);
                    return Ok(false);
                }
            }
        }

        let meter = self.meter_report().await?;
        let Some((phases, voltage)) = meter.active_phases() else {
            error!("No charging process running at {}", self.address);
            return Ok(false);
        };

        let amps = kw * 1000.0 / voltage / f64::from(phases);
        let amps = if round_up { amps.ceil() } else { amps.floor() };
        debug!(
            "{} kW at {} on {} phase(s) at {:.1} V: {} A",
            kw, self.address, phases, voltage, amps
        );

        if amps == 0.0 {
            self.set_ena(false).await?;
        } else if amps < 6.0 {
            if stop_below_6a {
                self.set_ena(false).await?;
            } else {
                self.set_current_timed(6.0, 1).await?;
            }
        } else if amps < 63.0 {
            if !state.enabled() {
                self.set_ena(true).await?;
            }
            self.set_current_timed(amps, 1).await?;
        } else {
            error!("Calculated current of {} A is out of range", amps);
            return Ok(false);
        }
        Ok(true)
    }
}
