use std::collections::{BTreeMap, BTreeSet, VecDeque};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{sleep_until, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::handle::Station;
use super::{poll_reports, Callback, Response, StationSnapshot, StationState};
use crate::core::{Error, Result, SessionConfig, StationAddress};
use crate::engine::EngineEvent;
use crate::network::Transport;
use crate::protocol::{
    Command, Completion, Failsafe, Payload, PushUpdate, Report, StationCodec, StationInfo,
};

/// Upper bound on how long the session sleeps without a timer due
const IDLE_WAKEUP: Duration = Duration::from_secs(60);

const CONTROL_CAPACITY: usize = 32;

/// Classified datagram handed over by the dispatcher
#[derive(Debug)]
pub(crate) struct Inbound {
    pub payload: Payload,
    pub received_at: Instant,
    pub timestamp: DateTime<Utc>,
}

impl Inbound {
    pub fn new(payload: Payload) -> Self {
        Inbound {
            payload,
            received_at: Instant::now(),
            timestamp: Utc::now(),
        }
    }
}

pub(crate) enum Control {
    Submit {
        command: Command,
        reply: Option<oneshot::Sender<Result<Response>>>,
    },
    Subscribe(Callback),
    SetPolling(bool),
}

enum Origin {
    User(oneshot::Sender<Result<Response>>),
    Detached,
    Poll,
}

struct Pending {
    command: Command,
    origin: Origin,
}

impl Pending {
    fn is_poll(&self) -> bool {
        matches!(self.origin, Origin::Poll)
    }

    fn is_abandoned(&self) -> bool {
        matches!(&self.origin, Origin::User(reply) if reply.is_closed())
    }

    fn resolve(self, outcome: Result<Response>) {
        match self.origin {
            Origin::User(reply) => {
                let _ = reply.send(outcome);
            }
            Origin::Detached | Origin::Poll => {
                if let Err(e) = outcome {
                    debug!("Background `{}` failed: {}", self.command, e);
                }
            }
        }
    }
}

struct InFlight {
    pending: Pending,
    wire: Bytes,
    attempts: u32,
    deadline: Instant,
}

/// State owned by one station task
pub(crate) struct Session {
    address: StationAddress,
    config: SessionConfig,
    transport: Transport,
    codec: StationCodec,
    queue: VecDeque<Pending>,
    in_flight: Option<InFlight>,
    reports: BTreeMap<u16, Report>,
    /// Stored reports changed by a push since they arrived
    patched: BTreeSet<u16>,
    pushed: PushUpdate,
    state: StationState,
    info: Option<StationInfo>,
    failsafe: Option<Failsafe>,
    last_activity: Option<Instant>,
    last_update: Option<DateTime<Utc>>,
    quiet_until: Instant,
    /// Late ACK/NAK replies still expected from a retransmitted command
    strays: u32,
    drain_until: Instant,
    polling: bool,
    next_poll: Option<Instant>,
    fast_polls_left: u32,
    subscribers: Vec<Callback>,
    snapshot_tx: watch::Sender<StationSnapshot>,
    events: broadcast::Sender<EngineEvent>,
    control_rx: mpsc::Receiver<Control>,
    inbound_rx: mpsc::Receiver<Inbound>,
    cancel: CancellationToken,
}

impl Session {
    /// Starts the task for one station and returns its handle and inbound queue
    pub fn spawn(
        address: StationAddress,
        config: SessionConfig,
        transport: Transport,
        events: broadcast::Sender<EngineEvent>,
        cancel: CancellationToken,
        polling: bool,
    ) -> (Station, mpsc::Sender<Inbound>) {
        let (control_tx, control_rx) = mpsc::channel(CONTROL_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_capacity.max(1));

        let mut snapshot = StationSnapshot::new(address);
        snapshot.polling = polling;
        let (snapshot_tx, snapshot_rx) = watch::channel(snapshot);

        let station = Station::new(
            address,
            control_tx,
            snapshot_rx,
            cancel.clone(),
            config.fast_poll_interval,
        );

        let now = Instant::now();
        let session = Session {
            address,
            config,
            transport,
            codec: StationCodec::new(),
            queue: VecDeque::new(),
            in_flight: None,
            reports: BTreeMap::new(),
            patched: BTreeSet::new(),
            pushed: PushUpdate::default(),
            state: StationState::Unestablished,
            info: None,
            failsafe: None,
            last_activity: None,
            last_update: None,
            quiet_until: now,
            strays: 0,
            drain_until: now,
            polling,
            next_poll: polling.then_some(now),
            fast_polls_left: 0,
            subscribers: Vec::new(),
            snapshot_tx,
            events,
            control_rx,
            inbound_rx,
            cancel,
        };
        tokio::spawn(session.run());

        (station, inbound_tx)
    }

    async fn run(mut self) {
        debug!("Session for {} started", self.address);
        self.publish();

        loop {
            self.pump().await;
            let deadline = self.next_deadline();

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = sleep_until(deadline) => self.handle_timers().await,
                control = self.control_rx.recv() => match control {
                    Some(control) => self.handle_control(control),
                    None => break,
                },
                Some(inbound) = self.inbound_rx.recv() => self.handle_inbound(inbound),
            }
        }

        self.close();
    }

    /// Earliest instant the queue head may go out
    fn hold_until(&self) -> Instant {
        if self.strays > 0 {
            self.quiet_until.max(self.drain_until)
        } else {
            self.quiet_until
        }
    }

    /// Sends the queue head once nothing is in flight and the station is not held quiet
    async fn pump(&mut self) {
        while self.in_flight.is_none() && Instant::now() >= self.hold_until() {
            let Some(pending) = self.queue.pop_front() else {
                break;
            };
            if pending.is_abandoned() {
                debug!("Dropping `{}` for {}, caller went away", pending.command, self.address);
                continue;
            }

            if self.strays > 0 {
                debug!("{} late replies from {} never arrived", self.strays, self.address);
                self.strays = 0;
            }

            let wire = match self.codec.encode_command(&pending.command) {
                Ok(wire) => wire,
                Err(e) => {
                    pending.resolve(Err(e));
                    continue;
                }
            };

            match self.transport.send(self.address.socket_addr(), &wire).await {
                Ok(()) => {
                    debug!("Sent `{}` to {}", pending.command, self.address);
                    self.in_flight = Some(InFlight {
                        pending,
                        wire,
                        attempts: 1,
                        deadline: Instant::now() + self.config.response_timeout,
                    });
                }
                Err(e) => {
                    warn!("Failed to send `{}` to {}: {}", pending.command, self.address, e);
                    pending.resolve(Err(e));
                }
            }
            self.publish();
        }
    }

    fn next_deadline(&self) -> Instant {
        let mut deadline = Instant::now() + IDLE_WAKEUP;
        match &self.in_flight {
            Some(flight) => deadline = deadline.min(flight.deadline),
            None if !self.queue.is_empty() => deadline = deadline.min(self.hold_until()),
            None => {}
        }
        if let Some(next_poll) = self.next_poll {
            deadline = deadline.min(next_poll);
        }
        if self.state == StationState::Active {
            if let Some(last) = self.last_activity {
                deadline = deadline.min(last + self.config.liveness_window);
            }
        }
        deadline
    }

    fn handle_control(&mut self, control: Control) {
        match control {
            Control::Submit { command, reply } => {
                debug!(
                    "Queued `{}` for {} ({} waiting)",
                    command,
                    self.address,
                    self.queue.len()
                );
                let origin = reply.map_or(Origin::Detached, Origin::User);
                self.queue.push_back(Pending { command, origin });
                self.publish();
            }
            Control::Subscribe(callback) => self.subscribers.push(callback),
            Control::SetPolling(enabled) => {
                debug!("Periodic polling for {} {}", self.address, if enabled { "enabled" } else { "disabled" });
                self.polling = enabled;
                self.fast_polls_left = 0;
                self.next_poll = enabled.then(Instant::now);
                self.publish();
            }
        }
    }

    fn handle_inbound(&mut self, inbound: Inbound) {
        let Inbound {
            payload,
            received_at,
            timestamp,
        } = inbound;

        match payload {
            Payload::Report(report) => self.on_report(report, received_at, timestamp),
            Payload::Push(update) => self.on_push(update, received_at, timestamp),
            Payload::Ack => self.on_ack(),
            Payload::Nak(reply) => self.on_nak(reply),
            Payload::Identity(firmware) => self.on_identity(firmware),
            Payload::Echo => {}
        }
    }

    async fn handle_timers(&mut self) {
        let now = Instant::now();

        if self.in_flight.as_ref().map_or(false, |f| f.deadline <= now) {
            self.on_response_timeout(now).await;
        }

        if self.next_poll.map_or(false, |at| at <= now) {
            self.enqueue_poll(now);
        }

        if self.state == StationState::Active
            && self
                .last_activity
                .map_or(false, |last| last + self.config.liveness_window <= now)
        {
            warn!(
                "No report from {} for {:?}",
                self.address, self.config.liveness_window
            );
            self.transition(StationState::Degraded);
        }
    }

    async fn on_response_timeout(&mut self, now: Instant) {
        let Some(mut flight) = self.in_flight.take() else {
            return;
        };

        if flight.attempts >= self.config.max_attempts() {
            warn!(
                "`{}` to {} timed out after {} attempts",
                flight.pending.command, self.address, flight.attempts
            );
            let err = Error::Timeout {
                command: flight.pending.command.to_string(),
                attempts: flight.attempts,
            };
            self.finish(flight, Err(err));
            return;
        }

        flight.attempts += 1;
        flight.deadline = now + self.config.response_timeout;
        debug!(
            "Retransmitting `{}` to {} (attempt {}/{})",
            flight.pending.command,
            self.address,
            flight.attempts,
            self.config.max_attempts()
        );
        match self.transport.send(self.address.socket_addr(), &flight.wire).await {
            Ok(()) => self.in_flight = Some(flight),
            Err(e) => {
                warn!("Failed to resend `{}` to {}: {}", flight.pending.command, self.address, e);
                self.finish(flight, Err(e));
            }
        }
    }

    fn enqueue_poll(&mut self, now: Instant) {
        let interval = if self.fast_polls_left > 0 {
            self.fast_polls_left -= 1;
            self.config.fast_poll_interval
        } else {
            self.config.poll_interval
        };
        self.next_poll = Some(now + interval);

        let poll_pending = self.queue.iter().any(Pending::is_poll)
            || self.in_flight.as_ref().map_or(false, |f| f.pending.is_poll());
        if poll_pending {
            debug!("Previous poll of {} still pending, skipping", self.address);
            return;
        }

        for number in poll_reports(self.info.as_ref()) {
            self.queue.push_back(Pending {
                command: Command::Report(number),
                origin: Origin::Poll,
            });
        }
        self.publish();
    }

    fn start_fast_polling(&mut self) {
        if !self.polling {
            return;
        }
        self.fast_polls_left = self.config.fast_poll_burst();
        let soon = Instant::now() + self.config.fast_poll_interval;
        self.next_poll = Some(self.next_poll.map_or(soon, |at| at.min(soon)));
    }

    fn on_report(&mut self, report: Report, received_at: Instant, timestamp: DateTime<Utc>) {
        let number = report.number();

        if let Some(stored) = self.reports.get(&number) {
            let (uptime, stored_uptime) = (report.uptime(), stored.uptime());
            let regressed = uptime < stored_uptime
                && stored_uptime - uptime <= self.config.stale_tolerance.as_secs();
            // Same Sec as a report a push has since patched: a duplicate that would undo the push
            let superseded = uptime == stored_uptime && self.patched.contains(&number);
            if regressed || superseded {
                debug!(
                    "Dropping stale report {} from {} (Sec {}, stored {})",
                    number, self.address, uptime, stored_uptime
                );
                let _ = self.events.send(EngineEvent::StaleReport {
                    address: self.address,
                    number,
                    uptime,
                    stored_uptime,
                });
                if superseded {
                    let current = stored.clone();
                    self.mark_alive(received_at, timestamp);
                    self.complete_report(current);
                }
                return;
            }
            if uptime < stored_uptime {
                info!(
                    "Uptime of {} went back from {} to {} s, assuming a reboot",
                    self.address, stored_uptime, uptime
                );
            }
        }

        if let Report::Info(info_report) = &report {
            match StationInfo::from_report(self.address, info_report) {
                Ok(info) => self.info = Some(info),
                Err(e) => warn!("Unable to identify station {}: {}", self.address, e),
            }
        }

        debug!("Report {} from {} accepted", number, self.address);
        self.reports.insert(number, report.clone());
        self.patched.remove(&number);
        self.mark_alive(received_at, timestamp);
        self.complete_report(report);
        self.notify();
    }

    /// Resolves an in-flight `report` request for this report's number
    fn complete_report(&mut self, report: Report) {
        let number = report.number();
        let completes = self
            .in_flight
            .as_ref()
            .map_or(false, |f| f.pending.command.completion() == Completion::Report(number));
        if completes {
            if let Some(flight) = self.in_flight.take() {
                self.finish(flight, Ok(Response::Report(report)));
            }
        }
    }

    fn on_push(&mut self, update: PushUpdate, received_at: Instant, timestamp: DateTime<Utc>) {
        debug!("Push update from {}: {:?}", self.address, update);

        if let Some(Report::State(state)) = self.reports.get_mut(&2) {
            update.apply_to_state(state);
            self.patched.insert(2);
        }
        if let Some(Report::Meter(meter)) = self.reports.get_mut(&3) {
            update.apply_to_meter(meter);
            self.patched.insert(3);
        }
        self.pushed.merge(&update);

        self.mark_alive(received_at, timestamp);
        self.notify();
    }

    fn on_ack(&mut self) {
        if self.in_flight.is_none() && self.absorb_stray() {
            debug!("Discarding late acknowledgement from {}", self.address);
            return;
        }
        match self.in_flight.take() {
            Some(flight) if flight.pending.command.completion() == Completion::Ack => {
                debug!("`{}` acknowledged by {}", flight.pending.command, self.address);
                if let Command::SetFailsafe(failsafe) = &flight.pending.command {
                    self.failsafe = Some(*failsafe);
                }
                if flight.pending.command.is_state_changing() {
                    self.start_fast_polling();
                }
                self.finish(flight, Ok(Response::Ack));
            }
            other => {
                self.in_flight = other;
                debug!("Unexpected acknowledgement from {}", self.address);
            }
        }
    }

    fn on_nak(&mut self, reply: String) {
        if self.in_flight.is_none() && self.absorb_stray() {
            debug!("Discarding late rejection from {}: {}", self.address, reply);
            return;
        }
        match self.in_flight.take() {
            Some(flight) => {
                warn!(
                    "`{}` rejected by {}: {}",
                    flight.pending.command, self.address, reply
                );
                let err = Error::Rejected {
                    command: flight.pending.command.to_string(),
                    reply,
                };
                self.finish(flight, Err(err));
            }
            None => debug!("Rejection from {} with nothing in flight: {}", self.address, reply),
        }
    }

    fn on_identity(&mut self, firmware: String) {
        match self.in_flight.take() {
            Some(flight) if flight.pending.command.completion() == Completion::Identity => {
                self.finish(flight, Ok(Response::Identity(firmware)));
            }
            other => self.in_flight = other,
        }
    }

    /// Counts one expected late reply, if the drain window is still open
    fn absorb_stray(&mut self) -> bool {
        if self.strays == 0 || Instant::now() >= self.drain_until {
            self.strays = 0;
            return false;
        }
        self.strays -= 1;
        true
    }

    /// Resolves the in-flight command and holds the queue for its quiet period
    ///
    /// Bare ACK/NAK replies carry no command name, so when a retransmitted
    /// command resolves, the replies to its other transmissions are drained
    /// before anything else is sent.
    fn finish(&mut self, flight: InFlight, outcome: Result<Response>) {
        let now = Instant::now();
        self.quiet_until = now + flight.pending.command.quiet_period(&self.config);

        if flight.pending.command.completion() == Completion::Ack {
            let answered = matches!(&outcome, Ok(_) | Err(Error::Rejected { .. }));
            let strays = flight.attempts - u32::from(answered);
            if strays > 0 {
                debug!(
                    "Expecting {} late replies to `{}` from {}",
                    strays, flight.pending.command, self.address
                );
                self.strays = strays;
                self.drain_until = now + self.config.response_timeout;
            }
        }

        self.publish();
        flight.pending.resolve(outcome);
    }

    fn mark_alive(&mut self, received_at: Instant, timestamp: DateTime<Utc>) {
        self.last_activity = Some(received_at);
        self.last_update = Some(timestamp);
        if matches!(
            self.state,
            StationState::Unestablished | StationState::Degraded
        ) {
            self.transition(StationState::Active);
        }
    }

    fn transition(&mut self, to: StationState) {
        let from = self.state;
        if from == to {
            return;
        }
        info!("Station {} is now {} (was {})", self.address, to, from);
        self.state = to;
        let _ = self.events.send(EngineEvent::StateChanged {
            address: self.address,
            from,
            to,
        });
        self.notify();
    }

    fn snapshot(&self) -> StationSnapshot {
        StationSnapshot {
            address: self.address,
            state: self.state,
            reports: self.reports.clone(),
            pushed: self.pushed.clone(),
            info: self.info.clone(),
            failsafe: self.failsafe,
            queue_depth: self.queue.len(),
            in_flight: self.in_flight.as_ref().map(|f| f.pending.command.clone()),
            polling: self.polling,
            last_activity: self.last_activity,
            last_update: self.last_update,
        }
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(self.snapshot());
    }

    fn notify(&self) {
        let snapshot = self.snapshot();
        for callback in &self.subscribers {
            callback(&snapshot);
        }
        self.snapshot_tx.send_replace(snapshot);
    }

    /// Resolves everything outstanding as cancelled
    fn close(&mut self) {
        self.transition(StationState::TornDown);
        self.control_rx.close();
        self.next_poll = None;

        let cancelled = |address: StationAddress| {
            Error::cancelled(format!("session for {} torn down", address))
        };
        if let Some(flight) = self.in_flight.take() {
            flight.pending.resolve(Err(cancelled(self.address)));
        }
        for pending in self.queue.drain(..) {
            pending.resolve(Err(cancelled(self.address)));
        }
        while let Ok(control) = self.control_rx.try_recv() {
            if let Control::Submit {
                reply: Some(reply), ..
            } = control
            {
                let _ = reply.send(Err(cancelled(self.address)));
            }
        }

        self.publish();
        info!("Session for {} closed", self.address);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{InfoReport, MeterReport, SessionReport, StateReport};
    use std::sync::{Arc, Mutex};
    use tokio::net::UdpSocket;
    use tokio::time::timeout;
    use tokio_test::{assert_err, assert_ok};

    struct Harness {
        station: Station,
        inbound: mpsc::Sender<Inbound>,
        peer: UdpSocket,
        events: broadcast::Receiver<EngineEvent>,
        cancel: CancellationToken,
    }

    fn test_config() -> SessionConfig {
        SessionConfig {
            response_timeout: Duration::from_millis(80),
            max_retries: 2,
            command_spacing: Duration::from_millis(10),
            disable_quiet_period: Duration::from_millis(200),
            authorization_quiet_period: Duration::from_millis(50),
            ..SessionConfig::default()
        }
    }

    async fn harness(config: SessionConfig) -> Harness {
        harness_with(config, false).await
    }

    async fn harness_with(config: SessionConfig, polling: bool) -> Harness {
        let transport = Transport::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let address = StationAddress::from(peer.local_addr().unwrap());
        let (events_tx, events) = broadcast::channel(32);
        let cancel = CancellationToken::new();
        let (station, inbound) =
            Session::spawn(address, config, transport, events_tx, cancel.clone(), polling);
        Harness {
            station,
            inbound,
            peer,
            events,
            cancel,
        }
    }

    async fn recv_text(peer: &UdpSocket, wait: Duration) -> Option<String> {
        let mut buf = [0u8; 256];
        match timeout(wait, peer.recv_from(&mut buf)).await {
            Ok(Ok((len, _))) => Some(String::from_utf8_lossy(&buf[..len]).to_string()),
            _ => None,
        }
    }

    fn state_report(sec: u64, state: u8) -> Payload {
        Payload::Report(Report::State(StateReport {
            state,
            serial: "15017355".to_string(),
            sec,
            ..Default::default()
        }))
    }

    #[tokio::test]
    async fn test_one_command_in_flight() {
        let h = harness(test_config()).await;

        let first = {
            let station = h.station.clone();
            tokio::spawn(async move { station.send(Command::set_current(10.0).unwrap()).await })
        };
        assert_eq!(recv_text(&h.peer, Duration::from_secs(1)).await.unwrap(), "curr 10000");

        let second = {
            let station = h.station.clone();
            tokio::spawn(async move { station.send(Command::set_current(6.0).unwrap()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.station.snapshot().queue_depth, 1);

        h.inbound.send(Inbound::new(Payload::Ack)).await.unwrap();
        assert_eq!(assert_ok!(first.await.unwrap()), Response::Ack);
        assert_eq!(recv_text(&h.peer, Duration::from_secs(1)).await.unwrap(), "curr 6000");

        h.inbound.send(Inbound::new(Payload::Ack)).await.unwrap();
        assert_ok!(second.await.unwrap());
    }

    #[tokio::test]
    async fn test_retransmit_then_timeout() {
        let h = harness(test_config()).await;

        let result = {
            let station = h.station.clone();
            tokio::spawn(async move { station.send(Command::Enable(true)).await })
        };

        for _ in 0..3 {
            assert_eq!(recv_text(&h.peer, Duration::from_secs(1)).await.unwrap(), "ena 1");
        }
        match result.await.unwrap() {
            Err(Error::Timeout { command, attempts }) => {
                assert_eq!(command, "ena 1");
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(recv_text(&h.peer, Duration::from_millis(200)).await.is_none());
    }

    #[tokio::test]
    async fn test_nak_rejects_command() {
        let h = harness(test_config()).await;

        let result = {
            let station = h.station.clone();
            tokio::spawn(async move { station.send(Command::Unlock).await })
        };
        assert_eq!(recv_text(&h.peer, Duration::from_secs(1)).await.unwrap(), "unlock");
        h.inbound
            .send(Inbound::new(Payload::Nak("TCH-ERR :busy".to_string())))
            .await
            .unwrap();

        assert!(matches!(
            result.await.unwrap(),
            Err(Error::Rejected { reply, .. }) if reply == "TCH-ERR :busy"
        ));
    }

    #[tokio::test]
    async fn test_stale_reports_never_regress() {
        let mut h = harness(test_config()).await;

        h.inbound.send(Inbound::new(state_report(100, 3))).await.unwrap();
        h.inbound.send(Inbound::new(state_report(90, 2))).await.unwrap();

        let event = timeout(Duration::from_secs(1), async {
            loop {
                if let EngineEvent::StaleReport { number, uptime, .. } = h.events.recv().await.unwrap() {
                    return (number, uptime);
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(event, (2, 90));
        assert_eq!(h.station.snapshot().state_report().unwrap().sec, 100);

        // A jump beyond the tolerance is a reboot
        h.inbound.send(Inbound::new(state_report(5, 2))).await.unwrap();
        let snapshot = h
            .station
            .wait_for(Duration::from_secs(1), |s| {
                s.state_report().map_or(false, |r| r.sec == 5)
            })
            .await;
        assert!(snapshot.is_some());
    }

    #[tokio::test]
    async fn test_push_update_patches_report() {
        let h = harness(test_config()).await;

        h.inbound.send(Inbound::new(state_report(10, 2))).await.unwrap();
        let update = PushUpdate {
            state: Some(3),
            plug: Some(7),
            ..Default::default()
        };
        h.inbound.send(Inbound::new(Payload::Push(update))).await.unwrap();

        let snapshot = h
            .station
            .wait_for(Duration::from_secs(1), |s| s.pushed.plug == Some(7))
            .await
            .unwrap();
        let report = snapshot.state_report().unwrap();
        assert!(report.is_charging());
        assert!(report.plug_state().locked());
        assert_eq!(snapshot.state, StationState::Active);
    }

    #[tokio::test]
    async fn test_liveness_window() {
        let config = SessionConfig {
            liveness_window: Duration::from_millis(150),
            ..test_config()
        };
        let mut h = harness(config).await;
        assert_eq!(h.station.state(), StationState::Unestablished);

        h.inbound.send(Inbound::new(state_report(1, 2))).await.unwrap();
        assert!(h
            .station
            .wait_for(Duration::from_secs(1), |s| s.state == StationState::Degraded)
            .await
            .is_some());

        h.inbound.send(Inbound::new(state_report(2, 2))).await.unwrap();
        assert!(h
            .station
            .wait_for(Duration::from_secs(1), |s| s.state == StationState::Active)
            .await
            .is_some());

        let mut transitions = Vec::new();
        while let Ok(EngineEvent::StateChanged { to, .. }) = h.events.try_recv() {
            transitions.push(to);
        }
        assert_eq!(
            transitions,
            vec![
                StationState::Active,
                StationState::Degraded,
                StationState::Active
            ]
        );
    }

    #[tokio::test]
    async fn test_report_1_identifies_station() {
        let h = harness(test_config()).await;

        let result = {
            let station = h.station.clone();
            tokio::spawn(async move { station.send(Command::Report(1)).await })
        };
        assert_eq!(recv_text(&h.peer, Duration::from_secs(1)).await.unwrap(), "report 1");
        let report = Report::Info(InfoReport {
            product: "KC-P20-ES230001-000".to_string(),
            serial: "15017355".to_string(),
            firmware: "P20 v 2.5".to_string(),
            sec: 7,
            ..Default::default()
        });
        h.inbound
            .send(Inbound::new(Payload::Report(report.clone())))
            .await
            .unwrap();

        assert_eq!(assert_ok!(result.await.unwrap()), Response::Report(report));
        let info = h.station.info().unwrap();
        assert_eq!(info.model, "P20");

        // P20 without meter: energy limits are refused locally
        assert!(matches!(
            h.station.send(Command::set_energy(5.0).unwrap()).await,
            Err(Error::Unsupported(_))
        ));
        assert!(recv_text(&h.peer, Duration::from_millis(100)).await.is_none());
    }

    #[tokio::test]
    async fn test_cancel_resolves_outstanding() {
        let h = harness(test_config()).await;

        let first = {
            let station = h.station.clone();
            tokio::spawn(async move { station.send(Command::Report(2)).await })
        };
        let second = {
            let station = h.station.clone();
            tokio::spawn(async move { station.send(Command::Report(3)).await })
        };
        assert!(recv_text(&h.peer, Duration::from_secs(1)).await.is_some());

        h.cancel.cancel();
        assert!(matches!(first.await.unwrap(), Err(Error::Cancelled(_))));
        assert!(matches!(second.await.unwrap(), Err(Error::Cancelled(_))));
        assert!(h
            .station
            .wait_for(Duration::from_secs(1), |s| s.state == StationState::TornDown)
            .await
            .is_some());
        assert_err!(h.station.send(Command::Report(2)).await);
    }

    #[tokio::test]
    async fn test_disable_quiet_period() {
        let h = harness(test_config()).await;

        let disable = {
            let station = h.station.clone();
            tokio::spawn(async move { station.send(Command::Enable(false)).await })
        };
        assert_eq!(recv_text(&h.peer, Duration::from_secs(1)).await.unwrap(), "ena 0");
        h.inbound.send(Inbound::new(Payload::Ack)).await.unwrap();
        assert_ok!(disable.await.unwrap());
        let acked = Instant::now();

        let next = {
            let station = h.station.clone();
            tokio::spawn(async move { station.send(Command::Enable(true)).await })
        };
        assert_eq!(recv_text(&h.peer, Duration::from_secs(1)).await.unwrap(), "ena 1");
        assert!(acked.elapsed() >= Duration::from_millis(190));
        next.abort();
    }

    #[tokio::test]
    async fn test_late_acks_of_retransmitted_command_are_drained() {
        let h = harness(test_config()).await;

        let enable = {
            let station = h.station.clone();
            tokio::spawn(async move { station.send(Command::Enable(true)).await })
        };
        assert_eq!(recv_text(&h.peer, Duration::from_secs(1)).await.unwrap(), "ena 1");
        assert_eq!(recv_text(&h.peer, Duration::from_secs(1)).await.unwrap(), "ena 1");

        // Both transmissions get answered, late
        h.inbound.send(Inbound::new(Payload::Ack)).await.unwrap();
        assert_ok!(enable.await.unwrap());

        let unlock = {
            let station = h.station.clone();
            tokio::spawn(async move { station.send(Command::Unlock).await })
        };
        assert!(recv_text(&h.peer, Duration::from_millis(30)).await.is_none());

        h.inbound.send(Inbound::new(Payload::Ack)).await.unwrap();
        assert_eq!(recv_text(&h.peer, Duration::from_secs(1)).await.unwrap(), "unlock");
        h.inbound
            .send(Inbound::new(Payload::Nak("TCH-ERR".to_string())))
            .await
            .unwrap();

        assert!(matches!(
            unlock.await.unwrap(),
            Err(Error::Rejected { command, .. }) if command == "unlock"
        ));
    }

    #[tokio::test]
    async fn test_drain_window_expires_without_late_reply() {
        let h = harness(test_config()).await;

        let enable = {
            let station = h.station.clone();
            tokio::spawn(async move { station.send(Command::Enable(true)).await })
        };
        assert_eq!(recv_text(&h.peer, Duration::from_secs(1)).await.unwrap(), "ena 1");
        assert_eq!(recv_text(&h.peer, Duration::from_secs(1)).await.unwrap(), "ena 1");
        h.inbound.send(Inbound::new(Payload::Ack)).await.unwrap();
        assert_ok!(enable.await.unwrap());
        let acked = Instant::now();

        let next = {
            let station = h.station.clone();
            tokio::spawn(async move { station.send(Command::set_current(8.0).unwrap()).await })
        };
        assert_eq!(recv_text(&h.peer, Duration::from_secs(1)).await.unwrap(), "curr 8000");
        assert!(acked.elapsed() >= Duration::from_millis(70));

        h.inbound.send(Inbound::new(Payload::Ack)).await.unwrap();
        assert_ok!(next.await.unwrap());
    }

    #[tokio::test]
    async fn test_duplicate_report_keeps_pushed_state() {
        let mut h = harness(test_config()).await;

        h.inbound.send(Inbound::new(state_report(100, 2))).await.unwrap();
        let update = PushUpdate {
            state: Some(3),
            ..Default::default()
        };
        h.inbound.send(Inbound::new(Payload::Push(update))).await.unwrap();
        assert!(h
            .station
            .wait_for(Duration::from_secs(1), |s| {
                s.state_report().map_or(false, |r| r.state == 3)
            })
            .await
            .is_some());

        // The same datagram delivered twice
        h.inbound.send(Inbound::new(state_report(100, 2))).await.unwrap();
        let event = timeout(Duration::from_secs(1), async {
            loop {
                if let EngineEvent::StaleReport { uptime, stored_uptime, .. } =
                    h.events.recv().await.unwrap()
                {
                    return (uptime, stored_uptime);
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(event, (100, 100));
        assert_eq!(h.station.snapshot().state_report().unwrap().state, 3);

        h.inbound.send(Inbound::new(state_report(101, 2))).await.unwrap();
        let snapshot = h
            .station
            .wait_for(Duration::from_secs(1), |s| {
                s.state_report().map_or(false, |r| r.sec == 101)
            })
            .await
            .unwrap();
        assert_eq!(snapshot.state_report().unwrap().state, 2);
    }

    #[tokio::test]
    async fn test_subscribers_hear_state_changes() {
        let config = SessionConfig {
            liveness_window: Duration::from_millis(150),
            ..test_config()
        };
        let h = harness(config).await;

        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = seen.clone();
            h.station
                .subscribe(move |snapshot| seen.lock().unwrap().push(snapshot.state))
                .await
                .unwrap();
        }

        h.inbound.send(Inbound::new(state_report(1, 2))).await.unwrap();
        assert!(h
            .station
            .wait_for(Duration::from_secs(1), |s| s.state == StationState::Degraded)
            .await
            .is_some());
        assert_eq!(seen.lock().unwrap().last(), Some(&StationState::Degraded));

        h.cancel.cancel();
        assert!(h
            .station
            .wait_for(Duration::from_secs(1), |s| s.state == StationState::TornDown)
            .await
            .is_some());
        assert_eq!(seen.lock().unwrap().last(), Some(&StationState::TornDown));
    }

    #[tokio::test]
    async fn test_retransmit_not_starved_by_pushes() {
        let h = harness(test_config()).await;

        let flood = {
            let inbound = h.inbound.clone();
            tokio::spawn(async move {
                loop {
                    let update = PushUpdate {
                        plug: Some(7),
                        ..Default::default()
                    };
                    if inbound.send(Inbound::new(Payload::Push(update))).await.is_err() {
                        break;
                    }
                }
            })
        };

        let enable = {
            let station = h.station.clone();
            tokio::spawn(async move { station.send(Command::Enable(true)).await })
        };
        assert_eq!(recv_text(&h.peer, Duration::from_secs(1)).await.unwrap(), "ena 1");
        assert_eq!(recv_text(&h.peer, Duration::from_secs(1)).await.unwrap(), "ena 1");

        flood.abort();
        enable.abort();
    }

    #[tokio::test]
    async fn test_one_command_in_flight_while_polling() {
        let config = SessionConfig {
            poll_interval: Duration::from_millis(30),
            fast_poll_interval: Duration::from_millis(15),
            ..test_config()
        };
        let h = harness_with(config, true).await;

        let mut commands = Vec::new();
        for amps in [6.0, 7.0, 8.0] {
            let station = h.station.clone();
            commands.push(tokio::spawn(async move {
                station.send(Command::set_current(amps).unwrap()).await
            }));
        }

        let mut sent = Vec::new();
        let mut sec = 0;
        while commands.iter().any(|c| !c.is_finished()) || !sent.iter().any(|r: &String| r.starts_with("report")) {
            let request = recv_text(&h.peer, Duration::from_secs(1)).await.unwrap();
            // Nothing else may go out while this request is unanswered
            assert_eq!(recv_text(&h.peer, Duration::from_millis(40)).await, None);

            sec += 1;
            let reply = match request.strip_prefix("report ") {
                Some(number) => {
                    let report = match number.parse::<u16>().unwrap() {
                        2 => Report::State(StateReport {
                            sec,
                            ..Default::default()
                        }),
                        3 => Report::Meter(MeterReport {
                            sec,
                            ..Default::default()
                        }),
                        number => Report::Session(SessionReport {
                            number,
                            sec,
                            ..Default::default()
                        }),
                    };
                    Payload::Report(report)
                }
                None => Payload::Ack,
            };
            h.inbound.send(Inbound::new(reply)).await.unwrap();
            sent.push(request);
            assert!(sent.len() < 50, "requests kept coming: {:?}", sent);
        }

        for command in commands {
            assert_ok!(command.await.unwrap());
        }
        let currents: Vec<_> = sent.iter().filter(|r| r.starts_with("curr")).collect();
        assert_eq!(currents.len(), 3);
    }
}
