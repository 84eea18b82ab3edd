//! Per-peer connection state machine shared by the profile implementations.
//!
//!                       (Disconnected)
//!                            |    ^
//!                    CONNECT |    | CLOSED / TIMEOUT
//!                            v    |
//!                  (Connecting) (Disconnecting)
//!                            |    ^
//!                  CONNECTED |    | DISCONNECT / FAILED / TIMEOUT
//!                            v    |
//!                         (Connected)
//!
//! Every event for a peer — API requests, stack completions and timer
//! firings — is funneled through that peer's worker queue and consumed one
//! at a time, which is what makes the transition table sound. Requests that
//! arrive while a teardown is in flight are deferred and replayed, in
//! order, after the next transition.

use crate::{Message, PeerAddr};
use bt_common::time::Alarm;
use log::{debug, warn};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::time::Duration;

/// Connection state of a single peer.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
#[repr(u32)]
pub enum ProfileState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Disconnecting = 3,
}

/// Check whether a peer is usable for profile traffic in this state.
pub fn state_to_connected(state: ProfileState) -> bool {
    match state {
        ProfileState::Connected => true,
        _ => false,
    }
}

/// Events handled by a peer's connection state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// Request to bring up the profile connection.
    Connect(PeerAddr),
    /// Request to tear down the profile connection.
    Disconnect(PeerAddr),
    /// The stack reports the link came up.
    ConnectionComplete,
    /// The stack reports the connection attempt failed.
    ConnectionFailed,
    /// The stack confirms the link is down.
    ConnectionClosed,
    /// The armed transition timer fired.
    TransitionTimeout,
    /// Stop this peer's worker once Disconnected is reached.
    Quit,
}

/// Commands issued toward the native stack. Completions are reported
/// asynchronously as `ConnectionEvent`s on the issuing peer's queue.
pub trait CommandChannel {
    fn issue_connect(&mut self, peer: PeerAddr);
    fn issue_disconnect(&mut self, peer: PeerAddr);

    /// Aborts the transport without waiting for a graceful close
    /// acknowledgment.
    fn force_abort(&mut self, peer: PeerAddr);
}

const CONNECT_TIMEOUT_MS: u64 = 6000;
const DISCONNECT_TIMEOUT_MS: u64 = 3000;

/// Upper bound on events parked while a teardown is in flight.
const DEFERRED_EVENT_LIMIT: usize = 16;

const EVENT_CHANNEL_SIZE: usize = 16;

/// Profile-tunable connection parameters.
#[derive(Debug, Clone)]
pub struct ProfileConfig {
    /// How long a connection attempt may remain unanswered.
    pub connect_timeout: Duration,
    /// How long a graceful teardown may take before the transport is
    /// aborted.
    pub disconnect_timeout: Duration,
    /// Number of peers the profile serves simultaneously.
    pub max_connections: usize,
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(CONNECT_TIMEOUT_MS),
            disconnect_timeout: Duration::from_millis(DISCONNECT_TIMEOUT_MS),
            max_connections: 1,
        }
    }
}

#[derive(Debug, PartialEq)]
enum Effect {
    None,
    IssueConnect,
    IssueTeardown,
    ForceAbort,
    Defer,
}

struct Transition {
    next: ProfileState,
    notify: bool,
    effect: Effect,
}

/// The transition table. Pairs absent from the table are protocol
/// violations: logged and dropped without touching the machine.
fn transition(state: ProfileState, event: &ConnectionEvent) -> Option<Transition> {
    use ConnectionEvent::*;
    use ProfileState::*;

    match (state, event) {
        (Disconnected, Connect(_)) => {
            Some(Transition { next: Connecting, notify: true, effect: Effect::IssueConnect })
        }
        // Callers waiting on a disconnect acknowledgment get one even when
        // there is nothing to tear down.
        (Disconnected, Disconnect(_)) => {
            Some(Transition { next: Disconnected, notify: true, effect: Effect::None })
        }
        (Connecting, ConnectionComplete) => {
            Some(Transition { next: Connected, notify: true, effect: Effect::None })
        }
        // A rejected attempt and one the stack never answered need the same
        // recovery: tear the link down and wait for the close.
        (Connecting, ConnectionFailed)
        | (Connecting, TransitionTimeout)
        | (Connecting, Disconnect(_)) => {
            Some(Transition { next: Disconnecting, notify: true, effect: Effect::IssueTeardown })
        }
        (Connecting, Connect(_)) => {
            Some(Transition { next: Connecting, notify: false, effect: Effect::None })
        }
        (Connected, Disconnect(_)) => {
            Some(Transition { next: Disconnecting, notify: true, effect: Effect::IssueTeardown })
        }
        // A redundant connect re-broadcasts the current state so the caller
        // still sees an acknowledgment.
        (Connected, Connect(_)) => {
            Some(Transition { next: Connected, notify: true, effect: Effect::None })
        }
        (Disconnecting, ConnectionClosed) => {
            Some(Transition { next: Disconnected, notify: true, effect: Effect::None })
        }
        (Disconnecting, TransitionTimeout) => {
            Some(Transition { next: Disconnected, notify: true, effect: Effect::ForceAbort })
        }
        (Disconnecting, Connect(_)) | (Disconnecting, Disconnect(_)) => {
            Some(Transition { next: Disconnecting, notify: false, effect: Effect::Defer })
        }
        _ => None,
    }
}

/// What the worker should do with the transition timer after an event.
#[derive(Debug, PartialEq)]
pub(crate) enum TimerDirective {
    Keep,
    Arm(Duration),
    Cancel,
}

/// Everything a single event produced: notifications to publish, in order,
/// and the resulting timer directive.
#[derive(Debug)]
pub(crate) struct MachineOutput {
    pub(crate) notifications: Vec<(PeerAddr, ProfileState, ProfileState)>,
    pub(crate) timer: TimerDirective,
}

pub(crate) struct ConnectionStateMachine {
    peer: PeerAddr,
    state: ProfileState,
    deferred: VecDeque<ConnectionEvent>,
    quitting: bool,
    channel: Arc<Mutex<Box<dyn CommandChannel + Send>>>,
    registry: Arc<Mutex<HashMap<PeerAddr, ProfileState>>>,
    config: ProfileConfig,
}

impl ConnectionStateMachine {
    pub(crate) fn new(
        peer: PeerAddr,
        channel: Arc<Mutex<Box<dyn CommandChannel + Send>>>,
        registry: Arc<Mutex<HashMap<PeerAddr, ProfileState>>>,
        config: ProfileConfig,
    ) -> ConnectionStateMachine {
        registry.lock().unwrap().insert(peer, ProfileState::Disconnected);
        ConnectionStateMachine {
            peer,
            state: ProfileState::Disconnected,
            deferred: VecDeque::new(),
            quitting: false,
            channel,
            registry,
            config,
        }
    }

    pub(crate) fn peer(&self) -> PeerAddr {
        self.peer
    }

    pub(crate) fn state(&self) -> ProfileState {
        self.state
    }

    /// True once an explicit quit was requested and the machine is back in
    /// Disconnected, i.e. the worker may close its queue and drain.
    pub(crate) fn ready_to_retire(&self) -> bool {
        self.quitting && self.state == ProfileState::Disconnected
    }

    /// Feeds one event through the transition table, replaying deferred
    /// events after any state change. Outputs are collected so the worker
    /// publishes them in processing order.
    pub(crate) fn advance(&mut self, event: ConnectionEvent) -> MachineOutput {
        let mut out =
            MachineOutput { notifications: Vec::new(), timer: TimerDirective::Keep };
        self.handle_event(event, &mut out);
        out
    }

    fn handle_event(&mut self, event: ConnectionEvent, out: &mut MachineOutput) {
        debug!("Processing {:?} for [{}] in {:?}", event, self.peer, self.state);

        match &event {
            ConnectionEvent::Quit => {
                self.on_quit(out);
                return;
            }
            ConnectionEvent::Connect(peer) | ConnectionEvent::Disconnect(peer) => {
                // Requests racing a prior teardown may carry a stale address.
                if *peer != self.peer {
                    warn!("Ignoring {:?}: this machine is bound to [{}]", event, self.peer);
                    return;
                }
                if self.quitting && matches!(event, ConnectionEvent::Connect(_)) {
                    warn!("Refusing connect for [{}]: worker is quitting", self.peer);
                    return;
                }
            }
            _ => (),
        }

        let t = match transition(self.state, &event) {
            Some(t) => t,
            None => {
                warn!("Unexpected {:?} for [{}] in {:?}, ignored", event, self.peer, self.state);
                return;
            }
        };

        match t.effect {
            Effect::None => (),
            Effect::IssueConnect => self.channel.lock().unwrap().issue_connect(self.peer),
            Effect::IssueTeardown => self.channel.lock().unwrap().issue_disconnect(self.peer),
            Effect::ForceAbort => {
                warn!("Teardown timed out for [{}], aborting transport", self.peer);
                self.channel.lock().unwrap().force_abort(self.peer);
            }
            Effect::Defer => {
                if self.deferred.len() >= DEFERRED_EVENT_LIMIT {
                    warn!("Deferred queue full for [{}], dropping {:?}", self.peer, event);
                } else {
                    self.deferred.push_back(event);
                }
                return;
            }
        }

        let prev_state = self.state;
        if t.notify {
            out.notifications.push((self.peer, prev_state, t.next));
        }

        if t.next != prev_state {
            self.state = t.next;
            self.registry.lock().unwrap().insert(self.peer, t.next);
            out.timer = match t.next {
                ProfileState::Connecting => TimerDirective::Arm(self.config.connect_timeout),
                ProfileState::Disconnecting => {
                    TimerDirective::Arm(self.config.disconnect_timeout)
                }
                _ => TimerDirective::Cancel,
            };
            self.replay_deferred(out);
        }
    }

    fn replay_deferred(&mut self, out: &mut MachineOutput) {
        if self.deferred.is_empty() {
            return;
        }

        // Only what was parked before this transition is replayed now; an
        // event that defers again waits for the next transition.
        let parked: Vec<ConnectionEvent> = self.deferred.drain(..).collect();
        debug!("Replaying {} deferred event(s) for [{}]", parked.len(), self.peer);
        for event in parked {
            self.handle_event(event, out);
        }
    }

    fn on_quit(&mut self, out: &mut MachineOutput) {
        if self.quitting {
            return;
        }
        self.quitting = true;
        if self.state != ProfileState::Disconnected {
            self.handle_event(ConnectionEvent::Disconnect(self.peer), out);
        }
    }
}

/// Holds the queue endpoints and machine for one peer's worker.
pub(crate) struct ConnectionContext {
    tx: mpsc::Sender<ConnectionEvent>,
    rx: mpsc::Receiver<ConnectionEvent>,
    machine: ConnectionStateMachine,
}

impl ConnectionContext {
    pub(crate) fn new(machine: ConnectionStateMachine) -> ConnectionContext {
        let (tx, rx) = mpsc::channel::<ConnectionEvent>(EVENT_CHANNEL_SIZE);
        ConnectionContext { tx, rx, machine }
    }

    pub(crate) fn get_proxy(&self) -> MachineProxy {
        MachineProxy { peer: self.machine.peer(), tx: self.tx.clone() }
    }
}

/// Cheap cloneable handle used to enqueue events onto a peer's worker.
#[derive(Clone)]
pub(crate) struct MachineProxy {
    peer: PeerAddr,
    tx: mpsc::Sender<ConnectionEvent>,
}

impl MachineProxy {
    /// Enqueues without blocking the caller. `try_send` keeps two
    /// back-to-back requests in submission order; a saturated queue drops
    /// the event with a log.
    pub(crate) fn send(&self, event: ConnectionEvent) {
        if let Err(e) = self.tx.try_send(event) {
            warn!("Failed to queue event for [{}]: {}", self.peer, e);
        }
    }
}

/// Runs one peer's worker: consumes queued events and timer firings strictly
/// in order, publishes the resulting notifications on `tx`, and exits once
/// the machine has retired and its queue is drained.
pub(crate) async fn mainloop(mut context: ConnectionContext, tx: mpsc::Sender<Message>) {
    let mut transition_timer = Alarm::new();
    let peer = context.machine.peer();

    loop {
        let out = tokio::select! {
            m = context.rx.recv() => match m {
                Some(event) => context.machine.advance(event),
                // Every sender is gone; abandon whatever was left.
                None => break,
            },
            _ = transition_timer.expired() => {
                context.machine.advance(ConnectionEvent::TransitionTimeout)
            }
        };

        match out.timer {
            TimerDirective::Keep => (),
            TimerDirective::Arm(duration) => transition_timer.reset(duration),
            TimerDirective::Cancel => transition_timer.cancel(),
        }

        for (peer, prev_state, state) in out.notifications {
            let _ = tx.send(Message::ConnectionStateChanged(peer, prev_state, state)).await;
        }

        if context.machine.ready_to_retire() {
            // Refuse new events but keep draining what is already queued so
            // every caller still gets an acknowledgment.
            context.rx.close();
        }
    }

    debug!("Worker for [{}] exiting in {:?}", peer, context.machine.state());
    let _ = tx.send(Message::PeerRetired(peer)).await;
}
