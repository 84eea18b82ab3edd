//! Per-profile connection management: owns one connection worker per peer
//! and answers the synchronous query surface from a shared state snapshot.

use crate::callbacks::Callbacks;
use crate::state_machine::{
    self, CommandChannel, ConnectionContext, ConnectionEvent, ConnectionStateMachine,
    MachineProxy, ProfileConfig, ProfileState,
};
use crate::{Message, PeerAddr, Profile, RPCProxy};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::mpsc::Sender;

/// Errors surfaced by the connection request API.
#[derive(Debug, Error, PartialEq)]
pub enum ConnectionError {
    /// Every connection slot is occupied by another peer.
    #[error("profile is already bound to another peer")]
    AlreadyBound,
    /// The request carried the all-zero placeholder address.
    #[error("invalid peer address")]
    InvalidPeer,
}

/// Observer of profile connection state transitions.
pub trait IProfileConnectionCallback: RPCProxy {
    /// Invoked once per state transition, including the acknowledgment
    /// re-broadcasts for redundant requests.
    fn on_connection_state_changed(
        &self,
        peer: PeerAddr,
        prev_state: ProfileState,
        state: ProfileState,
    );
}

/// Connection management API exposed by every profile implementation.
pub trait IProfileConnection {
    /// Registers an observer of connection transitions and returns a unique
    /// callback id for future calls.
    fn register_callback(&mut self, callback: Box<dyn IProfileConnectionCallback + Send>) -> u32;

    /// Unregisters a callback.
    ///
    /// Returns true if the callback was removed, false if the id is unknown.
    fn unregister_callback(&mut self, callback_id: u32) -> bool;

    /// Requests a profile-level connection to `peer`. The outcome is only
    /// observable through registered callbacks.
    fn connect(&mut self, peer: PeerAddr) -> Result<(), ConnectionError>;

    /// Requests teardown of the profile-level connection to `peer`. Unknown
    /// peers are accepted and ignored since the caller may be racing a
    /// teardown that already completed.
    fn disconnect(&mut self, peer: PeerAddr);

    /// Reads the last published state for `peer`. Never blocks on a peer's
    /// worker. Unknown peers read as Disconnected.
    fn get_connection_state(&self, peer: PeerAddr) -> ProfileState;

    /// Lists known peers currently in any of `states`.
    fn get_devices_matching_connection_states(&self, states: Vec<ProfileState>) -> Vec<PeerAddr>;

    /// Lists peers currently usable for profile traffic.
    fn get_connected_devices(&self) -> Vec<PeerAddr>;

    /// Returns the active peer, or None while every known peer is
    /// Disconnected. Meaningful for single-connection profiles.
    fn get_device(&self) -> Option<PeerAddr>;
}

/// Owns the per-peer connection workers of one profile.
pub struct ProfileManager {
    profile: Profile,
    config: ProfileConfig,
    channel: Arc<Mutex<Box<dyn CommandChannel + Send>>>,
    tx: Sender<Message>,
    callbacks: Callbacks<dyn IProfileConnectionCallback + Send>,
    machines: HashMap<PeerAddr, MachineProxy>,
    states: Arc<Mutex<HashMap<PeerAddr, ProfileState>>>,
}

impl ProfileManager {
    /// Constructs a manager issuing commands on `channel` and publishing
    /// messages on `tx`.
    pub fn new(
        profile: Profile,
        config: ProfileConfig,
        channel: Box<dyn CommandChannel + Send>,
        tx: Sender<Message>,
    ) -> ProfileManager {
        let callbacks = Callbacks::new(tx.clone(), Message::ConnectionCallbackDisconnected);
        ProfileManager {
            profile,
            config,
            channel: Arc::new(Mutex::new(channel)),
            tx,
            callbacks,
            machines: HashMap::new(),
            states: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Routes a completion or failure event from the native stack onto the
    /// owning peer's worker. A connect for a peer with no worker is a
    /// remote-initiated connection and starts one; anything else for an
    /// unknown peer is logged and dropped.
    pub fn dispatch_stack_event(&mut self, peer: PeerAddr, event: ConnectionEvent) {
        // A link that closes under a connected peer is not part of any
        // teardown handshake we started. Begin an orderly disconnect so the
        // machine sees the loss through its normal path.
        if event == ConnectionEvent::ConnectionClosed
            && self.get_connection_state(peer) == ProfileState::Connected
        {
            info!("{}: link to [{}] dropped, disconnecting", self.profile, peer);
            self.disconnect(peer);
            return;
        }

        match self.machines.get(&peer) {
            Some(proxy) => proxy.send(event),
            None => match event {
                ConnectionEvent::Connect(_) => {
                    if self.active_peer_count() >= self.config.max_connections {
                        warn!(
                            "{}: no slot for incoming connection from [{}]",
                            self.profile, peer
                        );
                        return;
                    }
                    let proxy = self.start_machine(peer);
                    proxy.send(event);
                }
                _ => {
                    debug!("{}: {:?} for unknown peer [{}], ignored", self.profile, event, peer)
                }
            },
        }
    }

    /// Stops every peer worker. Workers finish any in-flight teardown,
    /// drain their queues and retire.
    pub fn stop(&mut self) {
        info!("{}: stopping {} worker(s)", self.profile, self.machines.len());
        for proxy in self.machines.values() {
            proxy.send(ConnectionEvent::Quit);
        }
    }

    pub(crate) fn on_connection_state_changed(
        &mut self,
        peer: PeerAddr,
        prev_state: ProfileState,
        state: ProfileState,
    ) {
        debug!("{}: [{}] {:?} -> {:?}", self.profile, peer, prev_state, state);
        self.callbacks.for_all_callbacks(|callback| {
            callback.on_connection_state_changed(peer, prev_state, state);
        });
    }

    pub(crate) fn callback_disconnected(&mut self, id: u32) {
        self.callbacks.remove_callback(id);
    }

    pub(crate) fn on_peer_retired(&mut self, peer: PeerAddr) {
        debug!("{}: worker for [{}] retired", self.profile, peer);
        self.machines.remove(&peer);
        self.states.lock().unwrap().remove(&peer);
    }

    fn start_machine(&mut self, peer: PeerAddr) -> MachineProxy {
        debug!("{}: starting worker for [{}]", self.profile, peer);
        let machine = ConnectionStateMachine::new(
            peer,
            self.channel.clone(),
            self.states.clone(),
            self.config.clone(),
        );
        let context = ConnectionContext::new(machine);
        let proxy = context.get_proxy();
        tokio::spawn(state_machine::mainloop(context, self.tx.clone()));
        self.machines.insert(peer, proxy.clone());
        proxy
    }

    fn active_peer_count(&self) -> usize {
        self.states.lock().unwrap().values().filter(|s| **s != ProfileState::Disconnected).count()
    }
}

impl IProfileConnection for ProfileManager {
    fn register_callback(&mut self, callback: Box<dyn IProfileConnectionCallback + Send>) -> u32 {
        self.callbacks.add_callback(callback)
    }

    fn unregister_callback(&mut self, callback_id: u32) -> bool {
        self.callbacks.remove_callback(callback_id)
    }

    fn connect(&mut self, peer: PeerAddr) -> Result<(), ConnectionError> {
        if peer == PeerAddr::default() {
            warn!("{}: connect with the placeholder address, rejected", self.profile);
            return Err(ConnectionError::InvalidPeer);
        }

        // A peer already past Disconnected owns its slot; the duplicate
        // request is resolved by its own machine. Anyone else needs a free
        // slot first.
        if self.get_connection_state(peer) == ProfileState::Disconnected
            && self.active_peer_count() >= self.config.max_connections
        {
            warn!("{}: connection slots exhausted, rejecting [{}]", self.profile, peer);
            return Err(ConnectionError::AlreadyBound);
        }

        match self.machines.get(&peer) {
            Some(proxy) => proxy.send(ConnectionEvent::Connect(peer)),
            None => {
                let proxy = self.start_machine(peer);
                proxy.send(ConnectionEvent::Connect(peer));
            }
        }
        Ok(())
    }

    fn disconnect(&mut self, peer: PeerAddr) {
        match self.machines.get(&peer) {
            Some(proxy) => proxy.send(ConnectionEvent::Disconnect(peer)),
            None => debug!("{}: disconnect for unknown peer [{}], ignored", self.profile, peer),
        }
    }

    fn get_connection_state(&self, peer: PeerAddr) -> ProfileState {
        // Workers only take this lock for plain map updates, so a reader on
        // any thread returns promptly.
        match self.states.lock().unwrap().get(&peer) {
            Some(state) => *state,
            None => ProfileState::Disconnected,
        }
    }

    fn get_devices_matching_connection_states(&self, states: Vec<ProfileState>) -> Vec<PeerAddr> {
        let mut peers: Vec<PeerAddr> = self
            .states
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, state)| states.contains(*state))
            .map(|(peer, _)| *peer)
            .collect();
        peers.sort();
        peers
    }

    fn get_connected_devices(&self) -> Vec<PeerAddr> {
        let mut peers: Vec<PeerAddr> = self
            .states
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, state)| state_machine::state_to_connected(**state))
            .map(|(peer, _)| *peer)
            .collect();
        peers.sort();
        peers
    }

    fn get_device(&self) -> Option<PeerAddr> {
        let mut active: Vec<PeerAddr> = self
            .states
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, state)| **state != ProfileState::Disconnected)
            .map(|(peer, _)| *peer)
            .collect();
        active.sort();
        active.into_iter().next()
    }
}
