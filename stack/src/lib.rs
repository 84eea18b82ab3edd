//! Generic per-profile Bluetooth connection management.
//!
//! This crate provides the connection state machinery shared by
//! application-layer profile implementations (A2DP, AVRCP, HFP, PBAP, ...),
//! independent of any RPC projection: a per-peer connection state machine
//! driven from a serialized worker queue, and a manager exposing the
//! synchronous query surface on top of it.

pub mod callbacks;
pub mod config_util;
pub mod logging;
pub mod profile_manager;
pub mod state_machine;

use std::convert::TryInto;
use std::fmt::{Debug, Display, Formatter};
use std::sync::{Arc, Mutex};

use log::debug;
use tokio::sync::mpsc::{channel, Receiver, Sender};

use crate::profile_manager::ProfileManager;
use crate::state_machine::ProfileState;

/// Represents a remote peer address.
#[derive(Copy, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerAddr {
    val: [u8; 6],
}

impl PeerAddr {
    /// Constructs a PeerAddr from a vector of 6 bytes.
    pub fn from_byte_vec(raw_addr: &Vec<u8>) -> Option<PeerAddr> {
        if let Ok(val) = raw_addr.clone().try_into() {
            return Some(PeerAddr { val });
        }
        None
    }

    /// Constructs a PeerAddr from a colon-separated hex string.
    pub fn from_string<S: Into<String>>(addr: S) -> Option<PeerAddr> {
        let addr: String = addr.into();
        let s = addr.split(':').collect::<Vec<&str>>();

        if s.len() != 6 {
            return None;
        }

        let mut raw: [u8; 6] = [0; 6];
        for i in 0..s.len() {
            raw[i] = match u8::from_str_radix(s[i], 16) {
                Ok(res) => res,
                Err(_) => {
                    return None;
                }
            };
        }

        Some(PeerAddr { val: raw })
    }

    pub fn to_byte_arr(&self) -> [u8; 6] {
        self.val
    }
}

impl Display for PeerAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.val[0], self.val[1], self.val[2], self.val[3], self.val[4], self.val[5]
        )
    }
}

impl Debug for PeerAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self, f)
    }
}

/// Application-layer profiles served by the connection manager.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Profile {
    A2dpSink,
    AvrcpController,
    Gatt,
    HeadsetClient,
    HidHost,
    MapClient,
    PbapClient,
    SapClient,
}

impl Profile {
    /// Key used for this profile in configuration files and logs.
    pub fn name(&self) -> &'static str {
        match self {
            Profile::A2dpSink => "a2dp_sink",
            Profile::AvrcpController => "avrcp_controller",
            Profile::Gatt => "gatt",
            Profile::HeadsetClient => "headset_client",
            Profile::HidHost => "hid_host",
            Profile::MapClient => "map_client",
            Profile::PbapClient => "pbap_client",
            Profile::SapClient => "sap_client",
        }
    }
}

impl Display for Profile {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Message types that are sent to the profile stack dispatch loop.
#[derive(Debug)]
pub enum Message {
    /// A peer's machine moved from one state to another.
    ConnectionStateChanged(PeerAddr, ProfileState, ProfileState),
    /// A registered callback went away.
    ConnectionCallbackDisconnected(u32),
    /// A peer's worker quit and drained its queue.
    PeerRetired(PeerAddr),
}

/// Umbrella for the profile stack dispatch loop.
pub struct ProfileStack {}

impl ProfileStack {
    /// Creates an mpsc channel for passing messages to the dispatch loop.
    pub fn create_channel() -> (Sender<Message>, Receiver<Message>) {
        channel::<Message>(10)
    }

    /// Runs the main dispatch loop.
    pub async fn dispatch(mut rx: Receiver<Message>, manager: Arc<Mutex<Box<ProfileManager>>>) {
        loop {
            let m = rx.recv().await;

            if m.is_none() {
                debug!("Profile stack dispatch loop quit");
                break;
            }

            match m.unwrap() {
                Message::ConnectionStateChanged(peer, prev_state, state) => {
                    manager.lock().unwrap().on_connection_state_changed(peer, prev_state, state);
                }

                Message::ConnectionCallbackDisconnected(id) => {
                    manager.lock().unwrap().callback_disconnected(id);
                }

                Message::PeerRetired(peer) => {
                    manager.lock().unwrap().on_peer_retired(peer);
                }
            }
        }
    }
}

/// Signifies that the object may be a proxy to a remote RPC object.
///
/// An object that implements RPCProxy may be disconnected from its remote
/// counterpart at any time and should let others observe that event.
pub trait RPCProxy {
    /// Registers a disconnect observer and returns an identifier for the
    /// registration.
    fn register_disconnect(&mut self, f: Box<dyn Fn(u32) + Send>) -> u32;

    /// Returns the ID of the object. For example this would be an object
    /// path in D-Bus RPC.
    fn get_object_id(&self) -> String;

    /// Removes a disconnect observer previously registered.
    fn unregister(&mut self, id: u32) -> bool;
}
