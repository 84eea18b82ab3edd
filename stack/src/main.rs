// The daemon binary (btprofiled) is a fairly barebone bin file that depends
// on the btprofiles library which implements all of the logic. Please keep
// main.rs light: it only parses arguments, wires the composition root and
// drives a scripted connect/disconnect cycle against a loopback channel.

use btprofiles::config_util;
use btprofiles::logging::ProfileLogging;
use btprofiles::profile_manager::{IProfileConnection, IProfileConnectionCallback, ProfileManager};
use btprofiles::state_machine::{CommandChannel, ConnectionEvent, ProfileState};
use btprofiles::{PeerAddr, Profile, ProfileStack, RPCProxy};
use clap::{App, Arg};
use log::info;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};

/// Plays the role of a well-behaved remote stack so the state machinery can
/// be exercised without hardware: every command is answered with the
/// matching completion event after a short delay.
struct LoopbackChannel {
    tx: mpsc::Sender<(PeerAddr, ConnectionEvent)>,
}

impl LoopbackChannel {
    fn answer(&self, peer: PeerAddr, event: ConnectionEvent, delay: Duration) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            sleep(delay).await;
            let _ = tx.send((peer, event)).await;
        });
    }
}

impl CommandChannel for LoopbackChannel {
    fn issue_connect(&mut self, peer: PeerAddr) {
        self.answer(peer, ConnectionEvent::ConnectionComplete, Duration::from_millis(200));
    }

    fn issue_disconnect(&mut self, peer: PeerAddr) {
        self.answer(peer, ConnectionEvent::ConnectionClosed, Duration::from_millis(100));
    }

    fn force_abort(&mut self, _peer: PeerAddr) {}
}

struct ConsoleCallback {}

impl IProfileConnectionCallback for ConsoleCallback {
    fn on_connection_state_changed(
        &self,
        peer: PeerAddr,
        prev_state: ProfileState,
        state: ProfileState,
    ) {
        info!("[{}] {:?} -> {:?}", peer, prev_state, state);
    }
}

impl RPCProxy for ConsoleCallback {
    fn register_disconnect(&mut self, _f: Box<dyn Fn(u32) + Send>) -> u32 {
        0
    }

    fn get_object_id(&self) -> String {
        String::from("console_callback")
    }

    fn unregister(&mut self, _id: u32) -> bool {
        true
    }
}

#[tokio::main]
pub async fn main() {
    let matches = App::new("Bluetooth Profile Daemon")
        .arg(Arg::with_name("debug").long("debug").short("d").help("Enables debug level logs"))
        .arg(
            Arg::with_name("log-output")
                .long("log-output")
                .takes_value(true)
                .possible_values(&["syslog", "stderr"])
                .default_value("stderr")
                .help("Select log output"),
        )
        .arg(
            Arg::with_name("peer")
                .long("peer")
                .takes_value(true)
                .default_value("00:11:22:33:44:55")
                .help("Peer address to exercise"),
        )
        .get_matches();

    let is_debug = matches.is_present("debug");
    let log_output = matches.value_of("log-output").unwrap_or("stderr");
    let _logging = ProfileLogging::new(is_debug, log_output);
    log_panics::init();

    let peer =
        PeerAddr::from_string(matches.value_of("peer").unwrap()).expect("invalid peer address");

    let config = config_util::get_profile_config(Profile::PbapClient);
    let (tx, rx) = ProfileStack::create_channel();
    let (loopback_tx, mut loopback_rx) = mpsc::channel::<(PeerAddr, ConnectionEvent)>(10);

    let manager = Arc::new(Mutex::new(Box::new(ProfileManager::new(
        Profile::PbapClient,
        config,
        Box::new(LoopbackChannel { tx: loopback_tx }),
        tx,
    ))));

    manager.lock().unwrap().register_callback(Box::new(ConsoleCallback {}));

    tokio::spawn(ProfileStack::dispatch(rx, manager.clone()));

    // Completions from the loopback channel re-enter the stack the same way
    // native callbacks would.
    let event_manager = manager.clone();
    tokio::spawn(async move {
        while let Some((peer, event)) = loopback_rx.recv().await {
            event_manager.lock().unwrap().dispatch_stack_event(peer, event);
        }
    });

    info!("Connecting [{}]", peer);
    manager.lock().unwrap().connect(peer).expect("connect rejected");
    sleep(Duration::from_millis(500)).await;
    info!("Connection state: {:?}", manager.lock().unwrap().get_connection_state(peer));

    info!("Disconnecting [{}]", peer);
    manager.lock().unwrap().disconnect(peer);
    sleep(Duration::from_millis(500)).await;

    manager.lock().unwrap().stop();
    sleep(Duration::from_millis(100)).await;
    info!("Exiting");
}
