// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0

//! The event dispatcher.
//!
//! A single task owns every piece of cross-cutting state: the set of
//! connected clients, the per-path publisher registry, the upstream puller
//! registry and the publisher/receiver counters. All of it is mutated from
//! exactly one place, the event loop below, so no locking is needed anywhere
//! in the server. Listeners, sessions and pullers communicate with the
//! dispatcher exclusively through [`Handle`].

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use async_std::task;
use futures::channel::{mpsc, oneshot};
use futures::prelude::*;
use log::{debug, info, warn};

use crate::conf::{canonical_ip, Conf, StreamProtocol};
use crate::error::ServerError;
use crate::listener::udp::UdpWriter;
use crate::session;
use crate::session::message_socket::RtspMessage;

pub(crate) mod messages;
pub(crate) use messages::{Event, Handle};

/// Identifies one client session for the whole lifetime of its connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ClientId(pub(crate) u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Index of an upstream puller in the dispatcher's registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StreamerId(pub(crate) usize);

/// Which of the two media flows a datagram or interleaved frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TrackFlow {
    Rtp,
    Rtcp,
}

impl TrackFlow {
    /// Interleaved channel carrying this flow for the given track.
    pub(crate) fn interleaved_channel(self, track_id: usize) -> u8 {
        (track_id as u8) * 2
            + match self {
                TrackFlow::Rtp => 0,
                TrackFlow::Rtcp => 1,
            }
    }

    /// Inverse of [`interleaved_channel`](Self::interleaved_channel).
    pub(crate) fn of_channel(channel: u8) -> (usize, TrackFlow) {
        let flow = if channel % 2 == 0 {
            TrackFlow::Rtp
        } else {
            TrackFlow::Rtcp
        };
        ((channel / 2) as usize, flow)
    }
}

/// One RTP/RTCP port pair of a session. The index in the session's track list
/// is the track id used on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Track {
    pub(crate) rtp_port: u16,
    pub(crate) rtcp_port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ClientState {
    Initial,
    Announce,
    PreRecord,
    Record,
    PrePlay,
    Play,
}

/// The dispatcher's view of one client session.
struct ClientEntry {
    state: ClientState,
    path: String,
    protocol: Option<StreamProtocol>,
    tracks: Vec<Track>,
    addr: SocketAddr,
    /// Arrival time of the most recent UDP frame of a recording client,
    /// consumed by liveness checking outside this crate.
    udp_last_frame: Option<Instant>,
    sdp_text: Vec<u8>,
    sdp_parsed: Option<sdp_types::Session>,
    out_tx: mpsc::Sender<RtspMessage>,
    quit_tx: mpsc::Sender<()>,
}

/// The dispatcher's view of one upstream puller. The registry slot exists for
/// the whole process lifetime; only `ready` flips.
pub(crate) struct StreamerEntry {
    pub(crate) path: String,
    pub(crate) ready: bool,
    pub(crate) sdp_text: Vec<u8>,
    pub(crate) sdp_parsed: Option<sdp_types::Session>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum PublisherId {
    Client(ClientId),
    Streamer(StreamerId),
}

/// Quit signals for everything the dispatcher closes on termination.
pub(crate) struct Shutdown {
    pub(crate) pullers: Vec<mpsc::Sender<()>>,
    pub(crate) tcp: mpsc::Sender<()>,
    pub(crate) rtcp: mpsc::Sender<()>,
    pub(crate) rtp: mpsc::Sender<()>,
}

pub(crate) struct Dispatcher {
    conf: Arc<Conf>,
    rx: mpsc::Receiver<Event>,
    handle: Handle,
    rtp_writer: UdpWriter,
    rtcp_writer: UdpWriter,
    clients: HashMap<ClientId, ClientEntry>,
    publishers: HashMap<String, PublisherId>,
    streamers: Vec<StreamerEntry>,
    publisher_count: usize,
    receiver_count: usize,
    next_client_id: u64,
    shutdown: Shutdown,
}

impl Dispatcher {
    pub(crate) fn new(
        conf: Arc<Conf>,
        rx: mpsc::Receiver<Event>,
        handle: Handle,
        rtp_writer: UdpWriter,
        rtcp_writer: UdpWriter,
        streamers: Vec<StreamerEntry>,
        shutdown: Shutdown,
    ) -> Dispatcher {
        let mut publishers = HashMap::new();
        for (i, streamer) in streamers.iter().enumerate() {
            publishers.insert(streamer.path.clone(), PublisherId::Streamer(StreamerId(i)));
        }

        Dispatcher {
            conf,
            rx,
            handle,
            rtp_writer,
            rtcp_writer,
            clients: HashMap::new(),
            publishers,
            streamers,
            publisher_count: 0,
            receiver_count: 0,
            next_client_id: 0,
            shutdown,
        }
    }

    fn log(&self, args: fmt::Arguments<'_>) {
        info!(
            "[{}/{}/{}] {}",
            self.clients.len(),
            self.publisher_count,
            self.receiver_count,
            args
        );
    }

    pub(crate) async fn run(mut self, done: oneshot::Sender<()>) {
        self.log(format_args!("rtsp-hub {}", env!("CARGO_PKG_VERSION")));

        loop {
            let event = match self.rx.next().await {
                Some(event) => event,
                None => break,
            };
            if let Event::Terminate = event {
                break;
            }
            self.handle_event(event).await;
        }

        debug!("dispatcher entering drain mode");

        let Dispatcher {
            rx,
            handle,
            mut clients,
            mut shutdown,
            ..
        } = self;
        drop(handle);

        // Keep answering reply-bearing events while everything unwinds, so no
        // producer stays blocked; the drain ends once the last producer handle
        // is gone.
        let drain = task::spawn(drain_events(rx));

        for puller in shutdown.pullers.iter_mut() {
            let _ = puller.try_send(());
        }
        let _ = shutdown.tcp.try_send(());
        let _ = shutdown.rtcp.try_send(());
        let _ = shutdown.rtp.try_send(());
        for client in clients.values_mut() {
            let _ = client.quit_tx.try_send(());
        }
        drop(clients);
        drop(shutdown);

        drain.await;
        debug!("dispatcher finished");
        let _ = done.send(());
    }

    async fn handle_event(&mut self, event: Event) {
        match event {
            Event::ClientNew(conn) => {
                let addr = match conn.peer_addr() {
                    Ok(addr) => addr,
                    Err(err) => {
                        warn!("dropping connection without a peer address: {}", err);
                        return;
                    }
                };

                let id = ClientId(self.next_client_id);
                self.next_client_id += 1;

                let (out_tx, out_rx) = mpsc::channel(64);
                let (quit_tx, quit_rx) = mpsc::channel(1);

                self.clients.insert(
                    id,
                    ClientEntry {
                        state: ClientState::Initial,
                        path: String::new(),
                        protocol: None,
                        tracks: Vec::new(),
                        addr,
                        udp_last_frame: None,
                        sdp_text: Vec::new(),
                        sdp_parsed: None,
                        out_tx: out_tx.clone(),
                        quit_tx: quit_tx.clone(),
                    },
                );

                session::spawn(
                    id,
                    conn,
                    addr,
                    self.conf.clone(),
                    self.handle.clone(),
                    out_tx,
                    out_rx,
                    quit_tx,
                    quit_rx,
                );

                if let Some(script) = &self.conf.pre_script {
                    run_hook(script);
                }

                self.log(format_args!("[client {}] connected", addr));
            }

            Event::ClientClose { id, done } => {
                let entry = match self.clients.remove(&id) {
                    Some(entry) => entry,
                    None => {
                        let _ = done.send(());
                        return;
                    }
                };

                if !entry.path.is_empty() {
                    let owns_slot = matches!(
                        self.publishers.get(&entry.path),
                        Some(PublisherId::Client(owner)) if *owner == id
                    );
                    if owns_slot {
                        self.publishers.remove(&entry.path);

                        // A ready publisher going away ends the stream for
                        // everyone reading it.
                        if entry.state == ClientState::Record {
                            self.close_clients_on_path(&entry.path);
                        }
                    }
                }

                match entry.state {
                    ClientState::Play => self.receiver_count -= 1,
                    ClientState::Record => self.publisher_count -= 1,
                    _ => {}
                }

                if let Some(script) = &self.conf.post_script {
                    run_hook(script);
                }

                self.log(format_args!("[client {}] disconnected", entry.addr));
                let _ = done.send(());
            }

            Event::ClientDescribe { path, reply } => {
                let sdp = self
                    .publishers
                    .get(&path)
                    .filter(|publisher| self.publisher_ready(publisher))
                    .and_then(|publisher| self.publisher_sdp_text(publisher));
                let _ = reply.send(sdp);
            }

            Event::ClientAnnounce {
                id,
                path,
                sdp_text,
                sdp_parsed,
                reply,
            } => {
                if self.publishers.contains_key(&path) {
                    let _ = reply.send(Err(ServerError::AlreadyPublishing(path)));
                    return;
                }
                let client = match self.clients.get_mut(&id) {
                    Some(client) => client,
                    None => {
                        let _ = reply.send(Err(ServerError::WrongState));
                        return;
                    }
                };
                client.path = path.clone();
                client.state = ClientState::Announce;
                client.sdp_text = sdp_text;
                client.sdp_parsed = Some(sdp_parsed);
                self.publishers.insert(path, PublisherId::Client(id));
                let _ = reply.send(Ok(()));
            }

            Event::ClientSetupPlay {
                id,
                path,
                protocol,
                rtp_port,
                rtcp_port,
                reply,
            } => {
                let _ = reply.send(self.setup_play(id, path, protocol, rtp_port, rtcp_port));
            }

            Event::ClientSetupRecord {
                id,
                protocol,
                rtp_port,
                rtcp_port,
                reply,
            } => {
                let result = match self.clients.get_mut(&id) {
                    Some(client) => {
                        client.protocol = Some(protocol);
                        client.tracks.push(Track { rtp_port, rtcp_port });
                        client.state = ClientState::PreRecord;
                        Ok(())
                    }
                    None => Err(ServerError::WrongState),
                };
                let _ = reply.send(result);
            }

            Event::ClientPlay1 { id, reply } => {
                let _ = reply.send(self.play1(id));
            }

            Event::ClientPlay2 { id, reply } => {
                if let Some(client) = self.clients.get_mut(&id) {
                    self.receiver_count += 1;
                    client.state = ClientState::Play;
                }
                let _ = reply.send(Ok(()));
            }

            Event::ClientPause { id, reply } => {
                if let Some(client) = self.clients.get_mut(&id) {
                    self.receiver_count -= 1;
                    client.state = ClientState::PrePlay;
                }
                let _ = reply.send(Ok(()));
            }

            Event::ClientRecord { id, reply } => {
                if let Some(client) = self.clients.get_mut(&id) {
                    self.publisher_count += 1;
                    client.state = ClientState::Record;
                }
                let _ = reply.send(Ok(()));
            }

            Event::ClientFrameUdp {
                flow,
                addr,
                payload,
            } => {
                // Attribute the datagram to a recording UDP publisher by
                // source address; no match means the frame is dropped.
                let source = self.find_udp_source(flow, addr);
                if let Some((id, track_id, path)) = source {
                    if let Some(client) = self.clients.get_mut(&id) {
                        client.udp_last_frame = Some(Instant::now());
                    }
                    self.forward_track(&path, track_id, flow, &payload).await;
                }
            }

            Event::ClientFrameTcp {
                path,
                track_id,
                flow,
                payload,
            } => {
                self.forward_track(&path, track_id, flow, &payload).await;
            }

            Event::StreamerReady {
                id,
                sdp_text,
                sdp_parsed,
            } => {
                if let Some(streamer) = self.streamers.get_mut(id.0) {
                    streamer.ready = true;
                    streamer.sdp_text = sdp_text;
                    streamer.sdp_parsed = Some(sdp_parsed);
                    self.publisher_count += 1;
                    let path = streamer.path.clone();
                    self.log(format_args!("[puller {}] ready", path));
                }
            }

            Event::StreamerNotReady { id } => {
                if let Some(streamer) = self.streamers.get_mut(id.0) {
                    streamer.ready = false;
                    self.publisher_count -= 1;
                    let path = streamer.path.clone();
                    self.log(format_args!("[puller {}] not ready", path));
                    self.close_clients_on_path(&path);
                }
            }

            Event::StreamerFrame {
                id,
                track_id,
                flow,
                payload,
            } => {
                let path = match self.streamers.get(id.0) {
                    Some(streamer) => streamer.path.clone(),
                    None => return,
                };
                self.forward_track(&path, track_id, flow, &payload).await;
            }

            Event::Terminate => {}
        }
    }

    fn setup_play(
        &mut self,
        id: ClientId,
        path: String,
        protocol: StreamProtocol,
        rtp_port: u16,
        rtcp_port: u16,
    ) -> Result<(), ServerError> {
        let publisher = match self.publishers.get(&path) {
            Some(publisher) if self.publisher_ready(publisher) => *publisher,
            _ => return Err(ServerError::NoOneStreaming(path)),
        };
        let media_count = self.publisher_media_count(&publisher);

        let client = self.clients.get_mut(&id).ok_or(ServerError::WrongState)?;
        if client.tracks.len() >= media_count {
            return Err(ServerError::TracksAlreadySetup);
        }

        client.path = path;
        client.protocol = Some(protocol);
        client.tracks.push(Track { rtp_port, rtcp_port });
        client.state = ClientState::PrePlay;
        Ok(())
    }

    fn play1(&self, id: ClientId) -> Result<(), ServerError> {
        let client = self.clients.get(&id).ok_or(ServerError::WrongState)?;
        let publisher = match self.publishers.get(&client.path) {
            Some(publisher) if self.publisher_ready(publisher) => publisher,
            _ => return Err(ServerError::NoOneStreaming(client.path.clone())),
        };
        if client.tracks.len() != self.publisher_media_count(publisher) {
            return Err(ServerError::TracksNotSetup);
        }
        Ok(())
    }

    fn publisher_ready(&self, publisher: &PublisherId) -> bool {
        match publisher {
            PublisherId::Client(id) => self
                .clients
                .get(id)
                .map(|client| client.state == ClientState::Record)
                .unwrap_or(false),
            PublisherId::Streamer(id) => self
                .streamers
                .get(id.0)
                .map(|streamer| streamer.ready)
                .unwrap_or(false),
        }
    }

    fn publisher_sdp_text(&self, publisher: &PublisherId) -> Option<Vec<u8>> {
        match publisher {
            PublisherId::Client(id) => self
                .clients
                .get(id)
                .filter(|client| !client.sdp_text.is_empty())
                .map(|client| client.sdp_text.clone()),
            PublisherId::Streamer(id) => self
                .streamers
                .get(id.0)
                .filter(|streamer| !streamer.sdp_text.is_empty())
                .map(|streamer| streamer.sdp_text.clone()),
        }
    }

    fn publisher_media_count(&self, publisher: &PublisherId) -> usize {
        let sdp = match publisher {
            PublisherId::Client(id) => self.clients.get(id).and_then(|c| c.sdp_parsed.as_ref()),
            PublisherId::Streamer(id) => {
                self.streamers.get(id.0).and_then(|s| s.sdp_parsed.as_ref())
            }
        };
        sdp.map(|session| session.medias.len()).unwrap_or(0)
    }

    fn find_udp_source(
        &self,
        flow: TrackFlow,
        addr: SocketAddr,
    ) -> Option<(ClientId, usize, String)> {
        let source_ip = canonical_ip(addr.ip());

        for publisher in self.publishers.values() {
            let id = match publisher {
                PublisherId::Client(id) => id,
                PublisherId::Streamer(_) => continue,
            };
            let client = match self.clients.get(id) {
                Some(client) => client,
                None => continue,
            };
            if client.protocol != Some(StreamProtocol::Udp)
                || client.state != ClientState::Record
                || canonical_ip(client.addr.ip()) != source_ip
            {
                continue;
            }

            for (track_id, track) in client.tracks.iter().enumerate() {
                let port = match flow {
                    TrackFlow::Rtp => track.rtp_port,
                    TrackFlow::Rtcp => track.rtcp_port,
                };
                if port == addr.port() {
                    return Some((*id, track_id, client.path.clone()));
                }
            }
        }

        None
    }

    /// Deliver one frame to every client in PLAY state on the given path.
    async fn forward_track(&mut self, path: &str, track_id: usize, flow: TrackFlow, payload: &[u8]) {
        let writer = match flow {
            TrackFlow::Rtp => &self.rtp_writer,
            TrackFlow::Rtcp => &self.rtcp_writer,
        };

        for client in self.clients.values_mut() {
            if client.state != ClientState::Play || client.path != path {
                continue;
            }
            let track = match client.tracks.get(track_id) {
                Some(track) => *track,
                None => continue,
            };

            match client.protocol {
                Some(StreamProtocol::Udp) => {
                    let port = match flow {
                        TrackFlow::Rtp => track.rtp_port,
                        TrackFlow::Rtcp => track.rtcp_port,
                    };
                    writer
                        .write(payload, SocketAddr::new(client.addr.ip(), port))
                        .await;
                }
                Some(StreamProtocol::Tcp) => {
                    let channel = flow.interleaved_channel(track_id);
                    let data = rtsp_types::Data::new(channel, payload.to_vec());
                    if let Err(err) = client.out_tx.try_send(data.into()) {
                        if err.is_full() {
                            warn!("[client {}] send queue full, closing reader", client.addr);
                            let _ = client.quit_tx.try_send(());
                        }
                    }
                }
                None => {}
            }
        }
    }

    /// Tell every session bound to `path` to shut down.
    fn close_clients_on_path(&mut self, path: &str) {
        for client in self.clients.values_mut() {
            if client.path == path {
                let _ = client.quit_tx.try_send(());
            }
        }
    }
}

async fn drain_events(mut rx: mpsc::Receiver<Event>) {
    while let Some(event) = rx.next().await {
        match event {
            Event::ClientClose { done, .. } => {
                let _ = done.send(());
            }
            Event::ClientDescribe { reply, .. } => {
                let _ = reply.send(None);
            }
            Event::ClientAnnounce { reply, .. }
            | Event::ClientSetupPlay { reply, .. }
            | Event::ClientSetupRecord { reply, .. }
            | Event::ClientPlay1 { reply, .. }
            | Event::ClientPlay2 { reply, .. }
            | Event::ClientPause { reply, .. }
            | Event::ClientRecord { reply, .. } => {
                let _ = reply.send(Err(ServerError::Terminated));
            }
            _ => {}
        }
    }
}

/// Run a pre/post connection hook, detached. The exit status only shows up in
/// the log.
fn run_hook(script: &str) {
    let script = script.to_owned();
    std::thread::spawn(move || match std::process::Command::new(&script).status() {
        Ok(status) => debug!("hook '{}' exited with {}", script, status),
        Err(err) => warn!("hook '{}' could not be run: {}", script, err),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_std::net::UdpSocket;

    fn test_sdp(media_count: usize) -> sdp_types::Session {
        let mut text = String::from(
            "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=Stream\r\nc=IN IP4 0.0.0.0\r\nt=0 0\r\n",
        );
        for _ in 0..media_count {
            text.push_str("m=video 0 RTP/AVP 96\r\na=rtpmap:96 H264/90000\r\n");
        }
        sdp_types::Session::parse(text.as_bytes()).unwrap()
    }

    fn sdp_bytes(media_count: usize) -> Vec<u8> {
        let mut out = Vec::new();
        test_sdp(media_count).write(&mut out).unwrap();
        out
    }

    async fn fixture() -> (Dispatcher, Handle) {
        let mut conf = Conf::default();
        conf.check().unwrap();

        let (tx, rx) = mpsc::channel(0);
        let handle = Handle::new(tx);

        let rtp = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let rtcp = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());

        let (dummy_tx, _dummy_rx) = mpsc::channel(1);
        let shutdown = Shutdown {
            pullers: Vec::new(),
            tcp: dummy_tx.clone(),
            rtcp: dummy_tx.clone(),
            rtp: dummy_tx,
        };

        let dispatcher = Dispatcher::new(
            Arc::new(conf),
            rx,
            handle.clone(),
            UdpWriter::new(rtp),
            UdpWriter::new(rtcp),
            Vec::new(),
            shutdown,
        );
        (dispatcher, handle)
    }

    fn add_client(
        dispatcher: &mut Dispatcher,
        id: u64,
        addr: &str,
    ) -> (mpsc::Receiver<RtspMessage>, mpsc::Receiver<()>) {
        let (out_tx, out_rx) = mpsc::channel(8);
        let (quit_tx, quit_rx) = mpsc::channel(1);
        dispatcher.clients.insert(
            ClientId(id),
            ClientEntry {
                state: ClientState::Initial,
                path: String::new(),
                protocol: None,
                tracks: Vec::new(),
                addr: addr.parse().unwrap(),
                udp_last_frame: None,
                sdp_text: Vec::new(),
                sdp_parsed: None,
                out_tx,
                quit_tx,
            },
        );
        (out_rx, quit_rx)
    }

    fn announce(dispatcher: &mut Dispatcher, id: u64, path: &str) -> Result<(), ServerError> {
        let (reply, mut rx) = oneshot::channel();
        task::block_on(dispatcher.handle_event(Event::ClientAnnounce {
            id: ClientId(id),
            path: path.into(),
            sdp_text: sdp_bytes(1),
            sdp_parsed: test_sdp(1),
            reply,
        }));
        rx.try_recv().unwrap().unwrap()
    }

    fn transition(
        dispatcher: &mut Dispatcher,
        make: impl FnOnce(messages::Reply) -> Event,
    ) -> Result<(), ServerError> {
        let (reply, mut rx) = oneshot::channel();
        task::block_on(dispatcher.handle_event(make(reply)));
        rx.try_recv().unwrap().unwrap()
    }

    fn close(dispatcher: &mut Dispatcher, id: u64) {
        let (done, mut rx) = oneshot::channel();
        task::block_on(dispatcher.handle_event(Event::ClientClose {
            id: ClientId(id),
            done,
        }));
        assert!(rx.try_recv().unwrap().is_some());
    }

    fn make_udp_publisher(dispatcher: &mut Dispatcher, id: u64, addr: &str, path: &str) {
        add_client(dispatcher, id, addr);
        announce(dispatcher, id, path).unwrap();
        transition(dispatcher, |reply| Event::ClientSetupRecord {
            id: ClientId(id),
            protocol: StreamProtocol::Udp,
            rtp_port: 14000,
            rtcp_port: 14001,
            reply,
        })
        .unwrap();
        transition(dispatcher, |reply| Event::ClientRecord {
            id: ClientId(id),
            reply,
        })
        .unwrap();
    }

    fn make_tcp_reader(
        dispatcher: &mut Dispatcher,
        id: u64,
        addr: &str,
        path: &str,
    ) -> (mpsc::Receiver<RtspMessage>, mpsc::Receiver<()>) {
        let channels = add_client(dispatcher, id, addr);
        transition(dispatcher, |reply| Event::ClientSetupPlay {
            id: ClientId(id),
            path: path.into(),
            protocol: StreamProtocol::Tcp,
            rtp_port: 0,
            rtcp_port: 0,
            reply,
        })
        .unwrap();
        transition(dispatcher, |reply| Event::ClientPlay1 {
            id: ClientId(id),
            reply,
        })
        .unwrap();
        transition(dispatcher, |reply| Event::ClientPlay2 {
            id: ClientId(id),
            reply,
        })
        .unwrap();
        channels
    }

    #[test]
    fn announce_conflict_is_rejected() {
        let (mut dispatcher, _handle) = task::block_on(fixture());
        add_client(&mut dispatcher, 1, "10.0.0.1:5000");
        add_client(&mut dispatcher, 2, "10.0.0.2:5000");

        announce(&mut dispatcher, 1, "cam").unwrap();
        let err = announce(&mut dispatcher, 2, "cam").unwrap_err();
        assert_eq!(err, ServerError::AlreadyPublishing("cam".into()));

        // first publisher untouched
        assert_eq!(
            dispatcher.clients[&ClientId(1)].state,
            ClientState::Announce
        );
    }

    #[test]
    fn announce_teardown_announce_succeeds_twice() {
        let (mut dispatcher, _handle) = task::block_on(fixture());
        add_client(&mut dispatcher, 1, "10.0.0.1:5000");
        announce(&mut dispatcher, 1, "cam").unwrap();
        close(&mut dispatcher, 1);

        add_client(&mut dispatcher, 2, "10.0.0.1:5002");
        announce(&mut dispatcher, 2, "cam").unwrap();
    }

    #[test]
    fn counters_follow_record_and_play() {
        let (mut dispatcher, _handle) = task::block_on(fixture());
        make_udp_publisher(&mut dispatcher, 1, "10.0.0.1:5000", "cam");
        assert_eq!(dispatcher.publisher_count, 1);

        let _reader = make_tcp_reader(&mut dispatcher, 2, "10.0.0.2:5000", "cam");
        assert_eq!(dispatcher.receiver_count, 1);

        // PLAY -> PAUSE -> PLAY leaves the receiver count where it was
        transition(&mut dispatcher, |reply| Event::ClientPause {
            id: ClientId(2),
            reply,
        })
        .unwrap();
        assert_eq!(dispatcher.receiver_count, 0);
        transition(&mut dispatcher, |reply| Event::ClientPlay2 {
            id: ClientId(2),
            reply,
        })
        .unwrap();
        assert_eq!(dispatcher.receiver_count, 1);

        close(&mut dispatcher, 2);
        assert_eq!(dispatcher.receiver_count, 0);
        close(&mut dispatcher, 1);
        assert_eq!(dispatcher.publisher_count, 0);
    }

    #[test]
    fn describe_needs_a_ready_publisher() {
        let (mut dispatcher, _handle) = task::block_on(fixture());

        let (reply, mut rx) = oneshot::channel();
        task::block_on(dispatcher.handle_event(Event::ClientDescribe {
            path: "cam".into(),
            reply,
        }));
        assert_eq!(rx.try_recv().unwrap(), Some(None));

        make_udp_publisher(&mut dispatcher, 1, "10.0.0.1:5000", "cam");
        let (reply, mut rx) = oneshot::channel();
        task::block_on(dispatcher.handle_event(Event::ClientDescribe {
            path: "cam".into(),
            reply,
        }));
        let sdp = rx.try_recv().unwrap().unwrap().unwrap();
        assert!(!sdp.is_empty());
    }

    #[test]
    fn setup_play_is_bounded_by_media_count() {
        let (mut dispatcher, _handle) = task::block_on(fixture());
        make_udp_publisher(&mut dispatcher, 1, "10.0.0.1:5000", "cam");
        add_client(&mut dispatcher, 2, "10.0.0.2:5000");

        transition(&mut dispatcher, |reply| Event::ClientSetupPlay {
            id: ClientId(2),
            path: "cam".into(),
            protocol: StreamProtocol::Udp,
            rtp_port: 24000,
            rtcp_port: 24001,
            reply,
        })
        .unwrap();

        // the publisher's SDP has one media, so a second SETUP must fail
        let err = transition(&mut dispatcher, |reply| Event::ClientSetupPlay {
            id: ClientId(2),
            path: "cam".into(),
            protocol: StreamProtocol::Udp,
            rtp_port: 24002,
            rtcp_port: 24003,
            reply,
        })
        .unwrap_err();
        assert_eq!(err, ServerError::TracksAlreadySetup);
    }

    #[test]
    fn play1_requires_all_tracks() {
        let (mut dispatcher, _handle) = task::block_on(fixture());
        add_client(&mut dispatcher, 1, "10.0.0.1:5000");
        announce(&mut dispatcher, 1, "cam").unwrap();

        add_client(&mut dispatcher, 2, "10.0.0.2:5000");
        // publisher not ready yet (still in ANNOUNCE)
        let err = transition(&mut dispatcher, |reply| Event::ClientSetupPlay {
            id: ClientId(2),
            path: "cam".into(),
            protocol: StreamProtocol::Udp,
            rtp_port: 24000,
            rtcp_port: 24001,
            reply,
        })
        .unwrap_err();
        assert_eq!(err, ServerError::NoOneStreaming("cam".into()));
    }

    #[test]
    fn udp_frames_are_attributed_and_forwarded() {
        let (mut dispatcher, _handle) = task::block_on(fixture());
        make_udp_publisher(&mut dispatcher, 1, "10.0.0.1:5000", "cam");
        let (mut out_rx, _quit_rx) = make_tcp_reader(&mut dispatcher, 2, "10.0.0.2:5000", "cam");

        // source port must match the publisher's announced track port
        task::block_on(dispatcher.handle_event(Event::ClientFrameUdp {
            flow: TrackFlow::Rtp,
            addr: "10.0.0.1:14000".parse().unwrap(),
            payload: b"payload".to_vec(),
        }));

        match out_rx.try_next().unwrap().unwrap() {
            rtsp_types::Message::Data(data) => {
                assert_eq!(data.channel_id(), 0);
                assert_eq!(data.into_body(), b"payload".to_vec());
            }
            other => panic!("expected interleaved data, got {:?}", other),
        }
        assert!(dispatcher.clients[&ClientId(1)].udp_last_frame.is_some());
    }

    #[test]
    fn unattributed_udp_frames_are_dropped() {
        let (mut dispatcher, _handle) = task::block_on(fixture());
        make_udp_publisher(&mut dispatcher, 1, "10.0.0.1:5000", "cam");
        let (mut out_rx, _quit_rx) = make_tcp_reader(&mut dispatcher, 2, "10.0.0.2:5000", "cam");

        // wrong source port
        task::block_on(dispatcher.handle_event(Event::ClientFrameUdp {
            flow: TrackFlow::Rtp,
            addr: "10.0.0.1:15000".parse().unwrap(),
            payload: b"payload".to_vec(),
        }));
        // wrong source ip
        task::block_on(dispatcher.handle_event(Event::ClientFrameUdp {
            flow: TrackFlow::Rtp,
            addr: "10.0.0.9:14000".parse().unwrap(),
            payload: b"payload".to_vec(),
        }));

        assert!(out_rx.try_next().is_err());
        assert!(dispatcher.clients[&ClientId(1)].udp_last_frame.is_none());
    }

    #[test]
    fn publisher_close_cascades_to_readers() {
        let (mut dispatcher, _handle) = task::block_on(fixture());
        make_udp_publisher(&mut dispatcher, 1, "10.0.0.1:5000", "cam");
        let (_out_rx, mut quit_rx) = make_tcp_reader(&mut dispatcher, 2, "10.0.0.2:5000", "cam");

        close(&mut dispatcher, 1);

        assert!(quit_rx.try_next().unwrap().is_some());
        assert!(!dispatcher.publishers.contains_key("cam"));
    }

    #[test]
    fn streamer_slot_survives_not_ready() {
        let (mut dispatcher, _handle) = task::block_on(fixture());
        dispatcher.streamers.push(StreamerEntry {
            path: "mirror".into(),
            ready: false,
            sdp_text: Vec::new(),
            sdp_parsed: None,
        });
        dispatcher
            .publishers
            .insert("mirror".into(), PublisherId::Streamer(StreamerId(0)));

        task::block_on(dispatcher.handle_event(Event::StreamerReady {
            id: StreamerId(0),
            sdp_text: sdp_bytes(1),
            sdp_parsed: test_sdp(1),
        }));
        assert_eq!(dispatcher.publisher_count, 1);

        let (_out_rx, mut quit_rx) = make_tcp_reader(&mut dispatcher, 1, "10.0.0.2:5000", "mirror");

        task::block_on(dispatcher.handle_event(Event::StreamerNotReady { id: StreamerId(0) }));
        assert_eq!(dispatcher.publisher_count, 0);
        assert!(quit_rx.try_next().unwrap().is_some());
        // the slot stays installed for the process lifetime
        assert!(dispatcher.publishers.contains_key("mirror"));
    }

    #[test]
    fn terminate_drains_pending_events() {
        task::block_on(async {
            let (dispatcher, mut handle) = fixture().await;
            let (done_tx, done_rx) = oneshot::channel();
            let runner = task::spawn(dispatcher.run(done_tx));

            handle.terminate().await;
            let err = handle
                .announce(ClientId(7), "cam".into(), sdp_bytes(1), test_sdp(1))
                .await
                .unwrap_err();
            assert_eq!(err, ServerError::Terminated);

            drop(handle);
            done_rx.await.unwrap();
            runner.await;
        });
    }
}
