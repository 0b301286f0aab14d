// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0

//! Events consumed by the dispatcher and the handle used to produce them.
//!
//! Every state transition or media frame crosses this boundary; nothing else
//! touches the shared state. Reply-bearing events carry a fresh oneshot so a
//! reply can never be routed to the wrong request.

use std::net::SocketAddr;

use async_std::net::TcpStream;
use futures::channel::{mpsc, oneshot};
use futures::prelude::*;

use crate::conf::StreamProtocol;
use crate::error::ServerError;

use super::{ClientId, StreamerId, TrackFlow};

pub(crate) type Reply = oneshot::Sender<Result<(), ServerError>>;

pub(crate) enum Event {
    ClientNew(TcpStream),
    ClientClose {
        id: ClientId,
        done: oneshot::Sender<()>,
    },
    ClientDescribe {
        path: String,
        reply: oneshot::Sender<Option<Vec<u8>>>,
    },
    ClientAnnounce {
        id: ClientId,
        path: String,
        sdp_text: Vec<u8>,
        sdp_parsed: sdp_types::Session,
        reply: Reply,
    },
    ClientSetupPlay {
        id: ClientId,
        path: String,
        protocol: StreamProtocol,
        rtp_port: u16,
        rtcp_port: u16,
        reply: Reply,
    },
    ClientSetupRecord {
        id: ClientId,
        protocol: StreamProtocol,
        rtp_port: u16,
        rtcp_port: u16,
        reply: Reply,
    },
    ClientPlay1 {
        id: ClientId,
        reply: Reply,
    },
    ClientPlay2 {
        id: ClientId,
        reply: Reply,
    },
    ClientPause {
        id: ClientId,
        reply: Reply,
    },
    ClientRecord {
        id: ClientId,
        reply: Reply,
    },
    ClientFrameUdp {
        flow: TrackFlow,
        addr: SocketAddr,
        payload: Vec<u8>,
    },
    ClientFrameTcp {
        path: String,
        track_id: usize,
        flow: TrackFlow,
        payload: Vec<u8>,
    },
    StreamerReady {
        id: StreamerId,
        sdp_text: Vec<u8>,
        sdp_parsed: sdp_types::Session,
    },
    StreamerNotReady {
        id: StreamerId,
    },
    StreamerFrame {
        id: StreamerId,
        track_id: usize,
        flow: TrackFlow,
        payload: Vec<u8>,
    },
    Terminate,
}

/// Cloneable producer side of the dispatcher.
///
/// Sending suspends while the dispatcher is busy, which is what throttles
/// ingestion under load.
#[derive(Clone)]
pub(crate) struct Handle {
    tx: mpsc::Sender<Event>,
}

impl Handle {
    pub(crate) fn new(tx: mpsc::Sender<Event>) -> Handle {
        Handle { tx }
    }

    async fn send(&mut self, event: Event) {
        // A send failure means the dispatcher is gone; the caller notices
        // through its dropped reply channel.
        let _ = self.tx.send(event).await;
    }

    async fn transition<F>(&mut self, make: F) -> Result<(), ServerError>
    where
        F: FnOnce(Reply) -> Event,
    {
        let (reply, rx) = oneshot::channel();
        self.send(make(reply)).await;
        rx.await.map_err(|_| ServerError::Terminated)?
    }

    pub(crate) async fn new_client(&mut self, conn: TcpStream) {
        self.send(Event::ClientNew(conn)).await;
    }

    pub(crate) async fn close_client(&mut self, id: ClientId) {
        let (done, rx) = oneshot::channel();
        self.send(Event::ClientClose { id, done }).await;
        let _ = rx.await;
    }

    pub(crate) async fn describe(&mut self, path: String) -> Result<Option<Vec<u8>>, ServerError> {
        let (reply, rx) = oneshot::channel();
        self.send(Event::ClientDescribe { path, reply }).await;
        rx.await.map_err(|_| ServerError::Terminated)
    }

    pub(crate) async fn announce(
        &mut self,
        id: ClientId,
        path: String,
        sdp_text: Vec<u8>,
        sdp_parsed: sdp_types::Session,
    ) -> Result<(), ServerError> {
        self.transition(|reply| Event::ClientAnnounce {
            id,
            path,
            sdp_text,
            sdp_parsed,
            reply,
        })
        .await
    }

    pub(crate) async fn setup_play(
        &mut self,
        id: ClientId,
        path: String,
        protocol: StreamProtocol,
        rtp_port: u16,
        rtcp_port: u16,
    ) -> Result<(), ServerError> {
        self.transition(|reply| Event::ClientSetupPlay {
            id,
            path,
            protocol,
            rtp_port,
            rtcp_port,
            reply,
        })
        .await
    }

    pub(crate) async fn setup_record(
        &mut self,
        id: ClientId,
        protocol: StreamProtocol,
        rtp_port: u16,
        rtcp_port: u16,
    ) -> Result<(), ServerError> {
        self.transition(|reply| Event::ClientSetupRecord {
            id,
            protocol,
            rtp_port,
            rtcp_port,
            reply,
        })
        .await
    }

    pub(crate) async fn play1(&mut self, id: ClientId) -> Result<(), ServerError> {
        self.transition(|reply| Event::ClientPlay1 { id, reply }).await
    }

    pub(crate) async fn play2(&mut self, id: ClientId) -> Result<(), ServerError> {
        self.transition(|reply| Event::ClientPlay2 { id, reply }).await
    }

    pub(crate) async fn pause(&mut self, id: ClientId) -> Result<(), ServerError> {
        self.transition(|reply| Event::ClientPause { id, reply }).await
    }

    pub(crate) async fn record(&mut self, id: ClientId) -> Result<(), ServerError> {
        self.transition(|reply| Event::ClientRecord { id, reply }).await
    }

    pub(crate) async fn frame_udp(&mut self, flow: TrackFlow, addr: SocketAddr, payload: Vec<u8>) {
        self.send(Event::ClientFrameUdp { flow, addr, payload }).await;
    }

    pub(crate) async fn frame_tcp(
        &mut self,
        path: String,
        track_id: usize,
        flow: TrackFlow,
        payload: Vec<u8>,
    ) {
        self.send(Event::ClientFrameTcp {
            path,
            track_id,
            flow,
            payload,
        })
        .await;
    }

    pub(crate) async fn streamer_ready(
        &mut self,
        id: StreamerId,
        sdp_text: Vec<u8>,
        sdp_parsed: sdp_types::Session,
    ) {
        self.send(Event::StreamerReady {
            id,
            sdp_text,
            sdp_parsed,
        })
        .await;
    }

    pub(crate) async fn streamer_not_ready(&mut self, id: StreamerId) {
        self.send(Event::StreamerNotReady { id }).await;
    }

    pub(crate) async fn streamer_frame(
        &mut self,
        id: StreamerId,
        track_id: usize,
        flow: TrackFlow,
        payload: Vec<u8>,
    ) {
        self.send(Event::StreamerFrame {
            id,
            track_id,
            flow,
            payload,
        })
        .await;
    }

    pub(crate) async fn terminate(&mut self) {
        self.send(Event::Terminate).await;
    }
}
