// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0

//! Server assembly.
//!
//! Binds the sockets, starts the listeners, pullers and the dispatcher, and
//! hands back a [`Server`] whose [`close`](Server::close) drives the ordered
//! shutdown. Dropping the handle without calling `close` leaves the server
//! running for the process lifetime.

use std::io;
use std::sync::Arc;

use async_std::net::{TcpListener, UdpSocket};
use async_std::task;
use futures::channel::{mpsc, oneshot};
use log::{info, warn};

use crate::conf::Conf;
use crate::dispatcher::{Dispatcher, Handle, Shutdown, StreamerEntry, StreamerId, TrackFlow};
use crate::listener;
use crate::listener::udp::UdpWriter;
use crate::puller;

pub struct Server {
    handle: Handle,
    done: oneshot::Receiver<()>,
}

impl Server {
    /// Bind all sockets and start serving. The configuration must have passed
    /// [`Conf::check`].
    pub async fn run(conf: Conf) -> io::Result<Server> {
        let conf = Arc::new(conf);

        let (event_tx, event_rx) = mpsc::channel(0);
        let handle = Handle::new(event_tx);

        let rtp_socket = Arc::new(UdpSocket::bind(("0.0.0.0", conf.rtp_port)).await?);
        let rtcp_socket = Arc::new(UdpSocket::bind(("0.0.0.0", conf.rtcp_port)).await?);
        let rtsp_listener = TcpListener::bind(("0.0.0.0", conf.rtsp_port)).await?;

        let (rtp_quit_tx, rtp_quit_rx) = mpsc::channel(1);
        let (rtcp_quit_tx, rtcp_quit_rx) = mpsc::channel(1);
        let (tcp_quit_tx, tcp_quit_rx) = mpsc::channel(1);

        listener::udp::spawn(rtp_socket.clone(), TrackFlow::Rtp, handle.clone(), rtp_quit_rx);
        listener::udp::spawn(
            rtcp_socket.clone(),
            TrackFlow::Rtcp,
            handle.clone(),
            rtcp_quit_rx,
        );
        listener::tcp::spawn(rtsp_listener, handle.clone(), tcp_quit_rx);

        let mut streamers = Vec::new();
        let mut puller_quits = Vec::new();
        for (path, pconf) in conf.paths.iter() {
            let (url, protocol) = match (&pconf.source_url, pconf.source_protocol_parsed) {
                (Some(url), Some(protocol)) => (url.clone(), protocol),
                _ => continue,
            };

            let id = StreamerId(streamers.len());
            puller_quits.push(puller::spawn(
                id,
                path.clone(),
                url,
                protocol,
                conf.clone(),
                handle.clone(),
            ));
            streamers.push(StreamerEntry {
                path: path.clone(),
                ready: false,
                sdp_text: Vec::new(),
                sdp_parsed: None,
            });
        }

        if conf.pprof {
            warn!("pprof is enabled in the configuration but the endpoint is not bundled");
        }

        let shutdown = Shutdown {
            pullers: puller_quits,
            tcp: tcp_quit_tx,
            rtcp: rtcp_quit_tx,
            rtp: rtp_quit_tx,
        };
        let dispatcher = Dispatcher::new(
            conf.clone(),
            event_rx,
            handle.clone(),
            UdpWriter::new(rtp_socket),
            UdpWriter::new(rtcp_socket),
            streamers,
            shutdown,
        );

        let (done_tx, done_rx) = oneshot::channel();
        task::spawn(dispatcher.run(done_tx));

        info!(
            "rtsp listener opened on :{}, rtp on :{}, rtcp on :{}",
            conf.rtsp_port, conf.rtp_port, conf.rtcp_port
        );

        Ok(Server {
            handle,
            done: done_rx,
        })
    }

    /// Terminate the dispatcher, drain pending events, close every listener,
    /// puller and session, and return once everything is down.
    pub async fn close(self) {
        let Server { mut handle, done } = self;
        handle.terminate().await;
        drop(handle);
        let _ = done.await;
    }

    /// Park until the server terminates on its own, which in the absence of a
    /// [`close`](Server::close) call is never.
    pub async fn wait(self) {
        let _ = self.done.await;
    }
}
