// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_std::net::UdpSocket;
use async_std::task;
use futures::channel::mpsc;
use futures::future::{self, Either};
use futures::prelude::*;
use log::{debug, warn};

use crate::dispatcher::{Handle, TrackFlow};

/// Shared write half of an RTP or RTCP socket.
///
/// `send_to` is atomic per datagram, so concurrent writers need no extra
/// serialization. Delivery is best-effort; a failed send is only logged.
#[derive(Clone)]
pub(crate) struct UdpWriter {
    socket: Arc<UdpSocket>,
}

impl UdpWriter {
    pub(crate) fn new(socket: Arc<UdpSocket>) -> UdpWriter {
        UdpWriter { socket }
    }

    pub(crate) async fn write(&self, payload: &[u8], addr: SocketAddr) {
        if let Err(err) = self.socket.send_to(payload, addr).await {
            debug!("udp send to {} failed: {}", addr, err);
        }
    }
}

/// Receive datagrams for one flow and post them to the dispatcher. The
/// payload is copied out of the receive buffer before it crosses the channel.
pub(crate) fn spawn(
    socket: Arc<UdpSocket>,
    flow: TrackFlow,
    mut handle: Handle,
    mut quit: mpsc::Receiver<()>,
) -> task::JoinHandle<()> {
    task::spawn(async move {
        let mut buf = vec![0u8; 65536];

        loop {
            enum Outcome {
                Data(usize, SocketAddr),
                Err(io::Error),
                Stop,
            }

            let outcome = {
                let recv = socket.recv_from(&mut buf);
                futures::pin_mut!(recv);
                match future::select(recv, quit.next()).await {
                    Either::Left((Ok((len, addr)), _)) => Outcome::Data(len, addr),
                    Either::Left((Err(err), _)) => Outcome::Err(err),
                    Either::Right(_) => Outcome::Stop,
                }
            };

            match outcome {
                Outcome::Data(len, addr) => {
                    handle.frame_udp(flow, addr, buf[..len].to_vec()).await;
                }
                Outcome::Err(err) => {
                    warn!("udp receive error: {}", err);
                    break;
                }
                Outcome::Stop => break,
            }
        }

        debug!("udp listener ({:?}) finished", flow);
    })
}
