// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0

use async_std::net::TcpListener;
use async_std::task;
use futures::channel::mpsc;
use futures::future::{self, Either};
use futures::prelude::*;
use log::{debug, warn};

use crate::dispatcher::Handle;

/// Accept RTSP control connections until told to quit. Every accepted
/// connection is handed to the dispatcher, which owns session creation.
pub(crate) fn spawn(
    listener: TcpListener,
    mut handle: Handle,
    mut quit: mpsc::Receiver<()>,
) -> task::JoinHandle<()> {
    task::spawn(async move {
        loop {
            let accept = listener.accept();
            futures::pin_mut!(accept);

            match future::select(accept, quit.next()).await {
                Either::Left((Ok((conn, addr)), _)) => {
                    debug!("accepted connection from {}", addr);
                    handle.new_client(conn).await;
                }
                Either::Left((Err(err), _)) => {
                    warn!("accept error: {}", err);
                    break;
                }
                Either::Right(_) => break,
            }
        }

        debug!("tcp listener finished");
    })
}
