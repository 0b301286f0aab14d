// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0

//! # rtsp-hub
//!
//! An RTSP server that relays media streams between publishers and readers.
//! Publishers push a stream onto a named path with ANNOUNCE/SETUP/RECORD;
//! readers pull it with DESCRIBE/SETUP/PLAY. Media travels either over the
//! shared RTP/RTCP UDP sockets or interleaved inside the RTSP control
//! connection. Paths can also be fed by pulling from an upstream RTSP server.
//!
//! ## Architecture
//!
//! Every component is a task and all coordination is message passing:
//!
//!  * The dispatcher is the single owner of all shared state: connected
//!    clients, the one-publisher-per-path registry and the live counters.
//!    It routes every media frame to the readers of its path. Nothing else
//!    holds a lock or mutates shared data.
//!  * Each client connection runs a session task with its own RTSP state
//!    machine; every transition is proposed to the dispatcher and awaited
//!    before the peer gets its answer.
//!  * The listeners feed accepted connections and UDP datagrams into the
//!    dispatcher.
//!  * A puller per configured upstream source acts as a long-lived RTSP
//!    client and republishes the upstream stream locally.

pub mod conf;
pub mod error;
pub mod server;

mod dispatcher;
mod listener;
mod puller;
mod session;

pub use conf::Conf;
pub use server::Server;
