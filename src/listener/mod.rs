// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0

//! Socket listeners.
//!
//! The TCP listener accepts RTSP control connections; the two UDP listeners
//! receive RTP and RTCP datagrams. Listeners only produce events; all
//! interpretation happens in the dispatcher.

pub(crate) mod tcp;
pub(crate) mod udp;
