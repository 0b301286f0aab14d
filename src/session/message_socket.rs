// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0

//! RTSP message framing over a TCP stream.
//!
//! Reading accumulates bytes in a caller-owned buffer and peels off complete
//! messages; interleaved data frames come out of the same parser as requests
//! and responses. Writing happens in a dedicated task per connection so that
//! responses and fan-out frames from different producers are serialized onto
//! the socket in queue order.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use async_std::future::timeout;
use async_std::net::TcpStream;
use futures::channel::mpsc;
use futures::prelude::*;
use log::{debug, warn};

pub(crate) type RtspMessage = rtsp_types::Message<Vec<u8>>;

/// Extract the next complete message from `pending`, if any.
pub(crate) fn parse_message(pending: &mut Vec<u8>) -> io::Result<Option<RtspMessage>> {
    if pending.is_empty() {
        return Ok(None);
    }

    let (message, consumed) = match rtsp_types::Message::<&[u8]>::parse(&*pending) {
        Ok((message, consumed)) => (message, consumed),
        Err(rtsp_types::ParseError::Incomplete(_)) => return Ok(None),
        Err(rtsp_types::ParseError::Error) => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "invalid RTSP message",
            ));
        }
    };

    // The parsed message borrows `pending`; detach it before draining.
    let message = match message {
        rtsp_types::Message::Request(request) => {
            let body = request.body().to_vec();
            rtsp_types::Message::Request(request.replace_body(body))
        }
        rtsp_types::Message::Response(response) => {
            let body = response.body().to_vec();
            rtsp_types::Message::Response(response.replace_body(body))
        }
        rtsp_types::Message::Data(data) => {
            let channel_id = data.channel_id();
            rtsp_types::Message::Data(rtsp_types::Data::new(channel_id, data.into_body().to_vec()))
        }
    };

    pending.drain(..consumed);
    Ok(Some(message))
}

pub(crate) fn serialize_message(message: &RtspMessage) -> io::Result<Vec<u8>> {
    let mut data = Vec::new();
    message
        .write(&mut data)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "unserializable RTSP message"))?;
    Ok(data)
}

/// Outbound half of one connection.
///
/// Consumes queued messages until the queue closes or a write fails; a write
/// error or timeout wakes the read loop through the quit signal so the whole
/// session goes down together.
pub(crate) async fn send_task(
    mut stream: TcpStream,
    addr: SocketAddr,
    mut rx: mpsc::Receiver<RtspMessage>,
    write_timeout: Duration,
    mut quit_tx: mpsc::Sender<()>,
) {
    while let Some(message) = rx.next().await {
        let data = match serialize_message(&message) {
            Ok(data) => data,
            Err(err) => {
                warn!("[client {}] {}", addr, err);
                break;
            }
        };

        match timeout(write_timeout, stream.write_all(&data)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!("[client {}] write error: {}", addr, err);
                break;
            }
            Err(_) => {
                warn!("[client {}] write timeout", addr);
                break;
            }
        }
    }

    let _ = quit_tx.try_send(());
    debug!("[client {}] send task finished", addr);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_request_in_two_chunks() {
        let wire = b"OPTIONS rtsp://127.0.0.1/cam RTSP/1.0\r\nCSeq: 1\r\n\r\n";
        let mut pending = wire[..20].to_vec();
        assert!(parse_message(&mut pending).unwrap().is_none());

        pending.extend_from_slice(&wire[20..]);
        match parse_message(&mut pending).unwrap().unwrap() {
            rtsp_types::Message::Request(request) => {
                assert_eq!(request.method(), rtsp_types::Method::Options);
            }
            other => panic!("expected request, got {:?}", other),
        }
        assert!(pending.is_empty());
    }

    #[test]
    fn parses_interleaved_data() {
        let mut pending = vec![b'$', 2, 0, 3, 0xaa, 0xbb, 0xcc];
        match parse_message(&mut pending).unwrap().unwrap() {
            rtsp_types::Message::Data(data) => {
                assert_eq!(data.channel_id(), 2);
                assert_eq!(data.into_body(), vec![0xaa, 0xbb, 0xcc]);
            }
            other => panic!("expected data, got {:?}", other),
        }
    }

    #[test]
    fn garbage_is_an_error() {
        let mut pending = b"\x01\x02\x03garbage\r\n\r\n".to_vec();
        assert!(parse_message(&mut pending).is_err());
    }

    #[test]
    fn roundtrips_a_response() {
        let resp = rtsp_types::Response::builder(rtsp_types::Version::V1_0, rtsp_types::StatusCode::Ok)
            .header(rtsp_types::headers::CSEQ, "3")
            .build(Vec::new());
        let wire = serialize_message(&rtsp_types::Message::Response(resp)).unwrap();

        let mut pending = wire;
        match parse_message(&mut pending).unwrap().unwrap() {
            rtsp_types::Message::Response(response) => {
                assert_eq!(response.status(), rtsp_types::StatusCode::Ok);
            }
            other => panic!("expected response, got {:?}", other),
        }
    }
}
