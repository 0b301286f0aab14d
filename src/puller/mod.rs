// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0

//! Upstream pullers.
//!
//! A puller is a long-lived RTSP client that republishes an upstream stream
//! on a local path. It performs DESCRIBE, SETUP for every media and PLAY,
//! then pumps frames into the dispatcher like any publishing client would.
//! The registry slot in the dispatcher exists for the whole process lifetime;
//! this task only flips it between ready and not ready.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_std::future::timeout;
use async_std::net::{TcpStream, UdpSocket};
use async_std::task;
use futures::channel::{mpsc, oneshot};
use futures::future::{self, Either};
use futures::prelude::*;
use log::{debug, warn};
use url::Url;

use rtsp_types::headers::transport::{
    RtpLowerTransport, RtpProfile, RtpTransport, RtpTransportParameters,
};
use rtsp_types::headers::{self, CSeq, Transport, Transports};
use rtsp_types::{Method, StatusCode, Version};

use crate::conf::{Conf, StreamProtocol};
use crate::dispatcher::{Handle, StreamerId, TrackFlow};
use crate::session::message_socket;

const RETRY_PAUSE: Duration = Duration::from_secs(5);

pub(crate) fn spawn(
    id: StreamerId,
    path: String,
    url: Url,
    protocol: StreamProtocol,
    conf: Arc<Conf>,
    handle: Handle,
) -> mpsc::Sender<()> {
    let (quit_tx, quit_rx) = mpsc::channel(1);

    let puller = Puller {
        id,
        path,
        url,
        protocol,
        conf,
        handle,
        ready: false,
        cseq: 0,
        session: String::new(),
    };
    task::spawn(run(puller, quit_rx));

    quit_tx
}

struct Puller {
    id: StreamerId,
    path: String,
    url: Url,
    protocol: StreamProtocol,
    conf: Arc<Conf>,
    handle: Handle,
    ready: bool,
    cseq: u32,
    session: String,
}

async fn run(mut puller: Puller, mut quit: mpsc::Receiver<()>) {
    loop {
        let result = {
            let attempt = puller.attempt();
            futures::pin_mut!(attempt);
            match future::select(attempt, quit.next()).await {
                Either::Left((result, _)) => Some(result),
                Either::Right(_) => None,
            }
        };

        match result {
            Some(Err(err)) => warn!("[puller {}] {}", puller.path, err),
            Some(Ok(())) => debug!("[puller {}] upstream ended", puller.path),
            None => break,
        }

        if puller.ready {
            puller.ready = false;
            puller.handle.streamer_not_ready(puller.id).await;
        }

        // pause before retrying, unless told to quit meanwhile
        if timeout(RETRY_PAUSE, quit.next()).await.is_ok() {
            break;
        }
    }

    if puller.ready {
        puller.handle.streamer_not_ready(puller.id).await;
    }
    debug!("[puller {}] finished", puller.path);
}

impl Puller {
    /// One full upstream session, from TCP connect to stream loss.
    async fn attempt(&mut self) -> io::Result<()> {
        let host = self
            .url
            .host_str()
            .ok_or_else(|| other_err("source url has no host"))?
            .to_string();
        let port = self.url.port().unwrap_or(554);

        let mut conn = with_timeout(
            self.conf.read_timeout,
            "connect timeout",
            TcpStream::connect((host.as_str(), port)),
        )
        .await?;

        let mut pending: Vec<u8> = Vec::new();
        self.cseq = 0;
        self.session.clear();

        let req = self.request(Method::Options, self.url.clone());
        let resp = self.roundtrip(&mut conn, &mut pending, req).await?;
        check_status(&resp, "OPTIONS")?;

        let mut req = self.request(Method::Describe, self.url.clone());
        req.insert_header(headers::ACCEPT, "application/sdp".to_string());
        let resp = self.roundtrip(&mut conn, &mut pending, req).await?;
        check_status(&resp, "DESCRIBE")?;

        let sdp_text = resp.body().clone();
        let sdp_parsed = sdp_types::Session::parse(&sdp_text)
            .map_err(|_| other_err("upstream returned invalid SDP"))?;
        if sdp_parsed.medias.is_empty() {
            return Err(other_err("upstream SDP has no media streams"));
        }
        let media_count = sdp_parsed.medias.len();

        let mut udp_pairs: Vec<(Arc<UdpSocket>, Arc<UdpSocket>)> = Vec::new();

        for (i, media) in sdp_parsed.medias.iter().enumerate() {
            let control = media
                .attributes
                .iter()
                .find(|attr| attr.attribute == "control")
                .and_then(|attr| attr.value.clone());
            let setup_url = match control {
                Some(control) if control.starts_with("rtsp://") => {
                    Url::parse(&control).map_err(|_| other_err("invalid control attribute"))?
                }
                Some(control) => join_control(&self.url, &control)?,
                None => join_control(&self.url, &format!("trackID={}", i))?,
            };

            let transport = match self.protocol {
                StreamProtocol::Udp => {
                    let (rtp, rtcp, rtp_port) = bind_udp_pair().await?;
                    udp_pairs.push((rtp, rtcp));
                    RtpTransport {
                        profile: RtpProfile::Avp,
                        lower_transport: None,
                        params: RtpTransportParameters {
                            unicast: true,
                            client_port: Some((rtp_port, Some(rtp_port + 1))),
                            ..Default::default()
                        },
                    }
                }
                StreamProtocol::Tcp => {
                    let channel = TrackFlow::Rtp.interleaved_channel(i);
                    RtpTransport {
                        profile: RtpProfile::Avp,
                        lower_transport: Some(RtpLowerTransport::Tcp),
                        params: RtpTransportParameters {
                            unicast: true,
                            interleaved: Some((channel, Some(channel + 1))),
                            ..Default::default()
                        },
                    }
                }
            };

            let mut req = self.request(Method::Setup, setup_url);
            req.insert_typed_header(&Transports::from(vec![Transport::Rtp(transport)]));
            let resp = self.roundtrip(&mut conn, &mut pending, req).await?;
            check_status(&resp, "SETUP")?;

            if let Some(value) = resp.header(&headers::SESSION) {
                if let Some(session) = value.as_str().split(';').next() {
                    self.session = session.trim().to_string();
                }
            }
        }

        let req = self.request(Method::Play, self.url.clone());
        let resp = self.roundtrip(&mut conn, &mut pending, req).await?;
        check_status(&resp, "PLAY")?;

        let announced = sdp_types::Session::parse(&sdp_text)
            .map_err(|_| other_err("upstream returned invalid SDP"))?;
        self.ready = true;
        self.handle
            .streamer_ready(self.id, sdp_text, announced)
            .await;

        match self.protocol {
            StreamProtocol::Tcp => {
                self.pump_interleaved(&mut conn, &mut pending, media_count)
                    .await
            }
            StreamProtocol::Udp => {
                let mut stops = Vec::new();
                for (track_id, (rtp, rtcp)) in udp_pairs.iter().enumerate() {
                    stops.push(spawn_udp_pump(
                        rtp.clone(),
                        self.id,
                        track_id,
                        TrackFlow::Rtp,
                        self.handle.clone(),
                    ));
                    stops.push(spawn_udp_pump(
                        rtcp.clone(),
                        self.id,
                        track_id,
                        TrackFlow::Rtcp,
                        self.handle.clone(),
                    ));
                }
                // Watch the control connection; its loss ends the attempt and
                // dropping `stops` ends the pump tasks with it.
                let result = self.watch_control(&mut conn, &mut pending).await;
                drop(stops);
                result
            }
        }
    }

    fn request(&mut self, method: Method, uri: Url) -> rtsp_types::Request<Vec<u8>> {
        self.cseq += 1;
        let mut req = rtsp_types::Request::builder(method, Version::V1_0)
            .request_uri(uri)
            .build(Vec::new());
        req.insert_typed_header(&CSeq::from(self.cseq));
        if !self.session.is_empty() {
            req.insert_header(headers::SESSION, self.session.clone());
        }
        req
    }

    async fn roundtrip(
        &self,
        conn: &mut TcpStream,
        pending: &mut Vec<u8>,
        req: rtsp_types::Request<Vec<u8>>,
    ) -> io::Result<rtsp_types::Response<Vec<u8>>> {
        let data = message_socket::serialize_message(&req.into())?;
        with_timeout(self.conf.write_timeout, "write timeout", conn.write_all(&data)).await?;

        let mut buf = vec![0u8; 4096];
        loop {
            if let Some(message) = message_socket::parse_message(pending)? {
                match message {
                    rtsp_types::Message::Response(resp) => return Ok(resp),
                    // data can already arrive between SETUP and PLAY replies
                    _ => continue,
                }
            }

            let len = with_timeout(self.conf.read_timeout, "read timeout", conn.read(&mut buf))
                .await?;
            if len == 0 {
                return Err(eof_err());
            }
            pending.extend_from_slice(&buf[..len]);
        }
    }

    async fn pump_interleaved(
        &mut self,
        conn: &mut TcpStream,
        pending: &mut Vec<u8>,
        media_count: usize,
    ) -> io::Result<()> {
        let mut buf = vec![0u8; 4096];

        loop {
            while let Some(message) = message_socket::parse_message(pending)? {
                if let rtsp_types::Message::Data(data) = message {
                    let (track_id, flow) = TrackFlow::of_channel(data.channel_id());
                    if track_id < media_count {
                        self.handle
                            .streamer_frame(self.id, track_id, flow, data.into_body())
                            .await;
                    }
                }
            }

            let len = with_timeout(self.conf.read_timeout, "read timeout", conn.read(&mut buf))
                .await?;
            if len == 0 {
                return Err(eof_err());
            }
            pending.extend_from_slice(&buf[..len]);
        }
    }

    /// With UDP transport the control connection mostly idles; only its
    /// closure is interesting.
    async fn watch_control(&self, conn: &mut TcpStream, pending: &mut Vec<u8>) -> io::Result<()> {
        let mut buf = vec![0u8; 4096];

        loop {
            let len = conn.read(&mut buf).await?;
            if len == 0 {
                return Err(eof_err());
            }
            pending.extend_from_slice(&buf[..len]);
            // discard whatever the server sends (keepalives and the like)
            while message_socket::parse_message(pending)?.is_some() {}
        }
    }
}

fn spawn_udp_pump(
    socket: Arc<UdpSocket>,
    id: StreamerId,
    track_id: usize,
    flow: TrackFlow,
    mut handle: Handle,
) -> oneshot::Sender<()> {
    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

    task::spawn(async move {
        let mut buf = vec![0u8; 65536];
        loop {
            enum Outcome {
                Data(usize),
                Err(io::Error),
                Stop,
            }

            let outcome = {
                let recv = socket.recv_from(&mut buf);
                futures::pin_mut!(recv);
                match future::select(recv, &mut stop_rx).await {
                    Either::Left((Ok((len, _addr)), _)) => Outcome::Data(len),
                    Either::Left((Err(err), _)) => Outcome::Err(err),
                    Either::Right(_) => Outcome::Stop,
                }
            };

            match outcome {
                Outcome::Data(len) => {
                    handle
                        .streamer_frame(id, track_id, flow, buf[..len].to_vec())
                        .await;
                }
                Outcome::Err(_) => break,
                Outcome::Stop => break,
            }
        }
    });

    stop_tx
}

/// Allocate an even RTP port with its odd RTCP sibling.
async fn bind_udp_pair() -> io::Result<(Arc<UdpSocket>, Arc<UdpSocket>, u16)> {
    for _ in 0..16 {
        let rtp = match UdpSocket::bind("0.0.0.0:0").await {
            Ok(socket) => socket,
            Err(_) => continue,
        };
        let port = rtp.local_addr()?.port();
        if port % 2 != 0 || port == u16::MAX {
            continue;
        }
        match UdpSocket::bind(("0.0.0.0", port + 1)).await {
            Ok(rtcp) => return Ok((Arc::new(rtp), Arc::new(rtcp), port)),
            Err(_) => continue,
        }
    }
    Err(io::Error::new(
        io::ErrorKind::AddrInUse,
        "could not allocate an even/odd udp port pair",
    ))
}

fn join_control(base: &Url, control: &str) -> io::Result<Url> {
    let joined = format!("{}/{}", base.as_str().trim_end_matches('/'), control);
    Url::parse(&joined).map_err(|_| other_err("invalid control attribute"))
}

fn check_status(resp: &rtsp_types::Response<Vec<u8>>, what: &str) -> io::Result<()> {
    if resp.status() != StatusCode::Ok {
        return Err(io::Error::new(
            io::ErrorKind::Other,
            format!("{} returned status {}", what, resp.status()),
        ));
    }
    Ok(())
}

async fn with_timeout<F, T>(dur: Duration, what: &'static str, fut: F) -> io::Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    match timeout(dur, fut).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, what)),
    }
}

fn other_err(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::Other, msg.to_string())
}

fn eof_err() -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, "upstream closed the connection")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_attribute_joins_onto_base_url() {
        let base = Url::parse("rtsp://host:8554/stream").unwrap();
        assert_eq!(
            join_control(&base, "trackID=1").unwrap().as_str(),
            "rtsp://host:8554/stream/trackID=1"
        );

        let base_with_slash = Url::parse("rtsp://host:8554/stream/").unwrap();
        assert_eq!(
            join_control(&base_with_slash, "audio").unwrap().as_str(),
            "rtsp://host:8554/stream/audio"
        );
    }

    #[test]
    fn udp_pairs_are_even_odd() {
        task::block_on(async {
            let (rtp, rtcp, port) = bind_udp_pair().await.unwrap();
            assert_eq!(port % 2, 0);
            assert_eq!(rtp.local_addr().unwrap().port(), port);
            assert_eq!(rtcp.local_addr().unwrap().port(), port + 1);
        });
    }
}
