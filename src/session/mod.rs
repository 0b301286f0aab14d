// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0

//! Per-connection client sessions.
//!
//! A session parses requests, walks the RTSP state machine and proposes every
//! transition to the dispatcher, blocking on the reply. The session keeps a
//! local mirror of its state for request sequencing; the dispatcher holds the
//! authoritative copy used for routing.
//!
//! Recoverable failures (conflicts, missing streams, authorization) are
//! answered on the wire and leave the session up. Transport failures and
//! TEARDOWN end it.

use std::net::{Shutdown, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_std::future::timeout;
use async_std::net::TcpStream;
use async_std::task;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures::channel::mpsc;
use futures::future::{self, Either};
use futures::prelude::*;
use log::{debug, warn};

use rtsp_types::headers::transport::{
    RtpLowerTransport, RtpProfile, RtpTransport, RtpTransportParameters,
};
use rtsp_types::headers::{self, CSeq, Public, Transport, TransportMode, Transports};
use rtsp_types::{Method, StatusCode, Version};

use crate::conf::{Conf, StreamProtocol};
use crate::dispatcher::{ClientId, ClientState, Handle, TrackFlow};
use crate::error::ServerError;

pub(crate) mod message_socket;
use message_socket::RtspMessage;

const REALM: &str = "rtsp-hub";

/// Start the two tasks of one session: the write task owning the outbound
/// queue, and the main task owning the read loop and the state machine.
#[allow(clippy::too_many_arguments)]
pub(crate) fn spawn(
    id: ClientId,
    conn: TcpStream,
    addr: SocketAddr,
    conf: Arc<Conf>,
    handle: Handle,
    out_tx: mpsc::Sender<RtspMessage>,
    out_rx: mpsc::Receiver<RtspMessage>,
    quit_tx: mpsc::Sender<()>,
    quit_rx: mpsc::Receiver<()>,
) {
    let write_timeout = conf.write_timeout;
    let writer = task::spawn(message_socket::send_task(
        conn.clone(),
        addr,
        out_rx,
        write_timeout,
        quit_tx,
    ));

    task::spawn(async move {
        let mut session = Session {
            id,
            conf,
            handle,
            conn: conn.clone(),
            addr,
            out_tx,
            state: ClientState::Initial,
            path: String::new(),
            protocol: None,
            track_count: 0,
            announced_medias: 0,
            session_id: String::new(),
        };

        session.run(quit_rx).await;

        // Unregister before tearing the socket down so the dispatcher stops
        // routing to this session first.
        let mut handle = session.handle;
        handle.close_client(id).await;

        session.out_tx.close_channel();
        writer.await;
        let _ = conn.shutdown(Shutdown::Both);
        debug!("[client {}] session finished", addr);
    });
}

enum Next {
    Continue,
    Close,
}

#[derive(Clone, Copy)]
enum Action {
    Publish,
    Read,
}

struct Offer {
    protocol: StreamProtocol,
    rtp_port: u16,
    rtcp_port: u16,
}

struct Session {
    id: ClientId,
    conf: Arc<Conf>,
    handle: Handle,
    conn: TcpStream,
    addr: SocketAddr,
    out_tx: mpsc::Sender<RtspMessage>,
    state: ClientState,
    path: String,
    protocol: Option<StreamProtocol>,
    track_count: usize,
    announced_medias: usize,
    session_id: String,
}

impl Session {
    async fn run(&mut self, mut quit: mpsc::Receiver<()>) {
        let mut pending: Vec<u8> = Vec::new();
        let mut buf = vec![0u8; 4096];

        'outer: loop {
            loop {
                match message_socket::parse_message(&mut pending) {
                    Ok(Some(message)) => {
                        if !self.handle_message(message).await {
                            break 'outer;
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        warn!("[client {}] {}", self.addr, err);
                        break 'outer;
                    }
                }
            }

            let deadline = self.read_deadline();
            let read = self.conn.read(&mut buf);
            futures::pin_mut!(read);

            let result = if let Some(deadline) = deadline {
                let read = timeout(deadline, read);
                futures::pin_mut!(read);
                match future::select(read, quit.next()).await {
                    Either::Left((Ok(result), _)) => result,
                    Either::Left((Err(_), _)) => {
                        warn!("[client {}] read timeout", self.addr);
                        break;
                    }
                    Either::Right(_) => break,
                }
            } else {
                match future::select(read, quit.next()).await {
                    Either::Left((result, _)) => result,
                    Either::Right(_) => break,
                }
            };

            match result {
                Ok(0) => {
                    debug!("[client {}] eof", self.addr);
                    break;
                }
                Ok(len) => pending.extend_from_slice(&buf[..len]),
                Err(err) => {
                    debug!("[client {}] read error: {}", self.addr, err);
                    break;
                }
            }
        }
    }

    /// UDP publishers go silent on the control connection while frames flow
    /// over UDP; their liveness is tracked by the dispatcher instead.
    fn read_deadline(&self) -> Option<Duration> {
        if self.state == ClientState::Record && self.protocol == Some(StreamProtocol::Udp) {
            None
        } else {
            Some(self.conf.read_timeout)
        }
    }

    async fn handle_message(&mut self, message: RtspMessage) -> bool {
        match message {
            rtsp_types::Message::Request(request) => self.handle_request(request).await,
            rtsp_types::Message::Data(data) => self.handle_data(data).await,
            // A server never receives responses on this connection.
            rtsp_types::Message::Response(_) => true,
        }
    }

    async fn handle_data(&mut self, data: rtsp_types::Data<Vec<u8>>) -> bool {
        if self.state != ClientState::Record || self.protocol != Some(StreamProtocol::Tcp) {
            return true;
        }
        let (track_id, flow) = TrackFlow::of_channel(data.channel_id());
        if track_id >= self.track_count {
            return true;
        }
        self.handle
            .frame_tcp(self.path.clone(), track_id, flow, data.into_body())
            .await;
        true
    }

    async fn handle_request(&mut self, request: rtsp_types::Request<Vec<u8>>) -> bool {
        let cseq = match request.typed_header::<CSeq>() {
            Ok(Some(cseq)) => *cseq,
            _ => {
                warn!("[client {}] request without a valid CSeq", self.addr);
                let resp = rtsp_types::Response::builder(Version::V1_0, StatusCode::BadRequest)
                    .build(Vec::new());
                let _ = self.enqueue(resp.into()).await;
                return false;
            }
        };

        let outcome = match request.method() {
            Method::Options => self.handle_options(cseq).await,
            Method::Describe => self.handle_describe(cseq, &request).await,
            Method::Announce => self.handle_announce(cseq, &request).await,
            Method::Setup => self.handle_setup(cseq, &request).await,
            Method::Play => self.handle_play(cseq, &request).await,
            Method::Pause => self.handle_pause(cseq).await,
            Method::Record => self.handle_record(cseq, &request).await,
            Method::Teardown => {
                let resp = self.base_response(cseq, StatusCode::Ok);
                let _ = self.enqueue(resp.into()).await;
                Ok(Next::Close)
            }
            _ => {
                let resp = self.base_response(cseq, StatusCode::MethodNotAllowed);
                if self.enqueue(resp.into()).await {
                    Ok(Next::Continue)
                } else {
                    Ok(Next::Close)
                }
            }
        };

        match outcome {
            Ok(Next::Continue) => true,
            Ok(Next::Close) => false,
            Err(err) => {
                warn!("[client {}] {}", self.addr, err);
                let mut resp = self.base_response(cseq, err.status_code());
                if let ServerError::Unauthorized = err {
                    resp.insert_header(
                        headers::WWW_AUTHENTICATE,
                        format!("Basic realm=\"{}\"", REALM),
                    );
                }
                self.enqueue(resp.into()).await
            }
        }
    }

    async fn handle_options(&mut self, cseq: u32) -> Result<Next, ServerError> {
        let mut resp = self.base_response(cseq, StatusCode::Ok);
        resp.insert_typed_header(
            &Public::builder()
                .method(Method::Options)
                .method(Method::Describe)
                .method(Method::Announce)
                .method(Method::Setup)
                .method(Method::Play)
                .method(Method::Pause)
                .method(Method::Record)
                .method(Method::Teardown)
                .build(),
        );
        self.finish(resp).await
    }

    async fn handle_describe(
        &mut self,
        cseq: u32,
        request: &rtsp_types::Request<Vec<u8>>,
    ) -> Result<Next, ServerError> {
        if self.state != ClientState::Initial {
            return Err(ServerError::WrongState);
        }
        let path = request_path(request)?;
        self.authorize(request, &path, Action::Read)?;

        let sdp = self
            .handle
            .describe(path.clone())
            .await?
            .ok_or_else(|| ServerError::NoOneStreaming(path.clone()))?;

        let content_base = request.request_uri().map(|uri| uri.to_string());
        let mut resp = self.response_with_body(cseq, StatusCode::Ok, sdp);
        if let Some(base) = content_base {
            resp.insert_header(headers::CONTENT_BASE, base);
        }
        resp.insert_header(headers::CONTENT_TYPE, "application/sdp".to_string());
        self.finish(resp).await
    }

    async fn handle_announce(
        &mut self,
        cseq: u32,
        request: &rtsp_types::Request<Vec<u8>>,
    ) -> Result<Next, ServerError> {
        if self.state != ClientState::Initial {
            return Err(ServerError::WrongState);
        }
        let path = request_path(request)?;
        self.authorize(request, &path, Action::Publish)?;

        let content_type = request
            .header(&headers::CONTENT_TYPE)
            .map(|value| value.as_str().to_ascii_lowercase());
        if content_type.as_deref() != Some("application/sdp") {
            return Err(ServerError::InvalidRequest("unsupported Content-Type"));
        }

        let sdp_text = request.body().clone();
        let sdp_parsed = sdp_types::Session::parse(&sdp_text)
            .map_err(|_| ServerError::InvalidRequest("invalid SDP"))?;
        if sdp_parsed.medias.is_empty() {
            return Err(ServerError::InvalidRequest("no media streams in SDP"));
        }
        let media_count = sdp_parsed.medias.len();

        self.handle
            .announce(self.id, path.clone(), sdp_text, sdp_parsed)
            .await?;

        self.path = path;
        self.state = ClientState::Announce;
        self.announced_medias = media_count;

        let resp = self.base_response(cseq, StatusCode::Ok);
        self.finish(resp).await
    }

    async fn handle_setup(
        &mut self,
        cseq: u32,
        request: &rtsp_types::Request<Vec<u8>>,
    ) -> Result<Next, ServerError> {
        // Track control suffixes (`.../trackID=n`) do not change path identity.
        let path = base_path(&request_path(request)?);

        let transports = request
            .typed_header::<Transports>()
            .map_err(|_| ServerError::InvalidRequest("invalid Transport header"))?
            .ok_or(ServerError::InvalidRequest("missing Transport header"))?;

        match self.state {
            ClientState::Initial | ClientState::PrePlay => {
                self.setup_play(cseq, request, path, &transports).await
            }
            ClientState::Announce | ClientState::PreRecord => {
                self.setup_record(cseq, path, &transports).await
            }
            _ => Err(ServerError::WrongState),
        }
    }

    async fn setup_play(
        &mut self,
        cseq: u32,
        request: &rtsp_types::Request<Vec<u8>>,
        path: String,
        transports: &Transports,
    ) -> Result<Next, ServerError> {
        if !self.path.is_empty() && path != self.path {
            return Err(ServerError::PathSwitched(path, self.path.clone()));
        }
        self.authorize(request, &path, Action::Read)?;

        let offer = self.pick_transport(transports, false)?;
        self.handle
            .setup_play(
                self.id,
                path.clone(),
                offer.protocol,
                offer.rtp_port,
                offer.rtcp_port,
            )
            .await?;

        self.path = path;
        self.protocol = Some(offer.protocol);
        let track_id = self.track_count;
        self.track_count += 1;
        self.state = ClientState::PrePlay;

        self.send_setup_response(cseq, offer, track_id).await
    }

    async fn setup_record(
        &mut self,
        cseq: u32,
        path: String,
        transports: &Transports,
    ) -> Result<Next, ServerError> {
        if path != self.path {
            return Err(ServerError::PathSwitched(path, self.path.clone()));
        }

        let offer = self.pick_transport(transports, true)?;
        self.handle
            .setup_record(self.id, offer.protocol, offer.rtp_port, offer.rtcp_port)
            .await?;

        self.protocol = Some(offer.protocol);
        let track_id = self.track_count;
        self.track_count += 1;
        self.state = ClientState::PreRecord;

        self.send_setup_response(cseq, offer, track_id).await
    }

    /// First acceptable transport offer wins. A session never mixes
    /// transports across tracks.
    fn pick_transport(&self, transports: &Transports, record: bool) -> Result<Offer, ServerError> {
        for transport in transports.iter() {
            let rtp = match transport {
                Transport::Rtp(rtp) => rtp,
                _ => continue,
            };
            if record && !rtp.params.mode.contains(&TransportMode::Record) {
                continue;
            }

            match rtp.lower_transport {
                Some(RtpLowerTransport::Tcp) => {
                    if !self.conf.protocol_allowed(StreamProtocol::Tcp)
                        || self.protocol == Some(StreamProtocol::Udp)
                    {
                        continue;
                    }
                    return Ok(Offer {
                        protocol: StreamProtocol::Tcp,
                        rtp_port: 0,
                        rtcp_port: 0,
                    });
                }
                _ => {
                    if !self.conf.protocol_allowed(StreamProtocol::Udp)
                        || self.protocol == Some(StreamProtocol::Tcp)
                    {
                        continue;
                    }
                    if let Some((rtp_port, Some(rtcp_port))) = rtp.params.client_port {
                        return Ok(Offer {
                            protocol: StreamProtocol::Udp,
                            rtp_port,
                            rtcp_port,
                        });
                    }
                }
            }
        }

        Err(ServerError::UnsupportedTransport)
    }

    async fn send_setup_response(
        &mut self,
        cseq: u32,
        offer: Offer,
        track_id: usize,
    ) -> Result<Next, ServerError> {
        if self.session_id.is_empty() {
            self.session_id = format!("{:08x}", rand::random::<u32>());
        }

        let transport = match offer.protocol {
            StreamProtocol::Udp => RtpTransport {
                profile: RtpProfile::Avp,
                lower_transport: None,
                params: RtpTransportParameters {
                    unicast: true,
                    client_port: Some((offer.rtp_port, Some(offer.rtcp_port))),
                    server_port: Some((self.conf.rtp_port, Some(self.conf.rtcp_port))),
                    ..Default::default()
                },
            },
            StreamProtocol::Tcp => {
                let channel = TrackFlow::Rtp.interleaved_channel(track_id);
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

        let mut resp = self.base_response(cseq, StatusCode::Ok);
        resp.insert_header(headers::SESSION, self.session_id.clone());
        resp.insert_typed_header(&Transports::from(vec![Transport::Rtp(transport)]));
        self.finish(resp).await
    }

    async fn handle_play(
        &mut self,
        cseq: u32,
        request: &rtsp_types::Request<Vec<u8>>,
    ) -> Result<Next, ServerError> {
        if self.state != ClientState::PrePlay {
            return Err(ServerError::WrongState);
        }
        let path = request_path(request)?;
        if path != self.path {
            return Err(ServerError::PathSwitched(path, self.path.clone()));
        }
        self.authorize(request, &path, Action::Read)?;

        self.handle.play1(self.id).await?;

        // The 200 must be on the outbound queue before frames start flowing,
        // or an interleaved frame could overtake it.
        let mut resp = self.base_response(cseq, StatusCode::Ok);
        resp.insert_header(headers::SESSION, self.session_id.clone());
        let sent = self.enqueue(resp.into()).await;

        self.handle.play2(self.id).await?;
        self.state = ClientState::Play;

        if sent {
            Ok(Next::Continue)
        } else {
            Ok(Next::Close)
        }
    }

    async fn handle_pause(&mut self, cseq: u32) -> Result<Next, ServerError> {
        if self.state != ClientState::Play {
            return Err(ServerError::WrongState);
        }

        self.handle.pause(self.id).await?;
        self.state = ClientState::PrePlay;

        let mut resp = self.base_response(cseq, StatusCode::Ok);
        resp.insert_header(headers::SESSION, self.session_id.clone());
        self.finish(resp).await
    }

    async fn handle_record(
        &mut self,
        cseq: u32,
        request: &rtsp_types::Request<Vec<u8>>,
    ) -> Result<Next, ServerError> {
        if self.state != ClientState::PreRecord {
            return Err(ServerError::WrongState);
        }
        let path = request_path(request)?;
        if path != self.path {
            return Err(ServerError::PathSwitched(path, self.path.clone()));
        }
        if self.track_count != self.announced_medias {
            return Err(ServerError::TracksNotSetup);
        }

        self.handle.record(self.id).await?;
        self.state = ClientState::Record;

        let mut resp = self.base_response(cseq, StatusCode::Ok);
        resp.insert_header(headers::SESSION, self.session_id.clone());
        self.finish(resp).await
    }

    fn authorize(
        &self,
        request: &rtsp_types::Request<Vec<u8>>,
        path: &str,
        action: Action,
    ) -> Result<(), ServerError> {
        let pconf = self
            .conf
            .path_conf(path)
            .ok_or_else(|| ServerError::NoPathConf(path.to_string()))?;

        let (user, pass, ips) = match action {
            Action::Publish => (
                &pconf.publish_user,
                &pconf.publish_pass,
                &pconf.publish_ips_parsed,
            ),
            Action::Read => (&pconf.read_user, &pconf.read_pass, &pconf.read_ips_parsed),
        };

        if !user.is_empty() {
            let authorized = request
                .header(&headers::AUTHORIZATION)
                .map(|value| check_basic(value.as_str(), user, pass))
                .unwrap_or(false);
            if !authorized {
                return Err(ServerError::Unauthorized);
            }
        }

        if !ips.is_empty() {
            let ip = self.addr.ip();
            if !ips.iter().any(|range| range.contains(ip)) {
                return Err(ServerError::IpNotAllowed);
            }
        }

        Ok(())
    }

    fn base_response(&self, cseq: u32, status: StatusCode) -> rtsp_types::Response<Vec<u8>> {
        self.response_with_body(cseq, status, Vec::new())
    }

    fn response_with_body(
        &self,
        cseq: u32,
        status: StatusCode,
        body: Vec<u8>,
    ) -> rtsp_types::Response<Vec<u8>> {
        let mut resp = rtsp_types::Response::builder(Version::V1_0, status).build(body);
        resp.insert_typed_header(&CSeq::from(cseq));
        resp.insert_header(headers::SERVER, "rtsp-hub".to_string());
        {
            use chrono::prelude::*;
            resp.insert_header(headers::DATE, Local::now().to_rfc2822());
        }
        resp
    }

    async fn finish(&mut self, resp: rtsp_types::Response<Vec<u8>>) -> Result<Next, ServerError> {
        if self.enqueue(resp.into()).await {
            Ok(Next::Continue)
        } else {
            Ok(Next::Close)
        }
    }

    async fn enqueue(&mut self, message: RtspMessage) -> bool {
        self.out_tx.send(message).await.is_ok()
    }
}

fn request_path(request: &rtsp_types::Request<Vec<u8>>) -> Result<String, ServerError> {
    let uri = request
        .request_uri()
        .ok_or(ServerError::InvalidRequest("missing request URL"))?;
    let path = uri.path().trim_matches('/').to_string();
    if path.is_empty() {
        return Err(ServerError::InvalidRequest("empty path"));
    }
    Ok(path)
}

/// The first segment names the stream; the rest addresses a track within it.
fn base_path(path: &str) -> String {
    path.split('/').next().unwrap_or(path).to_string()
}

fn check_basic(header: &str, user: &str, pass: &str) -> bool {
    let encoded = match header.strip_prefix("Basic ") {
        Some(encoded) => encoded.trim(),
        None => return false,
    };
    let decoded = match BASE64.decode(encoded) {
        Ok(decoded) => decoded,
        Err(_) => return false,
    };
    decoded == format!("{}:{}", user, pass).into_bytes()
}
