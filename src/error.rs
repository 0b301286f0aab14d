// This Source Code Form is subject to the terms of the Mozilla Public License, v2.0.
// If a copy of the MPL was not distributed with this file, You can obtain one at
// <https://mozilla.org/MPL/2.0/>.
//
// SPDX-License-Identifier: MPL-2.0

//! Request-scoped server errors.
//!
//! These are the failures reported back to an RTSP peer without tearing the
//! session down. Each variant maps to the status code used in the response;
//! the message itself goes to the log.

use rtsp_types::StatusCode;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServerError {
    #[error("someone is already publishing on path '{0}'")]
    AlreadyPublishing(String),
    #[error("no one is streaming on path '{0}'")]
    NoOneStreaming(String),
    #[error("all the tracks have already been setup")]
    TracksAlreadySetup,
    #[error("not all tracks have been setup")]
    TracksNotSetup,
    #[error("no configuration found for path '{0}'")]
    NoPathConf(String),
    #[error("path '{0}' differs from the one that was set up ('{1}')")]
    PathSwitched(String, String),
    #[error("invalid request: {0}")]
    InvalidRequest(&'static str),
    #[error("authentication failed")]
    Unauthorized,
    #[error("ip not allowed")]
    IpNotAllowed,
    #[error("unsupported transport")]
    UnsupportedTransport,
    #[error("method not valid in this state")]
    WrongState,
    #[error("terminated")]
    Terminated,
}

impl ServerError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ServerError::AlreadyPublishing(_)
            | ServerError::NoOneStreaming(_)
            | ServerError::TracksAlreadySetup
            | ServerError::TracksNotSetup
            | ServerError::NoPathConf(_)
            | ServerError::PathSwitched(_, _)
            | ServerError::InvalidRequest(_) => StatusCode::BadRequest,
            ServerError::Unauthorized => StatusCode::Unauthorized,
            ServerError::IpNotAllowed => StatusCode::Forbidden,
            ServerError::UnsupportedTransport => StatusCode::UnsupportedTransport,
            ServerError::WrongState => StatusCode::MethodNotValidInThisState,
            ServerError::Terminated => StatusCode::InternalServerError,
        }
    }
}
