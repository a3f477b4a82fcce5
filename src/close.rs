// This code is sourced primarily from the tungstenite-rs library, which can be found at:
// https://github.com/snapview/tungstenite-rs/blob/42b8797e8b7f39efb7d9322dc8af3e9089db4f7d/src/protocol/frame/coding.rs#L117
//
// Original contributions by:
// Copyright (c) 2017 Alexey Galakhov
// Copyright (c) 2016 Jason Housley
// Licensed under both MIT and Apache 2.0 licenses
//
// Modifications made by:
// Copyright 2023 Divy Srivastava <dj.srivastava23@gmail.com>
//
// Licensed under the Apache License, Version 2.0 (the "License");
// You may obtain a copy of the License at:
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is provided "AS IS", WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND,
// either express or implied. See the License for specific language governing permissions and limitations.
//

//! Close status codes ([RFC 6455 Section 7.4](https://datatracker.ietf.org/doc/html/rfc6455#section-7.4)).

use self::CloseCode::*;

/// Status codes carried by a close frame.
#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub enum CloseCode {
    /// Normal closure; the purpose of the connection has been fulfilled.
    Normal,
    /// The endpoint is going away (server shutdown, page navigation).
    Away,
    /// Protocol error.
    Protocol,
    /// Received a type of data the endpoint cannot accept.
    Unsupported,
    /// No status code was present. Never sent on the wire.
    Status,
    /// Connection dropped without a close frame. Never sent on the wire.
    Abnormal,
    /// Message data inconsistent with its type (e.g. non UTF-8 text).
    Invalid,
    Policy,
    /// Message too big to process.
    Size,
    /// Expected extension was not negotiated.
    Extension,
    /// Unexpected server condition.
    Error,
    Restart,
    Again,
    /// TLS handshake failure. Never sent on the wire.
    Tls,
    /// 1016-2999, reserved by the protocol.
    Reserved(u16),
    /// 3000-3999, registered with IANA for libraries and frameworks.
    Iana(u16),
    /// 4000-4999, private use by applications.
    Library(u16),
    /// Anything else.
    Bad(u16),
}

impl CloseCode {
    /// Whether the code may appear in a close frame received from the peer.
    pub fn is_allowed(self) -> bool {
        !matches!(self, Bad(_) | Reserved(_) | Status | Abnormal | Tls)
    }

    /// Whether an application may initiate a close with this code: 1000 or 3000-4999.
    pub fn is_sendable(self) -> bool {
        matches!(self, Normal | Iana(_) | Library(_))
    }
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> CloseCode {
        match code {
            1000 => Normal,
            1001 => Away,
            1002 => Protocol,
            1003 => Unsupported,
            1005 => Status,
            1006 => Abnormal,
            1007 => Invalid,
            1008 => Policy,
            1009 => Size,
            1010 => Extension,
            1011 => Error,
            1012 => Restart,
            1013 => Again,
            1015 => Tls,
            1016..=2999 => Reserved(code),
            3000..=3999 => Iana(code),
            4000..=4999 => Library(code),
            _ => Bad(code),
        }
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> u16 {
        match code {
            Normal => 1000,
            Away => 1001,
            Protocol => 1002,
            Unsupported => 1003,
            Status => 1005,
            Abnormal => 1006,
            Invalid => 1007,
            Policy => 1008,
            Size => 1009,
            Extension => 1010,
            Error => 1011,
            Restart => 1012,
            Again => 1013,
            Tls => 1015,
            Reserved(code) | Iana(code) | Library(code) | Bad(code) => code,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sendable_codes() {
        assert!(CloseCode::from(1000).is_sendable());
        assert!(CloseCode::from(3000).is_sendable());
        assert!(CloseCode::from(4999).is_sendable());

        assert!(!CloseCode::from(1001).is_sendable());
        assert!(!CloseCode::from(2999).is_sendable());
        assert!(!CloseCode::from(5000).is_sendable());
    }

    #[test]
    fn test_allowed_codes() {
        assert!(CloseCode::from(1001).is_allowed());
        assert!(!CloseCode::from(1005).is_allowed());
        assert!(!CloseCode::from(1006).is_allowed());
        assert!(!CloseCode::from(999).is_allowed());
        assert_eq!(u16::from(CloseCode::from(4321)), 4321);
    }
}
