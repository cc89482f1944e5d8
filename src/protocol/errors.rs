// Copyright (c) 2026 Amunchain
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! The six error kinds the protocol ever produces. None are fatal to the
//! announce loop — every call site logs and continues.

use thiserror::Error;

use crate::core::crypto::CryptoError;
use crate::storage::kv::StoreError;

/// Protocol-level error, returned (never panicked/thrown) from every
/// handler.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Message from an address outside the current active set.
    #[error("unauthorized sender")]
    UnauthorizedSender,
    /// Decode failure, invalid URL, or invalid signature.
    #[error("malformed message")]
    MalformedMessage,
    /// Duplicate entries, an oversize list, or a version regression in a cert.
    #[error("validation rejected: {0}")]
    ValidationRejected(&'static str),
    /// Durable store I/O failure.
    #[error("store error: {0}")]
    StoreError(#[from] StoreError),
    /// Signing, recovery, or ECIES failure.
    #[error("crypto error: {0}")]
    CryptoError(#[from] CryptoError),
    /// Transport send failure.
    #[error("transport error")]
    TransportError,
}

impl From<crate::core::types::CodecError> for ProtocolError {
    fn from(_: crate::core::types::CodecError) -> Self {
        ProtocolError::MalformedMessage
    }
}

impl ProtocolError {
    /// A short, stable label for metrics, independent of the `Display` text.
    pub fn kind(&self) -> &'static str {
        match self {
            ProtocolError::UnauthorizedSender => "unauthorized_sender",
            ProtocolError::MalformedMessage => "malformed_message",
            ProtocolError::ValidationRejected(_) => "validation_rejected",
            ProtocolError::StoreError(_) => "store_error",
            ProtocolError::CryptoError(_) => "crypto_error",
            ProtocolError::TransportError => "transport_error",
        }
    }
}
