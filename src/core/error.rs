use std::collections::HashMap;
use std::sync::Mutex;

use thiserror::Error;

/// Stable numeric codes for probe failures. The code is the scoring key and
/// shows up in debug logs next to the proxy URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Untyped = 1,
    PacketLoss = 2,
    RequestFail = 3,
    BadResponse = 4,
    CannotCreateProxyDialer = 5,
    InvalidProxyUrl = 6,
}

impl ErrorCode {
    pub fn as_i64(self) -> i64 {
        self as i64
    }
}

/// Typed failures recorded while probing a single proxy.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("probe failed: {0}")]
    Untyped(String),
    #[error("route to proxy has packet loss {0}%")]
    PacketLoss(f64),
    #[error("request failed: {0}")]
    RequestFail(String),
    #[error("bad response: {0}")]
    BadResponse(String),
    #[error("cannot create proxy dialer: {0}")]
    CannotCreateProxyDialer(String),
    #[error("invalid proxy url: {0}")]
    InvalidProxyUrl(String),
}

impl ProbeError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ProbeError::Untyped(_) => ErrorCode::Untyped,
            ProbeError::PacketLoss(_) => ErrorCode::PacketLoss,
            ProbeError::RequestFail(_) => ErrorCode::RequestFail,
            ProbeError::BadResponse(_) => ErrorCode::BadResponse,
            ProbeError::CannotCreateProxyDialer(_) => ErrorCode::CannotCreateProxyDialer,
            ProbeError::InvalidProxyUrl(_) => ErrorCode::InvalidProxyUrl,
        }
    }
}

/// Keyed error collection shared by the probe tasks of one validation run.
///
/// The last error recorded per code wins, so every kind counts at most once
/// when score deltas are applied. Writers are serialized internally.
#[derive(Debug, Default)]
pub struct MultiError {
    inner: Mutex<HashMap<ErrorCode, ProbeError>>,
}

impl MultiError {
    /// Record an error under its own code.
    pub fn add(&self, err: ProbeError) {
        let code = err.code();
        self.add_keyed(code, err);
    }

    /// Record an error under an explicit key, regardless of its own code.
    pub fn add_keyed(&self, code: ErrorCode, err: ProbeError) {
        self.inner.lock().unwrap().insert(code, err);
    }

    pub fn has(&self, code: ErrorCode) -> bool {
        self.inner.lock().unwrap().contains_key(&code)
    }

    /// Display string of the error stored under `code`, if any.
    pub fn message(&self, code: ErrorCode) -> Option<String> {
        self.inner.lock().unwrap().get(&code).map(|e| e.to_string())
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }
}
