//! Error taxonomy carried through the whole stack, plus the non-blocking
//! I/O result plumbing used by the transport layer.

use crate::anp::Element;
use std::fmt;
use std::io;

/// Sub-kind carried by quota errors.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum QuotaKind {
    Generic,
    WorkspaceFile,
    SecureWorkspace,
}

impl QuotaKind {
    #[inline]
    pub fn code(self) -> u32 {
        match self {
            QuotaKind::Generic => 0,
            QuotaKind::WorkspaceFile => 1,
            QuotaKind::SecureWorkspace => 2,
        }
    }

    pub fn from_code(code: u32) -> Result<QuotaKind, Error> {
        match code {
            0 => Ok(QuotaKind::Generic),
            1 => Ok(QuotaKind::WorkspaceFile),
            2 => Ok(QuotaKind::SecureWorkspace),
            code => Err(Error::generic(format!("unknown quota sub-kind {}", code))),
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ErrorKind {
    Generic,
    Cancelled,
    Interrupted,
    Concurrent,
    KcdConn,
    EAnpConn,
    InvalidKpsConfig,
    InvalidKwsLoginPwd,
    PermDenied,
    QuotaExceeded(QuotaKind),
    UpgradeKwm,
}

impl ErrorKind {
    /// Wire code of the kind, as serialized into error messages.
    #[inline]
    pub fn code(&self) -> u32 {
        match self {
            ErrorKind::Generic => 0,
            ErrorKind::Cancelled => 1,
            ErrorKind::Interrupted => 2,
            ErrorKind::Concurrent => 3,
            ErrorKind::KcdConn => 4,
            ErrorKind::EAnpConn => 5,
            ErrorKind::InvalidKpsConfig => 6,
            ErrorKind::InvalidKwsLoginPwd => 7,
            ErrorKind::PermDenied => 8,
            ErrorKind::QuotaExceeded(_) => 9,
            ErrorKind::UpgradeKwm => 10,
        }
    }
}

/// An error as carried through broker, channel and query completion paths,
/// and as serialized into ANP messages.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Error {
    pub kind: ErrorKind,
    pub message: String,
}

impl Error {
    #[inline]
    pub fn new<S: Into<String>>(kind: ErrorKind, message: S) -> Error {
        Error {
            kind,
            message: message.into(),
        }
    }

    pub fn generic<S: Into<String>>(message: S) -> Error {
        Error::new(ErrorKind::Generic, message)
    }

    pub fn cancelled<S: Into<String>>(message: S) -> Error {
        Error::new(ErrorKind::Cancelled, message)
    }

    pub fn interrupted<S: Into<String>>(message: S) -> Error {
        Error::new(ErrorKind::Interrupted, message)
    }

    pub fn concurrent<S: Into<String>>(message: S) -> Error {
        Error::new(ErrorKind::Concurrent, message)
    }

    pub fn kcd_conn<S: Into<String>>(message: S) -> Error {
        Error::new(ErrorKind::KcdConn, message)
    }

    pub fn eanp_conn<S: Into<String>>(message: S) -> Error {
        Error::new(ErrorKind::EAnpConn, message)
    }

    pub fn invalid_kps_config<S: Into<String>>(message: S) -> Error {
        Error::new(ErrorKind::InvalidKpsConfig, message)
    }

    pub fn invalid_kws_login_pwd<S: Into<String>>(message: S) -> Error {
        Error::new(ErrorKind::InvalidKwsLoginPwd, message)
    }

    pub fn perm_denied<S: Into<String>>(message: S) -> Error {
        Error::new(ErrorKind::PermDenied, message)
    }

    pub fn quota_exceeded<S: Into<String>>(quota: QuotaKind, message: S) -> Error {
        Error::new(ErrorKind::QuotaExceeded(quota), message)
    }

    pub fn upgrade_kwm<S: Into<String>>(message: S) -> Error {
        Error::new(ErrorKind::UpgradeKwm, message)
    }

    /// Serializes the error as `u32 kind, string message` plus the
    /// kind-specific trailer.
    pub fn to_elements(&self) -> Vec<Element> {
        let mut elements = vec![
            Element::U32(self.kind.code()),
            Element::Str(self.message.clone().into_bytes()),
        ];

        if let ErrorKind::QuotaExceeded(quota) = &self.kind {
            elements.push(Element::U32(quota.code()));
        }

        elements
    }

    /// Deserializes an error from its element encoding.
    pub fn from_elements(elements: &[Element]) -> Result<Error, Error> {
        if elements.len() < 2 {
            return Err(Error::generic("malformed error: too few elements"));
        }

        let code = elements[0].expect_u32()?;
        let message = String::from_utf8_lossy(elements[1].expect_str()?).into_owned();

        let kind = match code {
            0 => ErrorKind::Generic,
            1 => ErrorKind::Cancelled,
            2 => ErrorKind::Interrupted,
            3 => ErrorKind::Concurrent,
            4 => ErrorKind::KcdConn,
            5 => ErrorKind::EAnpConn,
            6 => ErrorKind::InvalidKpsConfig,
            7 => ErrorKind::InvalidKwsLoginPwd,
            8 => ErrorKind::PermDenied,
            9 => {
                let trailer = elements
                    .get(2)
                    .ok_or_else(|| Error::generic("malformed error: missing quota sub-kind"))?;
                ErrorKind::QuotaExceeded(QuotaKind::from_code(trailer.expect_u32()?)?)
            }
            10 => ErrorKind::UpgradeKwm,
            code => return Err(Error::generic(format!("unknown error kind {}", code))),
        };

        Ok(Error { kind, message })
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        Error::eanp_conn(format!("io error: {}", io_error))
    }
}

pub type NetResult<T> = Result<T, NetError>;

/// Outcome of a non-blocking I/O step. `Wait` is the cooperative yield: the
/// operation made no further progress and should be retried after the next
/// readiness event. Everything else is fatal to the channel.
#[derive(Debug)]
pub enum NetError {
    Wait,
    Fatal(Error),
}

impl From<io::Error> for NetError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::WouldBlock => NetError::Wait,
            _ => NetError::Fatal(io_error.into()),
        }
    }
}

impl From<Error> for NetError {
    #[inline]
    fn from(error: Error) -> Self {
        NetError::Fatal(error)
    }
}
