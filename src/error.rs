//! Error type for resolver construction and request submission.

#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

use std::error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

/// Error type returned by the resolver's configuration and submission API.
///
/// Failures of requests that were accepted by [`submit`] are not reported
/// through this type; they arrive through the completion callback as a
/// synthetic [`Rcode`].
///
/// [`submit`]: crate::request::RequestBuilder::submit
/// [`Rcode`]: crate::reply::Rcode
#[derive(Clone, Debug)]
pub enum Error {
    /// A name was empty after leading and trailing dots were removed.
    InvalidName,

    /// A label exceeded 63 octets or the encoded name exceeded 255 octets.
    NameTooLong,

    /// A request was submitted without any question.
    NoQuestions,

    /// No event loop has been bound to the resolver.
    NoEventLoop,

    /// The resolver has not been initialized.
    NotInitialized,

    /// No upstream server is configured or selectable.
    NoServers,

    /// The server name is not an IP address literal.
    InvalidServerAddress,

    /// The server port or channel count is out of range.
    InvalidServerArguments,

    /// The request could not be placed on any server.
    SendFailed,

    /// A fake-reply name exceeds the fake-name length limit.
    FakeNameTooLong,

    /// Creating or configuring a socket failed.
    Socket(Arc<std::io::Error>),
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        match self {
            Error::InvalidName => write!(f, "empty name to resolve"),
            Error::NameTooLong => write!(f, "name or label too long"),
            Error::NoQuestions => write!(f, "request without questions"),
            Error::NoEventLoop => write!(f, "no event loop bound"),
            Error::NotInitialized => write!(f, "resolver is uninitialized"),
            Error::NoServers => {
                write!(f, "cannot find suitable server for request")
            }
            Error::InvalidServerAddress => {
                write!(f, "server name is not an IP literal")
            }
            Error::InvalidServerArguments => {
                write!(f, "bad server port or channel count")
            }
            Error::SendFailed => write!(f, "cannot send DNS request"),
            Error::FakeNameTooLong => write!(f, "fake reply name too long"),
            Error::Socket(_) => write!(f, "error creating socket"),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::Socket(e) => Some(e),
            _ => None,
        }
    }
}
