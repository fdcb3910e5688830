use std::{convert, error, fmt, result, str};

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Error {
    /// Generic error type containing a string
    Other(&'static str),
    /// The target refused the requested access right.
    ///
    /// Opening a handle or querying the target needs rights the caller
    /// does not hold; the process is skipped, never retried.
    AccessDenied(&'static str),
    /// A remote address was not mapped in the target.
    InvalidAddress,
    /// A remote read failed or returned fewer bytes than requested.
    ///
    /// The payload names the structure that was being read.
    MemoryRead(&'static str),
    /// The chained control-block load aborted.
    ///
    /// The payload names the stage whose pointer was malformed or zero.
    ControlBlock(&'static str),
    /// A remote string's pointer or length could not be resolved.
    StringResolution(&'static str),
    /// PE error.
    ///
    /// Catch-all for errors while parsing a carved image.
    PE(pelite::Error),
    /// Encoding error.
    ///
    /// Catch-all for string decoding errors such as invalid utf-8.
    Encoding,
    /// The process snapshot itself failed; fatal to the whole run.
    Enumeration(&'static str),
}

/// Convert from &str to error
impl convert::From<&'static str> for Error {
    fn from(error: &'static str) -> Self {
        Error::Other(error)
    }
}

/// Convert from pelite::Error
impl From<pelite::Error> for Error {
    fn from(error: pelite::Error) -> Error {
        Error::PE(error)
    }
}

/// Convert from str::Utf8Error
impl From<str::Utf8Error> for Error {
    fn from(_err: str::Utf8Error) -> Error {
        Error::Encoding
    }
}

impl Error {
    /// Returns a tuple representing the error description and its string value.
    pub fn to_str_pair(self) -> (&'static str, Option<&'static str>) {
        match self {
            Error::Other(e) => ("other error", Some(e)),
            Error::AccessDenied(e) => ("access denied", Some(e)),
            Error::InvalidAddress => ("remote address not mapped", None),
            Error::MemoryRead(e) => ("error reading remote memory", Some(e)),
            Error::ControlBlock(e) => ("error loading process control block", Some(e)),
            Error::StringResolution(e) => ("error resolving remote string", Some(e)),
            Error::PE(e) => ("error parsing pe image", Some(e.to_str())),
            Error::Encoding => ("encoding error", None),
            Error::Enumeration(e) => ("error enumerating processes", Some(e)),
        }
    }

    /// Returns a simple string representation of the error.
    pub fn to_str(self) -> &'static str {
        self.to_str_pair().0
    }

    /// Whether the error aborts the whole run instead of one process.
    pub fn is_fatal(self) -> bool {
        matches!(self, Error::Enumeration(_))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let (desc, value) = self.to_str_pair();

        if let Some(value) = value {
            write!(f, "{}: {}", desc, value)
        } else {
            f.write_str(desc)
        }
    }
}

impl error::Error for Error {}

/// Specialized `Result` type for rpcrole errors.
pub type Result<T> = result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_stage() {
        let err = Error::MemoryRead("peb.Ldr");
        assert_eq!(format!("{}", err), "error reading remote memory: peb.Ldr");
    }

    #[test]
    fn only_enumeration_is_fatal() {
        assert!(Error::Enumeration("snapshot").is_fatal());
        assert!(!Error::MemoryRead("module list entry").is_fatal());
        assert!(!Error::AccessDenied("open process").is_fatal());
    }
}
