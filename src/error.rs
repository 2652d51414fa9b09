use std::fmt;

/// Status code attached to every finished call and returned by the
/// configuration surface.
///
/// The numeric value travels on the wire inside the meta region; codes a
/// peer does not know collapse to [Code::Unknown].
#[derive(strum::Display, strum::AsRefStr, PartialEq, Eq, Clone, Copy, thiserror::Error)]
#[repr(u32)]
pub enum Code {
    #[strum(serialize = "ok")]
    Ok = 0,
    #[strum(serialize = "unknown error")]
    Unknown = 1,
    #[strum(serialize = "invalid argument")]
    BadArg = 2,
    #[strum(serialize = "out of memory")]
    OutOfMemory = 3,
    #[strum(serialize = "running in wrong thread context")]
    WrongThread = 4,
    #[strum(serialize = "the service is registered")]
    ServiceExists = 5,
    #[strum(serialize = "the service isn't registered")]
    ServiceMissing = 6,
    #[strum(serialize = "required member missing")]
    MissingRequired = 7,
    #[strum(serialize = "the RPC is canceled")]
    Canceled = 8,
    #[strum(serialize = "the RPC timed out")]
    Timeout = 9,
    #[strum(serialize = "the RPC response is malformed")]
    ResponseMalformed = 10,
    #[strum(serialize = "application defined error")]
    UserDefined = 11,
}

// The default Debug derive would print the variant name, logs want the
// human message like Display.
impl fmt::Debug for Code {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl Code {
    #[inline(always)]
    pub fn is_ok(&self) -> bool {
        *self == Code::Ok
    }

    /// Decode a wire code. Peers running a newer revision may send codes we
    /// do not know, those degrade to [Code::Unknown].
    pub fn from_wire(v: u32) -> Code {
        match v {
            0 => Code::Ok,
            1 => Code::Unknown,
            2 => Code::BadArg,
            3 => Code::OutOfMemory,
            4 => Code::WrongThread,
            5 => Code::ServiceExists,
            6 => Code::ServiceMissing,
            7 => Code::MissingRequired,
            8 => Code::Canceled,
            9 => Code::Timeout,
            10 => Code::ResponseMalformed,
            11 => Code::UserDefined,
            _ => Code::Unknown,
        }
    }
}

impl From<Code> for u32 {
    #[inline(always)]
    fn from(c: Code) -> u32 {
        c as u32
    }
}
