//! FastCGI wire protocol constants

pub const FCGI_VERSION_1: u8 = 1;

pub const FCGI_BEGIN_REQUEST: u8 = 1;
pub const FCGI_ABORT_REQUEST: u8 = 2;
pub const FCGI_END_REQUEST: u8 = 3;
pub const FCGI_PARAMS: u8 = 4;
pub const FCGI_STDIN: u8 = 5;
pub const FCGI_STDOUT: u8 = 6;
pub const FCGI_STDERR: u8 = 7;
pub const FCGI_DATA: u8 = 8;
pub const FCGI_GET_VALUES: u8 = 9;
pub const FCGI_GET_VALUES_RESULT: u8 = 10;
pub const FCGI_UNKNOWN_TYPE: u8 = 11;

/// Request id reserved for management records
pub const FCGI_NULL_REQUEST_ID: u16 = 0;

/// Bit 0 of the FCGI_BEGIN_REQUEST flags byte
pub const FCGI_KEEP_CONN: u8 = 0x01;

// Variable names a client may query with FCGI_GET_VALUES.
pub const FCGI_MAX_CONNS: &[u8] = b"FCGI_MAX_CONNS";
pub const FCGI_MAX_REQS: &[u8] = b"FCGI_MAX_REQS";
pub const FCGI_MPXS_CONNS: &[u8] = b"FCGI_MPXS_CONNS";

/// Environment variable holding the comma-separated IP allowlist
pub const FCGI_WEB_SERVER_ADDRS: &str = "FCGI_WEB_SERVER_ADDRS";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Responder,
    Authorizer,
    Filter,
}

impl Role {
    pub fn id(&self) -> u16 {
        match self {
            Self::Responder => 1,
            Self::Authorizer => 2,
            Self::Filter => 3,
        }
    }

    pub fn from_id(id: u16) -> Option<Self> {
        match id {
            1 => Some(Self::Responder),
            2 => Some(Self::Authorizer),
            3 => Some(Self::Filter),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProtocolStatus {
    // Normal end of request.
    RequestComplete,
    // Sent when a second request arrives on a connection whose limit is one
    // request at a time.
    CantMultiplex,
    // Sent when the application has run out of some resource.
    Overloaded,
    // Sent when a client named a role the application does not serve.
    UnknownRole,
}

impl ProtocolStatus {
    pub fn id(&self) -> u8 {
        match self {
            Self::RequestComplete => 0,
            Self::CantMultiplex => 1,
            Self::Overloaded => 2,
            Self::UnknownRole => 3,
        }
    }

    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(Self::RequestComplete),
            1 => Some(Self::CantMultiplex),
            2 => Some(Self::Overloaded),
            3 => Some(Self::UnknownRole),
            _ => None,
        }
    }
}
