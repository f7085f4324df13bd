use std::fmt;

/// Message tags for the stderr side-channel interleaved between every
/// request and its reply.
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Msg {
    Write = 0x64617416,
    Read = 0x64617461,
    Error = 0x63787470,
    Next = 0x6f6c6d67,
    StartActivity = 0x53545254,
    StopActivity = 0x53544f50,
    Result = 0x52534c54,
    Last = 0x616c7473,
}

impl TryFrom<u64> for Msg {
    type Error = crate::error::ClientError;

    fn try_from(value: u64) -> Result<Self, crate::error::ClientError> {
        match value {
            0x64617416 => Ok(Self::Write),
            0x64617461 => Ok(Self::Read),
            0x63787470 => Ok(Self::Error),
            0x6f6c6d67 => Ok(Self::Next),
            0x53545254 => Ok(Self::StartActivity),
            0x53544f50 => Ok(Self::StopActivity),
            0x52534c54 => Ok(Self::Result),
            0x616c7473 => Ok(Self::Last),
            _ => Err(crate::error::ClientError::InvalidMsgCode(value)),
        }
    }
}

/// A structured log field carried by activity and result messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoggerField {
    Int(u64),
    String(String),
}

/// Error reported by the daemon over the stderr stream.
///
/// Daemons at protocol minor >= 26 send a structured record with level,
/// name and traces; older daemons send a bare `(message, status)` pair.
/// Both decode into this type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonError {
    pub level: u64,
    pub name: String,
    pub message: String,
    pub traces: Vec<String>,
    pub status: u64,
}

impl DaemonError {
    pub fn from_message(message: String, status: u64) -> Self {
        Self {
            level: 0,
            name: "Error".to_string(),
            message,
            traces: Vec::new(),
            status,
        }
    }
}

impl fmt::Display for DaemonError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Whether the daemon considers this client trusted.
///
/// Unknown before protocol minor 35; the handshake leaves `None` in that
/// case.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustedFlag {
    Trusted,
    NotTrusted,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ClientError;

    #[test]
    fn msg_tags_round_trip() {
        for msg in [
            Msg::Write,
            Msg::Read,
            Msg::Error,
            Msg::Next,
            Msg::StartActivity,
            Msg::StopActivity,
            Msg::Result,
            Msg::Last,
        ] {
            assert_eq!(Msg::try_from(msg as u64).unwrap(), msg);
        }
    }

    #[test]
    fn unknown_tag_is_rejected() {
        assert!(matches!(
            Msg::try_from(0x99),
            Err(ClientError::InvalidMsgCode(0x99))
        ));
    }
}
