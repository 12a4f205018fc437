use bytes::Bytes;

/// Transport-neutral channel frame.
///
/// Transports convert their native representation (websocket messages, long-polling packets)
/// into/from `Frame`; codecs only ever see this type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    Text(Bytes),
    Binary(Bytes),
    Ping(Bytes),
    Pong(Bytes),
    Close(Option<CloseFrame>),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloseFrame {
    pub code: u16,
    pub reason: Bytes,
}

impl CloseFrame {
    /// Close reason as text, empty when the peer sent none or it is not UTF-8.
    pub fn reason_text(&self) -> &str {
        std::str::from_utf8(self.reason.as_ref()).unwrap_or("")
    }
}

impl Frame {
    #[inline]
    pub fn text(s: impl Into<String>) -> Self {
        Self::Text(Bytes::from(s.into()))
    }

    #[inline]
    pub fn text_static(s: &'static str) -> Self {
        Self::Text(Bytes::from_static(s.as_bytes()))
    }

    #[inline]
    pub fn close(code: u16, reason: impl Into<String>) -> Self {
        Self::Close(Some(CloseFrame {
            code,
            reason: Bytes::from(reason.into()),
        }))
    }

    /// Borrow the frame as UTF-8 text. Binary frames qualify when they hold valid UTF-8.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Frame::Text(bytes) | Frame::Binary(bytes) => std::str::from_utf8(bytes.as_ref()).ok(),
            _ => None,
        }
    }

    pub fn is_close(&self) -> bool {
        matches!(self, Frame::Close(_))
    }
}

/// Borrow the underlying bytes from frames without allocation.
#[inline]
pub fn frame_bytes(frame: &Frame) -> Option<&[u8]> {
    match frame {
        Frame::Text(bytes) | Frame::Binary(bytes) | Frame::Ping(bytes) | Frame::Pong(bytes) => {
            Some(bytes.as_ref())
        }
        Frame::Close(_) => None,
    }
}
